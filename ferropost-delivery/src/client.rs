//! SMTP client: delivers raw message bytes to one remote host.
//!
//! The walk is deliberately plain: greeting, EHLO (HELO fallback),
//! opportunistic STARTTLS when advertised, MAIL FROM, RCPT TO, DATA with a
//! dot-stuffed body, QUIT. Every exchange lives under one overall
//! deadline and the connection never outlives the call.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ferropost_common::address::Mailbox;
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

use crate::response::Reply;

const SMTP_PORT: u16 = 25;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const IO_DEADLINE: Duration = Duration::from_secs(120);

/// Initial reply buffer; grows on demand up to [`MAX_REPLY_BYTES`].
const REPLY_BUFFER: usize = 4096;
const MAX_REPLY_BYTES: usize = 1024 * 1024;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("dial {addr}: {source}")]
    Connect {
        addr: String,
        source: std::io::Error,
    },

    #[error("dial {addr}: connect timed out")]
    ConnectTimeout { addr: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("connection closed unexpectedly")]
    ConnectionClosed,

    #[error("malformed reply: {0}")]
    Parse(String),

    #[error("{command}: {code} {message}")]
    Rejected {
        command: &'static str,
        code: u16,
        message: String,
    },

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("delivery deadline exceeded")]
    Deadline,
}

impl ClientError {
    fn rejected(command: &'static str, reply: &Reply) -> Self {
        Self::Rejected {
            command,
            code: reply.code,
            message: reply.message(),
        }
    }
}

/// Per-host delivery seam. The queue's delivery driver holds a
/// `dyn HostClient`; tests substitute one that records the walk.
#[async_trait]
pub trait HostClient: Send + Sync {
    async fn deliver(
        &self,
        host: &str,
        from: &Mailbox,
        to: &Mailbox,
        data: &[u8],
    ) -> Result<(), ClientError>;
}

/// Production SMTP client configuration. The port is a process-level
/// constant in production and overridden in tests.
pub struct SmtpConnector {
    port: u16,
    helo_name: String,
    accept_invalid_certs: bool,
}

impl SmtpConnector {
    pub fn new(helo_name: impl Into<String>) -> Self {
        Self {
            port: SMTP_PORT,
            helo_name: helo_name.into(),
            accept_invalid_certs: false,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Skip remote certificate verification. Test-only escape hatch for
    /// self-signed STARTTLS peers.
    pub fn accept_invalid_certs(mut self, accept: bool) -> Self {
        self.accept_invalid_certs = accept;
        self
    }

    async fn walk(
        &self,
        host: &str,
        from: &Mailbox,
        to: &Mailbox,
        data: &[u8],
    ) -> Result<(), ClientError> {
        let addr = format!("{host}:{}", self.port);
        let stream = match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(&addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => return Err(ClientError::Connect { addr, source }),
            Err(_) => return Err(ClientError::ConnectTimeout { addr }),
        };
        let mut exchange = Exchange::new(stream);

        let greeting = exchange.read_reply().await?;
        if greeting.code != 220 {
            return Err(ClientError::rejected("greeting", &greeting));
        }

        let ehlo = exchange.command(&format!("EHLO {}", self.helo_name)).await?;
        let mut esmtp = true;
        if !ehlo.is_positive() {
            let helo = exchange.command(&format!("HELO {}", self.helo_name)).await?;
            if !helo.is_positive() {
                return Err(ClientError::rejected("HELO", &helo));
            }
            esmtp = false;
        }

        if esmtp && ehlo.advertises("STARTTLS") {
            let reply = exchange.command("STARTTLS").await?;
            if reply.code != 220 {
                return Err(ClientError::rejected("STARTTLS", &reply));
            }
            exchange = exchange.upgrade(host, self.accept_invalid_certs).await?;
            let again = exchange.command(&format!("EHLO {}", self.helo_name)).await?;
            if !again.is_positive() {
                return Err(ClientError::rejected("EHLO after STARTTLS", &again));
            }
            tracing::debug!(host, "STARTTLS negotiated");
        }

        let reply = exchange
            .command(&format!("MAIL FROM:<{from}>"))
            .await?;
        if !reply.is_positive() {
            return Err(ClientError::rejected("MAIL FROM", &reply));
        }

        let reply = exchange.command(&format!("RCPT TO:<{to}>")).await?;
        if !reply.is_positive() {
            return Err(ClientError::rejected("RCPT TO", &reply));
        }

        let reply = exchange.command("DATA").await?;
        if !reply.is_intermediate() {
            return Err(ClientError::rejected("DATA", &reply));
        }

        exchange.send_raw(&encode_dot_stuffed(data)).await?;
        let reply = exchange.read_reply().await?;
        if !reply.is_positive() {
            return Err(ClientError::rejected("message body", &reply));
        }

        // The message is accepted at this point; a failed QUIT is not a
        // delivery failure.
        let _ = exchange.command("QUIT").await;
        Ok(())
    }
}

#[async_trait]
impl HostClient for SmtpConnector {
    async fn deliver(
        &self,
        host: &str,
        from: &Mailbox,
        to: &Mailbox,
        data: &[u8],
    ) -> Result<(), ClientError> {
        match tokio::time::timeout(IO_DEADLINE, self.walk(host, from, to, data)).await {
            Ok(result) => result,
            Err(_) => Err(ClientError::Deadline),
        }
    }
}

enum Stream {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

/// One client connection plus its reply buffer.
struct Exchange {
    stream: Stream,
    buffer: Vec<u8>,
    filled: usize,
}

impl Exchange {
    fn new(stream: TcpStream) -> Self {
        Self {
            stream: Stream::Plain(stream),
            buffer: vec![0; REPLY_BUFFER],
            filled: 0,
        }
    }

    async fn send_raw(&mut self, bytes: &[u8]) -> Result<(), ClientError> {
        match &mut self.stream {
            Stream::Plain(stream) => stream.write_all(bytes).await?,
            Stream::Tls(stream) => stream.write_all(bytes).await?,
        }
        Ok(())
    }

    async fn command(&mut self, line: &str) -> Result<Reply, ClientError> {
        self.send_raw(format!("{line}\r\n").as_bytes()).await?;
        self.read_reply().await
    }

    async fn read_reply(&mut self) -> Result<Reply, ClientError> {
        loop {
            if let Some((reply, consumed)) =
                Reply::parse(&self.buffer[..self.filled]).map_err(ClientError::Parse)?
            {
                self.buffer.copy_within(consumed..self.filled, 0);
                self.filled -= consumed;
                return Ok(reply);
            }

            if self.filled == self.buffer.len() {
                if self.buffer.len() >= MAX_REPLY_BYTES {
                    return Err(ClientError::Parse("reply too large".into()));
                }
                self.buffer.resize(self.buffer.len() * 2, 0);
            }

            let read = match &mut self.stream {
                Stream::Plain(stream) => stream.read(&mut self.buffer[self.filled..]).await?,
                Stream::Tls(stream) => stream.read(&mut self.buffer[self.filled..]).await?,
            };
            if read == 0 {
                return Err(ClientError::ConnectionClosed);
            }
            self.filled += read;
        }
    }

    /// Upgrade the plain connection to TLS with `host` as the SNI name.
    async fn upgrade(self, host: &str, accept_invalid_certs: bool) -> Result<Self, ClientError> {
        let Stream::Plain(stream) = self.stream else {
            return Err(ClientError::Tls("connection is already TLS".into()));
        };

        let mut roots = RootCertStore::empty();
        let native = rustls_native_certs::load_native_certs();
        for cert in native.certs {
            roots
                .add(cert)
                .map_err(|err| ClientError::Tls(format!("failed to add root: {err}")))?;
        }
        if !native.errors.is_empty() {
            tracing::warn!(errors = ?native.errors, "some native roots could not be loaded");
        }

        let mut config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        if accept_invalid_certs {
            config
                .dangerous()
                .set_certificate_verifier(Arc::new(NoVerifier));
        }

        let server_name = ServerName::try_from(host.to_string())
            .map_err(|err| ClientError::Tls(format!("invalid server name: {err}")))?;
        let connector = TlsConnector::from(Arc::new(config));
        let tls_stream = connector
            .connect(server_name, stream)
            .await
            .map_err(|err| ClientError::Tls(err.to_string()))?;

        Ok(Self {
            stream: Stream::Tls(Box::new(tls_stream)),
            buffer: self.buffer,
            filled: self.filled,
        })
    }
}

/// Encode a message body for the DATA phase: CRLF line endings, leading
/// dots doubled, terminated by `<CRLF>.<CRLF>`.
pub fn encode_dot_stuffed(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + 8);
    let mut segments = data.split(|&b| b == b'\n').peekable();
    while let Some(segment) = segments.next() {
        // A trailing newline in the input yields one empty final segment,
        // not an extra blank line.
        if segments.peek().is_none() && segment.is_empty() {
            break;
        }
        let line = segment.strip_suffix(b"\r").unwrap_or(segment);
        if line.first() == Some(&b'.') {
            out.push(b'.');
        }
        out.extend_from_slice(line);
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b".\r\n");
    out
}

/// Certificate verifier that trusts everything. Only reachable through
/// [`SmtpConnector::accept_invalid_certs`].
#[derive(Debug)]
struct NoVerifier;

impl rustls::client::danger::ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::ED25519,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::encode_dot_stuffed;

    #[test]
    fn plain_body_gains_terminator() {
        assert_eq!(encode_dot_stuffed(b"hello\r\n"), b"hello\r\n.\r\n");
        assert_eq!(encode_dot_stuffed(b"hello"), b"hello\r\n.\r\n");
        assert_eq!(encode_dot_stuffed(b""), b".\r\n");
    }

    #[test]
    fn bare_newlines_become_crlf() {
        assert_eq!(encode_dot_stuffed(b"a\nb\n"), b"a\r\nb\r\n.\r\n");
    }

    #[test]
    fn leading_dots_are_doubled() {
        assert_eq!(
            encode_dot_stuffed(b".hidden\r\nvisible\r\n"),
            b"..hidden\r\nvisible\r\n.\r\n"
        );
        assert_eq!(encode_dot_stuffed(b".\r\n"), b"..\r\n.\r\n");
    }

    #[test]
    fn interior_blank_lines_survive() {
        assert_eq!(
            encode_dot_stuffed(b"Subject: x\r\n\r\nbody\r\n"),
            b"Subject: x\r\n\r\nbody\r\n.\r\n"
        );
    }
}
