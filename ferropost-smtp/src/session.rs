//! Per-connection SMTP session engine.
//!
//! One session task per accepted connection, strictly sequential: read a
//! command, act, reply. Recoverable protocol problems (unparseable
//! addresses, policy rejections, oversize bodies) are answered with an
//! SMTP status and leave the connection open; transport failures and
//! deadline expiry tear the session down.
//!
//! A completed DATA phase is the only place state leaves the session:
//! the body is signed (when DKIM is configured), one spool file per
//! recipient is written, and one queue entry per recipient is enqueued,
//! all sharing a single immutable payload.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use ferropost_common::address::Mailbox;
use ferropost_common::{audit, config, id};
use ferropost_delivery::{Manager, Payload, QueuedMessage};
use ferropost_dkim::Signer;
use ferropost_metrics::Metrics;
use ferropost_spool::Spool;
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf,
    WriteHalf,
};

use crate::access::AccessPolicy;
use crate::error::SessionError;

const DEFAULT_MAX_MESSAGE_BYTES: usize = 10 << 20;
const COMMAND_DEADLINE: Duration = Duration::from_secs(15 * 60);

/// Everything a session needs, shared across all connections.
pub struct SessionConfig {
    pub hostname: String,
    pub banner: String,
    pub require_local_domain: bool,
    pub max_message_bytes: usize,
    pub command_timeout: Duration,
    pub access: AccessPolicy,
    pub spool: Arc<dyn Spool>,
    pub signer: Option<Arc<Signer>>,
    pub queue: Manager,
    pub metrics: Arc<Metrics>,
}

impl SessionConfig {
    /// Builder seeded from the environment; tests override the pieces
    /// they care about.
    pub fn builder(spool: Arc<dyn Spool>, queue: Manager) -> SessionConfigBuilder {
        SessionConfigBuilder {
            hostname: config::hostname(),
            banner: config::banner(),
            require_local_domain: config::require_sender_domain(),
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
            command_timeout: COMMAND_DEADLINE,
            access: AccessPolicy::from_env(),
            spool,
            signer: None,
            queue,
            metrics: Metrics::global(),
        }
    }
}

pub struct SessionConfigBuilder {
    hostname: String,
    banner: String,
    require_local_domain: bool,
    max_message_bytes: usize,
    command_timeout: Duration,
    access: AccessPolicy,
    spool: Arc<dyn Spool>,
    signer: Option<Arc<Signer>>,
    queue: Manager,
    metrics: Arc<Metrics>,
}

impl SessionConfigBuilder {
    pub fn hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = hostname.into();
        self
    }

    pub fn banner(mut self, banner: impl Into<String>) -> Self {
        self.banner = banner.into();
        self
    }

    pub fn require_local_domain(mut self, require: bool) -> Self {
        self.require_local_domain = require;
        self
    }

    pub fn max_message_bytes(mut self, max: usize) -> Self {
        self.max_message_bytes = max;
        self
    }

    pub fn command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    pub fn access(mut self, access: AccessPolicy) -> Self {
        self.access = access;
        self
    }

    pub fn signer(mut self, signer: Option<Arc<Signer>>) -> Self {
        self.signer = signer;
        self
    }

    pub fn metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn build(self) -> Arc<SessionConfig> {
        Arc::new(SessionConfig {
            hostname: self.hostname,
            banner: self.banner,
            require_local_domain: self.require_local_domain,
            max_message_bytes: self.max_message_bytes,
            command_timeout: self.command_timeout,
            access: self.access,
            spool: self.spool,
            signer: self.signer,
            queue: self.queue,
            metrics: self.metrics,
        })
    }
}

#[derive(Default)]
struct Envelope {
    from: Option<Mailbox>,
    to: Vec<Mailbox>,
}

impl Envelope {
    fn reset(&mut self) {
        self.from = None;
        self.to.clear();
    }
}

pub struct Session<S: AsyncRead + AsyncWrite + Send + Unpin> {
    reader: BufReader<ReadHalf<S>>,
    writer: WriteHalf<S>,
    peer: SocketAddr,
    id: String,
    config: Arc<SessionConfig>,
}

impl<S: AsyncRead + AsyncWrite + Send + Unpin> Session<S> {
    pub fn new(stream: S, peer: SocketAddr, config: Arc<SessionConfig>) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        Self {
            reader: BufReader::new(read_half),
            writer: write_half,
            peer,
            id: id::short_id(),
            config,
        }
    }

    /// Drive the session to completion. `Ok` covers every orderly ending
    /// (QUIT, access denial); errors are transport failures and timeouts.
    pub async fn run(mut self) -> Result<(), SessionError> {
        audit!("session {} start {}", self.id, self.peer);

        if !self.config.access.allows(self.peer) {
            let _ = self.send(554, "5.7.1 Access denied").await;
            audit!("session {} rejected remote {}", self.id, self.peer);
            return Ok(());
        }

        self.config.metrics.inc_sessions();
        let result = self.serve().await;
        self.config.metrics.dec_sessions();
        audit!("session {} closed {}", self.id, self.peer);
        if let Err(err) = &result {
            tracing::debug!(session = %self.id, peer = %self.peer, error = %err, "session ended");
        }
        result
    }

    async fn serve(&mut self) -> Result<(), SessionError> {
        let greeting = format!("{} {}", self.config.hostname, self.config.banner);
        self.send(220, &greeting).await?;

        let mut envelope = Envelope::default();
        loop {
            let line = self.read_command().await?;
            audit!("session {} recv {}", self.id, summarize(&line));
            let cmd = line.to_ascii_uppercase();

            if cmd.starts_with("HELO") || cmd.starts_with("EHLO") {
                let hostname = self.config.hostname.clone();
                self.send(250, &hostname).await?;
            } else if cmd.starts_with("MAIL FROM:") {
                self.handle_mail(&mut envelope, &line).await?;
            } else if cmd.starts_with("RCPT TO:") {
                self.handle_rcpt(&mut envelope, &line).await?;
            } else if cmd.starts_with("RSET") {
                envelope.reset();
                self.send(250, "State cleared").await?;
            } else if cmd.starts_with("NOOP") {
                self.send(250, "OK").await?;
            } else if cmd.starts_with("DATA") {
                self.handle_data(&mut envelope).await?;
            } else if cmd.starts_with("QUIT") {
                self.send(221, "Bye").await?;
                audit!("session {} quit requested", self.id);
                return Ok(());
            } else {
                self.send(502, "Command not implemented").await?;
                audit!("session {} unhandled command: {}", self.id, summarize(&line));
            }
        }
    }

    async fn handle_mail(
        &mut self,
        envelope: &mut Envelope,
        line: &str,
    ) -> Result<(), SessionError> {
        let from = match Mailbox::parse_command(line) {
            Ok(from) => from,
            Err(err) => {
                self.send(501, "Invalid sender address").await?;
                audit!("session {} invalid MAIL FROM: {err}", self.id);
                return Ok(());
            }
        };

        if self.config.require_local_domain {
            let domain = match from.domain() {
                Ok(domain) => domain,
                Err(err) => {
                    self.send(501, "Invalid sender domain").await?;
                    audit!("session {} invalid sender domain: {err}", self.id);
                    return Ok(());
                }
            };
            let expected = self.config.hostname.to_lowercase();
            if !expected.is_empty() && !domain.eq_ignore_ascii_case(&expected) {
                self.send(553, "Sender domain not permitted").await?;
                audit!(
                    "session {} sender domain {domain} rejected (expected {expected})",
                    self.id
                );
                return Ok(());
            }
        }

        audit!("session {} mail from {from}", self.id);
        envelope.from = Some(from);
        envelope.to.clear();
        self.send(250, "Sender OK").await
    }

    async fn handle_rcpt(
        &mut self,
        envelope: &mut Envelope,
        line: &str,
    ) -> Result<(), SessionError> {
        if envelope.from.is_none() {
            self.send(503, "Need MAIL command first").await?;
            audit!("session {} RCPT before MAIL rejected", self.id);
            return Ok(());
        }

        match Mailbox::parse_command(line) {
            Ok(to) => {
                audit!("session {} rcpt add {to} (total={})", self.id, envelope.to.len() + 1);
                envelope.to.push(to);
                self.send(250, "Recipient OK").await
            }
            Err(err) => {
                self.send(501, "Invalid recipient address").await?;
                audit!("session {} invalid RCPT TO: {err}", self.id);
                Ok(())
            }
        }
    }

    async fn handle_data(&mut self, envelope: &mut Envelope) -> Result<(), SessionError> {
        let from = match envelope.from.clone() {
            Some(from) if !envelope.to.is_empty() => from,
            _ => {
                self.send(503, "Need sender and recipient before DATA").await?;
                audit!("session {} DATA before MAIL/RCPT rejected", self.id);
                return Ok(());
            }
        };

        let message_id = id::short_id();
        self.send(354, "End with <CR><LF>.<CR><LF>").await?;

        let body = tokio::time::timeout(
            self.config.command_timeout,
            read_dot_body(&mut self.reader, self.config.max_message_bytes),
        )
        .await
        .map_err(|_| SessionError::Timeout(self.config.command_timeout))?;
        let body = match body {
            Ok(body) => body,
            Err(err) => {
                let _ = self.send(554, "Read error").await;
                audit!("session {} body read error: {err}", self.id);
                return Err(err.into());
            }
        };
        let Some(mut message) = body else {
            self.send(552, "Message exceeds size limit").await?;
            audit!(
                "session {} message exceeded max size ({} bytes)",
                self.id,
                self.config.max_message_bytes
            );
            envelope.reset();
            return Ok(());
        };

        if let Some(signer) = &self.config.signer {
            match signer.sign(&message, from.as_str()) {
                Ok(signed) => {
                    message = signed;
                    audit!("session {} dkim signature applied", self.id);
                }
                Err(err) => {
                    self.send(451, "Requested action aborted: DKIM signing failure")
                        .await?;
                    audit!("session {} dkim signing error: {err}", self.id);
                    envelope.reset();
                    return Ok(());
                }
            }
        }

        let mut persisted: Vec<PathBuf> = Vec::new();
        let mut storage_failed = false;
        for rcpt in &envelope.to {
            match self
                .config
                .spool
                .save(&message_id, from.as_str(), rcpt.as_str(), &message)
                .await
            {
                Ok(path) => persisted.push(path),
                Err(err) => {
                    tracing::error!(rcpt = %rcpt, error = %err, "failed to persist message");
                    audit!("session {} storage error for {rcpt}: {err}", self.id);
                    storage_failed = true;
                    break;
                }
            }
        }
        if storage_failed {
            for path in &persisted {
                if let Err(err) = self.config.spool.remove(path).await {
                    tracing::error!(path = %path.display(), error = %err, "failed to roll back persisted message");
                    audit!("session {} rollback error {}: {err}", self.id, path.display());
                }
            }
            self.send(451, "Requested action aborted: storage failure")
                .await?;
            audit!(
                "session {} message {message_id} aborted due to storage failure",
                self.id
            );
            envelope.reset();
            return Ok(());
        }

        let size = message.len();
        let payload = Payload::new(message);
        for rcpt in &envelope.to {
            self.config.queue.enqueue(QueuedMessage::new(
                message_id.clone(),
                from.clone(),
                rcpt.clone(),
                payload.clone(),
            ));
        }

        self.send(250, &format!("Message queued as {message_id}"))
            .await?;
        audit!(
            "session {} message {message_id} queued (size={size} bytes, recipients={})",
            self.id,
            envelope.to.len()
        );
        envelope.reset();
        Ok(())
    }

    async fn read_command(&mut self) -> Result<String, SessionError> {
        let mut buf = Vec::new();
        let read = tokio::time::timeout(
            self.config.command_timeout,
            self.reader.read_until(b'\n', &mut buf),
        )
        .await
        .map_err(|_| SessionError::Timeout(self.config.command_timeout))??;

        if read == 0 {
            return Err(SessionError::Connection(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "client disconnected",
            )));
        }
        let line = String::from_utf8_lossy(&buf);
        Ok(line.trim_end_matches(['\r', '\n']).to_string())
    }

    async fn send(&mut self, code: u16, msg: &str) -> Result<(), SessionError> {
        let reply = format!("{code} {msg}\r\n");
        if let Err(err) = self.writer.write_all(reply.as_bytes()).await {
            audit!("session {} send error: {err}", self.id);
            return Err(err.into());
        }
        audit!("session {} sent {code} {msg}", self.id);
        Ok(())
    }
}

/// Read a dot-stuffed DATA body. Returns `None` when the decoded size
/// exceeds `max`; the remaining body is still drained to the terminator
/// so the command stream stays aligned.
async fn read_dot_body<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    max: usize,
) -> std::io::Result<Option<Vec<u8>>> {
    let mut body = Vec::new();
    let mut line = Vec::new();
    let mut total = 0usize;
    let mut oversize = false;

    loop {
        line.clear();
        let read = reader.read_until(b'\n', &mut line).await?;
        if read == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "client disconnected during DATA",
            ));
        }
        let Some(content) = line.strip_suffix(b"\n") else {
            // Data without a trailing newline only happens at EOF.
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "unterminated DATA line",
            ));
        };
        let content = content.strip_suffix(b"\r").unwrap_or(content);

        if content == b"." {
            break;
        }
        // De-stuff: one leading dot is transparency, not content.
        let content = content.strip_prefix(b".").unwrap_or(content);

        if !oversize {
            total += content.len() + 1;
            if total > max {
                oversize = true;
                body = Vec::new();
            } else {
                body.extend_from_slice(content);
                body.push(b'\n');
            }
        }
    }

    Ok(if oversize { None } else { Some(body) })
}

fn summarize(line: &str) -> String {
    let line = line.trim();
    if line.chars().count() > 120 {
        let head: String = line.chars().take(117).collect();
        format!("{head}...")
    } else {
        line.to_string()
    }
}
