//! Scripted SMTP server for exercising the client side of a delivery.
//!
//! Each accepted connection walks a canned response table while recording
//! every command received. Optionally the server advertises STARTTLS and
//! performs a real TLS handshake with a throwaway self-signed certificate.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::TlsAcceptor;

trait AnyStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> AnyStream for T {}

/// Canned replies for the SMTP verbs the client may send.
#[derive(Clone)]
struct Responses {
    greeting: String,
    ehlo: String,
    mail_from: String,
    rcpt_to: String,
    data: String,
    data_end: String,
    quit: String,
    starttls: bool,
}

impl Default for Responses {
    fn default() -> Self {
        Self {
            greeting: "220 mock ready".into(),
            ehlo: "250 mock.local".into(),
            mail_from: "250 OK".into(),
            rcpt_to: "250 OK".into(),
            data: "354 End data with <CR><LF>.<CR><LF>".into(),
            data_end: "250 accepted".into(),
            quit: "221 bye".into(),
            starttls: false,
        }
    }
}

pub struct MockSmtpServer {
    addr: SocketAddr,
    commands: Arc<Mutex<Vec<String>>>,
    bodies: Arc<Mutex<Vec<Vec<u8>>>>,
}

pub struct MockSmtpServerBuilder {
    responses: Responses,
}

impl MockSmtpServer {
    pub fn builder() -> MockSmtpServerBuilder {
        MockSmtpServerBuilder {
            responses: Responses::default(),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// All command lines received so far, in order. DATA body lines are
    /// not included.
    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }

    /// DATA bodies received, dot-stuffing removed, terminator excluded.
    pub fn bodies(&self) -> Vec<Vec<u8>> {
        self.bodies.lock().unwrap().clone()
    }
}

impl MockSmtpServerBuilder {
    pub fn greeting(mut self, line: &str) -> Self {
        self.responses.greeting = line.into();
        self
    }

    pub fn ehlo(mut self, line: &str) -> Self {
        self.responses.ehlo = line.into();
        self
    }

    pub fn mail_from(mut self, line: &str) -> Self {
        self.responses.mail_from = line.into();
        self
    }

    pub fn rcpt_to(mut self, line: &str) -> Self {
        self.responses.rcpt_to = line.into();
        self
    }

    pub fn data_end(mut self, line: &str) -> Self {
        self.responses.data_end = line.into();
        self
    }

    /// Advertise STARTTLS and upgrade with a throwaway certificate when
    /// the client asks for it.
    pub fn with_starttls(mut self) -> Self {
        self.responses.starttls = true;
        self
    }

    pub async fn start(self) -> MockSmtpServer {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let commands = Arc::new(Mutex::new(Vec::new()));
        let bodies = Arc::new(Mutex::new(Vec::new()));

        let responses = Arc::new(self.responses);
        {
            let commands = Arc::clone(&commands);
            let bodies = Arc::clone(&bodies);
            tokio::spawn(async move {
                while let Ok((stream, _peer)) = listener.accept().await {
                    let responses = Arc::clone(&responses);
                    let commands = Arc::clone(&commands);
                    let bodies = Arc::clone(&bodies);
                    tokio::spawn(async move {
                        let _ = serve_connection(stream, responses, commands, bodies).await;
                    });
                }
            });
        }

        MockSmtpServer {
            addr,
            commands,
            bodies,
        }
    }
}

fn self_signed_acceptor() -> TlsAcceptor {
    let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let cert = CertificateDer::from(certified.cert.der().to_vec());
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(certified.key_pair.serialize_der()));
    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![cert], key)
        .unwrap();
    TlsAcceptor::from(Arc::new(config))
}

async fn serve_connection(
    tcp: TcpStream,
    responses: Arc<Responses>,
    commands: Arc<Mutex<Vec<String>>>,
    bodies: Arc<Mutex<Vec<Vec<u8>>>>,
) -> std::io::Result<()> {
    let mut stream: BufReader<Box<dyn AnyStream>> = BufReader::new(Box::new(tcp));
    let mut offer_tls = responses.starttls;

    stream
        .get_mut()
        .write_all(format!("{}\r\n", responses.greeting).as_bytes())
        .await?;

    let mut line = String::new();
    loop {
        line.clear();
        if stream.read_line(&mut line).await? == 0 {
            return Ok(());
        }
        let command = line.trim_end().to_string();
        commands.lock().unwrap().push(command.clone());
        let verb = command
            .split_whitespace()
            .next()
            .unwrap_or("")
            .to_uppercase();

        let reply = match verb.as_str() {
            "EHLO" if offer_tls => "250-mock.local\r\n250 STARTTLS".into(),
            "EHLO" => responses.ehlo.clone(),
            "HELO" => "250 mock.local".into(),
            "STARTTLS" if offer_tls => {
                stream.get_mut().write_all(b"220 go ahead\r\n").await?;
                // No read-ahead can be buffered here: the client sends its
                // ClientHello only after reading the 220.
                let inner = stream.into_inner();
                let tls = self_signed_acceptor().accept(inner).await?;
                stream = BufReader::new(Box::new(tls));
                offer_tls = false;
                continue;
            }
            "MAIL" => responses.mail_from.clone(),
            "RCPT" => responses.rcpt_to.clone(),
            "DATA" => {
                stream
                    .get_mut()
                    .write_all(format!("{}\r\n", responses.data).as_bytes())
                    .await?;
                let mut body = Vec::new();
                loop {
                    line.clear();
                    if stream.read_line(&mut line).await? == 0 {
                        return Ok(());
                    }
                    let content = line.trim_end_matches(['\r', '\n']);
                    if content == "." {
                        break;
                    }
                    let content = content.strip_prefix('.').unwrap_or(content);
                    body.extend_from_slice(content.as_bytes());
                    body.extend_from_slice(b"\r\n");
                }
                bodies.lock().unwrap().push(body);
                responses.data_end.clone()
            }
            "QUIT" => {
                stream
                    .get_mut()
                    .write_all(format!("{}\r\n", responses.quit).as_bytes())
                    .await?;
                return Ok(());
            }
            _ => "500 unknown".into(),
        };

        stream
            .get_mut()
            .write_all(format!("{reply}\r\n").as_bytes())
            .await?;
    }
}
