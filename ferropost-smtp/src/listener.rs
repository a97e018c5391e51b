//! Accept loop for the SMTP front-end.
//!
//! Binds once, then spawns one session task per accepted connection.
//! When TLS material is configured the handshake happens before the
//! first SMTP byte (implicit TLS); there is no STARTTLS on the inbound
//! side. Transient accept failures are logged and the loop keeps going.

use std::net::SocketAddr;
use std::sync::Arc;

use ferropost_common::Signal;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;

use crate::session::{Session, SessionConfig};

pub struct Listener {
    listener: TcpListener,
    tls: Option<TlsAcceptor>,
    config: Arc<SessionConfig>,
}

impl Listener {
    /// Bind the SMTP listener. A `Some` TLS config makes every accepted
    /// connection handshake before the greeting.
    ///
    /// # Errors
    /// Propagates the bind failure; the process treats this as fatal.
    pub async fn bind(
        addr: &str,
        tls: Option<Arc<rustls::ServerConfig>>,
        config: Arc<SessionConfig>,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            tls: tls.map(TlsAcceptor::from),
            config,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until the shutdown signal fires.
    pub async fn serve(self, mut shutdown: tokio::sync::broadcast::Receiver<Signal>) {
        let mode = if self.tls.is_some() { "tls" } else { "plaintext" };
        tracing::info!(addr = ?self.listener.local_addr().ok(), mode, "SMTP listener serving");

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!("SMTP listener received shutdown signal");
                    return;
                }
                accepted = self.listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(conn) => conn,
                        Err(err) => {
                            tracing::error!(error = %err, "accept error");
                            continue;
                        }
                    };

                    let config = Arc::clone(&self.config);
                    let tls = self.tls.clone();
                    tokio::spawn(async move {
                        let result = match tls {
                            Some(acceptor) => match acceptor.accept(stream).await {
                                Ok(tls_stream) => {
                                    Session::new(tls_stream, peer, config).run().await
                                }
                                Err(err) => {
                                    tracing::debug!(peer = %peer, error = %err, "TLS handshake failed");
                                    return;
                                }
                            },
                            None => Session::new(stream, peer, config).run().await,
                        };
                        if let Err(err) = result {
                            tracing::debug!(peer = %peer, error = %err, "session error");
                        }
                    });
                }
            }
        }
    }
}
