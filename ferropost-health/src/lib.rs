//! Read-only HTTP plane: liveness probe and metrics scrape endpoint.
//!
//! Deliberately detached from the SMTP data path; a failure to bind here
//! disables the plane but never the relay.

use std::time::Duration;

use axum::routing::get;
use axum::Router;
use ferropost_common::Signal;
use ferropost_metrics::Metrics;
use thiserror::Error;
use tokio::net::TcpListener;
use tower_http::timeout::TimeoutLayer;

#[derive(Debug, Error)]
pub enum HealthError {
    #[error("failed to bind health endpoint to {address}: {source}")]
    Bind {
        address: String,
        source: std::io::Error,
    },

    #[error("health server error: {0}")]
    Server(String),
}

#[derive(Debug)]
pub struct HealthServer {
    listener: TcpListener,
    router: Router,
}

impl HealthServer {
    /// Bind the health listener.
    ///
    /// # Errors
    /// Returns [`HealthError::Bind`] when the address is unavailable; the
    /// caller logs and carries on without the plane.
    pub async fn bind(address: &str) -> Result<Self, HealthError> {
        let listener = TcpListener::bind(address)
            .await
            .map_err(|source| HealthError::Bind {
                address: address.to_string(),
                source,
            })?;

        let router = Router::new()
            .route("/healthz", get(healthz))
            .route("/metrics", get(metrics))
            .layer(TimeoutLayer::new(Duration::from_secs(1)));

        Ok(Self { listener, router })
    }

    pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.listener.local_addr()
    }

    /// Serve until the shutdown signal fires.
    ///
    /// # Errors
    /// Returns [`HealthError::Server`] on a runtime failure.
    pub async fn serve(
        self,
        mut shutdown: tokio::sync::broadcast::Receiver<Signal>,
    ) -> Result<(), HealthError> {
        axum::serve(self.listener, self.router)
            .with_graceful_shutdown(async move {
                let _ = shutdown.recv().await;
                tracing::debug!("health endpoint shutting down");
            })
            .await
            .map_err(|err| HealthError::Server(err.to_string()))
    }
}

async fn healthz() -> &'static str {
    "OK"
}

async fn metrics() -> String {
    Metrics::global().render()
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    async fn http_get(addr: std::net::SocketAddr, path: &str) -> String {
        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(
                format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
                    .as_bytes(),
            )
            .await
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
    }

    #[tokio::test]
    async fn healthz_and_metrics_respond() {
        let server = HealthServer::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap();
        let (shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel(1);
        let handle = tokio::spawn(server.serve(shutdown_rx));

        let health = http_get(addr, "/healthz").await;
        assert!(health.starts_with("HTTP/1.1 200"));
        assert!(health.ends_with("OK"));

        let metrics = http_get(addr, "/metrics").await;
        assert!(metrics.starts_with("HTTP/1.1 200"));
        assert!(metrics.contains("smtp_queue_depth"));

        shutdown_tx.send(Signal::Shutdown).unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn bind_failure_is_reported() {
        let err = HealthServer::bind("256.0.0.1:0").await.unwrap_err();
        assert!(matches!(err, HealthError::Bind { .. }));
    }
}
