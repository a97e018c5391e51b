//! Process wiring: read the environment, assemble the relay, run until a
//! shutdown signal.

use std::sync::Arc;

use anyhow::Context;
use ferropost_common::{audit, config, logging, Signal};
use ferropost_delivery::{DeliveryDriver, DnsResolver, Manager, SmtpConnector};
use ferropost_dkim::Signer;
use ferropost_health::HealthServer;
use ferropost_smtp::{tls, Listener, SessionConfig, TlsError};
use ferropost_spool::{FileSpool, Spool};
use tokio::sync::broadcast;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init();
    audit::refresh_from_env();
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "ferropost starting");
    audit!("version {} boot", env!("CARGO_PKG_VERSION"));

    let hostname = config::hostname();

    let signer = Signer::from_env().context("failed to initialise DKIM")?;
    if let Some(signer) = &signer {
        tracing::info!(
            selector = signer.selector(),
            domain = signer.domain(),
            "DKIM signing enabled"
        );
        audit!(
            "DKIM signing enabled selector {} domain {}",
            signer.selector(),
            signer.domain()
        );
    }
    let signer = signer.map(Arc::new);

    let spool_path = config::spool_path();
    tracing::info!(path = %spool_path.display(), "spool storage path");
    let spool: Arc<dyn Spool> = Arc::new(FileSpool::new(spool_path));

    let resolver = Arc::new(DnsResolver::new().context("failed to initialise DNS resolver")?);
    let connector = Arc::new(SmtpConnector::new(hostname.clone()));
    let driver = Arc::new(DeliveryDriver::new(resolver, connector));

    let workers = config::queue_workers();
    tracing::info!(workers, "queue workers configured");
    audit!("queue workers {workers}");
    let queue = Manager::builder(driver).workers(workers).build();
    queue.start();

    let (shutdown_tx, _) = broadcast::channel::<Signal>(8);

    if config::health_disabled() {
        tracing::info!("health endpoint disabled via SMTP_HEALTH_DISABLE");
    } else {
        match HealthServer::bind(&config::health_addr()).await {
            Ok(server) => {
                tracing::info!(addr = ?server.local_addr().ok(), "health endpoint listening");
                let shutdown = shutdown_tx.subscribe();
                tokio::spawn(async move {
                    if let Err(err) = server.serve(shutdown).await {
                        tracing::error!(error = %err, "health endpoint failed");
                    }
                });
            }
            Err(err) => tracing::warn!(error = %err, "health endpoint disabled"),
        }
    }

    let tls_config = match tls::load_server_config() {
        Ok(config) => Some(config),
        Err(TlsError::Disabled) => {
            tracing::info!("TLS disabled: certificate not configured");
            None
        }
        Err(err) => {
            return Err(anyhow::Error::new(err).context("failed to load TLS configuration"));
        }
    };

    let session_config = SessionConfig::builder(spool, queue.clone())
        .hostname(hostname)
        .signer(signer)
        .build();

    let addr = config::smtp_addr();
    let listener = Listener::bind(&addr, tls_config.clone(), session_config)
        .await
        .with_context(|| format!("failed to listen on {addr}"))?;
    if tls_config.is_some() {
        audit!("SMTP TLS enabled on {addr}");
    }
    audit!("SMTP server listening on {addr}");
    let serving = tokio::spawn(listener.serve(shutdown_tx.subscribe()));

    tokio::signal::ctrl_c()
        .await
        .context("failed to wait for shutdown signal")?;
    tracing::info!("shutdown signal received");
    let _ = shutdown_tx.send(Signal::Shutdown);
    queue.stop();
    let _ = serving.await;

    Ok(())
}
