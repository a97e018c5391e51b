//! Per-message delivery: resolve the recipient's MX set and walk it.

use std::sync::Arc;

use async_trait::async_trait;
use ferropost_common::address::Mailbox;
use ferropost_common::audit;

use crate::client::HostClient;
use crate::dns::MxResolve;
use crate::error::DeliveryError;

/// The seam the queue manager schedules against. Implemented by
/// [`DeliveryDriver`] in production and by stubs in tests.
#[async_trait]
pub trait Deliver: Send + Sync {
    async fn deliver(
        &self,
        from: &Mailbox,
        to: &Mailbox,
        data: &[u8],
    ) -> Result<(), DeliveryError>;
}

/// Resolves MX records for the recipient domain and attempts each host in
/// preference order until one accepts the message.
pub struct DeliveryDriver {
    resolver: Arc<dyn MxResolve>,
    client: Arc<dyn HostClient>,
}

impl DeliveryDriver {
    pub fn new(resolver: Arc<dyn MxResolve>, client: Arc<dyn HostClient>) -> Self {
        Self { resolver, client }
    }
}

#[async_trait]
impl Deliver for DeliveryDriver {
    async fn deliver(
        &self,
        from: &Mailbox,
        to: &Mailbox,
        data: &[u8],
    ) -> Result<(), DeliveryError> {
        let domain = to.domain()?.to_string();

        let records = match self.resolver.resolve_mx(&domain).await {
            Ok(records) => records,
            Err(source) => {
                audit!("delivery mx lookup failed for {domain}: {source}");
                return Err(DeliveryError::MxLookup { domain, source });
            }
        };
        if records.is_empty() {
            audit!("delivery no MX records for {domain}");
            return Err(DeliveryError::NoMxRecords { domain });
        }

        let mut last_error = None;
        for record in &records {
            match self.client.deliver(&record.host, from, to, data).await {
                Ok(()) => {
                    audit!("delivery succeeded to {to} via {}", record.host);
                    return Ok(());
                }
                Err(err) => {
                    tracing::debug!(host = %record.host, to = %to, error = %err, "host attempt failed");
                    audit!("delivery attempt to {to} via {} failed: {err}", record.host);
                    last_error = Some(err);
                }
            }
        }

        // records is non-empty, so at least one attempt ran.
        Err(match last_error {
            Some(err) => DeliveryError::Exhausted(err),
            None => DeliveryError::NoMxRecords { domain },
        })
    }
}
