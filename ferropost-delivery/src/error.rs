use ferropost_common::address::AddressError;
use thiserror::Error;

use crate::client::ClientError;
use crate::dns::DnsError;

/// Failure of one complete delivery attempt (all MX hosts tried). These
/// never reach the SMTP session: the queue recovers them via retry.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("invalid recipient address: {0}")]
    Address(#[from] AddressError),

    #[error("MX lookup failed for {domain}: {source}")]
    MxLookup { domain: String, source: DnsError },

    #[error("MX lookup failed for {domain}: no MX records")]
    NoMxRecords { domain: String },

    /// Every resolved host failed; wraps the last per-host error.
    #[error("delivery failed: {0}")]
    Exhausted(#[source] ClientError),
}
