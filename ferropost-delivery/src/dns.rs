//! MX resolution.
//!
//! Resolves a recipient domain to the ordered list of hosts the SMTP
//! client should try. Records come back sorted ascending by preference;
//! hosts sharing a preference value are shuffled on every call so load
//! spreads across equal-priority exchangers.

use async_trait::async_trait;
use hickory_resolver::config::ResolverOpts;
use hickory_resolver::name_server::TokioConnectionProvider;
use hickory_resolver::TokioResolver;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// How long a single DNS query may take.
const LOOKUP_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum DnsError {
    /// Resolver could not be constructed from the system configuration.
    #[error("DNS resolver initialisation failed: {0}")]
    Init(String),

    /// The MX query failed (network, servfail, timeout).
    #[error("DNS lookup failed: {0}")]
    Lookup(#[from] hickory_resolver::ResolveError),
}

/// One mail exchanger, preference-ordered. The trailing root dot is
/// already trimmed from `host`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MxRecord {
    pub host: String,
    pub pref: u16,
}

/// DNS seam consumed by the delivery driver; swapped for a stub in tests.
#[async_trait]
pub trait MxResolve: Send + Sync {
    /// Resolve a domain's MX records. An empty list is a valid result and
    /// is treated as a distinct failure by the caller.
    async fn resolve_mx(&self, domain: &str) -> Result<Vec<MxRecord>, DnsError>;
}

/// Production resolver backed by the system DNS configuration.
pub struct DnsResolver {
    resolver: TokioResolver,
}

impl DnsResolver {
    /// # Errors
    /// Fails when the system resolver configuration cannot be loaded.
    pub fn new() -> Result<Self, DnsError> {
        let mut opts = ResolverOpts::default();
        opts.timeout = LOOKUP_TIMEOUT;

        let resolver = TokioResolver::builder(TokioConnectionProvider::default())
            .map_err(|err| DnsError::Init(err.to_string()))?
            .with_options(opts)
            .build();

        Ok(Self { resolver })
    }
}

#[async_trait]
impl MxResolve for DnsResolver {
    async fn resolve_mx(&self, domain: &str) -> Result<Vec<MxRecord>, DnsError> {
        let lookup = match self.resolver.mx_lookup(domain).await {
            Ok(lookup) => lookup,
            Err(err) if err.is_no_records_found() => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let mut records: Vec<MxRecord> = lookup
            .iter()
            .map(|mx| MxRecord {
                host: mx.exchange().to_utf8(),
                pref: mx.preference(),
            })
            .collect();

        order_by_preference(&mut records);
        for record in &mut records {
            if record.host.ends_with('.') {
                record.host.pop();
            }
        }

        tracing::debug!(domain, records = records.len(), "resolved MX records");
        Ok(records)
    }
}

/// Sort ascending by preference, then Fisher-Yates shuffle each run of
/// equal-preference records.
pub fn order_by_preference(records: &mut [MxRecord]) {
    use rand::seq::SliceRandom;

    records.sort_by_key(|record| record.pref);

    let mut start = 0;
    while start < records.len() {
        let pref = records[start].pref;
        let mut end = start + 1;
        while end < records.len() && records[end].pref == pref {
            end += 1;
        }
        if end - start > 1 {
            records[start..end].shuffle(&mut rand::rng());
        }
        start = end;
    }
}
