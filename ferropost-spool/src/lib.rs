//! Filesystem spool for accepted messages.
//!
//! Every accepted (message, recipient) pair is persisted as one `.eml`
//! file before the envelope is queued for delivery. Files land under a
//! UTC-date-partitioned directory and are never read back by the relay;
//! they exist for operator inspection and disaster recovery.

mod error;
mod spool;

pub use error::SpoolError;
pub use spool::{FileSpool, MemorySpool, Spool};
