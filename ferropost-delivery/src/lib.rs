//! Outbound delivery: MX resolution, the SMTP client, the per-message
//! delivery driver and the retrying queue manager.
//!
//! The moving parts are joined by two object-safe seams: [`MxResolve`]
//! (DNS) and [`HostClient`] (per-host SMTP), both consumed by
//! [`DeliveryDriver`], which in turn implements the [`Deliver`] seam the
//! [`queue::Manager`] schedules against. Tests substitute any of the three.

pub mod client;
pub mod dns;
pub mod driver;
pub mod error;
pub mod queue;
pub mod response;
pub mod retry;
pub mod types;

pub use client::{ClientError, HostClient, SmtpConnector};
pub use dns::{DnsError, DnsResolver, MxRecord, MxResolve};
pub use driver::{Deliver, DeliveryDriver};
pub use error::DeliveryError;
pub use queue::Manager;
pub use types::{Payload, QueuedMessage};
