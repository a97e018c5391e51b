//! The SMTP front-end: per-connection session engine, access control,
//! server TLS material and the accept loop.

pub mod access;
pub mod error;
pub mod listener;
pub mod session;
pub mod tls;

pub use access::AccessPolicy;
pub use error::SessionError;
pub use listener::Listener;
pub use session::{Session, SessionConfig};
pub use tls::TlsError;
