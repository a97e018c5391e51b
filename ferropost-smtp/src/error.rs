use std::time::Duration;

use thiserror::Error;

/// Terminal session failures. Protocol-level problems (bad addresses,
/// policy rejections, oversize bodies) are handled with SMTP replies and
/// never surface here; these errors always close the connection.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("connection error: {0}")]
    Connection(#[from] std::io::Error),

    #[error("session timed out after {0:?}")]
    Timeout(Duration),
}
