use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SpoolError {
    /// The message id contains a path separator or traversal sequence, or
    /// is empty. Raised before any filesystem side-effect.
    #[error("invalid spool identifier")]
    InvalidId,

    /// Underlying filesystem failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}
