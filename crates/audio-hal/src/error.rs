use std::io;
use thiserror::Error;

/// Result type for HAL operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for HAL operations
#[derive(Debug, Error)]
pub enum Error {
    /// The core control descriptor could not be opened at construction;
    /// every subsequent call reports this.
    #[error("audio hardware not initialized")]
    NotInitialized,

    /// I/O error from a device node
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),

    /// Operation rejected in the current state (second output stream,
    /// multiple input devices, unknown stream handle, ...)
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// Rejected parameter value; the corrected value has been written
    /// back to the caller where applicable
    #[error("bad value: {0}")]
    BadValue(String),

    /// Malformed or mismatched binary resource (gain table, EC/NS profile)
    #[error("resource format error: {0}")]
    Format(String),

    /// Requested feature is not available on this hardware path
    #[error("unsupported: {0}")]
    Unsupported(String),
}

impl From<&str> for Error {
    fn from(err: &str) -> Self {
        Error::InvalidOperation(err.to_string())
    }
}
