/*!
 * Error types for the PoolFlow engine crate.
 */
use thiserror::Error;

/// Error type for PoolFlow engine operations
#[derive(Error, Debug)]
pub enum Error {
    /// The session task is no longer running
    #[error("Pool session closed")]
    SessionClosed,

    /// Device error
    #[error("Device error: {0}")]
    Device(#[from] poolflow_devices::DeviceError),

    /// Core error
    #[error("Core error: {0}")]
    Core(#[from] poolflow_core::error::Error),
}

/// Result type for PoolFlow engine operations
pub type Result<T> = std::result::Result<T, Error>;

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for Error {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        Error::SessionClosed
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for Error {
    fn from(_: tokio::sync::oneshot::error::RecvError) -> Self {
        Error::SessionClosed
    }
}
