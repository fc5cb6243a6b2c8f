/*!
 * Error types for device communication.
 */
use thiserror::Error;

use poolflow_core::error::Error as CoreError;

use crate::protocol::DecodeError;

/// Error type for device operations
#[derive(Error, Debug)]
pub enum DeviceError {
    /// The control socket is not open
    #[error("Device not connected")]
    NotConnected,

    /// The control socket could not be opened
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Timeout error
    #[error("Timeout error: {0}")]
    Timeout(String),

    /// A device line could not be decoded
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    /// Pairing storage failed
    #[error("Storage error: {0}")]
    Storage(String),

    /// Slot index outside 0..=5
    #[error("Invalid time slot index: {0}")]
    InvalidSlot(usize),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Core error
    #[error("Core error: {0}")]
    Core(#[from] CoreError),
}

/// Result type for device operations
pub type Result<T> = std::result::Result<T, DeviceError>;

impl DeviceError {
    /// Create a new storage error
    pub fn storage<S: AsRef<str>>(msg: S) -> Self {
        DeviceError::Storage(msg.as_ref().to_string())
    }

    /// Create a new connection error
    pub fn connection<S: AsRef<str>>(msg: S) -> Self {
        DeviceError::ConnectionFailed(msg.as_ref().to_string())
    }
}
