//! Error types for signbridge-host.

use std::path::PathBuf;

use signbridge_relay::DeviceError;
use signbridge_types::BridgeError;

/// Main error type for host operations outside a client request.
#[derive(Debug, thiserror::Error)]
pub enum HostError {
    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// State store error.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Agent framing error.
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    /// Block-list fetch error.
    #[error("block-list error: {0}")]
    BlockList(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// State store errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Reading or writing the state file failed.
    #[error("state file {path}: {source}")]
    Io {
        /// The state file.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The state file is not valid JSON.
    #[error("invalid state: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Length-prefixed agent message errors.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// Frame exceeds the maximum size.
    #[error("frame too large: {size} bytes (limit: {limit} bytes)")]
    TooLarge {
        /// Announced frame size.
        size: usize,
        /// Maximum allowed size.
        limit: usize,
    },

    /// Frame body is not JSON.
    #[error("invalid frame: {0}")]
    Invalid(#[from] serde_json::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<StoreError> for DeviceError {
    fn from(err: StoreError) -> Self {
        DeviceError::Store(err.to_string())
    }
}

impl From<StoreError> for BridgeError {
    fn from(err: StoreError) -> Self {
        BridgeError::Internal(err.to_string())
    }
}

/// Result type alias for host operations.
pub type Result<T> = std::result::Result<T, HostError>;
