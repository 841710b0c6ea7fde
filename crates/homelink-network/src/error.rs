//! Error types for the transport layer.
//!
//! Only channel-level problems live here. A timeout while waiting for a
//! response is *not* an error (see `RequestOutcome::no_response`), and decode
//! failures never leave the connector that hit them.

use thiserror::Error;

/// Result type for transport operations.
pub type Result<T> = std::result::Result<T, NetworkError>;

/// Transport-level errors.
#[derive(Debug, Error)]
pub enum NetworkError {
    /// The connector was shut down or never connected.
    #[error("connector not connected")]
    NotConnected,

    /// Establishing the connection failed.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// The channel broke mid-flight (port gone, broker lost). Fatal for the
    /// connector instance; retry means reconnecting, not re-sending.
    #[error("transport failure: {0}")]
    Transport(String),

    /// I/O error on the underlying stream.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Other error.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
