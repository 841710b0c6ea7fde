//! Error types for the core crate.

use thiserror::Error;

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the core types.
#[derive(Debug, Error)]
pub enum Error {
    /// A required request field was empty or zero.
    #[error("request field '{0}' cannot be empty")]
    EmptyField(&'static str),

    /// Unsubscribe was called for a subscriber that was never registered.
    #[error("subscriber not registered: {0}")]
    UnknownSubscriber(String),

    /// Other error.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
