//! Error types for Floodgate.

use thiserror::Error;

/// Main error type for Floodgate operations.
///
/// A denied request is not an error: it is an ordinary
/// [`Decision`](crate::ratelimit::Decision) with `allowed == false`.
#[derive(Error, Debug)]
pub enum FloodgateError {
    /// A policy was built with a zero window or a zero request budget
    #[error("Invalid policy: {0}")]
    InvalidPolicy(String),

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// The shared counter store could not be reached or timed out
    #[error("Backend unavailable: {0}")]
    Backend(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<redis::RedisError> for FloodgateError {
    fn from(err: redis::RedisError) -> Self {
        FloodgateError::Backend(err.to_string())
    }
}

/// Result type alias for Floodgate operations.
pub type Result<T> = std::result::Result<T, FloodgateError>;
