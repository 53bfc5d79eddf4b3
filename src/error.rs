//! Error types for the Tollgate service.

use thiserror::Error;

use crate::store::StoreError;

/// Main error type for Tollgate operations.
///
/// Rate limit rejections are not errors; they are returned as
/// [`RateLimitDecision`](crate::ratelimit::RateLimitDecision) values.
#[derive(Error, Debug)]
pub enum TollgateError {
    /// The caller supplied an empty or malformed rate limit key
    #[error("Invalid rate limit key: {0}")]
    InvalidKey(String),

    /// The counter store could not be reached in time
    #[error("Counter store unavailable: {0}")]
    StoreUnavailable(#[from] StoreError),

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TollgateError {
    /// Create a new configuration error
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::Config(msg.into())
    }

    /// Create a new invalid key error
    pub fn invalid_key<S: Into<String>>(msg: S) -> Self {
        Self::InvalidKey(msg.into())
    }
}

/// Result type alias for Tollgate operations.
pub type Result<T> = std::result::Result<T, TollgateError>;
