//! Rate limit key validation and store key generation.

use crate::error::{Result, TollgateError};

/// Longest key accepted, in bytes.
pub const MAX_KEY_LEN: usize = 256;

/// A validated identifier for a caller (IP address, API key, user ID).
///
/// Callers that present the same key share one quota.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RateLimitKey(String);

impl RateLimitKey {
    /// Validate and wrap a raw key.
    ///
    /// Empty, whitespace-only, over-long and control-character keys are
    /// rejected with [`TollgateError::InvalidKey`].
    pub fn new(raw: impl Into<String>) -> Result<Self> {
        let raw = raw.into();

        if raw.trim().is_empty() {
            return Err(TollgateError::invalid_key("key is empty"));
        }
        if raw.len() > MAX_KEY_LEN {
            return Err(TollgateError::invalid_key(format!(
                "key is {} bytes, limit is {}",
                raw.len(),
                MAX_KEY_LEN
            )));
        }
        if raw.chars().any(char::is_control) {
            return Err(TollgateError::invalid_key("key contains control characters"));
        }

        Ok(Self(raw))
    }

    /// The raw key.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Build the store key for this caller under a rule and algorithm.
    ///
    /// Counters for different rules never collide.
    pub fn store_key(&self, rule: &str, algorithm: &str) -> String {
        format!("{}:{}:{}", rule, algorithm, self.0)
    }
}

impl std::fmt::Display for RateLimitKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
