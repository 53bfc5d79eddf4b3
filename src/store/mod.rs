//! Counter store backends.
//!
//! The store is the single shared mutable resource of the limiter. Every
//! per-key update goes through one of its atomic primitives:
//!
//! - `incr` for fixed window counters (`INCR` in Redis)
//! - `swap_bucket` for token bucket state (compare-and-swap)
//!
//! Two backends are provided: [`MemoryStore`] for single-instance
//! deployments and tests, and [`RedisStore`] for sharing quotas across
//! instances.

mod memory;
mod redis;

pub use memory::MemoryStore;
pub use redis::{RedisStore, DEFAULT_PREFIX as DEFAULT_REDIS_PREFIX};

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::ratelimit::BucketState;

/// Errors raised by counter store backends.
///
/// Every variant is treated as store unavailability by the limiter and
/// resolved through the configured fail mode.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backend could not be reached
    #[error("store unreachable: {0}")]
    Unavailable(String),

    /// The backend answered with an error
    #[error("store backend error: {0}")]
    Backend(String),

    /// The store call did not finish within the configured timeout
    #[error("store call timed out after {0:?}")]
    Timeout(Duration),

    /// Stored state could not be encoded or decoded
    #[error("store codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// Compare-and-swap kept losing to concurrent writers
    #[error("gave up after {attempts} conflicting updates")]
    Contention {
        /// Number of attempts made
        attempts: u32,
    },
}

impl From<::redis::RedisError> for StoreError {
    fn from(err: ::redis::RedisError) -> Self {
        if err.is_io_error()
            || err.is_timeout()
            || err.is_connection_dropped()
            || err.is_connection_refusal()
        {
            StoreError::Unavailable(err.to_string())
        } else {
            StoreError::Backend(err.to_string())
        }
    }
}

/// Result type for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Longest expiry any store will set. Longer TTLs are clamped to this.
pub const MAX_TTL: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// A TTL in milliseconds, clamped to [`MAX_TTL`].
pub(crate) fn ttl_millis(ttl: Duration) -> u64 {
    // MAX_TTL in ms fits comfortably in an i64.
    ttl.min(MAX_TTL).as_millis() as u64
}

/// An atomic key-value counter service.
///
/// Implementations must make `incr` and `swap_bucket` atomic with respect
/// to concurrent callers on the same key; no lost updates.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Atomically increment the counter at `key` and return the new value.
    ///
    /// A missing or expired key starts from zero.
    async fn incr(&self, key: &str) -> StoreResult<u64>;

    /// Set the expiry of `key`.
    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<()>;

    /// Time left before `key` expires.
    ///
    /// Returns `None` when the key is missing or has no expiry.
    async fn ttl(&self, key: &str) -> StoreResult<Option<Duration>>;

    /// Load the token bucket state stored at `key`.
    async fn load_bucket(&self, key: &str) -> StoreResult<Option<BucketState>>;

    /// Replace the bucket at `key` with `next` if it still equals `expected`.
    ///
    /// `expected == None` means the key must be absent. Returns `false` when
    /// another writer got there first; the caller reloads and retries.
    async fn swap_bucket(
        &self,
        key: &str,
        expected: Option<&BucketState>,
        next: &BucketState,
        ttl: Duration,
    ) -> StoreResult<bool>;

    /// Backend name for logging.
    fn name(&self) -> &'static str;
}
