//! Token bucket policy.
//!
//! A bucket holds up to `capacity` tokens and refills continuously at
//! `refill_rate` tokens per second. Refill is computed lazily from the time
//! of the last update. Each admitted request takes one token.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::policy::RateLimitDecision;
use crate::store::MAX_TTL;

/// Persisted state of one bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BucketState {
    /// Tokens available at `last_refill_ms`
    pub tokens: f64,
    /// Last update, in milliseconds since the Unix epoch
    pub last_refill_ms: i64,
}

impl BucketState {
    /// Create a bucket state.
    pub fn new(tokens: f64, last_refill_ms: i64) -> Self {
        Self {
            tokens,
            last_refill_ms,
        }
    }
}

/// Token bucket policy. Pure: state and time are inputs.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenBucket {
    capacity: u64,
    refill_rate: f64,
    charge_rejected: bool,
}

impl TokenBucket {
    /// Create a bucket policy.
    ///
    /// `capacity` and `refill_rate` must be positive; see
    /// [`PolicyConfig::build`](super::PolicyConfig::build).
    pub fn new(capacity: u64, refill_rate: f64, charge_rejected: bool) -> Self {
        Self {
            capacity,
            refill_rate,
            charge_rejected,
        }
    }

    /// Maximum tokens.
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Tokens added per second.
    pub fn refill_rate(&self) -> f64 {
        self.refill_rate
    }

    /// Whether rejected requests consume a token.
    pub fn charges_rejected(&self) -> bool {
        self.charge_rejected
    }

    /// Tokens available at `now_ms`. A missing bucket is full.
    ///
    /// Never exceeds `capacity`. A clock that moved backwards adds nothing.
    pub fn refill(&self, state: Option<&BucketState>, now_ms: i64) -> f64 {
        let capacity = self.capacity as f64;
        match state {
            None => capacity,
            Some(state) => {
                let elapsed_secs = now_ms.saturating_sub(state.last_refill_ms).max(0) as f64 / 1000.0;
                (state.tokens + elapsed_secs * self.refill_rate).min(capacity)
            }
        }
    }

    /// Evaluate one request.
    ///
    /// Returns the state to write back (`None` when nothing changes) and the
    /// decision. A request is admitted when at least one whole token is
    /// available, so the request that empties the bucket to exactly zero
    /// still goes through.
    pub fn take(
        &self,
        state: Option<&BucketState>,
        now_ms: i64,
    ) -> (Option<BucketState>, RateLimitDecision) {
        let available = self.refill(state, now_ms);
        let stamp = state.map_or(now_ms, |s| s.last_refill_ms.max(now_ms));

        if available >= 1.0 {
            let tokens = available - 1.0;
            let decision = RateLimitDecision::admit(self.capacity, tokens.floor() as u64);
            return (Some(BucketState::new(tokens, stamp)), decision);
        }

        if self.charge_rejected {
            let tokens = (available - 1.0).max(-(self.capacity as f64));
            let decision = RateLimitDecision::reject(self.capacity, self.retry_after(tokens));
            (Some(BucketState::new(tokens, stamp)), decision)
        } else {
            let decision = RateLimitDecision::reject(self.capacity, self.retry_after(available));
            (None, decision)
        }
    }

    /// Whole seconds until one token is available, never less than one.
    pub fn retry_after(&self, tokens: f64) -> u64 {
        let deficit = (1.0 - tokens).max(0.0);
        ((deficit / self.refill_rate).ceil() as u64).max(1)
    }

    /// How long a stored state must live before it is equivalent to a full
    /// bucket, plus one second of slack. Capped at [`MAX_TTL`].
    pub fn state_ttl(&self, state: &BucketState) -> Duration {
        let missing = (self.capacity as f64 - state.tokens).max(0.0);
        let secs = (missing / self.refill_rate).ceil() + 1.0;
        if secs >= MAX_TTL.as_secs_f64() {
            return MAX_TTL;
        }
        Duration::from_secs(secs as u64)
    }
}
