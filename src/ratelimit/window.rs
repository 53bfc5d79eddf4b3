//! Fixed window policy.
//!
//! Requests are counted per key in windows of a fixed length; the counter
//! is created with an expiry equal to the window and starts over once that
//! expiry passes. A burst straddling a window boundary can see up to twice
//! the limit admitted in one window's worth of time. That is a property of
//! the algorithm and is accepted.

use std::time::Duration;

use super::policy::{ceil_secs, RateLimitDecision};

/// Fixed window policy. Pure: all counter state comes from the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixedWindow {
    limit: u64,
    window: Duration,
}

impl FixedWindow {
    /// Create a policy admitting `limit` requests per `window`.
    pub fn new(limit: u64, window: Duration) -> Self {
        Self { limit, window }
    }

    /// Maximum admitted requests per window.
    pub fn limit(&self) -> u64 {
        self.limit
    }

    /// Window length.
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Whether `count` (the value returned by the increment) opened a new
    /// window, which must be given its expiry.
    pub fn opens_window(&self, count: u64) -> bool {
        count == 1
    }

    /// Whether the counter has lost its expiry and must be given one.
    pub fn needs_repair(&self, ttl: Option<Duration>) -> bool {
        ttl.is_none()
    }

    /// Whether `count` is within the limit.
    pub fn admits(&self, count: u64) -> bool {
        count <= self.limit
    }

    /// Decide on a request given the post-increment count and the time left
    /// in the window.
    pub fn decide(&self, count: u64, ttl: Option<Duration>) -> RateLimitDecision {
        if self.admits(count) {
            RateLimitDecision::admit(self.limit, self.limit - count)
        } else {
            RateLimitDecision::reject(self.limit, self.retry_after(ttl))
        }
    }

    /// Seconds until the window resets, never less than one.
    pub fn retry_after(&self, ttl: Option<Duration>) -> u64 {
        let wait = ttl.unwrap_or(self.window).min(self.window);
        ceil_secs(wait).max(1)
    }
}
