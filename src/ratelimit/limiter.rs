//! Core rate limiter implementation.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use super::bucket::TokenBucket;
use super::clock::{Clock, SystemClock};
use super::key::RateLimitKey;
use super::policy::{Policy, RateLimitDecision, ScopedPolicy};
use super::window::FixedWindow;
use crate::error::{Result, TollgateError};
use crate::store::{CounterStore, StoreError, StoreResult};

/// Default bound on a single store round trip.
const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_millis(100);
/// Default number of compare-and-swap attempts for token bucket updates.
const DEFAULT_MAX_SWAP_ATTEMPTS: u32 = 16;

/// What to do when the counter store cannot be consulted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailMode {
    /// Admit the request
    #[default]
    Open,
    /// Reject the request with a store error
    Closed,
}

/// Runtime settings for the limiter.
#[derive(Debug, Clone)]
pub struct LimiterSettings {
    /// Behaviour on store unavailability
    pub fail_mode: FailMode,
    /// Bound on each store round trip
    pub store_timeout: Duration,
    /// Compare-and-swap attempts before giving up on a bucket update
    pub max_swap_attempts: u32,
}

impl Default for LimiterSettings {
    fn default() -> Self {
        Self {
            fail_mode: FailMode::default(),
            store_timeout: DEFAULT_STORE_TIMEOUT,
            max_swap_attempts: DEFAULT_MAX_SWAP_ATTEMPTS,
        }
    }
}

/// The rate limiter façade.
///
/// Composes the pure policies with an injected [`CounterStore`]. The store
/// is the only place counter state lives, so one limiter can be shared
/// across tasks and several limiters can share one store.
pub struct RateLimiter {
    store: Arc<dyn CounterStore>,
    settings: LimiterSettings,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    /// Create a limiter over `store` using the system clock.
    pub fn new(store: Arc<dyn CounterStore>, settings: LimiterSettings) -> Self {
        Self::with_clock(store, settings, Arc::new(SystemClock))
    }

    /// Create a limiter that reads time from `clock`.
    pub fn with_clock(
        store: Arc<dyn CounterStore>,
        settings: LimiterSettings,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            settings,
            clock,
        }
    }

    /// The limiter settings.
    pub fn settings(&self) -> &LimiterSettings {
        &self.settings
    }

    /// Name of the backing store.
    pub fn store_name(&self) -> &'static str {
        self.store.name()
    }

    /// Evaluate a request from the caller identified by `raw_key`.
    ///
    /// An empty or malformed key is a caller error
    /// ([`TollgateError::InvalidKey`]), not a rejection. Store failures are
    /// never returned; they resolve to the configured fail mode.
    pub async fn evaluate(&self, raw_key: &str, policy: &ScopedPolicy) -> Result<RateLimitDecision> {
        let key = RateLimitKey::new(raw_key)?;
        Ok(self.evaluate_key(&key, policy).await)
    }

    /// Evaluate a request for an already validated key.
    ///
    /// Every call updates the store, including calls that end in rejection
    /// under the fixed window policy.
    pub async fn evaluate_key(&self, key: &RateLimitKey, policy: &ScopedPolicy) -> RateLimitDecision {
        match self.try_evaluate(key, policy).await {
            Ok(decision) => decision,
            Err(err) => self.fallback(key, policy, err),
        }
    }

    /// Evaluate without applying the fail mode.
    ///
    /// Store failures and timeouts come back as
    /// [`TollgateError::StoreUnavailable`].
    pub async fn try_evaluate(
        &self,
        key: &RateLimitKey,
        policy: &ScopedPolicy,
    ) -> Result<RateLimitDecision> {
        let store_key = key.store_key(&policy.name, policy.policy.algorithm());

        trace!(key = %key, rule = %policy.name, "Checking rate limit");

        let decision = match &policy.policy {
            Policy::FixedWindow(window) => self.check_fixed_window(&store_key, window).await?,
            Policy::TokenBucket(bucket) => self.check_token_bucket(&store_key, bucket).await?,
        };

        if decision.allowed {
            trace!(
                key = %key,
                rule = %policy.name,
                remaining = ?decision.remaining,
                "Request admitted"
            );
        } else {
            debug!(
                key = %key,
                rule = %policy.name,
                retry_after = ?decision.retry_after_secs,
                "Rate limit exceeded"
            );
        }

        Ok(decision)
    }

    async fn check_fixed_window(
        &self,
        store_key: &str,
        window: &FixedWindow,
    ) -> StoreResult<RateLimitDecision> {
        let count = self.call(self.store.incr(store_key)).await?;

        if window.opens_window(count) {
            self.call(self.store.expire(store_key, window.window())).await?;
            debug!(
                key = %store_key,
                limit = window.limit(),
                window_secs = window.window().as_secs(),
                "Opened rate limit window"
            );
        }

        if window.admits(count) {
            return Ok(window.decide(count, None));
        }

        let mut ttl = self.call(self.store.ttl(store_key)).await?;
        if window.needs_repair(ttl) {
            warn!(key = %store_key, count = count, "Counter had no expiry, restoring it");
            self.call(self.store.expire(store_key, window.window())).await?;
            ttl = Some(window.window());
        }

        Ok(window.decide(count, ttl))
    }

    async fn check_token_bucket(
        &self,
        store_key: &str,
        bucket: &TokenBucket,
    ) -> StoreResult<RateLimitDecision> {
        let attempts = self.settings.max_swap_attempts.max(1);

        for attempt in 1..=attempts {
            let current = self.call(self.store.load_bucket(store_key)).await?;
            let now = self.clock.now_millis();

            let (next, decision) = bucket.take(current.as_ref(), now);
            let Some(next) = next else {
                return Ok(decision);
            };

            let ttl = bucket.state_ttl(&next);
            let swapped = self
                .call(self.store.swap_bucket(store_key, current.as_ref(), &next, ttl))
                .await?;
            if swapped {
                return Ok(decision);
            }

            trace!(key = %store_key, attempt = attempt, "Bucket update conflicted, retrying");
        }

        Err(StoreError::Contention { attempts })
    }

    /// Run one store round trip under the configured timeout.
    async fn call<T, F>(&self, op: F) -> StoreResult<T>
    where
        F: Future<Output = StoreResult<T>>,
    {
        match tokio::time::timeout(self.settings.store_timeout, op).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout(self.settings.store_timeout)),
        }
    }

    fn fallback(&self, key: &RateLimitKey, policy: &ScopedPolicy, err: TollgateError) -> RateLimitDecision {
        let limit = policy.policy.limit();
        match self.settings.fail_mode {
            FailMode::Open => {
                warn!(
                    key = %key,
                    rule = %policy.name,
                    store = self.store.name(),
                    error = %err,
                    "Counter store unavailable, failing open"
                );
                RateLimitDecision::fail_open(limit)
            }
            FailMode::Closed => {
                warn!(
                    key = %key,
                    rule = %policy.name,
                    store = self.store.name(),
                    error = %err,
                    "Counter store unavailable, failing closed"
                );
                RateLimitDecision::fail_closed(limit)
            }
        }
    }
}
