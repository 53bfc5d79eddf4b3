//! Policy configuration and rate limit decisions.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::bucket::TokenBucket;
use super::window::FixedWindow;
use crate::error::{Result, TollgateError};
use crate::store::MAX_TTL;

/// Default limit for the fixed window policy.
const DEFAULT_LIMIT: u64 = 100;
/// Default window length in seconds.
const DEFAULT_WINDOW_SECS: u64 = 60;

/// Where a decision came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionSource {
    /// The policy evaluated live counter state
    Policy,
    /// The store was unavailable and the limiter fails open
    FailOpen,
    /// The store was unavailable and the limiter fails closed
    FailClosed,
}

/// The outcome of evaluating one request.
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitDecision {
    /// Whether the request may proceed
    pub allowed: bool,
    /// Seconds the caller should wait before retrying, when rejected
    pub retry_after_secs: Option<u64>,
    /// Quota left after this request, when known
    pub remaining: Option<u64>,
    /// The configured limit or capacity
    pub limit: u64,
    /// What produced this decision
    pub source: DecisionSource,
}

impl RateLimitDecision {
    /// An admitted request.
    pub fn admit(limit: u64, remaining: u64) -> Self {
        Self {
            allowed: true,
            retry_after_secs: None,
            remaining: Some(remaining),
            limit,
            source: DecisionSource::Policy,
        }
    }

    /// A request rejected by the policy.
    pub fn reject(limit: u64, retry_after_secs: u64) -> Self {
        Self {
            allowed: false,
            retry_after_secs: Some(retry_after_secs),
            remaining: Some(0),
            limit,
            source: DecisionSource::Policy,
        }
    }

    /// Admit because the store could not be consulted.
    pub fn fail_open(limit: u64) -> Self {
        Self {
            allowed: true,
            retry_after_secs: None,
            remaining: None,
            limit,
            source: DecisionSource::FailOpen,
        }
    }

    /// Reject because the store could not be consulted.
    pub fn fail_closed(limit: u64) -> Self {
        Self {
            allowed: false,
            retry_after_secs: None,
            remaining: None,
            limit,
            source: DecisionSource::FailClosed,
        }
    }

    /// Whether this decision is a fallback for store unavailability.
    pub fn is_store_fallback(&self) -> bool {
        self.source != DecisionSource::Policy
    }
}

/// Serializable policy settings, as written in configuration files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "algorithm", rename_all = "snake_case")]
pub enum PolicyConfig {
    /// Count requests in fixed windows of `window_seconds`
    FixedWindow {
        /// Maximum admitted requests per window
        limit: u64,
        /// Window length in seconds
        window_seconds: u64,
    },
    /// Continuously refilling token pool
    TokenBucket {
        /// Maximum tokens (burst size)
        capacity: u64,
        /// Tokens added per second
        refill_rate_per_second: f64,
        /// Whether a rejected request still consumes a token
        #[serde(default)]
        charge_rejected: bool,
    },
}

impl Default for PolicyConfig {
    fn default() -> Self {
        PolicyConfig::FixedWindow {
            limit: DEFAULT_LIMIT,
            window_seconds: DEFAULT_WINDOW_SECS,
        }
    }
}

impl PolicyConfig {
    /// Validate the settings and build the runtime policy.
    pub fn build(&self) -> Result<Policy> {
        match *self {
            PolicyConfig::FixedWindow {
                limit,
                window_seconds,
            } => {
                if limit == 0 {
                    return Err(TollgateError::config("fixed window limit must be greater than 0"));
                }
                if window_seconds == 0 {
                    return Err(TollgateError::config(
                        "fixed window window_seconds must be greater than 0",
                    ));
                }
                if window_seconds > MAX_TTL.as_secs() {
                    return Err(TollgateError::config(format!(
                        "fixed window window_seconds must be at most {}, got {}",
                        MAX_TTL.as_secs(),
                        window_seconds
                    )));
                }
                Ok(Policy::FixedWindow(FixedWindow::new(
                    limit,
                    Duration::from_secs(window_seconds),
                )))
            }
            PolicyConfig::TokenBucket {
                capacity,
                refill_rate_per_second,
                charge_rejected,
            } => {
                if capacity == 0 {
                    return Err(TollgateError::config(
                        "token bucket capacity must be greater than 0",
                    ));
                }
                if !refill_rate_per_second.is_finite() || refill_rate_per_second <= 0.0 {
                    return Err(TollgateError::config(format!(
                        "token bucket refill_rate_per_second must be a positive number, got {}",
                        refill_rate_per_second
                    )));
                }
                Ok(Policy::TokenBucket(TokenBucket::new(
                    capacity,
                    refill_rate_per_second,
                    charge_rejected,
                )))
            }
        }
    }
}

/// A validated rate limit policy.
#[derive(Debug, Clone, PartialEq)]
pub enum Policy {
    /// Fixed window counting
    FixedWindow(FixedWindow),
    /// Token bucket
    TokenBucket(TokenBucket),
}

impl Policy {
    /// The configured limit (fixed window) or capacity (token bucket).
    pub fn limit(&self) -> u64 {
        match self {
            Policy::FixedWindow(window) => window.limit(),
            Policy::TokenBucket(bucket) => bucket.capacity(),
        }
    }

    /// Short algorithm tag used in store keys.
    pub fn algorithm(&self) -> &'static str {
        match self {
            Policy::FixedWindow(_) => "fw",
            Policy::TokenBucket(_) => "tb",
        }
    }

    /// Human-readable description for logs.
    pub fn description(&self) -> String {
        match self {
            Policy::FixedWindow(window) => format!(
                "fixed window: {} requests per {}s",
                window.limit(),
                window.window().as_secs()
            ),
            Policy::TokenBucket(bucket) => format!(
                "token bucket: {} capacity, {:.2} tokens/sec",
                bucket.capacity(),
                bucket.refill_rate()
            ),
        }
    }
}

/// A policy bound to the rule name that namespaces its counters.
#[derive(Debug, Clone, PartialEq)]
pub struct ScopedPolicy {
    /// Rule name
    pub name: String,
    /// The policy to apply
    pub policy: Policy,
}

impl ScopedPolicy {
    /// Bind `policy` to the rule `name`.
    pub fn new(name: impl Into<String>, policy: Policy) -> Self {
        Self {
            name: name.into(),
            policy,
        }
    }
}

/// Round a duration up to whole seconds.
pub(crate) fn ceil_secs(duration: Duration) -> u64 {
    duration.as_secs() + u64::from(duration.subsec_nanos() > 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_fixed_window() {
        let yaml = "algorithm: fixed_window\nlimit: 5\nwindow_seconds: 60\n";
        let config: PolicyConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(
            config,
            PolicyConfig::FixedWindow {
                limit: 5,
                window_seconds: 60
            }
        );
        assert_eq!(config.build().unwrap().limit(), 5);
    }

    #[test]
    fn test_parse_token_bucket_defaults_charge_rejected() {
        let yaml = "algorithm: token_bucket\ncapacity: 10\nrefill_rate_per_second: 0.5\n";
        let config: PolicyConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(
            config,
            PolicyConfig::TokenBucket {
                capacity: 10,
                refill_rate_per_second: 0.5,
                charge_rejected: false
            }
        );
    }

    #[test]
    fn test_invalid_policies_rejected() {
        let invalid = [
            PolicyConfig::FixedWindow {
                limit: 0,
                window_seconds: 60,
            },
            PolicyConfig::FixedWindow {
                limit: 5,
                window_seconds: 0,
            },
            PolicyConfig::FixedWindow {
                limit: 5,
                window_seconds: u64::MAX,
            },
            PolicyConfig::TokenBucket {
                capacity: 0,
                refill_rate_per_second: 1.0,
                charge_rejected: false,
            },
            PolicyConfig::TokenBucket {
                capacity: 5,
                refill_rate_per_second: 0.0,
                charge_rejected: false,
            },
            PolicyConfig::TokenBucket {
                capacity: 5,
                refill_rate_per_second: f64::NAN,
                charge_rejected: false,
            },
        ];

        for config in invalid {
            assert!(
                matches!(config.build(), Err(TollgateError::Config(_))),
                "{:?} should be rejected",
                config
            );
        }
    }

    #[test]
    fn test_policy_description() {
        let policy = PolicyConfig::default().build().unwrap();
        assert_eq!(policy.description(), "fixed window: 100 requests per 60s");
        assert_eq!(policy.algorithm(), "fw");
    }

    #[test]
    fn test_fallback_decisions_are_distinguishable() {
        let open = RateLimitDecision::fail_open(5);
        let closed = RateLimitDecision::fail_closed(5);
        let rejected = RateLimitDecision::reject(5, 10);

        assert!(open.allowed && open.is_store_fallback());
        assert!(!closed.allowed && closed.is_store_fallback());
        assert!(!rejected.allowed && !rejected.is_store_fallback());
        assert_ne!(closed, rejected);
    }

    #[test]
    fn test_ceil_secs() {
        assert_eq!(ceil_secs(Duration::from_secs(3)), 3);
        assert_eq!(ceil_secs(Duration::from_millis(2001)), 3);
        assert_eq!(ceil_secs(Duration::ZERO), 0);
    }
}
