//! Rate limiting policies and the limiter façade.

mod bucket;
mod clock;
mod key;
mod limiter;
mod policy;
mod rules;
mod window;

pub use bucket::{BucketState, TokenBucket};
pub use clock::{Clock, ManualClock, SystemClock};
pub use key::{RateLimitKey, MAX_KEY_LEN};
pub use limiter::{FailMode, LimiterSettings, RateLimiter};
pub use policy::{DecisionSource, Policy, PolicyConfig, RateLimitDecision, ScopedPolicy};
pub use rules::{RouteMatch, RouteRules, RuleConfig, DEFAULT_RULE};
pub use window::FixedWindow;
