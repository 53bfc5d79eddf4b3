//! HTTP integration: key extraction, the rate limit middleware and the
//! server that hosts them.

mod extract;
mod middleware;
mod server;

pub use extract::{extractor_fn, AuthenticatedId, ConfiguredExtractor, FnExtractor, KeyExtractor, KeySource};
pub use middleware::{
    invalid_key_response, rate_limit, store_unavailable_response, too_many_requests_response,
    RateLimitState, X_RATELIMIT_LIMIT, X_RATELIMIT_REMAINING,
};
pub use server::{protect, HttpServer};
