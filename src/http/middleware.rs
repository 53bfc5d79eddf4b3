//! Rate limit middleware for axum.
//!
//! The check is an explicit step in the request pipeline, installed with
//! [`axum::middleware::from_fn_with_state`]. Per request it moves through
//! `received -> key extracted -> evaluated` and ends admitted, rejected
//! or with a store error.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::header::RETRY_AFTER;
use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::{debug, trace};

use super::extract::KeyExtractor;
use crate::error::TollgateError;
use crate::ratelimit::{DecisionSource, RateLimitDecision, RateLimiter, RouteMatch, RouteRules};

/// `X-RateLimit-Limit` response header.
pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
/// `X-RateLimit-Remaining` response header.
pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");

/// Shared state for the rate limit middleware.
#[derive(Clone)]
pub struct RateLimitState {
    limiter: Arc<RateLimiter>,
    rules: Arc<RouteRules>,
    extractor: Arc<dyn KeyExtractor>,
}

impl RateLimitState {
    /// Bundle the limiter, the route rules and the key extractor.
    pub fn new(
        limiter: Arc<RateLimiter>,
        rules: Arc<RouteRules>,
        extractor: Arc<dyn KeyExtractor>,
    ) -> Self {
        Self {
            limiter,
            rules,
            extractor,
        }
    }

    /// The limiter.
    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// The route rules.
    pub fn rules(&self) -> &Arc<RouteRules> {
        &self.rules
    }
}

/// Check the request against its rate limit before running the handler.
pub async fn rate_limit(State(state): State<RateLimitState>, request: Request, next: Next) -> Response {
    let policy = match state.rules.match_path(request.uri().path()) {
        RouteMatch::Limit(policy) => policy,
        RouteMatch::Exempt(rule) => {
            trace!(path = %request.uri().path(), rule = %rule, "Path exempt from rate limiting");
            return next.run(request).await;
        }
    };

    let key = match state.extractor.extract(&request) {
        Ok(key) => key,
        Err(err) => {
            debug!(path = %request.uri().path(), error = %err, "Could not extract rate limit key");
            return invalid_key_response(&err);
        }
    };
    trace!(key = %key, rule = %policy.name, "Rate limit key extracted");

    let decision = state.limiter.evaluate_key(&key, &policy).await;

    if decision.allowed {
        let mut response = next.run(request).await;
        apply_quota_headers(&mut response, &decision);
        return response;
    }

    match decision.source {
        DecisionSource::FailClosed => store_unavailable_response(),
        _ => too_many_requests_response(&decision),
    }
}

fn apply_quota_headers(response: &mut Response, decision: &RateLimitDecision) {
    let headers = response.headers_mut();
    headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(decision.limit));
    if let Some(remaining) = decision.remaining {
        headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(remaining));
    }
}

/// `429 Too Many Requests` with a `Retry-After` hint.
pub fn too_many_requests_response(decision: &RateLimitDecision) -> Response {
    let retry_after = decision.retry_after_secs.unwrap_or(1);
    let body = Json(json!({
        "error": "rate limit exceeded",
        "retry_after": retry_after,
    }));

    let mut response = (StatusCode::TOO_MANY_REQUESTS, body).into_response();
    let headers = response.headers_mut();
    headers.insert(RETRY_AFTER, HeaderValue::from(retry_after));
    headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(decision.limit));
    headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(0u64));
    response
}

/// `400 Bad Request` for a missing or malformed key.
pub fn invalid_key_response(err: &TollgateError) -> Response {
    let detail = match err {
        TollgateError::InvalidKey(detail) => detail.clone(),
        other => other.to_string(),
    };
    let body = Json(json!({
        "error": "invalid rate limit key",
        "detail": detail,
    }));
    (StatusCode::BAD_REQUEST, body).into_response()
}

/// `503 Service Unavailable` when the store is down and the limiter fails
/// closed.
pub fn store_unavailable_response() -> Response {
    let body = Json(json!({ "error": "rate limiter unavailable" }));
    (StatusCode::SERVICE_UNAVAILABLE, body).into_response()
}
