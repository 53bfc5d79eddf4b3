//! HTTP server implementation.

use std::net::SocketAddr;

use axum::routing::get;
use axum::{middleware, Json, Router};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info};

use super::middleware::{rate_limit, RateLimitState};
use crate::error::{Result, TollgateError};

/// HTTP server fronting its routes with the rate limiter.
pub struct HttpServer {
    /// Address to bind to
    addr: SocketAddr,
    /// Rate limit middleware state
    state: RateLimitState,
}

impl HttpServer {
    /// Create a new HTTP server.
    pub fn new(addr: SocketAddr, state: RateLimitState) -> Self {
        Self { addr, state }
    }

    /// Build the router with the rate limit step installed.
    pub fn router(&self) -> Router {
        protect(
            Router::new()
                .route("/", get(index))
                .route("/healthz", get(healthz)),
            self.state.clone(),
        )
    }

    /// Start the server with graceful shutdown.
    ///
    /// The server will shut down when the provided signal resolves.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let router = self.router();
        let listener = TcpListener::bind(self.addr).await.map_err(|e| {
            error!(addr = %self.addr, error = %e, "Failed to bind HTTP listener");
            TollgateError::Io(e)
        })?;

        info!(
            addr = %self.addr,
            store = self.state.limiter().store_name(),
            rules = self.state.rules().len(),
            "Starting HTTP server with graceful shutdown"
        );

        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(signal)
        .await
        .map_err(|e| {
            error!(error = %e, "HTTP server failed");
            TollgateError::Io(e)
        })
    }
}

/// Install the rate limit step in front of every route of `router`.
pub fn protect(router: Router, state: RateLimitState) -> Router {
    router.layer(middleware::from_fn_with_state(state, rate_limit))
}

async fn index() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn healthz() -> &'static str {
    "ok"
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::KeySource;
    use crate::ratelimit::{LimiterSettings, PolicyConfig, RateLimiter, RouteRules, RuleConfig};
    use crate::store::MemoryStore;
    use axum::body::Body;
    use axum::extract::{ConnectInfo, Request};
    use axum::http::StatusCode;
    use std::sync::Arc;
    use tower::ServiceExt;

    fn server() -> HttpServer {
        let rules = vec![RuleConfig {
            name: "health".to_string(),
            path_prefix: "/healthz".to_string(),
            description: None,
            policy: None,
            exempt: true,
        }];
        let default = PolicyConfig::TokenBucket {
            capacity: 2,
            refill_rate_per_second: 0.01,
            charge_rejected: false,
        };
        let state = RateLimitState::new(
            Arc::new(RateLimiter::new(
                Arc::new(MemoryStore::new()),
                LimiterSettings::default(),
            )),
            Arc::new(RouteRules::from_config(&default, &rules).unwrap()),
            Arc::new(KeySource::Ip),
        );
        HttpServer::new("127.0.0.1:0".parse().unwrap(), state)
    }

    fn from_peer(path: &str, peer: &str) -> Request {
        let mut request = Request::builder().uri(path).body(Body::empty()).unwrap();
        let addr: SocketAddr = peer.parse().unwrap();
        request.extensions_mut().insert(ConnectInfo(addr));
        request
    }

    #[tokio::test]
    async fn test_router_limits_by_peer_ip() {
        let router = server().router();

        for _ in 0..2 {
            let response = router.clone().oneshot(from_peer("/", "10.0.0.1:5000")).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }
        // Same IP, different port: same caller.
        let response = router.clone().oneshot(from_peer("/", "10.0.0.1:6000")).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

        let response = router.oneshot(from_peer("/", "10.0.0.2:5000")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_healthz_is_exempt() {
        let router = server().router();

        for _ in 0..5 {
            let response = router.clone().oneshot(from_peer("/healthz", "10.0.0.1:5000")).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }
    }

    #[tokio::test]
    async fn test_serve_with_shutdown_stops() {
        let result = server().serve_with_shutdown(async {}).await;
        assert!(result.is_ok());
    }
}
