//! Rate limit key extraction from inbound requests.

use std::net::SocketAddr;
use std::str::FromStr;

use axum::extract::{ConnectInfo, Request};
use axum::http::HeaderName;
use serde::{Deserialize, Serialize};

use crate::error::{Result, TollgateError};
use crate::ratelimit::RateLimitKey;

const FORWARDED_FOR: &str = "x-forwarded-for";

/// Identity attached to a request by an authentication layer that runs
/// before the rate limiter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedId(pub String);

/// Turns a request into the key its quota is tracked under.
pub trait KeyExtractor: Send + Sync {
    /// Extract the key, or explain why the request has none.
    fn extract(&self, request: &Request) -> Result<RateLimitKey>;
}

/// Built-in key sources, written in configuration as `ip`,
/// `header:<name>` or `authenticated_id`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum KeySource {
    /// The peer IP address
    #[default]
    Ip,
    /// The value of a request header
    Header(HeaderName),
    /// The [`AuthenticatedId`] request extension
    AuthenticatedId,
}

impl FromStr for KeySource {
    type Err = TollgateError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "ip" => Ok(KeySource::Ip),
            "authenticated_id" => Ok(KeySource::AuthenticatedId),
            _ => match s.strip_prefix("header:") {
                Some(name) => HeaderName::from_bytes(name.trim().as_bytes())
                    .map(KeySource::Header)
                    .map_err(|_| TollgateError::config(format!("invalid header name in key source '{}'", s))),
                None => Err(TollgateError::config(format!(
                    "unknown key source '{}', expected ip, header:<name> or authenticated_id",
                    s
                ))),
            },
        }
    }
}

impl TryFrom<String> for KeySource {
    type Error = TollgateError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<KeySource> for String {
    fn from(source: KeySource) -> Self {
        source.to_string()
    }
}

impl std::fmt::Display for KeySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KeySource::Ip => write!(f, "ip"),
            KeySource::Header(name) => write!(f, "header:{}", name),
            KeySource::AuthenticatedId => write!(f, "authenticated_id"),
        }
    }
}

impl KeySource {
    fn extract_with(&self, request: &Request, trust_forwarded_for: bool) -> Result<RateLimitKey> {
        match self {
            KeySource::Ip => {
                if let Some(ConnectInfo(addr)) = request.extensions().get::<ConnectInfo<SocketAddr>>() {
                    return RateLimitKey::new(addr.ip().to_string());
                }
                if trust_forwarded_for {
                    if let Some(ip) = forwarded_for(request) {
                        return RateLimitKey::new(ip);
                    }
                }
                Err(TollgateError::invalid_key("client address unknown"))
            }
            KeySource::Header(name) => {
                let value = request
                    .headers()
                    .get(name)
                    .ok_or_else(|| TollgateError::invalid_key(format!("missing {} header", name)))?;
                let value = value
                    .to_str()
                    .map_err(|_| TollgateError::invalid_key(format!("{} header is not valid text", name)))?;
                RateLimitKey::new(value)
            }
            KeySource::AuthenticatedId => {
                let AuthenticatedId(id) = request
                    .extensions()
                    .get::<AuthenticatedId>()
                    .ok_or_else(|| TollgateError::invalid_key("request is not authenticated"))?;
                RateLimitKey::new(id.as_str())
            }
        }
    }
}

impl KeyExtractor for KeySource {
    fn extract(&self, request: &Request) -> Result<RateLimitKey> {
        self.extract_with(request, false)
    }
}

/// First address in `X-Forwarded-For`.
fn forwarded_for(request: &Request) -> Option<&str> {
    request
        .headers()
        .get(FORWARDED_FOR)?
        .to_str()
        .ok()?
        .split(',')
        .map(str::trim)
        .find(|ip| !ip.is_empty())
}

/// A [`KeySource`] with the proxy trust setting from configuration.
#[derive(Debug, Clone)]
pub struct ConfiguredExtractor {
    source: KeySource,
    trust_forwarded_for: bool,
}

impl ConfiguredExtractor {
    /// Create an extractor. `trust_forwarded_for` lets the `ip` source fall
    /// back to `X-Forwarded-For` when the peer address is unknown.
    pub fn new(source: KeySource, trust_forwarded_for: bool) -> Self {
        Self {
            source,
            trust_forwarded_for,
        }
    }

    /// The configured source.
    pub fn source(&self) -> &KeySource {
        &self.source
    }
}

impl KeyExtractor for ConfiguredExtractor {
    fn extract(&self, request: &Request) -> Result<RateLimitKey> {
        self.source.extract_with(request, self.trust_forwarded_for)
    }
}

/// Adapts a closure into a [`KeyExtractor`].
pub struct FnExtractor<F>(F);

/// Build a [`KeyExtractor`] from a closure.
pub fn extractor_fn<F>(f: F) -> FnExtractor<F>
where
    F: Fn(&Request) -> Result<RateLimitKey> + Send + Sync,
{
    FnExtractor(f)
}

impl<F> KeyExtractor for FnExtractor<F>
where
    F: Fn(&Request) -> Result<RateLimitKey> + Send + Sync,
{
    fn extract(&self, request: &Request) -> Result<RateLimitKey> {
        (self.0)(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;

    fn request() -> Request {
        Request::builder().uri("/").body(Body::empty()).unwrap()
    }

    #[test]
    fn test_parse_key_sources() {
        assert_eq!("ip".parse::<KeySource>().unwrap(), KeySource::Ip);
        assert_eq!(
            "authenticated_id".parse::<KeySource>().unwrap(),
            KeySource::AuthenticatedId
        );
        assert_eq!(
            "header:X-Api-Key".parse::<KeySource>().unwrap(),
            KeySource::Header(HeaderName::from_static("x-api-key"))
        );
        assert!("header:".parse::<KeySource>().is_err());
        assert!("header:bad name".parse::<KeySource>().is_err());
        assert!("cookie".parse::<KeySource>().is_err());
    }

    #[test]
    fn test_key_source_from_yaml() {
        let source: KeySource = serde_yaml::from_str("header:x-api-key").unwrap();
        assert_eq!(source.to_string(), "header:x-api-key");

        assert!(serde_yaml::from_str::<KeySource>("nope").is_err());
    }

    #[test]
    fn test_extract_ip_from_connect_info() {
        let mut req = request();
        let addr: SocketAddr = "10.1.2.3:4567".parse().unwrap();
        req.extensions_mut().insert(ConnectInfo(addr));

        let key = KeySource::Ip.extract(&req).unwrap();
        assert_eq!(key.as_str(), "10.1.2.3");
    }

    #[test]
    fn test_forwarded_for_requires_trust() {
        let mut req = request();
        req.headers_mut()
            .insert(FORWARDED_FOR, "203.0.113.7, 10.0.0.1".parse().unwrap());

        assert!(KeySource::Ip.extract(&req).is_err());

        let trusting = ConfiguredExtractor::new(KeySource::Ip, true);
        assert_eq!(trusting.extract(&req).unwrap().as_str(), "203.0.113.7");
    }

    #[test]
    fn test_extract_header() {
        let source: KeySource = "header:x-api-key".parse().unwrap();

        let mut req = request();
        assert!(matches!(source.extract(&req), Err(TollgateError::InvalidKey(_))));

        req.headers_mut().insert("x-api-key", "key-123".parse().unwrap());
        assert_eq!(source.extract(&req).unwrap().as_str(), "key-123");

        req.headers_mut().insert("x-api-key", "".parse().unwrap());
        assert!(matches!(source.extract(&req), Err(TollgateError::InvalidKey(_))));
    }

    #[test]
    fn test_extract_authenticated_id() {
        let mut req = request();
        assert!(KeySource::AuthenticatedId.extract(&req).is_err());

        req.extensions_mut().insert(AuthenticatedId("user-7".to_string()));
        assert_eq!(
            KeySource::AuthenticatedId.extract(&req).unwrap().as_str(),
            "user-7"
        );
    }

    #[test]
    fn test_closure_extractor() {
        let extractor = extractor_fn(|req: &Request| RateLimitKey::new(req.uri().path()));
        assert_eq!(extractor.extract(&request()).unwrap().as_str(), "/");
    }
}
