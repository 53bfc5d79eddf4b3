//! Configuration management for Tollgate.
//!
//! Configuration is read from an optional YAML file and then overridden by
//! environment variables prefixed with `TOLLGATE__`, using `__` between
//! nested keys (e.g. `TOLLGATE__SERVER__HTTP_ADDR=0.0.0.0:8080`).

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Result, TollgateError};
use crate::http::{ConfiguredExtractor, KeySource};
use crate::ratelimit::{FailMode, LimiterSettings, PolicyConfig, RouteRules, RuleConfig};

/// Environment variable prefix for overrides.
const ENV_PREFIX: &str = "TOLLGATE";

/// Main configuration for the Tollgate service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TollgateConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_http_addr")]
    pub http_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: default_http_addr(),
        }
    }
}

fn default_http_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable lines
    #[default]
    Text,
    /// One JSON object per line
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Counter store backend selection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum StoreConfig {
    /// In-process store
    Memory {
        /// Interval between expired-entry sweeps, in seconds
        #[serde(default = "default_sweep_interval")]
        sweep_interval_secs: u64,
    },
    /// Shared Redis store
    Redis {
        /// Connection URL
        url: String,
        /// Prefix for every key
        #[serde(default = "default_redis_prefix")]
        prefix: String,
    },
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig::Memory {
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

fn default_sweep_interval() -> u64 {
    30
}

fn default_redis_prefix() -> String {
    crate::store::DEFAULT_REDIS_PREFIX.to_string()
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Policy applied to paths no rule matches
    #[serde(default)]
    pub policy: PolicyConfig,

    /// Behaviour when the store is unavailable
    #[serde(default)]
    pub fail_mode: FailMode,

    /// Where the caller key comes from
    #[serde(default)]
    pub key_source: KeySource,

    /// Let the `ip` key source fall back to `X-Forwarded-For`
    #[serde(default)]
    pub trust_forwarded_for: bool,

    /// Store round trip timeout in milliseconds
    #[serde(default = "default_store_timeout")]
    pub store_timeout_ms: u64,

    /// Compare-and-swap attempts for token bucket updates
    #[serde(default = "default_max_swap_attempts")]
    pub max_swap_attempts: u32,

    /// Counter store backend
    #[serde(default)]
    pub store: StoreConfig,

    /// Per-path rules
    #[serde(default)]
    pub rules: Vec<RuleConfig>,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            policy: PolicyConfig::default(),
            fail_mode: FailMode::default(),
            key_source: KeySource::default(),
            trust_forwarded_for: false,
            store_timeout_ms: default_store_timeout(),
            max_swap_attempts: default_max_swap_attempts(),
            store: StoreConfig::default(),
            rules: Vec::new(),
        }
    }
}

fn default_store_timeout() -> u64 {
    100
}

fn default_max_swap_attempts() -> u32 {
    16
}

impl RateLimitingConfig {
    /// Settings for the limiter façade.
    pub fn limiter_settings(&self) -> LimiterSettings {
        LimiterSettings {
            fail_mode: self.fail_mode,
            store_timeout: Duration::from_millis(self.store_timeout_ms),
            max_swap_attempts: self.max_swap_attempts,
        }
    }

    /// Compile the default policy and the rules.
    pub fn route_rules(&self) -> Result<RouteRules> {
        RouteRules::from_config(&self.policy, &self.rules)
    }

    /// The key extractor described by `key_source`.
    pub fn extractor(&self) -> ConfiguredExtractor {
        ConfiguredExtractor::new(self.key_source.clone(), self.trust_forwarded_for)
    }
}

impl TollgateConfig {
    /// Load configuration from an optional YAML file plus environment
    /// overrides, then validate it.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            info!(path = %path.display(), "Loading configuration file");
            builder = builder.add_source(config::File::from(path).format(config::FileFormat::Yaml));
        }

        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        );

        let config: TollgateConfig = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| TollgateError::config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Parse and validate configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: TollgateConfig = serde_yaml::from_str(yaml)
            .map_err(|e| TollgateError::config(format!("Failed to parse configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Check that policies and rules are usable.
    pub fn validate(&self) -> Result<()> {
        let limiting = &self.rate_limiting;

        limiting.route_rules()?;

        if limiting.store_timeout_ms == 0 {
            return Err(TollgateError::config("store_timeout_ms must be greater than 0"));
        }
        if limiting.max_swap_attempts == 0 {
            return Err(TollgateError::config("max_swap_attempts must be greater than 0"));
        }
        match &limiting.store {
            StoreConfig::Memory {
                sweep_interval_secs,
            } if *sweep_interval_secs == 0 => {
                return Err(TollgateError::config("sweep_interval_secs must be greater than 0"));
            }
            StoreConfig::Redis { url, .. } if url.trim().is_empty() => {
                return Err(TollgateError::config("redis store needs a url"));
            }
            _ => {}
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = TollgateConfig::default();
        assert_eq!(config.server.http_addr, "127.0.0.1:8080".parse().unwrap());
        assert_eq!(config.logging.format, LogFormat::Text);
        assert_eq!(config.rate_limiting.fail_mode, FailMode::Open);
        assert_eq!(config.rate_limiting.key_source, KeySource::Ip);
        assert_eq!(
            config.rate_limiting.limiter_settings().store_timeout,
            Duration::from_millis(100)
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_full_config() {
        let yaml = r#"
server:
  http_addr: 0.0.0.0:9000
logging:
  level: debug
  format: json
rate_limiting:
  policy:
    algorithm: token_bucket
    capacity: 5
    refill_rate_per_second: 1.0
  fail_mode: closed
  key_source: header:x-api-key
  store_timeout_ms: 50
  store:
    backend: redis
    url: redis://127.0.0.1:6379
  rules:
    - name: login
      path_prefix: /login
      policy: { algorithm: fixed_window, limit: 5, window_seconds: 60 }
"#;
        let config = TollgateConfig::from_yaml(yaml).unwrap();

        assert_eq!(config.server.http_addr.port(), 9000);
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.rate_limiting.fail_mode, FailMode::Closed);
        assert_eq!(config.rate_limiting.key_source.to_string(), "header:x-api-key");
        assert_eq!(
            config.rate_limiting.store,
            StoreConfig::Redis {
                url: "redis://127.0.0.1:6379".to_string(),
                prefix: "tollgate".to_string(),
            }
        );

        let rules = config.rate_limiting.route_rules().unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules.default_policy().policy.limit(), 5);
    }

    #[test]
    fn test_invalid_configs_rejected() {
        let cases = [
            "rate_limiting: { key_source: cookie }",
            "rate_limiting: { fail_mode: sideways }",
            "rate_limiting: { policy: { algorithm: fixed_window, limit: 0, window_seconds: 60 } }",
            "rate_limiting: { store_timeout_ms: 0 }",
            "rate_limiting: { store: { backend: memory, sweep_interval_secs: 0 } }",
            "rate_limiting: { store: { backend: redis, url: '' } }",
        ];

        for yaml in cases {
            assert!(
                matches!(TollgateConfig::from_yaml(yaml), Err(TollgateError::Config(_))),
                "should reject: {}",
                yaml
            );
        }
    }

    #[test]
    fn test_load_from_file() {
        let path = std::env::temp_dir().join(format!("tollgate-config-{}.yaml", std::process::id()));
        {
            let mut file = std::fs::File::create(&path).unwrap();
            writeln!(
                file,
                "rate_limiting:\n  policy:\n    algorithm: fixed_window\n    limit: 7\n    window_seconds: 10\n  fail_mode: closed"
            )
            .unwrap();
        }

        let config = TollgateConfig::load(Some(&path)).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(config.rate_limiting.fail_mode, FailMode::Closed);
        assert_eq!(
            config.rate_limiting.policy,
            PolicyConfig::FixedWindow {
                limit: 7,
                window_seconds: 10
            }
        );
    }

    #[test]
    fn test_load_missing_file_fails() {
        let result = TollgateConfig::load(Some(Path::new("/nonexistent/tollgate.yaml")));
        assert!(matches!(result, Err(TollgateError::Config(_))));
    }
}
