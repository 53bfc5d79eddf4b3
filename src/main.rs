use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use tollgate::config::{LogFormat, LoggingConfig, StoreConfig, TollgateConfig};
use tollgate::http::{HttpServer, RateLimitState};
use tollgate::ratelimit::RateLimiter;
use tollgate::store::{CounterStore, MemoryStore, RedisStore};

/// Rate limiting HTTP service.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// Path to a YAML configuration file
    #[arg(short, long, env = "TOLLGATE_CONFIG")]
    config: Option<PathBuf>,

    /// Override the HTTP listen address
    #[arg(short, long)]
    listen: Option<SocketAddr>,

    /// Override the log output format
    #[arg(long, value_enum)]
    log_format: Option<LogFormat>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = TollgateConfig::load(args.config.as_deref())?;
    if let Some(addr) = args.listen {
        config.server.http_addr = addr;
    }
    if let Some(format) = args.log_format {
        config.logging.format = format;
    }

    init_tracing(&config.logging);

    info!("Starting Tollgate Rate Limiting Service");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!(http_addr = %config.server.http_addr, "Configuration loaded");

    let limiting = &config.rate_limiting;
    let store = build_store(&limiting.store).await?;

    let rules = limiting.route_rules()?;
    info!(
        default_policy = %rules.default_policy().policy.description(),
        rules = rules.len(),
        fail_mode = ?limiting.fail_mode,
        key_source = %limiting.key_source,
        "Rate limiter initialized"
    );

    let limiter = Arc::new(RateLimiter::new(store, limiting.limiter_settings()));
    let state = RateLimitState::new(limiter, Arc::new(rules), Arc::new(limiting.extractor()));

    let server = HttpServer::new(config.server.http_addr, state);

    server.serve_with_shutdown(shutdown_signal()).await?;

    info!("Tollgate Rate Limiting Service stopped");
    Ok(())
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);

    match logging.format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

async fn build_store(config: &StoreConfig) -> anyhow::Result<Arc<dyn CounterStore>> {
    match config {
        StoreConfig::Memory {
            sweep_interval_secs,
        } => {
            let store = Arc::new(MemoryStore::new());
            store.spawn_sweeper(Duration::from_secs(*sweep_interval_secs));
            info!(sweep_interval_secs = *sweep_interval_secs, "Using in-memory counter store");
            Ok(store as Arc<dyn CounterStore>)
        }
        StoreConfig::Redis { url, prefix } => {
            let store = RedisStore::connect_with_prefix(url, prefix.clone()).await?;
            info!(prefix = %store.prefix(), "Connected to Redis counter store");
            Ok(Arc::new(store))
        }
    }
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
