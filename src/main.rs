use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use tollgate::config::{StoreBackend, TollgateConfig};
use tollgate::http::HttpServer;
use tollgate::ratelimit::{
    register_tokens, CountingStore, MemoryStore, RateLimitStore, RateLimiter, RedisStore,
};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

/// HTTP request-admission guard with sliding-window rate limiting.
///
/// Settings not given in the config file can be set through `TOLLGATE_*`
/// environment variables, e.g. `TOLLGATE_LIMITER__IP_MAX_REQUESTS=20`.
#[derive(Parser, Debug)]
#[command(name = "tollgate", version)]
struct Args {
    /// Configuration file (YAML, TOML or JSON)
    #[arg(short, long, value_name = "FILE", env = "TOLLGATE_CONFIG")]
    config: Option<PathBuf>,

    /// Log level, used when RUST_LOG is not set
    #[arg(long, default_value = "info", env = "TOLLGATE_LOG_LEVEL")]
    log_level: String,

    #[arg(long, value_enum, default_value = "text", env = "TOLLGATE_LOG_FORMAT")]
    log_format: LogFormat,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);
    match args.log_format {
        LogFormat::Text => subscriber.init(),
        LogFormat::Json => subscriber.json().init(),
    }

    info!("Starting Tollgate admission guard");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = TollgateConfig::load(args.config.as_deref())?;
    info!(
        listen_addr = %config.server.listen_addr,
        backend = ?config.store.backend,
        ip_max_requests = config.limiter.ip_max_requests,
        lock_duration_secs = config.limiter.lock_duration_secs,
        block_duration_secs = config.limiter.block_duration_secs,
        "Configuration loaded"
    );

    let backend: Arc<dyn CountingStore> = match config.store.backend {
        StoreBackend::Redis => Arc::new(RedisStore::connect(&config.store.redis_url).await?),
        StoreBackend::Memory => Arc::new(MemoryStore::new()),
    };
    let store = RateLimitStore::new(backend);

    // Running with a partial set of token limits is worse than not starting
    register_tokens(&store, &config.tokens).await?;

    let rate_limiter = Arc::new(RateLimiter::new(store, config.limiter.clone())?);
    info!("Rate limiter initialized");

    let server = HttpServer::new(
        config.server.listen_addr,
        rate_limiter,
        &config.server.token_header,
    )?;

    // Run the server with graceful shutdown on Ctrl+C
    server.serve_with_shutdown(shutdown_signal()).await?;

    info!("Tollgate admission guard stopped");
    Ok(())
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
