//! RelayGate daemon
//!
//! Loads the service tables, builds the gateway components, starts the
//! maintenance tasks and serves the observability endpoints until SIGINT.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use relaygate::clock::{SharedClock, SystemClock};
use relaygate::config::{RelayConfig, ResolvedConfig};
use relaygate::{server, CacheStore, Gateway, Maintenance, RateLimiter};

// =============================================================================
// CLI Arguments
// =============================================================================

/// RelayGate - resilience layer for third-party data providers
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// YAML configuration file; built-in tables are used when absent
    #[arg(long, env = "RELAYGATE_CONFIG")]
    config: Option<PathBuf>,

    /// Observability server bind address
    #[arg(long, env = "RELAYGATE_LISTEN", default_value = "0.0.0.0:8080")]
    listen: SocketAddr,

    /// Redis URL; overrides `backend.redis_url` from the config file
    #[arg(long, env = "REDIS_URL")]
    redis_url: Option<String>,

    /// Validate the configuration and exit
    #[arg(long)]
    check: bool,

    /// Print the configuration JSON schema and exit
    #[arg(long)]
    print_schema: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if args.print_schema {
        println!("{}", RelayConfig::json_schema()?);
        return Ok(());
    }

    init_logging(&args);

    let mut raw = match &args.config {
        Some(path) => RelayConfig::from_path(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => RelayConfig::builtin(),
    };
    if let Some(url) = &args.redis_url {
        raw.backend.redis_url = Some(url.clone());
    }
    let config = raw.resolve().context("invalid configuration")?;

    if args.check {
        info!(services = config.services.len(), "Configuration is valid");
        return Ok(());
    }

    info!("Starting RelayGate {}", relaygate::version());
    info!("  Services: {}", config.services.len());
    info!("  Cached services: {}", config.cache_tables().len());
    info!("  Listen address: {}", args.listen);

    let clock: SharedClock = Arc::new(SystemClock);
    let (cache, limiter) = build_stores(&config, clock.clone()).await?;
    let gateway = Arc::new(Gateway::from_parts(&config, cache, limiter, clock));

    let token = CancellationToken::new();
    let maintenance = Maintenance::new(Arc::clone(&gateway), config.maintenance.clone());
    let mut handles = maintenance.spawn(token.clone());

    let server_token = token.clone();
    let server_gateway = Arc::clone(&gateway);
    let addr = args.listen;
    handles.push(tokio::spawn(async move {
        if let Err(e) = server::serve(addr, server_gateway, server_token).await {
            error!("Observability server error: {}", e);
        }
    }));

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("Shutdown requested");
    token.cancel();

    for handle in handles {
        if let Err(e) = handle.await {
            warn!("Task ended abnormally: {}", e);
        }
    }

    info!("RelayGate shutdown complete");
    Ok(())
}

/// Pick the cache and counter backends by whether a Redis URL is configured
async fn build_stores(
    config: &ResolvedConfig,
    clock: SharedClock,
) -> anyhow::Result<(CacheStore, RateLimiter)> {
    if let Some(url) = &config.backend.redis_url {
        #[cfg(feature = "redis")]
        {
            use relaygate::cache::{AdaptiveStrategy, RedisBackend};
            use relaygate::ratelimit::RedisCounterStore;

            let backend = RedisBackend::connect(url)
                .await
                .context("connecting cache backend")?;
            let counters = RedisCounterStore::connect(url)
                .await
                .context("connecting rate limit counters")?;
            let ttls = config
                .cache_tables()
                .iter()
                .map(|(name, table)| (name.clone(), table.ttl_seconds))
                .collect();

            info!("  Backend: redis");
            let cache = CacheStore::new(
                config.cache_tables(),
                Arc::new(backend),
                &config.backend,
                clock.clone(),
            )
            .with_adaptive(Arc::new(AdaptiveStrategy::new(ttls)));
            let limiter = RateLimiter::from_config(config, Arc::new(counters), clock);
            return Ok((cache, limiter));
        }

        #[cfg(not(feature = "redis"))]
        warn!(
            url = %url,
            "Redis URL configured but built without the `redis` feature, using in-memory backends"
        );
    }

    info!("  Backend: memory");
    let cache = CacheStore::in_memory(config.cache_tables(), &config.backend, clock.clone());
    let limiter = RateLimiter::from_config(
        config,
        Arc::new(relaygate::ratelimit::InMemoryCounterStore::new()),
        clock,
    );
    Ok((cache, limiter))
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["hyper=warn", "redis=info"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}
