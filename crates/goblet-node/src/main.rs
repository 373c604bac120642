//! Goblet - read-through caching proxy for Git Smart-HTTP v2.
//!
//! ## Configuration
//!
//! Flags override environment variables, which override the config file:
//!
//! - `GOBLET_PORT` / `GOBLET_ADDR` - HTTP listen address (default: 0.0.0.0:8080)
//! - `GOBLET_CACHE_ROOT` - mirror storage root (default: ./cache)
//! - `GOBLET_FRESHNESS_WINDOW` - freshness window in seconds (default: 300)
//! - `GOBLET_UPSTREAM_TIMEOUT` - upstream call timeout in seconds (default: 60)
//! - `GOBLET_REQUEST_TIMEOUT` - total per-request deadline in seconds (default: 300)
//! - `GOBLET_LOG_LEVEL` / `GOBLET_LOG_FORMAT` - logging (default: info, json)

use clap::Parser;
use goblet_mirror::MirrorStore;
use goblet_node::api::{create_router, AppState};
use goblet_node::auth::PassthroughAuthenticator;
use goblet_node::canonical::HostPathCanonicalizer;
use goblet_node::config::NodeConfig;
use goblet_node::events::{EventBus, LogSink};
use goblet_node::freshness::FreshnessPolicy;
use goblet_node::health::HealthState;
use goblet_node::observability::{init_logging, LogFormat, MetricsSink};
use goblet_node::proxy::ProxyCore;
use goblet_upstream::HttpUpstream;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

/// Goblet - caching Git proxy
#[derive(Parser, Debug)]
#[command(name = "goblet")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "goblet.toml")]
    config: PathBuf,

    /// Listen port (overrides config file and env)
    #[arg(long)]
    port: Option<u16>,

    /// Listen address
    #[arg(long)]
    addr: Option<SocketAddr>,

    /// Cache root directory
    #[arg(long)]
    cache_root: Option<PathBuf>,

    /// Upstream call timeout in seconds
    #[arg(long)]
    upstream_timeout: Option<u64>,

    /// Freshness window in seconds
    #[arg(long)]
    freshness_window: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,

    /// Log format (json, pretty)
    #[arg(long)]
    log_format: Option<String>,

    /// Run in local development mode (pretty logging)
    #[arg(long)]
    local: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = if args.config.exists() {
        NodeConfig::from_file(&args.config).unwrap_or_else(|e| {
            eprintln!("Warning: failed to load config file: {}. Using defaults.", e);
            NodeConfig::default()
        })
    } else {
        NodeConfig::default()
    };

    if let Err(e) = config.merge_env() {
        eprintln!("Warning: failed to merge environment config: {}", e);
    }

    if let Some(port) = args.port {
        config.server.addr.set_port(port);
    }
    if let Some(addr) = args.addr {
        config.server.addr = addr;
    }
    if let Some(root) = args.cache_root {
        config.cache.root = root;
    }
    if let Some(secs) = args.upstream_timeout {
        config.upstream.timeout_secs = secs;
    }
    if let Some(secs) = args.freshness_window {
        config.cache.freshness_window_secs = secs;
    }
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }
    if let Some(format) = args.log_format {
        config.logging.format = format;
    }
    if args.local {
        config.logging.format = "pretty".to_string();
    }

    if let Err(e) = config.validate_config() {
        eprintln!("Configuration error: {}", e);
        std::process::exit(1);
    }

    init_logging(&config.logging.level, LogFormat::parse(&config.logging.format));

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        addr = %config.server.addr,
        cache_root = %config.cache.root.display(),
        freshness_window_secs = config.cache.freshness_window_secs,
        "Starting goblet"
    );

    let health = HealthState::new();

    let mirrors = match MirrorStore::open(&config.cache.root) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            tracing::error!(root = %config.cache.root.display(), error = %e, "Cache root inaccessible");
            std::process::exit(1);
        }
    };

    let upstream = Arc::new(HttpUpstream::new(config.upstream_timeout())?);
    let events = EventBus::new(1024, vec![Arc::new(LogSink), Arc::new(MetricsSink)]);
    tokio::spawn(events.clone().run());

    let core = ProxyCore::new(
        mirrors.clone(),
        upstream,
        FreshnessPolicy::new(config.freshness_window()),
        events,
    )
    .with_request_timeout(config.request_timeout());
    core.set_upstream_enabled(config.upstream.enabled);

    let state = AppState {
        core: Arc::new(core),
        auth: Arc::new(PassthroughAuthenticator),
        canonicalizer: Arc::new(HostPathCanonicalizer),
        health: health.clone(),
    };
    let app = create_router(state);

    let listener = match tokio::net::TcpListener::bind(&config.server.addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(addr = %config.server.addr, error = %e, "Failed to bind");
            std::process::exit(1);
        }
    };

    health.set_ready(true);
    tracing::info!(addr = %config.server.addr, "HTTP server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Wait out any in-flight mirror updates before exiting, so a pack
    // install or ref update is never cut off mid-write.
    mirrors.drain().await;

    tracing::info!(mirrors = mirrors.len(), "Goblet stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install CTRL+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received, draining");
}
