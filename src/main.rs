//! kv-blend-cache admin server.
//!
//! Registers one cache engine from the configuration and exposes its
//! statistics, prefix lookups and Prometheus metrics over HTTP.

use std::sync::Arc;
use std::time::Instant;

use candle_core::DType;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;

use kv_blend_cache::cache::{CacheEngineRegistry, KvLayout};
use kv_blend_cache::config::{Cli, EngineConfig, EngineMetadata};
use kv_blend_cache::server::api::{build_router, AppState};
use kv_blend_cache::server::metrics::ServerMetrics;
use kv_blend_cache::usage::{UsageTracker, DEFAULT_INTERVAL};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments.
    let cli = Cli::parse();

    // Initialize tracing/logging.
    let filter = if cli.verbose {
        "kv_blend_cache=debug,tower_http=debug"
    } else {
        "kv_blend_cache=info,tower_http=info"
    };

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| filter.into());
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true);
    if cli.log_json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    info!("kv-blend-cache v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration.
    let config = EngineConfig::load(&cli.config)?;
    let fmt: KvLayout = cli.format.parse()?;
    let metadata = EngineMetadata::new(
        cli.model_name.clone(),
        cli.world_size,
        cli.worker_id,
        fmt,
        DType::BF16,
        Vec::new(),
    );

    info!(
        chunk_size = config.chunk_size,
        local_cpu = config.local_cpu,
        local_disk = ?config.local_disk,
        enable_blending = config.enable_blending,
        "Configuration loaded"
    );

    // Register the engine served by this process.
    let registry = Arc::new(CacheEngineRegistry::new());
    registry.get_or_create(&cli.instance_id, config.clone(), metadata.clone())?;

    let tracker = cli
        .usage_log
        .clone()
        .map(|path| UsageTracker::spawn(&config, &metadata, path, DEFAULT_INTERVAL));

    // Build application state.
    let state = Arc::new(AppState {
        registry: registry.clone(),
        instance_id: cli.instance_id.clone(),
        metrics: ServerMetrics::new()?,
        start_time: Instant::now(),
    });

    // Build the HTTP router.
    let app = build_router(state);

    // Start the server.
    let listen_addr = cli.listen;
    info!(addr = listen_addr, "Starting server");

    let listener = TcpListener::bind(&listen_addr).await?;
    info!("Listening on {listen_addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
        })
        .await?;

    if let Some(tracker) = tracker {
        tracker.shutdown().await;
    }
    registry.destroy(&cli.instance_id)?;

    Ok(())
}
