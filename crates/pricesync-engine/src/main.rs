//! pricesync - Real-time pricing synchronization engine
//!
//! Streams prices for the configured ids, logs every confirmed change and
//! conflict, and flushes state on Ctrl-C.

use anyhow::Result;
use clap::Parser;
use pricesync_core::SystemClock;
use pricesync_engine::{EngineConfig, EngineDeps};
use pricesync_persistence::{JsonFileStore, MemoryStore, PersistenceStore};
use pricesync_rest::{HttpPricingClient, PricingBackend};
use pricesync_telemetry::Metrics;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Real-time pricing synchronization engine
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Configuration file path (can also be set via PRICESYNC_CONFIG env var)
    #[arg(short, long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize TLS crypto provider (must be before any WS connections)
    pricesync_ws::init_crypto();

    let args = Args::parse();

    pricesync_telemetry::init_logging()?;

    info!("Starting pricesync v{}", env!("CARGO_PKG_VERSION"));

    // CLI arg > PRICESYNC_CONFIG > built-in defaults
    let config_path = args
        .config
        .or_else(|| std::env::var("PRICESYNC_CONFIG").ok());
    let config = match config_path {
        Some(path) => {
            info!(config_path = %path, "Loading configuration");
            EngineConfig::from_file(&path)?
        }
        None => {
            warn!("No configuration file given, using defaults");
            EngineConfig::default()
        }
    };
    info!(
        ws_url = %config.ws_url,
        strategy = %config.conflict_strategy,
        "Configuration loaded"
    );

    let store: Arc<dyn PersistenceStore> = match &config.persistence.path {
        Some(path) => Arc::new(JsonFileStore::new(path)),
        None => {
            info!("No persistence path configured, state is memory-only");
            Arc::new(MemoryStore::new())
        }
    };
    let backend: Arc<dyn PricingBackend> = Arc::new(HttpPricingClient::new(config.rest_url.clone())?);
    let deps = EngineDeps {
        store,
        backend,
        clock: SystemClock::shared(),
    };

    let watch_ids = config.watch_ids.clone();
    let runtime = pricesync_engine::start(config, deps)?;
    let handle = runtime.handle.clone();

    for id in &watch_ids {
        handle
            .watch(id.clone(), |entity| {
                info!(
                    id = %entity.id,
                    price = %entity.price,
                    version = entity.version,
                    origin = %entity.origin,
                    "Price confirmed"
                );
            })
            .await?;
    }
    handle
        .watch_conflicts(|notice| {
            warn!(
                id = %notice.ticket.id,
                seq = notice.ticket.seq,
                local = %notice.local_edit.proposed_price,
                remote = %notice.remote_update.price,
                "Conflict awaiting decision"
            );
        })
        .await?;
    handle.subscribe(watch_ids.iter().cloned()).await?;
    info!(count = watch_ids.len(), "Subscribed to configured ids");

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    let status = handle.status().await?;
    info!(
        connection = %status.connection,
        pending_edits = status.pending_edits,
        pending_conflicts = status.pending_conflicts,
        persistence_healthy = status.persistence_healthy,
        updates_per_sec = status.metrics.updates_per_sec,
        avg_latency_ms = status.metrics.avg_latency_ms,
        "Final status"
    );

    handle.shutdown().await?;
    if let Err(e) = runtime.connection.await {
        warn!(?e, "Connection task ended abnormally");
    }
    if let Err(e) = runtime.engine.await {
        warn!(?e, "Engine task ended abnormally");
    }

    match Metrics::encode_text() {
        Ok(text) => debug!(metrics = %text, "Prometheus metrics at exit"),
        Err(e) => warn!(error = %e, "Failed to render metrics"),
    }

    Ok(())
}
