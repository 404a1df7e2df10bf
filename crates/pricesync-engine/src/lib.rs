//! Real-time pricing synchronization engine.
//!
//! Keeps a local view of remotely authoritative prices in sync with the
//! pricing service while accepting optimistic local edits:
//! - `Engine`: single-writer actor owning state, subscriptions and observers
//! - `EngineHandle`: collaborator API over the engine's command queue
//! - `SyncTracker`: periodic REST push of aged pending edits with backoff
//! - `start`: wires the engine to a streaming `ConnectionManager`

pub mod config;
pub mod engine;
pub mod error;
pub mod handle;
pub mod sync;

pub use config::{EngineConfig, PersistenceConfig};
pub use engine::{Engine, EngineDeps, EngineLinks};
pub use error::{EngineError, EngineResult};
pub use handle::{EngineCommand, EngineHandle, EngineStatus};
pub use sync::SyncTracker;

use pricesync_ws::ConnectionManager;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Capacity of the connection event queue.
const EVENT_QUEUE_SIZE: usize = 1_024;

/// A running engine and its connection driver.
pub struct EngineRuntime {
    pub handle: EngineHandle,
    pub engine: JoinHandle<()>,
    pub connection: JoinHandle<()>,
}

/// Start the engine and its connection driver.
///
/// The driver runs until `EngineHandle::shutdown` (or dropping every handle)
/// stops the engine.
pub fn start(config: EngineConfig, deps: EngineDeps) -> EngineResult<EngineRuntime> {
    config.validate()?;

    let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE_SIZE);
    let (interest_tx, interest_rx) = watch::channel(Vec::new());
    let manager = Arc::new(ConnectionManager::new(
        config.connection_config(),
        deps.backend.clone(),
        interest_rx,
        event_tx,
        deps.clock.clone(),
    ));

    let shutdown = CancellationToken::new();
    let links = EngineLinks {
        events: event_rx,
        writer: manager.write_handle(),
        state: manager.state_receiver(),
        interest: interest_tx,
        shutdown: shutdown.clone(),
    };

    info!(ws_url = %config.ws_url, rest_url = %config.rest_url, "Starting engine");
    let engine = Engine::new(config, deps, links)?;
    let (handle, engine_task) = engine.spawn();

    let stopper = manager.clone();
    tokio::spawn(async move {
        shutdown.cancelled().await;
        stopper.disconnect();
    });

    let connection = tokio::spawn(async move {
        if let Err(e) = manager.connect().await {
            error!(?e, "Connection driver exited with error");
        }
    });

    Ok(EngineRuntime {
        handle,
        engine: engine_task,
        connection,
    })
}
