//! Engine actor.
//!
//! One task owns the price state, subscriptions, observers and persistence
//! handle. Collaborator commands, connection events, sync push results and
//! timers are all handled here, one at a time. Snapshot writes run on the
//! blocking pool, one at a time, and report back like sync pushes do.

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::handle::{EngineCommand, EngineHandle, EngineStatus};
use crate::sync::SyncTracker;
use pricesync_core::{EntityId, PendingEdit, SharedClock};
use pricesync_feed::{
    ConflictOutcome, ObserverRegistry, PriceState, StateEffect, UpdateIngestion,
};
use pricesync_persistence::{PersistenceResult, PersistenceStore};
use pricesync_rest::{PricingBackend, RestResult, SyncAck};
use pricesync_telemetry::{Metrics, SyncMetrics};
use pricesync_ws::{
    ConnectionEvent, ConnectionState, OutboundMessage, SendError, SubscriptionRegistry,
    WsWriteHandle,
};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Entity eviction and gauge refresh period.
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(60);

/// Capacity of the sync result channel. One push is in flight at a time.
const SYNC_RESULT_QUEUE_SIZE: usize = 4;

/// Shared services the engine talks to.
#[derive(Clone)]
pub struct EngineDeps {
    pub store: Arc<dyn PersistenceStore>,
    pub backend: Arc<dyn PricingBackend>,
    pub clock: SharedClock,
}

/// Channels connecting the engine to the connection manager.
pub struct EngineLinks {
    pub events: mpsc::Receiver<ConnectionEvent>,
    pub writer: WsWriteHandle,
    pub state: watch::Receiver<ConnectionState>,
    /// Interest set read by the polling fallback.
    pub interest: watch::Sender<Vec<EntityId>>,
    /// Cancelled on shutdown; the connection driver stops on it.
    pub shutdown: CancellationToken,
}

/// Result of one spawned sync push.
struct SyncOutcome {
    edits: Vec<PendingEdit>,
    result: RestResult<SyncAck>,
}

pub struct Engine {
    config: EngineConfig,
    state: PriceState,
    subscriptions: SubscriptionRegistry,
    observers: ObserverRegistry,
    ingestion: UpdateIngestion,
    metrics: SyncMetrics,
    sync: SyncTracker,

    store: Arc<dyn PersistenceStore>,
    backend: Arc<dyn PricingBackend>,
    clock: SharedClock,

    events: mpsc::Receiver<ConnectionEvent>,
    writer: WsWriteHandle,
    connection: watch::Receiver<ConnectionState>,
    interest: watch::Sender<Vec<EntityId>>,
    shutdown_token: CancellationToken,

    sync_tx: mpsc::Sender<SyncOutcome>,
    sync_rx: mpsc::Receiver<SyncOutcome>,
    save_tx: mpsc::Sender<PersistenceResult<()>>,
    save_rx: mpsc::Receiver<PersistenceResult<()>>,
    save_in_flight: bool,

    /// Confirmed state changed since the last save.
    dirty: bool,
    persistence_healthy: bool,
    /// Set after the first `Connecting`; later ones are reconnects.
    seen_connecting: bool,
    /// Between `Opened` and the next state change away from `Connected`.
    /// Subscriptions made before `Opened` go out with the replay.
    stream_open: bool,
}

impl Engine {
    /// Build the engine and restore the last snapshot.
    ///
    /// Fails only on configuration errors. An unreadable snapshot starts the
    /// engine empty and memory-only.
    pub fn new(config: EngineConfig, deps: EngineDeps, links: EngineLinks) -> EngineResult<Self> {
        config.validate()?;
        let strategy = config.strategy()?;

        let mut state = PriceState::new(strategy)
            .with_history_limit(config.conflict_history_limit)
            .with_queue_limit(config.conflict_queue_limit);
        let mut metrics = SyncMetrics::new(deps.clock.clone());
        let mut persistence_healthy = true;

        match deps.store.load() {
            Ok(Some(mut snapshot)) => {
                let now = deps.clock.now_ms();
                let dropped = snapshot.drop_expired(now, retention_ms(&config));
                if dropped > 0 {
                    info!(dropped, "Dropped expired entities from snapshot");
                }
                state.restore(snapshot);
            }
            Ok(None) => {
                info!(store = %deps.store.describe(), "No snapshot, starting empty");
            }
            Err(e) => {
                warn!(
                    error = %e,
                    store = %deps.store.describe(),
                    "Snapshot load failed, starting empty in memory-only mode"
                );
                persistence_healthy = false;
                metrics.record_persistence_failure();
                Metrics::persistence_failure("load");
            }
        }

        info!(
            %strategy,
            entities = state.entity_count(),
            pending = state.pending_count(),
            "Engine initialized"
        );

        let sync = SyncTracker::new(
            config.sync_interval_ms,
            config.sync_edit_age_threshold_ms,
            config.sync_max_backoff_ms,
        );
        let (sync_tx, sync_rx) = mpsc::channel(SYNC_RESULT_QUEUE_SIZE);
        let (save_tx, save_rx) = mpsc::channel(1);

        Ok(Self {
            config,
            state,
            subscriptions: SubscriptionRegistry::new(),
            observers: ObserverRegistry::new(),
            ingestion: UpdateIngestion::new(),
            metrics,
            sync,
            store: deps.store,
            backend: deps.backend,
            clock: deps.clock,
            events: links.events,
            writer: links.writer,
            connection: links.state,
            interest: links.interest,
            shutdown_token: links.shutdown,
            sync_tx,
            sync_rx,
            save_tx,
            save_rx,
            save_in_flight: false,
            dirty: false,
            persistence_healthy,
            seen_connecting: false,
            stream_open: false,
        })
    }

    /// Spawn the engine task.
    pub fn spawn(self) -> (EngineHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(self.config.command_queue_size);
        let handle = EngineHandle::new(tx, self.connection.clone());
        let task = tokio::spawn(self.run(rx));
        (handle, task)
    }

    async fn run(mut self, mut commands: mpsc::Receiver<EngineCommand>) {
        let sync_period = Duration::from_millis(self.config.sync_interval_ms);
        let mut sync_tick = interval_at(Instant::now() + sync_period, sync_period);
        sync_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut maintenance = interval_at(Instant::now() + MAINTENANCE_INTERVAL, MAINTENANCE_INTERVAL);
        maintenance.set_missed_tick_behavior(MissedTickBehavior::Delay);

        self.publish_interest();
        info!("Entering engine loop");

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(EngineCommand::Shutdown { reply }) => {
                        self.shutdown().await;
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command),
                    None => {
                        info!("All engine handles dropped");
                        self.shutdown().await;
                        break;
                    }
                },

                Some(event) = self.events.recv() => self.handle_event(event),

                Some(outcome) = self.sync_rx.recv() => self.handle_sync_outcome(outcome),

                Some(result) = self.save_rx.recv() => self.handle_save_result(result),

                _ = sync_tick.tick() => {
                    self.start_sync(false);
                }

                _ = maintenance.tick() => self.maintain(),
            }

            self.flush();
        }

        info!("Engine stopped");
    }

    // ------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------

    fn handle_command(&mut self, command: EngineCommand) {
        debug!(kind = command.kind(), "Engine command");
        match command {
            EngineCommand::Subscribe { ids, reply } => {
                for id in &ids {
                    if let Some(msg) = self.subscriptions.subscribe(id) {
                        self.send_on_stream(msg);
                    }
                }
                self.publish_interest();
                let _ = reply.send(());
            }
            EngineCommand::Unsubscribe { ids, reply } => {
                for id in &ids {
                    if let Some(msg) = self.subscriptions.unsubscribe(id) {
                        self.send_on_stream(msg);
                    }
                }
                self.publish_interest();
                let _ = reply.send(());
            }
            EngineCommand::ProposeLocalPrice { id, price, reply } => {
                let now = self.clock.now_ms();
                let result = match self.state.apply_local(&id, price, now) {
                    Ok((edit, effects)) => {
                        self.execute(effects);
                        Ok(edit)
                    }
                    Err(e) => {
                        warn!(id = %id, error = %e, "Local price rejected");
                        Err(EngineError::from(e))
                    }
                };
                let _ = reply.send(result);
            }
            EngineCommand::Watch { id, callback, reply } => {
                let _ = reply.send(self.observers.watch(&id, callback));
            }
            EngineCommand::Unwatch { id, watch_id, reply } => {
                let _ = reply.send(self.observers.unwatch(&id, watch_id));
            }
            EngineCommand::WatchConflicts { callback, reply } => {
                let _ = reply.send(self.observers.watch_conflicts(callback));
            }
            EngineCommand::UnwatchConflicts { watch_id, reply } => {
                let _ = reply.send(self.observers.unwatch_conflicts(watch_id));
            }
            EngineCommand::ResolveConflict {
                ticket,
                decision,
                reply,
            } => {
                let now = self.clock.now_ms();
                let result = match self.state.resolve_conflict(&ticket, decision, now) {
                    Ok(effects) => {
                        self.execute(effects);
                        Ok(())
                    }
                    Err(e) => {
                        warn!(id = %ticket.id, seq = ticket.seq, error = %e, "Conflict resolution refused");
                        Err(EngineError::from(e))
                    }
                };
                if let Some(reply) = reply {
                    let _ = reply.send(result);
                }
            }
            EngineCommand::GetCurrent { id, reply } => {
                let _ = reply.send(self.state.get_current(&id));
            }
            EngineCommand::ForceSync { reply } => {
                let _ = reply.send(self.start_sync(true));
            }
            EngineCommand::Status { reply } => {
                let _ = reply.send(self.status());
            }
            EngineCommand::RecentConflicts { reply } => {
                let _ = reply.send(self.state.recent_conflicts());
            }
            EngineCommand::Shutdown { reply } => {
                // Handled by the run loop
                let _ = reply.send(());
            }
        }
    }

    fn status(&self) -> EngineStatus {
        EngineStatus {
            connection: *self.connection.borrow(),
            pending_edits: self.state.pending_count(),
            pending_conflicts: self.state.pending_conflict_count(),
            queued_updates: self.state.queued_update_count(),
            subscriptions: self.subscriptions.len(),
            entities: self.state.entity_count(),
            persistence_healthy: self.persistence_healthy,
            last_sync_timestamp: self.state.last_sync_timestamp(),
            metrics: self.metrics.snapshot(),
        }
    }

    // ------------------------------------------------------------------
    // Connection events
    // ------------------------------------------------------------------

    fn handle_event(&mut self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::StateChanged(state) => self.on_state_changed(state),
            ConnectionEvent::Opened => {
                self.stream_open = true;
                let replay = self.subscriptions.resubscribe_all();
                info!(count = replay.len(), "Stream opened, replaying subscriptions");
                for msg in replay {
                    self.send(msg);
                }
            }
            ConnectionEvent::Message(raw) => self.on_message(&raw),
            ConnectionEvent::Closed(reason) => {
                info!(%reason, "Stream closed");
            }
            ConnectionEvent::Error(err) => {
                warn!(error = %err, "Connection error");
                self.metrics.record_error();
            }
        }
    }

    fn on_state_changed(&mut self, state: ConnectionState) {
        info!(%state, "Connection state changed");
        Metrics::connection_state(state.as_str());
        self.metrics.set_connected(state == ConnectionState::Connected);
        if state != ConnectionState::Connected {
            self.stream_open = false;
        }

        if state == ConnectionState::Connecting {
            if self.seen_connecting {
                self.metrics.record_reconnect();
                Metrics::reconnect("backoff");
            }
            self.seen_connecting = true;
        }
    }

    fn on_message(&mut self, raw: &str) {
        let source = if *self.connection.borrow() == ConnectionState::Degraded {
            "poll"
        } else {
            "stream"
        };
        self.metrics.record_inbound();
        Metrics::inbound_message(source);

        let ingested = self.ingestion.ingest(raw);
        if ingested.dropped > 0 {
            self.metrics.record_malformed(ingested.dropped as u64);
            Metrics::malformed(ingested.dropped as u64);
        }
        if ingested.service_error {
            self.metrics.record_error();
        }

        for update in ingested.updates {
            let now = self.clock.now_ms();
            let server_ts = update.timestamp;
            let duplicates_before = self.state.duplicate_count();

            let effects = self.state.apply_remote(update, now);

            if self.state.duplicate_count() > duplicates_before {
                self.metrics.record_duplicates(1);
                Metrics::duplicate_updates(1);
            } else if !effects.is_empty() {
                self.metrics.record_update(server_ts);
                Metrics::update_applied();
                Metrics::update_latency(now.saturating_sub(server_ts).max(0) as f64);
            }
            self.execute(effects);
        }
    }

    // ------------------------------------------------------------------
    // Effects
    // ------------------------------------------------------------------

    fn execute(&mut self, effects: Vec<StateEffect>) {
        for effect in effects {
            match effect {
                StateEffect::Persist => self.dirty = true,
                StateEffect::Notify(entity) => {
                    let watchers = self.observers.watcher_count(&entity.id);
                    let delivered = self.observers.notify(&entity);
                    self.metrics.record_fanout(delivered as u64);
                    Metrics::fanout(delivered as u64);
                    if delivered < watchers {
                        Metrics::observer_panics((watchers - delivered) as u64);
                    }
                }
                StateEffect::Resubmit(edit) => {
                    self.sync.flag(&edit.id);
                    if self.stream_open {
                        debug!(id = %edit.id, client_seq = edit.client_seq, "Re-asserting edit on stream");
                        self.send(OutboundMessage::Sync { edits: vec![edit] });
                    }
                }
                StateEffect::ConflictRaised(notice) => {
                    self.metrics.record_conflict();
                    Metrics::conflict(
                        self.state.strategy().as_str(),
                        ConflictOutcome::AwaitingDecision.as_str(),
                    );
                    if self.observers.conflict_listener_count() == 0 {
                        warn!(
                            id = %notice.ticket.id,
                            seq = notice.ticket.seq,
                            "Interactive conflict raised with no listener, id stays blocked"
                        );
                    }
                    self.observers.notify_conflict(&notice);
                }
                StateEffect::ConflictSettled(record) => {
                    // Interactive conflicts were counted when raised
                    if !matches!(record.outcome, ConflictOutcome::Resolved(_)) {
                        self.metrics.record_conflict();
                    }
                    Metrics::conflict(record.strategy.as_str(), record.outcome.as_str());
                }
            }
        }
    }

    fn send(&self, msg: OutboundMessage) {
        let kind = msg.kind();
        match self.writer.send(msg) {
            Ok(()) => Metrics::outbound_message(kind),
            Err(SendError::NotConnected(state)) => {
                debug!(kind, %state, "Stream not connected, message skipped");
            }
            Err(e) => warn!(kind, error = %e, "Failed to queue outbound message"),
        }
    }

    fn send_on_stream(&self, msg: OutboundMessage) {
        if self.stream_open {
            self.send(msg);
        } else {
            debug!(kind = msg.kind(), "Stream not open, left for replay");
        }
    }

    fn publish_interest(&mut self) {
        let ids = self.subscriptions.active_ids();
        Metrics::subscriptions(ids.len());
        self.interest.send_replace(ids);
    }

    // ------------------------------------------------------------------
    // Periodic sync
    // ------------------------------------------------------------------

    /// Spawn a REST push of due edits. Returns the number pushed.
    fn start_sync(&mut self, force: bool) -> usize {
        if self.sync.in_flight() {
            debug!(force, "Sync push already in flight");
            return 0;
        }

        let now = self.clock.now_ms();
        let state = &self.state;
        let edits = self.sync.due(
            state.pending_edits().filter(|e| !state.is_blocked(&e.id)),
            now,
            force,
        );
        if edits.is_empty() {
            return 0;
        }

        let count = edits.len();
        info!(count, force, "Pushing pending edits");
        self.sync.begin();

        let backend = self.backend.clone();
        let tx = self.sync_tx.clone();
        tokio::spawn(async move {
            let result = backend.push_edits(&edits).await;
            if tx.send(SyncOutcome { edits, result }).await.is_err() {
                debug!("Engine gone before sync result arrived");
            }
        });
        count
    }

    fn handle_sync_outcome(&mut self, outcome: SyncOutcome) {
        self.sync.finish();
        let now = self.clock.now_ms();
        let SyncOutcome { edits, result } = outcome;

        match result {
            Ok(ack) => {
                let mut answered: HashSet<(EntityId, u64)> = HashSet::new();
                let accepted = ack.accepted.len();
                let rejected = ack.rejected.len();

                for entry in ack.accepted {
                    self.sync.on_accepted(&entry.id, entry.client_seq);
                    let effects = self.state.acknowledge_edit(&entry.id, entry.client_seq, now);
                    self.execute(effects);
                    answered.insert((entry.id, entry.client_seq));
                }
                for rejection in ack.rejected {
                    warn!(
                        id = %rejection.id,
                        client_seq = rejection.client_seq,
                        reason = %rejection.reason,
                        "Edit rejected by pricing service"
                    );
                    self.sync.on_failed(&rejection.id, rejection.client_seq, now);
                    answered.insert((rejection.id, rejection.client_seq));
                }

                let mut unanswered = 0;
                for edit in &edits {
                    if !answered.contains(&(edit.id.clone(), edit.client_seq)) {
                        warn!(id = %edit.id, client_seq = edit.client_seq, "Edit missing from sync response");
                        self.sync.on_failed(&edit.id, edit.client_seq, now);
                        unanswered += 1;
                    }
                }

                info!(accepted, rejected, unanswered, "Sync push completed");
                self.metrics.record_sync(accepted as u64, (rejected + unanswered) as u64);
                Metrics::sync_edits("accepted", accepted);
                Metrics::sync_edits("rejected", rejected + unanswered);
                self.state.record_sync(now);
                self.dirty = true;
            }
            Err(e) => {
                warn!(error = %e, count = edits.len(), "Sync push failed, edits stay pending");
                for edit in &edits {
                    self.sync.on_failed(&edit.id, edit.client_seq, now);
                }
                self.metrics.record_error();
                Metrics::sync_edits("failed", edits.len());
            }
        }

        let state = &self.state;
        self.sync.retain(|id| state.pending_edit(id).is_some());
    }

    // ------------------------------------------------------------------
    // Maintenance & persistence
    // ------------------------------------------------------------------

    fn maintain(&mut self) {
        let now = self.clock.now_ms();
        let subscriptions = &self.subscriptions;
        let evicted = self.state.evict_expired(now, retention_ms(&self.config), |id| {
            subscriptions.is_subscribed(id)
        });
        if !evicted.is_empty() {
            info!(count = evicted.len(), "Evicted idle entities");
            self.dirty = true;
        }
        if !self.persistence_healthy {
            // Retry so a recovered store leaves memory-only mode
            self.dirty = true;
        }

        Metrics::pending_edits(self.state.pending_count());
        Metrics::pending_conflicts(self.state.pending_conflict_count());
        Metrics::subscriptions(self.subscriptions.len());
    }

    /// Start a snapshot write if anything changed and none is running.
    ///
    /// Changes made while a write is in flight stay dirty and are folded
    /// into the next one.
    fn flush(&mut self) {
        if !self.dirty || self.save_in_flight {
            return;
        }
        self.dirty = false;
        self.save_in_flight = true;
        Metrics::pending_edits(self.state.pending_count());
        Metrics::pending_conflicts(self.state.pending_conflict_count());

        let snapshot = self.state.snapshot();
        let store = self.store.clone();
        let tx = self.save_tx.clone();
        tokio::task::spawn_blocking(move || {
            let result = store.save(&snapshot);
            if tx.blocking_send(result).is_err() {
                debug!("Engine gone before snapshot result arrived");
            }
        });
    }

    fn handle_save_result(&mut self, result: PersistenceResult<()>) {
        self.save_in_flight = false;
        match result {
            Ok(()) => {
                if !self.persistence_healthy {
                    info!(store = %self.store.describe(), "Persistence recovered");
                    self.persistence_healthy = true;
                }
            }
            Err(e) => {
                if self.persistence_healthy {
                    warn!(
                        error = %e,
                        store = %self.store.describe(),
                        "Snapshot save failed, continuing memory-only"
                    );
                } else {
                    debug!(error = %e, "Snapshot save still failing");
                }
                self.persistence_healthy = false;
                self.metrics.record_persistence_failure();
                Metrics::persistence_failure("save");
            }
        }
    }

    async fn shutdown(&mut self) {
        info!("Engine shutting down");
        self.shutdown_token.cancel();
        self.metrics.set_connected(false);
        self.dirty = false;

        let grace_ms = self.config.shutdown_grace_ms;
        let deadline = Instant::now() + Duration::from_millis(grace_ms);

        // An older snapshot still being written must not land after the final one
        if self.save_in_flight {
            match tokio::time::timeout_at(deadline, self.save_rx.recv()).await {
                Ok(Some(result)) => self.handle_save_result(result),
                Ok(None) => self.save_in_flight = false,
                Err(_) => warn!(grace_ms, "Snapshot write still running at shutdown"),
            }
        }

        let snapshot = self.state.snapshot();
        let store = self.store.clone();
        let save = tokio::task::spawn_blocking(move || store.save(&snapshot));

        match tokio::time::timeout_at(deadline, save).await {
            Ok(Ok(Ok(()))) => info!("Final snapshot saved"),
            Ok(Ok(Err(e))) => {
                warn!(error = %e, "Final snapshot save failed");
                Metrics::persistence_failure("save");
            }
            Ok(Err(e)) => error!(?e, "Final snapshot task panicked"),
            Err(_) => warn!(grace_ms, "Final snapshot abandoned after grace period"),
        }

        let summary = self.metrics.snapshot();
        info!(
            updates = summary.updates_applied,
            conflicts = summary.conflicts,
            reconnects = summary.reconnects,
            errors = summary.errors,
            "Final statistics"
        );
    }
}

fn retention_ms(config: &EngineConfig) -> i64 {
    i64::try_from(config.entity_retention_ms).unwrap_or(i64::MAX)
}
