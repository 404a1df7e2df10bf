//! Collaborator-facing engine handle.
//!
//! Every call becomes an [`EngineCommand`] on the engine's bounded queue and,
//! except for the `try_*` variants, waits for the engine's reply.

use crate::error::{EngineError, EngineResult};
use pricesync_core::{EntityId, PendingEdit, Price, PriceEntity, PriceView};
use pricesync_feed::{
    ConflictCallback, ConflictDecision, ConflictNotice, ConflictRecord, ConflictTicket,
    PriceCallback, WatchId,
};
use pricesync_telemetry::MetricsSnapshot;
use pricesync_ws::ConnectionState;
use tokio::sync::{mpsc, oneshot, watch};

/// Request processed by the engine task.
pub enum EngineCommand {
    Subscribe {
        ids: Vec<EntityId>,
        reply: oneshot::Sender<()>,
    },
    Unsubscribe {
        ids: Vec<EntityId>,
        reply: oneshot::Sender<()>,
    },
    ProposeLocalPrice {
        id: EntityId,
        price: Price,
        reply: oneshot::Sender<EngineResult<PendingEdit>>,
    },
    Watch {
        id: EntityId,
        callback: PriceCallback,
        reply: oneshot::Sender<WatchId>,
    },
    Unwatch {
        id: EntityId,
        watch_id: WatchId,
        reply: oneshot::Sender<bool>,
    },
    WatchConflicts {
        callback: ConflictCallback,
        reply: oneshot::Sender<WatchId>,
    },
    UnwatchConflicts {
        watch_id: WatchId,
        reply: oneshot::Sender<bool>,
    },
    /// `reply` is `None` for fire-and-forget resolution from inside a listener.
    ResolveConflict {
        ticket: ConflictTicket,
        decision: ConflictDecision,
        reply: Option<oneshot::Sender<EngineResult<()>>>,
    },
    GetCurrent {
        id: EntityId,
        reply: oneshot::Sender<Option<PriceView>>,
    },
    /// Push every pending edit now. Replies with the number pushed.
    ForceSync {
        reply: oneshot::Sender<usize>,
    },
    Status {
        reply: oneshot::Sender<EngineStatus>,
    },
    RecentConflicts {
        reply: oneshot::Sender<Vec<ConflictRecord>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

impl EngineCommand {
    /// Short label for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Subscribe { .. } => "subscribe",
            Self::Unsubscribe { .. } => "unsubscribe",
            Self::ProposeLocalPrice { .. } => "propose_local_price",
            Self::Watch { .. } => "watch",
            Self::Unwatch { .. } => "unwatch",
            Self::WatchConflicts { .. } => "watch_conflicts",
            Self::UnwatchConflicts { .. } => "unwatch_conflicts",
            Self::ResolveConflict { .. } => "resolve_conflict",
            Self::GetCurrent { .. } => "get_current",
            Self::ForceSync { .. } => "force_sync",
            Self::Status { .. } => "status",
            Self::RecentConflicts { .. } => "recent_conflicts",
            Self::Shutdown { .. } => "shutdown",
        }
    }
}

/// Read-only engine health.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineStatus {
    pub connection: ConnectionState,
    pub pending_edits: usize,
    /// Interactive conflicts awaiting a decision.
    pub pending_conflicts: usize,
    /// Remote updates held behind unresolved conflicts.
    pub queued_updates: usize,
    pub subscriptions: usize,
    pub entities: usize,
    /// False while snapshots cannot be saved (memory-only).
    pub persistence_healthy: bool,
    pub last_sync_timestamp: Option<i64>,
    pub metrics: MetricsSnapshot,
}

/// Cloneable handle to a running engine.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineCommand>,
    state: watch::Receiver<ConnectionState>,
}

impl EngineHandle {
    pub(crate) fn new(
        tx: mpsc::Sender<EngineCommand>,
        state: watch::Receiver<ConnectionState>,
    ) -> Self {
        Self { tx, state }
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> EngineCommand,
    ) -> EngineResult<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(build(reply))
            .await
            .map_err(|_| EngineError::Stopped)?;
        rx.await.map_err(|_| EngineError::Stopped)
    }

    /// Declare interest in `ids`.
    pub async fn subscribe<I, S>(&self, ids: I) -> EngineResult<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<EntityId>,
    {
        let ids = collect_ids(ids)?;
        self.request(|reply| EngineCommand::Subscribe { ids, reply }).await
    }

    pub async fn unsubscribe<I, S>(&self, ids: I) -> EngineResult<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<EntityId>,
    {
        let ids = collect_ids(ids)?;
        self.request(|reply| EngineCommand::Unsubscribe { ids, reply }).await
    }

    /// Record an optimistic local price. Returns the pending edit.
    pub async fn propose_local_price(
        &self,
        id: impl Into<EntityId>,
        price: Price,
    ) -> EngineResult<PendingEdit> {
        let id = id.into();
        self.request(|reply| EngineCommand::ProposeLocalPrice { id, price, reply })
            .await?
    }

    /// Call `callback` on every confirmed price change of `id`.
    ///
    /// Callbacks run on the engine task; they must not block or await
    /// engine replies.
    pub async fn watch<F>(&self, id: impl Into<EntityId>, callback: F) -> EngineResult<WatchId>
    where
        F: Fn(&PriceEntity) + Send + 'static,
    {
        let id = id.into();
        let callback: PriceCallback = Box::new(callback);
        self.request(|reply| EngineCommand::Watch { id, callback, reply })
            .await
    }

    pub async fn unwatch(&self, id: impl Into<EntityId>, watch_id: WatchId) -> EngineResult<bool> {
        let id = id.into();
        self.request(|reply| EngineCommand::Unwatch { id, watch_id, reply })
            .await
    }

    /// Receive interactive conflict notices.
    ///
    /// Decide from inside the callback with [`try_resolve_conflict`](Self::try_resolve_conflict).
    pub async fn watch_conflicts<F>(&self, callback: F) -> EngineResult<WatchId>
    where
        F: Fn(&ConflictNotice) + Send + 'static,
    {
        let callback: ConflictCallback = Box::new(callback);
        self.request(|reply| EngineCommand::WatchConflicts { callback, reply })
            .await
    }

    pub async fn unwatch_conflicts(&self, watch_id: WatchId) -> EngineResult<bool> {
        self.request(|reply| EngineCommand::UnwatchConflicts { watch_id, reply })
            .await
    }

    pub async fn resolve_conflict(
        &self,
        ticket: ConflictTicket,
        decision: ConflictDecision,
    ) -> EngineResult<()> {
        self.request(|reply| EngineCommand::ResolveConflict {
            ticket,
            decision,
            reply: Some(reply),
        })
        .await?
    }

    /// Queue a decision without waiting. Safe to call from callbacks.
    pub fn try_resolve_conflict(
        &self,
        ticket: ConflictTicket,
        decision: ConflictDecision,
    ) -> EngineResult<()> {
        self.tx
            .try_send(EngineCommand::ResolveConflict {
                ticket,
                decision,
                reply: None,
            })
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => EngineError::Busy,
                mpsc::error::TrySendError::Closed(_) => EngineError::Stopped,
            })
    }

    pub async fn get_current(&self, id: impl Into<EntityId>) -> EngineResult<Option<PriceView>> {
        let id = id.into();
        self.request(|reply| EngineCommand::GetCurrent { id, reply })
            .await
    }

    /// Latest connection state. Does not round-trip through the engine.
    pub fn connection_status(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub async fn force_sync(&self) -> EngineResult<usize> {
        self.request(|reply| EngineCommand::ForceSync { reply }).await
    }

    pub async fn status(&self) -> EngineResult<EngineStatus> {
        self.request(|reply| EngineCommand::Status { reply }).await
    }

    /// Oldest first, bounded by `conflict_history_limit`.
    pub async fn recent_conflicts(&self) -> EngineResult<Vec<ConflictRecord>> {
        self.request(|reply| EngineCommand::RecentConflicts { reply })
            .await
    }

    /// Stop the connection, flush a final snapshot and end the engine task.
    pub async fn shutdown(&self) -> EngineResult<()> {
        self.request(|reply| EngineCommand::Shutdown { reply }).await
    }
}

fn collect_ids<I, S>(ids: I) -> EngineResult<Vec<EntityId>>
where
    I: IntoIterator<Item = S>,
    S: Into<EntityId>,
{
    let ids: Vec<EntityId> = ids.into_iter().map(Into::into).collect();
    if ids.iter().any(|id| id.trim().is_empty()) {
        return Err(EngineError::InvalidInput("entity id must not be empty".to_string()));
    }
    Ok(ids)
}
