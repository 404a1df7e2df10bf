//! Per-entity price state.
//!
//! Holds the confirmed `PriceEntity` map and outstanding `PendingEdit`s and
//! decides how each remote update or local proposal changes them. Pure: every
//! mutating call returns the [`StateEffect`]s the caller must carry out
//! (persist, notify, resubmit, raise a conflict), so the engine stays the
//! only place with side effects.

use crate::conflict::{
    ConflictDecision, ConflictNotice, ConflictOutcome, ConflictRecord, ConflictResolver,
    ConflictStrategy, ConflictTicket, Resolution,
};
use crate::error::{FeedError, FeedResult};
use pricesync_core::{
    validate_price_input, EntityId, NormalizedUpdate, Origin, PendingEdit, PersistedState, Price,
    PriceEntity, PriceView, SNAPSHOT_FORMAT_VERSION,
};
use std::collections::{BTreeMap, HashMap, VecDeque};
use tracing::{debug, info, warn};

pub const DEFAULT_CONFLICT_HISTORY: usize = 64;

/// Updates held per blocked id before the oldest are dropped.
pub const DEFAULT_CONFLICT_QUEUE_LIMIT: usize = 256;

/// Side effect requested by a state transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateEffect {
    /// Confirmed state or pending edits changed; save a snapshot.
    Persist,
    /// Confirmed price changed (or the entity is new); fan out.
    Notify(PriceEntity),
    /// Re-assert a local edit that won a conflict.
    Resubmit(PendingEdit),
    /// An interactive conflict needs a collaborator decision.
    ConflictRaised(ConflictNotice),
    /// A conflict was settled (automatically or by decision).
    ConflictSettled(ConflictRecord),
}

/// Interactive conflict waiting for a decision.
#[derive(Debug)]
struct BlockedConflict {
    seq: u64,
    local_edit: PendingEdit,
    remote_update: NormalizedUpdate,
    detected_at: i64,
    /// Updates for the id that arrived while blocked, in arrival order.
    queued: VecDeque<NormalizedUpdate>,
}

/// Confirmed and pending price state for every known entity.
pub struct PriceState {
    entities: BTreeMap<EntityId, PriceEntity>,
    pending: BTreeMap<EntityId, PendingEdit>,
    resolver: Box<dyn ConflictResolver>,
    blocked: HashMap<EntityId, BlockedConflict>,
    history: VecDeque<ConflictRecord>,
    history_limit: usize,
    queue_limit: usize,
    queue_overflow: u64,
    next_client_seq: u64,
    next_ticket: u64,
    last_sync_timestamp: Option<i64>,
    duplicates: u64,
}

impl PriceState {
    pub fn new(strategy: ConflictStrategy) -> Self {
        Self::with_resolver(strategy.resolver())
    }

    pub fn with_resolver(resolver: Box<dyn ConflictResolver>) -> Self {
        Self {
            entities: BTreeMap::new(),
            pending: BTreeMap::new(),
            resolver,
            blocked: HashMap::new(),
            history: VecDeque::new(),
            history_limit: DEFAULT_CONFLICT_HISTORY,
            queue_limit: DEFAULT_CONFLICT_QUEUE_LIMIT,
            queue_overflow: 0,
            next_client_seq: 1,
            next_ticket: 1,
            last_sync_timestamp: None,
            duplicates: 0,
        }
    }

    /// Bound the conflict history ring (minimum 1).
    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit.max(1);
        self
    }

    /// Bound the per-conflict update queue (minimum 1).
    pub fn with_queue_limit(mut self, limit: usize) -> Self {
        self.queue_limit = limit.max(1);
        self
    }

    pub fn strategy(&self) -> ConflictStrategy {
        self.resolver.strategy()
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// Current visible price: the pending proposal if any, else confirmed.
    pub fn get_current(&self, id: &str) -> Option<PriceView> {
        let entity = self.entities.get(id);
        match self.pending.get(id) {
            Some(edit) => Some(PriceView {
                id: edit.id.clone(),
                price: edit.proposed_price,
                version: entity.map_or(0, |e| e.version),
                origin: Origin::Local,
                last_updated: entity.map_or(edit.submitted_at, |e| e.last_updated),
                pending: true,
            }),
            None => entity.map(PriceView::from),
        }
    }

    /// Confirmed state only.
    pub fn confirmed(&self, id: &str) -> Option<&PriceEntity> {
        self.entities.get(id)
    }

    pub fn pending_edit(&self, id: &str) -> Option<&PendingEdit> {
        self.pending.get(id)
    }

    pub fn pending_edits(&self) -> impl Iterator<Item = &PendingEdit> {
        self.pending.values()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Interactive conflicts awaiting a decision.
    pub fn pending_conflict_count(&self) -> usize {
        self.blocked.len()
    }

    /// Remote updates held behind open conflicts.
    pub fn queued_update_count(&self) -> usize {
        self.blocked.values().map(|b| b.queued.len()).sum()
    }

    /// Queued updates dropped because a conflict queue was full.
    pub fn queue_overflow_count(&self) -> u64 {
        self.queue_overflow
    }

    pub fn is_blocked(&self, id: &str) -> bool {
        self.blocked.contains_key(id)
    }

    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    /// Oldest first.
    pub fn recent_conflicts(&self) -> Vec<ConflictRecord> {
        self.history.iter().cloned().collect()
    }

    /// Remote updates ignored by the version guard.
    pub fn duplicate_count(&self) -> u64 {
        self.duplicates
    }

    pub fn last_sync_timestamp(&self) -> Option<i64> {
        self.last_sync_timestamp
    }

    pub fn record_sync(&mut self, at_ms: i64) {
        self.last_sync_timestamp = Some(at_ms);
    }

    // ------------------------------------------------------------------
    // Mutations
    // ------------------------------------------------------------------

    /// Record a local proposal. Replaces any earlier unconfirmed edit.
    pub fn apply_local(
        &mut self,
        id: &str,
        proposed_price: Price,
        now_ms: i64,
    ) -> FeedResult<(PendingEdit, Vec<StateEffect>)> {
        validate_price_input(id, proposed_price)?;

        let edit = self.new_edit(id, proposed_price, now_ms);
        if let Some(previous) = self.pending.insert(id.to_string(), edit.clone()) {
            debug!(
                id,
                replaced_seq = previous.client_seq,
                client_seq = edit.client_seq,
                "Pending edit replaced"
            );
        } else {
            debug!(id, client_seq = edit.client_seq, price = %proposed_price, "Pending edit created");
        }

        Ok((edit, vec![StateEffect::Persist]))
    }

    /// Apply one remote update.
    pub fn apply_remote(&mut self, update: NormalizedUpdate, now_ms: i64) -> Vec<StateEffect> {
        if let Some(block) = self.blocked.get_mut(&update.id) {
            if block.queued.len() >= self.queue_limit {
                // Newer versions supersede the oldest under the version guard
                if let Some(dropped) = block.queued.pop_front() {
                    self.queue_overflow += 1;
                    warn!(
                        id = %dropped.id,
                        version = dropped.version,
                        limit = self.queue_limit,
                        "Conflict queue full, oldest held update dropped"
                    );
                }
            }
            debug!(
                id = %update.id,
                version = update.version,
                queued = block.queued.len() + 1,
                "Update queued behind interactive conflict"
            );
            block.queued.push_back(update);
            return Vec::new();
        }

        if let Some(entity) = self.entities.get(&update.id) {
            if update.version <= entity.version {
                self.duplicates += 1;
                debug!(
                    id = %update.id,
                    version = update.version,
                    confirmed = entity.version,
                    "Stale or duplicate update ignored"
                );
                return Vec::new();
            }
        }

        let Some(edit) = self.pending.get(&update.id).cloned() else {
            return self.confirm(&update.id, update.price, update.version, Origin::Server, now_ms);
        };

        if edit.proposed_price == update.price {
            debug!(id = %update.id, client_seq = edit.client_seq, "Server echoed pending edit");
            self.pending.remove(&update.id);
            return self.confirm(&update.id, update.price, update.version, Origin::Server, now_ms);
        }

        self.resolve_automatically(edit, update, now_ms)
    }

    fn resolve_automatically(
        &mut self,
        edit: PendingEdit,
        update: NormalizedUpdate,
        now_ms: i64,
    ) -> Vec<StateEffect> {
        let strategy = self.resolver.strategy();
        let resolution = self.resolver.resolve(&edit, &update);
        info!(
            id = %update.id,
            %strategy,
            ?resolution,
            local = %edit.proposed_price,
            remote = %update.price,
            version = update.version,
            "Conflict detected"
        );

        match resolution {
            Resolution::AdoptRemote => {
                self.pending.remove(&update.id);
                let mut effects =
                    self.confirm(&update.id, update.price, update.version, Origin::Server, now_ms);
                let record = self.record(edit, update, now_ms, ConflictOutcome::RemoteWins);
                effects.push(StateEffect::ConflictSettled(record));
                effects
            }
            Resolution::KeepLocal => {
                let mut effects = self.confirm(
                    &update.id,
                    edit.proposed_price,
                    update.version,
                    Origin::Local,
                    now_ms,
                );
                effects.push(StateEffect::Resubmit(edit.clone()));
                let record = self.record(edit, update, now_ms, ConflictOutcome::LocalWins);
                effects.push(StateEffect::ConflictSettled(record));
                effects
            }
            Resolution::Defer => {
                let seq = self.next_ticket;
                self.next_ticket += 1;

                let notice = ConflictNotice {
                    ticket: ConflictTicket {
                        id: update.id.clone(),
                        seq,
                    },
                    local_edit: edit.clone(),
                    remote_update: update.clone(),
                    current: self.entities.get(&update.id).cloned(),
                };
                self.blocked.insert(
                    update.id.clone(),
                    BlockedConflict {
                        seq,
                        local_edit: edit.clone(),
                        remote_update: update.clone(),
                        detected_at: now_ms,
                        queued: VecDeque::new(),
                    },
                );
                self.record(edit, update, now_ms, ConflictOutcome::AwaitingDecision);
                vec![StateEffect::ConflictRaised(notice)]
            }
        }
    }

    /// Settle an interactive conflict and replay updates queued behind it.
    pub fn resolve_conflict(
        &mut self,
        ticket: &ConflictTicket,
        decision: ConflictDecision,
        now_ms: i64,
    ) -> FeedResult<Vec<StateEffect>> {
        let matches = self
            .blocked
            .get(&ticket.id)
            .is_some_and(|block| block.seq == ticket.seq);
        if !matches {
            return Err(FeedError::UnknownConflict {
                id: ticket.id.clone(),
                seq: ticket.seq,
            });
        }
        if let ConflictDecision::Merged(price) = decision {
            validate_price_input(&ticket.id, price)?;
        }
        let Some(block) = self.blocked.remove(&ticket.id) else {
            return Err(FeedError::UnknownConflict {
                id: ticket.id.clone(),
                seq: ticket.seq,
            });
        };

        let id = ticket.id.as_str();
        let remote = &block.remote_update;
        info!(id, seq = ticket.seq, ?decision, "Interactive conflict resolved");

        let mut effects = match decision {
            ConflictDecision::UseRemote => {
                // An edit proposed while blocked was never part of the conflict
                let superseded = self
                    .pending
                    .get(id)
                    .is_some_and(|edit| edit.client_seq == block.local_edit.client_seq);
                if superseded {
                    self.pending.remove(id);
                } else if let Some(edit) = self.pending.get(id) {
                    debug!(id, client_seq = edit.client_seq, "Newer edit kept after conflict");
                }
                self.confirm(id, remote.price, remote.version, Origin::Server, now_ms)
            }
            ConflictDecision::KeepLocal => match self.pending.get(id).cloned() {
                Some(edit) => {
                    let mut effects =
                        self.confirm(id, edit.proposed_price, remote.version, Origin::Local, now_ms);
                    effects.push(StateEffect::Resubmit(edit));
                    effects
                }
                None => {
                    warn!(id, "Pending edit gone before resolution, adopting remote");
                    self.confirm(id, remote.price, remote.version, Origin::Server, now_ms)
                }
            },
            ConflictDecision::Merged(price) => {
                let edit = self.new_edit(id, price, now_ms);
                self.pending.insert(id.to_string(), edit.clone());
                let mut effects = self.confirm(id, price, remote.version, Origin::Merged, now_ms);
                effects.push(StateEffect::Resubmit(edit));
                effects
            }
        };

        let record = self.record(
            block.local_edit,
            block.remote_update,
            block.detected_at,
            ConflictOutcome::Resolved(decision),
        );
        effects.push(StateEffect::ConflictSettled(record));

        for update in block.queued {
            effects.extend(self.apply_remote(update, now_ms));
        }
        Ok(effects)
    }

    /// The service accepted edit `client_seq` for `id`.
    ///
    /// Ignored when a newer edit has replaced it in the meantime.
    pub fn acknowledge_edit(&mut self, id: &str, client_seq: u64, now_ms: i64) -> Vec<StateEffect> {
        let is_current = self
            .pending
            .get(id)
            .is_some_and(|edit| edit.client_seq == client_seq);
        if !is_current {
            debug!(id, client_seq, "Ack for superseded edit ignored");
            return Vec::new();
        }
        if self.blocked.contains_key(id) {
            // The decision still needs the edit
            return Vec::new();
        }
        let Some(edit) = self.pending.remove(id) else {
            return Vec::new();
        };

        let version = self.entities.get(id).map_or(0, |e| e.version);
        let origin = self.entities.get(id).map_or(Origin::Local, |e| {
            if e.price == edit.proposed_price {
                e.origin
            } else {
                Origin::Local
            }
        });
        self.confirm(id, edit.proposed_price, version, origin, now_ms)
    }

    /// Drop entities nobody is interested in any more.
    ///
    /// Keeps anything subscribed, pending, or blocked, and anything updated
    /// within `retention_ms`. Returns evicted ids.
    pub fn evict_expired(
        &mut self,
        now_ms: i64,
        retention_ms: i64,
        is_subscribed: impl Fn(&str) -> bool,
    ) -> Vec<EntityId> {
        let expired: Vec<EntityId> = self
            .entities
            .values()
            .filter(|e| {
                !is_subscribed(&e.id)
                    && !self.pending.contains_key(&e.id)
                    && !self.blocked.contains_key(&e.id)
                    && now_ms.saturating_sub(e.last_updated) > retention_ms
            })
            .map(|e| e.id.clone())
            .collect();

        for id in &expired {
            self.entities.remove(id);
        }
        if !expired.is_empty() {
            debug!(count = expired.len(), "Evicted expired entities");
        }
        expired
    }

    pub fn snapshot(&self) -> PersistedState {
        PersistedState {
            format_version: SNAPSHOT_FORMAT_VERSION,
            entities: self.entities.clone(),
            pending_edits: self.pending.clone(),
            last_sync_timestamp: self.last_sync_timestamp,
            next_client_seq: self.next_client_seq,
        }
    }

    /// Replace all state with a loaded snapshot.
    pub fn restore(&mut self, state: PersistedState) {
        let max_seq = state
            .pending_edits
            .values()
            .map(|e| e.client_seq)
            .max()
            .unwrap_or(0);

        self.next_client_seq = state.next_client_seq.max(max_seq + 1);
        self.entities = state.entities;
        self.pending = state.pending_edits;
        self.last_sync_timestamp = state.last_sync_timestamp;
        self.blocked.clear();
        info!(
            entities = self.entities.len(),
            pending = self.pending.len(),
            next_client_seq = self.next_client_seq,
            "Price state restored"
        );
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn new_edit(&mut self, id: &str, proposed_price: Price, now_ms: i64) -> PendingEdit {
        let client_seq = self.next_client_seq;
        self.next_client_seq += 1;
        PendingEdit {
            id: id.to_string(),
            proposed_price,
            submitted_at: now_ms,
            client_seq,
        }
    }

    /// Store a confirmed state. Notifies only when the price actually moved.
    fn confirm(
        &mut self,
        id: &str,
        price: Price,
        version: u64,
        origin: Origin,
        now_ms: i64,
    ) -> Vec<StateEffect> {
        let changed = self.entities.get(id).map_or(true, |prev| prev.price != price);
        let entity = PriceEntity {
            id: id.to_string(),
            price,
            version,
            origin,
            last_updated: now_ms,
        };
        self.entities.insert(id.to_string(), entity.clone());
        debug!(id, %price, version, %origin, changed, "Price confirmed");

        let mut effects = vec![StateEffect::Persist];
        if changed {
            effects.push(StateEffect::Notify(entity));
        }
        effects
    }

    fn record(
        &mut self,
        local_edit: PendingEdit,
        remote_update: NormalizedUpdate,
        detected_at: i64,
        outcome: ConflictOutcome,
    ) -> ConflictRecord {
        let record = ConflictRecord {
            id: remote_update.id.clone(),
            local_edit,
            remote_update,
            detected_at,
            strategy: self.resolver.strategy(),
            outcome,
        };
        if self.history.len() == self.history_limit {
            self.history.pop_front();
        }
        self.history.push_back(record.clone());
        record
    }
}
