//! Persisted record layout.
//!
//! The whole engine state is persisted as one record. `BTreeMap` keeps
//! serialization order deterministic so identical state produces identical
//! bytes.

use crate::{EntityId, PendingEdit, PriceEntity};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Version of the persisted format.
pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

/// Everything the engine needs to resume after a restart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedState {
    pub format_version: u32,
    #[serde(default)]
    pub entities: BTreeMap<EntityId, PriceEntity>,
    #[serde(default)]
    pub pending_edits: BTreeMap<EntityId, PendingEdit>,
    /// Unix ms of the last successful sync push, if any.
    #[serde(default)]
    pub last_sync_timestamp: Option<i64>,
    /// Next local edit sequence number, so `client_seq` stays unique across restarts.
    #[serde(default = "default_next_client_seq")]
    pub next_client_seq: u64,
}

fn default_next_client_seq() -> u64 {
    1
}

impl PersistedState {
    pub fn empty() -> Self {
        Self {
            format_version: SNAPSHOT_FORMAT_VERSION,
            entities: BTreeMap::new(),
            pending_edits: BTreeMap::new(),
            last_sync_timestamp: None,
            next_client_seq: default_next_client_seq(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty() && self.pending_edits.is_empty()
    }

    /// Drop entities whose last update is older than `retention_ms` at `now_ms`.
    ///
    /// Entities with a pending edit are kept regardless of age.
    /// Returns the number of dropped entities.
    pub fn drop_expired(&mut self, now_ms: i64, retention_ms: i64) -> usize {
        let before = self.entities.len();
        let pending = &self.pending_edits;
        self.entities.retain(|id, entity| {
            pending.contains_key(id) || now_ms.saturating_sub(entity.last_updated) <= retention_ms
        });
        before - self.entities.len()
    }
}

impl Default for PersistedState {
    fn default() -> Self {
        Self::empty()
    }
}
