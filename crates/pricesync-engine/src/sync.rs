//! Periodic sync scheduling.
//!
//! Decides which pending edits go into the next REST push and tracks
//! per-edit retry backoff. Retry state is keyed by `client_seq`, so a newer
//! edit for the same id starts with a clean slate.

use pricesync_core::{EntityId, PendingEdit};
use std::collections::{HashMap, HashSet};
use tracing::debug;

#[derive(Debug, Clone, Copy)]
struct RetryState {
    client_seq: u64,
    failures: u32,
    next_attempt_at: i64,
}

#[derive(Debug)]
pub struct SyncTracker {
    interval_ms: u64,
    age_threshold_ms: u64,
    max_backoff_ms: u64,
    retries: HashMap<EntityId, RetryState>,
    /// Ids whose edit won a conflict and must be re-asserted regardless of age.
    flagged: HashSet<EntityId>,
    in_flight: bool,
}

impl SyncTracker {
    pub fn new(interval_ms: u64, age_threshold_ms: u64, max_backoff_ms: u64) -> Self {
        Self {
            interval_ms,
            age_threshold_ms,
            max_backoff_ms,
            retries: HashMap::new(),
            flagged: HashSet::new(),
            in_flight: false,
        }
    }

    /// Push `id` in the next window even if its edit is young.
    pub fn flag(&mut self, id: &str) {
        self.flagged.insert(id.to_string());
    }

    pub fn is_flagged(&self, id: &str) -> bool {
        self.flagged.contains(id)
    }

    pub fn in_flight(&self) -> bool {
        self.in_flight
    }

    pub fn begin(&mut self) {
        self.in_flight = true;
    }

    pub fn finish(&mut self) {
        self.in_flight = false;
    }

    /// Retry delay after `failures` consecutive failures.
    ///
    /// interval × 2^failures, capped.
    pub fn backoff_ms(&self, failures: u32) -> u64 {
        let exponent = failures.min(20);
        self.interval_ms
            .saturating_mul(1u64 << exponent)
            .min(self.max_backoff_ms)
    }

    /// Edits to push now.
    ///
    /// `force` ignores the age threshold and retry backoff.
    pub fn due<'a>(
        &self,
        edits: impl Iterator<Item = &'a PendingEdit>,
        now_ms: i64,
        force: bool,
    ) -> Vec<PendingEdit> {
        edits
            .filter(|edit| {
                if force {
                    return true;
                }
                let old_enough = edit.age_ms(now_ms) >= self.age_threshold_ms as i64;
                if !old_enough && !self.flagged.contains(&edit.id) {
                    return false;
                }
                match self.retries.get(&edit.id) {
                    Some(retry) if retry.client_seq == edit.client_seq => {
                        now_ms >= retry.next_attempt_at
                    }
                    _ => true,
                }
            })
            .cloned()
            .collect()
    }

    pub fn on_accepted(&mut self, id: &str, client_seq: u64) {
        self.retries.remove(id);
        self.flagged.remove(id);
        debug!(id, client_seq, "Edit accepted by pricing service");
    }

    /// Rejected or failed push for one edit.
    pub fn on_failed(&mut self, id: &str, client_seq: u64, now_ms: i64) {
        let failures = match self.retries.get(id) {
            Some(retry) if retry.client_seq == client_seq => retry.failures.saturating_add(1),
            _ => 1,
        };
        let delay = self.backoff_ms(failures);
        self.retries.insert(
            id.to_string(),
            RetryState {
                client_seq,
                failures,
                next_attempt_at: now_ms.saturating_add(delay as i64),
            },
        );
        debug!(id, client_seq, failures, retry_in_ms = delay, "Edit sync will be retried");
    }

    /// Consecutive failures recorded for the current edit of `id`.
    pub fn failures(&self, id: &str) -> u32 {
        self.retries.get(id).map_or(0, |r| r.failures)
    }

    /// Drop tracking for ids whose edit no longer exists.
    pub fn retain(&mut self, still_pending: impl Fn(&str) -> bool) {
        self.retries.retain(|id, _| still_pending(id));
        self.flagged.retain(|id| still_pending(id));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pricesync_core::Price;

    fn edit(id: &str, submitted_at: i64, client_seq: u64) -> PendingEdit {
        PendingEdit {
            id: id.to_string(),
            proposed_price: Price::ZERO,
            submitted_at,
            client_seq,
        }
    }

    fn ids(edits: &[PendingEdit]) -> Vec<&str> {
        edits.iter().map(|e| e.id.as_str()).collect()
    }

    #[test]
    fn test_only_old_or_flagged_edits_are_due() {
        let mut tracker = SyncTracker::new(1_000, 5_000, 60_000);
        let edits = [edit("old", 0, 1), edit("young", 9_000, 2), edit("won", 9_500, 3)];
        tracker.flag("won");

        let due = tracker.due(edits.iter(), 10_000, false);
        assert_eq!(ids(&due), vec!["old", "won"]);

        let forced = tracker.due(edits.iter(), 10_000, true);
        assert_eq!(forced.len(), 3);
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let tracker = SyncTracker::new(1_000, 0, 10_000);
        assert_eq!(tracker.backoff_ms(1), 2_000);
        assert_eq!(tracker.backoff_ms(2), 4_000);
        assert_eq!(tracker.backoff_ms(3), 8_000);
        assert_eq!(tracker.backoff_ms(4), 10_000);
        assert_eq!(tracker.backoff_ms(40), 10_000);
    }

    #[test]
    fn test_failed_edit_waits_for_backoff() {
        let mut tracker = SyncTracker::new(1_000, 0, 60_000);
        let edits = [edit("a", 0, 1)];

        tracker.on_failed("a", 1, 10_000);
        assert!(tracker.due(edits.iter(), 11_999, false).is_empty());
        assert_eq!(tracker.due(edits.iter(), 12_000, false).len(), 1);

        tracker.on_failed("a", 1, 12_000);
        assert_eq!(tracker.failures("a"), 2);
        assert!(tracker.due(edits.iter(), 15_999, false).is_empty());
        assert_eq!(tracker.due(edits.iter(), 16_000, false).len(), 1);
    }

    #[test]
    fn test_newer_edit_resets_backoff() {
        let mut tracker = SyncTracker::new(1_000, 0, 60_000);
        tracker.on_failed("a", 1, 10_000);

        let replaced = [edit("a", 10_500, 2)];
        assert_eq!(tracker.due(replaced.iter(), 10_500, false).len(), 1);

        tracker.on_failed("a", 2, 10_500);
        assert_eq!(tracker.failures("a"), 1);
    }

    #[test]
    fn test_accept_clears_retry_and_flag() {
        let mut tracker = SyncTracker::new(1_000, 5_000, 60_000);
        tracker.flag("a");
        tracker.on_failed("a", 1, 0);

        tracker.on_accepted("a", 1);
        assert!(!tracker.is_flagged("a"));
        assert_eq!(tracker.failures("a"), 0);
    }

    #[test]
    fn test_retain_drops_resolved_ids() {
        let mut tracker = SyncTracker::new(1_000, 5_000, 60_000);
        tracker.flag("a");
        tracker.flag("b");
        tracker.on_failed("b", 1, 0);

        tracker.retain(|id| id == "a");
        assert!(tracker.is_flagged("a"));
        assert!(!tracker.is_flagged("b"));
        assert_eq!(tracker.failures("b"), 0);
    }
}
