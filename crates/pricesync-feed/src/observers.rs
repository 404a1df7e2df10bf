//! Observer registry for confirmed price changes and conflict notices.
//!
//! Callbacks run on the engine task, in registration order. A panicking
//! callback is caught and logged; the remaining observers still run.

use crate::conflict::ConflictNotice;
use pricesync_core::{EntityId, PriceEntity};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use tracing::{debug, error};

pub type PriceCallback = Box<dyn Fn(&PriceEntity) + Send>;
pub type ConflictCallback = Box<dyn Fn(&ConflictNotice) + Send>;

/// Token returned by `watch`, used to unwatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WatchId(u64);

impl WatchId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

#[derive(Default)]
pub struct ObserverRegistry {
    watchers: HashMap<EntityId, Vec<(WatchId, PriceCallback)>>,
    conflict_listeners: Vec<(WatchId, ConflictCallback)>,
    next_id: u64,
}

impl ObserverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_watch_id(&mut self) -> WatchId {
        self.next_id += 1;
        WatchId(self.next_id)
    }

    pub fn watch(&mut self, id: &str, callback: PriceCallback) -> WatchId {
        let watch_id = self.next_watch_id();
        self.watchers
            .entry(id.to_string())
            .or_default()
            .push((watch_id, callback));
        debug!(id, watch_id = watch_id.0, "Observer registered");
        watch_id
    }

    /// Returns false if `watch_id` was not registered for `id`.
    pub fn unwatch(&mut self, id: &str, watch_id: WatchId) -> bool {
        let Some(list) = self.watchers.get_mut(id) else {
            return false;
        };
        let before = list.len();
        list.retain(|(w, _)| *w != watch_id);
        let removed = list.len() != before;
        if list.is_empty() {
            self.watchers.remove(id);
        }
        removed
    }

    pub fn watch_conflicts(&mut self, callback: ConflictCallback) -> WatchId {
        let watch_id = self.next_watch_id();
        self.conflict_listeners.push((watch_id, callback));
        watch_id
    }

    pub fn unwatch_conflicts(&mut self, watch_id: WatchId) -> bool {
        let before = self.conflict_listeners.len();
        self.conflict_listeners.retain(|(w, _)| *w != watch_id);
        self.conflict_listeners.len() != before
    }

    pub fn watcher_count(&self, id: &str) -> usize {
        self.watchers.get(id).map_or(0, Vec::len)
    }

    pub fn conflict_listener_count(&self) -> usize {
        self.conflict_listeners.len()
    }

    /// Deliver a confirmed change to every watcher of its id.
    ///
    /// Returns the number of callbacks that completed without panicking.
    pub fn notify(&self, entity: &PriceEntity) -> usize {
        let Some(list) = self.watchers.get(&entity.id) else {
            return 0;
        };

        let mut delivered = 0;
        for (watch_id, callback) in list {
            match catch_unwind(AssertUnwindSafe(|| callback(entity))) {
                Ok(()) => delivered += 1,
                Err(panic) => error!(
                    id = %entity.id,
                    watch_id = watch_id.0,
                    panic = panic_message(panic.as_ref()),
                    "Price observer panicked"
                ),
            }
        }
        delivered
    }

    pub fn notify_conflict(&self, notice: &ConflictNotice) -> usize {
        let mut delivered = 0;
        for (watch_id, callback) in &self.conflict_listeners {
            match catch_unwind(AssertUnwindSafe(|| callback(notice))) {
                Ok(()) => delivered += 1,
                Err(panic) => error!(
                    id = %notice.ticket.id,
                    watch_id = watch_id.0,
                    panic = panic_message(panic.as_ref()),
                    "Conflict listener panicked"
                ),
            }
        }
        delivered
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conflict::ConflictTicket;
    use pricesync_core::{NormalizedUpdate, Origin, PendingEdit, Price};
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    fn entity(id: &str) -> PriceEntity {
        PriceEntity {
            id: id.to_string(),
            price: Price::new(dec!(1.5)),
            version: 1,
            origin: Origin::Server,
            last_updated: 0,
        }
    }

    fn counter() -> (Arc<AtomicUsize>, PriceCallback) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        (
            count,
            Box::new(move |_| {
                c.fetch_add(1, Ordering::SeqCst);
            }),
        )
    }

    #[test]
    fn test_notify_only_matching_id() {
        let mut registry = ObserverRegistry::new();
        let (a_count, a_cb) = counter();
        let (b_count, b_cb) = counter();
        registry.watch("a", a_cb);
        registry.watch("b", b_cb);

        assert_eq!(registry.notify(&entity("a")), 1);
        assert_eq!(a_count.load(Ordering::SeqCst), 1);
        assert_eq!(b_count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_unwatch_by_token() {
        let mut registry = ObserverRegistry::new();
        let (count, cb) = counter();
        let (_, other) = counter();
        let watch_id = registry.watch("a", cb);
        let other_id = registry.watch("a", other);

        assert!(registry.unwatch("a", watch_id));
        assert!(!registry.unwatch("a", watch_id));
        assert!(!registry.unwatch("b", other_id));
        assert_eq!(registry.watcher_count("a"), 1);

        registry.notify(&entity("a"));
        assert_eq!(count.load(Ordering::SeqCst), 0);

        assert!(registry.unwatch("a", other_id));
        assert_eq!(registry.watcher_count("a"), 0);
    }

    #[test]
    fn test_panicking_observer_does_not_block_others() {
        let mut registry = ObserverRegistry::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let s = seen.clone();
        registry.watch("a", Box::new(move |e| s.lock().unwrap().push(format!("first {}", e.price))));
        registry.watch("a", Box::new(|_| panic!("observer bug")));
        let s = seen.clone();
        registry.watch("a", Box::new(move |e| s.lock().unwrap().push(format!("third {}", e.price))));

        assert_eq!(registry.notify(&entity("a")), 2);
        assert_eq!(*seen.lock().unwrap(), vec!["first 1.5", "third 1.5"]);
    }

    #[test]
    fn test_conflict_listeners() {
        let mut registry = ObserverRegistry::new();
        let tickets = Arc::new(Mutex::new(Vec::new()));
        let t = tickets.clone();
        let listener = registry.watch_conflicts(Box::new(move |n| t.lock().unwrap().push(n.ticket.clone())));
        registry.watch_conflicts(Box::new(|_| panic!("listener bug")));

        let notice = ConflictNotice {
            ticket: ConflictTicket {
                id: "a".to_string(),
                seq: 1,
            },
            local_edit: PendingEdit {
                id: "a".to_string(),
                proposed_price: Price::new(dec!(2)),
                submitted_at: 0,
                client_seq: 1,
            },
            remote_update: NormalizedUpdate {
                id: "a".to_string(),
                price: Price::new(dec!(3)),
                timestamp: 0,
                version: 2,
            },
            current: None,
        };

        assert_eq!(registry.notify_conflict(&notice), 1);
        assert_eq!(tickets.lock().unwrap().len(), 1);

        assert!(registry.unwatch_conflicts(listener));
        assert_eq!(registry.conflict_listener_count(), 1);
    }
}
