//! Subscription registry.
//!
//! Ref-counts interest per entity id so that several collaborators watching
//! the same id share one wire-level subscription. Only the 0→1 and 1→0
//! transitions produce control messages.

use crate::message::OutboundMessage;
use pricesync_core::EntityId;
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Ref-counted interest set.
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    /// id -> ref count (always > 0 while present).
    refs: BTreeMap<EntityId, u32>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one consumer's interest in `id`.
    ///
    /// Returns the subscribe message on the 0→1 transition.
    pub fn subscribe(&mut self, id: &str) -> Option<OutboundMessage> {
        let count = self.refs.entry(id.to_string()).or_insert(0);
        *count += 1;
        debug!(id, ref_count = *count, "Subscription ref added");

        (*count == 1).then(|| OutboundMessage::subscribe(id))
    }

    /// Drop one consumer's interest in `id`.
    ///
    /// Returns the unsubscribe message on the 1→0 transition. Unknown ids
    /// are a no-op.
    pub fn unsubscribe(&mut self, id: &str) -> Option<OutboundMessage> {
        let Some(count) = self.refs.get_mut(id) else {
            debug!(id, "Unsubscribe for unknown id ignored");
            return None;
        };

        *count -= 1;
        debug!(id, ref_count = *count, "Subscription ref released");

        if *count == 0 {
            self.refs.remove(id);
            Some(OutboundMessage::unsubscribe(id))
        } else {
            None
        }
    }

    /// Subscribe messages for every active id.
    ///
    /// Server-side subscriptions do not survive a reconnect, so this is
    /// replayed on every transition into `Connected`.
    pub fn resubscribe_all(&self) -> Vec<OutboundMessage> {
        info!(count = self.refs.len(), "Restoring subscriptions");
        self.refs.keys().map(OutboundMessage::subscribe).collect()
    }

    pub fn ref_count(&self, id: &str) -> u32 {
        self.refs.get(id).copied().unwrap_or(0)
    }

    pub fn is_subscribed(&self, id: &str) -> bool {
        self.refs.contains_key(id)
    }

    /// Active ids in sorted order.
    pub fn active_ids(&self) -> Vec<EntityId> {
        self.refs.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.refs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.refs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_subscribe_emits_message() {
        let mut registry = SubscriptionRegistry::new();
        assert_eq!(
            registry.subscribe("sku-42"),
            Some(OutboundMessage::subscribe("sku-42"))
        );
        assert_eq!(registry.ref_count("sku-42"), 1);
    }

    #[test]
    fn test_ref_counting_coalesces_consumers() {
        let mut registry = SubscriptionRegistry::new();
        assert!(registry.subscribe("sku-42").is_some());
        assert!(registry.subscribe("sku-42").is_none());
        assert_eq!(registry.ref_count("sku-42"), 2);

        // First release keeps the subscription alive
        assert!(registry.unsubscribe("sku-42").is_none());
        assert!(registry.is_subscribed("sku-42"));

        // Second release removes it with exactly one unsubscribe
        assert_eq!(
            registry.unsubscribe("sku-42"),
            Some(OutboundMessage::unsubscribe("sku-42"))
        );
        assert!(!registry.is_subscribed("sku-42"));
        assert!(registry.unsubscribe("sku-42").is_none());
    }

    #[test]
    fn test_unsubscribe_unknown_is_noop() {
        let mut registry = SubscriptionRegistry::new();
        assert!(registry.unsubscribe("missing").is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_resubscribe_all_replays_active_ids_sorted() {
        let mut registry = SubscriptionRegistry::new();
        registry.subscribe("b");
        registry.subscribe("a");
        registry.subscribe("a");
        registry.subscribe("c");
        registry.unsubscribe("c");

        assert_eq!(
            registry.resubscribe_all(),
            vec![OutboundMessage::subscribe("a"), OutboundMessage::subscribe("b")]
        );
        assert_eq!(registry.active_ids(), vec!["a".to_string(), "b".to_string()]);
    }
}
