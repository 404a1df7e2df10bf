//! Prometheus metrics for the pricing synchronization engine.
//!
//! # Panics
//!
//! Metric registration uses `unwrap()` intentionally. A registration failure
//! means duplicate metric names, a startup bug that should crash
//! immediately. These panics only occur during static initialization.

use crate::error::{TelemetryError, TelemetryResult};
use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec, register_histogram, register_int_counter, register_int_gauge,
    register_int_gauge_vec, CounterVec, Encoder, Histogram, IntCounter, IntGauge, IntGaugeVec,
    TextEncoder,
};

/// Connection state (1 = active, 0 = inactive).
/// Labels: state (disconnected/connecting/connected/degraded/failed)
pub static CONNECTION_STATE: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec!(
        "pricesync_connection_state",
        "Connection state machine current state (1=active, 0=inactive)",
        &["state"]
    )
    .unwrap()
});

/// Reconnect attempts by trigger.
pub static RECONNECT_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "pricesync_reconnect_total",
        "Total stream reconnection attempts",
        &["reason"]
    )
    .unwrap()
});

/// Inbound frames (stream or poll) by kind.
pub static INBOUND_MESSAGES_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "pricesync_inbound_messages_total",
        "Total inbound frames received",
        &["source"]
    )
    .unwrap()
});

pub static UPDATES_APPLIED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "pricesync_updates_applied_total",
        "Remote updates that changed confirmed state"
    )
    .unwrap()
});

pub static DUPLICATE_UPDATES_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "pricesync_duplicate_updates_total",
        "Remote updates ignored by the version guard"
    )
    .unwrap()
});

pub static MALFORMED_MESSAGES_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "pricesync_malformed_messages_total",
        "Inbound frames or batch members dropped as malformed"
    )
    .unwrap()
});

/// Conflicts by outcome (local_wins/remote_wins/awaiting_decision/resolved_*).
pub static CONFLICTS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "pricesync_conflicts_total",
        "Conflicts between pending edits and remote updates",
        &["strategy", "outcome"]
    )
    .unwrap()
});

pub static FANOUT_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "pricesync_fanout_total",
        "Observer callbacks delivered"
    )
    .unwrap()
});

pub static OBSERVER_PANICS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "pricesync_observer_panics_total",
        "Observer callbacks that panicked"
    )
    .unwrap()
});

/// Persistence failures by operation (load/save).
pub static PERSISTENCE_FAILURES_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "pricesync_persistence_failures_total",
        "Snapshot load/save failures",
        &["op"]
    )
    .unwrap()
});

/// Edits pushed to the service by result (accepted/rejected/failed).
pub static SYNC_EDITS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "pricesync_sync_edits_total",
        "Pending edits pushed to the pricing service",
        &["result"]
    )
    .unwrap()
});

pub static PENDING_EDITS: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!("pricesync_pending_edits", "Outstanding local edits").unwrap()
});

pub static PENDING_CONFLICTS: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "pricesync_pending_conflicts",
        "Interactive conflicts awaiting a decision"
    )
    .unwrap()
});

pub static SUBSCRIPTIONS: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!("pricesync_subscriptions", "Ids with at least one subscriber").unwrap()
});

/// Receive time minus server timestamp, in milliseconds.
pub static UPDATE_LATENCY_MS: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!(
        "pricesync_update_latency_ms",
        "Update latency (receive time - server timestamp) in milliseconds",
        vec![1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 5000.0]
    )
    .unwrap()
});

/// Outbound frames by kind.
pub static OUTBOUND_MESSAGES_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "pricesync_outbound_messages_total",
        "Outbound stream messages queued",
        &["kind"]
    )
    .unwrap()
});

/// Metrics helper for easy access.
pub struct Metrics;

impl Metrics {
    /// Set the active connection state. All other states are reset to 0.
    pub fn connection_state(state: &str) {
        for s in &["disconnected", "connecting", "connected", "degraded", "failed"] {
            CONNECTION_STATE.with_label_values(&[s]).set(0);
        }
        CONNECTION_STATE.with_label_values(&[state]).set(1);
    }

    pub fn reconnect(reason: &str) {
        RECONNECT_TOTAL.with_label_values(&[reason]).inc();
    }

    /// Record an inbound frame. `source` is `stream` or `poll`.
    pub fn inbound_message(source: &str) {
        INBOUND_MESSAGES_TOTAL.with_label_values(&[source]).inc();
    }

    pub fn update_applied() {
        UPDATES_APPLIED_TOTAL.inc();
    }

    pub fn duplicate_updates(count: u64) {
        DUPLICATE_UPDATES_TOTAL.inc_by(count);
    }

    pub fn malformed(count: u64) {
        MALFORMED_MESSAGES_TOTAL.inc_by(count);
    }

    pub fn conflict(strategy: &str, outcome: &str) {
        CONFLICTS_TOTAL.with_label_values(&[strategy, outcome]).inc();
    }

    pub fn fanout(delivered: u64) {
        FANOUT_TOTAL.inc_by(delivered);
    }

    pub fn observer_panics(count: u64) {
        OBSERVER_PANICS_TOTAL.inc_by(count);
    }

    pub fn persistence_failure(op: &str) {
        PERSISTENCE_FAILURES_TOTAL.with_label_values(&[op]).inc();
    }

    /// Record pushed edits. `result` is `accepted`, `rejected` or `failed`.
    pub fn sync_edits(result: &str, count: usize) {
        SYNC_EDITS_TOTAL
            .with_label_values(&[result])
            .inc_by(count as f64);
    }

    pub fn pending_edits(count: usize) {
        PENDING_EDITS.set(count as i64);
    }

    pub fn pending_conflicts(count: usize) {
        PENDING_CONFLICTS.set(count as i64);
    }

    pub fn subscriptions(count: usize) {
        SUBSCRIPTIONS.set(count as i64);
    }

    pub fn update_latency(latency_ms: f64) {
        UPDATE_LATENCY_MS.observe(latency_ms);
    }

    pub fn outbound_message(kind: &str) {
        OUTBOUND_MESSAGES_TOTAL.with_label_values(&[kind]).inc();
    }

    /// Render every registered metric in the Prometheus text format.
    pub fn encode_text() -> TelemetryResult<String> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&prometheus::gather(), &mut buffer)
            .map_err(|e| TelemetryError::Metrics(e.to_string()))?;
        String::from_utf8(buffer).map_err(|e| TelemetryError::Metrics(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_state_is_one_hot() {
        Metrics::connection_state("connecting");
        Metrics::connection_state("degraded");

        assert_eq!(CONNECTION_STATE.with_label_values(&["degraded"]).get(), 1);
        assert_eq!(CONNECTION_STATE.with_label_values(&["connecting"]).get(), 0);
    }

    #[test]
    fn test_encode_text_contains_registered_metrics() {
        Metrics::conflict("latest-wins", "local_wins");
        Metrics::update_applied();

        let text = Metrics::encode_text().unwrap();
        assert!(text.contains("pricesync_conflicts_total"));
        assert!(text.contains("pricesync_updates_applied_total"));
    }
}
