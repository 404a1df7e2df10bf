//! In-process sync statistics.
//!
//! Prometheus answers "what happened" for an operator; `SyncMetrics` answers
//! it for the engine's own `status()` call: totals, throughput, latency,
//! error rate and cumulative connection uptime.

use pricesync_core::SharedClock;
use serde::Serialize;

/// Point-in-time copy of the collected statistics.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub inbound_messages: u64,
    pub updates_applied: u64,
    pub duplicates: u64,
    pub malformed: u64,
    pub errors: u64,
    pub conflicts: u64,
    pub reconnects: u64,
    pub fanouts: u64,
    pub persistence_failures: u64,
    pub sync_accepted: u64,
    pub sync_rejected: u64,
    /// Applied updates per second since start.
    pub updates_per_sec: f64,
    /// Mean of (receive time - server timestamp), ms.
    pub avg_latency_ms: f64,
    /// Errors per inbound message.
    pub error_rate: f64,
    /// Cumulative time spent `Connected`, ms.
    pub connected_uptime_ms: i64,
    pub elapsed_ms: i64,
}

/// Running totals owned by the engine task.
pub struct SyncMetrics {
    clock: SharedClock,
    started_at: i64,
    inbound_messages: u64,
    updates_applied: u64,
    duplicates: u64,
    malformed: u64,
    errors: u64,
    conflicts: u64,
    reconnects: u64,
    fanouts: u64,
    persistence_failures: u64,
    sync_accepted: u64,
    sync_rejected: u64,
    latency_sum_ms: f64,
    latency_samples: u64,
    connected_since: Option<i64>,
    uptime_ms: i64,
}

impl SyncMetrics {
    pub fn new(clock: SharedClock) -> Self {
        let started_at = clock.now_ms();
        Self {
            clock,
            started_at,
            inbound_messages: 0,
            updates_applied: 0,
            duplicates: 0,
            malformed: 0,
            errors: 0,
            conflicts: 0,
            reconnects: 0,
            fanouts: 0,
            persistence_failures: 0,
            sync_accepted: 0,
            sync_rejected: 0,
            latency_sum_ms: 0.0,
            latency_samples: 0,
            connected_since: None,
            uptime_ms: 0,
        }
    }

    pub fn record_inbound(&mut self) {
        self.inbound_messages += 1;
    }

    /// Record an applied update with its server timestamp.
    pub fn record_update(&mut self, server_timestamp_ms: i64) {
        self.updates_applied += 1;
        let latency = self.clock.now_ms().saturating_sub(server_timestamp_ms);
        // Clock skew can make this negative; those samples say nothing
        if latency >= 0 {
            self.latency_sum_ms += latency as f64;
            self.latency_samples += 1;
        }
    }

    pub fn record_duplicates(&mut self, count: u64) {
        self.duplicates += count;
    }

    /// Malformed input also counts as an error.
    pub fn record_malformed(&mut self, count: u64) {
        self.malformed += count;
        self.errors += count;
    }

    pub fn record_error(&mut self) {
        self.errors += 1;
    }

    pub fn record_conflict(&mut self) {
        self.conflicts += 1;
    }

    pub fn record_reconnect(&mut self) {
        self.reconnects += 1;
    }

    pub fn record_fanout(&mut self, delivered: u64) {
        self.fanouts += delivered;
    }

    pub fn record_persistence_failure(&mut self) {
        self.persistence_failures += 1;
        self.errors += 1;
    }

    pub fn record_sync(&mut self, accepted: u64, rejected: u64) {
        self.sync_accepted += accepted;
        self.sync_rejected += rejected;
    }

    /// Track connection uptime. Idempotent per state.
    pub fn set_connected(&mut self, connected: bool) {
        let now = self.clock.now_ms();
        match (connected, self.connected_since) {
            (true, None) => self.connected_since = Some(now),
            (false, Some(since)) => {
                self.uptime_ms += now.saturating_sub(since);
                self.connected_since = None;
            }
            _ => {}
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let now = self.clock.now_ms();
        let elapsed_ms = now.saturating_sub(self.started_at);
        let current_session = self
            .connected_since
            .map_or(0, |since| now.saturating_sub(since));

        let updates_per_sec = if elapsed_ms > 0 {
            self.updates_applied as f64 * 1000.0 / elapsed_ms as f64
        } else {
            0.0
        };
        let avg_latency_ms = if self.latency_samples > 0 {
            self.latency_sum_ms / self.latency_samples as f64
        } else {
            0.0
        };
        let error_rate = if self.inbound_messages > 0 {
            self.errors as f64 / self.inbound_messages as f64
        } else {
            0.0
        };

        MetricsSnapshot {
            inbound_messages: self.inbound_messages,
            updates_applied: self.updates_applied,
            duplicates: self.duplicates,
            malformed: self.malformed,
            errors: self.errors,
            conflicts: self.conflicts,
            reconnects: self.reconnects,
            fanouts: self.fanouts,
            persistence_failures: self.persistence_failures,
            sync_accepted: self.sync_accepted,
            sync_rejected: self.sync_rejected,
            updates_per_sec,
            avg_latency_ms,
            error_rate,
            connected_uptime_ms: self.uptime_ms + current_session,
            elapsed_ms,
        }
    }
}
