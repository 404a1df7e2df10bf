//! Heartbeat management for the streaming connection.
//!
//! Sends a ping on a fixed period and treats the stream as dead when no
//! inbound frame of any kind (heartbeat ack or data) arrives within the
//! timeout.

use pricesync_core::SharedClock;
use std::time::Duration;
use tracing::debug;

/// Heartbeat manager for one streaming session.
pub struct HeartbeatManager {
    /// Heartbeat interval (how often to send ping).
    interval_ms: u64,
    /// Silence after which the stream is considered dead.
    timeout_ms: u64,
    clock: SharedClock,
    /// Last ping sent time.
    last_ping: Option<i64>,
    /// Last inbound frame time (any frame).
    last_inbound: i64,
}

impl HeartbeatManager {
    /// Create a new heartbeat manager.
    pub fn new(interval_ms: u64, timeout_ms: u64, clock: SharedClock) -> Self {
        let now = clock.now_ms();
        Self {
            interval_ms,
            timeout_ms,
            clock,
            last_ping: None,
            last_inbound: now,
        }
    }

    /// Reset heartbeat state (called on connection).
    pub fn reset(&mut self) {
        self.last_ping = None;
        self.last_inbound = self.clock.now_ms();
    }

    /// Record that a ping was sent.
    pub fn record_ping(&mut self) {
        let now = self.clock.now_ms();
        self.last_ping = Some(now);
        debug!(time = now, "Recorded ping");
    }

    /// Record that any frame was received.
    pub fn record_inbound(&mut self) {
        self.last_inbound = self.clock.now_ms();
    }

    /// Milliseconds since the last inbound frame.
    pub fn silence_ms(&self) -> i64 {
        self.clock.now_ms().saturating_sub(self.last_inbound)
    }

    /// Check if the stream has been silent past the timeout.
    pub fn is_timed_out(&self) -> bool {
        self.silence_ms() >= self.timeout_ms as i64
    }

    /// Check if a ping is due (fixed period, regardless of traffic).
    pub fn should_send_ping(&self) -> bool {
        match self.last_ping {
            None => true,
            Some(at) => self.clock.now_ms().saturating_sub(at) >= self.interval_ms as i64,
        }
    }

    /// How often the driver should evaluate the heartbeat.
    pub fn check_period(&self) -> Duration {
        let finest = self.interval_ms.min(self.timeout_ms).max(2);
        Duration::from_millis(finest / 2)
    }
}
