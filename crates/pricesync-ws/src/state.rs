//! Connection state machine.
//!
//! Pure transition table for the connection lifecycle. The async driver in
//! [`crate::connection`] feeds inputs in and performs the returned actions,
//! so backoff and max-attempt logic can be tested without timers.

use std::time::Duration;
use tracing::{debug, error, warn};

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Streaming abandoned; polling the REST endpoint instead.
    Degraded,
    /// Reconnect budget exhausted. Transient: always followed by `Degraded`.
    Failed,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Degraded => "degraded",
            Self::Failed => "failed",
        }
    }

    pub const ALL: [ConnectionState; 5] = [
        Self::Disconnected,
        Self::Connecting,
        Self::Connected,
        Self::Degraded,
        Self::Failed,
    ];
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inputs to the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionInput {
    ConnectRequested,
    Opened,
    /// Server closed the stream, or the stream ended.
    Closed,
    TransportError,
    /// No inbound traffic within the heartbeat timeout.
    HeartbeatTimeout,
    BackoffElapsed,
    DisconnectRequested,
}

/// What the driver must do after a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionAction {
    /// Nothing to do.
    None,
    OpenStream,
    /// Sleep `delay`, then feed `BackoffElapsed`.
    ScheduleReconnect { attempt: u32, delay: Duration },
    /// Switch to the polling loop for the rest of the session.
    StartPolling,
    /// Tear down any stream or timer and go idle.
    Stop,
}

/// Exponential backoff parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Consecutive failures tolerated before giving up on streaming (0 = unlimited).
    pub max_attempts: u32,
}

impl ReconnectPolicy {
    /// Backoff before reconnect attempt number `attempt` (1-based).
    ///
    /// attempt=1 -> base, attempt=2 -> 2*base, attempt=3 -> 4*base, capped.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(20);
        let delay = self
            .base_delay_ms
            .saturating_mul(1u64 << exponent)
            .min(self.max_delay_ms);
        Duration::from_millis(delay)
    }

    /// Whether `failures` consecutive failures exceed the budget.
    pub fn is_exhausted(&self, failures: u32) -> bool {
        self.max_attempts > 0 && failures > self.max_attempts
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            max_delay_ms: 60_000,
            max_attempts: 10,
        }
    }
}

/// Explicit connection state machine.
#[derive(Debug, Clone)]
pub struct ConnectionStateMachine {
    state: ConnectionState,
    policy: ReconnectPolicy,
    /// Consecutive failures since the last successful open.
    failures: u32,
    /// Set once streaming is abandoned; sticky for the session.
    stream_abandoned: bool,
    /// A reconnect timer is outstanding.
    backoff_pending: bool,
    /// Every state entered, in order, since the last `drain_transitions`.
    transitions: Vec<ConnectionState>,
}

impl ConnectionStateMachine {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            policy,
            failures: 0,
            stream_abandoned: false,
            backoff_pending: false,
            transitions: Vec::new(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn is_stream_abandoned(&self) -> bool {
        self.stream_abandoned
    }

    /// States entered since the last call, oldest first.
    pub fn drain_transitions(&mut self) -> Vec<ConnectionState> {
        std::mem::take(&mut self.transitions)
    }

    fn enter(&mut self, next: ConnectionState) {
        if self.state != next {
            debug!(from = %self.state, to = %next, "Connection state transition");
            self.state = next;
            self.transitions.push(next);
        }
    }

    /// Apply one input and return the action the driver must perform.
    pub fn handle(&mut self, input: ConnectionInput) -> ConnectionAction {
        use ConnectionInput as I;
        use ConnectionState as S;

        match (self.state, input) {
            (_, I::DisconnectRequested) => {
                self.enter(S::Disconnected);
                self.failures = 0;
                self.backoff_pending = false;
                ConnectionAction::Stop
            }

            (S::Disconnected, I::ConnectRequested) => {
                if self.stream_abandoned {
                    self.enter(S::Degraded);
                    ConnectionAction::StartPolling
                } else {
                    self.enter(S::Connecting);
                    ConnectionAction::OpenStream
                }
            }
            (S::Disconnected, I::BackoffElapsed) if self.backoff_pending => {
                self.backoff_pending = false;
                self.enter(S::Connecting);
                ConnectionAction::OpenStream
            }

            (S::Connecting, I::Opened) => {
                self.failures = 0;
                self.enter(S::Connected);
                ConnectionAction::None
            }

            (S::Connecting | S::Connected, I::Closed | I::TransportError | I::HeartbeatTimeout) => {
                self.on_failure(input)
            }

            // Polling is terminal for the session
            (S::Degraded, _) => ConnectionAction::None,

            (state, input) => {
                debug!(%state, ?input, "Ignored connection input");
                ConnectionAction::None
            }
        }
    }

    fn on_failure(&mut self, input: ConnectionInput) -> ConnectionAction {
        self.failures = self.failures.saturating_add(1);
        self.enter(ConnectionState::Disconnected);

        if self.policy.is_exhausted(self.failures) {
            error!(
                failures = self.failures,
                max_attempts = self.policy.max_attempts,
                "Max reconnection attempts exceeded, falling back to polling"
            );
            self.stream_abandoned = true;
            self.enter(ConnectionState::Failed);
            self.enter(ConnectionState::Degraded);
            return ConnectionAction::StartPolling;
        }

        let delay = self.policy.delay_for(self.failures);
        self.backoff_pending = true;
        warn!(
            ?input,
            attempt = self.failures,
            delay_ms = delay.as_millis() as u64,
            "Scheduling reconnect"
        );
        ConnectionAction::ScheduleReconnect {
            attempt: self.failures,
            delay,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(max_attempts: u32) -> ReconnectPolicy {
        ReconnectPolicy {
            base_delay_ms: 100,
            max_delay_ms: 1_000,
            max_attempts,
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let p = policy(0);
        assert_eq!(p.delay_for(1), Duration::from_millis(100));
        assert_eq!(p.delay_for(2), Duration::from_millis(200));
        assert_eq!(p.delay_for(3), Duration::from_millis(400));
        assert_eq!(p.delay_for(4), Duration::from_millis(800));
        assert_eq!(p.delay_for(5), Duration::from_millis(1_000));
        assert_eq!(p.delay_for(60), Duration::from_millis(1_000));
    }

    #[test]
    fn test_happy_path() {
        let mut sm = ConnectionStateMachine::new(policy(3));
        assert_eq!(sm.handle(ConnectionInput::ConnectRequested), ConnectionAction::OpenStream);
        assert_eq!(sm.state(), ConnectionState::Connecting);
        assert_eq!(sm.handle(ConnectionInput::Opened), ConnectionAction::None);
        assert_eq!(sm.state(), ConnectionState::Connected);
        assert_eq!(
            sm.drain_transitions(),
            vec![ConnectionState::Connecting, ConnectionState::Connected]
        );
    }

    #[test]
    fn test_failure_schedules_backoff_and_open_resets_attempts() {
        let mut sm = ConnectionStateMachine::new(policy(5));
        sm.handle(ConnectionInput::ConnectRequested);

        let action = sm.handle(ConnectionInput::TransportError);
        assert_eq!(
            action,
            ConnectionAction::ScheduleReconnect {
                attempt: 1,
                delay: Duration::from_millis(100)
            }
        );
        assert_eq!(sm.state(), ConnectionState::Disconnected);

        assert_eq!(sm.handle(ConnectionInput::BackoffElapsed), ConnectionAction::OpenStream);
        let action = sm.handle(ConnectionInput::Closed);
        assert_eq!(
            action,
            ConnectionAction::ScheduleReconnect {
                attempt: 2,
                delay: Duration::from_millis(200)
            }
        );

        sm.handle(ConnectionInput::BackoffElapsed);
        sm.handle(ConnectionInput::Opened);
        assert_eq!(sm.failures(), 0);

        // Heartbeat timeout is treated like a close
        let action = sm.handle(ConnectionInput::HeartbeatTimeout);
        assert_eq!(
            action,
            ConnectionAction::ScheduleReconnect {
                attempt: 1,
                delay: Duration::from_millis(100)
            }
        );
    }

    #[test]
    fn test_exceeding_max_attempts_degrades_permanently() {
        let mut sm = ConnectionStateMachine::new(policy(2));
        sm.handle(ConnectionInput::ConnectRequested);

        // Failures 1 and 2 are within budget
        for _ in 0..2 {
            assert!(matches!(
                sm.handle(ConnectionInput::TransportError),
                ConnectionAction::ScheduleReconnect { .. }
            ));
            sm.handle(ConnectionInput::BackoffElapsed);
        }
        sm.drain_transitions();

        // Third consecutive failure exceeds it
        assert_eq!(sm.handle(ConnectionInput::TransportError), ConnectionAction::StartPolling);
        assert_eq!(sm.state(), ConnectionState::Degraded);
        assert_eq!(
            sm.drain_transitions(),
            vec![
                ConnectionState::Disconnected,
                ConnectionState::Failed,
                ConnectionState::Degraded
            ]
        );

        // No further stream attempts
        assert_eq!(sm.handle(ConnectionInput::BackoffElapsed), ConnectionAction::None);
        assert_eq!(sm.handle(ConnectionInput::ConnectRequested), ConnectionAction::None);
        assert_eq!(sm.state(), ConnectionState::Degraded);
    }

    #[test]
    fn test_reconnect_after_disconnect_stays_on_polling() {
        let mut sm = ConnectionStateMachine::new(policy(1));
        sm.handle(ConnectionInput::ConnectRequested);
        sm.handle(ConnectionInput::TransportError);
        sm.handle(ConnectionInput::BackoffElapsed);
        assert_eq!(sm.handle(ConnectionInput::TransportError), ConnectionAction::StartPolling);

        assert_eq!(sm.handle(ConnectionInput::DisconnectRequested), ConnectionAction::Stop);
        assert_eq!(sm.state(), ConnectionState::Disconnected);
        assert!(sm.is_stream_abandoned());

        assert_eq!(sm.handle(ConnectionInput::ConnectRequested), ConnectionAction::StartPolling);
        assert_eq!(sm.state(), ConnectionState::Degraded);
    }

    #[test]
    fn test_disconnect_during_backoff_stops() {
        let mut sm = ConnectionStateMachine::new(policy(0));
        sm.handle(ConnectionInput::ConnectRequested);
        sm.handle(ConnectionInput::Closed);

        assert_eq!(sm.handle(ConnectionInput::DisconnectRequested), ConnectionAction::Stop);
        assert_eq!(sm.state(), ConnectionState::Disconnected);
        assert_eq!(sm.failures(), 0);

        // A late timer firing after disconnect must not reopen
        assert_eq!(sm.handle(ConnectionInput::BackoffElapsed), ConnectionAction::None);
        assert_eq!(sm.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_unlimited_attempts_never_degrade() {
        let mut sm = ConnectionStateMachine::new(policy(0));
        sm.handle(ConnectionInput::ConnectRequested);
        for _ in 0..100 {
            assert!(matches!(
                sm.handle(ConnectionInput::TransportError),
                ConnectionAction::ScheduleReconnect { .. }
            ));
            sm.handle(ConnectionInput::BackoffElapsed);
        }
        assert_eq!(sm.state(), ConnectionState::Connecting);
    }
}
