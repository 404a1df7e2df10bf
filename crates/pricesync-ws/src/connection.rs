//! Connection manager.
//!
//! Owns the single logical channel to the pricing service: the WebSocket
//! stream while it is healthy, and the REST polling loop once reconnection
//! has been given up. All lifecycle decisions come from
//! [`ConnectionStateMachine`]; this module only performs its actions.

use crate::error::{WsError, WsResult};
use crate::heartbeat::HeartbeatManager;
use crate::message::OutboundMessage;
use crate::state::{
    ConnectionAction, ConnectionInput, ConnectionState, ConnectionStateMachine, ReconnectPolicy,
};
use crate::ws_write_handle::WsWriteHandle;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use pricesync_core::{EntityId, SharedClock};
use pricesync_rest::PricingBackend;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex as TokioMutex};
use tokio_tungstenite::{connect_async_tls_with_config, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Connection configuration.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// WebSocket URL.
    pub url: String,
    /// Consecutive failures tolerated before falling back to polling (0 = infinite).
    pub max_reconnect_attempts: u32,
    /// Base delay for exponential backoff.
    pub reconnect_base_delay_ms: u64,
    /// Maximum delay for exponential backoff.
    pub reconnect_max_delay_ms: u64,
    /// Upper bound of random jitter added to each backoff (0 = none).
    pub reconnect_jitter_ms: u64,
    /// Heartbeat (ping) interval.
    pub heartbeat_interval_ms: u64,
    /// Inbound silence after which the stream is considered dead.
    pub heartbeat_timeout_ms: u64,
    /// Poll interval in degraded mode.
    pub poll_interval_ms: u64,
    /// Capacity of the outbound message queue.
    pub outbound_queue_size: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            max_reconnect_attempts: 10,
            reconnect_base_delay_ms: 1000,
            reconnect_max_delay_ms: 60000,
            reconnect_jitter_ms: 0,
            heartbeat_interval_ms: 30000,
            heartbeat_timeout_ms: 45000,
            poll_interval_ms: 5000,
            outbound_queue_size: 256,
        }
    }
}

impl ConnectionConfig {
    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            base_delay_ms: self.reconnect_base_delay_ms,
            max_delay_ms: self.reconnect_max_delay_ms,
            max_attempts: self.max_reconnect_attempts,
        }
    }
}

/// Events emitted to the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// The state machine entered a new state.
    StateChanged(ConnectionState),
    /// A stream session opened; subscriptions must be replayed.
    Opened,
    /// Raw inbound frame (or poll response body).
    Message(String),
    /// The stream closed; reconnection is handled internally.
    Closed(String),
    /// Transport or poll failure.
    Error(String),
}

/// Connection manager.
pub struct ConnectionManager {
    config: ConnectionConfig,
    clock: SharedClock,
    machine: Mutex<ConnectionStateMachine>,
    state_tx: watch::Sender<ConnectionState>,
    event_tx: mpsc::Sender<ConnectionEvent>,
    /// Interest set published by the engine; read by the polling loop.
    interest: watch::Receiver<Vec<EntityId>>,
    backend: Arc<dyn PricingBackend>,
    /// Outbound message sender (for WsWriteHandle).
    outbound_tx: mpsc::Sender<OutboundMessage>,
    /// Outbound message receiver (consumed by the session loop).
    outbound_rx: TokioMutex<mpsc::Receiver<OutboundMessage>>,
    /// Cancellation token for the current `connect()` run.
    session_token: Mutex<CancellationToken>,
}

impl ConnectionManager {
    /// Create a new connection manager.
    pub fn new(
        config: ConnectionConfig,
        backend: Arc<dyn PricingBackend>,
        interest: watch::Receiver<Vec<EntityId>>,
        event_tx: mpsc::Sender<ConnectionEvent>,
        clock: SharedClock,
    ) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::channel(config.outbound_queue_size.max(1));
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            machine: Mutex::new(ConnectionStateMachine::new(config.reconnect_policy())),
            config,
            clock,
            state_tx,
            event_tx,
            interest,
            backend,
            outbound_tx,
            outbound_rx: TokioMutex::new(outbound_rx),
            session_token: Mutex::new(CancellationToken::new()),
        }
    }

    /// Get a write handle for sending messages.
    ///
    /// The write handle can be cloned and shared across tasks.
    pub fn write_handle(&self) -> WsWriteHandle {
        WsWriteHandle::new(self.outbound_tx.clone(), self.state_tx.subscribe())
    }

    /// Observe connection state changes.
    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Get current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    /// Stop the current `connect()` run.
    ///
    /// Cancels the session token, which aborts a pending backoff sleep, the
    /// stream session, or the polling loop.
    pub fn disconnect(&self) {
        info!("ConnectionManager disconnect requested");
        self.session_token.lock().cancel();
    }

    /// Run the connection until `disconnect()` is called.
    pub async fn connect(&self) -> WsResult<()> {
        let token = {
            let mut guard = self.session_token.lock();
            if guard.is_cancelled() {
                *guard = CancellationToken::new();
            }
            guard.clone()
        };

        let mut action = self.apply(ConnectionInput::ConnectRequested).await;

        loop {
            action = match action {
                ConnectionAction::OpenStream => {
                    let input = self.run_stream(&token).await;
                    self.apply(input).await
                }
                ConnectionAction::ScheduleReconnect { attempt, delay } => {
                    let delay = delay + Duration::from_millis(jitter_ms(self.config.reconnect_jitter_ms));
                    debug!(attempt, delay_ms = delay.as_millis() as u64, "Waiting before reconnect");

                    // Wait for delay OR disconnect (cancellation-aware sleep)
                    tokio::select! {
                        () = tokio::time::sleep(delay) => {
                            self.apply(ConnectionInput::BackoffElapsed).await
                        }
                        () = token.cancelled() => {
                            info!("Disconnect requested during backoff");
                            self.apply(ConnectionInput::DisconnectRequested).await
                        }
                    }
                }
                ConnectionAction::StartPolling => {
                    self.run_polling(&token).await;
                    self.apply(ConnectionInput::DisconnectRequested).await
                }
                ConnectionAction::Stop => return Ok(()),
                ConnectionAction::None => {
                    let state = self.state();
                    if state == ConnectionState::Disconnected {
                        return Ok(());
                    }
                    return Err(WsError::ConnectionFailed(format!(
                        "connect() called while {state}"
                    )));
                }
            };
        }
    }

    /// Feed one input to the state machine and publish every state it entered.
    async fn apply(&self, input: ConnectionInput) -> ConnectionAction {
        let (action, transitions) = {
            let mut machine = self.machine.lock();
            let action = machine.handle(input);
            (action, machine.drain_transitions())
        };

        for state in transitions {
            self.state_tx.send_replace(state);
            self.emit(ConnectionEvent::StateChanged(state)).await;
        }

        action
    }

    async fn emit(&self, event: ConnectionEvent) {
        if self.event_tx.send(event).await.is_err() {
            warn!("Connection event receiver dropped");
        }
    }

    /// One stream session. Returns the input that ended it.
    async fn run_stream(&self, token: &CancellationToken) -> ConnectionInput {
        info!(url = %self.config.url, "Connecting to WebSocket");

        let connect = connect_async_tls_with_config(self.config.url.as_str(), None, true, None);
        let ws_stream = tokio::select! {
            result = connect => match result {
                Ok((stream, _response)) => stream,
                Err(e) => {
                    error!(?e, "WebSocket connection error");
                    self.emit(ConnectionEvent::Error(e.to_string())).await;
                    return ConnectionInput::TransportError;
                }
            },
            () = token.cancelled() => return ConnectionInput::DisconnectRequested,
        };
        let (mut write, mut read) = ws_stream.split();

        let mut outbound_rx = self.outbound_rx.lock().await;
        // Messages queued for a previous session are stale; the engine
        // replays what matters on Opened
        while outbound_rx.try_recv().is_ok() {}

        self.apply(ConnectionInput::Opened).await;
        info!("WebSocket connected");
        self.emit(ConnectionEvent::Opened).await;

        let mut heartbeat = HeartbeatManager::new(
            self.config.heartbeat_interval_ms,
            self.config.heartbeat_timeout_ms,
            self.clock.clone(),
        );
        heartbeat.reset();
        let mut check = tokio::time::interval(heartbeat.check_period());

        loop {
            tokio::select! {
                biased;

                () = token.cancelled() => {
                    info!("Disconnect signal received in message loop");
                    // Send WebSocket Close frame for graceful disconnect
                    if let Err(e) = write.send(Message::Close(None)).await {
                        warn!(?e, "Failed to send Close frame during disconnect");
                    }
                    return ConnectionInput::DisconnectRequested;
                }

                // Incoming message
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            heartbeat.record_inbound();
                            self.emit(ConnectionEvent::Message(text)).await;
                        }
                        Some(Ok(Message::Ping(data))) => {
                            heartbeat.record_inbound();
                            if let Err(e) = write.send(Message::Pong(data)).await {
                                return self.transport_failure(e.into()).await;
                            }
                        }
                        Some(Ok(Message::Close(frame))) => {
                            let (code, reason) = frame
                                .map(|f| (u16::from(f.code), f.reason.to_string()))
                                .unwrap_or((1000, "Normal close".to_string()));
                            warn!(code, %reason, "WebSocket closed by server");
                            let err = WsError::ConnectionClosed { code, reason };
                            self.emit(ConnectionEvent::Closed(err.to_string())).await;
                            return ConnectionInput::Closed;
                        }
                        Some(Ok(_)) => {
                            // Binary and pong frames still prove liveness
                            heartbeat.record_inbound();
                        }
                        Some(Err(e)) => {
                            error!(?e, "WebSocket read error");
                            return self.transport_failure(e.into()).await;
                        }
                        None => {
                            warn!("WebSocket stream ended");
                            self.emit(ConnectionEvent::Closed("stream ended".to_string())).await;
                            return ConnectionInput::Closed;
                        }
                    }
                }

                // Outbound message
                Some(outbound) = outbound_rx.recv() => {
                    let kind = outbound.kind();
                    let text = match outbound.to_json() {
                        Ok(text) => text,
                        Err(e) => {
                            error!(?e, kind, "Failed to encode outbound message");
                            continue;
                        }
                    };
                    if let Err(e) = write.send(Message::Text(text)).await {
                        return self.transport_failure(e.into()).await;
                    }
                    debug!(kind, "Sent outbound message");
                }

                // Heartbeat check
                _ = check.tick() => {
                    if heartbeat.is_timed_out() {
                        error!(silence_ms = heartbeat.silence_ms(), "Heartbeat timeout");
                        self.emit(ConnectionEvent::Closed(WsError::HeartbeatTimeout.to_string())).await;
                        return ConnectionInput::HeartbeatTimeout;
                    }

                    if heartbeat.should_send_ping() {
                        let ping = match OutboundMessage::Ping.to_json() {
                            Ok(ping) => ping,
                            Err(e) => return self.transport_failure(e.into()).await,
                        };
                        if let Err(e) = write.send(Message::Text(ping)).await {
                            return self.transport_failure(e.into()).await;
                        }
                        heartbeat.record_ping();
                        debug!("Sent heartbeat ping");
                    }
                }
            }
        }
    }

    async fn transport_failure(&self, err: WsError) -> ConnectionInput {
        self.emit(ConnectionEvent::Error(err.to_string())).await;
        ConnectionInput::TransportError
    }

    /// Degraded mode: poll the REST endpoint for the interest set.
    async fn run_polling(&self, token: &CancellationToken) {
        info!(
            interval_ms = self.config.poll_interval_ms,
            "Streaming abandoned, polling pricing service"
        );
        let mut ticker = tokio::time::interval(Duration::from_millis(self.config.poll_interval_ms.max(1)));

        loop {
            tokio::select! {
                () = token.cancelled() => {
                    info!("Disconnect requested, stopping poll loop");
                    return;
                }
                _ = ticker.tick() => {
                    let ids = self.interest.borrow().clone();
                    if ids.is_empty() {
                        continue;
                    }

                    match self.backend.poll(&ids).await {
                        Ok(body) => self.emit(ConnectionEvent::Message(body)).await,
                        Err(e) => {
                            warn!(error = %e, "Poll failed");
                            self.emit(ConnectionEvent::Error(e.to_string())).await;
                        }
                    }
                }
            }
        }
    }
}

/// Random jitter in `0..=max_ms`.
fn jitter_ms(max_ms: u64) -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    if max_ms == 0 {
        return 0;
    }
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    u64::from(nanos) % (max_ms + 1)
}
