//! Write handle for sending messages on the stream.
//!
//! Non-blocking: messages are queued for the connection task, which owns the
//! socket. Queuing is refused unless the stream is `Connected`, since the
//! subscription replay on the next open covers anything dropped meanwhile.

use crate::message::OutboundMessage;
use crate::state::ConnectionState;
use tokio::sync::{mpsc, watch};
use tracing::debug;

/// Error type for send operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendError {
    /// Stream is not connected (disconnected, reconnecting, or polling).
    NotConnected(ConnectionState),
    /// Outbound queue is full.
    QueueFull,
    /// Connection task is gone.
    ChannelClosed,
}

impl std::fmt::Display for SendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotConnected(state) => write!(f, "not connected ({state})"),
            Self::QueueFull => write!(f, "outbound queue full"),
            Self::ChannelClosed => write!(f, "channel closed"),
        }
    }
}

impl std::error::Error for SendError {}

/// Cloneable handle for queuing outbound messages.
#[derive(Clone)]
pub struct WsWriteHandle {
    tx: mpsc::Sender<OutboundMessage>,
    state: watch::Receiver<ConnectionState>,
}

impl WsWriteHandle {
    /// Create a new write handle.
    pub fn new(tx: mpsc::Sender<OutboundMessage>, state: watch::Receiver<ConnectionState>) -> Self {
        Self { tx, state }
    }

    /// Current connection state as seen by the handle.
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Queue a message for sending.
    pub fn send(&self, msg: OutboundMessage) -> Result<(), SendError> {
        let state = self.state();
        if state != ConnectionState::Connected {
            return Err(SendError::NotConnected(state));
        }

        let kind = msg.kind();
        self.tx.try_send(msg).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SendError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => SendError::ChannelClosed,
        })?;
        debug!(kind, "Message queued for stream");
        Ok(())
    }
}
