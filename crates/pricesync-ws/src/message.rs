//! Wire message types.
//!
//! Every frame is a JSON object tagged by `type`. Poll responses from the
//! REST fallback use the same inbound shapes.

use pricesync_core::{EntityId, PendingEdit, Price};
use serde::{Deserialize, Serialize};

// ============================================================================
// Inbound
// ============================================================================

/// Single price update as sent by the service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawUpdate {
    pub id: EntityId,
    pub price: Price,
    pub timestamp: i64,
    pub version: u64,
}

/// Inbound message from the pricing service.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum InboundMessage {
    /// One price change.
    Update(RawUpdate),
    /// Several price changes in arrival order.
    ///
    /// Members stay raw so one malformed member does not sink the batch.
    Batch {
        #[serde(default)]
        updates: Vec<serde_json::Value>,
    },
    /// Liveness ack.
    Heartbeat,
    /// Service-side error report.
    Error {
        #[serde(default)]
        detail: serde_json::Value,
    },
}

impl InboundMessage {
    /// Short label for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Update(_) => "update",
            Self::Batch { .. } => "batch",
            Self::Heartbeat => "heartbeat",
            Self::Error { .. } => "error",
        }
    }
}

// ============================================================================
// Outbound
// ============================================================================

/// Outbound control and sync messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum OutboundMessage {
    Subscribe { id: EntityId },
    Unsubscribe { id: EntityId },
    Ping,
    Sync { edits: Vec<PendingEdit> },
}

impl OutboundMessage {
    pub fn subscribe(id: impl Into<EntityId>) -> Self {
        Self::Subscribe { id: id.into() }
    }

    pub fn unsubscribe(id: impl Into<EntityId>) -> Self {
        Self::Unsubscribe { id: id.into() }
    }

    /// Short label for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Subscribe { .. } => "subscribe",
            Self::Unsubscribe { .. } => "unsubscribe",
            Self::Ping => "ping",
            Self::Sync { .. } => "sync",
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}
