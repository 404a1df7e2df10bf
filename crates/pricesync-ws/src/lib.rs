//! Streaming connection to the pricing service.
//!
//! Provides the transport half of price synchronization:
//! - Explicit connection state machine with exponential backoff
//! - Ref-counted subscriptions replayed on every reconnect
//! - Heartbeat monitoring (fixed-period ping, silence timeout)
//! - REST polling fallback once reconnection is abandoned

pub mod connection;
pub mod error;
pub mod heartbeat;
pub mod message;
pub mod state;
pub mod subscription;
pub mod ws_write_handle;

pub use connection::{ConnectionConfig, ConnectionEvent, ConnectionManager};
pub use error::{WsError, WsResult};
pub use heartbeat::HeartbeatManager;
pub use message::{InboundMessage, OutboundMessage, RawUpdate};
pub use state::{
    ConnectionAction, ConnectionInput, ConnectionState, ConnectionStateMachine, ReconnectPolicy,
};
pub use subscription::SubscriptionRegistry;
pub use ws_write_handle::{SendError, WsWriteHandle};

use std::sync::Once;

static INIT_CRYPTO: Once = Once::new();

/// Initialize the TLS crypto provider.
/// Must be called before any `wss://` connection is made.
pub fn init_crypto() {
    INIT_CRYPTO.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}
