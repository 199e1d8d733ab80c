//! WebSocket client for exchange market-data connections.
//!
//! Provides robust connectivity with:
//! - Automatic reconnection with capped backoff and a failed terminal state
//! - Strictly increasing connection ids with stale-event immunity
//! - Heartbeat monitoring with consecutive-failure forced reconnect
//! - Server-identity duplicate suppression (TTL + size-capped cache)
//! - Single logical subscription re-issued on every reconnect

pub mod connection;
pub mod dedup;
pub mod error;
pub mod heartbeat;
pub mod message;
pub mod subscription;

pub use connection::{ConnectionConfig, ConnectionManager, ConnectionState};
pub use dedup::{DedupCache, DedupConfig};
pub use error::{WsError, WsResult};
pub use heartbeat::HeartbeatMonitor;
pub use message::{is_subscription_ack, EventIdentity, StreamEvent, WsRequest};
pub use subscription::SubscriptionTracker;

use std::sync::Once;

static INIT_CRYPTO: Once = Once::new();

/// Initialize the TLS crypto provider.
/// Must be called before any WebSocket connections are made.
pub fn init_crypto() {
    INIT_CRYPTO.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}
