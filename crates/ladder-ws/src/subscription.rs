//! Subscription state for the single logical market-data subscription.
//!
//! Tracked independently of connection state: the logical intent to be
//! subscribed survives a transport reconnect, the subscription itself
//! does not and is always re-issued on open.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::info;

#[derive(Debug, Clone, Default)]
struct SubscriptionState {
    pending: bool,
    subscribed: bool,
    last_attempt: Option<DateTime<Utc>>,
}

/// Tracks the lifecycle of one logical subscription.
pub struct SubscriptionTracker {
    /// Stream name (e.g., "btcusdt@ticker").
    stream: String,
    state: RwLock<SubscriptionState>,
}

impl SubscriptionTracker {
    pub fn new(stream: impl Into<String>) -> Self {
        Self {
            stream: stream.into(),
            state: RwLock::new(SubscriptionState::default()),
        }
    }

    /// Stream name this tracker manages.
    pub fn stream(&self) -> &str {
        &self.stream
    }

    /// Record that a subscribe request was sent.
    pub fn mark_pending(&self) {
        let mut state = self.state.write();
        state.pending = true;
        state.subscribed = false;
        state.last_attempt = Some(Utc::now());
    }

    /// Record confirmation (ack or first data on the stream).
    pub fn mark_subscribed(&self) {
        let mut state = self.state.write();
        if !state.subscribed {
            info!(stream = %self.stream, "Subscription active");
        }
        state.pending = false;
        state.subscribed = true;
    }

    /// Drop subscription state (called when the transport closes).
    pub fn reset(&self) {
        let mut state = self.state.write();
        state.pending = false;
        state.subscribed = false;
    }

    pub fn is_subscribed(&self) -> bool {
        self.state.read().subscribed
    }

    pub fn is_pending(&self) -> bool {
        self.state.read().pending
    }

    pub fn last_attempt(&self) -> Option<DateTime<Utc>> {
        self.state.read().last_attempt
    }
}
