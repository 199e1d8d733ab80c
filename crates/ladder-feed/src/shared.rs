//! Shared latest-price handle.
//!
//! The feed writes, everyone else reads. The cycle controller uses the
//! freshness query as its "usable price" gate.

use ladder_core::PriceUpdate;
use parking_lot::RwLock;
use std::sync::Arc;

/// Cloneable read handle over the latest price observation.
#[derive(Clone, Default)]
pub struct SharedPrice {
    inner: Arc<RwLock<Option<PriceUpdate>>>,
}

impl SharedPrice {
    pub fn new() -> Self {
        Self::default()
    }

    /// Latest observation regardless of age.
    pub fn latest(&self) -> Option<PriceUpdate> {
        self.inner.read().clone()
    }

    /// Latest observation only if younger than `max_age_ms`.
    pub fn latest_fresh(&self, max_age_ms: i64) -> Option<PriceUpdate> {
        self.inner
            .read()
            .clone()
            .filter(|update| update.is_fresh(max_age_ms))
    }

    /// Check whether no fresh observation exists.
    pub fn is_stale(&self, max_age_ms: i64) -> bool {
        self.latest_fresh(max_age_ms).is_none()
    }

    /// Replace the latest observation. The feed is the only writer in
    /// production; tests drive this directly.
    pub fn set(&self, update: PriceUpdate) {
        *self.inner.write() = Some(update);
    }
}
