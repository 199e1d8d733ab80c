//! Bounded duplicate-suppression cache for stream events.
//!
//! Keyed by server event identity (source + symbol + server timestamp).
//! Entries expire after a TTL; when the cache still exceeds capacity
//! after expiry, the oldest remainder is evicted first.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::debug;

/// Dedup cache configuration.
#[derive(Debug, Clone)]
pub struct DedupConfig {
    /// How long an identity stays remembered.
    pub ttl: Duration,
    /// Hard cap on remembered identities.
    pub max_entries: usize,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(60),
            max_entries: 4096,
        }
    }
}

/// Bounded TTL cache of already-seen event identities.
pub struct DedupCache {
    config: DedupConfig,
    entries: Mutex<HashMap<String, Instant>>,
}

impl DedupCache {
    pub fn new(config: DedupConfig) -> Self {
        Self {
            config,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Record an identity. Returns false if it was already seen
    /// (the event is a duplicate and must be dropped).
    pub fn insert_if_new(&self, key: &str) -> bool {
        let mut entries = self.entries.lock();
        if entries.contains_key(key) {
            return false;
        }
        entries.insert(key.to_string(), Instant::now());
        true
    }

    /// Sweep expired entries, then enforce the size cap oldest-first.
    ///
    /// Called on a fixed interval by the connection manager.
    pub fn prune(&self) {
        let mut entries = self.entries.lock();
        let before = entries.len();

        entries.retain(|_, seen_at| seen_at.elapsed() < self.config.ttl);

        if entries.len() > self.config.max_entries {
            let excess = entries.len() - self.config.max_entries;
            let mut by_age: Vec<(String, Instant)> =
                entries.iter().map(|(k, v)| (k.clone(), *v)).collect();
            by_age.sort_by_key(|(_, seen_at)| *seen_at);
            for (key, _) in by_age.into_iter().take(excess) {
                entries.remove(&key);
            }
        }

        let removed = before - entries.len();
        if removed > 0 {
            debug!(removed, remaining = entries.len(), "Pruned dedup cache");
        }
    }

    /// Drop all remembered identities.
    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    /// Number of remembered identities.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_suppressed() {
        let cache = DedupCache::new(DedupConfig::default());

        assert!(cache.insert_if_new("ticker:BTCUSDT:1000"));
        assert!(!cache.insert_if_new("ticker:BTCUSDT:1000"));
        assert!(cache.insert_if_new("ticker:BTCUSDT:1001"));
    }

    #[test]
    fn test_ttl_expiry() {
        let cache = DedupCache::new(DedupConfig {
            ttl: Duration::ZERO,
            max_entries: 100,
        });

        assert!(cache.insert_if_new("a"));
        cache.prune();
        assert!(cache.is_empty());
        // Expired identity is accepted again
        assert!(cache.insert_if_new("a"));
    }

    #[test]
    fn test_size_cap_evicts_oldest() {
        let cache = DedupCache::new(DedupConfig {
            ttl: Duration::from_secs(3600),
            max_entries: 2,
        });

        assert!(cache.insert_if_new("a"));
        std::thread::sleep(Duration::from_millis(2));
        assert!(cache.insert_if_new("b"));
        std::thread::sleep(Duration::from_millis(2));
        assert!(cache.insert_if_new("c"));

        cache.prune();
        assert_eq!(cache.len(), 2);
        // Oldest entry evicted, so "a" is accepted again
        assert!(cache.insert_if_new("a"));
    }

    #[test]
    fn test_clear() {
        let cache = DedupCache::new(DedupConfig::default());
        cache.insert_if_new("a");
        cache.clear();
        assert!(cache.is_empty());
    }
}
