//! In-process TTL cache for computed aggregates and series.
//!
//! Entries are keyed by scope strings (`stats:page:7`, `stats:all`,
//! `series:<hash>`) and expire against the injected clock rather than
//! `Instant`, so throttle and TTL behaviour is testable. Writes are
//! last-writer-wins; there is no cross-key transaction.

use crate::clock::Clock;

use chrono::{DateTime, Duration, Utc};

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    expires_at: DateTime<Utc>,
}

pub(crate) struct TtlCache<V> {
    entries: RwLock<HashMap<String, CacheEntry<V>>>,
    clock: Arc<dyn Clock>,
}

impl<V: Clone> TtlCache<V> {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            clock,
        }
    }

    /// Return the live value for `key`. Expired entries read as a miss and
    /// are left for the next write or sweep to replace.
    pub fn get(&self, key: &str) -> Option<V> {
        let now = self.clock.now();
        let entries = self.entries.read().expect("cache lock poisoned");
        entries
            .get(key)
            .filter(|entry| entry.expires_at > now)
            .map(|entry| entry.value.clone())
    }

    pub fn insert(&self, key: impl Into<String>, value: V, ttl: Duration) {
        let entry = CacheEntry {
            value,
            expires_at: self.clock.now() + ttl,
        };
        self.entries
            .write()
            .expect("cache lock poisoned")
            .insert(key.into(), entry);
    }

    pub fn remove(&self, key: &str) -> bool {
        self.entries
            .write()
            .expect("cache lock poisoned")
            .remove(key)
            .is_some()
    }

    /// Drop every key starting with `prefix`, returning how many were removed.
    pub fn remove_prefix(&self, prefix: &str) -> usize {
        let mut entries = self.entries.write().expect("cache lock poisoned");
        let before = entries.len();
        entries.retain(|key, _| !key.starts_with(prefix));
        before - entries.len()
    }

    pub fn clear(&self) {
        self.entries.write().expect("cache lock poisoned").clear();
    }

    /// Remove expired entries.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now();
        let mut entries = self.entries.write().expect("cache lock poisoned");
        let before = entries.len();
        entries.retain(|_, entry| entry.expires_at > now);
        before - entries.len()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.read().expect("cache lock poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::TimeZone as _;

    fn setup() -> (Arc<ManualClock>, TtlCache<u32>) {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap(),
        ));
        let cache = TtlCache::new(clock.clone());
        (clock, cache)
    }

    #[test]
    fn test_entry_expires_after_ttl() {
        let (clock, cache) = setup();
        cache.insert("stats:all", 5, Duration::hours(1));

        clock.advance(Duration::minutes(59));
        assert_eq!(cache.get("stats:all"), Some(5));

        clock.advance(Duration::minutes(1));
        assert_eq!(cache.get("stats:all"), None);
    }

    #[test]
    fn test_remove_prefix_only_touches_matching_keys() {
        let (_clock, cache) = setup();
        cache.insert("series:aaa", 1, Duration::hours(1));
        cache.insert("series:bbb", 2, Duration::hours(1));
        cache.insert("stats:page:3", 3, Duration::hours(1));

        assert_eq!(cache.remove_prefix("series:"), 2);
        assert_eq!(cache.get("stats:page:3"), Some(3));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_sweep_drops_only_expired() {
        let (clock, cache) = setup();
        cache.insert("short", 1, Duration::minutes(5));
        cache.insert("long", 2, Duration::hours(5));

        clock.advance(Duration::minutes(10));
        assert_eq!(cache.sweep(), 1);
        assert_eq!(cache.get("long"), Some(2));
    }

    #[test]
    fn test_insert_overwrites() {
        let (_clock, cache) = setup();
        cache.insert("k", 1, Duration::hours(1));
        cache.insert("k", 2, Duration::hours(1));
        assert_eq!(cache.get("k"), Some(2));
        assert!(cache.remove("k"));
        assert!(!cache.remove("k"));
    }
}
