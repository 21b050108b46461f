//! Typed TTL cache
//!
//! Expiry is passive: an expired entry reads as a miss and is dropped on the
//! next write to the same key or by [`TtlCache::purge_expired`]. Callers that
//! need eager eviction run a sweeper (see [`crate::unavailable`]).
//!
//! Time is read from `tokio::time::Instant` so tests can drive expiry with a
//! paused clock.

use parking_lot::RwLock;
use std::borrow::Borrow;
use std::collections::HashMap;
use std::hash::Hash;
use std::time::Duration;
use tokio::time::Instant;

/// Time before cached instance records are dropped
pub const INSTANCE_CACHE_TTL: Duration = Duration::from_secs(15);

/// Time before offerings marked unavailable become launchable again
pub const UNAVAILABLE_OFFERINGS_TTL: Duration = Duration::from_secs(3 * 60);

/// Sweep interval for the unavailable-offerings cache.
///
/// Shorter than the TTL so recovered capacity shows up promptly.
pub const UNAVAILABLE_OFFERINGS_CLEANUP_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug)]
struct Entry<V> {
    value: V,
    expires_at: Instant,
}

impl<V> Entry<V> {
    fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

/// Concurrent map whose entries expire after a fixed TTL
#[derive(Debug)]
pub struct TtlCache<K, V> {
    ttl: Duration,
    entries: RwLock<HashMap<K, Entry<V>>>,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash,
    V: Clone,
{
    /// Create an empty cache
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Default entry lifetime
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Live value for `key`
    pub fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let now = Instant::now();
        self.entries
            .read()
            .get(key)
            .filter(|e| e.is_live(now))
            .map(|e| e.value.clone())
    }

    /// Whether `key` has a live entry
    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let now = Instant::now();
        self.entries
            .read()
            .get(key)
            .is_some_and(|e| e.is_live(now))
    }

    /// Insert or refresh with the default TTL
    pub fn insert(&self, key: K, value: V) {
        self.insert_with_ttl(key, value, self.ttl);
    }

    /// Insert or refresh with an explicit TTL
    pub fn insert_with_ttl(&self, key: K, value: V, ttl: Duration) {
        let expires_at = Instant::now() + ttl;
        self.entries
            .write()
            .insert(key, Entry { value, expires_at });
    }

    /// Insert many entries under one lock
    pub fn extend<I>(&self, items: I)
    where
        I: IntoIterator<Item = (K, V)>,
    {
        let expires_at = Instant::now() + self.ttl;
        let mut entries = self.entries.write();
        for (key, value) in items {
            entries.insert(key, Entry { value, expires_at });
        }
    }

    /// Remove `key`, returning its live value
    pub fn remove<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let now = Instant::now();
        self.entries
            .write()
            .remove(key)
            .filter(|e| e.is_live(now))
            .map(|e| e.value)
    }

    /// Drop every expired entry, returning how many were dropped
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, e| e.is_live(now));
        before - entries.len()
    }

    /// Stored entries, including expired ones not yet purged
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// True if nothing is stored
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Drop everything
    pub fn clear(&self) {
        self.entries.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_entry_expires_after_ttl() {
        let cache: TtlCache<String, u32> = TtlCache::new(Duration::from_secs(15));
        cache.insert("i-1".to_string(), 1);

        tokio::time::advance(Duration::from_secs(14)).await;
        assert_eq!(cache.get("i-1"), Some(1));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(cache.get("i-1"), None);
        assert!(!cache.contains_key("i-1"));

        // Passive expiry keeps the slot until purged
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.purge_expired(), 1);
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_insert_refreshes_expiry() {
        let cache: TtlCache<&'static str, &'static str> = TtlCache::new(Duration::from_secs(10));
        cache.insert("k", "v1");

        tokio::time::advance(Duration::from_secs(8)).await;
        cache.insert("k", "v2");

        tokio::time::advance(Duration::from_secs(8)).await;
        assert_eq!(cache.get("k"), Some("v2"));
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remove_and_extend() {
        let cache: TtlCache<String, u32> = TtlCache::new(Duration::from_secs(5));
        cache.extend([("a".to_string(), 1), ("b".to_string(), 2)]);
        cache.insert_with_ttl("c".to_string(), 3, Duration::from_secs(1));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(cache.get("b"), Some(2));
        assert_eq!(cache.purge_expired(), 1);
        assert_eq!(cache.len(), 2);

        assert_eq!(cache.remove("a"), Some(1));
        assert_eq!(cache.remove("c"), None);
        assert_eq!(cache.get("a"), None);

        cache.clear();
        assert!(cache.is_empty());
    }
}
