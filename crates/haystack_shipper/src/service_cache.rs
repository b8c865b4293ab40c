//! Service Dedup Cache
//!
//! Size- and time-bounded set of service/operation hashes that have already
//! been emitted. Suppression is best effort: an absent, expired or evicted key
//! simply causes the service descriptor to be emitted again.
//!
//! # Design
//!
//! - One `parking_lot::Mutex` around the whole structure; callers never lock
//! - Recency kept in a `BTreeMap` keyed by access tick, so eviction is O(log n)
//! - TTL measured from the most recent `put`

use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

/// Concurrent LRU set with per-entry expiry.
pub struct ServiceCache {
    inner: Mutex<LruTtl>,
    capacity: usize,
    ttl: Duration,
}

impl ServiceCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Mutex::new(LruTtl::new(capacity)),
            capacity,
            ttl,
        }
    }

    /// Returns `true` if the key is present and unexpired, marking it recently used.
    pub fn get(&self, key: u64) -> bool {
        self.get_at(key, Instant::now())
    }

    /// Inserts the key, evicting the least recently used entry when full.
    pub fn put(&self, key: u64) {
        self.put_at(key, Instant::now());
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub(crate) fn get_at(&self, key: u64, now: Instant) -> bool {
        self.inner.lock().get(key, now)
    }

    pub(crate) fn put_at(&self, key: u64, now: Instant) {
        let expires_at = now.checked_add(self.ttl);
        self.inner.lock().put(key, expires_at);
    }
}

struct Entry {
    /// `None` when the TTL overflows `Instant`, i.e. never expires.
    expires_at: Option<Instant>,
    tick: u64,
}

struct LruTtl {
    entries: HashMap<u64, Entry>,
    /// Access tick -> key, oldest first
    recency: BTreeMap<u64, u64>,
    counter: u64,
    capacity: usize,
}

impl LruTtl {
    fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            recency: BTreeMap::new(),
            counter: 0,
            capacity,
        }
    }

    fn next_tick(&mut self) -> u64 {
        self.counter += 1;
        self.counter
    }

    fn get(&mut self, key: u64, now: Instant) -> bool {
        let expired = match self.entries.get(&key) {
            None => return false,
            Some(entry) => entry.expires_at.is_some_and(|at| at <= now),
        };
        if expired {
            self.remove(key);
            return false;
        }

        let tick = self.next_tick();
        if let Some(entry) = self.entries.get_mut(&key) {
            self.recency.remove(&entry.tick);
            entry.tick = tick;
            self.recency.insert(tick, key);
        }
        true
    }

    fn put(&mut self, key: u64, expires_at: Option<Instant>) {
        let tick = self.next_tick();
        if let Some(old) = self.entries.insert(key, Entry { expires_at, tick }) {
            self.recency.remove(&old.tick);
        } else if self.entries.len() > self.capacity {
            self.evict_lru();
        }
        self.recency.insert(tick, key);
    }

    fn evict_lru(&mut self) {
        if let Some((_, key)) = self.recency.pop_first() {
            self.entries.remove(&key);
        }
    }

    fn remove(&mut self, key: u64) {
        if let Some(entry) = self.entries.remove(&key) {
            self.recency.remove(&entry.tick);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_get_put() {
        let cache = ServiceCache::new(10, Duration::from_secs(60));
        assert!(!cache.get(1));
        cache.put(1);
        assert!(cache.get(1));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_ttl_expiry() {
        let cache = ServiceCache::new(10, Duration::from_secs(60));
        let start = Instant::now();
        cache.put_at(7, start);

        assert!(cache.get_at(7, start + Duration::from_secs(59)));
        assert!(!cache.get_at(7, start + Duration::from_secs(60)));
        // expired entries are dropped on lookup
        assert!(cache.is_empty());
    }

    #[test]
    fn test_put_refreshes_ttl() {
        let cache = ServiceCache::new(10, Duration::from_secs(10));
        let start = Instant::now();
        cache.put_at(7, start);
        cache.put_at(7, start + Duration::from_secs(8));

        assert!(cache.get_at(7, start + Duration::from_secs(15)));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_lru_eviction() {
        let cache = ServiceCache::new(2, Duration::from_secs(60));
        cache.put(1);
        cache.put(2);
        // touch 1 so 2 becomes the eviction candidate
        assert!(cache.get(1));
        cache.put(3);

        assert!(cache.get(1));
        assert!(!cache.get(2));
        assert!(cache.get(3));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_zero_capacity_holds_one() {
        let cache = ServiceCache::new(0, Duration::from_secs(60));
        cache.put(1);
        cache.put(2);
        assert_eq!(cache.capacity(), 1);
        assert_eq!(cache.ttl(), Duration::from_secs(60));
        assert!(!cache.get(1));
        assert!(cache.get(2));
    }

    #[test]
    fn test_concurrent_access() {
        let cache = std::sync::Arc::new(ServiceCache::new(1000, Duration::from_secs(60)));
        let handles: Vec<_> = (0..4u64)
            .map(|t| {
                let cache = std::sync::Arc::clone(&cache);
                std::thread::spawn(move || {
                    for i in 0..500u64 {
                        let key = t * 10_000 + i;
                        cache.put(key);
                        assert!(cache.get(key));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(cache.len(), 1000);
    }

    proptest! {
        #[test]
        fn prop_capacity_never_exceeded(
            capacity in 1usize..32,
            ops in proptest::collection::vec((any::<bool>(), 0u64..64), 0..256),
        ) {
            let cache = ServiceCache::new(capacity, Duration::from_secs(60));
            for (is_put, key) in ops {
                if is_put {
                    cache.put(key);
                    prop_assert!(cache.get(key));
                } else {
                    cache.get(key);
                }
                prop_assert!(cache.len() <= capacity);
                let inner = cache.inner.lock();
                prop_assert_eq!(inner.entries.len(), inner.recency.len());
            }
        }
    }
}
