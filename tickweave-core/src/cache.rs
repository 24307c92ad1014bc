//! Response cache with TTL and recency/frequency eviction.
//!
//! Time is passed in by the caller, so the cache behaves the same in a
//! replay as it did live. Entries live in a `BTreeMap` to keep eviction
//! order independent of hashing.

use crate::config::CacheConfig;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;

/// A cached value with its bookkeeping.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry<V> {
    pub value: V,
    pub created_at: Duration,
    pub hit_count: u32,
}

/// Bounded key/value store for narrative responses.
#[derive(Debug, Clone)]
pub struct ResponseCache<K, V> {
    entries: BTreeMap<K, CacheEntry<V>>,
    capacity: usize,
    ttl: Duration,
    hit_cap: u32,
    evictions: u64,
}

impl<K: Ord + Clone, V: Clone> ResponseCache<K, V> {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            entries: BTreeMap::new(),
            capacity: config.capacity.max(1),
            ttl: config.ttl(),
            hit_cap: config.hit_cap.max(1),
            evictions: 0,
        }
    }

    /// Look up `key` at simulated time `now`.
    ///
    /// Expired entries are reported absent even if they have not been purged.
    pub fn get(&mut self, key: &K, now: Duration) -> Option<V> {
        let ttl = self.ttl;
        let entry = self.entries.get_mut(key)?;
        if now.saturating_sub(entry.created_at) >= ttl {
            return None;
        }
        entry.hit_count = entry.hit_count.saturating_add(1);
        Some(entry.value.clone())
    }

    /// Whether `key` holds a live entry, without counting a hit.
    pub fn contains(&self, key: &K, now: Duration) -> bool {
        self.entries
            .get(key)
            .is_some_and(|e| now.saturating_sub(e.created_at) < self.ttl)
    }

    /// Insert or replace `key`, evicting the lowest-scoring entry if full.
    pub fn put(&mut self, key: K, value: V, now: Duration) {
        if let Some(entry) = self.entries.get_mut(&key) {
            entry.value = value;
            entry.created_at = now;
            return;
        }
        self.purge_expired(now);
        while self.entries.len() >= self.capacity {
            if !self.evict_one(now) {
                break;
            }
        }
        self.entries.insert(
            key,
            CacheEntry {
                value,
                created_at: now,
                hit_count: 0,
            },
        );
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn purge_expired(&mut self, now: Duration) -> usize {
        let ttl = self.ttl;
        let before = self.entries.len();
        self.entries
            .retain(|_, e| now.saturating_sub(e.created_at) < ttl);
        before - self.entries.len()
    }

    /// Eviction score; lower is evicted first.
    pub fn score(&self, entry: &CacheEntry<V>, now: Duration) -> f64 {
        let age = now.saturating_sub(entry.created_at).as_secs_f64();
        let ttl = self.ttl.as_secs_f64().max(f64::EPSILON);
        let recency = (1.0 - age / ttl).max(0.0);
        let frequency = entry.hit_count.min(self.hit_cap) as f64 / self.hit_cap as f64;
        0.6 * recency + 0.4 * frequency
    }

    fn evict_one(&mut self, now: Duration) -> bool {
        let victim = self
            .entries
            .iter()
            .map(|(k, e)| (self.score(e, now), e.created_at, k))
            .min_by(|a, b| {
                a.0.total_cmp(&b.0)
                    .then_with(|| a.1.cmp(&b.1))
                    .then_with(|| a.2.cmp(b.2))
            })
            .map(|(_, _, k)| k.clone());
        match victim {
            Some(key) => {
                self.entries.remove(&key);
                self.evictions += 1;
                debug!(evictions = self.evictions, "cache entry evicted");
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total entries removed to make room.
    pub fn evictions(&self) -> u64 {
        self.evictions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache(capacity: usize) -> ResponseCache<u64, String> {
        ResponseCache::new(&CacheConfig {
            capacity,
            ttl_ms: 300_000,
            hit_cap: 10,
        })
    }

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    #[test]
    fn test_put_then_get() {
        let mut cache = cache(4);
        cache.put(1, "hello".to_string(), secs(0));
        assert_eq!(cache.get(&1, secs(1)), Some("hello".to_string()));
        assert_eq!(cache.get(&2, secs(1)), None);
    }

    #[test]
    fn test_absent_after_ttl() {
        let mut cache = cache(4);
        cache.put(1, "hello".to_string(), secs(10));
        assert!(cache.get(&1, secs(309)).is_some());
        assert_eq!(cache.get(&1, secs(310)), None);
        assert!(!cache.contains(&1, secs(400)));
        assert_eq!(cache.purge_expired(secs(400)), 1);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_evicts_lowest_score() {
        let mut cache = cache(2);
        cache.put(1, "old".to_string(), secs(0));
        cache.put(2, "new".to_string(), secs(100));
        cache.put(3, "newest".to_string(), secs(120));
        assert_eq!(cache.len(), 2);
        assert!(!cache.contains(&1, secs(120)));
        assert!(cache.contains(&2, secs(120)));
        assert_eq!(cache.evictions(), 1);
    }

    #[test]
    fn test_hits_protect_entries() {
        let mut cache = cache(2);
        cache.put(1, "popular".to_string(), secs(0));
        for _ in 0..10 {
            cache.get(&1, secs(50));
        }
        cache.put(2, "fresh".to_string(), secs(100));
        cache.put(3, "fresher".to_string(), secs(101));
        // 1: 0.6*(1-101/300)+0.4 ~ 0.80; 2: 0.6*(1-1/300) ~ 0.598
        assert!(cache.contains(&1, secs(101)));
        assert!(!cache.contains(&2, secs(101)));
    }

    #[test]
    fn test_ties_evict_oldest_then_lowest_key() {
        let mut cache = cache(2);
        cache.put(7, "a".to_string(), secs(5));
        cache.put(3, "b".to_string(), secs(5));
        cache.put(9, "c".to_string(), secs(5));
        assert!(!cache.contains(&3, secs(5)));
        assert!(cache.contains(&7, secs(5)));
    }

    #[test]
    fn test_put_replaces_value() {
        let mut cache = cache(2);
        cache.put(1, "a".to_string(), secs(0));
        cache.put(1, "b".to_string(), secs(1));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(&1, secs(2)), Some("b".to_string()));
    }
}
