//! Cache Store Module
//!
//! Main cache engine combining HashMap storage with LRU tracking and TTL expiration.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use crate::cache::{CacheEntry, CacheStats, LruTracker};
use crate::clock::{Clock, SystemClock};
use crate::error::{CacheError, Result};

// == Cache Store ==
/// Cache storage with weighted LRU eviction and TTL support.
///
/// The store is not synchronized; callers share it behind a lock.
#[derive(Debug)]
pub struct CacheStore<K, V> {
    /// Key-value storage
    entries: HashMap<K, CacheEntry<V>>,
    /// LRU access tracker
    lru: LruTracker<K>,
    /// Performance statistics
    stats: CacheStats,
    /// Maximum summed cost of all entries
    capacity: u64,
    /// Current summed cost of all entries
    total_cost: u64,
    /// TTL applied by `put`
    default_ttl: Option<Duration>,
    clock: Arc<dyn Clock>,
}

impl<K: Hash + Eq + Clone, V: Clone> CacheStore<K, V> {
    // == Constructor ==
    /// Creates a new CacheStore with specified capacity and default TTL.
    ///
    /// # Arguments
    /// * `capacity` - Maximum summed cost the cache can hold
    /// * `default_ttl` - TTL for entries stored with `put`, None = never expire
    pub fn new(capacity: u64, default_ttl: Option<Duration>) -> Self {
        Self::with_clock(capacity, default_ttl, Arc::new(SystemClock))
    }

    /// Creates a new CacheStore reading time from `clock`.
    pub fn with_clock(capacity: u64, default_ttl: Option<Duration>, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: HashMap::new(),
            lru: LruTracker::new(),
            stats: CacheStats::new(),
            capacity,
            total_cost: 0,
            default_ttl,
            clock,
        }
    }

    // == Put ==
    /// Stores a value with the default TTL.
    ///
    /// See [`CacheStore::put_with_ttl`].
    pub fn put(&mut self, key: K, value: V, cost: u64) -> Result<()> {
        self.put_with_ttl(key, value, cost, self.default_ttl)
    }

    /// Stores a value with an explicit TTL.
    ///
    /// If the key already exists, the value, cost and TTL are replaced. When
    /// the summed cost then exceeds capacity, least recently used entries are
    /// evicted until it fits. Entries touched at the same time leave in
    /// insertion order.
    ///
    /// A cost of 0 counts as 1. A single entry costing more than the whole
    /// capacity is rejected with [`CacheError::CapacityExceeded`] and the
    /// store is left untouched.
    pub fn put_with_ttl(
        &mut self,
        key: K,
        value: V,
        cost: u64,
        ttl: Option<Duration>,
    ) -> Result<()> {
        let cost = cost.max(1);
        if cost > self.capacity {
            return Err(CacheError::CapacityExceeded {
                cost,
                capacity: self.capacity,
            });
        }

        let now = self.clock.now();
        let entry = CacheEntry::new(value, cost, now, ttl);
        if let Some(previous) = self.entries.insert(key.clone(), entry) {
            self.total_cost -= previous.cost;
        }
        self.total_cost += cost;
        self.lru.touch(&key);

        // The new key sits at the head and fits on its own, so this never
        // evicts it.
        while self.total_cost > self.capacity {
            let Some(victim) = self.lru.evict_oldest() else {
                break;
            };
            if let Some(evicted) = self.entries.remove(&victim) {
                self.total_cost -= evicted.cost;
                if evicted.is_expired(now) {
                    self.stats.record_expirations(1);
                } else {
                    self.stats.record_eviction();
                }
            }
        }

        self.sync_occupancy();
        Ok(())
    }

    // == Get ==
    /// Retrieves a value by key and marks it most recently used.
    ///
    /// Expired entries are removed and counted as misses.
    pub fn get(&mut self, key: &K) -> Option<V> {
        let now = self.clock.now();

        let expired = match self.entries.get(key) {
            Some(entry) => entry.is_expired(now),
            None => {
                self.stats.record_miss();
                return None;
            }
        };

        if expired {
            self.purge(key);
            self.stats.record_expirations(1);
            self.stats.record_miss();
            self.sync_occupancy();
            return None;
        }

        let entry = self.entries.get_mut(key)?;
        entry.touch(now);
        self.lru.touch(key);
        self.stats.record_hit();
        Some(entry.value.clone())
    }

    // == Peek ==
    /// Returns the live entry for a key without touching recency or stats.
    pub fn peek(&self, key: &K) -> Option<&CacheEntry<V>> {
        let now = self.clock.now();
        self.entries.get(key).filter(|entry| !entry.is_expired(now))
    }

    // == Contains ==
    /// Returns true if the key is present and not expired.
    pub fn contains(&self, key: &K) -> bool {
        self.peek(key).is_some()
    }

    // == Remove ==
    /// Removes an entry by key, returning its value if it was present.
    pub fn remove(&mut self, key: &K) -> Option<V> {
        let removed = self.purge(key);
        self.sync_occupancy();
        removed.map(|entry| entry.value)
    }

    // == Clear ==
    /// Drops every entry. Counters are kept.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.lru.clear();
        self.total_cost = 0;
        self.sync_occupancy();
    }

    // == Stats ==
    /// Returns current cache statistics.
    pub fn stats(&self) -> CacheStats {
        self.stats.clone()
    }

    // == Cleanup Expired ==
    /// Removes all expired entries from the cache.
    ///
    /// Returns the number of entries removed.
    pub fn cleanup_expired(&mut self) -> usize {
        let now = self.clock.now();
        let expired_keys: Vec<K> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();

        for key in &expired_keys {
            self.purge(key);
        }

        self.stats.record_expirations(expired_keys.len());
        self.sync_occupancy();
        expired_keys.len()
    }

    // == Length ==
    /// Returns the current number of entries, including expired ones not yet purged.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    // == Is Empty ==
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn total_cost(&self) -> u64 {
        self.total_cost
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Keys from most to least recently used.
    pub fn keys_by_recency(&self) -> impl Iterator<Item = &K> + '_ {
        self.lru.iter()
    }

    fn purge(&mut self, key: &K) -> Option<CacheEntry<V>> {
        let entry = self.entries.remove(key)?;
        self.lru.remove(key);
        self.total_cost -= entry.cost;
        Some(entry)
    }

    fn sync_occupancy(&mut self) {
        self.stats.set_occupancy(self.entries.len(), self.total_cost);
    }

    #[cfg(test)]
    pub(crate) fn check_invariants(&self) -> bool {
        let summed: u64 = self.entries.values().map(|entry| entry.cost).sum();
        self.lru.check_invariants()
            && self.lru.len() == self.entries.len()
            && self.entries.keys().all(|key| self.lru.contains(key))
            && summed == self.total_cost
            && self.total_cost <= self.capacity
    }
}
