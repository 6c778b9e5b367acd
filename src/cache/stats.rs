//! Store Statistics
//!
//! Lookup outcomes, removals by cause, and current occupancy of a store.

use serde::Serialize;

// == Cache Stats ==
/// Counters kept by a [`CacheStore`](crate::cache::CacheStore).
///
/// Counters only grow; `total_entries` and `total_cost` mirror the store's
/// occupancy after each mutation.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheStats {
    /// Lookups answered from the store
    pub hits: u64,
    /// Lookups that found nothing live
    pub misses: u64,
    /// Live entries pushed out to make room
    pub evictions: u64,
    /// Entries dropped after their TTL ran out
    pub expirations: u64,
    /// Entries held, expired or not
    pub total_entries: usize,
    /// Summed weight of held entries
    pub total_cost: u64,
}

impl CacheStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total lookups recorded.
    pub fn lookups(&self) -> u64 {
        self.hits + self.misses
    }

    // == Hit Rate ==
    /// Fraction of lookups that hit, 0.0 before the first lookup.
    pub fn hit_rate(&self) -> f64 {
        match self.lookups() {
            0 => 0.0,
            lookups => self.hits as f64 / lookups as f64,
        }
    }

    pub fn record_hit(&mut self) {
        self.hits += 1;
    }

    pub fn record_miss(&mut self) {
        self.misses += 1;
    }

    pub fn record_eviction(&mut self) {
        self.evictions += 1;
    }

    pub fn record_expirations(&mut self, count: usize) {
        self.expirations += count as u64;
    }

    pub fn set_occupancy(&mut self, entries: usize, cost: u64) {
        self.total_entries = entries;
        self.total_cost = cost;
    }
}
