//! Cache Entry Module
//!
//! Defines the structure for individual cache entries with TTL and cost.

use std::time::{Duration, Instant};

// == Cache Entry ==
/// Represents a single cache entry with value and metadata.
#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    /// The stored value
    pub value: V,
    /// Weight counted against the store capacity
    pub cost: u64,
    /// When the entry was inserted
    pub inserted_at: Instant,
    /// Last time the entry was read or written
    pub last_accessed_at: Instant,
    /// Expiration instant, None = no expiration
    pub expires_at: Option<Instant>,
}

impl<V> CacheEntry<V> {
    // == Constructor ==
    /// Creates a new cache entry with optional TTL.
    ///
    /// # Arguments
    /// * `value` - The value to store
    /// * `cost` - Capacity weight of the entry
    /// * `now` - Insertion instant
    /// * `ttl` - Optional time-to-live
    pub fn new(value: V, cost: u64, now: Instant, ttl: Option<Duration>) -> Self {
        Self {
            value,
            cost,
            inserted_at: now,
            last_accessed_at: now,
            expires_at: ttl.and_then(|ttl| now.checked_add(ttl)),
        }
    }

    // == Is Expired ==
    /// Checks if the entry has expired.
    ///
    /// An entry is expired once `now >= expires_at`, so an entry with a TTL of
    /// `T` is gone at exactly insertion + `T`.
    pub fn is_expired(&self, now: Instant) -> bool {
        match self.expires_at {
            Some(expires) => now >= expires,
            None => false,
        }
    }

    // == Touch ==
    /// Records an access.
    pub fn touch(&mut self, now: Instant) {
        self.last_accessed_at = now;
    }

    // == Time To Live ==
    /// Returns the remaining TTL, or None if no expiration is set.
    ///
    /// # Returns
    /// - `Some(Duration::ZERO)` if the entry has expired
    /// - `Some(remaining)` if the entry has TTL and hasn't expired
    /// - `None` if the entry never expires
    pub fn ttl_remaining(&self, now: Instant) -> Option<Duration> {
        self.expires_at
            .map(|expires| expires.saturating_duration_since(now))
    }

    /// Time since insertion.
    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.inserted_at)
    }
}
