//! Coordinator Statistics
//!
//! Snapshot of cache and load counters.

use serde::Serialize;

use crate::cache::CacheStats;

/// Load-side counters, kept next to the store under the coordinator lock.
#[derive(Debug, Clone, Default)]
pub(crate) struct LoadCounters {
    pub loads: u64,
    pub load_failures: u64,
    pub coalesced: u64,
    pub rate_limited: u64,
    pub timeouts: u64,
}

// == Coordinator Stats ==
/// Point-in-time view of a coordinator.
#[derive(Debug, Clone, Serialize)]
pub struct CoordinatorStats {
    /// Store counters and occupancy
    #[serde(flatten)]
    pub cache: CacheStats,
    /// hits / (hits + misses)
    pub hit_rate: f64,
    /// Loads that produced a value
    pub loads: u64,
    /// Loads that failed, or died before settling
    pub load_failures: u64,
    /// Calls that joined a load started by another caller
    pub coalesced: u64,
    /// Calls rejected by the rate limiter
    pub rate_limited: u64,
    /// Calls that gave up waiting
    pub timeouts: u64,
    /// Keys with a load in flight
    pub pending: usize,
    /// Loads holding a concurrency slot, when a limit is configured
    pub in_flight: Option<usize>,
    /// RFC 3339 capture time
    pub captured_at: String,
}

impl CoordinatorStats {
    pub(crate) fn new(
        cache: CacheStats,
        counters: &LoadCounters,
        pending: usize,
        in_flight: Option<usize>,
    ) -> Self {
        Self {
            hit_rate: cache.hit_rate(),
            cache,
            loads: counters.loads,
            load_failures: counters.load_failures,
            coalesced: counters.coalesced,
            rate_limited: counters.rate_limited,
            timeouts: counters.timeouts,
            pending,
            in_flight,
            captured_at: chrono::Utc::now().to_rfc3339(),
        }
    }
}
