//! Cache Module
//!
//! Provides in-memory caching with weighted LRU eviction and TTL expiration.

mod entry;
mod lru;
mod stats;
mod store;


// Re-export public types
pub use entry::CacheEntry;
pub use lru::LruTracker;
pub use stats::CacheStats;
pub use store::CacheStore;
