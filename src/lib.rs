//! Herd Cache - An in-memory get-or-load coordinator
//!
//! Caches loaded values with LRU and TTL eviction, lets concurrent callers for
//! the same missing key share one load, and bounds how fast and how many loads
//! may run.

pub mod cache;
pub mod clock;
pub mod coalesce;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod gate;
pub mod tasks;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{Config, RateLimit, RateLimitPolicy};
pub use coordinator::{Coordinator, CoordinatorBuilder, CoordinatorStats};
pub use error::{CacheError, Result};
pub use tasks::spawn_cleanup_task;
