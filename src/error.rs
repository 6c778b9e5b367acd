//! Error types for the coordinator
//!
//! Provides unified error handling using thiserror.

use std::sync::Arc;

use thiserror::Error;

// == Cache Error Enum ==
/// Unified error type for cache and coordinator operations.
///
/// The type is `Clone` so a single load outcome can be delivered to every
/// caller waiting on the same key.
#[derive(Error, Debug, Clone)]
pub enum CacheError {
    /// The loader failed; every caller of that load episode receives this
    #[error("Loader failed: {0}")]
    LoaderFailed(Arc<anyhow::Error>),

    /// The rate limiter denied admission under the fail-fast policy
    #[error("Rate limited")]
    RateLimited,

    /// The caller's deadline elapsed while waiting
    #[error("Timed out waiting for value")]
    Timeout,

    /// A single entry's cost is larger than the whole cache
    #[error("Entry cost {cost} exceeds cache capacity {capacity}")]
    CapacityExceeded { cost: u64, capacity: u64 },

    /// Configuration values are out of range
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl CacheError {
    // == Loader Failure ==
    /// Wraps a loader error so it can be shared between waiters.
    pub fn loader<E: Into<anyhow::Error>>(err: E) -> Self {
        CacheError::LoaderFailed(Arc::new(err.into()))
    }

    // == Retryable ==
    /// Returns whether retrying the same call may succeed.
    ///
    /// Only misconfiguration is permanent.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            CacheError::CapacityExceeded { .. } | CacheError::InvalidConfig(_)
        )
    }
}

// == Result Type Alias ==
/// Convenience Result type for the crate.
pub type Result<T> = std::result::Result<T, CacheError>;
