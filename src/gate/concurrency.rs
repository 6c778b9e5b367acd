//! Concurrency Gate Module
//!
//! Bounds how many loads run at once, admitting queued callers in FIFO order.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::{CacheError, Result};

// == Concurrency Gate ==
/// Bounded parallelism built on a fair [`Semaphore`].
///
/// Callers that find every slot taken wait in arrival order; a released slot
/// always goes to the longest waiting caller. Waiting never fails, it only
/// delays, unless the caller brings its own deadline.
#[derive(Debug, Clone)]
pub struct ConcurrencyGate {
    semaphore: Arc<Semaphore>,
    max_in_flight: usize,
}

/// A held slot; dropping it releases the slot.
#[derive(Debug)]
pub struct ConcurrencyPermit {
    _permit: OwnedSemaphorePermit,
}

impl ConcurrencyGate {
    pub fn new(max_in_flight: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_in_flight)),
            max_in_flight,
        }
    }

    // == Acquire ==
    /// Waits for a free slot.
    pub async fn acquire(&self) -> Result<ConcurrencyPermit> {
        self.semaphore
            .clone()
            .acquire_owned()
            .await
            .map(|permit| ConcurrencyPermit { _permit: permit })
            .map_err(|_| CacheError::Internal("concurrency gate closed".to_string()))
    }

    // == Acquire With Deadline ==
    /// Waits for a free slot for at most `timeout`.
    ///
    /// On expiry the caller leaves the queue without disturbing the others.
    pub async fn acquire_timeout(&self, timeout: Duration) -> Result<ConcurrencyPermit> {
        tokio::time::timeout(timeout, self.acquire())
            .await
            .map_err(|_| CacheError::Timeout)?
    }

    /// Takes a slot only if one is free right now.
    pub fn try_acquire(&self) -> Option<ConcurrencyPermit> {
        self.semaphore
            .clone()
            .try_acquire_owned()
            .ok()
            .map(|permit| ConcurrencyPermit { _permit: permit })
    }

    /// Number of slots currently held.
    pub fn in_flight(&self) -> usize {
        self.max_in_flight
            .saturating_sub(self.semaphore.available_permits())
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight
    }
}
