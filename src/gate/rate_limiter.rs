//! Shared Rate Limiter
//!
//! GCRA limiter from `governor`, driven by the coordinator's clock so tests
//! can move time by hand.

use std::fmt;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::{Duration, Instant};

use governor::{
    clock::Clock as GovernorClock,
    middleware::NoOpMiddleware,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter as GovernorLimiter,
};

use crate::clock::Clock;
use crate::config::RateLimit;
use crate::error::{CacheError, Result};

/// Shortest sleep used while waiting for a token.
const MIN_WAIT: Duration = Duration::from_millis(1);

/// Longest single sleep; the limiter is checked again after it.
const MAX_WAIT: Duration = Duration::from_secs(1);

/// Feeds our [`Clock`] to governor.
#[derive(Debug, Clone)]
struct LimiterClock(Arc<dyn Clock>);

impl GovernorClock for LimiterClock {
    type Instant = Instant;

    fn now(&self) -> Instant {
        self.0.now()
    }
}

type DirectLimiter =
    GovernorLimiter<NotKeyed, InMemoryState, LimiterClock, NoOpMiddleware<Instant>>;

// == Rate Limiter ==
/// Thread-safe token bucket: bursts up to `capacity`, then one token every
/// `1 / refill_per_second` seconds.
pub struct RateLimiter {
    limiter: DirectLimiter,
    clock: LimiterClock,
    limit: RateLimit,
}

impl fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimiter")
            .field("limit", &self.limit)
            .field("clock", &self.clock)
            .finish_non_exhaustive()
    }
}

impl RateLimiter {
    /// Creates a full bucket.
    ///
    /// # Errors
    /// [`CacheError::InvalidConfig`] if `limit` fails [`RateLimit::validate`].
    pub fn new(limit: RateLimit, clock: Arc<dyn Clock>) -> Result<Self> {
        limit.validate()?;

        let burst = NonZeroU32::new(limit.capacity).ok_or_else(|| {
            CacheError::InvalidConfig("rate limit capacity must be greater than zero".to_string())
        })?;
        let quota = Quota::with_period(limit.period()?)
            .ok_or_else(|| {
                CacheError::InvalidConfig(format!(
                    "rate limit refill {} is too fast",
                    limit.refill_per_second
                ))
            })?
            .allow_burst(burst);

        let clock = LimiterClock(clock);
        Ok(Self {
            limiter: GovernorLimiter::direct_with_clock(quota, &clock),
            clock,
            limit,
        })
    }

    // == Allow ==
    /// Takes a token if one is available.
    ///
    /// A `false` is a signal to queue, retry later or reject, not an error.
    pub fn allow(&self) -> bool {
        self.limiter.check().is_ok()
    }

    // == Until Ready ==
    /// Sleeps until a token has been taken.
    ///
    /// Several sleepers may wake for the same token; the losers go back to
    /// sleep.
    pub async fn until_ready(&self) {
        loop {
            match self.limiter.check() {
                Ok(_) => return,
                Err(not_until) => {
                    let wait = not_until.wait_time_from(self.clock.now());
                    tokio::time::sleep(wait.clamp(MIN_WAIT, MAX_WAIT)).await;
                }
            }
        }
    }

    pub fn limit(&self) -> RateLimit {
        self.limit
    }
}
