//! Token Bucket Module
//!
//! Rate limiting that allows bursts up to a capacity and smooths sustained load.

use std::time::{Duration, Instant};

/// Token counts this close below a whole number are snapped up to it on
/// refill, so waiting exactly `1 / refill` seconds yields a whole token.
const SNAP_TOLERANCE: f64 = 1e-6;

// == Token Bucket ==
/// Token bucket state, refilled lazily from the instants passed in.
///
/// Single owner, no locking. The coordinator shares a
/// [`RateLimiter`](crate::gate::RateLimiter) instead.
///
/// Invariant: `0 <= tokens <= capacity`.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_per_second: f64,
    last_refill: Instant,
}

impl TokenBucket {
    // == Constructor ==
    /// Creates a full bucket.
    pub fn new(capacity: u32, refill_per_second: f64, now: Instant) -> Self {
        let capacity = f64::from(capacity);
        Self {
            capacity,
            tokens: capacity,
            refill_per_second,
            last_refill: now,
        }
    }

    // == Refill ==
    /// Adds tokens for the time elapsed since the last refill.
    ///
    /// Instants earlier than the last refill add nothing, and repeated calls
    /// with the same instant are no-ops.
    pub fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        if elapsed.is_zero() {
            return;
        }
        let tokens =
            (self.tokens + elapsed.as_secs_f64() * self.refill_per_second).min(self.capacity);
        let whole = tokens.ceil();
        self.tokens = if whole - tokens < SNAP_TOLERANCE {
            whole
        } else {
            tokens
        };
        self.last_refill = now;
    }

    // == Try Take ==
    /// Takes one token if available.
    pub fn try_take(&mut self, now: Instant) -> bool {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    // == Time Until Ready ==
    /// How long until a token can be taken; zero if one is available now.
    ///
    /// Saturates at [`Duration::MAX`] when the refill is too slow to express.
    pub fn time_until_ready(&mut self, now: Instant) -> Duration {
        self.refill(now);
        if self.tokens >= 1.0 {
            return Duration::ZERO;
        }
        Duration::try_from_secs_f64((1.0 - self.tokens) / self.refill_per_second)
            .unwrap_or(Duration::MAX)
    }

    /// Current token count after refilling.
    pub fn available(&mut self, now: Instant) -> f64 {
        self.refill(now);
        self.tokens
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    pub fn refill_per_second(&self) -> f64 {
        self.refill_per_second
    }
}
