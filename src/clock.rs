//! Clock Module
//!
//! Monotonic time sources used by expiration and rate limiting.

use std::fmt::Debug;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

// == Clock Trait ==
/// A source of monotonic time.
pub trait Clock: Debug + Send + Sync + 'static {
    /// Returns the current instant.
    fn now(&self) -> Instant;
}

// == System Clock ==
/// Clock backed by [`Instant::now`].
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

// == Manual Clock ==
/// Clock that only moves when told to.
///
/// Intended for tests that need deterministic expiration and refill.
#[derive(Debug)]
pub struct ManualClock {
    origin: Instant,
    offset: Mutex<Duration>,
}

impl ManualClock {
    /// Creates a clock frozen at the moment of construction.
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
        }
    }

    /// Moves the clock forward.
    pub fn advance(&self, by: Duration) {
        *self.offset.lock() += by;
    }

    /// Time elapsed since construction, as seen by this clock.
    pub fn elapsed(&self) -> Duration {
        *self.offset.lock()
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.origin + *self.offset.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_frozen() {
        let clock = ManualClock::new();
        let a = clock.now();
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(clock.now(), a);
    }

    #[test]
    fn test_manual_clock_advance() {
        let clock = ManualClock::new();
        let start = clock.now();
        clock.advance(Duration::from_secs(3));
        clock.advance(Duration::from_millis(500));
        assert_eq!(clock.now() - start, Duration::from_millis(3500));
        assert_eq!(clock.elapsed(), Duration::from_millis(3500));
    }

    #[test]
    fn test_system_clock_monotonic() {
        let clock = SystemClock;
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a);
    }
}
