//! Configuration Module
//!
//! Handles loading and validating coordinator configuration from environment variables.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{CacheError, Result};

// == Rate Limit ==
/// Token bucket parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimit {
    /// Maximum burst size
    pub capacity: u32,
    /// Sustained tokens added per second
    pub refill_per_second: f64,
}

/// Slowest accepted refill: one token every 1_000_000 seconds.
pub const MIN_REFILL_PER_SECOND: f64 = 1e-6;

/// Longest accepted time to refill an empty bucket.
pub const MAX_REFILL_WINDOW: Duration = Duration::from_secs(1_000_000_000);

impl RateLimit {
    /// Rejects buckets that are empty, never refill, or refill too slowly to
    /// express in nanoseconds.
    pub fn validate(&self) -> Result<()> {
        if self.capacity == 0 {
            return Err(CacheError::InvalidConfig(
                "rate limit capacity must be greater than zero".to_string(),
            ));
        }
        if !self.refill_per_second.is_finite() || self.refill_per_second < MIN_REFILL_PER_SECOND {
            return Err(CacheError::InvalidConfig(format!(
                "rate limit refill must be at least {} per second, got {}",
                MIN_REFILL_PER_SECOND, self.refill_per_second
            )));
        }
        if f64::from(self.capacity) / self.refill_per_second > MAX_REFILL_WINDOW.as_secs_f64() {
            return Err(CacheError::InvalidConfig(format!(
                "rate limit of {} tokens at {} per second takes longer than {:?} to refill",
                self.capacity, self.refill_per_second, MAX_REFILL_WINDOW
            )));
        }
        Ok(())
    }

    /// Time for one token to come back.
    pub fn period(&self) -> Result<Duration> {
        Duration::try_from_secs_f64(1.0 / self.refill_per_second).map_err(|_| {
            CacheError::InvalidConfig(format!(
                "rate limit refill {} has no representable period",
                self.refill_per_second
            ))
        })
    }
}

// == Rate Limit Policy ==
/// What a would-be loader does when the bucket is empty.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RateLimitPolicy {
    /// Return [`CacheError::RateLimited`] right away
    #[default]
    FailFast,
    /// Delay the load until a token is available
    Wait,
}

impl FromStr for RateLimitPolicy {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fail-fast" | "fail_fast" | "failfast" => Ok(RateLimitPolicy::FailFast),
            "wait" => Ok(RateLimitPolicy::Wait),
            other => Err(CacheError::InvalidConfig(format!(
                "unknown rate limit policy '{}'",
                other
            ))),
        }
    }
}

/// Coordinator configuration parameters.
///
/// All values can be configured via environment variables with sensible defaults.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Maximum summed entry cost the cache can hold
    pub capacity: u64,
    /// Time-to-live for loaded entries, None = never expire
    pub ttl: Option<Duration>,
    /// Maximum number of loads running at once, None = unbounded
    pub max_concurrent: Option<usize>,
    /// Token bucket applied to loads, None = unlimited
    pub rate_limit: Option<RateLimit>,
    /// Behavior when the token bucket is empty
    pub rate_limit_policy: RateLimitPolicy,
    /// Background sweep frequency for expired entries, None = lazy purge only
    pub cleanup_interval: Option<Duration>,
}

impl Config {
    /// Creates a new Config by loading values from environment variables.
    ///
    /// # Environment Variables
    /// - `HERD_CAPACITY` - Maximum summed entry cost (default: 1000)
    /// - `HERD_TTL_SECS` - Entry TTL in seconds, 0 disables (default: 300)
    /// - `HERD_MAX_CONCURRENT` - Concurrent load limit, 0 disables (default: none)
    /// - `HERD_RATE_CAPACITY` / `HERD_RATE_REFILL_PER_SEC` - Token bucket, both required (default: none)
    /// - `HERD_RATE_POLICY` - `fail-fast` or `wait` (default: fail-fast)
    /// - `HERD_CLEANUP_INTERVAL_SECS` - Sweep frequency, 0 disables (default: 1)
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let rate_limit = match (
            env_parse::<u32>("HERD_RATE_CAPACITY"),
            env_parse::<f64>("HERD_RATE_REFILL_PER_SEC"),
        ) {
            (Some(capacity), Some(refill_per_second)) => Some(RateLimit {
                capacity,
                refill_per_second,
            }),
            _ => None,
        };

        Self {
            capacity: env_parse("HERD_CAPACITY").unwrap_or(defaults.capacity),
            ttl: env_parse::<u64>("HERD_TTL_SECS")
                .map(seconds_or_none)
                .unwrap_or(defaults.ttl),
            max_concurrent: env_parse::<usize>("HERD_MAX_CONCURRENT")
                .map(|n| (n > 0).then_some(n))
                .unwrap_or(defaults.max_concurrent),
            rate_limit,
            rate_limit_policy: env::var("HERD_RATE_POLICY")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.rate_limit_policy),
            cleanup_interval: env_parse::<u64>("HERD_CLEANUP_INTERVAL_SECS")
                .map(seconds_or_none)
                .unwrap_or(defaults.cleanup_interval),
        }
    }

    // == Validate ==
    /// Rejects values the coordinator cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.capacity == 0 {
            return Err(CacheError::InvalidConfig(
                "capacity must be greater than zero".to_string(),
            ));
        }
        if let Some(rate) = &self.rate_limit {
            rate.validate()?;
        }
        if self.max_concurrent == Some(0) {
            return Err(CacheError::InvalidConfig(
                "max_concurrent must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            capacity: 1000,
            ttl: Some(Duration::from_secs(300)),
            max_concurrent: None,
            rate_limit: None,
            rate_limit_policy: RateLimitPolicy::FailFast,
            cleanup_interval: Some(Duration::from_secs(1)),
        }
    }
}

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

fn seconds_or_none(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}
