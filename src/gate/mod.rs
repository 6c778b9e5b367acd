//! Gate Module
//!
//! Admission control for underlying loads: a token bucket for rate and a
//! semaphore for parallelism. Either or both may be configured. Loads pass
//! the gates one at a time in the order they were registered.

mod admission;
mod concurrency;
mod rate_limiter;
mod token_bucket;

pub use admission::{AdmissionQueue, Ticket, Turn};
pub use concurrency::{ConcurrencyGate, ConcurrencyPermit};
pub use rate_limiter::RateLimiter;
pub use token_bucket::TokenBucket;
