//! Coordinator Module
//!
//! The public get-or-load entry point and its statistics.

mod handle;
mod stats;

pub use handle::{Coordinator, CoordinatorBuilder, Weigher};
pub use stats::CoordinatorStats;
