//! Coalesce Module
//!
//! Request coalescing: concurrent callers for the same missing key share one load.

mod pending;

pub use pending::{
    wait_for, PendingChannel, PendingRequest, PendingSender, RegistrationId, RequestCoalescer,
};
