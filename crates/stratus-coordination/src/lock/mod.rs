//! Distributed lock over store leases
//!
//! This module provides:
//! - Lock handles scoped to an instance, the application, or a custom context
//! - Acquire with backoff, renew and idempotent release
//! - Background renewal of leases longer than the store's maximum

mod manager;
mod model;
mod renewal;

pub use manager::*;
pub use model::*;
