//! Admission control.
//!
//! - `distributor` -- priority queue with global and per-tenant limits,
//!   aging and deadline-aware admission
//! - `timing` -- historical per-workflow durations for deadline estimates

pub mod distributor;
pub mod timing;

pub use distributor::{Admission, Dispatch, Distributor, DistributorStats, QueueEntry};
