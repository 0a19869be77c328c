//! Fault isolation around capability calls.
//!
//! - `breaker` -- per-dependency circuit breaker state machine
//! - `retry` -- exponential backoff with jitter
//! - `isolator` -- `FaultIsolator`, combining both with hard timeouts

pub mod breaker;
pub mod isolator;
pub mod retry;

pub use isolator::{CallFailure, CallSuccess, FaultIsolator};
pub use retry::RetryPolicy;
