//! Observability setup for sagaflow binaries.
//!
//! The engine itself only emits `tracing` events; this crate decides where
//! they go.

pub mod tracing_setup;

pub use tracing_setup::{LogFormat, TracingOptions, init_tracing, shutdown_tracing};
