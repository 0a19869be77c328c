//! Shared domain types for sagaflow.
//!
//! This crate contains the domain types used across the orchestration engine:
//! workflow definitions, run records, failure taxonomy, events and config.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod circuit;
pub mod config;
pub mod error;
pub mod event;
pub mod workflow;
