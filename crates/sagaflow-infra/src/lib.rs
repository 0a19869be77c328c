//! Infrastructure layer for sagaflow.
//!
//! Implements the store trait defined in `sagaflow-core` on SQLite and loads
//! the engine's TOML configuration.

pub mod config;
pub mod sqlite;
