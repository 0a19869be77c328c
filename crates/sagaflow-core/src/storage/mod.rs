//! Storage abstractions for sagaflow.
//!
//! Defines the `PersistentStore` trait plus an in-memory implementation.
//! The SQLite implementation lives in sagaflow-infra.

pub mod memory;
pub mod store;

pub use memory::InMemoryStore;
pub use store::PersistentStore;
