//! Persistent store trait.
//!
//! The minimal storage contract the run-state adapter needs: append-only logs
//! and compare-and-swap cells, both holding JSON values.
//! `SqliteStore` in sagaflow-infra and `InMemoryStore` here implement it.

use sagaflow_types::error::RepositoryError;
use serde_json::Value;

/// Trait for the engine's durable storage.
///
/// A key names either a log (`append` / `read_all`) or a cell
/// (`read` / `compare_and_swap`); callers never mix the two for one key.
/// Uses RPITIT (native async fn in traits, Rust 2024 edition).
pub trait PersistentStore: Send + Sync {
    /// Atomically append a record to the log at `key`.
    fn append(
        &self,
        key: &str,
        record: &Value,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Every record of the log at `key`, in append order. Empty if absent.
    fn read_all(
        &self,
        key: &str,
    ) -> impl std::future::Future<Output = Result<Vec<Value>, RepositoryError>> + Send;

    /// Current value of the cell at `key`.
    fn read(
        &self,
        key: &str,
    ) -> impl std::future::Future<Output = Result<Option<Value>, RepositoryError>> + Send;

    /// Replace the cell at `key` with `new` only if it currently equals
    /// `expected` (`None` meaning absent). Returns whether the swap happened.
    fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&Value>,
        new: &Value,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;
}
