//! In-memory `PersistentStore` backed by `DashMap`.
//!
//! Used for tests and for embedding the engine without durability. Clones
//! share the same maps, so a "restarted" engine can be handed the same data.

use std::sync::Arc;

use dashmap::DashMap;
use sagaflow_types::error::RepositoryError;
use serde_json::Value;

use super::store::PersistentStore;

#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    logs: Arc<DashMap<String, Vec<Value>>>,
    cells: Arc<DashMap<String, Value>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PersistentStore for InMemoryStore {
    async fn append(&self, key: &str, record: &Value) -> Result<(), RepositoryError> {
        self.logs
            .entry(key.to_string())
            .or_default()
            .push(record.clone());
        Ok(())
    }

    async fn read_all(&self, key: &str) -> Result<Vec<Value>, RepositoryError> {
        Ok(self
            .logs
            .get(key)
            .map(|log| log.value().clone())
            .unwrap_or_default())
    }

    async fn read(&self, key: &str) -> Result<Option<Value>, RepositoryError> {
        Ok(self.cells.get(key).map(|cell| cell.value().clone()))
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&Value>,
        new: &Value,
    ) -> Result<bool, RepositoryError> {
        use dashmap::mapref::entry::Entry;

        match (self.cells.entry(key.to_string()), expected) {
            (Entry::Vacant(slot), None) => {
                slot.insert(new.clone());
                Ok(true)
            }
            (Entry::Occupied(mut slot), Some(expected)) if slot.get() == expected => {
                slot.insert(new.clone());
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
