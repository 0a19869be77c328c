//! SQLite persistent store implementation.
//!
//! Implements `PersistentStore` from `sagaflow-core` using sqlx with split
//! read/write pools. Logs live in `run_log`, cells in `run_cell`; values are
//! stored as JSON text.

use chrono::Utc;
use sagaflow_core::storage::PersistentStore;
use sagaflow_types::error::RepositoryError;
use serde_json::Value;
use sqlx::Row;

use super::pool::DatabasePool;

/// SQLite-backed implementation of `PersistentStore`.
#[derive(Clone)]
pub struct SqliteStore {
    pool: DatabasePool,
}

impl SqliteStore {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

fn query_error(e: sqlx::Error) -> RepositoryError {
    RepositoryError::Query(e.to_string())
}

fn parse_value(text: &str) -> Result<Value, RepositoryError> {
    serde_json::from_str(text)
        .map_err(|e| RepositoryError::Serialization(format!("invalid JSON value: {e}")))
}

impl PersistentStore for SqliteStore {
    async fn append(&self, key: &str, record: &Value) -> Result<(), RepositoryError> {
        let value = serde_json::to_string(record)?;
        sqlx::query(
            r#"INSERT INTO run_log (key, seq, value, created_at)
               VALUES (?, (SELECT COALESCE(MAX(seq), 0) + 1 FROM run_log WHERE key = ?), ?, ?)"#,
        )
        .bind(key)
        .bind(key)
        .bind(&value)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;

        Ok(())
    }

    async fn read_all(&self, key: &str) -> Result<Vec<Value>, RepositoryError> {
        let rows = sqlx::query("SELECT value FROM run_log WHERE key = ? ORDER BY seq")
            .bind(key)
            .fetch_all(&self.pool.reader)
            .await
            .map_err(query_error)?;

        let mut values = Vec::with_capacity(rows.len());
        for row in &rows {
            let text: String = row.try_get("value").map_err(query_error)?;
            values.push(parse_value(&text)?);
        }
        Ok(values)
    }

    async fn read(&self, key: &str) -> Result<Option<Value>, RepositoryError> {
        let row = sqlx::query("SELECT value FROM run_cell WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_error)?;

        match row {
            Some(row) => {
                let text: String = row.try_get("value").map_err(query_error)?;
                Ok(Some(parse_value(&text)?))
            }
            None => Ok(None),
        }
    }

    // Cells are compared by their serialized JSON text; serde_json writes
    // object keys in sorted order, so equal values serialize identically.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&Value>,
        new: &Value,
    ) -> Result<bool, RepositoryError> {
        let new_text = serde_json::to_string(new)?;
        let now = Utc::now().to_rfc3339();

        let result = match expected {
            None => sqlx::query(
                r#"INSERT INTO run_cell (key, value, updated_at) VALUES (?, ?, ?)
                   ON CONFLICT (key) DO NOTHING"#,
            )
            .bind(key)
            .bind(&new_text)
            .bind(&now)
            .execute(&self.pool.writer)
            .await
            .map_err(query_error)?,
            Some(expected) => {
                let expected_text = serde_json::to_string(expected)?;
                sqlx::query("UPDATE run_cell SET value = ?, updated_at = ? WHERE key = ? AND value = ?")
                    .bind(&new_text)
                    .bind(&now)
                    .bind(key)
                    .bind(&expected_text)
                    .execute(&self.pool.writer)
                    .await
                    .map_err(query_error)?
            }
        };

        Ok(result.rows_affected() == 1)
    }
}
