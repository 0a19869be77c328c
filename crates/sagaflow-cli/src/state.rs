//! Process state shared by CLI commands.
//!
//! The config is always loaded; the run store is opened only by commands
//! that need it.

use std::path::PathBuf;

use sagaflow_infra::config::{default_config_path, load_engine_config};
use sagaflow_infra::sqlite::pool::{DatabasePool, default_data_dir};
use sagaflow_infra::sqlite::SqliteStore;
use sagaflow_types::config::EngineConfig;

pub struct AppState {
    pub config: EngineConfig,
    pub config_path: PathBuf,
    database_url: String,
}

impl AppState {
    pub async fn init(config: Option<PathBuf>, database: Option<String>) -> anyhow::Result<Self> {
        let data_dir = default_data_dir();
        let config_path = config.unwrap_or_else(|| default_config_path(&data_dir));
        let config = load_engine_config(&config_path).await;

        let database_url = match database {
            Some(url) => url,
            None => {
                tokio::fs::create_dir_all(&data_dir).await?;
                format!("sqlite://{}?mode=rwc", data_dir.join("sagaflow.db").display())
            }
        };

        Ok(Self {
            config,
            config_path,
            database_url,
        })
    }

    /// Open (and migrate) the run store.
    pub async fn open_store(&self) -> anyhow::Result<SqliteStore> {
        tracing::debug!(url = %self.database_url, "opening run store");
        let pool = DatabasePool::new(&self.database_url).await?;
        Ok(SqliteStore::new(pool))
    }
}
