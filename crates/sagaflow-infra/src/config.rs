//! Engine configuration loader.
//!
//! Reads `sagaflow.toml` and deserializes it into [`EngineConfig`]. Falls
//! back to defaults when the file is missing or malformed, so a bad config
//! never keeps the engine from starting.

use std::path::{Path, PathBuf};

use sagaflow_types::config::EngineConfig;

pub const CONFIG_FILE_NAME: &str = "sagaflow.toml";

/// `{data_dir}/sagaflow.toml`
pub fn default_config_path(data_dir: &Path) -> PathBuf {
    data_dir.join(CONFIG_FILE_NAME)
}

/// Load engine configuration from `path`.
///
/// - Missing file: defaults.
/// - Unreadable or unparsable file: logs a warning, defaults.
///
/// The result is always normalized.
pub async fn load_engine_config(path: &Path) -> EngineConfig {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No config found at {}, using defaults", path.display());
            return EngineConfig::default().normalized();
        }
        Err(err) => {
            tracing::warn!("Failed to read {}: {err}, using defaults", path.display());
            return EngineConfig::default().normalized();
        }
    };

    match toml::from_str::<EngineConfig>(&content) {
        Ok(config) => config.normalized(),
        Err(err) => {
            tracing::warn!("Failed to parse {}: {err}, using defaults", path.display());
            EngineConfig::default().normalized()
        }
    }
}
