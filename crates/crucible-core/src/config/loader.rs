//! Configuration loading from YAML files with environment overrides

use std::path::Path;

use crate::config::types::CrucibleConfig;
use crate::errors::CrucibleError;

pub struct ConfigLoader;

impl ConfigLoader {
    /// Load and validate configuration from a YAML file.
    pub async fn from_file(path: impl AsRef<Path>) -> Result<CrucibleConfig, CrucibleError> {
        let path = path.as_ref();
        let raw = tokio::fs::read_to_string(path).await.map_err(|e| {
            CrucibleError::ConfigError(format!("cannot read {}: {e}", path.display()))
        })?;
        let mut config: CrucibleConfig = serde_yaml::from_str(&raw)
            .map_err(|e| CrucibleError::ConfigError(format!("{}: {e}", path.display())))?;
        Self::apply_env_overrides(&mut config);
        config.validate()?;
        Ok(config)
    }

    /// Built-in defaults with environment overrides applied.
    pub fn from_defaults() -> Result<CrucibleConfig, CrucibleError> {
        let mut config = CrucibleConfig::default();
        Self::apply_env_overrides(&mut config);
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(config: &mut CrucibleConfig) {
        if let Ok(dir) = std::env::var("CRUCIBLE_DATA_DIR") {
            if !dir.is_empty() {
                config.data_dir = dir.into();
            }
        }
        if let Ok(val) = std::env::var("CRUCIBLE_MAX_RETRIES") {
            if let Ok(parsed) = val.parse() {
                config.queue.max_retries = parsed;
            }
        }
        if let Ok(val) = std::env::var("CRUCIBLE_MESSAGE_TTL_MS") {
            if let Ok(parsed) = val.parse() {
                config.queue.message_ttl_ms = parsed;
            }
        }
    }
}
