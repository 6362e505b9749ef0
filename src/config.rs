use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::cache::CacheConfig;
use crate::environment::AdjustmentRules;
use crate::error::{EngineError, Result};
use crate::profiles::ProfileStore;
use crate::store::DB_PATH;
use crate::window::DEFAULT_WINDOW_SIZE;

pub const CONFIG_ENV: &str = "GROW_SCHEDULER_CONFIG";
pub const DB_ENV: &str = "GROW_SCHEDULER_DB";
pub const ADDR_ENV: &str = "GROW_SCHEDULER_ADDR";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    pub window_size: u32,
    pub horizon_days: u32,
    pub user_id: String,
    pub db_path: PathBuf,
    pub bind_addr: String,
    pub profiles_path: Option<PathBuf>,
    pub cache: CacheConfig,
    pub rules: AdjustmentRules,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            window_size: DEFAULT_WINDOW_SIZE,
            horizon_days: 30,
            user_id: "local".to_string(),
            db_path: PathBuf::from(DB_PATH),
            bind_addr: "127.0.0.1:3000".to_string(),
            profiles_path: None,
            cache: CacheConfig::default(),
            rules: AdjustmentRules::default(),
        }
    }
}

impl EngineConfig {
    pub fn from_json(text: &str) -> Result<Self> {
        let config: EngineConfig = serde_json::from_str(text)
            .map_err(|e| EngineError::validation("config", e.to_string()))?;
        config.check()?;
        Ok(config)
    }

    // Optional file named by GROW_SCHEDULER_CONFIG, then single-field
    // overrides from the environment.
    pub fn from_env() -> Result<Self> {
        let mut config = match std::env::var(CONFIG_ENV) {
            Ok(path) => {
                let text = std::fs::read_to_string(&path)?;
                info!(path = %path, "loaded config file");
                Self::from_json(&text)?
            }
            Err(_) => Self::default(),
        };
        if let Ok(db) = std::env::var(DB_ENV) {
            config.db_path = PathBuf::from(db);
        }
        if let Ok(addr) = std::env::var(ADDR_ENV) {
            config.bind_addr = addr;
        }
        config.check()?;
        Ok(config)
    }

    // Built-in profiles unless an override file is configured.
    pub fn load_profiles(&self) -> Result<ProfileStore> {
        match &self.profiles_path {
            Some(path) => {
                let text = std::fs::read_to_string(path)?;
                ProfileStore::from_json(&text)
            }
            None => Ok(ProfileStore::builtin().clone()),
        }
    }

    fn check(&self) -> Result<()> {
        if self.window_size == 0 {
            return Err(EngineError::validation("window_size", "must be at least 1"));
        }
        if self.cache.capacity == 0 {
            return Err(EngineError::validation("cache.capacity", "must be at least 1"));
        }
        if self.cache.maintenance_interval_secs == 0 {
            return Err(EngineError::validation(
                "cache.maintenance_interval_secs",
                "must be at least 1",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_defaults() {
        let config =
            EngineConfig::from_json(r#"{"window_size": 7, "cache": {"capacity": 8}}"#).unwrap();
        assert_eq!(config.window_size, 7);
        assert_eq!(config.cache.capacity, 8);
        assert_eq!(config.cache.ttl_secs, 300);
        assert_eq!(config.horizon_days, 30);
        assert_eq!(config.rules, AdjustmentRules::default());
    }

    #[test]
    fn zero_window_is_rejected() {
        assert!(EngineConfig::from_json(r#"{"window_size": 0}"#).is_err());
    }
}
