//! Configuration handling for the EAV engine

use serde::{Deserialize, Serialize};
use std::fs;

use crate::error::{Error, Result};

/// Load configuration from a TOML file
pub fn load_from_file(path: &str) -> Result<Config> {
    let config_str = fs::read_to_string(path)
        .map_err(|e| Error::ConfigError(format!("Failed to read config file: {}", e)))?;

    let config: Config = toml::from_str(&config_str)
        .map_err(|e| Error::ConfigError(format!("Failed to parse config file: {}", e)))?;

    Ok(config)
}

/// Represents the complete engine configuration
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
    pub database: DatabaseConfig,
    pub entity_types: EntityTypesConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    pub logging: Option<LoggingConfig>,
}

/// Database connection configuration
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct DatabaseConfig {
    pub driver: String,
    pub url: String,
    pub pool_size: Option<u32>,
    pub timeout_seconds: Option<u64>,
    pub schema: Option<String>,
}

impl DatabaseConfig {
    /// Private in-memory SQLite database, used by tests and dry experiments
    pub fn sqlite_memory() -> Self {
        Self {
            driver: "sqlite".to_string(),
            url: "sqlite::memory:".to_string(),
            pool_size: Some(1),
            timeout_seconds: Some(5),
            schema: None,
        }
    }
}

/// Where entity type configuration files live
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct EntityTypesConfig {
    pub directory: String,
}

/// Schema synchronization behaviour
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct SyncConfig {
    pub default_strategy: String,
    pub auto_backup: bool,
    pub lock_ttl_seconds: u64,
    pub history_table: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            default_strategy: "additive".to_string(),
            auto_backup: true,
            lock_ttl_seconds: 600,
            history_table: "eav_schema_history".to_string(),
        }
    }
}

/// Value storage settings
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct StorageConfig {
    pub varchar_max_length: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            varchar_max_length: 255,
        }
    }
}

/// Process-local cache settings
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    pub prefix: String,
    pub config_ttl_seconds: u64,
    pub schema_analysis_ttl_seconds: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            prefix: "eav".to_string(),
            config_ttl_seconds: 3600,
            schema_analysis_ttl_seconds: 300,
        }
    }
}

/// Logging configuration
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<String>,
    #[serde(default = "default_log_format")]
    pub format: String,
    #[serde(default = "default_stdout")]
    pub stdout: bool,
}

fn default_log_format() -> String {
    "text".to_string()
}

fn default_stdout() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn optional_sections_fall_back_to_defaults() {
        let config: Config = toml::from_str(
            r#"
            [database]
            driver = "sqlite"
            url = "sqlite://eav.db"

            [entity_types]
            directory = "config/entity_types"

            [cache]
            prefix = "shop"
            "#,
        )
        .unwrap();

        assert_eq!(config.sync.default_strategy, "additive");
        assert!(config.sync.auto_backup);
        assert_eq!(config.storage.varchar_max_length, 255);
        assert_eq!(config.cache.prefix, "shop");
        assert_eq!(config.cache.schema_analysis_ttl_seconds, 300);
        assert!(config.logging.is_none());
    }
}
