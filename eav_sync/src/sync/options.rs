//! Synchronization and restore options

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::config::SyncConfig;
use crate::error::{Error, Result};
use crate::schema::diff::Action;

/// Which differences a sync is allowed to apply
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStrategy {
    /// Only `add` changes
    #[default]
    Additive,
    /// `add`, `modify` and `remove` changes
    Full,
}

impl SyncStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStrategy::Additive => "additive",
            SyncStrategy::Full => "full",
        }
    }

    /// Whether differences with `action` become executable steps under this strategy
    pub fn applies(&self, action: Action) -> bool {
        match self {
            SyncStrategy::Additive => action == Action::Add,
            SyncStrategy::Full => true,
        }
    }
}

impl fmt::Display for SyncStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "additive" => Ok(SyncStrategy::Additive),
            "full" => Ok(SyncStrategy::Full),
            other => Err(Error::ConfigError(format!(
                "Unknown sync strategy '{}', expected 'additive' or 'full'",
                other
            ))),
        }
    }
}

/// What a backup captures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupType {
    Schema,
    Data,
    #[default]
    Full,
}

impl BackupType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupType::Schema => "schema",
            BackupType::Data => "data",
            BackupType::Full => "full",
        }
    }

    pub fn includes_schema(&self) -> bool {
        matches!(self, BackupType::Schema | BackupType::Full)
    }

    pub fn includes_data(&self) -> bool {
        matches!(self, BackupType::Data | BackupType::Full)
    }
}

impl fmt::Display for BackupType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackupType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "schema" => Ok(BackupType::Schema),
            "data" => Ok(BackupType::Data),
            "full" => Ok(BackupType::Full),
            other => Err(Error::ConfigError(format!("Unknown backup type '{}'", other))),
        }
    }
}

/// Options of one sync invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncOptions {
    pub strategy: SyncStrategy,
    pub dry_run: bool,
    pub auto_backup: bool,
    pub force: bool,
    pub backup_type: BackupType,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            strategy: SyncStrategy::Additive,
            dry_run: false,
            auto_backup: true,
            force: false,
            backup_type: BackupType::Full,
        }
    }
}

impl SyncOptions {
    /// Defaults taken from the `[sync]` configuration section
    pub fn from_config(config: &SyncConfig) -> Result<Self> {
        Ok(Self {
            strategy: config.default_strategy.parse()?,
            auto_backup: config.auto_backup,
            ..Self::default()
        })
    }

    pub fn with_strategy(mut self, strategy: SyncStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn dry_run(mut self) -> Self {
        self.dry_run = true;
        self
    }

    pub fn force(mut self) -> Self {
        self.force = true;
        self
    }

    pub fn with_auto_backup(mut self, auto_backup: bool) -> Self {
        self.auto_backup = auto_backup;
        self
    }
}

/// Options of one restore invocation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RestoreOptions {
    /// Check restorability without touching the database
    pub verify_only: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strategies_parse_case_insensitively() {
        assert_eq!("FULL".parse::<SyncStrategy>().unwrap(), SyncStrategy::Full);
        assert_eq!(" additive ".parse::<SyncStrategy>().unwrap(), SyncStrategy::Additive);
        assert!("merge".parse::<SyncStrategy>().is_err());
    }

    #[test]
    fn additive_only_applies_additions() {
        assert!(SyncStrategy::Additive.applies(Action::Add));
        assert!(!SyncStrategy::Additive.applies(Action::Modify));
        assert!(!SyncStrategy::Additive.applies(Action::Remove));
        assert!(SyncStrategy::Full.applies(Action::Remove));
    }

    #[test]
    fn options_follow_sync_config() {
        let config = SyncConfig {
            default_strategy: "full".to_string(),
            auto_backup: false,
            ..SyncConfig::default()
        };
        let options = SyncOptions::from_config(&config).unwrap();

        assert_eq!(options.strategy, SyncStrategy::Full);
        assert!(!options.auto_backup);
        assert!(!options.dry_run);
    }
}
