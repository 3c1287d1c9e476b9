//! Results of sync and restore invocations
//!
//! Both are terminal: built once per call and never mutated after being returned. Failures are
//! reported in `errors` rather than as `Err`, so automation can inspect them uniformly.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Completed,
    InSync,
    DryRun,
    Aborted,
    Failed,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Completed => "completed",
            SyncStatus::InSync => "in_sync",
            SyncStatus::DryRun => "dry_run",
            SyncStatus::Aborted => "aborted",
            SyncStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeOutcome {
    Applied,
    Failed,
}

/// One executed migration step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppliedChange {
    pub description: String,
    pub outcome: ChangeOutcome,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncError {
    pub message: String,
    pub details: Option<String>,
}

impl SyncError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(message: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            details: Some(details.into()),
        }
    }
}

impl From<&Error> for SyncError {
    fn from(error: &Error) -> Self {
        SyncError::with_details(error.to_string(), error.kind())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncResult {
    pub entity_type_code: String,
    pub status: SyncStatus,
    pub success: bool,
    #[serde(with = "duration_ms")]
    pub execution_time: Duration,
    pub backup_id: Option<i64>,
    pub applied_changes: Vec<AppliedChange>,
    pub errors: Vec<SyncError>,
    pub metadata: BTreeMap<String, Value>,
}

impl SyncResult {
    pub fn new(entity_type_code: &str, status: SyncStatus) -> Self {
        Self {
            entity_type_code: entity_type_code.to_string(),
            status,
            success: !matches!(status, SyncStatus::Aborted | SyncStatus::Failed),
            execution_time: Duration::ZERO,
            backup_id: None,
            applied_changes: Vec::new(),
            errors: Vec::new(),
            metadata: BTreeMap::new(),
        }
    }

    /// Aborted before anything was changed
    pub fn aborted(entity_type_code: &str, error: &Error) -> Self {
        let mut result = Self::new(entity_type_code, SyncStatus::Aborted);
        result.errors.push(error.into());
        result
    }

    pub fn applied(&self) -> impl Iterator<Item = &AppliedChange> {
        self.applied_changes
            .iter()
            .filter(|change| change.outcome == ChangeOutcome::Applied)
    }
}

impl fmt::Display for SyncResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Entity type: {}", self.entity_type_code)?;
        writeln!(
            f,
            "Status: {} ({})",
            self.status.as_str(),
            if self.success { "success" } else { "failure" }
        )?;
        writeln!(f, "Execution time: {} ms", self.execution_time.as_millis())?;
        if let Some(backup_id) = self.backup_id {
            writeln!(f, "Backup: #{}", backup_id)?;
        }

        if !self.applied_changes.is_empty() {
            writeln!(f, "Changes:")?;
            for change in &self.applied_changes {
                let marker = match change.outcome {
                    ChangeOutcome::Applied => "applied",
                    ChangeOutcome::Failed => "FAILED",
                };
                writeln!(f, "  - [{}] {}", marker, change.description)?;
            }
        }

        if let Some(Value::Array(planned)) = self.metadata.get("planned_changes") {
            writeln!(f, "Planned changes:")?;
            for change in planned {
                writeln!(f, "  - {}", change.as_str().unwrap_or_default())?;
            }
        }

        if let Some(Value::Array(skipped)) = self.metadata.get("skipped_changes") {
            if !skipped.is_empty() {
                writeln!(f, "Skipped (requires --strategy=full):")?;
                for change in skipped {
                    writeln!(f, "  - {}", change.as_str().unwrap_or_default())?;
                }
            }
        }

        if !self.errors.is_empty() {
            writeln!(f, "Errors:")?;
            for error in &self.errors {
                match &error.details {
                    Some(details) => writeln!(f, "  - {} ({})", error.message, details)?,
                    None => writeln!(f, "  - {}", error.message)?,
                }
            }
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestoreStatus {
    Completed,
    Partial,
    Failed,
    Verified,
    VerificationFailed,
}

impl RestoreStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RestoreStatus::Completed => "completed",
            RestoreStatus::Partial => "partial",
            RestoreStatus::Failed => "failed",
            RestoreStatus::Verified => "verified",
            RestoreStatus::VerificationFailed => "verification_failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestoreResult {
    pub backup_id: i64,
    pub entity_type_code: Option<String>,
    pub success: bool,
    pub status: RestoreStatus,
    pub restored_tables: Vec<String>,
    pub errors: Vec<SyncError>,
    #[serde(with = "duration_ms")]
    pub execution_time: Duration,
}

impl RestoreResult {
    pub fn failed(backup_id: i64, error: &Error) -> Self {
        Self {
            backup_id,
            entity_type_code: None,
            success: false,
            status: RestoreStatus::Failed,
            restored_tables: Vec::new(),
            errors: vec![error.into()],
            execution_time: Duration::ZERO,
        }
    }
}

impl fmt::Display for RestoreResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Backup: #{}", self.backup_id)?;
        if let Some(code) = &self.entity_type_code {
            writeln!(f, "Entity type: {}", code)?;
        }
        writeln!(
            f,
            "Status: {} ({})",
            self.status.as_str(),
            if self.success { "success" } else { "failure" }
        )?;
        writeln!(f, "Execution time: {} ms", self.execution_time.as_millis())?;
        if !self.restored_tables.is_empty() {
            writeln!(f, "Tables:")?;
            for table in &self.restored_tables {
                writeln!(f, "  - {}", table)?;
            }
        }
        if !self.errors.is_empty() {
            writeln!(f, "Errors:")?;
            for error in &self.errors {
                writeln!(f, "  - {}", error.message)?;
            }
        }
        Ok(())
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aborted_results_carry_the_error() {
        let result = SyncResult::aborted("customer", &Error::LockContention("customer".to_string()));

        assert!(!result.success);
        assert_eq!(result.status, SyncStatus::Aborted);
        assert_eq!(result.errors.len(), 1);
        assert!(result.to_string().contains("already running"));
    }

    #[test]
    fn results_serialize_execution_time_in_millis() {
        let mut result = SyncResult::new("customer", SyncStatus::Completed);
        result.execution_time = Duration::from_millis(1500);

        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["execution_time"], 1500);
        assert_eq!(json["status"], "completed");
        assert_eq!(json["success"], true);
    }
}
