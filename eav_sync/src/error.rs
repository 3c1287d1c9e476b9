//! Error types for the EAV engine

use std::collections::BTreeMap;

use thiserror::Error;

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, Error>;

/// Field name -> validation messages
pub type FieldErrors = BTreeMap<String, Vec<String>>;

/// Error types for the EAV engine
#[derive(Error, Debug)]
pub enum Error {
    /// Missing or malformed entity type configuration
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Missing entity or required attribute violation
    #[error("Entity error: {0}")]
    EntityError(String),

    /// Per-field value errors
    #[error("Validation failed: {}", format_field_errors(.0))]
    ValidationError(FieldErrors),

    /// Read/write/delete failure in a storage strategy
    #[error("Storage error in {strategy} strategy: {message}")]
    StorageError {
        strategy: String,
        message: String,
        transient: bool,
    },

    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Schema analysis error: {0}")]
    SchemaAnalysisError(String),

    #[error("Migration error: {0}")]
    MigrationError(String),

    #[error("Backup error: {0}")]
    BackupError(String),

    #[error("Restore error: {0}")]
    RestoreError(String),

    #[error("Synchronization of entity type '{0}' is already running")]
    LockContention(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("SQLx error: {0}")]
    SqlxError(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl Error {
    /// Wrap a driver error raised inside a storage strategy
    pub fn storage(strategy: &str, error: sqlx::Error) -> Self {
        Error::StorageError {
            strategy: strategy.to_string(),
            transient: is_transient(&error),
            message: error.to_string(),
        }
    }

    /// Single-field validation failure
    pub fn invalid_field(field: &str, message: impl Into<String>) -> Self {
        let mut errors = FieldErrors::new();
        errors.insert(field.to_string(), vec![message.into()]);
        Error::ValidationError(errors)
    }

    /// Whether a caller may retry the failed operation unchanged
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::StorageError { transient, .. } => *transient,
            Error::LockContention(_) => true,
            _ => false,
        }
    }

    /// Short machine-readable name used in sync/restore reports
    pub fn kind(&self) -> &'static str {
        match self {
            Error::ConfigError(_) => "configuration",
            Error::EntityError(_) => "entity",
            Error::ValidationError(_) => "validation",
            Error::StorageError { .. } => "storage",
            Error::DatabaseError(_) | Error::SqlxError(_) => "database",
            Error::SchemaAnalysisError(_) => "schema_analysis",
            Error::MigrationError(_) => "migration",
            Error::BackupError(_) => "backup",
            Error::RestoreError(_) => "restore",
            Error::LockContention(_) => "lock_contention",
            Error::IoError(_) => "io",
            Error::SerializationError(_) => "serialization",
        }
    }
}

/// Pool exhaustion, lock timeouts and serialization conflicts
fn is_transient(error: &sqlx::Error) -> bool {
    match error {
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => true,
        sqlx::Error::Database(db) => {
            let locked = db.message().contains("database is locked");
            let code = db.code();
            let code = code.as_deref();
            locked || matches!(code, Some("40001") | Some("40P01") | Some("55P03"))
        }
        _ => false,
    }
}

fn format_field_errors(errors: &FieldErrors) -> String {
    errors
        .iter()
        .map(|(field, messages)| format!("{}: {}", field, messages.join(", ")))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Convert Serde JSON errors to engine errors
impl From<serde_json::Error> for Error {
    fn from(error: serde_json::Error) -> Self {
        Error::SerializationError(error.to_string())
    }
}

/// Convert TOML deserialization errors to engine errors
impl From<toml::de::Error> for Error {
    fn from(error: toml::de::Error) -> Self {
        Error::ConfigError(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_error_lists_every_field() {
        let mut errors = FieldErrors::new();
        errors.insert("email".into(), vec!["is required".into(), "must be unique".into()]);
        errors.insert("age".into(), vec!["must be an integer".into()]);

        let err = Error::ValidationError(errors);
        assert_eq!(
            err.to_string(),
            "Validation failed: age: must be an integer; email: is required, must be unique"
        );
        assert_eq!(err.kind(), "validation");
    }

    #[test]
    fn only_transient_failures_are_retryable() {
        let lock = Error::LockContention("customer".into());
        assert!(lock.is_retryable());

        let storage = Error::StorageError {
            strategy: "varchar".into(),
            message: "pool timed out".into(),
            transient: true,
        };
        assert!(storage.is_retryable());
        assert!(!Error::invalid_field("email", "too long").is_retryable());
        assert!(!Error::storage("int", sqlx::Error::RowNotFound).is_retryable());
    }
}
