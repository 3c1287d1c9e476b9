//! Database module
//!
//! This module handles database connections, step execution, the synchronization lock and
//! the migration history.

pub mod connection;
pub mod executor;
pub mod lock;
pub mod migrations;

// Re-export key types
pub use connection::{DatabaseConnection, Dialect, Param};
pub use executor::{SqlExecutor, Statement};
pub use lock::SyncLock;
pub use migrations::{MigrationHistory, MigrationRecord};
