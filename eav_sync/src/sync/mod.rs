//! Schema synchronization
//!
//! The engine that reconciles the physical schema with entity type configuration, plus the
//! backup manager that makes its changes reversible.

pub mod backup;
pub mod engine;
pub mod events;
pub mod options;
pub mod result;

pub use backup::{Backup, BackupManager, TableSnapshot};
pub use engine::SynchronizationEngine;
pub use events::{FnListener, SyncEvent, SyncHooks, SyncListener};
pub use options::{BackupType, RestoreOptions, SyncOptions, SyncStrategy};
pub use result::{
    AppliedChange, ChangeOutcome, RestoreResult, RestoreStatus, SyncError, SyncResult, SyncStatus,
};
