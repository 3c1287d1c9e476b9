//! Sync lifecycle hooks
//!
//! Listeners are kept in one list ordered by priority when they are registered; dispatch walks
//! the list as is.

use std::fmt;
use std::sync::Arc;

use crate::schema::generator::MigrationStep;
use crate::sync::options::SyncOptions;
use crate::sync::result::SyncResult;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SyncEvent<'a> {
    Started {
        entity_type_code: &'a str,
        options: &'a SyncOptions,
    },
    BackupCreated {
        entity_type_code: &'a str,
        backup_id: i64,
    },
    StepApplied {
        entity_type_code: &'a str,
        step: &'a MigrationStep,
    },
    StepFailed {
        entity_type_code: &'a str,
        step: &'a MigrationStep,
        error: &'a str,
    },
    Finished {
        result: &'a SyncResult,
    },
}

impl SyncEvent<'_> {
    pub fn name(&self) -> &'static str {
        match self {
            SyncEvent::Started { .. } => "started",
            SyncEvent::BackupCreated { .. } => "backup_created",
            SyncEvent::StepApplied { .. } => "step_applied",
            SyncEvent::StepFailed { .. } => "step_failed",
            SyncEvent::Finished { .. } => "finished",
        }
    }
}

pub trait SyncListener: Send + Sync {
    fn on_event(&self, event: &SyncEvent<'_>);

    /// Higher priorities run first
    fn priority(&self) -> i32 {
        0
    }
}

/// Adapts a closure into a listener
pub struct FnListener<F> {
    priority: i32,
    callback: F,
}

impl<F> FnListener<F>
where
    F: Fn(&SyncEvent<'_>) + Send + Sync,
{
    pub fn new(priority: i32, callback: F) -> Self {
        Self { priority, callback }
    }
}

impl<F> SyncListener for FnListener<F>
where
    F: Fn(&SyncEvent<'_>) + Send + Sync,
{
    fn on_event(&self, event: &SyncEvent<'_>) {
        (self.callback)(event)
    }

    fn priority(&self) -> i32 {
        self.priority
    }
}

#[derive(Default, Clone)]
pub struct SyncHooks {
    listeners: Vec<Arc<dyn SyncListener>>,
}

impl SyncHooks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert after every listener of equal or higher priority
    pub fn register(&mut self, listener: Arc<dyn SyncListener>) {
        let priority = listener.priority();
        let position = self
            .listeners
            .iter()
            .position(|l| l.priority() < priority)
            .unwrap_or(self.listeners.len());
        self.listeners.insert(position, listener);
    }

    pub fn dispatch(&self, event: &SyncEvent<'_>) {
        tracing::trace!(event = event.name(), listeners = self.listeners.len(), "Dispatching sync event");
        for listener in &self.listeners {
            listener.on_event(event);
        }
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }
}

impl fmt::Debug for SyncHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncHooks")
            .field("listeners", &self.listeners.len())
            .finish()
    }
}
