//! Synchronization engine
//!
//! Drives one sync from planning to completion:
//! resolve the entity type, analyze, then either report a dry run or lock, back up, apply the
//! generated steps one by one and release. Every outcome is returned as a [`SyncResult`].

use std::sync::Arc;
use std::time::Instant;

use serde_json::{json, Value};

use crate::cache::CacheDriver;
use crate::config::Config;
use crate::db::connection::DatabaseConnection;
use crate::db::executor::SqlExecutor;
use crate::db::lock::SyncLock;
use crate::db::migrations::MigrationHistory;
use crate::entity::registry::EntityTypeRegistry;
use crate::entity::types::EntityType;
use crate::error::{Error, Result};
use crate::schema::analyzer::{AnalysisOptions, SchemaAnalysis, SchemaAnalyzer};
use crate::schema::generator::{MigrationGenerator, MigrationPlan};
use crate::sync::backup::BackupManager;
use crate::sync::events::{SyncEvent, SyncHooks, SyncListener};
use crate::sync::options::{RestoreOptions, SyncOptions, SyncStrategy};
use crate::sync::result::{AppliedChange, ChangeOutcome, RestoreResult, SyncError, SyncResult, SyncStatus};

pub struct SynchronizationEngine {
    connection: DatabaseConnection,
    registry: Arc<EntityTypeRegistry>,
    analyzer: SchemaAnalyzer,
    generator: MigrationGenerator,
    executor: SqlExecutor,
    backups: BackupManager,
    history: MigrationHistory,
    hooks: SyncHooks,
    lock_ttl_seconds: u64,
}

impl SynchronizationEngine {
    pub fn new(
        connection: DatabaseConnection,
        config: &Config,
        registry: Arc<EntityTypeRegistry>,
        cache: Arc<CacheDriver>,
    ) -> Self {
        Self {
            analyzer: SchemaAnalyzer::new(connection.clone(), config, cache),
            generator: MigrationGenerator::new(connection.dialect(), &config.storage),
            executor: SqlExecutor::new(connection.clone()),
            backups: BackupManager::new(connection.clone(), config),
            history: MigrationHistory::new(connection.clone(), &config.sync.history_table),
            hooks: SyncHooks::new(),
            lock_ttl_seconds: config.sync.lock_ttl_seconds,
            registry,
            connection,
        }
    }

    pub fn register_listener(&mut self, listener: Arc<dyn SyncListener>) {
        self.hooks.register(listener);
    }

    pub fn analyzer(&self) -> &SchemaAnalyzer {
        &self.analyzer
    }

    pub fn backups(&self) -> &BackupManager {
        &self.backups
    }

    pub fn history(&self) -> &MigrationHistory {
        &self.history
    }

    /// Analyze an entity type without planning or applying anything
    pub async fn analyze(&self, entity_type_code: &str, strategy: SyncStrategy) -> Result<SchemaAnalysis> {
        let entity_type = self.registry.get(entity_type_code)?;
        let options = AnalysisOptions {
            strategy,
            ..AnalysisOptions::default()
        };
        self.analyzer.analyze(&entity_type, &options).await
    }

    /// Synchronize the physical schema of one entity type with its configuration
    pub async fn sync(&self, entity_type_code: &str, options: &SyncOptions) -> SyncResult {
        let started = Instant::now();
        tracing::info!(
            entity_type = %entity_type_code,
            strategy = %options.strategy,
            dry_run = options.dry_run,
            force = options.force,
            auto_backup = options.auto_backup,
            "Starting schema synchronization"
        );
        self.hooks.dispatch(&SyncEvent::Started {
            entity_type_code,
            options,
        });

        let mut result = match self.registry.get(entity_type_code) {
            Err(e) => SyncResult::aborted(entity_type_code, &e),
            Ok(entity_type) if options.dry_run => self.plan(&entity_type, options).await,
            Ok(entity_type) => self.locked_apply(&entity_type, options).await,
        };
        result.execution_time = started.elapsed();

        tracing::info!(
            entity_type = %entity_type_code,
            status = result.status.as_str(),
            success = result.success,
            applied = result.applied().count(),
            errors = result.errors.len(),
            elapsed_ms = result.execution_time.as_millis() as u64,
            "Schema synchronization finished"
        );
        self.hooks.dispatch(&SyncEvent::Finished { result: &result });
        result
    }

    /// Restore a backup and drop cached analysis of the affected entity type
    pub async fn restore(&self, backup_id: i64, options: &RestoreOptions) -> RestoreResult {
        let result = self.backups.restore(backup_id, options).await;
        if !options.verify_only {
            if let Some(code) = &result.entity_type_code {
                self.analyzer.invalidate(code);
            }
        }
        result
    }

    /// Dry run: analysis and plan only
    async fn plan(&self, entity_type: &EntityType, options: &SyncOptions) -> SyncResult {
        let code = entity_type.code.as_str();
        let analysis = match self.analyzer.analyze(entity_type, &AnalysisOptions::from(options)).await {
            Ok(analysis) => analysis,
            Err(e) => return failed(code, &e),
        };
        let plan = match self.generator.generate(&analysis, options.strategy) {
            Ok(plan) => plan,
            Err(e) => return failed(code, &e),
        };

        let mut result = SyncResult::new(code, SyncStatus::DryRun);
        let planned: Vec<Value> = analysis
            .report
            .differences
            .iter()
            .map(|d| Value::String(d.description.clone()))
            .collect();
        result.metadata.insert("planned_changes".to_string(), Value::Array(planned));
        result.metadata.insert("planned_steps".to_string(), json!(plan.descriptions()));
        result.metadata.insert("risk_score".to_string(), json!(analysis.report.risk_score));
        result
            .metadata
            .insert("risk_level".to_string(), json!(analysis.report.risk_level.as_str()));
        result
            .metadata
            .insert("recommendations".to_string(), json!(analysis.report.recommendations));
        insert_skipped(&mut result, &plan);
        result
    }

    async fn locked_apply(&self, entity_type: &EntityType, options: &SyncOptions) -> SyncResult {
        let lock = match SyncLock::acquire(&self.connection, &entity_type.code, self.lock_ttl_seconds).await {
            Ok(lock) => lock,
            Err(e) => {
                tracing::warn!(entity_type = %entity_type.code, error = %e, "Could not acquire sync lock");
                return SyncResult::aborted(&entity_type.code, &e);
            }
        };

        let result = self.apply(entity_type, options).await;

        if let Err(e) = lock.release().await {
            tracing::error!(entity_type = %entity_type.code, error = %e, "Failed to release sync lock");
        }
        result
    }

    async fn apply(&self, entity_type: &EntityType, options: &SyncOptions) -> SyncResult {
        let code = entity_type.code.as_str();

        // Never act on a cached snapshot
        let analysis = match self.analyzer.refresh(entity_type, &AnalysisOptions::from(options)).await {
            Ok(analysis) => analysis,
            Err(e) => return failed(code, &e),
        };
        if analysis.report.is_in_sync() {
            tracing::info!(entity_type = %code, "Schema already in sync");
            return SyncResult::new(code, SyncStatus::InSync);
        }

        let plan = match self.generator.generate(&analysis, options.strategy) {
            Ok(plan) => plan,
            Err(e) => return failed(code, &e),
        };

        if plan.has_destructive_steps() && !options.force {
            let mut result = SyncResult::new(code, SyncStatus::Aborted);
            result.errors.push(SyncError::with_details(
                "Destructive changes require --force (or --dry-run to review them)",
                plan.steps
                    .iter()
                    .filter(|step| step.phase.is_destructive())
                    .map(|step| step.description.clone())
                    .collect::<Vec<_>>()
                    .join("; "),
            ));
            return result;
        }

        let mut result = SyncResult::new(code, SyncStatus::Completed);
        insert_skipped(&mut result, &plan);
        result
            .metadata
            .insert("risk_score".to_string(), json!(analysis.report.risk_score));

        let needs_backup = analysis
            .report
            .differences
            .iter()
            .any(|d| d.requires_backup() && options.strategy.applies(d.action));
        if options.auto_backup && needs_backup {
            match self.backups.backup(entity_type, options.backup_type).await {
                Ok(backup) => {
                    result.backup_id = Some(backup.id);
                    self.hooks.dispatch(&SyncEvent::BackupCreated {
                        entity_type_code: code,
                        backup_id: backup.id,
                    });
                }
                Err(e) => {
                    tracing::error!(entity_type = %code, error = %e, "Backup failed, sync aborted");
                    result.status = SyncStatus::Failed;
                    result.success = false;
                    result.errors.push(SyncError::from(&e));
                    return result;
                }
            }
        }

        if let Err(e) = self.history.ensure_table().await {
            tracing::warn!(error = %e, "Migration history unavailable");
        }

        for step in &plan.steps {
            match self.executor.apply(step).await {
                Ok(elapsed) => {
                    if let Err(e) = self.history.record(code, step, elapsed).await {
                        tracing::warn!(step = %step.description, error = %e, "Failed to record migration");
                    }
                    result.applied_changes.push(AppliedChange {
                        description: step.description.clone(),
                        outcome: ChangeOutcome::Applied,
                    });
                    self.hooks.dispatch(&SyncEvent::StepApplied {
                        entity_type_code: code,
                        step,
                    });
                }
                Err(e) => {
                    let message = e.to_string();
                    tracing::error!(step = %step.description, error = %message, "Migration step failed");
                    result.applied_changes.push(AppliedChange {
                        description: step.description.clone(),
                        outcome: ChangeOutcome::Failed,
                    });
                    result.errors.push(SyncError::from(&e));
                    self.hooks.dispatch(&SyncEvent::StepFailed {
                        entity_type_code: code,
                        step,
                        error: &message,
                    });
                    // Earlier steps stay applied; the backup is the way back
                    break;
                }
            }
        }

        self.analyzer.invalidate(code);

        if !result.errors.is_empty() {
            result.status = SyncStatus::Failed;
            result.success = false;
        }
        result
    }
}

fn failed(entity_type_code: &str, error: &Error) -> SyncResult {
    let mut result = SyncResult::new(entity_type_code, SyncStatus::Failed);
    result.errors.push(error.into());
    result
}

fn insert_skipped(result: &mut SyncResult, plan: &MigrationPlan) {
    if plan.strategy == SyncStrategy::Additive {
        let skipped: Vec<Value> = plan
            .deferred
            .iter()
            .map(|d| Value::String(d.description.clone()))
            .collect();
        result.metadata.insert("skipped_changes".to_string(), Value::Array(skipped));
    }
}
