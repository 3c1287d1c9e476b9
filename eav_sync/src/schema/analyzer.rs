//! Schema analyzer
//!
//! Compares the desired schema of an entity type with the live database. Inspection is the
//! expensive part, so the inspected snapshot is cached; the report itself is always derived
//! from the snapshot, which makes two analyses without intervening change identical.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cache::{CacheDriver, CacheKind};
use crate::config::Config;
use crate::db::connection::DatabaseConnection;
use crate::entity::types::EntityType;
use crate::error::{Error, Result};
use crate::schema::builder::StructureBuilder;
use crate::schema::diff::{
    diff_attributes, diff_schemas, Action, DifferenceType, RiskLevel, SchemaAnalysisReport,
    SchemaDifference, Severity,
};
use crate::schema::inspector::SchemaInspector;
use crate::schema::types::DatabaseSchema;
use crate::storage::metadata::{AttributeMetadata, AttributeMetadataManager};
use crate::sync::options::{SyncOptions, SyncStrategy};
use crate::utils::naming::{is_engine_table, is_owned_table, shared_table_names, ATTRIBUTE_TABLE};

/// Inputs of one analysis: the desired schema, the relevant part of the live schema and the
/// registered attributes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaSnapshot {
    pub desired: DatabaseSchema,
    pub actual: DatabaseSchema,
    pub attributes: Vec<AttributeMetadata>,
    pub inspected_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnalysisOptions {
    pub strategy: SyncStrategy,
    pub auto_backup: bool,
}

impl Default for AnalysisOptions {
    fn default() -> Self {
        Self {
            strategy: SyncStrategy::Additive,
            auto_backup: true,
        }
    }
}

impl From<&SyncOptions> for AnalysisOptions {
    fn from(options: &SyncOptions) -> Self {
        Self {
            strategy: options.strategy,
            auto_backup: options.auto_backup,
        }
    }
}

/// A report together with everything the migration generator needs to act on it
#[derive(Debug, Clone)]
pub struct SchemaAnalysis {
    pub entity_type: EntityType,
    pub snapshot: SchemaSnapshot,
    pub report: SchemaAnalysisReport,
}

pub struct SchemaAnalyzer {
    inspector: SchemaInspector,
    builder: StructureBuilder,
    metadata: AttributeMetadataManager,
    cache: Arc<CacheDriver>,
    history_table: String,
}

impl SchemaAnalyzer {
    pub fn new(connection: DatabaseConnection, config: &Config, cache: Arc<CacheDriver>) -> Self {
        Self {
            inspector: SchemaInspector::new(connection.clone(), config.database.schema.clone()),
            builder: StructureBuilder::new(&config.storage),
            metadata: AttributeMetadataManager::new(connection),
            cache,
            history_table: config.sync.history_table.clone(),
        }
    }

    pub fn builder(&self) -> &StructureBuilder {
        &self.builder
    }

    /// Analyze an entity type, reusing a cached snapshot when one is live
    pub async fn analyze(&self, entity_type: &EntityType, options: &AnalysisOptions) -> Result<SchemaAnalysis> {
        let snapshot = match self
            .cache
            .get_kind::<SchemaSnapshot>(&entity_type.code, CacheKind::SchemaAnalysis)
        {
            Some(snapshot) => {
                tracing::debug!(entity_type = %entity_type.code, "Using cached schema snapshot");
                snapshot
            }
            None => {
                let snapshot = self.snapshot(entity_type).await?;
                self.cache
                    .put_kind(&entity_type.code, CacheKind::SchemaAnalysis, &snapshot);
                snapshot
            }
        };

        Ok(self.analysis(entity_type, snapshot, options))
    }

    /// Analyze against a fresh inspection, replacing any cached snapshot
    pub async fn refresh(&self, entity_type: &EntityType, options: &AnalysisOptions) -> Result<SchemaAnalysis> {
        self.invalidate(&entity_type.code);
        self.analyze(entity_type, options).await
    }

    pub fn invalidate(&self, entity_type_code: &str) {
        self.cache
            .forget_kind(entity_type_code, CacheKind::SchemaAnalysis);
    }

    /// Inspect the database and collect the tables relevant to `entity_type`
    pub async fn snapshot(&self, entity_type: &EntityType) -> Result<SchemaSnapshot> {
        let desired = self.builder.build(entity_type);
        let inspected = self.inspector.inspect().await.map_err(|e| {
            Error::SchemaAnalysisError(format!(
                "Failed to inspect database for '{}': {}",
                entity_type.code, e
            ))
        })?;

        let shared = shared_table_names();
        let actual = inspected.filtered(|name| {
            !is_engine_table(name, &self.history_table)
                && (shared.iter().any(|s| s == name) || is_owned_table(&entity_type.entity_table, name))
        });

        let attributes = if actual.has_table(ATTRIBUTE_TABLE) {
            self.metadata.list_for_entity_type(&entity_type.code).await?
        } else {
            Vec::new()
        };

        Ok(SchemaSnapshot {
            desired,
            actual,
            attributes,
            inspected_at: Utc::now(),
        })
    }

    fn analysis(&self, entity_type: &EntityType, snapshot: SchemaSnapshot, options: &AnalysisOptions) -> SchemaAnalysis {
        let report = Self::compare(entity_type, &snapshot, options);

        tracing::info!(
            entity_type = %entity_type.code,
            differences = report.differences.len(),
            risk_score = report.risk_score,
            status = report.status.as_str(),
            "Schema analyzed"
        );

        SchemaAnalysis {
            entity_type: entity_type.clone(),
            snapshot,
            report,
        }
    }

    /// Build the report for a snapshot; pure and deterministic
    pub fn compare(entity_type: &EntityType, snapshot: &SchemaSnapshot, options: &AnalysisOptions) -> SchemaAnalysisReport {
        let mut differences = diff_schemas(
            &entity_type.code,
            &snapshot.desired,
            &snapshot.actual,
            options.strategy,
        );

        differences.extend(diff_attributes(
            entity_type,
            &snapshot.attributes,
            options.strategy,
        ));

        let recommendations = recommend(&differences, options);
        SchemaAnalysisReport::new(
            &entity_type.code,
            options.strategy,
            differences,
            recommendations,
            snapshot.inspected_at,
        )
    }
}

fn recommend(differences: &[SchemaDifference], options: &AnalysisOptions) -> Vec<String> {
    let mut recommendations = Vec::new();

    if differences.is_empty() {
        recommendations.push("Schema is in sync; no action required".to_string());
        return recommendations;
    }

    if differences.iter().any(|d| d.severity == Severity::Critical) && !options.auto_backup {
        recommendations
            .push("Critical differences found: create a backup before syncing".to_string());
    }

    let skipped = differences
        .iter()
        .filter(|d| !options.strategy.applies(d.action))
        .count();
    if skipped > 0 {
        recommendations.push(format!(
            "{} change(s) require the full strategy and will be skipped",
            skipped
        ));
    }

    let extra_tables: Vec<&str> = differences
        .iter()
        .filter(|d| d.difference_type == DifferenceType::ExtraTable)
        .map(|d| d.table.as_str())
        .collect();
    if !extra_tables.is_empty() {
        recommendations.push(format!(
            "Review table(s) {} before a full sync; dropping them deletes their data",
            extra_tables.join(", ")
        ));
    }

    let type_changes: Vec<String> = differences
        .iter()
        .filter(|d| d.difference_type == DifferenceType::TypeMismatch)
        .filter_map(|d| d.column.as_ref().map(|c| format!("{}.{}", d.table, c)))
        .collect();
    if !type_changes.is_empty() {
        recommendations.push(format!(
            "Verify existing data of {} before changing column types",
            type_changes.join(", ")
        ));
    }

    let migrations: Vec<&str> = differences
        .iter()
        .filter(|d| d.difference_type == DifferenceType::AttributeTypeMismatch)
        .filter_map(|d| d.attribute.as_deref())
        .collect();
    if !migrations.is_empty() {
        recommendations.push(format!(
            "Values of attribute(s) {} must be migrated to a new backend type",
            migrations.join(", ")
        ));
    }

    let destructive = differences.iter().any(|d| d.action == Action::Remove);
    if destructive && options.strategy == SyncStrategy::Full {
        recommendations.push("Destructive changes detected: run with --force to apply them".to_string());
    }

    let score = crate::schema::diff::risk_score(differences);
    if RiskLevel::from_score(score) >= RiskLevel::High {
        recommendations.push(format!(
            "Risk level is {}: review the plan with --dry-run first",
            RiskLevel::from_score(score).as_str()
        ));
    }

    recommendations
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageConfig;
    use crate::entity::types::{Attribute, BackendType, StorageMode};
    use crate::schema::diff::ReportStatus;
    use crate::schema::types::Column;
    use pretty_assertions::assert_eq;

    fn customer() -> EntityType {
        EntityType::new(
            "customer",
            "Customer",
            "customer_entity",
            StorageMode::Flat,
            vec![
                Attribute::new("email", BackendType::Varchar),
                Attribute::new("is_verified", BackendType::Int),
            ],
        )
    }

    fn in_sync_snapshot(entity_type: &EntityType) -> SchemaSnapshot {
        let desired = StructureBuilder::new(&StorageConfig::default()).build(entity_type);
        SchemaSnapshot {
            actual: desired.clone(),
            desired,
            attributes: Vec::new(),
            inspected_at: Utc::now(),
        }
    }

    #[test]
    fn matching_schema_is_in_sync() {
        let entity_type = customer();
        let snapshot = in_sync_snapshot(&entity_type);

        let first = SchemaAnalyzer::compare(&entity_type, &snapshot, &AnalysisOptions::default());
        let second = SchemaAnalyzer::compare(&entity_type, &snapshot, &AnalysisOptions::default());

        assert_eq!(first.status, ReportStatus::InSync);
        assert_eq!(first.risk_score, 0);
        assert!(first.differences.is_empty());
        assert_eq!(first, second);
    }

    #[test]
    fn missing_column_is_a_single_critical_difference() {
        let entity_type = customer();
        let mut snapshot = in_sync_snapshot(&entity_type);
        let table = snapshot.actual.tables.get_mut("customer_entity").unwrap();
        table.columns.retain(|column| column.name != "is_verified");

        let report = SchemaAnalyzer::compare(&entity_type, &snapshot, &AnalysisOptions::default());

        assert_eq!(report.differences.len(), 1);
        assert_eq!(report.differences[0].difference_type, DifferenceType::MissingColumn);
        assert_eq!(report.differences[0].severity, Severity::Critical);
        assert!(report.risk_score >= 25);
    }

    #[test]
    fn critical_changes_without_backup_are_flagged() {
        let entity_type = customer();
        let mut snapshot = in_sync_snapshot(&entity_type);
        snapshot.actual.tables.shift_remove("customer_entity");
        snapshot
            .actual
            .tables
            .get_mut("eav_values_int")
            .unwrap()
            .add_column(Column::new("legacy", "text").nullable(true));

        let options = AnalysisOptions {
            strategy: SyncStrategy::Additive,
            auto_backup: false,
        };
        let report = SchemaAnalyzer::compare(&entity_type, &snapshot, &options);

        assert_eq!(
            report.recommendations[0],
            "Critical differences found: create a backup before syncing"
        );
        assert_eq!(
            report.recommendations[1],
            "1 change(s) require the full strategy and will be skipped"
        );
    }
}
