//! Schema module
//!
//! This module inspects the live database, derives the desired schema of an entity type,
//! compares the two and generates the migration steps that reconcile them.

pub mod analyzer;
pub mod builder;
pub mod diff;
pub mod generator;
pub mod inspector;
pub mod types;

// Re-export key types
pub use analyzer::{AnalysisOptions, SchemaAnalysis, SchemaAnalyzer, SchemaSnapshot};
pub use builder::StructureBuilder;
pub use diff::{
    Action, DifferenceType, ReportStatus, RiskLevel, SchemaAnalysisReport, SchemaDifference,
    Severity,
};
pub use generator::{MigrationGenerator, MigrationPlan, MigrationStep, StepPhase};
pub use inspector::SchemaInspector;
pub use types::{Column, DatabaseSchema, Index, PrimaryKey, Table};
