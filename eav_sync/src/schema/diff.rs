//! Schema difference calculator
//!
//! Compares a desired and an actual schema (plus the attribute catalogue) and produces a typed,
//! ordered list of differences with severities, and the risk model over that list.

use std::collections::HashSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::entity::types::EntityType;
use crate::schema::types::{Column, DatabaseSchema, Table};
use crate::storage::metadata::AttributeMetadata;
use crate::sync::options::SyncStrategy;
use crate::utils::naming::ATTRIBUTE_TABLE;

/// Kind of a single difference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DifferenceType {
    MissingTable,
    ExtraTable,
    MissingColumn,
    TypeMismatch,
    ExtraColumn,
    MissingIndex,
    IndexMismatch,
    ExtraIndex,
    MissingAttribute,
    AttributeTypeMismatch,
    ExtraAttribute,
}

impl DifferenceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DifferenceType::MissingTable => "missing_table",
            DifferenceType::ExtraTable => "extra_table",
            DifferenceType::MissingColumn => "missing_column",
            DifferenceType::TypeMismatch => "type_mismatch",
            DifferenceType::ExtraColumn => "extra_column",
            DifferenceType::MissingIndex => "missing_index",
            DifferenceType::IndexMismatch => "index_mismatch",
            DifferenceType::ExtraIndex => "extra_index",
            DifferenceType::MissingAttribute => "missing_attribute",
            DifferenceType::AttributeTypeMismatch => "attribute_type_mismatch",
            DifferenceType::ExtraAttribute => "extra_attribute",
        }
    }
}

impl fmt::Display for DifferenceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Severity {
    /// Contribution of one difference to the risk score
    pub fn weight(&self) -> u32 {
        match self {
            Severity::Info => 2,
            Severity::Warning => 10,
            Severity::Critical => 25,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Add,
    Modify,
    Remove,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Add => "add",
            Action::Modify => "modify",
            Action::Remove => "remove",
        }
    }
}

/// One structural difference between configuration and database
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaDifference {
    pub entity_type_code: String,
    #[serde(rename = "type")]
    pub difference_type: DifferenceType,
    pub severity: Severity,
    pub action: Action,
    pub table: String,
    pub column: Option<String>,
    pub index: Option<String>,
    pub attribute: Option<String>,
    pub expected: Option<String>,
    pub actual: Option<String>,
    pub description: String,
}

impl SchemaDifference {
    fn new(
        entity_type_code: &str,
        difference_type: DifferenceType,
        severity: Severity,
        action: Action,
        table: &str,
        description: String,
    ) -> Self {
        Self {
            entity_type_code: entity_type_code.to_string(),
            difference_type,
            severity,
            action,
            table: table.to_string(),
            column: None,
            index: None,
            attribute: None,
            expected: None,
            actual: None,
            description,
        }
    }

    fn column(mut self, column: &str) -> Self {
        self.column = Some(column.to_string());
        self
    }

    fn index(mut self, index: &str) -> Self {
        self.index = Some(index.to_string());
        self
    }

    fn attribute(mut self, attribute: &str) -> Self {
        self.attribute = Some(attribute.to_string());
        self
    }

    fn values(mut self, expected: Option<String>, actual: Option<String>) -> Self {
        self.expected = expected;
        self.actual = actual;
        self
    }

    pub fn is_destructive(&self) -> bool {
        self.action == Action::Remove
    }

    /// Critical and destructive differences are covered by a pre-sync backup
    pub fn requires_backup(&self) -> bool {
        self.severity == Severity::Critical || self.is_destructive()
    }
}

/// Severity of `extra_*` differences: informational when they will never be applied,
/// a warning when the strategy will remove them.
pub fn removal_severity(strategy: SyncStrategy) -> Severity {
    match strategy {
        SyncStrategy::Additive => Severity::Info,
        SyncStrategy::Full => Severity::Warning,
    }
}

/// Compare tables, columns and indexes.
///
/// Differences follow the desired table order, then tables found only in `actual`.
pub fn diff_schemas(
    entity_type_code: &str,
    desired: &DatabaseSchema,
    actual: &DatabaseSchema,
    strategy: SyncStrategy,
) -> Vec<SchemaDifference> {
    let mut differences = Vec::new();
    let removal = removal_severity(strategy);

    for (name, desired_table) in &desired.tables {
        match actual.table(name) {
            None => differences.push(SchemaDifference::new(
                entity_type_code,
                DifferenceType::MissingTable,
                Severity::Critical,
                Action::Add,
                name,
                format!("Table '{}' does not exist", name),
            )),
            Some(actual_table) => {
                diff_table(entity_type_code, desired_table, actual_table, removal, &mut differences)
            }
        }
    }

    for name in actual.tables.keys() {
        if !desired.has_table(name) {
            differences.push(SchemaDifference::new(
                entity_type_code,
                DifferenceType::ExtraTable,
                removal,
                Action::Remove,
                name,
                format!("Table '{}' is not declared by the configuration", name),
            ));
        }
    }

    differences
}

fn diff_table(
    code: &str,
    desired: &Table,
    actual: &Table,
    removal: Severity,
    differences: &mut Vec<SchemaDifference>,
) {
    let table = desired.name.as_str();

    for column in &desired.columns {
        match actual.column(&column.name) {
            None => differences.push(
                SchemaDifference::new(
                    code,
                    DifferenceType::MissingColumn,
                    Severity::Critical,
                    Action::Add,
                    table,
                    format!("Column '{}.{}' does not exist", table, column.name),
                )
                .column(&column.name)
                .values(Some(column.data_type.clone()), None),
            ),
            Some(actual_column) if !column.same_type(actual_column) => differences.push(
                type_mismatch(code, table, column, actual_column),
            ),
            Some(_) => {}
        }
    }

    for column in &actual.columns {
        if desired.column(&column.name).is_none() {
            differences.push(
                SchemaDifference::new(
                    code,
                    DifferenceType::ExtraColumn,
                    removal,
                    Action::Remove,
                    table,
                    format!("Column '{}.{}' is not declared by the configuration", table, column.name),
                )
                .column(&column.name)
                .values(None, Some(column.data_type.clone())),
            );
        }
    }

    for index in &desired.indexes {
        match actual.index(&index.name) {
            None => differences.push(
                SchemaDifference::new(
                    code,
                    DifferenceType::MissingIndex,
                    Severity::Warning,
                    Action::Add,
                    table,
                    format!("Index '{}' on '{}' does not exist", index.name, table),
                )
                .index(&index.name)
                .values(Some(describe_index(&index.columns, index.is_unique)), None),
            ),
            Some(actual_index) if !index.same_definition(actual_index) => differences.push(
                SchemaDifference::new(
                    code,
                    DifferenceType::IndexMismatch,
                    Severity::Warning,
                    Action::Modify,
                    table,
                    format!("Index '{}' on '{}' has a different definition", index.name, table),
                )
                .index(&index.name)
                .values(
                    Some(describe_index(&index.columns, index.is_unique)),
                    Some(describe_index(&actual_index.columns, actual_index.is_unique)),
                ),
            ),
            Some(_) => {}
        }
    }

    for index in &actual.indexes {
        if desired.index(&index.name).is_none() {
            differences.push(
                SchemaDifference::new(
                    code,
                    DifferenceType::ExtraIndex,
                    removal,
                    Action::Remove,
                    table,
                    format!("Index '{}' on '{}' is not declared by the configuration", index.name, table),
                )
                .index(&index.name)
                .values(None, Some(describe_index(&index.columns, index.is_unique))),
            );
        }
    }
}

fn type_mismatch(code: &str, table: &str, desired: &Column, actual: &Column) -> SchemaDifference {
    SchemaDifference::new(
        code,
        DifferenceType::TypeMismatch,
        Severity::Warning,
        Action::Modify,
        table,
        format!(
            "Column '{}.{}' is {} but should be {}",
            table, desired.name, actual.data_type, desired.data_type
        ),
    )
    .column(&desired.name)
    .values(Some(desired.data_type.clone()), Some(actual.data_type.clone()))
}

fn describe_index(columns: &[String], is_unique: bool) -> String {
    format!(
        "{}({})",
        if is_unique { "unique " } else { "" },
        columns.join(", ")
    )
}

/// Compare configured attributes with the attribute catalogue (EAV mode only)
pub fn diff_attributes(
    entity_type: &EntityType,
    registered: &[AttributeMetadata],
    strategy: SyncStrategy,
) -> Vec<SchemaDifference> {
    if entity_type.is_flat() {
        return Vec::new();
    }

    let code = entity_type.code.as_str();
    let mut differences = Vec::new();

    for attribute in entity_type.attributes() {
        match registered.iter().find(|m| m.attribute_code == attribute.code) {
            None => differences.push(
                SchemaDifference::new(
                    code,
                    DifferenceType::MissingAttribute,
                    Severity::Warning,
                    Action::Add,
                    ATTRIBUTE_TABLE,
                    format!("Attribute '{}' is not registered", attribute.code),
                )
                .attribute(&attribute.code)
                .values(Some(attribute.backend_type.to_string()), None),
            ),
            Some(metadata) if metadata.backend_type != attribute.backend_type => differences.push(
                SchemaDifference::new(
                    code,
                    DifferenceType::AttributeTypeMismatch,
                    Severity::Critical,
                    Action::Modify,
                    ATTRIBUTE_TABLE,
                    format!(
                        "Attribute '{}' is stored as {} but configured as {}; its values must be migrated",
                        attribute.code, metadata.backend_type, attribute.backend_type
                    ),
                )
                .attribute(&attribute.code)
                .values(
                    Some(attribute.backend_type.to_string()),
                    Some(metadata.backend_type.to_string()),
                ),
            ),
            Some(_) => {}
        }
    }

    let configured: HashSet<&str> = entity_type
        .attributes()
        .iter()
        .map(|attribute| attribute.code.as_str())
        .collect();
    for metadata in registered {
        if !configured.contains(metadata.attribute_code.as_str()) {
            differences.push(
                SchemaDifference::new(
                    code,
                    DifferenceType::ExtraAttribute,
                    removal_severity(strategy),
                    Action::Remove,
                    ATTRIBUTE_TABLE,
                    format!(
                        "Attribute '{}' is registered but no longer configured",
                        metadata.attribute_code
                    ),
                )
                .attribute(&metadata.attribute_code)
                .values(None, Some(metadata.backend_type.to_string())),
            );
        }
    }

    differences
}

/// Sum of severity weights, capped at 100
pub fn risk_score(differences: &[SchemaDifference]) -> u8 {
    let total: u32 = differences.iter().map(|d| d.severity.weight()).sum();
    total.min(100) as u8
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Safe,
    Low,
    Medium,
    High,
    Dangerous,
}

impl RiskLevel {
    pub fn from_score(score: u8) -> Self {
        match score {
            0..=20 => RiskLevel::Safe,
            21..=40 => RiskLevel::Low,
            41..=70 => RiskLevel::Medium,
            71..=90 => RiskLevel::High,
            _ => RiskLevel::Dangerous,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Safe => "safe",
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
            RiskLevel::Dangerous => "dangerous",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportStatus {
    InSync,
    NeedsAttention,
    Critical,
}

impl ReportStatus {
    pub fn evaluate(differences: &[SchemaDifference], score: u8) -> Self {
        if differences.is_empty() {
            ReportStatus::InSync
        } else if score <= 70 {
            ReportStatus::NeedsAttention
        } else {
            ReportStatus::Critical
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ReportStatus::InSync => "in_sync",
            ReportStatus::NeedsAttention => "needs_attention",
            ReportStatus::Critical => "critical",
        }
    }
}

/// Result of one analysis run; read-only once built
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaAnalysisReport {
    pub entity_type_code: String,
    pub strategy: SyncStrategy,
    pub differences: Vec<SchemaDifference>,
    pub risk_score: u8,
    pub risk_level: RiskLevel,
    pub status: ReportStatus,
    pub recommendations: Vec<String>,
    pub analyzed_at: DateTime<Utc>,
}

impl SchemaAnalysisReport {
    /// Score, level and status are derived from `differences`
    pub fn new(
        entity_type_code: &str,
        strategy: SyncStrategy,
        differences: Vec<SchemaDifference>,
        recommendations: Vec<String>,
        analyzed_at: DateTime<Utc>,
    ) -> Self {
        let risk_score = risk_score(&differences);
        Self {
            entity_type_code: entity_type_code.to_string(),
            strategy,
            status: ReportStatus::evaluate(&differences, risk_score),
            risk_level: RiskLevel::from_score(risk_score),
            risk_score,
            differences,
            recommendations,
            analyzed_at,
        }
    }

    pub fn is_in_sync(&self) -> bool {
        self.differences.is_empty()
    }

    pub fn has_critical(&self) -> bool {
        self.differences
            .iter()
            .any(|d| d.severity == Severity::Critical)
    }

    pub fn has_destructive(&self) -> bool {
        self.differences.iter().any(SchemaDifference::is_destructive)
    }

    pub fn requires_backup(&self) -> bool {
        self.differences.iter().any(SchemaDifference::requires_backup)
    }

    pub fn count(&self, difference_type: DifferenceType) -> usize {
        self.differences
            .iter()
            .filter(|d| d.difference_type == difference_type)
            .count()
    }
}

impl fmt::Display for SchemaAnalysisReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Entity type:  {}", self.entity_type_code)?;
        writeln!(f, "Strategy:     {}", self.strategy)?;
        writeln!(f, "Status:       {}", self.status.as_str())?;
        writeln!(
            f,
            "Risk:         {} ({})",
            self.risk_score,
            self.risk_level.as_str()
        )?;
        writeln!(f, "Analyzed at:  {}", self.analyzed_at.to_rfc3339())?;

        if self.differences.is_empty() {
            writeln!(f, "Differences:  none")?;
        } else {
            writeln!(f, "Differences:")?;
            for difference in &self.differences {
                writeln!(
                    f,
                    "  - [{}/{}] {}: {}",
                    difference.severity.as_str(),
                    difference.action.as_str(),
                    difference.difference_type,
                    difference.description
                )?;
            }
        }

        if !self.recommendations.is_empty() {
            writeln!(f, "Recommendations:")?;
            for recommendation in &self.recommendations {
                writeln!(f, "  - {}", recommendation)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::types::{Attribute, BackendType, StorageMode};
    use crate::schema::types::Index;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    fn table(name: &str, columns: &[(&str, &str)]) -> Table {
        let mut table = Table::new(name);
        for (column, data_type) in columns {
            table.add_column(Column::new(column, data_type));
        }
        table
    }

    fn schema(tables: Vec<Table>) -> DatabaseSchema {
        let mut schema = DatabaseSchema::new(None);
        for table in tables {
            schema.add_table(table);
        }
        schema
    }

    fn difference(severity: Severity) -> SchemaDifference {
        SchemaDifference::new(
            "customer",
            DifferenceType::MissingColumn,
            severity,
            Action::Add,
            "customer_entity",
            String::new(),
        )
    }

    #[rstest]
    #[case(0, RiskLevel::Safe)]
    #[case(20, RiskLevel::Safe)]
    #[case(21, RiskLevel::Low)]
    #[case(40, RiskLevel::Low)]
    #[case(41, RiskLevel::Medium)]
    #[case(70, RiskLevel::Medium)]
    #[case(71, RiskLevel::High)]
    #[case(90, RiskLevel::High)]
    #[case(91, RiskLevel::Dangerous)]
    #[case(100, RiskLevel::Dangerous)]
    fn risk_levels_are_boundary_exact(#[case] score: u8, #[case] level: RiskLevel) {
        assert_eq!(RiskLevel::from_score(score), level);
    }

    #[test]
    fn risk_score_weights_severities_and_caps() {
        let mixed = vec![
            difference(Severity::Critical),
            difference(Severity::Warning),
            difference(Severity::Info),
        ];
        assert_eq!(risk_score(&mixed), 37);

        let many = vec![difference(Severity::Critical); 5];
        assert_eq!(risk_score(&many), 100);
        assert_eq!(risk_score(&[]), 0);
    }

    #[test]
    fn status_follows_score() {
        assert_eq!(ReportStatus::evaluate(&[], 0), ReportStatus::InSync);
        let one = vec![difference(Severity::Info)];
        assert_eq!(ReportStatus::evaluate(&one, 70), ReportStatus::NeedsAttention);
        assert_eq!(ReportStatus::evaluate(&one, 71), ReportStatus::Critical);
    }

    #[test]
    fn columns_are_compared_after_canonicalization() {
        let desired = schema(vec![table(
            "customer_entity",
            &[("id", "bigint"), ("email", "varchar(255)"), ("is_verified", "bigint")],
        )]);
        let actual = schema(vec![table(
            "customer_entity",
            &[("id", "INTEGER"), ("email", "character varying(255)"), ("legacy", "text")],
        )]);

        let differences = diff_schemas("customer", &desired, &actual, SyncStrategy::Additive);
        let kinds: Vec<_> = differences
            .iter()
            .map(|d| (d.difference_type, d.severity, d.action))
            .collect();

        assert_eq!(
            kinds,
            vec![
                (DifferenceType::MissingColumn, Severity::Critical, Action::Add),
                (DifferenceType::ExtraColumn, Severity::Info, Action::Remove),
            ]
        );
        assert_eq!(differences[0].column.as_deref(), Some("is_verified"));
    }

    #[test]
    fn removals_are_warnings_under_full_strategy() {
        let desired = schema(vec![table("customer_entity", &[("id", "bigint")])]);
        let mut extra = table("customer_entity_archive", &[("id", "bigint")]);
        extra.add_index(Index::new("ix_customer_entity_archive_id", &["id"]));
        let actual = schema(vec![extra]);

        let differences = diff_schemas("customer", &desired, &actual, SyncStrategy::Full);

        assert_eq!(differences[0].difference_type, DifferenceType::MissingTable);
        assert_eq!(differences[1].difference_type, DifferenceType::ExtraTable);
        assert_eq!(differences[1].severity, Severity::Warning);
        assert!(differences.iter().all(|d| !d.is_destructive() || d.severity >= Severity::Warning));
    }

    #[test]
    fn index_definitions_are_compared() {
        let mut desired = table("customer_entity", &[("email", "varchar(255)")]);
        desired.add_index(Index::unique("uq_customer_entity_email", &["email"]));
        let mut actual = desired.clone();
        actual.indexes = vec![Index::new("uq_customer_entity_email", &["email"])];

        let differences =
            diff_schemas("customer", &schema(vec![desired]), &schema(vec![actual]), SyncStrategy::Additive);

        assert_eq!(differences.len(), 1);
        assert_eq!(differences[0].difference_type, DifferenceType::IndexMismatch);
        assert_eq!(differences[0].actual.as_deref(), Some("(email)"));
    }

    #[test]
    fn attribute_catalogue_drift_is_reported() {
        let entity_type = EntityType::new(
            "customer",
            "Customer",
            "customer_entity",
            StorageMode::Eav,
            vec![
                Attribute::new("email", BackendType::Varchar),
                Attribute::new("age", BackendType::Int),
                Attribute::new("bio", BackendType::Text),
            ],
        );
        let registered = |id: i64, code: &str, backend_type: BackendType| AttributeMetadata {
            id,
            entity_type_code: "customer".to_string(),
            attribute_code: code.to_string(),
            backend_type,
            label: code.to_string(),
        };
        let catalogue = vec![
            registered(1, "email", BackendType::Varchar),
            registered(2, "age", BackendType::Varchar),
            registered(3, "nickname", BackendType::Varchar),
        ];

        let differences = diff_attributes(&entity_type, &catalogue, SyncStrategy::Additive);
        let kinds: Vec<_> = differences
            .iter()
            .map(|d| (d.difference_type, d.attribute.clone().unwrap()))
            .collect();

        assert_eq!(
            kinds,
            vec![
                (DifferenceType::AttributeTypeMismatch, "age".to_string()),
                (DifferenceType::MissingAttribute, "bio".to_string()),
                (DifferenceType::ExtraAttribute, "nickname".to_string()),
            ]
        );
        assert_eq!(differences[0].severity, Severity::Critical);
    }
}
