//! Migration generator
//!
//! Turns the differences of an analysis into ordered, individually reversible migration steps.
//! Each step is executed in its own transaction and carries the statements that undo it.

use serde::{Deserialize, Serialize};

use crate::config::StorageConfig;
use crate::db::connection::Dialect;
use crate::entity::types::BackendType;
use crate::error::{Error, Result};
use crate::schema::analyzer::SchemaAnalysis;
use crate::schema::diff::{DifferenceType, SchemaDifference};
use crate::schema::types::{Column, Index, Table};
use crate::sync::options::SyncStrategy;
use crate::utils::naming::{value_table_name, ATTRIBUTE_TABLE};

/// Execution phase of a step; steps run in phase order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepPhase {
    CreateTable,
    AddColumn,
    AddIndex,
    RegisterAttribute,
    ModifyColumn,
    ModifyIndex,
    MigrateAttribute,
    DropIndex,
    DropColumn,
    RemoveAttribute,
    DropTable,
}

impl StepPhase {
    pub fn is_destructive(&self) -> bool {
        matches!(
            self,
            StepPhase::DropIndex | StepPhase::DropColumn | StepPhase::RemoveAttribute | StepPhase::DropTable
        )
    }
}

/// One unit of migration work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationStep {
    pub phase: StepPhase,
    pub table: String,
    pub description: String,
    pub statements: Vec<String>,
    pub rollback: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guard: Option<StepGuard>,
}

/// Check run inside a step's transaction before its statements
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepGuard {
    /// Counts the rows the step would not carry over intact; anything above 0 fails the step
    pub sql: String,
    pub message: String,
}

/// Ordered steps plus the differences the strategy does not allow to apply
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationPlan {
    pub entity_type_code: String,
    pub strategy: SyncStrategy,
    pub steps: Vec<MigrationStep>,
    pub deferred: Vec<SchemaDifference>,
}

impl MigrationPlan {
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn descriptions(&self) -> Vec<String> {
        self.steps.iter().map(|step| step.description.clone()).collect()
    }

    pub fn has_destructive_steps(&self) -> bool {
        self.steps.iter().any(|step| step.phase.is_destructive())
    }
}

/// Migration SQL generator
#[derive(Debug, Clone)]
pub struct MigrationGenerator {
    dialect: Dialect,
    varchar_length: usize,
}

impl MigrationGenerator {
    /// Create a new migration generator
    pub fn new(dialect: Dialect, config: &StorageConfig) -> Self {
        Self {
            dialect,
            varchar_length: config.varchar_max_length,
        }
    }

    /// Plan the steps for an analysis under `strategy`
    pub fn generate(&self, analysis: &SchemaAnalysis, strategy: SyncStrategy) -> Result<MigrationPlan> {
        let mut steps = Vec::new();
        let mut deferred = Vec::new();

        for difference in &analysis.report.differences {
            if !strategy.applies(difference.action) {
                deferred.push(difference.clone());
                continue;
            }
            steps.push(self.step_for(analysis, difference)?);
        }

        // Stable: differences of the same phase keep the analyzer's order
        steps.sort_by_key(|step| step.phase);

        tracing::debug!(
            entity_type = %analysis.entity_type.code,
            steps = steps.len(),
            deferred = deferred.len(),
            "Migration plan generated"
        );

        Ok(MigrationPlan {
            entity_type_code: analysis.entity_type.code.clone(),
            strategy,
            steps,
            deferred,
        })
    }

    fn step_for(&self, analysis: &SchemaAnalysis, difference: &SchemaDifference) -> Result<MigrationStep> {
        let desired = &analysis.snapshot.desired;
        let actual = &analysis.snapshot.actual;
        let table_name = difference.table.as_str();

        let step = match difference.difference_type {
            DifferenceType::MissingTable => {
                let table = find_table(desired.table(table_name), table_name)?;
                MigrationStep {
                    phase: StepPhase::CreateTable,
                    guard: None,
                    table: table_name.to_string(),
                    description: format!("Create table {}", table_name),
                    statements: self.create_table_statements(table),
                    rollback: vec![self.drop_table_sql(table_name)],
                }
            }
            DifferenceType::MissingColumn => {
                let table = find_table(desired.table(table_name), table_name)?;
                let column = find_column(table, difference.column.as_deref())?;
                MigrationStep {
                    phase: StepPhase::AddColumn,
                    guard: None,
                    table: table_name.to_string(),
                    description: format!(
                        "Add column {}.{} ({})",
                        table_name, column.name, column.data_type
                    ),
                    statements: self.add_column_statements(table_name, column)?,
                    rollback: vec![self.drop_column_sql(table_name, &column.name)],
                }
            }
            DifferenceType::MissingIndex => {
                let table = find_table(desired.table(table_name), table_name)?;
                let index = find_index(table, difference.index.as_deref())?;
                MigrationStep {
                    phase: StepPhase::AddIndex,
                    guard: None,
                    table: table_name.to_string(),
                    description: format!("Create index {} on {}", index.name, table_name),
                    statements: vec![self.create_index_sql(table_name, index)],
                    rollback: vec![self.drop_index_sql(&index.name)],
                }
            }
            DifferenceType::MissingAttribute => {
                let code = difference.attribute.as_deref().unwrap_or_default();
                let attribute = analysis.entity_type.attribute(code).ok_or_else(|| {
                    Error::MigrationError(format!("Attribute '{}' is not configured", code))
                })?;
                MigrationStep {
                    phase: StepPhase::RegisterAttribute,
                    guard: None,
                    table: ATTRIBUTE_TABLE.to_string(),
                    description: format!(
                        "Register attribute {}.{} ({})",
                        analysis.entity_type.code, attribute.code, attribute.backend_type
                    ),
                    statements: vec![self.register_attribute_sql(
                        &analysis.entity_type.code,
                        &attribute.code,
                        attribute.backend_type,
                        &attribute.label,
                    )],
                    rollback: vec![self.unregister_attribute_sql(&analysis.entity_type.code, &attribute.code)],
                }
            }
            DifferenceType::TypeMismatch => {
                let desired_table = find_table(desired.table(table_name), table_name)?;
                let actual_table = find_table(actual.table(table_name), table_name)?;
                let target = find_column(desired_table, difference.column.as_deref())?;
                let current = find_column(actual_table, difference.column.as_deref())?;
                MigrationStep {
                    phase: StepPhase::ModifyColumn,
                    guard: None,
                    table: table_name.to_string(),
                    description: format!(
                        "Change type of {}.{} from {} to {}",
                        table_name, target.name, current.data_type, target.data_type
                    ),
                    statements: self.alter_column_type_statements(actual_table, &target.name, &target.data_type),
                    rollback: self.alter_column_type_statements(
                        &retyped(actual_table, &target.name, &target.data_type),
                        &target.name,
                        &current.data_type,
                    ),
                }
            }
            DifferenceType::IndexMismatch => {
                let desired_table = find_table(desired.table(table_name), table_name)?;
                let actual_table = find_table(actual.table(table_name), table_name)?;
                let target = find_index(desired_table, difference.index.as_deref())?;
                let current = find_index(actual_table, difference.index.as_deref())?;
                MigrationStep {
                    phase: StepPhase::ModifyIndex,
                    guard: None,
                    table: table_name.to_string(),
                    description: format!("Recreate index {} on {}", target.name, table_name),
                    statements: vec![
                        self.drop_index_sql(&current.name),
                        self.create_index_sql(table_name, target),
                    ],
                    rollback: vec![
                        self.drop_index_sql(&target.name),
                        self.create_index_sql(table_name, current),
                    ],
                }
            }
            DifferenceType::AttributeTypeMismatch => {
                let code = difference.attribute.as_deref().unwrap_or_default();
                let to = parse_backend(difference.expected.as_deref())?;
                let from = parse_backend(difference.actual.as_deref())?;
                MigrationStep {
                    phase: StepPhase::MigrateAttribute,
                    guard: self.conversion_guard(&analysis.entity_type.code, code, from, to),
                    table: ATTRIBUTE_TABLE.to_string(),
                    description: format!(
                        "Migrate values of attribute {}.{} from {} to {}",
                        analysis.entity_type.code, code, from, to
                    ),
                    statements: self.migrate_attribute_statements(&analysis.entity_type.code, code, from, to),
                    rollback: self.migrate_attribute_statements(&analysis.entity_type.code, code, to, from),
                }
            }
            DifferenceType::ExtraIndex => {
                let table = find_table(actual.table(table_name), table_name)?;
                let index = find_index(table, difference.index.as_deref())?;
                MigrationStep {
                    phase: StepPhase::DropIndex,
                    guard: None,
                    table: table_name.to_string(),
                    description: format!("Drop index {} on {}", index.name, table_name),
                    statements: vec![self.drop_index_sql(&index.name)],
                    rollback: vec![self.create_index_sql(table_name, index)],
                }
            }
            DifferenceType::ExtraColumn => {
                let table = find_table(actual.table(table_name), table_name)?;
                let column = find_column(table, difference.column.as_deref())?;
                let restored = column.clone().nullable(true);
                MigrationStep {
                    phase: StepPhase::DropColumn,
                    guard: None,
                    table: table_name.to_string(),
                    description: format!("Drop column {}.{}", table_name, column.name),
                    statements: vec![self.drop_column_sql(table_name, &column.name)],
                    rollback: self.add_column_statements(table_name, &Column { default: None, ..restored })?,
                }
            }
            DifferenceType::ExtraAttribute => {
                let code = difference.attribute.as_deref().unwrap_or_default();
                let backend_type = parse_backend(difference.actual.as_deref())?;
                let entity_type_code = &analysis.entity_type.code;
                MigrationStep {
                    phase: StepPhase::RemoveAttribute,
                    guard: None,
                    table: ATTRIBUTE_TABLE.to_string(),
                    description: format!("Remove attribute {}.{} and its values", entity_type_code, code),
                    statements: vec![
                        format!(
                            "DELETE FROM {} WHERE attribute_id = {}",
                            self.dialect.quote(&value_table_name(backend_type)),
                            self.attribute_id_sql(entity_type_code, code)
                        ),
                        self.unregister_attribute_sql(entity_type_code, code),
                    ],
                    rollback: vec![self.register_attribute_sql(entity_type_code, code, backend_type, code)],
                }
            }
            DifferenceType::ExtraTable => {
                let table = find_table(actual.table(table_name), table_name)?;
                MigrationStep {
                    phase: StepPhase::DropTable,
                    guard: None,
                    table: table_name.to_string(),
                    description: format!("Drop table {}", table_name),
                    statements: vec![self.drop_table_sql(table_name)],
                    rollback: self.create_table_statements(table),
                }
            }
        };

        Ok(step)
    }

    /// `CREATE TABLE` followed by one statement per index
    pub fn create_table_statements(&self, table: &Table) -> Vec<String> {
        let mut definitions: Vec<String> = table
            .columns
            .iter()
            .map(|column| self.column_definition(column))
            .collect();

        let inline_key = table.columns.iter().any(|column| column.auto_increment);
        if let Some(pk) = table.primary_key.as_ref().filter(|_| !inline_key) {
            let columns: Vec<String> = pk.columns.iter().map(|c| self.dialect.quote(c)).collect();
            definitions.push(format!("PRIMARY KEY ({})", columns.join(", ")));
        }

        let mut statements = vec![format!(
            "CREATE TABLE IF NOT EXISTS {} ({})",
            self.dialect.quote(&table.name),
            definitions.join(", ")
        )];
        statements.extend(
            table
                .indexes
                .iter()
                .map(|index| self.create_index_sql(&table.name, index)),
        );
        statements
    }

    fn column_definition(&self, column: &Column) -> String {
        if column.auto_increment {
            return format!(
                "{} {}",
                self.dialect.quote(&column.name),
                self.dialect.auto_increment_primary_key()
            );
        }

        let mut definition = format!(
            "{} {}",
            self.dialect.quote(&column.name),
            column.data_type.to_uppercase()
        );
        if let Some(default) = &column.default {
            definition.push_str(&format!(" DEFAULT {}", default));
        }
        if !column.nullable {
            definition.push_str(" NOT NULL");
        }
        definition
    }

    fn add_column_statements(&self, table: &str, column: &Column) -> Result<Vec<String>> {
        if column.auto_increment || (!column.nullable && column.default.is_none()) {
            return Err(Error::MigrationError(format!(
                "Column '{}.{}' is NOT NULL without a default and cannot be added to an existing table",
                table, column.name
            )));
        }

        let quoted_table = self.dialect.quote(table);
        match self.dialect {
            Dialect::Postgres => Ok(vec![format!(
                "ALTER TABLE {} ADD COLUMN IF NOT EXISTS {}",
                quoted_table,
                self.column_definition(column)
            )]),
            Dialect::Sqlite => {
                let non_constant_default = column
                    .default
                    .as_deref()
                    .map_or(false, |default| default.to_uppercase().starts_with("CURRENT_"));

                if non_constant_default {
                    // SQLite only accepts constant defaults in ADD COLUMN: add it nullable and
                    // fill existing rows instead.
                    let nullable = Column {
                        default: None,
                        ..column.clone().nullable(true)
                    };
                    Ok(vec![
                        format!(
                            "ALTER TABLE {} ADD COLUMN {}",
                            quoted_table,
                            self.column_definition(&nullable)
                        ),
                        format!(
                            "UPDATE {} SET {} = {}",
                            quoted_table,
                            self.dialect.quote(&column.name),
                            column.default.as_deref().unwrap_or("NULL")
                        ),
                    ])
                } else {
                    Ok(vec![format!(
                        "ALTER TABLE {} ADD COLUMN {}",
                        quoted_table,
                        self.column_definition(column)
                    )])
                }
            }
        }
    }

    /// Postgres alters in place; SQLite rebuilds the table around the new column type
    fn alter_column_type_statements(&self, current: &Table, column: &str, data_type: &str) -> Vec<String> {
        let sql_type = data_type.to_uppercase();
        match self.dialect {
            Dialect::Postgres => vec![format!(
                "ALTER TABLE {} ALTER COLUMN {} TYPE {} USING {}",
                self.dialect.quote(&current.name),
                self.dialect.quote(column),
                sql_type,
                self.dialect.cast(&self.dialect.quote(column), &sql_type)
            )],
            Dialect::Sqlite => {
                let mut rebuilt = retyped(current, column, data_type);
                rebuilt.name = format!("{}__rebuild", current.name);
                rebuilt.indexes.clear();

                let names: Vec<String> = current.columns.iter().map(|c| self.dialect.quote(&c.name)).collect();
                let selected: Vec<String> = current
                    .columns
                    .iter()
                    .map(|c| {
                        let quoted = self.dialect.quote(&c.name);
                        if c.name == column {
                            self.dialect.cast(&quoted, &sql_type)
                        } else {
                            quoted
                        }
                    })
                    .collect();

                let mut statements = self.create_table_statements(&rebuilt);
                statements.push(format!(
                    "INSERT INTO {} ({}) SELECT {} FROM {}",
                    self.dialect.quote(&rebuilt.name),
                    names.join(", "),
                    selected.join(", "),
                    self.dialect.quote(&current.name)
                ));
                statements.push(self.drop_table_sql(&current.name));
                statements.push(format!(
                    "ALTER TABLE {} RENAME TO {}",
                    self.dialect.quote(&rebuilt.name),
                    self.dialect.quote(&current.name)
                ));
                statements.extend(
                    current
                        .indexes
                        .iter()
                        .map(|index| self.create_index_sql(&current.name, index)),
                );
                statements
            }
        }
    }

    fn migrate_attribute_statements(
        &self,
        entity_type_code: &str,
        attribute_code: &str,
        from: BackendType,
        to: BackendType,
    ) -> Vec<String> {
        let attribute_id = self.attribute_id_sql(entity_type_code, attribute_code);
        let target_type = to.column_type(self.varchar_length).to_uppercase();

        vec![
            format!(
                "INSERT INTO {} (entity_id, attribute_id, value) \
                 SELECT entity_id, attribute_id, {} FROM {} WHERE attribute_id = {} \
                 ON CONFLICT (entity_id, attribute_id) DO UPDATE SET value = excluded.value",
                self.dialect.quote(&value_table_name(to)),
                self.dialect.cast("value", &target_type),
                self.dialect.quote(&value_table_name(from)),
                attribute_id
            ),
            format!(
                "DELETE FROM {} WHERE attribute_id = {}",
                self.dialect.quote(&value_table_name(from)),
                attribute_id
            ),
            format!(
                "UPDATE {} SET backend_type = {} WHERE entity_type_code = {} AND attribute_code = {}",
                self.dialect.quote(ATTRIBUTE_TABLE),
                self.dialect.literal(to.as_str()),
                self.dialect.literal(entity_type_code),
                self.dialect.literal(attribute_code)
            ),
        ]
    }

    /// Guard counting values of the attribute that would not survive the move from `from` to `to`.
    ///
    /// Postgres refuses malformed casts on its own; SQLite turns them into 0 or NULL, so its
    /// guard also checks that every value is well formed for the target type.
    fn conversion_guard(
        &self,
        entity_type_code: &str,
        attribute_code: &str,
        from: BackendType,
        to: BackendType,
    ) -> Option<StepGuard> {
        let number = "CAST(value AS NUMERIC)";
        let numeric_source = matches!(from, BackendType::Int | BackendType::Decimal);
        let mut lossy: Vec<String> = Vec::new();

        if self.dialect == Dialect::Sqlite && !numeric_source && matches!(to, BackendType::Int | BackendType::Decimal) {
            // Only well-formed numbers compare equal to their own numeric cast
            lossy.push(format!("value <> {}", number));
        }
        match to {
            BackendType::Text => {}
            BackendType::Varchar => {
                lossy.push(format!("LENGTH(CAST(value AS TEXT)) > {}", self.varchar_length));
            }
            BackendType::Int => lossy.push(format!("{0} <> CAST({0} AS BIGINT)", number)),
            BackendType::Decimal => {
                lossy.push(format!("ABS({}) >= 100000000000000", number));
                lossy.push(format!("{0} <> ROUND({0}, 6)", number));
            }
            BackendType::Datetime if self.dialect == Dialect::Sqlite => {
                lossy.push("typeof(value) <> 'text'".to_string());
                lossy.push("datetime(value) IS NULL".to_string());
                lossy.push("value NOT GLOB '[0-9][0-9][0-9][0-9]-[0-9][0-9]-[0-9][0-9]*'".to_string());
            }
            BackendType::Datetime => {}
        }

        if lossy.is_empty() {
            return None;
        }
        Some(StepGuard {
            sql: format!(
                "SELECT COUNT(*) FROM {} WHERE attribute_id = {} AND ({})",
                self.dialect.quote(&value_table_name(from)),
                self.attribute_id_sql(entity_type_code, attribute_code),
                lossy.join(" OR ")
            ),
            message: format!(
                "values of attribute {}.{} cannot be converted from {} to {}",
                entity_type_code, attribute_code, from, to
            ),
        })
    }

    fn register_attribute_sql(
        &self,
        entity_type_code: &str,
        attribute_code: &str,
        backend_type: BackendType,
        label: &str,
    ) -> String {
        format!(
            "INSERT INTO {} (entity_type_code, attribute_code, backend_type, label) \
             VALUES ({}, {}, {}, {}) \
             ON CONFLICT (entity_type_code, attribute_code) DO NOTHING",
            self.dialect.quote(ATTRIBUTE_TABLE),
            self.dialect.literal(entity_type_code),
            self.dialect.literal(attribute_code),
            self.dialect.literal(backend_type.as_str()),
            self.dialect.literal(label)
        )
    }

    fn unregister_attribute_sql(&self, entity_type_code: &str, attribute_code: &str) -> String {
        format!(
            "DELETE FROM {} WHERE entity_type_code = {} AND attribute_code = {}",
            self.dialect.quote(ATTRIBUTE_TABLE),
            self.dialect.literal(entity_type_code),
            self.dialect.literal(attribute_code)
        )
    }

    fn attribute_id_sql(&self, entity_type_code: &str, attribute_code: &str) -> String {
        format!(
            "(SELECT id FROM {} WHERE entity_type_code = {} AND attribute_code = {})",
            self.dialect.quote(ATTRIBUTE_TABLE),
            self.dialect.literal(entity_type_code),
            self.dialect.literal(attribute_code)
        )
    }

    pub fn create_index_sql(&self, table: &str, index: &Index) -> String {
        let columns: Vec<String> = index.columns.iter().map(|c| self.dialect.quote(c)).collect();
        format!(
            "CREATE {}INDEX IF NOT EXISTS {} ON {} ({})",
            if index.is_unique { "UNIQUE " } else { "" },
            self.dialect.quote(&index.name),
            self.dialect.quote(table),
            columns.join(", ")
        )
    }

    fn drop_index_sql(&self, name: &str) -> String {
        format!("DROP INDEX IF EXISTS {}", self.dialect.quote(name))
    }

    fn drop_column_sql(&self, table: &str, column: &str) -> String {
        match self.dialect {
            Dialect::Postgres => format!(
                "ALTER TABLE {} DROP COLUMN IF EXISTS {}",
                self.dialect.quote(table),
                self.dialect.quote(column)
            ),
            Dialect::Sqlite => format!(
                "ALTER TABLE {} DROP COLUMN {}",
                self.dialect.quote(table),
                self.dialect.quote(column)
            ),
        }
    }

    pub fn drop_table_sql(&self, table: &str) -> String {
        format!("DROP TABLE IF EXISTS {}", self.dialect.quote(table))
    }
}

fn retyped(table: &Table, column: &str, data_type: &str) -> Table {
    let mut table = table.clone();
    for c in table.columns.iter_mut().filter(|c| c.name == column) {
        c.data_type = data_type.to_string();
    }
    table
}

fn find_table<'a>(table: Option<&'a Table>, name: &str) -> Result<&'a Table> {
    table.ok_or_else(|| Error::MigrationError(format!("Table '{}' is not part of the analysis", name)))
}

fn find_column<'a>(table: &'a Table, name: Option<&str>) -> Result<&'a Column> {
    name.and_then(|name| table.column(name)).ok_or_else(|| {
        Error::MigrationError(format!(
            "Column '{}' not found on '{}'",
            name.unwrap_or_default(),
            table.name
        ))
    })
}

fn find_index<'a>(table: &'a Table, name: Option<&str>) -> Result<&'a Index> {
    name.and_then(|name| table.index(name)).ok_or_else(|| {
        Error::MigrationError(format!(
            "Index '{}' not found on '{}'",
            name.unwrap_or_default(),
            table.name
        ))
    })
}

fn parse_backend(value: Option<&str>) -> Result<BackendType> {
    value
        .and_then(BackendType::parse)
        .ok_or_else(|| Error::MigrationError(format!("Unknown backend type {:?}", value)))
}
