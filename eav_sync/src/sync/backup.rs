//! Backup manager
//!
//! Snapshots the tables implicated by an entity type before a risky sync and restores them on
//! demand. Owned tables are captured whole. Shared tables only contribute the rows of the entity
//! type being synced, and are never dropped by a restore.

use std::collections::BTreeSet;
use std::time::Instant;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::db::connection::{DatabaseConnection, Dialect, Param};
use crate::db::executor::{SqlExecutor, Statement};
use crate::entity::types::EntityType;
use crate::error::{Error, Result};
use crate::schema::generator::MigrationGenerator;
use crate::schema::inspector::SchemaInspector;
use crate::schema::types::{DatabaseSchema, Table};
use crate::sync::options::{BackupType, RestoreOptions};
use crate::sync::result::{RestoreResult, RestoreStatus, SyncError};
use crate::utils::naming::{is_owned_table, shared_table_names, ATTRIBUTE_TABLE, BACKUP_TABLE};

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

/// Captured state of one table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableSnapshot {
    pub name: String,
    pub shared: bool,
    pub existed: bool,
    pub ddl: Vec<String>,
    pub definition: Option<Table>,
    pub columns: Vec<String>,
    pub column_types: Vec<String>,
    pub rows: Vec<Vec<Option<String>>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Backup {
    pub id: i64,
    pub entity_type_code: String,
    pub backup_type: BackupType,
    pub created_at: DateTime<Utc>,
    pub tables: Vec<TableSnapshot>,
}

impl Backup {
    pub fn table(&self, name: &str) -> Option<&TableSnapshot> {
        self.tables.iter().find(|t| t.name == name)
    }

    pub fn row_count(&self) -> usize {
        self.tables.iter().map(|t| t.rows.len()).sum()
    }
}

pub struct BackupManager {
    connection: DatabaseConnection,
    inspector: SchemaInspector,
    generator: MigrationGenerator,
    executor: SqlExecutor,
}

impl BackupManager {
    pub fn new(connection: DatabaseConnection, config: &Config) -> Self {
        Self {
            inspector: SchemaInspector::new(connection.clone(), config.database.schema.clone()),
            generator: MigrationGenerator::new(connection.dialect(), &config.storage),
            executor: SqlExecutor::new(connection.clone()),
            connection,
        }
    }

    fn dialect(&self) -> Dialect {
        self.connection.dialect()
    }

    /// Snapshot every table in the union of the desired and actual schema of `entity_type`
    pub async fn backup(&self, entity_type: &EntityType, backup_type: BackupType) -> Result<Backup> {
        self.ensure_table().await?;

        let actual = self
            .inspector
            .inspect()
            .await
            .map_err(|e| Error::BackupError(format!("Failed to inspect database: {}", e)))?;

        let mut tables = Vec::new();
        for name in implicated_tables(entity_type, &actual) {
            let snapshot = self
                .snapshot_table(entity_type, &name, &actual, backup_type)
                .await
                .map_err(|e| Error::BackupError(format!("Failed to snapshot '{}': {}", name, e)))?;
            tables.push(snapshot);
        }

        let created_at = Utc::now();
        let payload = serde_json::to_string(&tables)
            .map_err(|e| Error::SerializationError(format!("Failed to encode backup: {}", e)))?;

        let dialect = self.dialect();
        let id = self
            .connection
            .fetch_i64(
                &format!(
                    "INSERT INTO {} (entity_type_code, backup_type, created_at, payload) \
                     VALUES ({}, {}, {}, {}) RETURNING id",
                    dialect.quote(BACKUP_TABLE),
                    dialect.placeholder(1),
                    dialect.placeholder(2),
                    dialect.placeholder(3),
                    dialect.placeholder(4)
                ),
                &[
                    entity_type.code.as_str().into(),
                    backup_type.as_str().into(),
                    created_at.format(TIMESTAMP_FORMAT).to_string().into(),
                    payload.into(),
                ],
            )
            .await
            .map_err(|e| Error::BackupError(format!("Failed to store backup: {}", e)))?;

        let backup = Backup {
            id,
            entity_type_code: entity_type.code.clone(),
            backup_type,
            created_at,
            tables,
        };

        tracing::info!(
            entity_type = %entity_type.code,
            backup_id = id,
            backup_type = %backup_type,
            tables = backup.tables.len(),
            rows = backup.row_count(),
            "Backup created"
        );
        Ok(backup)
    }

    /// Load a stored backup
    pub async fn get(&self, backup_id: i64) -> Result<Backup> {
        self.ensure_table().await?;

        let dialect = self.dialect();
        let rows = self
            .connection
            .fetch_text_rows(
                &format!(
                    "SELECT entity_type_code, backup_type, created_at, payload FROM {} WHERE id = {}",
                    dialect.quote(BACKUP_TABLE),
                    dialect.placeholder(1)
                ),
                &[Param::Int(backup_id)],
            )
            .await?;

        let row = rows
            .into_iter()
            .next()
            .ok_or_else(|| Error::RestoreError(format!("Backup #{} does not exist", backup_id)))?;
        let field = |i: usize| -> Result<String> {
            row.get(i).cloned().flatten().ok_or_else(|| {
                Error::RestoreError(format!("Backup #{} is incomplete", backup_id))
            })
        };

        let created_at = NaiveDateTime::parse_from_str(&field(2)?, TIMESTAMP_FORMAT)
            .map_err(|e| Error::RestoreError(format!("Invalid backup timestamp: {}", e)))?
            .and_utc();
        let tables: Vec<TableSnapshot> = serde_json::from_str(&field(3)?)
            .map_err(|e| Error::SerializationError(format!("Failed to decode backup #{}: {}", backup_id, e)))?;

        Ok(Backup {
            id: backup_id,
            entity_type_code: field(0)?,
            backup_type: field(1)?.parse()?,
            created_at,
            tables,
        })
    }

    /// Restore a backup table by table.
    ///
    /// A failing table is reported in `errors` and does not stop the remaining tables. With
    /// `verify_only` nothing is written and structural mismatches are reported instead.
    pub async fn restore(&self, backup_id: i64, options: &RestoreOptions) -> RestoreResult {
        let started = Instant::now();

        let mut result = match self.restore_inner(backup_id, options).await {
            Ok(result) => result,
            Err(e) => {
                tracing::error!(backup_id, error = %e, "Restore failed");
                RestoreResult::failed(backup_id, &e)
            }
        };
        result.execution_time = started.elapsed();
        result
    }

    async fn restore_inner(&self, backup_id: i64, options: &RestoreOptions) -> Result<RestoreResult> {
        let backup = self.get(backup_id).await?;
        let current = self
            .inspector
            .inspect()
            .await
            .map_err(|e| Error::RestoreError(format!("Failed to inspect database: {}", e)))?;

        let mut restored_tables = Vec::new();
        let mut errors = Vec::new();

        if options.verify_only {
            for snapshot in &backup.tables {
                match self.verify_table(&backup, snapshot, &current) {
                    Ok(()) => restored_tables.push(snapshot.name.clone()),
                    Err(e) => errors.push(SyncError::from(&e)),
                }
            }

            let success = errors.is_empty();
            tracing::info!(backup_id, success, "Backup verified");
            return Ok(RestoreResult {
                backup_id,
                entity_type_code: Some(backup.entity_type_code.clone()),
                success,
                status: if success {
                    RestoreStatus::Verified
                } else {
                    RestoreStatus::VerificationFailed
                },
                restored_tables,
                errors,
                execution_time: Default::default(),
            });
        }

        for snapshot in &backup.tables {
            let outcome = match self.verify_table(&backup, snapshot, &current) {
                Ok(()) => self.restore_table(&backup, snapshot, &current).await,
                Err(e) => Err(e),
            };

            match outcome {
                Ok(()) => {
                    tracing::debug!(backup_id, table = %snapshot.name, "Table restored");
                    restored_tables.push(snapshot.name.clone());
                }
                Err(e) => {
                    tracing::warn!(backup_id, table = %snapshot.name, error = %e, "Table restore failed");
                    errors.push(SyncError::with_details(
                        format!("Failed to restore table '{}'", snapshot.name),
                        e.to_string(),
                    ));
                }
            }
        }

        let status = match (errors.is_empty(), restored_tables.is_empty()) {
            (true, _) => RestoreStatus::Completed,
            (false, false) => RestoreStatus::Partial,
            (false, true) => RestoreStatus::Failed,
        };

        tracing::info!(
            backup_id,
            entity_type = %backup.entity_type_code,
            status = status.as_str(),
            tables = restored_tables.len(),
            "Backup restored"
        );

        Ok(RestoreResult {
            backup_id,
            entity_type_code: Some(backup.entity_type_code.clone()),
            success: errors.is_empty(),
            status,
            restored_tables,
            errors,
            execution_time: Default::default(),
        })
    }

    /// Whether `snapshot` can be restored onto the current database
    fn verify_table(&self, backup: &Backup, snapshot: &TableSnapshot, current: &DatabaseSchema) -> Result<()> {
        if !snapshot.existed {
            return Ok(());
        }

        let recreated = !snapshot.shared && backup.backup_type.includes_schema();
        if backup.backup_type.includes_schema() && snapshot.definition.is_none() {
            return Err(Error::RestoreError(format!(
                "Backup has no definition for table '{}'",
                snapshot.name
            )));
        }
        if recreated || !backup.backup_type.includes_data() {
            return Ok(());
        }

        let table = match current.table(&snapshot.name) {
            Some(table) => table,
            // A shared table can be recreated from a schema-bearing backup
            None if backup.backup_type.includes_schema() => return Ok(()),
            None => {
                return Err(Error::RestoreError(format!(
                    "Table '{}' no longer exists",
                    snapshot.name
                )))
            }
        };

        let missing: Vec<&str> = snapshot
            .columns
            .iter()
            .filter(|c| table.column(c).is_none())
            .map(|c| c.as_str())
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(Error::RestoreError(format!(
                "Table '{}' is missing column(s) {}",
                snapshot.name,
                missing.join(", ")
            )))
        }
    }

    async fn restore_table(&self, backup: &Backup, snapshot: &TableSnapshot, current: &DatabaseSchema) -> Result<()> {
        let dialect = self.dialect();
        let quoted = dialect.quote(&snapshot.name);
        let with_schema = backup.backup_type.includes_schema();
        let with_data = backup.backup_type.includes_data();
        let exists_now = current.has_table(&snapshot.name);
        let mut statements: Vec<Statement> = Vec::new();

        if !snapshot.existed {
            // Created after the backup; shared tables are left alone
            if with_schema && !snapshot.shared {
                statements.push(self.generator.drop_table_sql(&snapshot.name).into());
            }
            return self.executor.execute_statements(&statements).await;
        }

        if snapshot.shared {
            if with_schema && !exists_now {
                if let Some(definition) = &snapshot.definition {
                    statements.extend(self.generator.create_table_statements(definition).into_iter().map(Statement::from));
                }
            }
            if with_data {
                statements.push(self.scoped_delete(backup, snapshot).into());
                statements.extend(self.insert_rows(snapshot));
            }
        } else if with_schema && with_data {
            if let Some(definition) = &snapshot.definition {
                statements.push(self.generator.drop_table_sql(&snapshot.name).into());
                statements.extend(self.generator.create_table_statements(definition).into_iter().map(Statement::from));
            }
            statements.extend(self.insert_rows(snapshot));
        } else if with_schema {
            if let Some(definition) = &snapshot.definition {
                statements.extend(self.rebuild_preserving_rows(definition, current.table(&snapshot.name)));
            }
        } else {
            statements.push(format!("DELETE FROM {}", quoted).into());
            statements.extend(self.insert_rows(snapshot));
        }

        if dialect == Dialect::Postgres {
            if let Some(column) = snapshot
                .definition
                .as_ref()
                .and_then(|d| d.columns.iter().find(|c| c.auto_increment))
            {
                statements.push(
                    format!(
                        "SELECT setval(pg_get_serial_sequence({}, {}), COALESCE((SELECT MAX({}) FROM {}), 0) + 1, false)",
                        dialect.literal(&quoted),
                        dialect.literal(&column.name),
                        dialect.quote(&column.name),
                        quoted
                    )
                    .into(),
                );
            }
        }

        self.executor.execute_statements(&statements).await
    }

    /// Recreate an owned table from its backed-up definition, keeping the rows of the columns
    /// both versions share
    fn rebuild_preserving_rows(&self, definition: &Table, current: Option<&Table>) -> Vec<Statement> {
        let dialect = self.dialect();
        let current = match current {
            Some(current) => current,
            None => {
                return self
                    .generator
                    .create_table_statements(definition)
                    .into_iter()
                    .map(Statement::from)
                    .collect()
            }
        };

        let mut staging = definition.clone();
        staging.name = format!("{}__restore", definition.name);
        staging.indexes.clear();

        let common: Vec<String> = definition
            .columns
            .iter()
            .filter(|c| current.column(&c.name).is_some())
            .map(|c| dialect.quote(&c.name))
            .collect();

        let mut statements: Vec<String> = self.generator.create_table_statements(&staging);
        if !common.is_empty() {
            statements.push(format!(
                "INSERT INTO {} ({}) SELECT {} FROM {}",
                dialect.quote(&staging.name),
                common.join(", "),
                common.join(", "),
                dialect.quote(&definition.name)
            ));
        }
        statements.push(self.generator.drop_table_sql(&definition.name));
        statements.push(format!(
            "ALTER TABLE {} RENAME TO {}",
            dialect.quote(&staging.name),
            dialect.quote(&definition.name)
        ));
        statements.extend(
            definition
                .indexes
                .iter()
                .map(|index| self.generator.create_index_sql(&definition.name, index)),
        );
        statements.into_iter().map(Statement::from).collect()
    }

    /// Delete the rows of a shared table that belong to the backed-up entity type
    fn scoped_delete(&self, backup: &Backup, snapshot: &TableSnapshot) -> String {
        let dialect = self.dialect();
        let code = dialect.literal(&backup.entity_type_code);

        if snapshot.name == ATTRIBUTE_TABLE {
            return format!(
                "DELETE FROM {} WHERE entity_type_code = {}",
                dialect.quote(ATTRIBUTE_TABLE),
                code
            );
        }

        // Attributes registered now plus those registered at backup time
        let mut ids: BTreeSet<i64> = BTreeSet::new();
        if let Some(attributes) = backup.table(ATTRIBUTE_TABLE) {
            let id_column = attributes.columns.iter().position(|c| c == "id");
            for row in &attributes.rows {
                if let Some(id) = id_column
                    .and_then(|i| row.get(i).cloned().flatten())
                    .and_then(|id| id.parse().ok())
                {
                    ids.insert(id);
                }
            }
        }

        let mut condition = format!(
            "attribute_id IN (SELECT id FROM {} WHERE entity_type_code = {})",
            dialect.quote(ATTRIBUTE_TABLE),
            code
        );
        if !ids.is_empty() {
            let ids: Vec<String> = ids.iter().map(|id| id.to_string()).collect();
            condition.push_str(&format!(" OR attribute_id IN ({})", ids.join(", ")));
        }

        format!("DELETE FROM {} WHERE {}", dialect.quote(&snapshot.name), condition)
    }

    fn insert_rows(&self, snapshot: &TableSnapshot) -> Vec<Statement> {
        let dialect = self.dialect();
        let columns: Vec<String> = snapshot.columns.iter().map(|c| dialect.quote(c)).collect();
        let placeholders: Vec<String> = snapshot
            .column_types
            .iter()
            .enumerate()
            .map(|(i, data_type)| dialect.value_param(i + 1, &data_type.to_uppercase()))
            .collect();
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            dialect.quote(&snapshot.name),
            columns.join(", "),
            placeholders.join(", ")
        );

        snapshot
            .rows
            .iter()
            .map(|row| Statement::new(sql.clone(), row.iter().cloned().map(Param::Text).collect()))
            .collect()
    }

    async fn snapshot_table(
        &self,
        entity_type: &EntityType,
        name: &str,
        actual: &DatabaseSchema,
        backup_type: BackupType,
    ) -> Result<TableSnapshot> {
        let shared = !is_owned_table(&entity_type.entity_table, name);
        let table = match actual.table(name) {
            Some(table) => table,
            None => {
                return Ok(TableSnapshot {
                    name: name.to_string(),
                    shared,
                    existed: false,
                    ddl: Vec::new(),
                    definition: None,
                    columns: Vec::new(),
                    column_types: Vec::new(),
                    rows: Vec::new(),
                })
            }
        };

        let rows = if backup_type.includes_data() {
            self.read_rows(entity_type, table, actual, shared).await?
        } else {
            Vec::new()
        };

        Ok(TableSnapshot {
            name: name.to_string(),
            shared,
            existed: true,
            ddl: if backup_type.includes_schema() {
                self.generator.create_table_statements(table)
            } else {
                Vec::new()
            },
            definition: Some(table.clone()),
            columns: table.column_names(),
            column_types: table.columns.iter().map(|c| c.data_type.clone()).collect(),
            rows,
        })
    }

    async fn read_rows(
        &self,
        entity_type: &EntityType,
        table: &Table,
        actual: &DatabaseSchema,
        shared: bool,
    ) -> Result<Vec<Vec<Option<String>>>> {
        let dialect = self.dialect();
        let selected: Vec<String> = table
            .columns
            .iter()
            .map(|c| format!("CAST({} AS TEXT)", dialect.quote(&c.name)))
            .collect();
        let mut sql = format!("SELECT {} FROM {}", selected.join(", "), dialect.quote(&table.name));
        let mut params = Vec::new();

        if shared {
            if table.name == ATTRIBUTE_TABLE {
                sql.push_str(&format!(" WHERE entity_type_code = {}", dialect.placeholder(1)));
            } else if actual.has_table(ATTRIBUTE_TABLE) {
                sql.push_str(&format!(
                    " WHERE attribute_id IN (SELECT id FROM {} WHERE entity_type_code = {})",
                    dialect.quote(ATTRIBUTE_TABLE),
                    dialect.placeholder(1)
                ));
            } else {
                // No metadata means no values of this entity type can be identified
                return Ok(Vec::new());
            }
            params.push(entity_type.code.as_str().into());
        }

        self.connection.fetch_text_rows(&sql, &params).await
    }

    async fn ensure_table(&self) -> Result<()> {
        let dialect = self.dialect();
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {} (\
                id {}, \
                entity_type_code VARCHAR(255) NOT NULL, \
                backup_type VARCHAR(16) NOT NULL, \
                created_at VARCHAR(32) NOT NULL, \
                payload TEXT NOT NULL\
            )",
            dialect.quote(BACKUP_TABLE),
            dialect.auto_increment_primary_key()
        );
        self.connection.execute(&sql).await?;
        Ok(())
    }
}

/// Owned tables (desired or existing) first, then value tables, then the attribute metadata.
///
/// Value rows are scoped through the attribute metadata, so metadata is restored last.
fn implicated_tables(entity_type: &EntityType, actual: &DatabaseSchema) -> Vec<String> {
    let mut names = vec![entity_type.entity_table.clone()];
    for name in actual.tables.keys() {
        if is_owned_table(&entity_type.entity_table, name) && !names.contains(name) {
            names.push(name.clone());
        }
    }

    let shared = shared_table_names();
    names.extend(shared.iter().filter(|n| n.as_str() != ATTRIBUTE_TABLE).cloned());
    names.push(ATTRIBUTE_TABLE.to_string());
    names
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::types::{Attribute, BackendType, StorageMode};
    use crate::schema::types::Column;
    use pretty_assertions::assert_eq;

    #[test]
    fn implicated_tables_put_metadata_last() {
        let entity_type = EntityType::new(
            "customer",
            "Customer",
            "customer_entity",
            StorageMode::Eav,
            vec![Attribute::new("email", BackendType::Varchar)],
        );
        let mut actual = DatabaseSchema::new(None);
        let mut legacy = Table::new("customer_entity_legacy");
        legacy.add_column(Column::new("id", "bigint"));
        actual.add_table(legacy);
        actual.add_table(Table::new("product_entity"));

        assert_eq!(
            implicated_tables(&entity_type, &actual),
            vec![
                "customer_entity",
                "customer_entity_legacy",
                "eav_values_varchar",
                "eav_values_text",
                "eav_values_int",
                "eav_values_decimal",
                "eav_values_datetime",
                "eav_attributes",
            ]
        );
    }
}
