//! Migration history
//!
//! Every applied migration step is recorded with a checksum of its statements, so the history
//! table tells which changes reached a database and how long they took.

use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::db::connection::{DatabaseConnection, Param};
use crate::error::{Error, Result};
use crate::schema::generator::MigrationStep;

/// One recorded step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationRecord {
    pub id: i64,
    pub entity_type_code: String,
    pub description: String,
    pub checksum: String,
    pub applied_at: DateTime<Utc>,
    pub execution_time_ms: i64,
}

#[derive(Debug, Clone)]
pub struct MigrationHistory {
    connection: DatabaseConnection,
    table_name: String,
}

impl MigrationHistory {
    pub fn new(connection: DatabaseConnection, table_name: &str) -> Self {
        Self {
            connection,
            table_name: table_name.to_string(),
        }
    }

    /// Ensure the migration history table exists
    pub async fn ensure_table(&self) -> Result<()> {
        let dialect = self.connection.dialect();
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {} (\
                id {}, \
                entity_type_code VARCHAR(255) NOT NULL, \
                description TEXT NOT NULL, \
                checksum VARCHAR(32) NOT NULL, \
                applied_at VARCHAR(32) NOT NULL, \
                execution_time_ms BIGINT NOT NULL\
            )",
            dialect.quote(&self.table_name),
            dialect.auto_increment_primary_key()
        );
        self.connection.execute(&sql).await?;
        Ok(())
    }

    /// Record a migration step in the history table
    pub async fn record(&self, entity_type_code: &str, step: &MigrationStep, elapsed: Duration) -> Result<()> {
        self.ensure_table().await?;

        let dialect = self.connection.dialect();
        let sql = format!(
            "INSERT INTO {} (entity_type_code, description, checksum, applied_at, execution_time_ms) \
             VALUES ({}, {}, {}, {}, {})",
            dialect.quote(&self.table_name),
            dialect.placeholder(1),
            dialect.placeholder(2),
            dialect.placeholder(3),
            dialect.placeholder(4),
            dialect.placeholder(5)
        );

        self.connection
            .execute_with(
                &sql,
                &[
                    entity_type_code.into(),
                    step.description.as_str().into(),
                    checksum(&step.statements).into(),
                    Utc::now().format(TIMESTAMP_FORMAT).to_string().into(),
                    Param::Int(elapsed.as_millis() as i64),
                ],
            )
            .await?;
        Ok(())
    }

    /// Applied steps of one entity type, oldest first
    pub async fn list(&self, entity_type_code: &str) -> Result<Vec<MigrationRecord>> {
        self.ensure_table().await?;

        let dialect = self.connection.dialect();
        let sql = format!(
            "SELECT CAST(id AS TEXT), entity_type_code, description, checksum, applied_at, \
             CAST(execution_time_ms AS TEXT) FROM {} WHERE entity_type_code = {} ORDER BY id",
            dialect.quote(&self.table_name),
            dialect.placeholder(1)
        );

        self.connection
            .fetch_text_rows(&sql, &[entity_type_code.into()])
            .await?
            .into_iter()
            .map(parse_record)
            .collect()
    }
}

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

/// md5 over the statements of a step, one per line
pub fn checksum(statements: &[String]) -> String {
    format!("{:x}", md5::compute(statements.join("\n")))
}

fn parse_record(row: Vec<Option<String>>) -> Result<MigrationRecord> {
    let field = |i: usize| -> Result<String> {
        row.get(i)
            .cloned()
            .flatten()
            .ok_or_else(|| Error::DatabaseError(format!("Migration history column {} is NULL", i)))
    };
    let number = |i: usize| -> Result<i64> {
        field(i)?
            .parse()
            .map_err(|e| Error::DatabaseError(format!("Invalid migration history value: {}", e)))
    };

    let applied_at = NaiveDateTime::parse_from_str(&field(4)?, TIMESTAMP_FORMAT)
        .map_err(|e| Error::DatabaseError(format!("Invalid migration timestamp: {}", e)))?
        .and_utc();

    Ok(MigrationRecord {
        id: number(0)?,
        entity_type_code: field(1)?,
        description: field(2)?,
        checksum: field(3)?,
        applied_at,
        execution_time_ms: number(5)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DatabaseConfig;
    use crate::schema::generator::StepPhase;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn records_steps_with_checksums() {
        let connection = DatabaseConnection::connect(&DatabaseConfig::sqlite_memory())
            .await
            .unwrap();
        let history = MigrationHistory::new(connection, "eav_schema_history");
        let step = MigrationStep {
            phase: StepPhase::AddColumn,
            table: "customer_entity".to_string(),
            description: "Add column customer_entity.is_verified (bigint)".to_string(),
            statements: vec!["ALTER TABLE \"customer_entity\" ADD COLUMN \"is_verified\" BIGINT".to_string()],
            rollback: Vec::new(),
            guard: None,
        };

        history
            .record("customer", &step, Duration::from_millis(12))
            .await
            .unwrap();
        let records = history.list("customer").await.unwrap();

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].description, step.description);
        assert_eq!(records[0].checksum, checksum(&step.statements));
        assert_eq!(records[0].checksum.len(), 32);
        assert_eq!(records[0].execution_time_ms, 12);
        assert!(history.list("product").await.unwrap().is_empty());
    }
}
