//! SQL executor
//!
//! Runs migration steps. Every step is atomic: its guard and statements share one transaction and
//! either all apply or none do.

use std::time::{Duration, Instant};

use crate::db::connection::{DatabaseConnection, Param};
use crate::error::{Error, Result};
use crate::schema::generator::{MigrationStep, StepGuard};
use crate::with_pool;

/// A statement with its bind parameters
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<Param>,
}

impl Statement {
    pub fn new(sql: impl Into<String>, params: Vec<Param>) -> Self {
        Self {
            sql: sql.into(),
            params,
        }
    }
}

impl From<String> for Statement {
    fn from(sql: String) -> Self {
        Self::new(sql, Vec::new())
    }
}

impl From<&str> for Statement {
    fn from(sql: &str) -> Self {
        Self::new(sql, Vec::new())
    }
}

/// SQL executor for running migration steps
pub struct SqlExecutor {
    connection: DatabaseConnection,
}

impl SqlExecutor {
    /// Create a new SQL executor
    pub fn new(connection: DatabaseConnection) -> Self {
        Self { connection }
    }

    /// Execute multiple SQL statements in a transaction
    pub async fn execute_in_transaction(&self, statements: &[String]) -> Result<()> {
        let statements: Vec<Statement> = statements.iter().cloned().map(Statement::from).collect();
        self.execute_statements(&statements).await
    }

    /// Execute parameterized statements in a transaction
    pub async fn execute_statements(&self, statements: &[Statement]) -> Result<()> {
        self.execute_guarded(None, statements).await
    }

    /// Execute statements in a transaction after `guard`, run in the same transaction, found
    /// nothing to refuse
    async fn execute_guarded(&self, guard: Option<&StepGuard>, statements: &[Statement]) -> Result<()> {
        with_pool!(&self.connection, pool => {
            let mut tx = pool.begin().await?;
            if let Some(guard) = guard {
                tracing::debug!(sql = %guard.sql, "Checking step guard");
                let refused = sqlx::query_scalar::<_, i64>(&guard.sql).fetch_one(&mut *tx).await?;
                if refused > 0 {
                    return Err(Error::MigrationError(format!(
                        "{} ({} row(s) affected)",
                        guard.message, refused
                    )));
                }
            }
            for statement in statements {
                tracing::debug!(sql = %statement.sql, "Executing statement");
                let mut query = sqlx::query(&statement.sql);
                for param in &statement.params {
                    query = match param {
                        Param::Int(value) => query.bind(*value),
                        Param::Text(value) => query.bind(value.clone()),
                    };
                }
                // Dropping the transaction on error rolls it back
                query.execute(&mut *tx).await?;
            }
            tx.commit().await?;
        });

        Ok(())
    }

    /// Apply one step, returning how long it took
    pub async fn apply(&self, step: &MigrationStep) -> Result<Duration> {
        let started = Instant::now();

        let statements: Vec<Statement> = step.statements.iter().cloned().map(Statement::from).collect();
        self.execute_guarded(step.guard.as_ref(), &statements)
            .await
            .map_err(|e| Error::MigrationError(format!("Step '{}' failed: {}", step.description, e)))?;

        let elapsed = started.elapsed();
        tracing::info!(
            step = %step.description,
            table = %step.table,
            elapsed_ms = elapsed.as_millis() as u64,
            "Migration step applied"
        );
        Ok(elapsed)
    }

    /// Undo a previously applied step
    pub async fn revert(&self, step: &MigrationStep) -> Result<()> {
        self.execute_in_transaction(&step.rollback).await.map_err(|e| {
            Error::MigrationError(format!("Rollback of '{}' failed: {}", step.description, e))
        })
    }

    /// Get database connection
    pub fn connection(&self) -> &DatabaseConnection {
        &self.connection
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DatabaseConfig;
    use crate::schema::generator::StepPhase;

    fn step(statements: &[&str]) -> MigrationStep {
        MigrationStep {
            phase: StepPhase::CreateTable,
            table: "widget_entity".to_string(),
            description: "Create table widget_entity".to_string(),
            statements: statements.iter().map(|s| s.to_string()).collect(),
            rollback: vec!["DROP TABLE IF EXISTS widget_entity".to_string()],
            guard: None,
        }
    }

    #[tokio::test]
    async fn failing_statement_rolls_back_the_whole_step() {
        let connection = DatabaseConnection::connect(&DatabaseConfig::sqlite_memory())
            .await
            .unwrap();
        let executor = SqlExecutor::new(connection.clone());

        let result = executor
            .apply(&step(&[
                "CREATE TABLE widget_entity (id INTEGER PRIMARY KEY)",
                "INSERT INTO missing_table VALUES (1)",
            ]))
            .await;

        assert!(matches!(result, Err(Error::MigrationError(_))));
        let tables = connection
            .fetch_i64(
                "SELECT COUNT(*) FROM sqlite_master WHERE name = 'widget_entity'",
                &[],
            )
            .await
            .unwrap();
        assert_eq!(tables, 0);
    }

    #[tokio::test]
    async fn guard_refusing_rows_stops_the_step() {
        let connection = DatabaseConnection::connect(&DatabaseConfig::sqlite_memory())
            .await
            .unwrap();
        connection
            .execute("CREATE TABLE widget_entity (id INTEGER PRIMARY KEY, code TEXT)")
            .await
            .unwrap();
        connection
            .execute("INSERT INTO widget_entity (id, code) VALUES (1, '42'), (2, 'ABC-123')")
            .await
            .unwrap();
        let executor = SqlExecutor::new(connection.clone());
        let mut guarded = step(&["UPDATE widget_entity SET code = CAST(code AS BIGINT)"]);
        guarded.guard = Some(StepGuard {
            sql: "SELECT COUNT(*) FROM widget_entity WHERE code <> CAST(code AS NUMERIC)".to_string(),
            message: "codes are not numbers".to_string(),
        });

        match executor.apply(&guarded).await {
            Err(Error::MigrationError(message)) => assert!(message.contains("codes are not numbers (1 row(s)")),
            other => panic!("expected a migration error, got {:?}", other),
        }
        let untouched = connection
            .fetch_i64("SELECT COUNT(*) FROM widget_entity WHERE code = 'ABC-123'", &[])
            .await
            .unwrap();
        assert_eq!(untouched, 1);

        connection
            .execute("DELETE FROM widget_entity WHERE id = 2")
            .await
            .unwrap();
        executor.apply(&guarded).await.unwrap();
    }

    #[tokio::test]
    async fn revert_runs_the_rollback_statements() {
        let connection = DatabaseConnection::connect(&DatabaseConfig::sqlite_memory())
            .await
            .unwrap();
        let executor = SqlExecutor::new(connection.clone());
        let step = step(&["CREATE TABLE widget_entity (id INTEGER PRIMARY KEY)"]);

        executor.apply(&step).await.unwrap();
        executor.revert(&step).await.unwrap();

        let tables = connection
            .fetch_i64(
                "SELECT COUNT(*) FROM sqlite_master WHERE name = 'widget_entity'",
                &[],
            )
            .await
            .unwrap();
        assert_eq!(tables, 0);
    }
}
