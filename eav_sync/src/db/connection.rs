//! Database connection handling
//!
//! This module provides functionality to establish and manage database connections,
//! plus the small amount of SQL dialect knowledge the rest of the engine needs.

use std::str::FromStr;
use std::time::Duration;

use sqlx::{
    postgres::PgPoolOptions,
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    PgPool, Row, SqlitePool,
};

use crate::config::DatabaseConfig;
use crate::error::{Error, Result};

/// Run the same query body against whichever pool backs a connection.
///
/// The body is expanded once per driver, so it may only use APIs that exist for both.
#[macro_export]
macro_rules! with_pool {
    ($conn:expr, $pool:ident => $body:expr) => {
        match $conn {
            $crate::db::connection::DatabaseConnection::Postgres($pool) => $body,
            $crate::db::connection::DatabaseConnection::Sqlite($pool) => $body,
        }
    };
}

/// Bind parameter for the dynamically built statements in this crate
#[derive(Debug, Clone, PartialEq)]
pub enum Param {
    Int(i64),
    Text(Option<String>),
}

impl From<i64> for Param {
    fn from(value: i64) -> Self {
        Param::Int(value)
    }
}

impl From<&str> for Param {
    fn from(value: &str) -> Self {
        Param::Text(Some(value.to_string()))
    }
}

impl From<String> for Param {
    fn from(value: String) -> Self {
        Param::Text(Some(value))
    }
}

impl From<Option<String>> for Param {
    fn from(value: Option<String>) -> Self {
        Param::Text(value)
    }
}

/// Enumeration of supported database types
#[derive(Debug, Clone)]
pub enum DatabaseConnection {
    Postgres(PgPool),
    Sqlite(SqlitePool),
}

impl DatabaseConnection {
    /// Create a new database connection from configuration
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let pool_size = config.pool_size.unwrap_or(10);
        let timeout = Duration::from_secs(config.timeout_seconds.unwrap_or(30));

        match config.driver.as_str() {
            "postgres" => {
                let pool = PgPoolOptions::new()
                    .max_connections(pool_size)
                    .acquire_timeout(timeout)
                    .connect(&config.url)
                    .await?;

                Ok(DatabaseConnection::Postgres(pool))
            }
            "sqlite" => {
                let options = SqliteConnectOptions::from_str(&config.url)?.create_if_missing(true);

                // Every connection to :memory: opens a fresh database, so keep exactly one
                // and never let the pool recycle it.
                let pool = if config.url.contains(":memory:") {
                    SqlitePoolOptions::new()
                        .max_connections(1)
                        .min_connections(1)
                        .idle_timeout(None)
                        .max_lifetime(None)
                        .acquire_timeout(timeout)
                        .connect_with(options)
                        .await?
                } else {
                    SqlitePoolOptions::new()
                        .max_connections(pool_size)
                        .acquire_timeout(timeout)
                        .connect_with(options)
                        .await?
                };

                Ok(DatabaseConnection::Sqlite(pool))
            }
            _ => Err(Error::DatabaseError(format!(
                "Unsupported database driver: {}",
                config.driver
            ))),
        }
    }

    /// SQL dialect spoken by this connection
    pub fn dialect(&self) -> Dialect {
        match self {
            DatabaseConnection::Postgres(_) => Dialect::Postgres,
            DatabaseConnection::Sqlite(_) => Dialect::Sqlite,
        }
    }

    /// Execute a single SQL statement without parameters
    pub async fn execute(&self, sql: &str) -> Result<u64> {
        let affected = with_pool!(self, pool => sqlx::query(sql).execute(pool).await?.rows_affected());
        Ok(affected)
    }

    /// Execute a single statement with bound parameters
    pub async fn execute_with(&self, sql: &str, params: &[Param]) -> Result<u64> {
        let affected = with_pool!(self, pool => {
            let mut query = sqlx::query(sql);
            for param in params {
                query = match param {
                    Param::Int(value) => query.bind(*value),
                    Param::Text(value) => query.bind(value.clone()),
                };
            }
            query.execute(pool).await?.rows_affected()
        });
        Ok(affected)
    }

    /// Fetch rows whose columns are all text (or NULL).
    ///
    /// Callers select `CAST(... AS TEXT)` so one decoding path serves both drivers.
    pub async fn fetch_text_rows(&self, sql: &str, params: &[Param]) -> Result<Vec<Vec<Option<String>>>> {
        let rows = with_pool!(self, pool => {
            let mut query = sqlx::query(sql);
            for param in params {
                query = match param {
                    Param::Int(value) => query.bind(*value),
                    Param::Text(value) => query.bind(value.clone()),
                };
            }
            query
                .fetch_all(pool)
                .await?
                .iter()
                .map(|row| {
                    (0..row.len())
                        .map(|i| row.try_get::<Option<String>, _>(i))
                        .collect::<std::result::Result<Vec<_>, _>>()
                })
                .collect::<std::result::Result<Vec<_>, _>>()?
        });
        Ok(rows)
    }

    /// Fetch a single integer, typically `COUNT(*)` or a generated id
    pub async fn fetch_i64(&self, sql: &str, params: &[Param]) -> Result<i64> {
        let value = with_pool!(self, pool => {
            let mut query = sqlx::query_scalar::<_, i64>(sql);
            for param in params {
                query = match param {
                    Param::Int(value) => query.bind(*value),
                    Param::Text(value) => query.bind(value.clone()),
                };
            }
            query.fetch_one(pool).await?
        });
        Ok(value)
    }
}

/// SQL dialect differences the engine cares about
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Postgres,
    Sqlite,
}

impl Dialect {
    /// Positional bind placeholder, 1-based
    pub fn placeholder(&self, index: usize) -> String {
        match self {
            Dialect::Postgres => format!("${}", index),
            Dialect::Sqlite => "?".to_string(),
        }
    }

    /// Placeholder for a value bound as text and stored in a column of `sql_type`.
    ///
    /// Postgres will not coerce a text parameter into a numeric or timestamp column on its
    /// own; SQLite applies column affinity instead and must not see a CAST to TIMESTAMP
    /// (that would be NUMERIC affinity and truncate the string).
    pub fn value_param(&self, index: usize, sql_type: &str) -> String {
        match self {
            Dialect::Postgres => format!("CAST(${} AS {})", index, sql_type),
            Dialect::Sqlite => "?".to_string(),
        }
    }

    /// Expression converting `expr` into `sql_type` inside a statement
    pub fn cast(&self, expr: &str, sql_type: &str) -> String {
        match self {
            Dialect::Postgres => format!("CAST({} AS {})", expr, sql_type),
            Dialect::Sqlite if sql_type.to_lowercase().starts_with("timestamp") => expr.to_string(),
            Dialect::Sqlite => format!("CAST({} AS {})", expr, sql_type),
        }
    }

    /// Quote an identifier
    pub fn quote(&self, identifier: &str) -> String {
        format!("\"{}\"", identifier.replace('"', "\"\""))
    }

    /// Render a string literal
    pub fn literal(&self, value: &str) -> String {
        format!("'{}'", value.replace('\'', "''"))
    }

    /// Column definition for an auto-incrementing integer primary key
    pub fn auto_increment_primary_key(&self) -> &'static str {
        match self {
            Dialect::Postgres => "BIGSERIAL PRIMARY KEY",
            Dialect::Sqlite => "INTEGER PRIMARY KEY AUTOINCREMENT",
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Dialect::Postgres => "postgres",
            Dialect::Sqlite => "sqlite",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholders_follow_driver_syntax() {
        assert_eq!(Dialect::Postgres.placeholder(2), "$2");
        assert_eq!(Dialect::Sqlite.placeholder(2), "?");
        assert_eq!(Dialect::Postgres.value_param(3, "BIGINT"), "CAST($3 AS BIGINT)");
        assert_eq!(Dialect::Sqlite.value_param(3, "BIGINT"), "?");
    }

    #[test]
    fn sqlite_never_casts_to_timestamp() {
        assert_eq!(Dialect::Sqlite.cast("value", "TIMESTAMP"), "value");
        assert_eq!(Dialect::Sqlite.cast("value", "BIGINT"), "CAST(value AS BIGINT)");
        assert_eq!(Dialect::Postgres.cast("value", "TIMESTAMP"), "CAST(value AS TIMESTAMP)");
    }

    #[tokio::test]
    async fn text_rows_round_trip_through_sqlite() {
        let conn = DatabaseConnection::connect(&DatabaseConfig::sqlite_memory())
            .await
            .unwrap();
        conn.execute("CREATE TABLE sample (id INTEGER PRIMARY KEY, name VARCHAR(20))")
            .await
            .unwrap();
        conn.execute_with(
            "INSERT INTO sample (id, name) VALUES (?, ?), (?, ?)",
            &[Param::Int(1), "one".into(), Param::Int(2), Param::Text(None)],
        )
        .await
        .unwrap();

        let rows = conn
            .fetch_text_rows(
                "SELECT CAST(id AS TEXT), name FROM sample ORDER BY id",
                &[],
            )
            .await
            .unwrap();
        assert_eq!(
            rows,
            vec![
                vec![Some("1".to_string()), Some("one".to_string())],
                vec![Some("2".to_string()), None],
            ]
        );
        assert_eq!(conn.fetch_i64("SELECT COUNT(*) FROM sample", &[]).await.unwrap(), 2);
    }

    #[test]
    fn literals_and_identifiers_are_escaped() {
        assert_eq!(Dialect::Sqlite.literal("O'Brien"), "'O''Brien'");
        assert_eq!(Dialect::Postgres.quote("customer_entity"), "\"customer_entity\"");
    }
}
