//! Database schema inspector
//!
//! Introspects the live database into a [`DatabaseSchema`]: tables, columns, primary keys and
//! secondary indexes. Every call builds a fresh snapshot.

use async_trait::async_trait;
use indexmap::IndexMap;
use sqlx::{FromRow, Pool, Postgres, Row, Sqlite};

use crate::db::connection::{DatabaseConnection, Dialect};
use crate::error::Result;
use crate::schema::types::{Column, DatabaseSchema, Index, PrimaryKey, Table};

/// Per-driver schema introspection
#[async_trait]
pub trait Inspector {
    /// Inspect the database schema
    async fn inspect_schema(&self, schema_name: Option<&str>) -> Result<DatabaseSchema>;

    /// Inspect table definitions
    async fn inspect_tables(&self, schema_name: Option<&str>) -> Result<IndexMap<String, Table>>;
}

/// Schema inspector for the configured connection
#[derive(Debug, Clone)]
pub struct SchemaInspector {
    connection: DatabaseConnection,
    schema_name: Option<String>,
}

impl SchemaInspector {
    /// Create a new schema inspector; `schema_name` only applies to Postgres
    pub fn new(connection: DatabaseConnection, schema_name: Option<String>) -> Self {
        Self {
            connection,
            schema_name,
        }
    }

    /// Inspect the current database schema
    pub async fn inspect(&self) -> Result<DatabaseSchema> {
        let schema = match &self.connection {
            DatabaseConnection::Postgres(pool) => {
                PostgresInspector { pool }
                    .inspect_schema(self.schema_name.as_deref())
                    .await?
            }
            DatabaseConnection::Sqlite(pool) => {
                SqliteInspector { pool }
                    .inspect_schema(self.schema_name.as_deref())
                    .await?
            }
        };

        tracing::debug!(
            driver = self.connection.dialect().name(),
            tables = schema.tables.len(),
            "Database schema inspected"
        );
        Ok(schema)
    }

    pub fn dialect(&self) -> Dialect {
        self.connection.dialect()
    }
}

// Row types for PostgreSQL queries. information_schema reports domain types, so every text
// column is cast explicitly.
#[derive(FromRow)]
struct TableRow {
    table_name: String,
}

#[derive(FromRow)]
struct ColumnRow {
    column_name: String,
    data_type: String,
    is_nullable: String,
    column_default: Option<String>,
    character_maximum_length: Option<i64>,
    numeric_precision: Option<i64>,
    numeric_scale: Option<i64>,
}

#[derive(FromRow)]
struct PrimaryKeyRow {
    constraint_name: String,
    column_name: String,
}

#[derive(FromRow)]
struct IndexRow {
    index_name: String,
    column_name: String,
    is_unique: bool,
}

/// PostgreSQL schema inspector
struct PostgresInspector<'a> {
    pool: &'a Pool<Postgres>,
}

#[async_trait]
impl<'a> Inspector for PostgresInspector<'a> {
    async fn inspect_schema(&self, schema_name: Option<&str>) -> Result<DatabaseSchema> {
        let schema = schema_name.unwrap_or("public");
        let mut db_schema = DatabaseSchema::new(Some(schema.to_string()));
        db_schema.tables = self.inspect_tables(Some(schema)).await?;
        Ok(db_schema)
    }

    async fn inspect_tables(&self, schema_name: Option<&str>) -> Result<IndexMap<String, Table>> {
        let schema = schema_name.unwrap_or("public");
        let mut tables = IndexMap::new();

        let sql = r#"
            SELECT table_name::text AS table_name
            FROM information_schema.tables
            WHERE table_schema = $1 AND table_type = 'BASE TABLE'
            ORDER BY table_name
        "#;

        let table_rows = sqlx::query_as::<_, TableRow>(sql)
            .bind(schema)
            .fetch_all(self.pool)
            .await?;

        for row in table_rows {
            let table_name = row.table_name;
            let mut table = Table::new(&table_name);

            let sql = r#"
                SELECT
                    column_name::text AS column_name,
                    data_type::text AS data_type,
                    is_nullable::text AS is_nullable,
                    column_default::text AS column_default,
                    character_maximum_length::int8 AS character_maximum_length,
                    numeric_precision::int8 AS numeric_precision,
                    numeric_scale::int8 AS numeric_scale
                FROM information_schema.columns
                WHERE table_schema = $1 AND table_name = $2
                ORDER BY ordinal_position
            "#;

            let column_rows = sqlx::query_as::<_, ColumnRow>(sql)
                .bind(schema)
                .bind(&table_name)
                .fetch_all(self.pool)
                .await?;

            for col in column_rows {
                let data_type = match (col.data_type.as_str(), col.character_maximum_length) {
                    ("character varying", Some(length)) => format!("varchar({})", length),
                    ("numeric", _) => match (col.numeric_precision, col.numeric_scale) {
                        (Some(precision), Some(scale)) => format!("decimal({},{})", precision, scale),
                        _ => "decimal".to_string(),
                    },
                    _ => col.data_type.clone(),
                };

                let auto_increment = col
                    .column_default
                    .as_deref()
                    .map_or(false, |default| default.starts_with("nextval("));

                table.add_column(Column {
                    name: col.column_name,
                    data_type,
                    nullable: col.is_nullable == "YES",
                    default: if auto_increment { None } else { col.column_default },
                    auto_increment,
                });
            }

            let sql = r#"
                SELECT
                    tc.constraint_name::text AS constraint_name,
                    kcu.column_name::text AS column_name
                FROM
                    information_schema.table_constraints tc
                JOIN information_schema.key_column_usage kcu
                    ON tc.constraint_name = kcu.constraint_name
                    AND tc.table_schema = kcu.table_schema
                WHERE
                    tc.constraint_type = 'PRIMARY KEY'
                    AND tc.table_schema = $1
                    AND tc.table_name = $2
                ORDER BY kcu.ordinal_position
            "#;

            let pk_rows = sqlx::query_as::<_, PrimaryKeyRow>(sql)
                .bind(schema)
                .bind(&table_name)
                .fetch_all(self.pool)
                .await?;

            if let Some(first) = pk_rows.first() {
                table.set_primary_key(PrimaryKey {
                    name: Some(first.constraint_name.clone()),
                    columns: pk_rows.iter().map(|r| r.column_name.clone()).collect(),
                });
            }

            let sql = r#"
                SELECT
                    i.relname::text AS index_name,
                    a.attname::text AS column_name,
                    ix.indisunique AS is_unique
                FROM
                    pg_index ix
                JOIN pg_class i ON i.oid = ix.indexrelid
                JOIN pg_class t ON t.oid = ix.indrelid
                JOIN pg_attribute a ON a.attrelid = t.oid AND a.attnum = ANY(ix.indkey)
                JOIN pg_namespace n ON n.oid = t.relnamespace
                WHERE
                    t.relname = $1
                    AND n.nspname = $2
                    AND NOT ix.indisprimary
                ORDER BY i.relname, array_position(ix.indkey::int2[], a.attnum)
            "#;

            let index_rows = sqlx::query_as::<_, IndexRow>(sql)
                .bind(&table_name)
                .bind(schema)
                .fetch_all(self.pool)
                .await?;

            let mut indexes: IndexMap<String, Index> = IndexMap::new();
            for row in index_rows {
                indexes
                    .entry(row.index_name.clone())
                    .or_insert_with(|| Index {
                        name: row.index_name.clone(),
                        columns: Vec::new(),
                        is_unique: row.is_unique,
                    })
                    .columns
                    .push(row.column_name);
            }
            table.indexes = indexes.into_values().collect();

            tables.insert(table_name, table);
        }

        Ok(tables)
    }
}

/// SQLite schema inspector
struct SqliteInspector<'a> {
    pool: &'a Pool<Sqlite>,
}

#[async_trait]
impl<'a> Inspector for SqliteInspector<'a> {
    async fn inspect_schema(&self, schema_name: Option<&str>) -> Result<DatabaseSchema> {
        let mut db_schema = DatabaseSchema::new(None);
        db_schema.tables = self.inspect_tables(schema_name).await?;
        Ok(db_schema)
    }

    async fn inspect_tables(&self, _schema_name: Option<&str>) -> Result<IndexMap<String, Table>> {
        let mut tables = IndexMap::new();

        let sql = r#"
            SELECT name AS table_name FROM sqlite_master
            WHERE type = 'table' AND name NOT LIKE 'sqlite_%'
            ORDER BY name
        "#;
        let table_rows = sqlx::query_as::<_, TableRow>(sql)
            .fetch_all(self.pool)
            .await?;

        for row in table_rows {
            let table_name = row.table_name;
            let mut table = Table::new(&table_name);
            let quoted = Dialect::Sqlite.quote(&table_name);

            let pragma = format!("PRAGMA table_info({})", quoted);
            let columns = sqlx::query(&pragma).fetch_all(self.pool).await?;

            let mut pk_columns: Vec<(i64, String)> = Vec::new();
            for col in columns {
                let name: String = col.try_get("name")?;
                let data_type: String = col.try_get("type")?;
                let notnull: i64 = col.try_get("notnull")?;
                let dflt_value: Option<String> = col.try_get("dflt_value")?;
                let pk: i64 = col.try_get("pk")?;

                // Only an INTEGER PRIMARY KEY aliases the auto-assigned rowid
                let auto_increment = pk > 0 && data_type.eq_ignore_ascii_case("integer");
                if pk > 0 {
                    pk_columns.push((pk, name.clone()));
                }

                table.add_column(Column {
                    name,
                    data_type,
                    nullable: notnull == 0 && pk == 0,
                    default: dflt_value,
                    auto_increment,
                });
            }

            if !pk_columns.is_empty() {
                pk_columns.sort();
                table.set_primary_key(PrimaryKey {
                    name: None,
                    columns: pk_columns.into_iter().map(|(_, name)| name).collect(),
                });
            }

            let pragma = format!("PRAGMA index_list({})", quoted);
            let index_rows = sqlx::query(&pragma).fetch_all(self.pool).await?;

            for index_row in index_rows {
                let index_name: String = index_row.try_get("name")?;
                let unique: i64 = index_row.try_get("unique")?;
                let origin: String = index_row.try_get("origin")?;

                // Implicit indexes belong to the primary key or to inline constraints
                if origin == "pk" || index_name.starts_with("sqlite_autoindex") {
                    continue;
                }

                let pragma = format!("PRAGMA index_info({})", Dialect::Sqlite.quote(&index_name));
                let mut index_columns: Vec<(i64, String)> = Vec::new();
                for info in sqlx::query(&pragma).fetch_all(self.pool).await? {
                    let seqno: i64 = info.try_get("seqno")?;
                    let name: Option<String> = info.try_get("name")?;
                    if let Some(name) = name {
                        index_columns.push((seqno, name));
                    }
                }
                index_columns.sort();

                table.add_index(Index {
                    name: index_name,
                    columns: index_columns.into_iter().map(|(_, name)| name).collect(),
                    is_unique: unique != 0,
                });
            }
            table.indexes.sort_by(|a, b| a.name.cmp(&b.name));

            tables.insert(table_name, table);
        }

        Ok(tables)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DatabaseConfig;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn sqlite_inspection_reports_columns_keys_and_indexes() {
        let conn = DatabaseConnection::connect(&DatabaseConfig::sqlite_memory())
            .await
            .unwrap();
        conn.execute(
            "CREATE TABLE customer_entity (\
                id INTEGER PRIMARY KEY AUTOINCREMENT, \
                email VARCHAR(255), \
                created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP)",
        )
        .await
        .unwrap();
        conn.execute("CREATE UNIQUE INDEX uq_customer_entity_email ON customer_entity (email)")
            .await
            .unwrap();

        let schema = SchemaInspector::new(conn, None).inspect().await.unwrap();
        let table = schema.table("customer_entity").unwrap();

        assert_eq!(table.column_names(), vec!["id", "email", "created_at"]);
        assert!(table.column("id").unwrap().auto_increment);
        assert!(!table.column("created_at").unwrap().nullable);
        assert_eq!(
            table.column("created_at").unwrap().default.as_deref(),
            Some("CURRENT_TIMESTAMP")
        );
        assert_eq!(
            table.primary_key.as_ref().unwrap().columns,
            vec!["id".to_string()]
        );
        assert_eq!(
            table.indexes,
            vec![Index::unique("uq_customer_entity_email", &["email"])]
        );
        // AUTOINCREMENT creates sqlite_sequence, which is never reported
        assert!(!schema.has_table("sqlite_sequence"));
    }
}
