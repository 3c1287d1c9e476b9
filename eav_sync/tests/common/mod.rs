//! Shared helpers for the integration tests: an in-memory SQLite database and a temporary
//! entity type directory.

#![allow(dead_code)]

use std::fs;
use std::path::Path;

use tempfile::{tempdir, TempDir};

use eav_sync::config::{
    CacheConfig, Config, DatabaseConfig, EntityTypesConfig, StorageConfig, SyncConfig,
};
use eav_sync::{DatabaseConnection, EavSyncClient, SyncOptions, SyncResult};

pub const CUSTOMER_EAV: &str = r#"
version = 1
label = "Customer"
storage_strategy = "eav"

[[attributes]]
code = "email"
backend_type = "varchar"
is_required = true
is_unique = true

[[attributes]]
code = "date_of_birth"
backend_type = "datetime"
"#;

pub const CUSTOMER_FLAT: &str = r#"
label = "Customer"
storage_strategy = "flat"

[[attributes]]
code = "email"
backend_type = "varchar"
is_unique = true

[[attributes]]
code = "is_verified"
backend_type = "int"
"#;

pub const CUSTOMER_FLAT_WITHOUT_VERIFIED: &str = r#"
label = "Customer"
storage_strategy = "flat"

[[attributes]]
code = "email"
backend_type = "varchar"
is_unique = true
"#;

pub struct TestEnv {
    pub dir: TempDir,
    pub client: EavSyncClient,
}

impl TestEnv {
    pub fn connection(&self) -> &DatabaseConnection {
        self.client.connection()
    }

    /// Replace the configuration of one entity type and make the client pick it up
    pub fn rewrite_entity_type(&self, code: &str, contents: &str) {
        write_entity_type(self.dir.path(), code, contents);
        self.client.reload_configuration().unwrap();
    }

    pub async fn sync(&self, code: &str, options: SyncOptions) -> SyncResult {
        self.client.sync(code, &options).await
    }

    /// Names of every table in the database, sorted
    pub async fn tables(&self) -> Vec<String> {
        self.connection()
            .fetch_text_rows(
                "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
                &[],
            )
            .await
            .unwrap()
            .into_iter()
            .filter_map(|row| row.into_iter().next().flatten())
            .collect()
    }

    /// Column names of one table, in definition order
    pub async fn columns(&self, table: &str) -> Vec<String> {
        self.connection()
            .fetch_text_rows(&format!("SELECT name FROM pragma_table_info('{}')", table), &[])
            .await
            .unwrap()
            .into_iter()
            .filter_map(|row| row.into_iter().next().flatten())
            .collect()
    }

    pub async fn count(&self, sql: &str) -> i64 {
        self.connection().fetch_i64(sql, &[]).await.unwrap()
    }
}

pub fn write_entity_type(dir: &Path, code: &str, contents: &str) {
    fs::write(dir.join(format!("{}.toml", code)), contents).unwrap();
}

pub fn config(dir: &Path) -> Config {
    Config {
        database: DatabaseConfig::sqlite_memory(),
        entity_types: EntityTypesConfig {
            directory: dir.to_string_lossy().to_string(),
        },
        sync: SyncConfig::default(),
        storage: StorageConfig::default(),
        cache: CacheConfig::default(),
        logging: None,
    }
}

/// Fresh database plus one configuration file per `(code, contents)` pair
pub async fn setup(entity_types: &[(&str, &str)]) -> TestEnv {
    let dir = tempdir().unwrap();
    for (code, contents) in entity_types {
        write_entity_type(dir.path(), code, contents);
    }
    let client = EavSyncClient::new(config(dir.path())).await.unwrap();
    TestEnv { dir, client }
}
