//! eav_sync: data-driven entity types with polymorphic value storage
//!
//! Entity types are declared in configuration files instead of fixed table schemas. Attribute
//! values live in one shared table per backend type (or in columns of the entity table in flat
//! mode), and the synchronization engine keeps the physical schema in line with configuration,
//! with dry runs, backups and restore.

pub mod cache;
pub mod config;
pub mod db;
pub mod entity;
pub mod error;
pub mod schema;
pub mod storage;
pub mod sync;
pub mod utils;

use std::sync::Arc;

// Re-export main types for easier access
pub use cache::CacheDriver;
pub use config::Config;
pub use db::connection::DatabaseConnection;
pub use entity::{Attribute, BackendType, ConfigLoader, EntityType, EntityTypeRegistry, StorageMode};
pub use error::{Error, Result};
pub use schema::analyzer::{SchemaAnalysis, SchemaAnalyzer};
pub use schema::diff::SchemaAnalysisReport;
pub use schema::generator::MigrationGenerator;
pub use storage::{AttributeValue, Entity, EntityManager, ValueManager};
pub use sync::{RestoreOptions, RestoreResult, SyncOptions, SyncResult, SyncStrategy, SynchronizationEngine};

/// Initialize the engine with the specified configuration file
pub async fn init(config_path: &str) -> Result<EavSyncClient> {
    let config = config::load_from_file(config_path)?;
    EavSyncClient::new(config).await
}

/// The main client: one connection, one cache and one registry shared by the storage and
/// synchronization components
pub struct EavSyncClient {
    config: Config,
    connection: DatabaseConnection,
    cache: Arc<CacheDriver>,
    registry: Arc<EntityTypeRegistry>,
    values: Arc<ValueManager>,
    entities: EntityManager,
    engine: SynchronizationEngine,
}

impl EavSyncClient {
    /// Create a new client from configuration
    pub async fn new(config: Config) -> Result<Self> {
        let connection = DatabaseConnection::connect(&config.database).await?;
        Ok(Self::with_connection(config, connection))
    }

    /// Create a client on an already established connection
    pub fn with_connection(config: Config, connection: DatabaseConnection) -> Self {
        let cache = Arc::new(CacheDriver::new(&config.cache));
        let registry = Arc::new(EntityTypeRegistry::new(
            ConfigLoader::new(&config.entity_types.directory),
            Arc::clone(&cache),
        ));
        let values = Arc::new(ValueManager::new(connection.clone(), &config.storage));
        let entities = EntityManager::new(connection.clone(), Arc::clone(&registry), Arc::clone(&values));
        let engine = SynchronizationEngine::new(
            connection.clone(),
            &config,
            Arc::clone(&registry),
            Arc::clone(&cache),
        );

        Self {
            config,
            connection,
            cache,
            registry,
            values,
            entities,
            engine,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn connection(&self) -> &DatabaseConnection {
        &self.connection
    }

    pub fn cache(&self) -> &CacheDriver {
        &self.cache
    }

    pub fn registry(&self) -> &EntityTypeRegistry {
        &self.registry
    }

    pub fn values(&self) -> &ValueManager {
        &self.values
    }

    pub fn entities(&self) -> &EntityManager {
        &self.entities
    }

    pub fn engine(&self) -> &SynchronizationEngine {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut SynchronizationEngine {
        &mut self.engine
    }

    /// Sync options seeded from the `[sync]` configuration section
    pub fn default_sync_options(&self) -> Result<SyncOptions> {
        SyncOptions::from_config(&self.config.sync)
    }

    /// Analyze the schema of one entity type
    pub async fn analyze(&self, entity_type_code: &str) -> Result<SchemaAnalysisReport> {
        let strategy = self.default_sync_options()?.strategy;
        Ok(self.engine.analyze(entity_type_code, strategy).await?.report)
    }

    /// Synchronize one entity type
    pub async fn sync(&self, entity_type_code: &str, options: &SyncOptions) -> SyncResult {
        self.engine.sync(entity_type_code, options).await
    }

    /// Synchronize every configured entity type, in code order
    pub async fn sync_all(&self, options: &SyncOptions) -> Result<Vec<SyncResult>> {
        let mut results = Vec::new();
        for code in self.registry.codes()? {
            results.push(self.engine.sync(&code, options).await);
        }
        Ok(results)
    }

    /// Restore a backup
    pub async fn restore(&self, backup_id: i64, options: &RestoreOptions) -> RestoreResult {
        self.engine.restore(backup_id, options).await
    }

    /// Re-read entity type configuration and drop cached analyses
    pub fn reload_configuration(&self) -> Result<usize> {
        self.registry.reload()
    }
}
