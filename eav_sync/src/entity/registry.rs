//! Entity type registry
//!
//! Wraps a [`ConfigLoader`] with lazy, memoized resolution backed by the shared cache.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::cache::{CacheDriver, CacheKind};
use crate::entity::loader::ConfigLoader;
use crate::entity::types::EntityType;
use crate::error::{Error, Result};

/// Registry of entity types, loaded on demand
pub struct EntityTypeRegistry {
    loader: ConfigLoader,
    cache: Arc<CacheDriver>,
    initialized: AtomicBool,
}

impl EntityTypeRegistry {
    pub fn new(loader: ConfigLoader, cache: Arc<CacheDriver>) -> Self {
        Self {
            loader,
            cache,
            initialized: AtomicBool::new(false),
        }
    }

    /// Eagerly load every entity type. A second call is a no-op once populated.
    pub fn initialize(&self) -> Result<usize> {
        if self.initialized.load(Ordering::Acquire) {
            return Ok(0);
        }

        let entity_types = self.loader.load_all()?;
        for entity_type in &entity_types {
            self.cache
                .put_kind(&entity_type.code, CacheKind::Config, entity_type);
        }

        self.initialized.store(true, Ordering::Release);
        tracing::info!(count = entity_types.len(), "Entity type registry initialized");
        Ok(entity_types.len())
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// Resolve an entity type, loading it on demand
    pub fn get(&self, code: &str) -> Result<EntityType> {
        if let Some(entity_type) = self.cache.get_kind::<EntityType>(code, CacheKind::Config) {
            return Ok(entity_type);
        }

        if !self.loader.exists(code) {
            return Err(Error::ConfigError(format!("Unknown entity type '{}'", code)));
        }

        let entity_type = self.loader.load(code)?;
        self.cache.put_kind(code, CacheKind::Config, &entity_type);
        Ok(entity_type)
    }

    /// Whether `code` resolves to an entity type; never fails
    pub fn has(&self, code: &str) -> bool {
        self.cache.get_kind::<EntityType>(code, CacheKind::Config).is_some() || self.loader.exists(code)
    }

    /// Codes of every configured entity type
    pub fn codes(&self) -> Result<Vec<String>> {
        self.loader.codes()
    }

    /// Drop the cached configuration of one entity type so the next `get` re-reads the file
    pub fn invalidate(&self, code: &str) {
        self.cache.forget_entity_type(code);
    }

    /// Drop everything and reload from disk
    pub fn reload(&self) -> Result<usize> {
        for code in self.loader.codes()? {
            self.cache.forget_entity_type(&code);
        }
        self.initialized.store(false, Ordering::Release);
        self.initialize()
    }

    pub fn loader(&self) -> &ConfigLoader {
        &self.loader
    }
}
