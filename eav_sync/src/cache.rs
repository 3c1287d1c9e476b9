//! Process-local cache for configuration and schema-analysis results
//!
//! Entries are stored as JSON values so one driver can hold any serializable type. Keys are
//! namespaced as `<prefix>:<entity type code>:<kind>`.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::config::CacheConfig;

/// What a cache entry holds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheKind {
    Config,
    SchemaAnalysis,
}

impl CacheKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheKind::Config => "config",
            CacheKind::SchemaAnalysis => "schema-analysis",
        }
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    value: serde_json::Value,
    expires_at: Option<Instant>,
}

impl CacheEntry {
    fn is_expired(&self) -> bool {
        self.expires_at.map_or(false, |at| Instant::now() >= at)
    }
}

/// Concurrency-safe TTL cache shared by the registry and the analyzer
#[derive(Debug)]
pub struct CacheDriver {
    entries: DashMap<String, CacheEntry>,
    enabled: bool,
    prefix: String,
    config_ttl: Duration,
    analysis_ttl: Duration,
}

impl CacheDriver {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            entries: DashMap::new(),
            enabled: config.enabled,
            prefix: config.prefix.clone(),
            config_ttl: Duration::from_secs(config.config_ttl_seconds),
            analysis_ttl: Duration::from_secs(config.schema_analysis_ttl_seconds),
        }
    }

    /// Cache that never stores anything
    pub fn disabled() -> Self {
        Self::new(&CacheConfig {
            enabled: false,
            ..CacheConfig::default()
        })
    }

    pub fn key(&self, entity_type_code: &str, kind: CacheKind) -> String {
        format!("{}:{}:{}", self.prefix, entity_type_code, kind.as_str())
    }

    pub fn ttl(&self, kind: CacheKind) -> Duration {
        match kind {
            CacheKind::Config => self.config_ttl,
            CacheKind::SchemaAnalysis => self.analysis_ttl,
        }
    }

    /// Fetch a live entry; expired or undecodable entries are dropped
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        if !self.enabled {
            return None;
        }

        let expired = match self.entries.get(key) {
            Some(entry) if !entry.is_expired() => {
                return serde_json::from_value(entry.value.clone()).ok();
            }
            Some(_) => true,
            None => false,
        };

        if expired {
            self.entries.remove(key);
        }
        None
    }

    /// Store a value; a zero `ttl` means the entry never expires
    pub fn put<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) {
        if !self.enabled {
            return;
        }

        match serde_json::to_value(value) {
            Ok(value) => {
                let expires_at = (!ttl.is_zero()).then(|| Instant::now() + ttl);
                self.entries
                    .insert(key.to_string(), CacheEntry { value, expires_at });
            }
            Err(e) => tracing::warn!(key, error = %e, "Value could not be cached"),
        }
    }

    pub fn get_kind<T: DeserializeOwned>(&self, entity_type_code: &str, kind: CacheKind) -> Option<T> {
        self.get(&self.key(entity_type_code, kind))
    }

    pub fn put_kind<T: Serialize>(&self, entity_type_code: &str, kind: CacheKind, value: &T) {
        self.put(&self.key(entity_type_code, kind), value, self.ttl(kind));
    }

    pub fn forget(&self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    pub fn forget_kind(&self, entity_type_code: &str, kind: CacheKind) -> bool {
        self.forget(&self.key(entity_type_code, kind))
    }

    /// Drop every entry belonging to one entity type
    pub fn forget_entity_type(&self, entity_type_code: &str) {
        let namespace = format!("{}:{}:", self.prefix, entity_type_code);
        self.entries.retain(|key, _| !key.starts_with(&namespace));
    }

    pub fn flush(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    fn cache() -> CacheDriver {
        CacheDriver::new(&CacheConfig::default())
    }

    #[test]
    fn keys_are_namespaced_by_prefix_code_and_kind() {
        let cache = cache();
        assert_eq!(cache.key("customer", CacheKind::Config), "eav:customer:config");
        assert_eq!(
            cache.key("customer", CacheKind::SchemaAnalysis),
            "eav:customer:schema-analysis"
        );
    }

    #[test]
    fn entries_expire_after_ttl() {
        let cache = cache();
        cache.put("short", &42u32, Duration::from_millis(20));
        cache.put("forever", &"kept", Duration::ZERO);

        assert_eq!(cache.get::<u32>("short"), Some(42));
        sleep(Duration::from_millis(40));
        assert_eq!(cache.get::<u32>("short"), None);
        assert_eq!(cache.get::<String>("forever").as_deref(), Some("kept"));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn forgetting_an_entity_type_leaves_others() {
        let cache = cache();
        cache.put_kind("customer", CacheKind::Config, &1);
        cache.put_kind("customer", CacheKind::SchemaAnalysis, &2);
        cache.put_kind("product", CacheKind::Config, &3);

        cache.forget_entity_type("customer");

        assert_eq!(cache.get_kind::<i32>("customer", CacheKind::Config), None);
        assert_eq!(cache.get_kind::<i32>("product", CacheKind::Config), Some(3));
    }

    #[test]
    fn disabled_cache_stores_nothing() {
        let cache = CacheDriver::disabled();
        cache.put("key", &1, Duration::ZERO);
        assert!(cache.is_empty());
        assert_eq!(cache.get::<i32>("key"), None);
    }
}
