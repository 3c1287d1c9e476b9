//! Value manager
//!
//! Routes attribute reads and writes to the storage strategy owning each attribute's backend
//! type. Bulk saves are at-least-effort: every item is attempted and reported, writes that
//! already succeeded are kept when a later one fails.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::config::StorageConfig;
use crate::db::connection::DatabaseConnection;
use crate::entity::types::BackendType;
use crate::error::{Error, Result};
use crate::storage::metadata::{AttributeMetadata, AttributeMetadataManager};
use crate::storage::strategy::{strategy_for, StorageStrategy};
use crate::storage::value::AttributeValue;

/// What happened to one attribute during a bulk save
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", content = "message", rename_all = "snake_case")]
pub enum SaveOutcome {
    Saved,
    /// A null value removed the stored row
    Deleted,
    /// The strategy refused the value
    Rejected(String),
    Failed(String),
    UnknownAttribute,
}

impl SaveOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, SaveOutcome::Saved | SaveOutcome::Deleted)
    }
}

/// Per-item outcomes of a bulk save, keyed by attribute id or code
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SaveReport<K: Ord = i64> {
    pub entity_id: i64,
    pub outcomes: BTreeMap<K, SaveOutcome>,
}

impl<K: Ord> SaveReport<K> {
    pub fn new(entity_id: i64) -> Self {
        Self {
            entity_id,
            outcomes: BTreeMap::new(),
        }
    }

    /// True iff every individual save succeeded
    pub fn is_success(&self) -> bool {
        self.outcomes.values().all(SaveOutcome::is_success)
    }

    pub fn failures(&self) -> impl Iterator<Item = (&K, &SaveOutcome)> {
        self.outcomes.iter().filter(|(_, outcome)| !outcome.is_success())
    }

    /// Re-key the outcomes, e.g. from attribute ids to attribute codes
    pub fn map_keys<T: Ord>(self, mut f: impl FnMut(K) -> T) -> SaveReport<T> {
        SaveReport {
            entity_id: self.entity_id,
            outcomes: self
                .outcomes
                .into_iter()
                .map(|(key, outcome)| (f(key), outcome))
                .collect(),
        }
    }
}

pub struct ValueManager {
    metadata: AttributeMetadataManager,
    strategies: BTreeMap<BackendType, Box<dyn StorageStrategy>>,
}

impl ValueManager {
    pub fn new(connection: DatabaseConnection, config: &StorageConfig) -> Self {
        let strategies = BackendType::all()
            .into_iter()
            .map(|bt| (bt, strategy_for(bt, connection.clone(), config)))
            .collect();

        Self {
            metadata: AttributeMetadataManager::new(connection),
            strategies,
        }
    }

    pub fn metadata(&self) -> &AttributeMetadataManager {
        &self.metadata
    }

    /// Strategy owning a backend type
    pub fn strategy(&self, backend_type: BackendType) -> Result<&dyn StorageStrategy> {
        self.strategies
            .get(&backend_type)
            .map(|strategy| strategy.as_ref())
            .ok_or_else(|| Error::StorageError {
                strategy: backend_type.to_string(),
                message: "no storage strategy registered".to_string(),
                transient: false,
            })
    }

    /// Save one value; a null value deletes the stored row
    pub async fn save_value(&self, entity_id: i64, attribute: &AttributeMetadata, value: &AttributeValue) -> Result<SaveOutcome> {
        let strategy = self.strategy(attribute.backend_type)?;

        if value.is_null() {
            strategy.delete_value(entity_id, attribute.id).await?;
            return Ok(SaveOutcome::Deleted);
        }

        if strategy.save_value(entity_id, attribute.id, value).await? {
            Ok(SaveOutcome::Saved)
        } else {
            Ok(SaveOutcome::Rejected(format!(
                "{} value is not valid for {} attribute '{}'",
                value.type_name(),
                attribute.backend_type,
                attribute.attribute_code
            )))
        }
    }

    pub async fn get_value(&self, entity_id: i64, attribute: &AttributeMetadata) -> Result<Option<AttributeValue>> {
        self.strategy(attribute.backend_type)?
            .get_value(entity_id, attribute.id)
            .await
    }

    /// Save many values of one entity, keyed by attribute id.
    ///
    /// Only a failure to read the attribute catalogue is returned as an error; per-item
    /// failures are collected in the report.
    pub async fn save_entity_values(
        &self,
        entity_id: i64,
        values: &BTreeMap<i64, AttributeValue>,
    ) -> Result<SaveReport> {
        let ids: Vec<i64> = values.keys().copied().collect();
        let attributes = self.metadata.get_many(&ids).await?;
        let mut report = SaveReport::new(entity_id);

        for (attribute_id, value) in values {
            let outcome = match attributes.get(attribute_id) {
                None => SaveOutcome::UnknownAttribute,
                Some(attribute) => match self.save_value(entity_id, attribute, value).await {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        tracing::warn!(
                            entity_id,
                            attribute_id,
                            error = %e,
                            "Attribute value could not be saved"
                        );
                        SaveOutcome::Failed(e.to_string())
                    }
                },
            };
            report.outcomes.insert(*attribute_id, outcome);
        }

        if !report.is_success() {
            tracing::warn!(
                entity_id,
                failed = report.failures().count(),
                "Entity values partially saved"
            );
        }

        Ok(report)
    }

    /// Load the values of the given attributes, one query per backend type
    pub async fn load_entity_values(
        &self,
        entity_id: i64,
        attributes: &[AttributeMetadata],
    ) -> Result<BTreeMap<i64, AttributeValue>> {
        let mut by_backend: BTreeMap<BackendType, Vec<i64>> = BTreeMap::new();
        for attribute in attributes {
            by_backend
                .entry(attribute.backend_type)
                .or_default()
                .push(attribute.id);
        }

        let mut values = BTreeMap::new();
        for (backend_type, ids) in by_backend {
            let loaded = self
                .strategy(backend_type)?
                .get_entity_values(entity_id, &ids)
                .await?;
            values.extend(loaded);
        }
        Ok(values)
    }

    /// Delete every stored value of the given attributes for one entity
    pub async fn delete_entity_values(&self, entity_id: i64, attributes: &[AttributeMetadata]) -> Result<u64> {
        let mut removed = 0;
        for attribute in attributes {
            if self
                .strategy(attribute.backend_type)?
                .delete_value(entity_id, attribute.id)
                .await?
            {
                removed += 1;
            }
        }
        Ok(removed)
    }
}
