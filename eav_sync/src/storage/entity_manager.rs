//! Entity manager
//!
//! Full-entity load and save across the entity's own table and the value tables. The entity
//! row and its values are not written atomically; see [`ValueManager::save_entity_values`].

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::db::connection::{DatabaseConnection, Param};
use crate::entity::registry::EntityTypeRegistry;
use crate::entity::types::EntityType;
use crate::error::{Error, Result};
use crate::storage::metadata::AttributeMetadata;
use crate::storage::validation::AttributeValidator;
use crate::storage::value::{parse_datetime, AttributeValue};
use crate::storage::value_manager::{SaveOutcome, SaveReport, ValueManager};

/// One entity: its row identity plus attribute values keyed by attribute code
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: Option<i64>,
    pub entity_type_code: String,
    pub values: BTreeMap<String, AttributeValue>,
    pub created_at: Option<NaiveDateTime>,
    pub updated_at: Option<NaiveDateTime>,
}

impl Entity {
    /// New, unsaved entity
    pub fn new(entity_type_code: &str) -> Self {
        Self {
            id: None,
            entity_type_code: entity_type_code.to_string(),
            values: BTreeMap::new(),
            created_at: None,
            updated_at: None,
        }
    }

    pub fn with(mut self, code: &str, value: impl Into<AttributeValue>) -> Self {
        self.set(code, value);
        self
    }

    pub fn set(&mut self, code: &str, value: impl Into<AttributeValue>) {
        self.values.insert(code.to_string(), value.into());
    }

    pub fn get(&self, code: &str) -> Option<&AttributeValue> {
        self.values.get(code)
    }

    pub fn is_new(&self) -> bool {
        self.id.is_none()
    }
}

pub struct EntityManager {
    connection: DatabaseConnection,
    registry: Arc<EntityTypeRegistry>,
    values: Arc<ValueManager>,
}

impl EntityManager {
    pub fn new(
        connection: DatabaseConnection,
        registry: Arc<EntityTypeRegistry>,
        values: Arc<ValueManager>,
    ) -> Self {
        Self {
            connection,
            registry,
            values,
        }
    }

    /// Load the entity row and all of its attribute values
    pub async fn load_entity(&self, entity_type_code: &str, id: i64) -> Result<Entity> {
        let entity_type = self.registry.get(entity_type_code)?;
        let dialect = self.connection.dialect();

        let mut columns = vec![
            "CAST(created_at AS TEXT)".to_string(),
            "CAST(updated_at AS TEXT)".to_string(),
        ];
        if entity_type.is_flat() {
            columns.extend(
                entity_type
                    .attributes()
                    .iter()
                    .map(|attribute| format!("CAST({} AS TEXT)", dialect.quote(&attribute.code))),
            );
        }
        let sql = format!(
            "SELECT {} FROM {} WHERE id = {}",
            columns.join(", "),
            dialect.quote(&entity_type.entity_table),
            dialect.placeholder(1)
        );

        let row = self
            .connection
            .fetch_text_rows(&sql, &[Param::Int(id)])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| not_found(entity_type_code, id))?;

        let mut row = row.into_iter();
        let mut entity = Entity::new(entity_type_code);
        entity.id = Some(id);
        entity.created_at = row.next().flatten().as_deref().and_then(parse_datetime);
        entity.updated_at = row.next().flatten().as_deref().and_then(parse_datetime);

        if entity_type.is_flat() {
            for (attribute, raw) in entity_type.attributes().iter().zip(row) {
                if let Some(raw) = raw {
                    let value = self.values.strategy(attribute.backend_type)?.decode(&raw)?;
                    entity.values.insert(attribute.code.clone(), value);
                }
            }
        } else {
            let registered = self.configured_metadata(&entity_type).await?;
            let codes: BTreeMap<i64, String> = registered
                .iter()
                .map(|metadata| (metadata.id, metadata.attribute_code.clone()))
                .collect();

            for (attribute_id, value) in self.values.load_entity_values(id, &registered).await? {
                if let Some(code) = codes.get(&attribute_id) {
                    entity.values.insert(code.clone(), value);
                }
            }
        }

        Ok(entity)
    }

    /// Validate and persist an entity. New entities receive their id and timestamps.
    ///
    /// Required and validation failures are raised before anything is written. Value writes
    /// that fail after the row was written are reported per attribute.
    pub async fn save_entity(&self, entity: &mut Entity) -> Result<SaveReport<String>> {
        let entity_type = self.registry.get(&entity.entity_type_code)?;

        if entity.is_new() {
            apply_defaults(&entity_type, &mut entity.values)?;
        }

        let missing: Vec<&str> = entity_type
            .required_attributes()
            .filter(|attribute| entity.get(&attribute.code).map_or(true, AttributeValue::is_null))
            .map(|attribute| attribute.code.as_str())
            .collect();
        if !missing.is_empty() {
            return Err(Error::EntityError(format!(
                "Entity of type '{}' is missing required attribute(s): {}",
                entity_type.code,
                missing.join(", ")
            )));
        }

        let registered = if entity_type.is_flat() {
            BTreeMap::new()
        } else {
            self.values.metadata().by_code(&entity_type.code).await?
        };

        AttributeValidator::new(&self.connection, &self.values)
            .validate(&entity_type, entity.id, &entity.values, &registered)
            .await?;

        if !entity_type.is_flat() {
            if let Some(code) = entity.values.keys().find(|code| !registered.contains_key(*code)) {
                return Err(Error::EntityError(format!(
                    "Attribute '{}' of entity type '{}' is not registered; synchronize the schema first",
                    code, entity_type.code
                )));
            }
        }

        let id = if entity_type.is_flat() {
            self.write_flat_row(&entity_type, entity).await?
        } else {
            self.write_row(&entity_type, entity.id).await?
        };
        entity.id = Some(id);
        self.refresh_timestamps(&entity_type, entity).await?;

        let report = if entity_type.is_flat() {
            let mut report = SaveReport::new(id);
            for code in entity.values.keys() {
                report.outcomes.insert(code.clone(), SaveOutcome::Saved);
            }
            report
        } else {
            let values: BTreeMap<i64, AttributeValue> = entity
                .values
                .iter()
                .filter_map(|(code, value)| registered.get(code).map(|m| (m.id, value.clone())))
                .collect();
            let codes: BTreeMap<i64, String> = registered
                .values()
                .map(|metadata| (metadata.id, metadata.attribute_code.clone()))
                .collect();

            self.values
                .save_entity_values(id, &values)
                .await?
                .map_keys(|attribute_id| {
                    codes
                        .get(&attribute_id)
                        .cloned()
                        .unwrap_or_else(|| attribute_id.to_string())
                })
        };

        tracing::debug!(
            entity_type = %entity_type.code,
            entity_id = id,
            success = report.is_success(),
            "Entity saved"
        );

        Ok(report)
    }

    /// Delete an entity row and its attribute values. Returns false if the row did not exist.
    pub async fn delete_entity(&self, entity_type_code: &str, id: i64) -> Result<bool> {
        let entity_type = self.registry.get(entity_type_code)?;
        let dialect = self.connection.dialect();

        if !entity_type.is_flat() {
            let registered = self.configured_metadata(&entity_type).await?;
            self.values.delete_entity_values(id, &registered).await?;
        }

        let sql = format!(
            "DELETE FROM {} WHERE id = {}",
            dialect.quote(&entity_type.entity_table),
            dialect.placeholder(1)
        );
        let affected = self.connection.execute_with(&sql, &[Param::Int(id)]).await?;
        Ok(affected > 0)
    }

    /// Registered attributes that are still part of the configuration
    async fn configured_metadata(&self, entity_type: &EntityType) -> Result<Vec<AttributeMetadata>> {
        Ok(self
            .values
            .metadata()
            .list_for_entity_type(&entity_type.code)
            .await?
            .into_iter()
            .filter(|metadata| entity_type.attribute(&metadata.attribute_code).is_some())
            .collect())
    }

    async fn write_row(&self, entity_type: &EntityType, id: Option<i64>) -> Result<i64> {
        let dialect = self.connection.dialect();
        let table = dialect.quote(&entity_type.entity_table);

        match id {
            None => {
                let sql = format!(
                    "INSERT INTO {} (created_at, updated_at) \
                     VALUES (CURRENT_TIMESTAMP, CURRENT_TIMESTAMP) RETURNING id",
                    table
                );
                self.connection.fetch_i64(&sql, &[]).await
            }
            Some(id) => {
                let sql = format!(
                    "UPDATE {} SET updated_at = CURRENT_TIMESTAMP WHERE id = {}",
                    table,
                    dialect.placeholder(1)
                );
                if self.connection.execute_with(&sql, &[Param::Int(id)]).await? == 0 {
                    return Err(not_found(&entity_type.code, id));
                }
                Ok(id)
            }
        }
    }

    async fn write_flat_row(&self, entity_type: &EntityType, entity: &Entity) -> Result<i64> {
        let dialect = self.connection.dialect();
        let table = dialect.quote(&entity_type.entity_table);

        let mut columns = Vec::new();
        let mut params = Vec::new();
        for attribute in entity_type.attributes() {
            let Some(value) = entity.get(&attribute.code) else {
                continue;
            };
            let strategy = self.values.strategy(attribute.backend_type)?;
            columns.push((attribute.code.as_str(), strategy.column_type().to_uppercase()));
            params.push(Param::Text(strategy.encode(value)));
        }

        match entity.id {
            None => {
                let mut names = vec!["created_at".to_string(), "updated_at".to_string()];
                let mut placeholders = vec![
                    "CURRENT_TIMESTAMP".to_string(),
                    "CURRENT_TIMESTAMP".to_string(),
                ];
                for (i, (code, sql_type)) in columns.iter().enumerate() {
                    names.push(dialect.quote(code));
                    placeholders.push(dialect.value_param(i + 1, sql_type));
                }
                let sql = format!(
                    "INSERT INTO {} ({}) VALUES ({}) RETURNING id",
                    table,
                    names.join(", "),
                    placeholders.join(", ")
                );
                self.connection.fetch_i64(&sql, &params).await
            }
            Some(id) => {
                let mut assignments = vec!["updated_at = CURRENT_TIMESTAMP".to_string()];
                for (i, (code, sql_type)) in columns.iter().enumerate() {
                    assignments.push(format!(
                        "{} = {}",
                        dialect.quote(code),
                        dialect.value_param(i + 1, sql_type)
                    ));
                }
                let sql = format!(
                    "UPDATE {} SET {} WHERE id = {}",
                    table,
                    assignments.join(", "),
                    dialect.placeholder(params.len() + 1)
                );
                params.push(Param::Int(id));
                if self.connection.execute_with(&sql, &params).await? == 0 {
                    return Err(not_found(&entity_type.code, id));
                }
                Ok(id)
            }
        }
    }

    async fn refresh_timestamps(&self, entity_type: &EntityType, entity: &mut Entity) -> Result<()> {
        let Some(id) = entity.id else {
            return Ok(());
        };
        let dialect = self.connection.dialect();
        let sql = format!(
            "SELECT CAST(created_at AS TEXT), CAST(updated_at AS TEXT) FROM {} WHERE id = {}",
            dialect.quote(&entity_type.entity_table),
            dialect.placeholder(1)
        );

        if let Some(row) = self
            .connection
            .fetch_text_rows(&sql, &[Param::Int(id)])
            .await?
            .into_iter()
            .next()
        {
            let mut row = row.into_iter();
            entity.created_at = row.next().flatten().as_deref().and_then(parse_datetime);
            entity.updated_at = row.next().flatten().as_deref().and_then(parse_datetime);
        }
        Ok(())
    }
}

fn not_found(entity_type_code: &str, id: i64) -> Error {
    Error::EntityError(format!(
        "Entity {} of type '{}' does not exist",
        id, entity_type_code
    ))
}

/// Fill absent attributes of a new entity from their configured defaults
fn apply_defaults(entity_type: &EntityType, values: &mut BTreeMap<String, AttributeValue>) -> Result<()> {
    for attribute in entity_type.attributes() {
        let Some(default) = &attribute.default_value else {
            continue;
        };
        if values.contains_key(&attribute.code) {
            continue;
        }
        let value = AttributeValue::coerce(default, attribute.backend_type).ok_or_else(|| {
            Error::ConfigError(format!(
                "Default value of attribute '{}' is not a valid {} value",
                attribute.code, attribute.backend_type
            ))
        })?;
        values.insert(attribute.code.clone(), value);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::types::{Attribute, BackendType, StorageMode};
    use serde_json::json;

    #[test]
    fn defaults_fill_only_absent_attributes() {
        let mut status = Attribute::new("status", BackendType::Varchar);
        status.default_value = Some(json!("active"));
        let mut score = Attribute::new("score", BackendType::Int);
        score.default_value = Some(json!(10));
        let entity_type = EntityType::new(
            "customer",
            "Customer",
            "customer_entity",
            StorageMode::Eav,
            vec![status, score],
        );

        let mut values = BTreeMap::new();
        values.insert("score".to_string(), AttributeValue::Integer(3));
        apply_defaults(&entity_type, &mut values).unwrap();

        assert_eq!(values["status"], AttributeValue::text("active"));
        assert_eq!(values["score"], AttributeValue::Integer(3));
    }

    #[test]
    fn entity_builder_collects_values() {
        let entity = Entity::new("customer")
            .with("email", "jane@example.com")
            .with("age", 31i64);

        assert!(entity.is_new());
        assert_eq!(entity.get("age"), Some(&AttributeValue::Integer(31)));
    }
}
