//! Attribute metadata store
//!
//! `eav_attributes` maps `(entity_type_code, attribute_code)` to the numeric attribute id used
//! in the value tables, together with the backend type that owns the values.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::db::connection::{DatabaseConnection, Param};
use crate::entity::types::{Attribute, BackendType};
use crate::error::{Error, Result};
use crate::utils::naming::ATTRIBUTE_TABLE;

/// One registered attribute
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeMetadata {
    pub id: i64,
    pub entity_type_code: String,
    pub attribute_code: String,
    pub backend_type: BackendType,
    pub label: String,
}

const COLUMNS: &str =
    "CAST(id AS TEXT), entity_type_code, attribute_code, backend_type, label";

/// Reads and writes the attribute catalogue
#[derive(Debug, Clone)]
pub struct AttributeMetadataManager {
    connection: DatabaseConnection,
}

impl AttributeMetadataManager {
    pub fn new(connection: DatabaseConnection) -> Self {
        Self { connection }
    }

    /// Every attribute registered for an entity type, in registration order
    pub async fn list_for_entity_type(&self, entity_type_code: &str) -> Result<Vec<AttributeMetadata>> {
        let dialect = self.connection.dialect();
        let sql = format!(
            "SELECT {} FROM {} WHERE entity_type_code = {} ORDER BY id",
            COLUMNS,
            ATTRIBUTE_TABLE,
            dialect.placeholder(1)
        );
        let rows = self
            .connection
            .fetch_text_rows(&sql, &[entity_type_code.into()])
            .await?;

        rows.into_iter().map(parse_row).collect()
    }

    /// Attributes of an entity type keyed by attribute code
    pub async fn by_code(&self, entity_type_code: &str) -> Result<BTreeMap<String, AttributeMetadata>> {
        Ok(self
            .list_for_entity_type(entity_type_code)
            .await?
            .into_iter()
            .map(|metadata| (metadata.attribute_code.clone(), metadata))
            .collect())
    }

    pub async fn find(&self, entity_type_code: &str, attribute_code: &str) -> Result<Option<AttributeMetadata>> {
        let dialect = self.connection.dialect();
        let sql = format!(
            "SELECT {} FROM {} WHERE entity_type_code = {} AND attribute_code = {}",
            COLUMNS,
            ATTRIBUTE_TABLE,
            dialect.placeholder(1),
            dialect.placeholder(2)
        );
        let rows = self
            .connection
            .fetch_text_rows(&sql, &[entity_type_code.into(), attribute_code.into()])
            .await?;

        rows.into_iter().next().map(parse_row).transpose()
    }

    pub async fn get(&self, id: i64) -> Result<Option<AttributeMetadata>> {
        let dialect = self.connection.dialect();
        let sql = format!(
            "SELECT {} FROM {} WHERE id = {}",
            COLUMNS,
            ATTRIBUTE_TABLE,
            dialect.placeholder(1)
        );
        let rows = self.connection.fetch_text_rows(&sql, &[Param::Int(id)]).await?;

        rows.into_iter().next().map(parse_row).transpose()
    }

    /// Look up several attributes by id; unknown ids are absent from the result
    pub async fn get_many(&self, ids: &[i64]) -> Result<BTreeMap<i64, AttributeMetadata>> {
        if ids.is_empty() {
            return Ok(BTreeMap::new());
        }

        let dialect = self.connection.dialect();
        let placeholders: Vec<String> = (1..=ids.len()).map(|i| dialect.placeholder(i)).collect();
        let sql = format!(
            "SELECT {} FROM {} WHERE id IN ({})",
            COLUMNS,
            ATTRIBUTE_TABLE,
            placeholders.join(", ")
        );
        let params: Vec<Param> = ids.iter().map(|id| Param::Int(*id)).collect();
        let rows = self.connection.fetch_text_rows(&sql, &params).await?;

        rows.into_iter()
            .map(|row| parse_row(row).map(|metadata| (metadata.id, metadata)))
            .collect()
    }

    /// Insert or update an attribute registration, returning its id
    pub async fn register(&self, entity_type_code: &str, attribute: &Attribute) -> Result<AttributeMetadata> {
        let dialect = self.connection.dialect();
        let sql = format!(
            "INSERT INTO {} (entity_type_code, attribute_code, backend_type, label) \
             VALUES ({}, {}, {}, {}) \
             ON CONFLICT (entity_type_code, attribute_code) \
             DO UPDATE SET backend_type = excluded.backend_type, label = excluded.label \
             RETURNING id",
            ATTRIBUTE_TABLE,
            dialect.placeholder(1),
            dialect.placeholder(2),
            dialect.placeholder(3),
            dialect.placeholder(4),
        );
        let id = self
            .connection
            .fetch_i64(
                &sql,
                &[
                    entity_type_code.into(),
                    attribute.code.as_str().into(),
                    attribute.backend_type.as_str().into(),
                    attribute.label.as_str().into(),
                ],
            )
            .await?;

        tracing::debug!(
            entity_type = entity_type_code,
            attribute = %attribute.code,
            id,
            "Attribute registered"
        );

        Ok(AttributeMetadata {
            id,
            entity_type_code: entity_type_code.to_string(),
            attribute_code: attribute.code.clone(),
            backend_type: attribute.backend_type,
            label: attribute.label.clone(),
        })
    }

    /// Remove a registration. Values stored under the attribute are left to the caller.
    pub async fn remove(&self, entity_type_code: &str, attribute_code: &str) -> Result<bool> {
        let dialect = self.connection.dialect();
        let sql = format!(
            "DELETE FROM {} WHERE entity_type_code = {} AND attribute_code = {}",
            ATTRIBUTE_TABLE,
            dialect.placeholder(1),
            dialect.placeholder(2)
        );
        let affected = self
            .connection
            .execute_with(&sql, &[entity_type_code.into(), attribute_code.into()])
            .await?;
        Ok(affected > 0)
    }
}

fn parse_row(row: Vec<Option<String>>) -> Result<AttributeMetadata> {
    let mut columns = row.into_iter();
    let mut next = || columns.next().flatten().unwrap_or_default();

    let id = next();
    let entity_type_code = next();
    let attribute_code = next();
    let backend_type = next();
    let label = next();

    let id = id
        .parse()
        .map_err(|_| Error::DatabaseError(format!("Invalid attribute id '{}'", id)))?;
    let backend_type = BackendType::parse(&backend_type).ok_or_else(|| {
        Error::DatabaseError(format!(
            "Attribute '{}' of '{}' has unknown backend type '{}'",
            attribute_code, entity_type_code, backend_type
        ))
    })?;

    Ok(AttributeMetadata {
        id,
        entity_type_code,
        attribute_code,
        backend_type,
        label,
    })
}
