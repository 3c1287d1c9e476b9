//! Storage strategies
//!
//! One strategy per backend type. Each validates, encodes and decodes scalar values and owns
//! one shared value table (`eav_values_<type>`) with a unique key on
//! `(entity_id, attribute_id)`.

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::config::StorageConfig;
use crate::db::connection::DatabaseConnection;
use crate::entity::types::BackendType;
use crate::error::{Error, Result};
use crate::storage::value::{parse_datetime, AttributeValue};
use crate::utils::naming::value_table_name;
use crate::with_pool;

/// Encode/decode/validate capability set for one backend type, plus its table operations
#[async_trait]
pub trait StorageStrategy: Send + Sync {
    fn backend_type(&self) -> BackendType;

    fn connection(&self) -> &DatabaseConnection;

    /// Canonical column type of the `value` column
    fn column_type(&self) -> String;

    fn validate_value(&self, value: &AttributeValue) -> bool;

    /// Storage representation; `None` when the value is not valid for this strategy
    fn encode(&self, value: &AttributeValue) -> Option<String>;

    fn decode(&self, raw: &str) -> Result<AttributeValue>;

    fn name(&self) -> &'static str {
        self.backend_type().as_str()
    }

    fn table_name(&self) -> String {
        value_table_name(self.backend_type())
    }

    /// Upsert a value. Returns `Ok(false)` without touching the table when validation fails.
    async fn save_value(
        &self,
        entity_id: i64,
        attribute_id: i64,
        value: &AttributeValue,
    ) -> Result<bool> {
        let encoded = match self.encode(value) {
            Some(encoded) if self.validate_value(value) => encoded,
            _ => {
                tracing::debug!(
                    strategy = self.name(),
                    entity_id,
                    attribute_id,
                    value_type = value.type_name(),
                    "Value rejected by storage strategy"
                );
                return Ok(false);
            }
        };

        let dialect = self.connection().dialect();
        // Single statement upsert: concurrent writers to the same pair cannot create duplicates.
        let sql = format!(
            "INSERT INTO {} (entity_id, attribute_id, value) VALUES ({}, {}, {}) \
             ON CONFLICT (entity_id, attribute_id) DO UPDATE SET value = excluded.value",
            dialect.quote(&self.table_name()),
            dialect.placeholder(1),
            dialect.placeholder(2),
            dialect.value_param(3, &self.column_type().to_uppercase()),
        );

        with_pool!(self.connection(), pool => sqlx::query(&sql)
            .bind(entity_id)
            .bind(attribute_id)
            .bind(encoded.as_str())
            .execute(pool)
            .await
            .map(|_| ()))
        .map_err(|e| Error::storage(self.name(), e))?;

        Ok(true)
    }

    async fn get_value(&self, entity_id: i64, attribute_id: i64) -> Result<Option<AttributeValue>> {
        let dialect = self.connection().dialect();
        let sql = format!(
            "SELECT CAST(value AS TEXT) FROM {} WHERE entity_id = {} AND attribute_id = {}",
            dialect.quote(&self.table_name()),
            dialect.placeholder(1),
            dialect.placeholder(2),
        );

        let row = with_pool!(self.connection(), pool => sqlx::query_as::<_, (Option<String>,)>(&sql)
            .bind(entity_id)
            .bind(attribute_id)
            .fetch_optional(pool)
            .await)
        .map_err(|e| Error::storage(self.name(), e))?;

        match row {
            Some((Some(raw),)) => self.decode(&raw).map(Some),
            Some((None,)) => Ok(Some(AttributeValue::Null)),
            None => Ok(None),
        }
    }

    /// Bulk read of one entity's values, optionally restricted to `attribute_ids`
    async fn get_entity_values(
        &self,
        entity_id: i64,
        attribute_ids: &[i64],
    ) -> Result<BTreeMap<i64, AttributeValue>> {
        let dialect = self.connection().dialect();
        let mut sql = format!(
            "SELECT attribute_id, CAST(value AS TEXT) FROM {} WHERE entity_id = {}",
            dialect.quote(&self.table_name()),
            dialect.placeholder(1),
        );
        if !attribute_ids.is_empty() {
            let placeholders: Vec<String> = (0..attribute_ids.len())
                .map(|i| dialect.placeholder(i + 2))
                .collect();
            sql.push_str(&format!(" AND attribute_id IN ({})", placeholders.join(", ")));
        }

        let rows = with_pool!(self.connection(), pool => {
            let mut query = sqlx::query_as::<_, (i64, Option<String>)>(&sql).bind(entity_id);
            for attribute_id in attribute_ids {
                query = query.bind(*attribute_id);
            }
            query.fetch_all(pool).await
        })
        .map_err(|e| Error::storage(self.name(), e))?;

        let mut values = BTreeMap::new();
        for (attribute_id, raw) in rows {
            let value = match raw {
                Some(raw) => self.decode(&raw)?,
                None => AttributeValue::Null,
            };
            values.insert(attribute_id, value);
        }
        Ok(values)
    }

    /// Returns true iff a row was removed
    async fn delete_value(&self, entity_id: i64, attribute_id: i64) -> Result<bool> {
        let dialect = self.connection().dialect();
        let sql = format!(
            "DELETE FROM {} WHERE entity_id = {} AND attribute_id = {}",
            dialect.quote(&self.table_name()),
            dialect.placeholder(1),
            dialect.placeholder(2),
        );

        let affected = with_pool!(self.connection(), pool => sqlx::query(&sql)
            .bind(entity_id)
            .bind(attribute_id)
            .execute(pool)
            .await
            .map(|result| result.rows_affected()))
        .map_err(|e| Error::storage(self.name(), e))?;

        Ok(affected > 0)
    }
}

fn decode_error(strategy: &str, raw: &str, expected: &str) -> Error {
    Error::StorageError {
        strategy: strategy.to_string(),
        message: format!("cannot decode stored value '{}' as {}", raw, expected),
        transient: false,
    }
}

/// Short strings, bounded by a configurable maximum length
pub struct VarcharStrategy {
    connection: DatabaseConnection,
    max_length: usize,
}

impl VarcharStrategy {
    pub fn new(connection: DatabaseConnection, max_length: usize) -> Self {
        Self {
            connection,
            max_length,
        }
    }

    pub fn max_length(&self) -> usize {
        self.max_length
    }
}

#[async_trait]
impl StorageStrategy for VarcharStrategy {
    fn backend_type(&self) -> BackendType {
        BackendType::Varchar
    }

    fn connection(&self) -> &DatabaseConnection {
        &self.connection
    }

    fn column_type(&self) -> String {
        BackendType::Varchar.column_type(self.max_length)
    }

    fn validate_value(&self, value: &AttributeValue) -> bool {
        match value {
            AttributeValue::Text(text) => text.chars().count() <= self.max_length,
            _ => false,
        }
    }

    fn encode(&self, value: &AttributeValue) -> Option<String> {
        value.as_str().map(str::to_string)
    }

    fn decode(&self, raw: &str) -> Result<AttributeValue> {
        Ok(AttributeValue::text(raw))
    }
}

/// Unbounded strings
pub struct TextStrategy {
    connection: DatabaseConnection,
}

impl TextStrategy {
    pub fn new(connection: DatabaseConnection) -> Self {
        Self { connection }
    }
}

#[async_trait]
impl StorageStrategy for TextStrategy {
    fn backend_type(&self) -> BackendType {
        BackendType::Text
    }

    fn connection(&self) -> &DatabaseConnection {
        &self.connection
    }

    fn column_type(&self) -> String {
        BackendType::Text.column_type(0)
    }

    fn validate_value(&self, value: &AttributeValue) -> bool {
        matches!(value, AttributeValue::Text(_))
    }

    fn encode(&self, value: &AttributeValue) -> Option<String> {
        value.as_str().map(str::to_string)
    }

    fn decode(&self, raw: &str) -> Result<AttributeValue> {
        Ok(AttributeValue::text(raw))
    }
}

/// 64-bit integers
pub struct IntStrategy {
    connection: DatabaseConnection,
}

impl IntStrategy {
    pub fn new(connection: DatabaseConnection) -> Self {
        Self { connection }
    }
}

#[async_trait]
impl StorageStrategy for IntStrategy {
    fn backend_type(&self) -> BackendType {
        BackendType::Int
    }

    fn connection(&self) -> &DatabaseConnection {
        &self.connection
    }

    fn column_type(&self) -> String {
        BackendType::Int.column_type(0)
    }

    fn validate_value(&self, value: &AttributeValue) -> bool {
        matches!(value, AttributeValue::Integer(_))
    }

    fn encode(&self, value: &AttributeValue) -> Option<String> {
        value.as_i64().map(|v| v.to_string())
    }

    fn decode(&self, raw: &str) -> Result<AttributeValue> {
        raw.trim()
            .parse::<i64>()
            .map(AttributeValue::Integer)
            .map_err(|_| decode_error(self.name(), raw, "integer"))
    }
}

/// Finite floating point numbers stored in a fixed-scale decimal column
pub struct DecimalStrategy {
    connection: DatabaseConnection,
}

/// Integer digits allowed by `decimal(20,6)`
const DECIMAL_LIMIT: f64 = 1e14;
/// Fractional digits kept by `decimal(20,6)`
const DECIMAL_SCALE: usize = 6;
/// Digits a double carries through a text round trip
const DECIMAL_SIGNIFICANT_DIGITS: usize = 15;

impl DecimalStrategy {
    pub fn new(connection: DatabaseConnection) -> Self {
        Self { connection }
    }

    /// The value as the column will hand it back, or `None` when it does not fit the column.
    ///
    /// A value is storable only if `normalize(v) == Some(v)`: anything that would be rounded
    /// or truncated by the column is refused instead of silently altered.
    pub fn normalize(value: f64) -> Option<f64> {
        if !value.is_finite() || value.abs() >= DECIMAL_LIMIT {
            return None;
        }
        let fixed = Self::fixed(value);
        let digits: String = fixed.chars().filter(|c| c.is_ascii_digit()).collect();
        let significant = digits.trim_start_matches('0').trim_end_matches('0').len();
        if significant > DECIMAL_SIGNIFICANT_DIGITS {
            return None;
        }
        fixed.parse().ok()
    }

    fn fixed(value: f64) -> String {
        format!("{:.*}", DECIMAL_SCALE, value)
    }
}

#[async_trait]
impl StorageStrategy for DecimalStrategy {
    fn backend_type(&self) -> BackendType {
        BackendType::Decimal
    }

    fn connection(&self) -> &DatabaseConnection {
        &self.connection
    }

    fn column_type(&self) -> String {
        BackendType::Decimal.column_type(0)
    }

    fn validate_value(&self, value: &AttributeValue) -> bool {
        matches!(value, AttributeValue::Decimal(v) if Self::normalize(*v) == Some(*v))
    }

    fn encode(&self, value: &AttributeValue) -> Option<String> {
        match value {
            AttributeValue::Decimal(v) if self.validate_value(value) => Some(Self::fixed(*v)),
            _ => None,
        }
    }

    fn decode(&self, raw: &str) -> Result<AttributeValue> {
        raw.trim()
            .parse::<f64>()
            .map(AttributeValue::Decimal)
            .map_err(|_| decode_error(self.name(), raw, "decimal"))
    }
}

/// Timestamps without time zone
pub struct DatetimeStrategy {
    connection: DatabaseConnection,
}

impl DatetimeStrategy {
    pub fn new(connection: DatabaseConnection) -> Self {
        Self { connection }
    }
}

#[async_trait]
impl StorageStrategy for DatetimeStrategy {
    fn backend_type(&self) -> BackendType {
        BackendType::Datetime
    }

    fn connection(&self) -> &DatabaseConnection {
        &self.connection
    }

    fn column_type(&self) -> String {
        BackendType::Datetime.column_type(0)
    }

    fn validate_value(&self, value: &AttributeValue) -> bool {
        matches!(value, AttributeValue::DateTime(_))
    }

    fn encode(&self, value: &AttributeValue) -> Option<String> {
        match value {
            AttributeValue::DateTime(v) => Some(v.format("%Y-%m-%d %H:%M:%S%.f").to_string()),
            _ => None,
        }
    }

    fn decode(&self, raw: &str) -> Result<AttributeValue> {
        parse_datetime(raw)
            .map(AttributeValue::DateTime)
            .ok_or_else(|| decode_error(self.name(), raw, "datetime"))
    }
}

/// Build the strategy owning `backend_type`
pub fn strategy_for(
    backend_type: BackendType,
    connection: DatabaseConnection,
    config: &StorageConfig,
) -> Box<dyn StorageStrategy> {
    match backend_type {
        BackendType::Varchar => Box::new(VarcharStrategy::new(connection, config.varchar_max_length)),
        BackendType::Text => Box::new(TextStrategy::new(connection)),
        BackendType::Int => Box::new(IntStrategy::new(connection)),
        BackendType::Decimal => Box::new(DecimalStrategy::new(connection)),
        BackendType::Datetime => Box::new(DatetimeStrategy::new(connection)),
    }
}
