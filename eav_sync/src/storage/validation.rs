//! Attribute validation
//!
//! Runs before any write of an entity: value type through the owning strategy, configured
//! `validation_rules`, and uniqueness of `is_unique` attributes. Storage strategies never check
//! uniqueness themselves.

use std::collections::BTreeMap;

use regex::Regex;

use crate::db::connection::{DatabaseConnection, Param};
use crate::entity::types::{Attribute, BackendType, EntityType, ValidationRules};
use crate::error::{Error, FieldErrors, Result};
use crate::storage::metadata::AttributeMetadata;
use crate::storage::strategy::StorageStrategy;
use crate::storage::value::AttributeValue;
use crate::storage::value_manager::ValueManager;

pub struct AttributeValidator<'a> {
    connection: &'a DatabaseConnection,
    values: &'a ValueManager,
}

impl<'a> AttributeValidator<'a> {
    pub fn new(connection: &'a DatabaseConnection, values: &'a ValueManager) -> Self {
        Self { connection, values }
    }

    /// Validate `values` of one entity. `entity_id` is excluded from uniqueness lookups;
    /// `registered` is only consulted for entity types stored in EAV mode.
    pub async fn validate(
        &self,
        entity_type: &EntityType,
        entity_id: Option<i64>,
        values: &BTreeMap<String, AttributeValue>,
        registered: &BTreeMap<String, AttributeMetadata>,
    ) -> Result<()> {
        let mut errors = FieldErrors::new();

        for (code, value) in values {
            let Some(attribute) = entity_type.attribute(code) else {
                push(&mut errors, code, "is not an attribute of this entity type".to_string());
                continue;
            };
            if value.is_null() {
                continue;
            }

            let strategy = self.values.strategy(attribute.backend_type)?;
            if !strategy.validate_value(value) {
                push(&mut errors, code, type_message(attribute, value, strategy));
                continue;
            }

            if let Some(rules) = &attribute.validation_rules {
                for message in check_rules(rules, value)? {
                    push(&mut errors, code, message);
                }
            }

            if attribute.is_unique
                && self
                    .is_taken(entity_type, attribute, strategy, entity_id, value, registered)
                    .await?
            {
                push(&mut errors, code, format!("value '{}' is already in use", value));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(Error::ValidationError(errors))
        }
    }

    /// Whether another entity of the same type already stores `value` for `attribute`
    pub async fn is_taken(
        &self,
        entity_type: &EntityType,
        attribute: &Attribute,
        strategy: &dyn StorageStrategy,
        entity_id: Option<i64>,
        value: &AttributeValue,
        registered: &BTreeMap<String, AttributeMetadata>,
    ) -> Result<bool> {
        let Some(encoded) = strategy.encode(value) else {
            return Ok(false);
        };
        let dialect = self.connection.dialect();
        let sql_type = strategy.column_type().to_uppercase();

        let (mut sql, mut params) = if entity_type.is_flat() {
            (
                format!(
                    "SELECT COUNT(*) FROM {} WHERE {} = {}",
                    dialect.quote(&entity_type.entity_table),
                    dialect.quote(&attribute.code),
                    dialect.value_param(1, &sql_type)
                ),
                vec![Param::from(encoded)],
            )
        } else {
            // Nothing can collide with an attribute that has never been registered
            let Some(metadata) = registered.get(&attribute.code) else {
                return Ok(false);
            };
            (
                format!(
                    "SELECT COUNT(*) FROM {} WHERE attribute_id = {} AND value = {}",
                    dialect.quote(&strategy.table_name()),
                    dialect.placeholder(1),
                    dialect.value_param(2, &sql_type)
                ),
                vec![Param::Int(metadata.id), Param::from(encoded)],
            )
        };

        if let Some(entity_id) = entity_id {
            let column = if entity_type.is_flat() { "id" } else { "entity_id" };
            sql.push_str(&format!(
                " AND {} <> {}",
                column,
                dialect.placeholder(params.len() + 1)
            ));
            params.push(Param::Int(entity_id));
        }

        Ok(self.connection.fetch_i64(&sql, &params).await? > 0)
    }
}

fn push(errors: &mut FieldErrors, field: &str, message: String) {
    errors.entry(field.to_string()).or_default().push(message);
}

fn type_message(attribute: &Attribute, value: &AttributeValue, strategy: &dyn StorageStrategy) -> String {
    match value {
        AttributeValue::Text(_) if attribute.backend_type == BackendType::Varchar => format!(
            "must be a string of at most {} characters",
            strategy.column_type().trim_start_matches("varchar(").trim_end_matches(')')
        ),
        AttributeValue::Decimal(_) if attribute.backend_type == BackendType::Decimal => {
            "must be below 1e14 in magnitude with at most 6 decimal places and 15 significant digits"
                .to_string()
        }
        _ => format!(
            "expected a {} value, got {}",
            attribute.backend_type,
            value.type_name()
        ),
    }
}

/// Messages for every rule `value` violates
pub fn check_rules(rules: &ValidationRules, value: &AttributeValue) -> Result<Vec<String>> {
    let mut messages = Vec::new();

    if let Some(text) = value.as_str() {
        let length = text.chars().count();
        if let Some(min) = rules.min_length {
            if length < min {
                messages.push(format!("must be at least {} characters", min));
            }
        }
        if let Some(max) = rules.max_length {
            if length > max {
                messages.push(format!("must be at most {} characters", max));
            }
        }
        if let Some(pattern) = &rules.pattern {
            let regex = Regex::new(pattern)
                .map_err(|e| Error::ConfigError(format!("Invalid pattern '{}': {}", pattern, e)))?;
            if !regex.is_match(text) {
                messages.push(format!("must match pattern {}", pattern));
            }
        }
    }

    if let Some(number) = value.as_f64() {
        if let Some(min) = rules.min {
            if number < min {
                messages.push(format!("must be at least {}", min));
            }
        }
        if let Some(max) = rules.max {
            if number > max {
                messages.push(format!("must be at most {}", max));
            }
        }
    }

    Ok(messages)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn text_rules_report_every_violation() {
        let rules = ValidationRules {
            min_length: Some(5),
            pattern: Some(r"^[a-z]+@".to_string()),
            ..ValidationRules::default()
        };

        let messages = check_rules(&rules, &AttributeValue::text("AB")).unwrap();
        assert_eq!(
            messages,
            vec![
                "must be at least 5 characters".to_string(),
                "must match pattern ^[a-z]+@".to_string(),
            ]
        );
        assert!(check_rules(&rules, &AttributeValue::text("jane@example.com"))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn numeric_bounds_apply_to_integers_and_decimals() {
        let rules = ValidationRules {
            min: Some(0.0),
            max: Some(150.0),
            ..ValidationRules::default()
        };

        assert!(check_rules(&rules, &AttributeValue::Integer(42)).unwrap().is_empty());
        assert_eq!(
            check_rules(&rules, &AttributeValue::Decimal(-0.5)).unwrap(),
            vec!["must be at least 0".to_string()]
        );
        assert_eq!(
            check_rules(&rules, &AttributeValue::Integer(151)).unwrap(),
            vec!["must be at most 150".to_string()]
        );
    }
}
