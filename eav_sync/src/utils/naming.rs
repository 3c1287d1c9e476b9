//! Naming utilities
//!
//! Table, index and identifier naming shared by the structure builder, the generator and the
//! storage strategies.

use inflector::Inflector;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::entity::types::BackendType;
use crate::error::{Error, Result};

static IDENTIFIER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z][a-z0-9_]{0,62}$").expect("identifier pattern is valid"));

/// Prefix shared by all physical value tables
pub const VALUE_TABLE_PREFIX: &str = "eav_values_";

/// Attribute metadata store
pub const ATTRIBUTE_TABLE: &str = "eav_attributes";

/// Engine bookkeeping tables, never reported as drift
pub const LOCK_TABLE: &str = "eav_sync_locks";
pub const BACKUP_TABLE: &str = "eav_schema_backups";

/// Whether `name` is safe to splice into SQL as an identifier
pub fn is_valid_identifier(name: &str) -> bool {
    IDENTIFIER.is_match(name)
}

/// Reject anything that is not a plain lowercase SQL identifier
pub fn validate_identifier(kind: &str, name: &str) -> Result<()> {
    if is_valid_identifier(name) {
        Ok(())
    } else {
        Err(Error::ConfigError(format!(
            "Invalid {} '{}': expected a lowercase identifier matching [a-z][a-z0-9_]*",
            kind, name
        )))
    }
}

/// Physical table holding every value of one backend type
pub fn value_table_name(backend_type: BackendType) -> String {
    format!("{}{}", VALUE_TABLE_PREFIX, backend_type.as_str())
}

/// Default entity table for an entity type code, e.g. `CustomerAddress` -> `customer_address_entity`
pub fn default_entity_table(code: &str) -> String {
    format!("{}_entity", code.to_snake_case())
}

/// Non-unique index name
pub fn index_name(table_name: &str, columns: &[&str]) -> String {
    format!("ix_{}_{}", table_name, columns.join("_"))
}

/// Unique index name
pub fn unique_index_name(table_name: &str, columns: &[&str]) -> String {
    format!("uq_{}_{}", table_name, columns.join("_"))
}

/// Whether an actual table is owned by the entity type using `entity_table`
pub fn is_owned_table(entity_table: &str, table_name: &str) -> bool {
    table_name == entity_table
        || table_name
            .strip_prefix(entity_table)
            .map_or(false, |rest| rest.starts_with('_'))
}

/// Tables shared by all entity types
pub fn shared_table_names() -> Vec<String> {
    let mut names = vec![ATTRIBUTE_TABLE.to_string()];
    names.extend(BackendType::all().iter().map(|bt| value_table_name(*bt)));
    names
}

/// Tables the engine creates for itself
pub fn is_engine_table(table_name: &str, history_table: &str) -> bool {
    table_name == LOCK_TABLE || table_name == BACKUP_TABLE || table_name == history_table
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifiers_are_lowercase_snake() {
        assert!(is_valid_identifier("customer_entity"));
        assert!(is_valid_identifier("is_verified2"));
        assert!(!is_valid_identifier("Customer"));
        assert!(!is_valid_identifier("1abc"));
        assert!(!is_valid_identifier("drop table;"));
        assert!(validate_identifier("attribute code", "e-mail").is_err());
    }

    #[test]
    fn table_names() {
        assert_eq!(value_table_name(BackendType::Decimal), "eav_values_decimal");
        assert_eq!(default_entity_table("customerAddress"), "customer_address_entity");
        assert_eq!(index_name("customer_entity", &["email"]), "ix_customer_entity_email");
        assert_eq!(
            unique_index_name("eav_values_int", &["entity_id", "attribute_id"]),
            "uq_eav_values_int_entity_id_attribute_id"
        );
    }

    #[test]
    fn ownership_requires_separator() {
        assert!(is_owned_table("customer_entity", "customer_entity"));
        assert!(is_owned_table("customer_entity", "customer_entity_legacy"));
        assert!(!is_owned_table("customer_entity", "customer_entityx"));
        assert!(!is_owned_table("customer_entity", "product_entity"));
    }
}
