//! Entity type definitions
//!
//! An [`EntityType`] is built once from its configuration file and is immutable afterwards.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Physical storage category of an attribute value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendType {
    Varchar,
    Text,
    Int,
    Decimal,
    Datetime,
}

impl BackendType {
    pub fn all() -> [BackendType; 5] {
        [
            BackendType::Varchar,
            BackendType::Text,
            BackendType::Int,
            BackendType::Decimal,
            BackendType::Datetime,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BackendType::Varchar => "varchar",
            BackendType::Text => "text",
            BackendType::Int => "int",
            BackendType::Decimal => "decimal",
            BackendType::Datetime => "datetime",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        BackendType::all()
            .into_iter()
            .find(|bt| bt.as_str() == value.to_lowercase())
    }

    /// Canonical column type used for values of this backend type
    pub fn column_type(&self, varchar_length: usize) -> String {
        match self {
            BackendType::Varchar => format!("varchar({})", varchar_length),
            BackendType::Text => "text".to_string(),
            BackendType::Int => "bigint".to_string(),
            BackendType::Decimal => "decimal(20,6)".to_string(),
            BackendType::Datetime => "timestamp".to_string(),
        }
    }
}

impl fmt::Display for BackendType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How an entity type lays out its attribute values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageMode {
    /// One row per (entity, attribute) in the shared value tables
    #[default]
    Eav,
    /// One column per attribute on the entity table
    Flat,
}

impl StorageMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageMode::Eav => "eav",
            StorageMode::Flat => "flat",
        }
    }
}

/// Optional per-attribute validation rules
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ValidationRules {
    pub min_length: Option<usize>,
    pub max_length: Option<usize>,
    pub pattern: Option<String>,
    pub min: Option<f64>,
    pub max: Option<f64>,
}

impl ValidationRules {
    pub fn is_empty(&self) -> bool {
        self == &ValidationRules::default()
    }
}

/// A single attribute definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attribute {
    pub code: String,
    pub label: String,
    pub backend_type: BackendType,
    pub frontend_type: String,
    pub is_required: bool,
    pub is_unique: bool,
    pub is_searchable: bool,
    pub is_filterable: bool,
    pub default_value: Option<serde_json::Value>,
    pub sort_order: i32,
    pub validation_rules: Option<ValidationRules>,
}

impl Attribute {
    /// Attribute with presentation defaults derived from its code
    pub fn new(code: &str, backend_type: BackendType) -> Self {
        Self {
            code: code.to_string(),
            label: code.to_string(),
            backend_type,
            frontend_type: "text".to_string(),
            is_required: false,
            is_unique: false,
            is_searchable: false,
            is_filterable: false,
            default_value: None,
            sort_order: 0,
            validation_rules: None,
        }
    }

    pub fn required(mut self) -> Self {
        self.is_required = true;
        self
    }

    pub fn unique(mut self) -> Self {
        self.is_unique = true;
        self
    }

    pub fn searchable(mut self) -> Self {
        self.is_searchable = true;
        self
    }

    pub fn with_label(mut self, label: &str) -> Self {
        self.label = label.to_string();
        self
    }

    pub fn with_rules(mut self, rules: ValidationRules) -> Self {
        self.validation_rules = Some(rules);
        self
    }

    /// Whether the flat entity table gets an index on this attribute's column
    pub fn is_indexed(&self) -> bool {
        self.is_searchable || self.is_filterable
    }
}

/// Immutable description of an entity type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityType {
    pub code: String,
    pub label: String,
    pub entity_table: String,
    pub storage_strategy: StorageMode,
    attributes: Vec<Attribute>,
}

impl EntityType {
    /// Build an entity type; attributes are ordered by `sort_order`, then declaration order
    pub fn new(
        code: &str,
        label: &str,
        entity_table: &str,
        storage_strategy: StorageMode,
        mut attributes: Vec<Attribute>,
    ) -> Self {
        attributes.sort_by_key(|attribute| attribute.sort_order);

        Self {
            code: code.to_string(),
            label: label.to_string(),
            entity_table: entity_table.to_string(),
            storage_strategy,
            attributes,
        }
    }

    pub fn attributes(&self) -> &[Attribute] {
        &self.attributes
    }

    pub fn attribute(&self, code: &str) -> Option<&Attribute> {
        self.attributes.iter().find(|attribute| attribute.code == code)
    }

    pub fn required_attributes(&self) -> impl Iterator<Item = &Attribute> {
        self.attributes.iter().filter(|attribute| attribute.is_required)
    }

    pub fn is_flat(&self) -> bool {
        self.storage_strategy == StorageMode::Flat
    }

    /// Attribute codes grouped by backend type
    pub fn attributes_by_backend(&self) -> BTreeMap<BackendType, Vec<&Attribute>> {
        let mut grouped: BTreeMap<BackendType, Vec<&Attribute>> = BTreeMap::new();
        for attribute in &self.attributes {
            grouped.entry(attribute.backend_type).or_default().push(attribute);
        }
        grouped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attributes_are_sorted_stably_by_sort_order() {
        let mut late = Attribute::new("late", BackendType::Int);
        late.sort_order = 20;
        let mut first = Attribute::new("first", BackendType::Varchar);
        first.sort_order = 10;
        let second = {
            let mut attribute = Attribute::new("second", BackendType::Text);
            attribute.sort_order = 10;
            attribute
        };

        let entity_type = EntityType::new(
            "customer",
            "Customer",
            "customer_entity",
            StorageMode::Eav,
            vec![late, first, second],
        );

        let codes: Vec<_> = entity_type.attributes().iter().map(|a| a.code.as_str()).collect();
        assert_eq!(codes, vec!["first", "second", "late"]);
    }

    #[test]
    fn backend_types_parse_case_insensitively() {
        assert_eq!(BackendType::parse("DateTime"), Some(BackendType::Datetime));
        assert_eq!(BackendType::parse("blob"), None);
        assert_eq!(BackendType::Varchar.column_type(120), "varchar(120)");
    }
}
