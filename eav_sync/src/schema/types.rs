//! Type definitions for database schema objects

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Represents a complete database schema
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseSchema {
    pub tables: IndexMap<String, Table>,
    pub schema_name: Option<String>,
}

impl DatabaseSchema {
    /// Create a new empty database schema
    pub fn new(schema_name: Option<String>) -> Self {
        Self {
            tables: IndexMap::new(),
            schema_name,
        }
    }

    /// Add a table to the schema
    pub fn add_table(&mut self, table: Table) {
        self.tables.insert(table.name.clone(), table);
    }

    pub fn table(&self, name: &str) -> Option<&Table> {
        self.tables.get(name)
    }

    pub fn has_table(&self, name: &str) -> bool {
        self.tables.contains_key(name)
    }

    /// Sub-schema containing only the tables accepted by `keep`
    pub fn filtered(&self, mut keep: impl FnMut(&str) -> bool) -> DatabaseSchema {
        DatabaseSchema {
            tables: self
                .tables
                .iter()
                .filter(|(name, _)| keep(name))
                .map(|(name, table)| (name.clone(), table.clone()))
                .collect(),
            schema_name: self.schema_name.clone(),
        }
    }
}

/// Represents a database table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Table {
    pub name: String,
    pub columns: Vec<Column>,
    pub primary_key: Option<PrimaryKey>,
    pub indexes: Vec<Index>,
}

impl Table {
    /// Create a new table with the given name
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            columns: Vec::new(),
            primary_key: None,
            indexes: Vec::new(),
        }
    }

    /// Add a column to the table
    pub fn add_column(&mut self, column: Column) {
        self.columns.push(column);
    }

    /// Set the primary key for the table
    pub fn set_primary_key(&mut self, pk: PrimaryKey) {
        self.primary_key = Some(pk);
    }

    /// Add an index to the table
    pub fn add_index(&mut self, index: Index) {
        self.indexes.push(index);
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|column| column.name == name)
    }

    pub fn index(&self, name: &str) -> Option<&Index> {
        self.indexes.iter().find(|index| index.name == name)
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|column| column.name.clone()).collect()
    }
}

/// Represents a database column
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
    pub default: Option<String>,
    pub auto_increment: bool,
}

impl Column {
    /// Create a new column with the given name and type
    pub fn new(name: &str, data_type: &str) -> Self {
        Self {
            name: name.to_string(),
            data_type: data_type.to_string(),
            nullable: false,
            default: None,
            auto_increment: false,
        }
    }

    /// Set whether the column is nullable
    pub fn nullable(mut self, nullable: bool) -> Self {
        self.nullable = nullable;
        self
    }

    /// Set a default value for the column
    pub fn default(mut self, default: &str) -> Self {
        self.default = Some(default.to_string());
        self
    }

    /// Mark the column as the auto-incrementing row id
    pub fn auto_increment(mut self) -> Self {
        self.auto_increment = true;
        self
    }

    /// Whether both columns declare the same type once canonicalized
    pub fn same_type(&self, other: &Column) -> bool {
        canonical_type(&self.data_type) == canonical_type(&other.data_type)
    }
}

/// Represents a primary key constraint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrimaryKey {
    pub name: Option<String>,
    pub columns: Vec<String>,
}

/// Represents an index
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Index {
    pub name: String,
    pub columns: Vec<String>,
    pub is_unique: bool,
}

impl Index {
    pub fn new(name: &str, columns: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            columns: columns.iter().map(|c| c.to_string()).collect(),
            is_unique: false,
        }
    }

    pub fn unique(name: &str, columns: &[&str]) -> Self {
        Self {
            is_unique: true,
            ..Self::new(name, columns)
        }
    }

    /// Same columns in the same order and same uniqueness
    pub fn same_definition(&self, other: &Index) -> bool {
        self.columns == other.columns && self.is_unique == other.is_unique
    }
}

/// Normalize a declared or reported column type so equivalent spellings compare equal.
///
/// Both drivers report types differently from how they are declared: SQLite echoes the
/// declaration (`INTEGER` for a row id alias), Postgres reports `character varying` with a
/// separate length. The whole integer family is treated as one type.
pub fn canonical_type(data_type: &str) -> String {
    let lowered = data_type.trim().to_lowercase();
    let compact = lowered.split_whitespace().collect::<Vec<_>>().join(" ");
    let compact = compact.replace(" (", "(").replace(", ", ",").replace(" ,", ",");

    let (base, args) = match compact.find('(') {
        Some(open) => (&compact[..open], &compact[open..]),
        None => (compact.as_str(), ""),
    };

    let base = match base {
        "int" | "integer" | "bigint" | "smallint" | "int2" | "int4" | "int8" | "serial"
        | "bigserial" | "smallserial" => return "bigint".to_string(),
        "character varying" => "varchar",
        "character" | "bpchar" => "char",
        "numeric" => "decimal",
        "timestamp without time zone" | "datetime" => "timestamp",
        "timestamp with time zone" => "timestamptz",
        "bool" => "boolean",
        other => other,
    };

    format!("{}{}", base, args)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("INTEGER", "bigint")]
    #[case("int8", "bigint")]
    #[case("BIGINT", "bigint")]
    #[case("character varying(255)", "varchar(255)")]
    #[case("VARCHAR(255)", "varchar(255)")]
    #[case("numeric(20,6)", "decimal(20,6)")]
    #[case("DECIMAL(20, 6)", "decimal(20,6)")]
    #[case("timestamp without time zone", "timestamp")]
    #[case("TIMESTAMP", "timestamp")]
    #[case("text", "text")]
    fn equivalent_types_canonicalize_equally(#[case] declared: &str, #[case] expected: &str) {
        assert_eq!(canonical_type(declared), expected);
    }

    #[test]
    fn differing_lengths_stay_distinct() {
        let short = Column::new("email", "varchar(100)");
        let long = Column::new("email", "character varying(255)");
        assert!(!short.same_type(&long));
        assert!(long.same_type(&Column::new("email", "VARCHAR(255)")));
    }

    #[test]
    fn index_definitions_compare_columns_and_uniqueness() {
        let unique = Index::unique("uq_t_a", &["a"]);
        let plain = Index::new("uq_t_a", &["a"]);
        assert!(!unique.same_definition(&plain));
        assert!(unique.same_definition(&Index::unique("other", &["a"])));
    }
}
