//! Structure builder
//!
//! Derives the desired physical schema of an entity type from its configuration alone. The
//! shared tables (attribute metadata and one value table per backend type) are identical for
//! every entity type; only the entity table varies.

use crate::config::StorageConfig;
use crate::entity::types::{BackendType, EntityType};
use crate::schema::types::{Column, DatabaseSchema, Index, PrimaryKey, Table};
use crate::utils::naming::{index_name, unique_index_name, value_table_name, ATTRIBUTE_TABLE};

const CURRENT_TIMESTAMP: &str = "CURRENT_TIMESTAMP";

#[derive(Debug, Clone)]
pub struct StructureBuilder {
    varchar_length: usize,
}

impl StructureBuilder {
    pub fn new(config: &StorageConfig) -> Self {
        Self {
            varchar_length: config.varchar_max_length,
        }
    }

    /// Desired schema: the entity table followed by the shared tables
    pub fn build(&self, entity_type: &EntityType) -> DatabaseSchema {
        let mut schema = DatabaseSchema::new(None);
        schema.add_table(self.entity_table(entity_type));
        for table in self.shared_tables() {
            schema.add_table(table);
        }
        schema
    }

    /// The entity's own table; in flat mode it carries one nullable column per attribute
    pub fn entity_table(&self, entity_type: &EntityType) -> Table {
        let name = &entity_type.entity_table;
        let mut table = Table::new(name);

        table.add_column(Column::new("id", "bigint").auto_increment());
        table.add_column(Column::new("created_at", "timestamp").default(CURRENT_TIMESTAMP));
        table.add_column(Column::new("updated_at", "timestamp").default(CURRENT_TIMESTAMP));
        table.set_primary_key(PrimaryKey {
            name: None,
            columns: vec!["id".to_string()],
        });

        if entity_type.is_flat() {
            for attribute in entity_type.attributes() {
                let data_type = attribute.backend_type.column_type(self.varchar_length);
                table.add_column(Column::new(&attribute.code, &data_type).nullable(true));

                if attribute.is_unique {
                    table.add_index(Index::unique(
                        &unique_index_name(name, &[&attribute.code]),
                        &[&attribute.code],
                    ));
                } else if attribute.is_indexed() {
                    table.add_index(Index::new(
                        &index_name(name, &[&attribute.code]),
                        &[&attribute.code],
                    ));
                }
            }
        }

        table
    }

    /// Attribute metadata store plus every value table
    pub fn shared_tables(&self) -> Vec<Table> {
        let mut tables = vec![self.attribute_table()];
        tables.extend(BackendType::all().into_iter().map(|bt| self.value_table(bt)));
        tables
    }

    pub fn attribute_table(&self) -> Table {
        let mut table = Table::new(ATTRIBUTE_TABLE);
        table.add_column(Column::new("id", "bigint").auto_increment());
        table.add_column(Column::new("entity_type_code", "varchar(255)"));
        table.add_column(Column::new("attribute_code", "varchar(255)"));
        table.add_column(Column::new("backend_type", "varchar(32)"));
        table.add_column(Column::new("label", "varchar(255)").nullable(true));
        table.set_primary_key(PrimaryKey {
            name: None,
            columns: vec!["id".to_string()],
        });
        table.add_index(Index::unique(
            &unique_index_name(ATTRIBUTE_TABLE, &["entity_type_code", "attribute_code"]),
            &["entity_type_code", "attribute_code"],
        ));
        table
    }

    pub fn value_table(&self, backend_type: BackendType) -> Table {
        let name = value_table_name(backend_type);
        let mut table = Table::new(&name);
        table.add_column(Column::new("entity_id", "bigint"));
        table.add_column(Column::new("attribute_id", "bigint"));
        table.add_column(
            Column::new("value", &backend_type.column_type(self.varchar_length)).nullable(true),
        );
        table.add_index(Index::unique(
            &unique_index_name(&name, &["entity_id", "attribute_id"]),
            &["entity_id", "attribute_id"],
        ));
        table.add_index(Index::new(&index_name(&name, &["attribute_id"]), &["attribute_id"]));
        table
    }
}
