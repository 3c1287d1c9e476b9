//! Utilities
//!
//! Naming helpers and logging setup used across the library.

pub mod logging;
pub mod naming;

pub use naming::{
    default_entity_table, index_name, is_valid_identifier, unique_index_name,
    validate_identifier, value_table_name,
};
