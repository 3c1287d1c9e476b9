//! Entity type configuration
//!
//! Entity types are declared in configuration files, loaded by [`ConfigLoader`] and served by
//! [`EntityTypeRegistry`].

pub mod loader;
pub mod registry;
pub mod types;

pub use loader::ConfigLoader;
pub use registry::EntityTypeRegistry;
pub use types::{Attribute, BackendType, EntityType, StorageMode, ValidationRules};
