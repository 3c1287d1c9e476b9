//! Attribute value storage
//!
//! Values are physically partitioned by backend type: one [`StorageStrategy`] and one shared
//! value table per type. The [`ValueManager`] routes by attribute metadata and the
//! [`EntityManager`] works with whole entities.

pub mod entity_manager;
pub mod metadata;
pub mod strategy;
pub mod validation;
pub mod value;
pub mod value_manager;

pub use entity_manager::{Entity, EntityManager};
pub use metadata::{AttributeMetadata, AttributeMetadataManager};
pub use strategy::{
    strategy_for, DatetimeStrategy, DecimalStrategy, IntStrategy, StorageStrategy, TextStrategy,
    VarcharStrategy,
};
pub use validation::AttributeValidator;
pub use value::AttributeValue;
pub use value_manager::{SaveOutcome, SaveReport, ValueManager};
