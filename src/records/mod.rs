//! Record model and the row → operation stages.
//!
//! - `types`: wire shapes for `records/modify` requests and responses
//! - `field_mapper`: row → wrapped fields
//! - `operation_builder`: mapped rows → operations, grouped by record type

pub mod field_mapper;
pub mod operation_builder;
pub mod types;

pub use field_mapper::map_fields;
pub use operation_builder::{build, OperationGroup};
pub use types::{FieldValue, Fields, Operation, OperationType, Record, Row, SavedRecord};
