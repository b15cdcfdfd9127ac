//! Wire types for the CloudKit `records/modify` endpoint.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Reserved row key carrying the record name instead of field data.
pub const RECORD_NAME_KEY: &str = "recordName";

/// A source row: field name to scalar value.
pub type Row = BTreeMap<String, Value>;

/// Mapped record fields, each wrapped for the wire.
pub type Fields = BTreeMap<String, FieldValue>;

// ─────────────────────────────────────────────────────────────────────────────
// FieldValue
// ─────────────────────────────────────────────────────────────────────────────

/// A field value in CloudKit's `{ "value": ... }` envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldValue {
    pub value: Value,
}

impl FieldValue {
    /// Wraps a raw value. A value already shaped as `{ "value": x }` is kept
    /// as-is so wrapping never nests.
    pub fn wrap(raw: Value) -> Self {
        match raw {
            Value::Object(mut map) if map.len() == 1 && map.contains_key("value") => {
                let value = map.remove("value").unwrap_or(Value::Null);
                Self { value }
            }
            other => Self { value: other },
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// OperationType
// ─────────────────────────────────────────────────────────────────────────────

/// Kind of write performed for one record.
///
/// Serialized in camelCase to match CloudKit ("create", "forceUpdate", ...).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OperationType {
    /// Create a new record; fails server-side if the name exists.
    #[default]
    Create,
    /// Update an existing record, checking the change tag.
    Update,
    /// Update an existing record, ignoring the change tag.
    ForceUpdate,
    /// Replace an existing record, checking the change tag.
    Replace,
    /// Replace an existing record, ignoring the change tag.
    ForceReplace,
    /// Delete a record, checking the change tag.
    Delete,
    /// Delete a record, ignoring the change tag.
    ForceDelete,
}

impl OperationType {
    /// True for the delete variants, which never carry fields.
    pub fn is_delete(self) -> bool {
        matches!(self, OperationType::Delete | OperationType::ForceDelete)
    }

    /// Only `create` may leave the record name to the server.
    pub fn requires_record_name(self) -> bool {
        !matches!(self, OperationType::Create)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Record / Operation
// ─────────────────────────────────────────────────────────────────────────────

/// A typed record as sent to CloudKit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    /// Omitted when the server should assign a name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record_name: Option<String>,
    pub record_type: String,
    /// Omitted for delete operations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fields: Option<Fields>,
}

/// One write instruction for a single record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    pub operation_type: OperationType,
    pub record: Record,
}

/// Request body of `records/modify`.
#[derive(Debug, Serialize)]
pub(crate) struct ModifyRequest<'a> {
    pub operations: &'a [Operation],
}

// ─────────────────────────────────────────────────────────────────────────────
// Server results
// ─────────────────────────────────────────────────────────────────────────────

/// Per-record result returned by CloudKit.
///
/// Deserialized leniently: every field is optional so that error entries,
/// which carry only a name and an error code, parse as well.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SavedRecord {
    #[serde(default)]
    pub record_name: Option<String>,
    #[serde(default)]
    pub record_type: Option<String>,
    #[serde(default)]
    pub record_change_tag: Option<String>,
    #[serde(default)]
    pub fields: Option<Value>,
    #[serde(default)]
    pub created: Option<Value>,
    #[serde(default)]
    pub modified: Option<Value>,
    #[serde(default)]
    pub deleted: Option<bool>,
    /// Present only when the server failed to apply this record.
    #[serde(default)]
    pub server_error_code: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
}

/// Response body of `records/modify`.
#[derive(Debug, Deserialize)]
pub(crate) struct ModifyResponse {
    #[serde(default)]
    pub records: Vec<SavedRecord>,
}
