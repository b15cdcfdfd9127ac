//! Builds `records/modify` operations from rows.

use serde_json::Value;

use crate::config::{ImportConfig, RecordGroup, RecordNameSource};
use crate::error::ImportError;
use crate::records::field_mapper::map_fields;
use crate::records::types::{Operation, OperationType, Record, Row, RECORD_NAME_KEY};

/// Operations for a single record type, in row order.
#[derive(Debug, Clone, PartialEq)]
pub struct OperationGroup {
    pub record_type: String,
    pub operations: Vec<Operation>,
}

/// Runs the prepare stage (if any) and builds one operation group per
/// resulting record type.
///
/// Without a prepare stage all rows form one group of `config.record_type`
/// and the output holds exactly one operation per row.
pub fn build(
    rows: Vec<Row>,
    operation_type: OperationType,
    config: &ImportConfig,
) -> Result<Vec<OperationGroup>, ImportError> {
    group_rows(rows, config)?
        .into_iter()
        .map(|group| {
            let operations =
                build_operations(&group.rows, &group.record_type, operation_type, config)?;
            Ok(OperationGroup {
                record_type: group.record_type,
                operations,
            })
        })
        .collect()
}

/// Splits rows into record-type groups.
pub fn group_rows(rows: Vec<Row>, config: &ImportConfig) -> Result<Vec<RecordGroup>, ImportError> {
    if let Some(prepare) = &config.prepare {
        let groups = prepare(rows);
        if let Some(group) = groups.iter().find(|g| g.record_type.trim().is_empty()) {
            return Err(ImportError::Config(format!(
                "prepare produced a group of {} rows without a record type",
                group.rows.len()
            )));
        }
        return Ok(groups);
    }

    let record_type = config
        .record_type
        .clone()
        .filter(|t| !t.trim().is_empty())
        .ok_or_else(|| ImportError::Config("record type is required".into()))?;

    Ok(vec![RecordGroup { record_type, rows }])
}

/// Builds one operation per row for a single record type.
pub fn build_operations(
    rows: &[Row],
    record_type: &str,
    operation_type: OperationType,
    config: &ImportConfig,
) -> Result<Vec<Operation>, ImportError> {
    rows.iter()
        .enumerate()
        .map(|(index, row)| {
            let mut record = Record {
                record_name: None,
                record_type: record_type.to_string(),
                fields: Some(map_fields(row, config)),
            };

            record.record_name = resolve_record_name(row, &record, config);

            if record.record_name.is_none() && operation_type.requires_record_name() {
                return Err(ImportError::Config(format!(
                    "row {} of {} has no record name, which {:?} requires",
                    index, record_type, operation_type
                )));
            }

            if operation_type.is_delete() {
                record.fields = None;
            }

            Ok(Operation {
                operation_type,
                record,
            })
        })
        .collect()
}

/// Resolves a record name: configured source first, then the row's own
/// `recordName`, otherwise none.
fn resolve_record_name(row: &Row, record: &Record, config: &ImportConfig) -> Option<String> {
    let configured = match &config.record_name {
        Some(RecordNameSource::Table(table)) => table.get(&record.record_type).cloned(),
        Some(RecordNameSource::Resolver(resolve)) => resolve(record),
        Some(RecordNameSource::Field(key)) => row
            .get(key)
            .or_else(|| {
                record
                    .fields
                    .as_ref()
                    .and_then(|fields| fields.get(key))
                    .map(|field| &field.value)
            })
            .and_then(scalar_to_name),
        None => None,
    };

    configured.or_else(|| row.get(RECORD_NAME_KEY).and_then(scalar_to_name))
}

fn scalar_to_name(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}
