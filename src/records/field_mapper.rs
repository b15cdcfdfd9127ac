//! Row → wire field mapping.

use crate::config::ImportConfig;
use crate::records::types::{FieldValue, Fields, Row, RECORD_NAME_KEY};

/// Maps one row into wrapped record fields.
///
/// Keys go through `key_map`, values through `value_map` (keyed by the output
/// name). The reserved `recordName` key is skipped. Keys absent from the row
/// are never backfilled.
pub fn map_fields(row: &Row, config: &ImportConfig) -> Fields {
    row.iter()
        .filter(|(key, _)| key.as_str() != RECORD_NAME_KEY)
        .map(|(key, raw)| {
            let out_key = match &config.key_map {
                Some(key_map) => key_map(key),
                None => key.clone(),
            };
            let value = match &config.value_map {
                Some(value_map) => value_map(&out_key, raw.clone()),
                None => raw.clone(),
            };
            (out_key, FieldValue::wrap(value))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Environment;
    use serde_json::{json, Value};

    fn row(pairs: &[(&str, Value)]) -> Row {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn config() -> ImportConfig {
        ImportConfig::new("iCloud.com.example", Environment::Development).record_type("Note")
    }

    #[test]
    fn test_wraps_every_value() {
        let fields = map_fields(
            &row(&[("key1", json!("value1")), ("key3", json!(5))]),
            &config(),
        );

        assert_eq!(fields.len(), 2);
        assert_eq!(fields["key1"].value, json!("value1"));
        assert_eq!(fields["key3"].value, json!(5));
    }

    #[test]
    fn test_record_name_is_not_a_field() {
        let fields = map_fields(
            &row(&[("recordName", json!("n-1")), ("title", json!("Hi"))]),
            &config(),
        );

        assert!(!fields.contains_key("recordName"));
        assert_eq!(fields.len(), 1);
    }

    #[test]
    fn test_applies_key_then_value_map() {
        let config = config()
            .key_map(|k| format!("{}_field", k))
            .value_map(|k, v| {
                if k == "count_field" {
                    json!(v.as_str().and_then(|s| s.parse::<i64>().ok()))
                } else {
                    v
                }
            });

        let fields = map_fields(
            &row(&[("count", json!("42")), ("title", json!("Hi"))]),
            &config,
        );

        assert_eq!(fields["count_field"].value, json!(42));
        assert_eq!(fields["title_field"].value, json!("Hi"));
    }

    #[test]
    fn test_sparse_rows_keep_only_present_keys() {
        let config = config();
        let a = map_fields(&row(&[("a", json!(1))]), &config);
        let b = map_fields(&row(&[("b", json!(2)), ("c", Value::Null)]), &config);

        assert_eq!(a.keys().collect::<Vec<_>>(), vec!["a"]);
        assert_eq!(b.keys().collect::<Vec<_>>(), vec!["b", "c"]);
        assert_eq!(b["c"].value, Value::Null);
    }

    #[test]
    fn test_already_wrapped_values_are_not_nested() {
        let config = config().value_map(|_, v| json!({ "value": v }));
        let fields = map_fields(&row(&[("a", json!("x"))]), &config);
        assert_eq!(fields["a"].value, json!("x"));
    }
}
