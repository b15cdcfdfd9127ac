//! Import configuration.
//!
//! `ImportConfig` is a plain struct with defaults and chained setters. It is
//! validated before any row is mapped or any request is sent.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ImportError;
use crate::records::{OperationType, Record, Row};

// ─────────────────────────────────────────────────────────────────────────────
// Defaults
// ─────────────────────────────────────────────────────────────────────────────

/// Operations per `records/modify` request (CloudKit's own ceiling).
pub const DEFAULT_CHUNK_SIZE: usize = 200;

/// Maximum requests in flight at once.
pub const DEFAULT_CONCURRENCY: usize = 5;

/// Length of the rate-limit window.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(1);

/// Maximum requests started per window.
pub const DEFAULT_INTERVAL_CAP: usize = 10;

/// Retries after the first attempt.
pub const DEFAULT_RETRIES: u32 = 2;

// ─────────────────────────────────────────────────────────────────────────────
// Strategy types
// ─────────────────────────────────────────────────────────────────────────────

/// Renames a source key to an output field name.
pub type KeyMap = Arc<dyn Fn(&str) -> String + Send + Sync>;

/// Transforms a value given its output field name.
pub type ValueMap = Arc<dyn Fn(&str, Value) -> Value + Send + Sync>;

/// Derives a record name from the mapped record.
pub type RecordNameResolver = Arc<dyn Fn(&Record) -> Option<String> + Send + Sync>;

/// Regroups the full row set into record-type groups before building.
pub type Prepare = Arc<dyn Fn(Vec<Row>) -> Vec<RecordGroup> + Send + Sync>;

/// Rows destined for one record type.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordGroup {
    pub record_type: String,
    pub rows: Vec<Row>,
}

impl RecordGroup {
    pub fn new(record_type: impl Into<String>, rows: Vec<Row>) -> Self {
        Self {
            record_type: record_type.into(),
            rows,
        }
    }
}

/// Where record names come from.
#[derive(Clone)]
pub enum RecordNameSource {
    /// Fixed name per record type.
    Table(HashMap<String, String>),
    /// Computed from the mapped record.
    Resolver(RecordNameResolver),
    /// Read from a single row field.
    Field(String),
}

impl fmt::Debug for RecordNameSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordNameSource::Table(table) => f.debug_tuple("Table").field(table).finish(),
            RecordNameSource::Resolver(_) => f.write_str("Resolver(<fn>)"),
            RecordNameSource::Field(key) => f.debug_tuple("Field").field(key).finish(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Environment
// ─────────────────────────────────────────────────────────────────────────────

/// CloudKit container environment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Development,
    Production,
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Environment::Development => write!(f, "development"),
            Environment::Production => write!(f, "production"),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// DispatchConfig
// ─────────────────────────────────────────────────────────────────────────────

/// Admission-control and retry settings for one dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchConfig {
    pub concurrency: usize,
    pub interval: Duration,
    pub interval_cap: usize,
    pub retries: u32,
    /// Overall deadline; batches not yet admitted when it fires are abandoned.
    pub deadline: Option<Duration>,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            interval: DEFAULT_INTERVAL,
            interval_cap: DEFAULT_INTERVAL_CAP,
            retries: DEFAULT_RETRIES,
            deadline: None,
        }
    }
}

impl DispatchConfig {
    pub fn validate(&self) -> Result<(), ImportError> {
        if self.concurrency == 0 {
            return Err(ImportError::Config(
                "concurrency must be greater than 0".into(),
            ));
        }
        if self.interval_cap == 0 {
            return Err(ImportError::Config(
                "interval cap must be greater than 0".into(),
            ));
        }
        if self.interval.is_zero() {
            return Err(ImportError::Config(
                "interval must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// ImportConfig
// ─────────────────────────────────────────────────────────────────────────────

/// Options for one `write` / `remove` call.
#[derive(Clone, Default)]
pub struct ImportConfig {
    /// Container identifier, e.g. "iCloud.com.example.app".
    pub container: String,
    pub environment: Environment,
    /// Record type for all rows; required unless `prepare` is set.
    pub record_type: Option<String>,
    /// Operation used by `write` (`remove` always uses `forceDelete`).
    pub operation_type: OperationType,
    /// Operations per request; `None` means the default of 200.
    pub chunk_size: Option<usize>,
    pub key_map: Option<KeyMap>,
    pub value_map: Option<ValueMap>,
    pub record_name: Option<RecordNameSource>,
    pub prepare: Option<Prepare>,
    pub dispatch: DispatchConfig,
}

impl fmt::Debug for ImportConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImportConfig")
            .field("container", &self.container)
            .field("environment", &self.environment)
            .field("record_type", &self.record_type)
            .field("operation_type", &self.operation_type)
            .field("chunk_size", &self.chunk_size)
            .field("key_map", &self.key_map.as_ref().map(|_| "<fn>"))
            .field("value_map", &self.value_map.as_ref().map(|_| "<fn>"))
            .field("record_name", &self.record_name)
            .field("prepare", &self.prepare.as_ref().map(|_| "<fn>"))
            .field("dispatch", &self.dispatch)
            .finish()
    }
}

impl ImportConfig {
    pub fn new(container: impl Into<String>, environment: Environment) -> Self {
        Self {
            container: container.into(),
            environment,
            ..Self::default()
        }
    }

    pub fn record_type(mut self, record_type: impl Into<String>) -> Self {
        self.record_type = Some(record_type.into());
        self
    }

    pub fn operation_type(mut self, operation_type: OperationType) -> Self {
        self.operation_type = operation_type;
        self
    }

    pub fn chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = Some(size);
        self
    }

    pub fn key_map(mut self, f: impl Fn(&str) -> String + Send + Sync + 'static) -> Self {
        self.key_map = Some(Arc::new(f));
        self
    }

    pub fn value_map(mut self, f: impl Fn(&str, Value) -> Value + Send + Sync + 'static) -> Self {
        self.value_map = Some(Arc::new(f));
        self
    }

    pub fn record_name(mut self, source: RecordNameSource) -> Self {
        self.record_name = Some(source);
        self
    }

    pub fn prepare(mut self, f: impl Fn(Vec<Row>) -> Vec<RecordGroup> + Send + Sync + 'static) -> Self {
        self.prepare = Some(Arc::new(f));
        self
    }

    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.dispatch.concurrency = concurrency;
        self
    }

    pub fn interval(mut self, interval: Duration) -> Self {
        self.dispatch.interval = interval;
        self
    }

    pub fn interval_cap(mut self, cap: usize) -> Self {
        self.dispatch.interval_cap = cap;
        self
    }

    pub fn retries(mut self, retries: u32) -> Self {
        self.dispatch.retries = retries;
        self
    }

    pub fn deadline(mut self, deadline: Duration) -> Self {
        self.dispatch.deadline = Some(deadline);
        self
    }

    /// Effective batch size.
    pub fn effective_chunk_size(&self) -> usize {
        self.chunk_size.unwrap_or(DEFAULT_CHUNK_SIZE)
    }

    /// Checks everything that can be checked without touching the network.
    pub fn validate(&self) -> Result<(), ImportError> {
        if self.container.trim().is_empty() {
            return Err(ImportError::Config("container is required".into()));
        }
        if self.prepare.is_none()
            && self
                .record_type
                .as_deref()
                .map_or(true, |t| t.trim().is_empty())
        {
            return Err(ImportError::Config(
                "record type is required when no prepare stage is configured".into(),
            ));
        }
        if self.effective_chunk_size() == 0 {
            return Err(ImportError::Config(
                "chunk size must be greater than 0".into(),
            ));
        }
        self.dispatch.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> ImportConfig {
        ImportConfig::new("iCloud.com.example", Environment::Development).record_type("Note")
    }

    #[test]
    fn test_defaults_match_documented_values() {
        let config = base();
        assert_eq!(config.effective_chunk_size(), 200);
        assert_eq!(config.dispatch.concurrency, 5);
        assert_eq!(config.dispatch.interval, Duration::from_secs(1));
        assert_eq!(config.dispatch.interval_cap, 10);
        assert_eq!(config.dispatch.retries, 2);
        assert_eq!(config.operation_type, OperationType::Create);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_chunk_size_is_rejected() {
        let err = base().chunk_size(0).validate().unwrap_err();
        assert!(matches!(err, ImportError::Config(msg) if msg.contains("chunk size")));
    }

    #[test]
    fn test_missing_container_is_rejected() {
        let config = ImportConfig::default().record_type("Note");
        assert!(matches!(config.validate(), Err(ImportError::Config(_))));
    }

    #[test]
    fn test_record_type_optional_with_prepare() {
        let config = ImportConfig::new("iCloud.com.example", Environment::Production)
            .prepare(|rows| vec![RecordGroup::new("Note", rows)]);
        assert!(config.validate().is_ok());

        let config = ImportConfig::new("iCloud.com.example", Environment::Production);
        assert!(matches!(config.validate(), Err(ImportError::Config(_))));
    }

    #[test]
    fn test_zero_dispatch_limits_are_rejected() {
        assert!(base().concurrency(0).validate().is_err());
        assert!(base().interval_cap(0).validate().is_err());
        assert!(base().interval(Duration::ZERO).validate().is_err());
    }

    #[test]
    fn test_environment_display_is_lowercase() {
        assert_eq!(Environment::Development.to_string(), "development");
        assert_eq!(Environment::Production.to_string(), "production");
    }

    #[test]
    fn test_debug_hides_closures() {
        let config = base().key_map(|k| k.to_uppercase());
        let debug = format!("{:?}", config);
        assert!(debug.contains("<fn>"));
        assert!(debug.contains("iCloud.com.example"));
    }
}
