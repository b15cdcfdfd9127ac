//! Bulk import and delete of CloudKit records over the server-to-server web
//! services API.
//!
//! ```ignore
//! let cloudkit = CloudKit::new(key_id, SecretString::from(pem))?;
//! let config = ImportConfig::new("iCloud.com.example.app", Environment::Development)
//!     .record_type("Note")
//!     .operation_type(OperationType::ForceUpdate);
//!
//! let saved = cloudkit.write(rows, &config).await?;
//! ```
//!
//! Pipeline: rows → field mapping → operations → batches → signed,
//! rate-limited, retried sends → one merged record list.

pub mod cloudkit;
pub mod config;
pub mod error;
pub mod importer;
pub mod records;
pub mod streaming;

pub use cloudkit::{HttpTransport, ReqwestTransport, RequestSigner};
pub use config::{DispatchConfig, Environment, ImportConfig, RecordGroup, RecordNameSource};
pub use error::ImportError;
pub use importer::CloudKit;
pub use records::{FieldValue, Operation, OperationType, Record, Row, SavedRecord};
