//! Caller-facing entry points.
//!
//! `CloudKit` holds the credentials and the transport; every call runs the
//! full pipeline: validate, build operations, batch, dispatch, aggregate.

use std::path::Path;
use std::sync::Arc;

use secrecy::SecretString;
use tokio_util::sync::CancellationToken;
use tracing::info;
use url::Url;

use crate::cloudkit::client::{build_url, modify_path, DEFAULT_API_BASE};
use crate::cloudkit::{Dispatcher, Endpoint, HttpTransport, ReqwestTransport, RequestSigner};
use crate::config::ImportConfig;
use crate::error::ImportError;
use crate::records::{build, OperationType, Row, SavedRecord};
use crate::streaming::{aggregate, chunk_groups, read_csv_file, read_csv_str};

/// Authenticated client for bulk writes and deletes against one CloudKit
/// server-to-server key.
pub struct CloudKit<T: HttpTransport = ReqwestTransport> {
    signer: Arc<RequestSigner>,
    transport: Arc<T>,
    api_base: Url,
    cancel: Option<CancellationToken>,
}

impl<T: HttpTransport> std::fmt::Debug for CloudKit<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloudKit")
            .field("signer", &self.signer)
            .field("api_base", &self.api_base.as_str())
            .finish()
    }
}

impl CloudKit<ReqwestTransport> {
    /// Creates a client from a key identifier and a PEM-encoded private key.
    ///
    /// # Errors
    ///
    /// Returns `ImportError::InvalidKey` if the key cannot be parsed, or
    /// `ImportError::Internal` if the HTTP client fails to initialize.
    pub fn new(key_id: impl Into<String>, private_key_pem: SecretString) -> Result<Self, ImportError> {
        let signer = RequestSigner::from_pem(key_id, &private_key_pem)?;
        Ok(Self::from_parts(signer, ReqwestTransport::new()?))
    }
}

impl<T: HttpTransport + 'static> CloudKit<T> {
    /// Builds a client around an existing signer and transport.
    pub fn from_parts(signer: RequestSigner, transport: T) -> Self {
        Self {
            signer: Arc::new(signer),
            transport: Arc::new(transport),
            api_base: default_api_base(),
            cancel: None,
        }
    }

    /// Swaps the transport, keeping credentials and settings.
    pub fn with_transport<U: HttpTransport + 'static>(self, transport: U) -> CloudKit<U> {
        CloudKit {
            signer: self.signer,
            transport: Arc::new(transport),
            api_base: self.api_base,
            cancel: self.cancel,
        }
    }

    /// Points requests at a different host.
    ///
    /// # Errors
    ///
    /// Returns `ImportError::Config` if `api_base` is not an absolute URL.
    pub fn with_api_base(mut self, api_base: &str) -> Result<Self, ImportError> {
        self.api_base = Url::parse(api_base)
            .map_err(|e| ImportError::Config(format!("Invalid API base {}: {}", api_base, e)))?;
        Ok(self)
    }

    /// Cancelling `cancel` abandons batches that have not been admitted yet.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn key_id(&self) -> &str {
        self.signer.key_id()
    }

    /// Creates or updates records using `config.operation_type`.
    ///
    /// # Errors
    ///
    /// Configuration errors fail before any request is sent. Otherwise the
    /// first failed batch in submission order is returned once every batch has
    /// settled; batches that already succeeded are not rolled back.
    pub async fn write(&self, rows: Vec<Row>, config: &ImportConfig) -> Result<Vec<SavedRecord>, ImportError> {
        self.run(rows, config.operation_type, config).await
    }

    /// Deletes the records named by `rows` with `forceDelete`.
    pub async fn remove(&self, rows: Vec<Row>, config: &ImportConfig) -> Result<Vec<SavedRecord>, ImportError> {
        self.run(rows, OperationType::ForceDelete, config).await
    }

    /// Parses CSV text (header row required) and writes it.
    pub async fn import_csv(&self, csv: &str, config: &ImportConfig) -> Result<Vec<SavedRecord>, ImportError> {
        config.validate()?;
        let rows = read_csv_str(csv)?;
        self.write(rows, config).await
    }

    /// Reads a CSV file and writes it.
    pub async fn import_csv_file(
        &self,
        path: impl AsRef<Path>,
        config: &ImportConfig,
    ) -> Result<Vec<SavedRecord>, ImportError> {
        config.validate()?;
        let rows = read_csv_file(path.as_ref()).await?;
        self.write(rows, config).await
    }

    async fn run(
        &self,
        rows: Vec<Row>,
        operation_type: OperationType,
        config: &ImportConfig,
    ) -> Result<Vec<SavedRecord>, ImportError> {
        config.validate()?;

        let row_count = rows.len();
        let groups = build(rows, operation_type, config)?;
        let batches = chunk_groups(groups, config.effective_chunk_size())?;

        info!(
            "[IMPORT] {:?} {} rows in {} batches to {} ({})",
            operation_type,
            row_count,
            batches.len(),
            config.container,
            config.environment
        );

        if batches.is_empty() {
            return Ok(Vec::new());
        }

        let path = modify_path(&config.container, config.environment);
        let endpoint = Endpoint {
            url: build_url(&self.api_base, &path)?,
            path,
        };

        let mut dispatcher = Dispatcher::new(
            self.transport.clone(),
            self.signer.clone(),
            endpoint,
            config.dispatch,
        )?;
        if let Some(cancel) = &self.cancel {
            dispatcher = dispatcher.with_cancellation(cancel.child_token());
        }

        let results = Arc::new(dispatcher).dispatch(batches).await;
        aggregate(results)
    }
}

fn default_api_base() -> Url {
    // Compile-time constant; parsing cannot fail.
    Url::parse(DEFAULT_API_BASE).expect("default API base is a valid URL")
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloudkit::client::{DATE_HEADER, KEY_ID_HEADER, SIGNATURE_HEADER};
    use crate::config::{Environment, RecordGroup, RecordNameSource};
    use p256::pkcs8::{EncodePrivateKey, LineEnding};
    use serde_json::{json, Value};
    use std::io::Write;
    use wiremock::matchers::{header_exists, method, path};
    use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

    const MODIFY: &str = "/database/1/iCloud.com.example/development/public/records/modify";

    fn pem() -> SecretString {
        let secret = p256::SecretKey::from_slice(&[0x44; 32]).unwrap();
        SecretString::from(secret.to_pkcs8_pem(LineEnding::LF).unwrap().to_string())
    }

    async fn client(server: &MockServer) -> CloudKit {
        CloudKit::new("key-1", pem())
            .unwrap()
            .with_api_base(&server.uri())
            .unwrap()
    }

    fn config() -> ImportConfig {
        ImportConfig::new("iCloud.com.example", Environment::Development)
            .record_type("Note")
            .interval_cap(100)
    }

    fn row(name: &str, title: &str) -> Row {
        let mut row = Row::new();
        row.insert("recordName".into(), json!(name));
        row.insert("title".into(), json!(title));
        row
    }

    /// Echoes submitted operations back as saved records.
    struct Echo;

    impl Respond for Echo {
        fn respond(&self, request: &Request) -> ResponseTemplate {
            let body: Value = serde_json::from_slice(&request.body).unwrap();
            let records: Vec<Value> = body["operations"]
                .as_array()
                .unwrap()
                .iter()
                .map(|op| {
                    json!({
                        "recordName": op["record"]["recordName"],
                        "recordType": op["record"]["recordType"],
                        "deleted": op["operationType"] == "forceDelete"
                    })
                })
                .collect();
            ResponseTemplate::new(200).set_body_json(json!({ "records": records }))
        }
    }

    async fn sent_bodies(server: &MockServer) -> Vec<Value> {
        server
            .received_requests()
            .await
            .unwrap()
            .iter()
            .map(|r| serde_json::from_slice(&r.body).unwrap())
            .collect()
    }

    #[test]
    fn test_bad_key_is_rejected_up_front() {
        let err = CloudKit::new("key-1", SecretString::from("nope".to_string())).unwrap_err();
        assert!(matches!(err, ImportError::InvalidKey(_)));
    }

    #[test]
    fn test_debug_does_not_leak_key() {
        let ck = CloudKit::new("key-1", pem()).unwrap();
        let debug = format!("{:?}", ck);
        assert!(debug.contains("key-1"));
        assert!(!debug.contains("PRIVATE KEY"));
    }

    #[tokio::test]
    async fn test_write_sends_signed_batches_in_order() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(MODIFY))
            .and(header_exists(KEY_ID_HEADER))
            .and(header_exists(DATE_HEADER))
            .and(header_exists(SIGNATURE_HEADER))
            .respond_with(Echo)
            .expect(3)
            .mount(&server)
            .await;

        let rows: Vec<Row> = (0..450).map(|i| row(&format!("n-{}", i), "t")).collect();
        let records = client(&server)
            .await
            .write(rows, &config().operation_type(OperationType::ForceUpdate))
            .await
            .unwrap();

        assert_eq!(records.len(), 450);
        for (i, record) in records.iter().enumerate() {
            assert_eq!(record.record_name.as_deref(), Some(format!("n-{}", i).as_str()));
        }

        let mut sizes: Vec<usize> = sent_bodies(&server)
            .await
            .iter()
            .map(|b| b["operations"].as_array().unwrap().len())
            .collect();
        sizes.sort_unstable();
        assert_eq!(sizes, vec![50, 200, 200]);
    }

    #[tokio::test]
    async fn test_write_wraps_fields_and_omits_record_name_from_fields() {
        let server = MockServer::start().await;
        Mock::given(method("POST")).respond_with(Echo).mount(&server).await;

        client(&server)
            .await
            .write(vec![row("n-1", "Hello")], &config())
            .await
            .unwrap();

        let bodies = sent_bodies(&server).await;
        assert_eq!(
            bodies[0],
            json!({
                "operations": [{
                    "operationType": "create",
                    "record": {
                        "recordName": "n-1",
                        "recordType": "Note",
                        "fields": { "title": { "value": "Hello" } }
                    }
                }]
            })
        );
    }

    #[tokio::test]
    async fn test_remove_uses_force_delete_without_fields() {
        let server = MockServer::start().await;
        Mock::given(method("POST")).respond_with(Echo).mount(&server).await;

        let records = client(&server)
            .await
            .remove(vec![row("n-1", "x"), row("n-2", "y")], &config())
            .await
            .unwrap();

        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| r.deleted == Some(true)));

        let bodies = sent_bodies(&server).await;
        for op in bodies[0]["operations"].as_array().unwrap() {
            assert_eq!(op["operationType"], "forceDelete");
            assert!(op["record"].get("fields").is_none());
        }
    }

    #[tokio::test]
    async fn test_config_errors_send_nothing() {
        let server = MockServer::start().await;
        let ck = client(&server).await;

        let err = ck
            .write(vec![row("n-1", "x")], &config().chunk_size(0))
            .await
            .unwrap_err();
        assert!(matches!(err, ImportError::Config(_)));

        let missing_type = ImportConfig::new("iCloud.com.example", Environment::Development);
        let err = ck.write(vec![row("n-1", "x")], &missing_type).await.unwrap_err();
        assert!(matches!(err, ImportError::Config(_)));

        let mut nameless = Row::new();
        nameless.insert("title".into(), json!("x"));
        let err = ck.remove(vec![nameless], &config()).await.unwrap_err();
        assert!(matches!(err, ImportError::Config(_)));

        assert!(server.received_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_empty_input_makes_no_requests() {
        let server = MockServer::start().await;
        let records = client(&server).await.write(Vec::new(), &config()).await.unwrap();
        assert!(records.is_empty());
        assert!(server.received_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_persistent_rejection_surfaces_server_payload() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(400)
                    .set_body_string(r#"{"serverErrorCode":"BAD_REQUEST","reason":"Unknown field"}"#),
            )
            .mount(&server)
            .await;

        let err = client(&server)
            .await
            .write(vec![row("n-1", "x")], &config().retries(1))
            .await
            .unwrap_err();

        assert_eq!(err.record_type(), Some("Note"));
        let message = err.to_string();
        assert!(message.contains("BAD_REQUEST"), "{}", message);
        assert!(message.contains("Unknown field"), "{}", message);
        assert_eq!(server.received_requests().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_prepare_splits_record_types_into_separate_batches() {
        let server = MockServer::start().await;
        Mock::given(method("POST")).respond_with(Echo).mount(&server).await;

        let cfg = ImportConfig::new("iCloud.com.example", Environment::Development)
            .chunk_size(2)
            .record_name(RecordNameSource::Field("id".into()))
            .prepare(|rows| {
                let (a, b): (Vec<Row>, Vec<Row>) =
                    rows.into_iter().partition(|r| r["kind"] == json!("a"));
                vec![RecordGroup::new("Alpha", a), RecordGroup::new("Beta", b)]
            });

        let rows = ["a", "b", "a", "b", "a"]
            .iter()
            .enumerate()
            .map(|(i, kind)| {
                let mut r = Row::new();
                r.insert("id".into(), json!(format!("id-{}", i)));
                r.insert("kind".into(), json!(kind));
                r
            })
            .collect();

        let records = client(&server).await.write(rows, &cfg).await.unwrap();

        let types: Vec<&str> = records
            .iter()
            .filter_map(|r| r.record_type.as_deref())
            .collect();
        assert_eq!(types, vec!["Alpha", "Alpha", "Alpha", "Beta", "Beta"]);

        for body in sent_bodies(&server).await {
            let ops = body["operations"].as_array().unwrap();
            let first = &ops[0]["record"]["recordType"];
            assert!(ops.iter().all(|op| &op["record"]["recordType"] == first));
        }
    }

    #[tokio::test]
    async fn test_import_csv_text() {
        let server = MockServer::start().await;
        Mock::given(method("POST")).respond_with(Echo).mount(&server).await;

        let csv = "recordName,title\nn-1,First\nn-2,Second\n";
        let records = client(&server).await.import_csv(csv, &config()).await.unwrap();

        assert_eq!(records.len(), 2);
        let bodies = sent_bodies(&server).await;
        assert_eq!(
            bodies[0]["operations"][1]["record"]["fields"]["title"]["value"],
            "Second"
        );
    }

    #[tokio::test]
    async fn test_import_csv_file_reads_from_disk() {
        let server = MockServer::start().await;
        Mock::given(method("POST")).respond_with(Echo).mount(&server).await;

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "recordName,title").unwrap();
        writeln!(file, "n-1,From disk").unwrap();
        file.flush().unwrap();

        let records = client(&server)
            .await
            .import_csv_file(file.path(), &config())
            .await
            .unwrap();

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].record_name.as_deref(), Some("n-1"));
    }

    #[tokio::test]
    async fn test_cancelled_client_abandons_batches() {
        let server = MockServer::start().await;
        Mock::given(method("POST")).respond_with(Echo).mount(&server).await;

        let cancel = CancellationToken::new();
        cancel.cancel();
        let ck = client(&server).await.with_cancellation(cancel);

        let err = ck.write(vec![row("n-1", "x")], &config()).await.unwrap_err();
        assert!(matches!(err, ImportError::Cancelled { .. }));
        assert!(server.received_requests().await.unwrap().is_empty());
    }
}
