use thiserror::Error;

/// Patterns (lowercase) that indicate key material inside a message.
/// Used by `contains_sensitive()` for case-insensitive matching.
pub(crate) const SENSITIVE_PATTERNS: &[&str] = &[
    "private key",
    "-----begin",
    "signaturev1",
];

/// Returns true if the message contains any sensitive pattern (case-insensitive).
fn contains_sensitive(msg: &str) -> bool {
    let lower = msg.to_ascii_lowercase();
    SENSITIVE_PATTERNS.iter().any(|p| lower.contains(p))
}

/// Sanitizes a message before it is embedded in an error.
/// If sensitive content is detected, returns the fallback instead.
pub(crate) fn sanitize_message(msg: &str, fallback: &str) -> String {
    if contains_sensitive(msg) {
        fallback.into()
    } else {
        msg.to_string()
    }
}

/// Crate-wide error type.
#[derive(Debug, Error)]
pub enum ImportError {
    // ── Configuration ─────────────────────────────────────────────────────────
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Invalid private key: {0}")]
    InvalidKey(String),

    // ── Network ───────────────────────────────────────────────────────────────
    #[error("Connection failed: {0}")]
    Transport(String),

    #[error("CloudKit rejected the request (HTTP {status}): {body}")]
    ServerRejected { status: u16, body: String },

    #[error("CloudKit reported {code} for {record_type} record {}: {reason}", record_name.as_deref().unwrap_or("<unnamed>"))]
    RecordError {
        record_type: String,
        record_name: Option<String>,
        code: String,
        reason: String,
    },

    // ── Batches ───────────────────────────────────────────────────────────────
    #[error("Batch {batch} of {record_type} failed after {attempts} attempts: {last}")]
    RetriesExhausted {
        record_type: String,
        batch: usize,
        attempts: u32,
        last: Box<ImportError>,
    },

    #[error("Operation cancelled before batch {batch} of {record_type} was sent")]
    Cancelled { record_type: String, batch: usize },

    // ── Input ─────────────────────────────────────────────────────────────────
    #[error("Invalid CSV: {0}")]
    Csv(String),

    // ── Generic fallback ──────────────────────────────────────────────────────
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ImportError {
    /// Whether a failed send attempt may be retried.
    ///
    /// Record-level errors are treated like rejected requests: the whole batch
    /// is resubmitted.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ImportError::Transport(_)
                | ImportError::ServerRejected { .. }
                | ImportError::RecordError { .. }
        )
    }

    /// Record type of the batch this error belongs to, when known.
    pub fn record_type(&self) -> Option<&str> {
        match self {
            ImportError::RecordError { record_type, .. }
            | ImportError::RetriesExhausted { record_type, .. }
            | ImportError::Cancelled { record_type, .. } => Some(record_type),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for ImportError {
    fn from(e: serde_json::Error) -> Self {
        ImportError::Internal(format!("JSON error: {}", e))
    }
}
