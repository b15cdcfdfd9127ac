//! Result merging for multi-batch writes.
//!
//! Every batch produces one `ChunkResult`. Successful results are concatenated
//! in submission order; any failure fails the whole call. There is no partial
//! success: records from batches that did succeed are not rolled back, but
//! they are not returned either.

use tracing::{info, warn};

use crate::error::ImportError;
use crate::records::SavedRecord;

// ─────────────────────────────────────────────────────────────────────────────
// Public Types
// ─────────────────────────────────────────────────────────────────────────────

/// Terminal outcome of one batch.
#[derive(Debug)]
pub struct ChunkResult {
    /// Submission index of the batch.
    pub index: usize,
    pub record_type: String,
    /// Send attempts made (0 if the batch was never admitted).
    pub attempts: u32,
    pub result: Result<Vec<SavedRecord>, ImportError>,
}

impl ChunkResult {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Record-level checks
// ─────────────────────────────────────────────────────────────────────────────

/// Fails on the first record carrying a `serverErrorCode`.
///
/// A 2xx `records/modify` response can still report per-record failures;
/// the batch counts as failed when any record does.
pub fn verify_records(record_type: &str, records: &[SavedRecord]) -> Result<(), ImportError> {
    match records.iter().find(|r| r.server_error_code.is_some()) {
        Some(failed) => Err(ImportError::RecordError {
            record_type: failed
                .record_type
                .clone()
                .unwrap_or_else(|| record_type.to_string()),
            record_name: failed.record_name.clone(),
            code: failed.server_error_code.clone().unwrap_or_default(),
            reason: failed.reason.clone().unwrap_or_default(),
        }),
        None => Ok(()),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Aggregation
// ─────────────────────────────────────────────────────────────────────────────

/// Merges batch results in submission order.
///
/// # Errors
///
/// Returns the failure of the lowest-indexed failed batch.
pub fn aggregate(mut results: Vec<ChunkResult>) -> Result<Vec<SavedRecord>, ImportError> {
    results.sort_by_key(|r| r.index);

    let failed = results.iter().filter(|r| !r.is_success()).count();
    if failed > 0 {
        warn!(
            "[IMPORT] {} of {} batches failed",
            failed,
            results.len()
        );
    }

    let total: usize = results
        .iter()
        .filter_map(|r| r.result.as_ref().ok())
        .map(Vec::len)
        .sum();
    let mut merged = Vec::with_capacity(total);
    let batch_count = results.len();

    for chunk in results {
        match chunk.result {
            Ok(records) => {
                verify_records(&chunk.record_type, &records)?;
                merged.extend(records);
            }
            Err(e) => return Err(e),
        }
    }

    info!(
        "[IMPORT] {} records saved across {} batches",
        merged.len(),
        batch_count
    );

    Ok(merged)
}
