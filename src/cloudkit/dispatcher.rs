//! Concurrent, rate-limited, retrying batch dispatch.
//!
//! Every batch becomes one task. A task waits for admission, signs and sends
//! its batch, and retries transient failures with a fresh signature and a fresh
//! admission slot. Results are reassembled in submission order regardless of
//! completion order.
//!
//! Per-batch state machine:
//!
//! ```text
//! Pending -> Sending -> Succeeded
//!                    -> Retrying -> Sending
//!                    -> Failed
//! ```

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::cloudkit::client::{
    HttpRequest, HttpTransport, DATE_HEADER, JSON_CONTENT_TYPE, KEY_ID_HEADER, SIGNATURE_HEADER,
};
use crate::cloudkit::scheduler::AdmissionScheduler;
use crate::cloudkit::signer::RequestSigner;
use crate::config::DispatchConfig;
use crate::error::ImportError;
use crate::records::types::{ModifyRequest, ModifyResponse};
use crate::records::SavedRecord;
use crate::streaming::{verify_records, Batch, ChunkResult};

// ─────────────────────────────────────────────────────────────────────────────
// Constants
// ─────────────────────────────────────────────────────────────────────────────

/// Delay before the first retry.
const INITIAL_BACKOFF: Duration = Duration::from_millis(500);

/// Upper bound for the doubling backoff.
const MAX_BACKOFF: Duration = Duration::from_secs(2);

/// Upper bound for a server-provided `Retry-After`.
const MAX_RETRY_AFTER: Duration = Duration::from_secs(30);

// ─────────────────────────────────────────────────────────────────────────────
// Types
// ─────────────────────────────────────────────────────────────────────────────

/// Lifecycle of one batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchState {
    Pending,
    Sending,
    Retrying,
    Succeeded,
    Failed,
}

impl BatchState {
    pub fn is_terminal(self) -> bool {
        matches!(self, BatchState::Succeeded | BatchState::Failed)
    }
}

/// Source of request timestamps.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Target of every request: full URL and the path that gets signed.
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub url: Url,
    pub path: String,
}

/// A failed attempt plus any server-requested delay.
struct AttemptError {
    error: ImportError,
    retry_after: Option<Duration>,
}

impl From<ImportError> for AttemptError {
    fn from(error: ImportError) -> Self {
        Self {
            error,
            retry_after: None,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Dispatcher
// ─────────────────────────────────────────────────────────────────────────────

/// Sends batches under one admission budget.
///
/// Each instance owns its scheduler, so separate dispatchers never share
/// concurrency or rate limits.
pub struct Dispatcher<T: HttpTransport> {
    transport: Arc<T>,
    signer: Arc<RequestSigner>,
    endpoint: Endpoint,
    scheduler: AdmissionScheduler,
    config: DispatchConfig,
    cancel: CancellationToken,
    clock: Clock,
}

impl<T: HttpTransport + 'static> Dispatcher<T> {
    /// # Errors
    ///
    /// Returns `ImportError::Config` if the dispatch limits are invalid.
    pub fn new(
        transport: Arc<T>,
        signer: Arc<RequestSigner>,
        endpoint: Endpoint,
        config: DispatchConfig,
    ) -> Result<Self, ImportError> {
        config.validate()?;

        Ok(Self {
            transport,
            signer,
            endpoint,
            scheduler: AdmissionScheduler::new(
                config.concurrency,
                config.interval,
                config.interval_cap,
            ),
            config,
            cancel: CancellationToken::new(),
            clock: Arc::new(Utc::now),
        })
    }

    /// Uses a caller-owned token; cancelling it abandons batches not yet
    /// admitted.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Replaces the timestamp source used for signing.
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Sends every batch and returns one result per batch, in input order.
    ///
    /// Completes only after every batch is terminal. Failures stay local to
    /// their batch.
    pub async fn dispatch(self: Arc<Self>, batches: Vec<Batch>) -> Vec<ChunkResult> {
        let total = batches.len();
        if total == 0 {
            return Vec::new();
        }

        let deadline_timer = self.config.deadline.map(|deadline| {
            let cancel = self.cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(deadline).await;
                warn!("[DISPATCH] Deadline of {:?} reached, abandoning queued batches", deadline);
                cancel.cancel();
            })
        });

        let meta: Vec<(usize, String)> = batches
            .iter()
            .map(|b| (b.index, b.record_type.clone()))
            .collect();

        let mut join_set: JoinSet<(usize, ChunkResult)> = JoinSet::new();
        for (position, batch) in batches.into_iter().enumerate() {
            let dispatcher = self.clone();
            join_set.spawn(async move { (position, dispatcher.run_batch(batch).await) });
        }

        let mut slots: Vec<Option<ChunkResult>> = (0..total).map(|_| None).collect();
        let mut completed = 0usize;

        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((position, result)) => {
                    completed += 1;
                    debug!(
                        "[DISPATCH] Batch {} settled ({}/{}), {} in flight",
                        result.index,
                        completed,
                        total,
                        self.scheduler.in_flight()
                    );
                    slots[position] = Some(result);
                }
                Err(e) => {
                    warn!("[DISPATCH] Task join error: {:?}", e);
                }
            }
        }

        if let Some(timer) = deadline_timer {
            timer.abort();
        }

        slots
            .into_iter()
            .zip(meta)
            .map(|(slot, (index, record_type))| {
                slot.unwrap_or_else(|| ChunkResult {
                    index,
                    record_type,
                    attempts: 0,
                    result: Err(ImportError::Internal(
                        "batch task ended without a result".to_string(),
                    )),
                })
            })
            .collect()
    }

    /// Drives one batch to a terminal state.
    async fn run_batch(&self, batch: Batch) -> ChunkResult {
        let body = match serde_json::to_vec(&ModifyRequest {
            operations: &batch.operations,
        }) {
            Ok(body) => body,
            Err(e) => return self.finish(&batch, 0, Err(e.into())),
        };

        let mut state = BatchState::Pending;
        let mut attempts: u32 = 0;
        let mut backoff = INITIAL_BACKOFF;

        loop {
            let permit = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    self.transition(&batch, &mut state, BatchState::Failed);
                    return self.finish(
                        &batch,
                        attempts,
                        Err(ImportError::Cancelled {
                            record_type: batch.record_type.clone(),
                            batch: batch.index,
                        }),
                    );
                }
                permit = self.scheduler.acquire() => permit,
            };

            attempts += 1;
            self.transition(&batch, &mut state, BatchState::Sending);
            if attempts == 1 {
                info!(
                    "[DISPATCH] Writing {}-{} of {} {}...",
                    batch.range.start,
                    batch.range.end,
                    batch.group_len,
                    batch.record_type
                );
            }

            let outcome = self.send_once(&batch, &body).await;
            drop(permit);

            let failure = match outcome {
                Ok(records) => {
                    self.transition(&batch, &mut state, BatchState::Succeeded);
                    return self.finish(&batch, attempts, Ok(records));
                }
                Err(failure) => failure,
            };

            if !failure.error.is_retryable() {
                self.transition(&batch, &mut state, BatchState::Failed);
                return self.finish(&batch, attempts, Err(failure.error));
            }

            if attempts > self.config.retries {
                self.transition(&batch, &mut state, BatchState::Failed);
                return self.finish(
                    &batch,
                    attempts,
                    Err(ImportError::RetriesExhausted {
                        record_type: batch.record_type.clone(),
                        batch: batch.index,
                        attempts,
                        last: Box::new(failure.error),
                    }),
                );
            }

            let delay = failure
                .retry_after
                .map(|d| d.min(MAX_RETRY_AFTER))
                .map_or(backoff, |d| d.max(backoff));

            warn!(
                "[DISPATCH] Batch {} ({}) attempt {}/{} failed: {}; retrying in {}ms",
                batch.index,
                batch.record_type,
                attempts,
                self.config.retries + 1,
                failure.error,
                delay.as_millis()
            );

            self.transition(&batch, &mut state, BatchState::Retrying);
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    self.transition(&batch, &mut state, BatchState::Failed);
                    return self.finish(
                        &batch,
                        attempts,
                        Err(ImportError::Cancelled {
                            record_type: batch.record_type.clone(),
                            batch: batch.index,
                        }),
                    );
                }
                _ = tokio::time::sleep(delay) => {}
            }
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    }

    /// One signed request. Signs with the current clock every time.
    async fn send_once(&self, batch: &Batch, body: &[u8]) -> Result<Vec<SavedRecord>, AttemptError> {
        let signature = self
            .signer
            .sign_at(body, &self.endpoint.path, (self.clock)())?;

        let request = HttpRequest {
            url: self.endpoint.url.clone(),
            headers: vec![
                (KEY_ID_HEADER, self.signer.key_id().to_string()),
                (DATE_HEADER, signature.timestamp),
                (SIGNATURE_HEADER, signature.signature),
                ("Content-Type", JSON_CONTENT_TYPE.to_string()),
            ],
            body: body.to_vec(),
        };

        let response = self.transport.post(request).await?;

        if !response.is_success() {
            return Err(AttemptError {
                error: ImportError::ServerRejected {
                    status: response.status,
                    body: response.body_text(),
                },
                retry_after: response.retry_after_secs.map(Duration::from_secs),
            });
        }

        let parsed: ModifyResponse =
            serde_json::from_slice(&response.body).map_err(|e| ImportError::ServerRejected {
                status: response.status,
                body: format!("unparseable response ({}): {}", e, response.body_text()),
            })?;

        verify_records(&batch.record_type, &parsed.records)?;

        if parsed.records.len() != batch.len() {
            warn!(
                "[DISPATCH] Batch {} ({}) sent {} operations but got {} records back",
                batch.index,
                batch.record_type,
                batch.len(),
                parsed.records.len()
            );
        }

        Ok(parsed.records)
    }

    fn transition(&self, batch: &Batch, state: &mut BatchState, next: BatchState) {
        debug!(
            "[DISPATCH] Batch {} ({}) {:?} -> {:?}",
            batch.index, batch.record_type, state, next
        );
        *state = next;
    }

    fn finish(
        &self,
        batch: &Batch,
        attempts: u32,
        result: Result<Vec<SavedRecord>, ImportError>,
    ) -> ChunkResult {
        if let Err(e) = &result {
            warn!(
                "[DISPATCH] Batch {} ({}) failed after {} attempt(s): {}",
                batch.index, batch.record_type, attempts, e
            );
        }
        ChunkResult {
            index: batch.index,
            record_type: batch.record_type.clone(),
            attempts,
            result,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
