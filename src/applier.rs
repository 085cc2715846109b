//! Applier: hands buffered oplog batches to the apply callback.
//!
//! Batches run one at a time on a dedicated task (optionally on a separate
//! runtime) so a slow apply never blocks the control loop.
//!
//! # Missing Documents
//!
//! ```text
//! apply(batch) ── NoMatchingDocument{ns, key} ──► find_one(source, ns, key)
//!      ▲                                                │
//!      └──────── insert_missing_document(ns, doc) ◄─────┘
//! ```
//!
//! The whole batch is re-applied after each fetched document, so the apply
//! callback must tolerate replays. After `max_missing_document_fetches`
//! rounds the batch fails with `OperationFailed`.

use crate::config::ApplierConfig;
use crate::error::{ReplicationError, Result};
use crate::external::{Collaborators, OplogApplier};
use crate::metrics;
use crate::oplog::{OpTime, OplogRecord};
use crate::remote::{SyncSource, SyncSourceClient};
use crate::storage::StorageInterface;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, warn, Instrument};

/// Work item for the applier task.
#[derive(Debug)]
pub struct ApplyRequest {
    pub generation: u64,
    pub source: Option<SyncSource>,
    pub batch: Vec<OplogRecord>,
}

/// Result of one apply request, returned with the batch so a failure can be requeued.
#[derive(Debug)]
pub struct ApplyOutcome {
    pub generation: u64,
    pub batch: Vec<OplogRecord>,
    pub result: Result<AppliedBatch>,
    pub duration: Duration,
}

/// A successfully applied batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppliedBatch {
    pub position: OpTime,
    pub missing_documents_fetched: usize,
}

/// Drop records at or before `last_applied`. Returns how many were dropped.
pub fn discard_applied(batch: &mut Vec<OplogRecord>, last_applied: OpTime) -> usize {
    let before = batch.len();
    batch.retain(|r| r.timestamp() > last_applied.timestamp);
    before - batch.len()
}

/// Spawn `fut` on `runtime` if given, else on the current runtime.
pub fn spawn_on<F>(runtime: Option<&Handle>, fut: F) -> JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    match runtime {
        Some(handle) => handle.spawn(fut),
        None => tokio::spawn(fut),
    }
}

/// Applies batches with missing-document recovery.
#[derive(Clone)]
pub struct BatchApplier {
    applier: Arc<dyn OplogApplier>,
    client: Arc<dyn SyncSourceClient>,
    storage: Arc<dyn StorageInterface>,
    max_missing_document_fetches: usize,
}

impl BatchApplier {
    pub fn new(collaborators: &Collaborators, config: &ApplierConfig) -> Self {
        Self {
            applier: Arc::clone(&collaborators.applier),
            client: Arc::clone(&collaborators.client),
            storage: Arc::clone(&collaborators.storage),
            max_missing_document_fetches: config.max_missing_document_fetches,
        }
    }

    /// Apply `batch`, fetching documents the apply callback reports missing.
    ///
    /// The returned position is the last record's `(timestamp, term)`.
    pub async fn apply(&self, source: Option<&SyncSource>, batch: &[OplogRecord]) -> Result<AppliedBatch> {
        let last = batch
            .last()
            .ok_or_else(|| ReplicationError::Internal("apply called with an empty batch".into()))?;
        let expected = last.op_time();
        let mut fetched = 0usize;

        loop {
            match self.applier.apply_batch(batch).await {
                Ok(reported) => {
                    if reported != expected {
                        warn!(%reported, %expected, "Apply callback reported a different position than the batch end");
                    }
                    if let Err(e) = self.storage.set_applied_through(expected).await {
                        warn!(error = %e, position = %expected, "Failed to persist applied position");
                    }
                    return Ok(AppliedBatch {
                        position: expected,
                        missing_documents_fetched: fetched,
                    });
                }
                Err(ReplicationError::NoMatchingDocument { ns, document_key }) => {
                    if fetched >= self.max_missing_document_fetches {
                        return Err(ReplicationError::OperationFailed(format!(
                            "batch still missing documents after {} fetches (last: {} {})",
                            fetched, ns, document_key
                        )));
                    }
                    let source = source.ok_or(ReplicationError::NoSyncSource)?;
                    self.fetch_missing_document(source, &ns, &document_key).await?;
                    fetched += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn fetch_missing_document(
        &self,
        source: &SyncSource,
        ns: &str,
        document_key: &serde_json::Value,
    ) -> Result<()> {
        match self.client.find_one(source, ns, document_key).await? {
            Some(doc) => {
                debug!(%source, ns, key = %document_key, "Fetched missing document");
                self.storage.insert_missing_document(ns, &doc).await
            }
            None => {
                // Deleted on the source since; a later oplog entry will account for it.
                debug!(%source, ns, key = %document_key, "Missing document no longer exists on source");
                Ok(())
            }
        }
    }
}

/// Start the applier task. It exits when `requests` closes, after finishing
/// any batch in flight.
pub fn spawn_applier(
    applier: BatchApplier,
    requests: mpsc::Receiver<ApplyRequest>,
    outcomes: mpsc::UnboundedSender<ApplyOutcome>,
    runtime: Option<&Handle>,
) -> JoinHandle<()> {
    spawn_on(runtime, run_applier(applier, requests, outcomes))
}

async fn run_applier(
    applier: BatchApplier,
    mut requests: mpsc::Receiver<ApplyRequest>,
    outcomes: mpsc::UnboundedSender<ApplyOutcome>,
) {
    let span = info_span!("applier");

    async move {
        info!("Starting applier");

        while let Some(request) = requests.recv().await {
            let started = Instant::now();
            let ops = request.batch.len();
            let result = applier.apply(request.source.as_ref(), &request.batch).await;
            let duration = started.elapsed();

            match &result {
                Ok(applied) => {
                    metrics::record_apply_batch(ops, applied.missing_documents_fetched, duration);
                    debug!(ops, position = %applied.position, "Applied batch");
                }
                Err(e) => {
                    metrics::record_apply_error(e.kind());
                    warn!(ops, error = %e, "Apply batch failed");
                }
            }

            let outcome = ApplyOutcome {
                generation: request.generation,
                batch: request.batch,
                result,
                duration,
            };
            if outcomes.send(outcome).is_err() {
                debug!("Control loop gone, stopping applier");
                break;
            }
        }

        info!("Applier stopped");
    }
    .instrument(span)
    .await
}
