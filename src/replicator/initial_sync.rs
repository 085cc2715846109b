//! Initial sync: clone everything from a sync source, then apply the oplog
//! written while the clone ran.
//!
//! # One Attempt
//!
//! ```text
//! rollback id (before) ──► latest oplog entry = begin ──► fetcher from begin
//!        │                                                      │
//!        ↓                                                      ↓
//! set initial-sync flag ──► clone databases ──► latest entry = end
//!                                                      │
//!        ┌─────────────────────────────────────────────┘
//!        ↓
//! apply (begin, end] as the fetcher delivers it ──► rollback id (after)
//!                                                              │
//!                                   clear flag, last applied = end
//! ```
//!
//! A changed rollback id means the source rolled back under us and the
//! clone cannot be trusted; the next attempt starts over from the rollback
//! id query, on the same source if it is still the best one. Other failed
//! attempts blacklist the source (unless the failure was local). Attempts
//! retry after a pause, up to `max_attempts`.

use super::control::FetchSession;
use super::types::{InitialSyncAttempt, InitialSyncStats};
use super::Shared;
use crate::applier::{discard_applied, spawn_on, BatchApplier};
use crate::cloner::{CloneStats, DatabasesCloner};
use crate::error::{ReplicationError, Result};
use crate::fetcher::{cancelled, wait_or_cancel, FetcherEvent, FetcherHandle, OplogFetcher};
use crate::metrics;
use crate::oplog::{OpTime, Timestamp};
use crate::remote::SyncSource;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Test hook that makes every initial sync attempt fail before touching
/// the network.
#[derive(Debug, Clone, Default)]
pub struct InitialSyncFailPoint(Arc<AtomicBool>);

impl InitialSyncFailPoint {
    pub fn enable(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn disable(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    pub fn is_enabled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// A completed initial sync, with its fetcher still running.
pub(crate) struct InitialSyncOutcome {
    pub position: OpTime,
    pub session: FetchSession,
}

struct AttemptFailure {
    error: ReplicationError,
    source: Option<SyncSource>,
}

impl AttemptFailure {
    /// Failures caused by our own storage or process say nothing about the
    /// source. Neither does a rollback on the source: it is still a valid
    /// source to sync from on the next attempt.
    fn blames_source(&self) -> bool {
        !matches!(
            self.error,
            ReplicationError::Storage(_)
                | ReplicationError::Sqlite(_)
                | ReplicationError::Shutdown
                | ReplicationError::Internal(_)
                | ReplicationError::SourceRolledBack { .. }
        )
    }
}

/// What a successful attempt produced.
struct AttemptResult {
    begin: OpTime,
    end: OpTime,
    cloned: CloneStats,
    applied: ApplyTotals,
}

/// What catching up on the oplog applied.
#[derive(Debug, Default, Clone, Copy)]
struct ApplyTotals {
    ops: usize,
    missing_documents_fetched: usize,
}

pub(crate) struct InitialSyncer {
    shared: Arc<Shared>,
    apply_runtime: Option<Handle>,
    fail_point: InitialSyncFailPoint,
    applier: BatchApplier,
}

impl InitialSyncer {
    pub(crate) fn new(shared: Arc<Shared>, apply_runtime: Option<Handle>, fail_point: InitialSyncFailPoint) -> Self {
        let applier = BatchApplier::new(&shared.collaborators, &shared.config.applier);
        Self {
            shared,
            apply_runtime,
            fail_point,
            applier,
        }
    }

    pub(crate) async fn run(&self) -> Result<InitialSyncOutcome> {
        let span = info_span!("initial_sync", member = %self.shared.config.member_id);

        async move {
            let config = &self.shared.config.initial_sync;
            let max_attempts = config.max_attempts.max(1);
            let mut shutdown_rx = self.shared.shutdown_receiver();
            let mut stats = InitialSyncStats::new(max_attempts);
            let started = Instant::now();
            let mut last_error = None;

            info!(max_attempts, "Starting initial sync");

            for attempt in 1..=max_attempts {
                let attempt_started = Instant::now();
                let (events_tx, mut events_rx) = mpsc::unbounded_channel();
                let mut fetcher: Option<FetcherHandle> = None;
                let mut source: Option<SyncSource> = None;

                let result = tokio::select! {
                    biased;
                    _ = cancelled(&mut shutdown_rx) => Err(ReplicationError::Shutdown),
                    r = self.attempt(&mut source, &mut fetcher, &events_tx, &mut events_rx) => r,
                };
                let duration = attempt_started.elapsed();

                match result {
                    Ok(done) => {
                        metrics::record_initial_sync_attempt(true, duration);
                        stats.attempts.push(InitialSyncAttempt {
                            sync_source: source.clone(),
                            duration,
                            error: None,
                        });
                        stats.begin = Some(done.begin);
                        stats.end = Some(done.end);
                        stats.cloned = done.cloned;
                        stats.ops_applied = done.applied.ops;
                        stats.missing_documents_fetched = done.applied.missing_documents_fetched;
                        stats.total_duration = started.elapsed();
                        self.shared.set_initial_sync_stats(stats);

                        let Some(fetcher) = fetcher else {
                            return Err(ReplicationError::Internal("initial sync finished without a fetcher".into()));
                        };
                        info!(
                            attempt,
                            position = %done.end,
                            documents = done.cloned.documents,
                            duration_ms = started.elapsed().as_millis() as u64,
                            "Initial sync completed"
                        );
                        return Ok(InitialSyncOutcome {
                            position: done.end,
                            session: FetchSession {
                                fetcher,
                                events_tx,
                                events_rx,
                            },
                        });
                    }
                    Err(error) => {
                        metrics::record_initial_sync_attempt(false, duration);
                        // A fetcher exists once the attempt got far enough to touch storage.
                        if let Some(fetcher) = fetcher.take() {
                            fetcher.shutdown().await;
                            self.shared.buffer.clear();
                            self.clear_flag_after_failure().await;
                        }

                        stats.attempts.push(InitialSyncAttempt {
                            sync_source: source.clone(),
                            duration,
                            error: Some(error.to_string()),
                        });

                        if matches!(error, ReplicationError::Shutdown) {
                            info!(attempt, "Initial sync interrupted by shutdown");
                            stats.total_duration = started.elapsed();
                            self.shared.set_initial_sync_stats(stats);
                            return Err(ReplicationError::Shutdown);
                        }

                        let failure = AttemptFailure { error, source };
                        warn!(
                            attempt,
                            max_attempts,
                            source = failure.source.as_ref().map(|s| s.as_str()),
                            error = %failure.error,
                            "Initial sync attempt failed"
                        );
                        if let Some(source) = failure.source.as_ref().filter(|_| failure.blames_source()) {
                            self.shared.blacklist(source);
                        }
                        last_error = Some(failure.error);

                        if attempt < max_attempts
                            && wait_or_cancel(&mut shutdown_rx, config.retry_wait_duration()).await
                        {
                            stats.total_duration = started.elapsed();
                            self.shared.set_initial_sync_stats(stats);
                            return Err(ReplicationError::Shutdown);
                        }
                    }
                }
            }

            stats.total_duration = started.elapsed();
            self.shared.set_initial_sync_stats(stats);
            let cause = last_error.unwrap_or_else(|| ReplicationError::Internal("no initial sync attempt ran".into()));
            error!(attempts = max_attempts, error = %cause, "Initial sync failed");
            Err(ReplicationError::InitialSyncFailure {
                attempts: max_attempts,
                cause: Box::new(cause),
            })
        }
        .instrument(span)
        .await
    }

    /// One attempt. The chosen source and the spawned fetcher are written
    /// through the out-parameters so the caller can clean up whatever exists
    /// when the attempt fails or is abandoned.
    async fn attempt(
        &self,
        chosen: &mut Option<SyncSource>,
        fetcher: &mut Option<FetcherHandle>,
        events_tx: &mpsc::UnboundedSender<FetcherEvent>,
        events_rx: &mut mpsc::UnboundedReceiver<FetcherEvent>,
    ) -> Result<AttemptResult> {
        if self.fail_point.is_enabled() {
            return Err(ReplicationError::OperationFailed(
                "initial sync failed by fail point".into(),
            ));
        }

        let source = self.shared.choose_sync_source().ok_or(ReplicationError::NoSyncSource)?;
        *chosen = Some(source.clone());
        let client = &self.shared.collaborators.client;
        let storage = &self.shared.collaborators.storage;

        let rollback_id = client.rollback_id(&source).await?;
        let begin = self.latest_op_time(&source).await?;
        info!(%source, %begin, rollback_id, "Initial sync attempt started");

        self.shared.buffer.clear();
        let generation = self.shared.next_generation();
        *fetcher = Some(
            OplogFetcher::new(
                generation,
                source.clone(),
                begin.timestamp,
                Arc::clone(client),
                Arc::clone(&self.shared.buffer),
                self.shared.config.fetcher.clone(),
                events_tx.clone(),
            )
            .spawn(),
        );

        storage.set_initial_sync_flag(true).await?;

        let config = &self.shared.config.initial_sync;
        let cloned = DatabasesCloner::new(
            Arc::clone(client),
            Arc::clone(storage),
            source.clone(),
            config.clone_concurrency,
            config.clone_batch_size,
        )
        .run()
        .await?;

        let end = self.latest_op_time(&source).await?;
        debug!(%begin, %end, "Clone finished, catching up oplog");
        let applied = self.catch_up(&source, generation, begin, end, events_rx).await?;

        let rollback_id_after = client.rollback_id(&source).await?;
        if rollback_id_after != rollback_id {
            return Err(ReplicationError::SourceRolledBack {
                source_host: source.to_string(),
                before: rollback_id,
                after: rollback_id_after,
            });
        }

        storage.set_initial_sync_flag(false).await?;
        self.shared.reset_last_applied(end);
        metrics::set_last_applied(end);
        if let Err(e) = storage.set_applied_through(end).await {
            warn!(position = %end, error = %e, "Could not persist applied position");
        }

        Ok(AttemptResult {
            begin,
            end,
            cloned,
            applied,
        })
    }

    async fn latest_op_time(&self, source: &SyncSource) -> Result<OpTime> {
        let entry = self
            .shared
            .collaborators
            .client
            .latest_oplog_entry(source)
            .await?
            .ok_or_else(|| ReplicationError::OperationFailed(format!("sync source {} has an empty oplog", source)))?;
        OpTime::from_document(&entry)
    }

    /// Apply the oplog through `end`.
    ///
    /// The buffer is drained while the fetcher is still behind, so an oplog
    /// window larger than the buffer cap keeps moving. The catch-up timeout
    /// bounds the wait for each fetcher event, not the whole catch-up.
    async fn catch_up(
        &self,
        source: &SyncSource,
        generation: u64,
        begin: OpTime,
        end: OpTime,
        events_rx: &mut mpsc::UnboundedReceiver<FetcherEvent>,
    ) -> Result<ApplyTotals> {
        let timeout = self.shared.config.initial_sync.oplog_catch_up_timeout_duration();
        let mut position = begin;
        let mut totals = ApplyTotals::default();

        loop {
            // Checked before draining: once the fetcher has reached `end`,
            // this drain is the last one needed.
            let fetched_all = self.shared.buffer.last_pushed() >= end.timestamp;
            self.apply_buffered(source, end.timestamp, &mut position, &mut totals)
                .await?;
            if fetched_all {
                return Ok(totals);
            }

            let event = tokio::time::timeout(timeout, events_rx.recv())
                .await
                .map_err(|_| {
                    ReplicationError::OperationFailed(format!(
                        "oplog made no progress towards {} within {:?} (last fetched {})",
                        end,
                        timeout,
                        self.shared.buffer.last_pushed()
                    ))
                })?;

            match event {
                None => return Err(ReplicationError::Internal("fetcher event channel closed".into())),
                Some(event) if event.generation() != generation => {}
                Some(FetcherEvent::Batch { .. }) => {}
                Some(FetcherEvent::Divergence { source, reason, .. }) => {
                    return Err(ReplicationError::OperationFailed(format!(
                        "oplog of {} diverged during initial sync: {}",
                        source, reason
                    )));
                }
                Some(FetcherEvent::Failed { error, .. }) => return Err(error),
            }
        }
    }

    /// Apply whatever is buffered at or before `through`.
    async fn apply_buffered(
        &self,
        source: &SyncSource,
        through: Timestamp,
        position: &mut OpTime,
        totals: &mut ApplyTotals,
    ) -> Result<()> {
        let max_ops = self.shared.config.applier.max_batch_ops;

        loop {
            let mut batch = self.shared.buffer.pop_through(through, max_ops);
            if batch.is_empty() {
                return Ok(());
            }
            discard_applied(&mut batch, *position);
            if batch.is_empty() {
                continue;
            }

            let ops = batch.len();
            let started = Instant::now();
            let applier = self.applier.clone();
            let source = source.clone();
            let applied = spawn_on(self.apply_runtime.as_ref(), async move {
                applier.apply(Some(&source), &batch).await
            })
            .await
            .map_err(|e| ReplicationError::Internal(format!("apply task failed: {}", e)))??;

            metrics::record_apply_batch(ops, applied.missing_documents_fetched, started.elapsed());
            totals.ops += ops;
            totals.missing_documents_fetched += applied.missing_documents_fetched;
            *position = applied.position;
            debug!(ops, position = %*position, "Applied initial sync batch");
        }
    }

    /// Best effort: the flag is only meaningful once a sync completes.
    async fn clear_flag_after_failure(&self) {
        if let Err(e) = self.shared.collaborators.storage.set_initial_sync_flag(false).await {
            warn!(error = %e, "Could not clear initial sync flag");
        }
    }
}
