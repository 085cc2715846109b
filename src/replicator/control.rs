// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Steady-state control loop.
//!
//! A single task owns every steady-state decision. Everything else reports
//! to it through channels:
//!
//! ```text
//!  OplogFetcher ──FetcherEvent──┐
//!  Applier task ──ApplyOutcome──┼──► ControlLoop ──ApplyRequest──► Applier task
//!  DataReplicator ──Command─────┤        │
//!  shutdown watch ──────────────┘        └──► state, sync source, last applied
//! ```
//!
//! At most one apply batch is in flight. A divergence seen while a batch
//! is applying is parked until that batch completes, then rolled back.
//! Fetcher events carry the generation of the session that sent them and
//! anything from a replaced session is dropped.

use super::rollback::{RollbackAction, RollbackAttempt};
use super::{DataReplicatorState, Shared};
use crate::applier::{discard_applied, spawn_applier, ApplyOutcome, ApplyRequest, BatchApplier};
use crate::external::MemberState;
use crate::fetcher::{cancelled, DivergenceReason, FetcherEvent, FetcherHandle, OplogFetcher};
use crate::metrics;
use crate::oplog::{OpTime, Timestamp};
use crate::remote::SyncSource;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Requests delivered to the control loop from outside, or from its own timers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Command {
    /// Application was resumed; apply whatever is buffered.
    Resume,
    /// Retry the batch that failed to apply.
    RetryApply,
    /// Try again to find a sync source.
    ChooseSyncSource,
}

/// A fetcher already running when the loop starts, handed over by initial sync.
pub(crate) struct FetchSession {
    pub fetcher: FetcherHandle,
    pub events_tx: mpsc::UnboundedSender<FetcherEvent>,
    pub events_rx: mpsc::UnboundedReceiver<FetcherEvent>,
}

pub(crate) struct ControlLoop {
    shared: Arc<Shared>,

    commands_tx: mpsc::UnboundedSender<Command>,
    commands_rx: mpsc::UnboundedReceiver<Command>,
    shutdown_rx: watch::Receiver<bool>,

    events_tx: mpsc::UnboundedSender<FetcherEvent>,
    events_rx: mpsc::UnboundedReceiver<FetcherEvent>,
    fetcher: Option<FetcherHandle>,

    apply_tx: Option<mpsc::Sender<ApplyRequest>>,
    outcome_rx: mpsc::UnboundedReceiver<ApplyOutcome>,
    applier_task: Option<JoinHandle<()>>,
    apply_in_flight: bool,

    /// Divergence waiting for the in-flight batch to finish.
    pending_rollback: Option<(SyncSource, DivergenceReason)>,
    /// Where the next fetcher starts once a source turns up.
    resume_from: Timestamp,
    retry_apply_scheduled: bool,
    source_retry_scheduled: bool,
}

impl ControlLoop {
    pub(crate) fn new(
        shared: Arc<Shared>,
        apply_runtime: Option<&Handle>,
        commands_tx: mpsc::UnboundedSender<Command>,
        commands_rx: mpsc::UnboundedReceiver<Command>,
        session: Option<FetchSession>,
    ) -> Self {
        let shutdown_rx = shared.shutdown_receiver();
        let (events_tx, events_rx, fetcher) = match session {
            Some(s) => (s.events_tx, s.events_rx, Some(s.fetcher)),
            None => {
                let (tx, rx) = mpsc::unbounded_channel();
                (tx, rx, None)
            }
        };

        // Capacity 1: the loop never queues a second batch behind the first.
        let (apply_tx, apply_rx) = mpsc::channel(1);
        let (outcome_tx, outcome_rx) = mpsc::unbounded_channel();
        let applier = BatchApplier::new(&shared.collaborators, &shared.config.applier);
        let applier_task = spawn_applier(applier, apply_rx, outcome_tx, apply_runtime);

        let resume_from = shared.last_applied().timestamp;

        Self {
            shared,
            commands_tx,
            commands_rx,
            shutdown_rx,
            events_tx,
            events_rx,
            fetcher,
            apply_tx: Some(apply_tx),
            outcome_rx,
            applier_task: Some(applier_task),
            apply_in_flight: false,
            pending_rollback: None,
            resume_from,
            retry_apply_scheduled: false,
            source_retry_scheduled: false,
        }
    }

    pub(crate) async fn run(mut self) {
        let span = info_span!("steady_state", member = %self.shared.config.member_id);

        async move {
            info!(
                last_applied = %self.shared.last_applied(),
                adopted_fetcher = self.fetcher.is_some(),
                "Starting steady state replication"
            );

            if self.fetcher.is_none() {
                match self.shared.sync_source() {
                    Some(source) => self.start_fetcher(source, self.resume_from),
                    None => self.schedule_source_retry(),
                }
            }
            // Records may already be buffered by a handed-over fetcher.
            self.schedule_apply();

            loop {
                tokio::select! {
                    biased;

                    _ = cancelled(&mut self.shutdown_rx) => {
                        info!("Shutdown requested");
                        break;
                    }

                    Some(outcome) = self.outcome_rx.recv() => {
                        self.on_apply_outcome(outcome).await;
                    }

                    Some(event) = self.events_rx.recv() => {
                        self.on_fetcher_event(event).await;
                    }

                    Some(command) = self.commands_rx.recv() => {
                        self.on_command(command);
                    }
                }
            }

            self.shutdown().await;
        }
        .instrument(span)
        .await
    }

    fn current_generation(&self) -> Option<u64> {
        self.fetcher.as_ref().map(FetcherHandle::generation)
    }

    // =========================================================================
    // Fetching
    // =========================================================================

    fn start_fetcher(&mut self, source: SyncSource, from: Timestamp) {
        if let Some(old) = self.fetcher.take() {
            old.cancel();
        }
        let generation = self.shared.next_generation();
        info!(%source, %from, generation, "Starting fetch from sync source");

        let fetcher = OplogFetcher::new(
            generation,
            source.clone(),
            from,
            Arc::clone(&self.shared.collaborators.client),
            Arc::clone(&self.shared.buffer),
            self.shared.config.fetcher.clone(),
            self.events_tx.clone(),
        );
        self.fetcher = Some(fetcher.spawn());
        self.shared.set_sync_source(Some(source));
    }

    /// Pick a new source and fetch from `from`, or retry later if none is eligible.
    fn change_sync_source(&mut self, from: Timestamp, reason: &str) {
        if let Some(old) = self.fetcher.take() {
            old.cancel();
        }
        self.resume_from = from;

        match self.shared.choose_sync_source() {
            Some(source) => {
                metrics::record_sync_source_change(reason);
                self.start_fetcher(source, from);
            }
            None => self.schedule_source_retry(),
        }
    }

    fn schedule_source_retry(&mut self) {
        self.shared.set_sync_source(None);
        if self.source_retry_scheduled {
            return;
        }
        let delay = self.shared.config.sync_source.retry_wait_duration();
        warn!(retry_in_ms = delay.as_millis() as u64, "No sync source available");
        self.source_retry_scheduled = true;
        self.schedule(Command::ChooseSyncSource, delay);
    }

    async fn on_fetcher_event(&mut self, event: FetcherEvent) {
        if Some(event.generation()) != self.current_generation() {
            debug!(generation = event.generation(), "Dropping event from replaced fetcher");
            return;
        }

        match event {
            FetcherEvent::Batch {
                source,
                count,
                last_fetched,
                metadata,
                ..
            } => {
                debug!(%source, count, %last_fetched, "Fetched batch");
                metrics::set_last_fetched(last_fetched);
                metrics::set_buffer_stats(self.shared.buffer.count(), self.shared.buffer.size_bytes());

                if self.shared.state() == DataReplicatorState::Rollback {
                    info!(%source, "Fetching cleanly from new sync source, leaving rollback");
                    self.shared.collaborators.follower.set_follower_mode(MemberState::Secondary);
                    self.shared.set_state(DataReplicatorState::Steady);
                }

                if let Some(metadata) = metadata {
                    if self
                        .shared
                        .collaborators
                        .selector
                        .should_change_sync_source(&source, &metadata)
                    {
                        // Buffered records stay valid: they came from a
                        // source that agreed with our history.
                        if let Some(old) = self.fetcher.take() {
                            old.cancel();
                        }
                        let from = self.shared.buffer.fence();
                        self.change_sync_source(from, "source_stranded");
                    }
                }

                self.schedule_apply();
            }

            FetcherEvent::Divergence { source, reason, .. } => {
                self.fetcher = None;
                self.shared.set_state(DataReplicatorState::Rollback);
                if self.apply_in_flight {
                    info!(%source, %reason, "Divergence during apply, rollback deferred until the batch completes");
                    self.pending_rollback = Some((source, reason));
                } else {
                    self.rollback(source, reason).await;
                }
            }

            FetcherEvent::Failed { source, error, .. } => {
                warn!(%source, error = %error, "Fetching from sync source failed");
                self.fetcher = None;
                self.shared.blacklist(&source);
                let from = self.shared.buffer.last_pushed();
                self.change_sync_source(from, "fetch_failed");
            }
        }
    }

    // =========================================================================
    // Rollback
    // =========================================================================

    async fn rollback(&mut self, source: SyncSource, reason: DivergenceReason) {
        // Nothing fetched past the divergence point can be applied.
        self.shared.buffer.clear();
        let last_applied = self.shared.last_applied();

        let attempt = RollbackAttempt {
            source,
            last_applied,
            reason,
        };
        let action = tokio::select! {
            biased;
            _ = cancelled(&mut self.shutdown_rx) => {
                info!("Shutdown requested, abandoning rollback");
                return;
            }
            action = self.shared.rollback.run(attempt) => action,
        };
        match action {
            RollbackAction::ResumeSteady { source } => {
                self.shared.collaborators.follower.set_follower_mode(MemberState::Secondary);
                self.shared.set_state(DataReplicatorState::Steady);
                self.start_fetcher(source, last_applied.timestamp);
            }
            RollbackAction::ChangeSyncSource { failed, error } => {
                warn!(source = %failed, error = %error, "Rollback failed, changing sync source");
                self.shared.blacklist(&failed);
                self.shared.collaborators.follower.set_follower_mode(MemberState::Unknown);
                self.change_sync_source(last_applied.timestamp, "rollback_failed");
            }
        }
    }

    // =========================================================================
    // Applying
    // =========================================================================

    fn schedule_apply(&mut self) {
        if self.apply_in_flight
            || self.pending_rollback.is_some()
            || self.shared.is_paused()
            || self.shared.state() != DataReplicatorState::Steady
        {
            return;
        }
        let Some(apply_tx) = &self.apply_tx else {
            return;
        };

        let max_ops = self.shared.config.applier.max_batch_ops;
        let last_applied = self.shared.last_applied();
        let mut batch = Vec::new();
        while batch.is_empty() && !self.shared.buffer.is_empty() {
            batch = self.shared.buffer.pop_up_to(max_ops);
            let dropped = discard_applied(&mut batch, last_applied);
            if dropped > 0 {
                warn!(dropped, %last_applied, "Discarded buffered records at or before last applied");
                metrics::record_stale_records_discarded(dropped);
            }
        }
        if batch.is_empty() {
            return;
        }

        let request = ApplyRequest {
            generation: self.current_generation().unwrap_or_default(),
            source: self.shared.sync_source(),
            batch,
        };
        match apply_tx.try_send(request) {
            Ok(()) => self.apply_in_flight = true,
            Err(e) => {
                error!(error = %e, "Applier not accepting batches, requeueing");
                self.shared.buffer.push_front_many(e.into_inner().batch);
            }
        }
        metrics::set_buffer_stats(self.shared.buffer.count(), self.shared.buffer.size_bytes());
    }

    async fn on_apply_outcome(&mut self, outcome: ApplyOutcome) {
        self.apply_in_flight = false;

        match outcome.result {
            Ok(applied) => {
                if self.shared.advance_last_applied(applied.position) {
                    metrics::set_last_applied(applied.position);
                }
                if !self.shared.is_paused() {
                    self.report_progress(applied.position);
                }
            }
            Err(e) => {
                // A pending rollback clears the buffer anyway.
                if self.pending_rollback.is_none() {
                    let delay = self.shared.config.applier.retry_wait_duration();
                    warn!(
                        error = %e,
                        ops = outcome.batch.len(),
                        retry_in_ms = delay.as_millis() as u64,
                        "Apply failed, batch requeued"
                    );
                    self.shared.buffer.push_front_many(outcome.batch);
                    if !self.retry_apply_scheduled {
                        self.retry_apply_scheduled = true;
                        self.schedule(Command::RetryApply, delay);
                    }
                    return;
                }
            }
        }

        if let Some((source, reason)) = self.pending_rollback.take() {
            self.rollback(source, reason).await;
            return;
        }
        self.schedule_apply();
    }

    /// Tell upstream how far we have applied. Runs detached; a slow
    /// reporter must not hold up the next batch.
    fn report_progress(&self, position: OpTime) {
        let reporter = Arc::clone(&self.shared.collaborators.reporter);
        let member_state = self.shared.collaborators.follower.follower_mode();
        tokio::spawn(async move {
            match reporter.report(position, member_state).await {
                Ok(()) => metrics::record_progress_report(true),
                Err(e) => {
                    metrics::record_progress_report(false);
                    warn!(%position, error = %e, "Progress report failed");
                }
            }
        });
    }

    // =========================================================================
    // Commands
    // =========================================================================

    fn on_command(&mut self, command: Command) {
        debug!(?command, "Command");
        match command {
            Command::Resume => self.schedule_apply(),
            Command::RetryApply => {
                self.retry_apply_scheduled = false;
                self.schedule_apply();
            }
            Command::ChooseSyncSource => {
                self.source_retry_scheduled = false;
                if self.fetcher.is_none() {
                    let from = self.resume_from;
                    self.change_sync_source(from, "source_available");
                }
            }
        }
    }

    fn schedule(&self, command: Command, delay: Duration) {
        let commands = self.commands_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // The loop may have exited in the meantime.
            let _ = commands.send(command);
        });
    }

    // =========================================================================
    // Shutdown
    // =========================================================================

    async fn shutdown(mut self) {
        if let Some(fetcher) = self.fetcher.take() {
            fetcher.shutdown().await;
        }

        // Closing the request channel stops the applier after its current batch.
        self.apply_tx = None;
        let mut discarded = 0usize;
        while let Some(outcome) = self.outcome_rx.recv().await {
            discarded += outcome.batch.len();
        }
        if discarded > 0 {
            debug!(discarded, "Discarded in-flight apply result");
        }
        if let Some(task) = self.applier_task.take() {
            if let Err(e) = task.await {
                error!(error = %e, "Applier task panicked");
            }
        }

        self.shared.buffer.clear();
        self.shared.set_sync_source(None);
        self.shared.set_state(DataReplicatorState::Uninitialized);
        info!(
            last_applied = %self.shared.last_applied(),
            rollback_attempts = self.shared.rollback.attempts(),
            "Steady state replication stopped"
        );
    }
}
