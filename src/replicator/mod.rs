// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Data replicator.
//!
//! The [`DataReplicator`] keeps this member's data in step with a sync
//! source. It either runs an initial sync (clone everything, then catch up
//! on the oplog) or goes straight to steady state (tail the source's oplog
//! and apply it), and recovers through rollback when the source's history
//! turns out to differ from ours.
//!
//! # Architecture
//!
//! ```text
//!                    ┌──────────────────────────────────────┐
//!                    │            DataReplicator            │
//!                    │  start / initial_sync / shutdown     │
//!                    │  pause / resume / getters            │
//!                    └──────┬───────────────────────┬───────┘
//!                           │ Shared (state watch,  │
//!                           │ last applied, buffer) │
//!              ┌────────────┴──────┐        ┌───────┴─────────┐
//!              │   InitialSyncer   │        │   ControlLoop   │
//!              │ clone + catch up  │──hand──►  fetch, apply,  │
//!              └───────────────────┘  off   │  rollback       │
//!                                           └─────────────────┘
//! ```
//!
//! All cross-task state lives in [`Shared`]. Std mutexes guard it and are
//! never held across an await.

mod control;
mod initial_sync;
mod rollback;
mod types;

pub use initial_sync::InitialSyncFailPoint;
pub use rollback::{RollbackAction, RollbackAttempt, RollbackCoordinator};
pub use types::{DataReplicatorState, HealthCheck, InitialSyncAttempt, InitialSyncStats};

use crate::buffer::OplogBuffer;
use crate::config::ReplicatorConfig;
use crate::error::{ReplicationError, Result};
use crate::external::{Collaborators, MemberState};
use crate::metrics;
use crate::oplog::{OpTime, Timestamp};
use crate::remote::SyncSource;
use control::{Command, ControlLoop};
use initial_sync::InitialSyncer;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// State shared between the replicator handle and its tasks.
pub(crate) struct Shared {
    pub(crate) config: ReplicatorConfig,
    pub(crate) collaborators: Collaborators,
    pub(crate) buffer: Arc<OplogBuffer>,
    pub(crate) rollback: RollbackCoordinator,

    state_tx: watch::Sender<DataReplicatorState>,
    shutdown_tx: watch::Sender<bool>,
    sync_source: Mutex<Option<SyncSource>>,
    last_applied: Mutex<OpTime>,
    paused: AtomicBool,
    /// Fetch session counter; each fetcher gets the next value.
    generation: AtomicU64,
    initial_sync_stats: Mutex<Option<InitialSyncStats>>,
}

impl Shared {
    pub(crate) fn state(&self) -> DataReplicatorState {
        *self.state_tx.borrow()
    }

    pub(crate) fn set_state(&self, state: DataReplicatorState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            info!(from = %previous, to = %state, "Replicator state changed");
            metrics::set_replicator_state(&state.to_string());
        }
    }

    pub(crate) fn shutdown_receiver(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    pub(crate) fn is_shutting_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    pub(crate) fn sync_source(&self) -> Option<SyncSource> {
        lock(&self.sync_source).clone()
    }

    pub(crate) fn set_sync_source(&self, source: Option<SyncSource>) {
        *lock(&self.sync_source) = source;
    }

    /// Ask the selector for a source, starting from what we have fetched.
    pub(crate) fn choose_sync_source(&self) -> Option<SyncSource> {
        let last_fetched = self.buffer.last_pushed();
        let source = self.collaborators.selector.choose_new_sync_source(last_fetched);
        self.set_sync_source(source.clone());
        source
    }

    pub(crate) fn blacklist(&self, source: &SyncSource) {
        let until = tokio::time::Instant::now() + self.config.sync_source.blacklist_duration();
        self.collaborators.selector.blacklist_sync_source(source, until);
        metrics::record_sync_source_blacklisted(source.as_str());
    }

    pub(crate) fn last_applied(&self) -> OpTime {
        *lock(&self.last_applied)
    }

    /// Move the applied position forward. Returns false if `position` is
    /// not ahead of the current one.
    pub(crate) fn advance_last_applied(&self, position: OpTime) -> bool {
        let mut last_applied = lock(&self.last_applied);
        if position <= *last_applied {
            return false;
        }
        *last_applied = position;
        true
    }

    pub(crate) fn reset_last_applied(&self, position: OpTime) {
        *lock(&self.last_applied) = position;
    }

    pub(crate) fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub(crate) fn next_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) fn set_initial_sync_stats(&self, stats: InitialSyncStats) {
        *lock(&self.initial_sync_stats) = Some(stats);
    }
}

/// A running control loop.
struct RunHandle {
    commands: mpsc::UnboundedSender<Command>,
    join: JoinHandle<()>,
}

/// Keeps this member's data in step with a sync source.
///
/// # Lifecycle
///
/// ```rust,ignore
/// let replicator = DataReplicator::new(config, collaborators)?;
///
/// // Either clone from scratch...
/// let position = replicator.initial_sync().await?;
/// // ...or tail the oplog from the last applied position.
/// replicator.start()?;
///
/// replicator.schedule_shutdown()?;
/// replicator.wait_for_shutdown().await;
/// ```
///
/// `start()` and `initial_sync()` spawn tasks and must be called from
/// within a Tokio runtime.
pub struct DataReplicator {
    shared: Arc<Shared>,
    run: Mutex<Option<RunHandle>>,
    apply_runtime: Option<Handle>,
    fail_point: InitialSyncFailPoint,
}

impl DataReplicator {
    /// Create a replicator in the `Uninitialized` state.
    pub fn new(config: ReplicatorConfig, collaborators: Collaborators) -> Result<Self> {
        config.validate()?;

        let (state_tx, _) = watch::channel(DataReplicatorState::Uninitialized);
        let (shutdown_tx, _) = watch::channel(false);
        let buffer = Arc::new(OplogBuffer::new(config.fetcher.buffer_max_bytes));
        let rollback = RollbackCoordinator::new(Arc::clone(&collaborators.rollback));

        let shared = Arc::new(Shared {
            config,
            collaborators,
            buffer,
            rollback,
            state_tx,
            shutdown_tx,
            sync_source: Mutex::new(None),
            last_applied: Mutex::new(OpTime::null()),
            paused: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            initial_sync_stats: Mutex::new(None),
        });

        Ok(Self {
            shared,
            run: Mutex::new(None),
            apply_runtime: None,
            fail_point: InitialSyncFailPoint::default(),
        })
    }

    /// Resume from a previously applied position instead of the null op time.
    pub fn with_last_applied(self, position: OpTime) -> Self {
        self.shared.reset_last_applied(position);
        self
    }

    /// Run apply batches on a separate runtime.
    pub fn with_apply_runtime(mut self, runtime: Handle) -> Self {
        self.apply_runtime = Some(runtime);
        self
    }

    pub fn config(&self) -> &ReplicatorConfig {
        &self.shared.config
    }

    /// Drop a finished run so a new one may begin.
    fn reap_finished(run: &mut Option<RunHandle>) {
        if run.as_ref().is_some_and(|r| r.join.is_finished()) {
            debug!("Reaping finished control loop");
            *run = None;
        }
    }

    /// Begin steady state replication from the last applied position.
    ///
    /// Fails with `AlreadyInitialized` if already in `Steady` or `Rollback`,
    /// and with `IllegalOperation` while an initial sync or a previous
    /// shutdown is still in progress.
    pub fn start(&self) -> Result<()> {
        let mut run = lock(&self.run);
        Self::reap_finished(&mut run);

        match self.shared.state() {
            DataReplicatorState::Steady | DataReplicatorState::Rollback => {
                return Err(ReplicationError::AlreadyInitialized);
            }
            DataReplicatorState::InitialSyncing => {
                return Err(ReplicationError::IllegalOperation(
                    "cannot start while initial sync is running".into(),
                ));
            }
            DataReplicatorState::Uninitialized => {}
        }
        if run.is_some() {
            return Err(ReplicationError::IllegalOperation(
                "previous run is still shutting down".into(),
            ));
        }

        self.shared.shutdown_tx.send_replace(false);
        self.shared.buffer.clear();
        let last_applied = self.shared.last_applied();
        let source = self.shared.choose_sync_source();

        info!(
            member = %self.shared.config.member_id,
            %last_applied,
            sync_source = source.as_ref().map(|s| s.as_str()),
            "Starting data replicator"
        );
        self.shared.set_state(DataReplicatorState::Steady);

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let control = ControlLoop::new(
            Arc::clone(&self.shared),
            self.apply_runtime.as_ref(),
            commands_tx.clone(),
            commands_rx,
            None,
        );
        *run = Some(RunHandle {
            commands: commands_tx,
            join: tokio::spawn(control.run()),
        });
        Ok(())
    }

    /// Clone all data from a sync source, then apply the oplog written
    /// during the clone. Returns the position applied through.
    ///
    /// With `hand_off_to_steady_state` set, replication continues in
    /// `Steady` from that position using the same fetcher. Otherwise the
    /// replicator returns to `Uninitialized`.
    pub async fn initial_sync(&self) -> Result<OpTime> {
        {
            let mut run = lock(&self.run);
            Self::reap_finished(&mut run);
            if self.shared.state() != DataReplicatorState::Uninitialized {
                return Err(ReplicationError::AlreadyInitialized);
            }
            if run.is_some() {
                return Err(ReplicationError::IllegalOperation(
                    "previous run is still shutting down".into(),
                ));
            }
            self.shared.shutdown_tx.send_replace(false);
            self.shared.buffer.clear();
            self.shared.collaborators.follower.set_follower_mode(MemberState::Startup2);
            self.shared.set_state(DataReplicatorState::InitialSyncing);
        }

        let syncer = InitialSyncer::new(
            Arc::clone(&self.shared),
            self.apply_runtime.clone(),
            self.fail_point.clone(),
        );

        let outcome = match syncer.run().await {
            Ok(outcome) => outcome,
            Err(e) => {
                self.shared.buffer.clear();
                self.shared.set_sync_source(None);
                self.shared.set_state(DataReplicatorState::Uninitialized);
                return Err(e);
            }
        };
        let position = outcome.position;

        let hand_off = self.shared.config.initial_sync.hand_off_to_steady_state && !self.shared.is_shutting_down();
        if !hand_off {
            info!(%position, "Initial sync done, not continuing to steady state");
            outcome.session.fetcher.shutdown().await;
            self.shared.buffer.clear();
            self.shared.set_sync_source(None);
            self.shared.set_state(DataReplicatorState::Uninitialized);
            return Ok(position);
        }

        let mut run = lock(&self.run);
        info!(%position, "Initial sync done, continuing in steady state");
        self.shared.collaborators.follower.set_follower_mode(MemberState::Secondary);
        self.shared.set_state(DataReplicatorState::Steady);

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let control = ControlLoop::new(
            Arc::clone(&self.shared),
            self.apply_runtime.as_ref(),
            commands_tx.clone(),
            commands_rx,
            Some(outcome.session),
        );
        *run = Some(RunHandle {
            commands: commands_tx,
            join: tokio::spawn(control.run()),
        });
        Ok(position)
    }

    /// Signal shutdown without waiting. Everything running stops: fetcher,
    /// applier, initial sync. Results still in flight are discarded.
    pub fn schedule_shutdown(&self) -> Result<()> {
        info!(state = %self.shared.state(), "Shutdown scheduled");
        self.shared.shutdown_tx.send_replace(true);
        Ok(())
    }

    /// Wait until a scheduled shutdown has finished and the replicator is
    /// back in `Uninitialized`.
    pub async fn wait_for_shutdown(&self) {
        let handle = lock(&self.run).take();
        if let Some(handle) = handle {
            if let Err(e) = handle.join.await {
                error!(error = %e, "Control loop panicked");
                self.shared.buffer.clear();
                self.shared.set_sync_source(None);
                self.shared.set_state(DataReplicatorState::Uninitialized);
            }
        }
        let mut state_rx = self.shared.state_tx.subscribe();
        let _ = state_rx.wait_for(|s| *s == DataReplicatorState::Uninitialized).await;
        info!("Data replicator shut down");
    }

    /// Stop handing batches to the applier. Fetching continues until the
    /// buffer fills.
    pub fn pause(&self) {
        if !self.shared.paused.swap(true, Ordering::SeqCst) {
            info!("Applier paused");
        }
    }

    pub fn resume(&self) {
        if self.shared.paused.swap(false, Ordering::SeqCst) {
            info!("Applier resumed");
        }
        if let Some(run) = lock(&self.run).as_ref() {
            if run.commands.send(Command::Resume).is_err() {
                warn!("Control loop not running, nothing to resume");
            }
        }
    }

    pub fn is_paused(&self) -> bool {
        self.shared.is_paused()
    }

    pub fn state(&self) -> DataReplicatorState {
        self.shared.state()
    }

    /// Get a receiver to watch state changes.
    pub fn state_receiver(&self) -> watch::Receiver<DataReplicatorState> {
        self.shared.state_tx.subscribe()
    }

    /// Wait until the replicator reaches `state`.
    pub async fn wait_for_state(&self, state: DataReplicatorState) {
        let mut state_rx = self.state_receiver();
        let _ = state_rx.wait_for(|s| *s == state).await;
    }

    pub fn sync_source(&self) -> Option<SyncSource> {
        self.shared.sync_source()
    }

    /// Timestamp of the newest record taken from the sync source.
    pub fn last_timestamp_fetched(&self) -> Timestamp {
        self.shared.buffer.last_pushed()
    }

    pub fn last_applied(&self) -> OpTime {
        self.shared.last_applied()
    }

    /// Records fetched but not yet handed to the applier.
    pub fn oplog_buffer_count(&self) -> usize {
        self.shared.buffer.count()
    }

    pub fn rollback_attempts(&self) -> u64 {
        self.shared.rollback.attempts()
    }

    /// Summary of the most recent initial sync, if one has run.
    pub fn initial_sync_stats(&self) -> Option<InitialSyncStats> {
        lock(&self.shared.initial_sync_stats).clone()
    }

    /// Hook for making initial sync attempts fail.
    pub fn fail_point(&self) -> &InitialSyncFailPoint {
        &self.fail_point
    }

    /// Get health status for monitoring endpoints.
    ///
    /// Performs no I/O; everything is read from in-memory state.
    pub fn health_check(&self) -> HealthCheck {
        let state = self.state();
        let sync_source = self.sync_source();
        let paused = self.is_paused();
        let buffer = &self.shared.buffer;
        let buffer_bytes = buffer.size_bytes();

        let ready = state == DataReplicatorState::Steady && sync_source.is_some();
        let healthy = ready && !paused && buffer_bytes < buffer.max_size_bytes();

        HealthCheck {
            state,
            ready,
            healthy,
            sync_source,
            follower_mode: self.shared.collaborators.follower.follower_mode(),
            last_applied: self.last_applied(),
            last_fetched: buffer.last_pushed(),
            buffer_count: buffer.count(),
            buffer_bytes,
            buffer_max_bytes: buffer.max_size_bytes(),
            paused,
            rollback_attempts: self.rollback_attempts(),
        }
    }
}

impl std::fmt::Debug for DataReplicator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataReplicator")
            .field("member_id", &self.shared.config.member_id)
            .field("state", &self.state())
            .field("sync_source", &self.sync_source())
            .field("last_applied", &self.last_applied())
            .finish()
    }
}
