//! Replicator state types.
//!
//! Defines the state machine for the data replicator lifecycle.
//!
//! # State Transitions
//!
//! ```text
//!                 initial_sync()
//! Uninitialized ─────────────────→ InitialSyncing
//!    │     ↑                             │
//!    │     │ (failure, shutdown,         │ (hand-off)
//!    │     │  no hand-off)               ↓
//!    │     └─────────────────────────────┤
//!    │ start()                           │
//!    ↓                                   ↓
//! Steady ←───────────────────────── Steady
//!    │    ↑
//!    │    │ (rollback succeeded,
//!    │    │  or a new source fetched cleanly)
//!    ↓    │
//! Rollback
//!
//! Steady / Rollback ── shutdown ──→ Uninitialized
//! ```
//!
//! # State Descriptions
//!
//! - **Uninitialized**: Nothing running. `start()` and `initial_sync()` are legal.
//! - **InitialSyncing**: Cloning data from a sync source, then applying the
//!   oplog written during the clone.
//! - **Steady**: Tailing the sync source's oplog and applying it.
//! - **Rollback**: Local history diverged from the source; the rollback
//!   procedure is running or a new source is being tried.

use crate::cloner::CloneStats;
use crate::external::MemberState;
use crate::oplog::{OpTime, Timestamp};
use crate::remote::SyncSource;
use std::time::Duration;

/// State of the data replicator.
///
/// See module docs for the state transition diagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataReplicatorState {
    /// Not running.
    Uninitialized,

    /// Initial sync in progress.
    ///
    /// Transitions to `Steady` on hand-off, otherwise back to `Uninitialized`.
    InitialSyncing,

    /// Fetching and applying from a sync source.
    Steady,

    /// Recovering from divergence with the sync source.
    ///
    /// Left for `Steady` once the rollback procedure succeeds, or once a
    /// fetch from a replacement source succeeds.
    Rollback,
}

impl std::fmt::Display for DataReplicatorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DataReplicatorState::Uninitialized => write!(f, "Uninitialized"),
            DataReplicatorState::InitialSyncing => write!(f, "InitialSyncing"),
            DataReplicatorState::Steady => write!(f, "Steady"),
            DataReplicatorState::Rollback => write!(f, "Rollback"),
        }
    }
}

/// Point-in-time health of the replicator, collected without any I/O.
#[derive(Debug, Clone)]
pub struct HealthCheck {
    pub state: DataReplicatorState,
    /// Steady and replicating from a source.
    pub ready: bool,
    /// Ready, not paused, and the buffer is below its size cap.
    pub healthy: bool,
    pub sync_source: Option<SyncSource>,
    pub follower_mode: MemberState,
    pub last_applied: OpTime,
    pub last_fetched: Timestamp,
    pub buffer_count: usize,
    pub buffer_bytes: usize,
    pub buffer_max_bytes: usize,
    pub paused: bool,
    pub rollback_attempts: u64,
}

/// One initial sync attempt, as recorded in [`InitialSyncStats`].
#[derive(Debug, Clone)]
pub struct InitialSyncAttempt {
    pub sync_source: Option<SyncSource>,
    pub duration: Duration,
    /// `None` for the attempt that succeeded.
    pub error: Option<String>,
}

/// Summary of the most recent initial sync.
#[derive(Debug, Clone, Default)]
pub struct InitialSyncStats {
    pub max_attempts: usize,
    pub attempts: Vec<InitialSyncAttempt>,
    /// Source oplog position when cloning started.
    pub begin: Option<OpTime>,
    /// Source oplog position the sync applied through.
    pub end: Option<OpTime>,
    pub cloned: CloneStats,
    /// Oplog records applied while catching up.
    pub ops_applied: usize,
    pub missing_documents_fetched: usize,
    pub total_duration: Duration,
}

impl InitialSyncStats {
    pub fn new(max_attempts: usize) -> Self {
        Self {
            max_attempts,
            ..Default::default()
        }
    }

    pub fn failed_attempts(&self) -> usize {
        self.attempts.iter().filter(|a| a.error.is_some()).count()
    }

    pub fn succeeded(&self) -> bool {
        self.attempts.last().is_some_and(|a| a.error.is_none())
    }
}
