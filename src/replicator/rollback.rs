//! Rollback coordination.
//!
//! When the fetcher reports that the sync source's history no longer
//! contains our last fetched record, the control loop enters `Rollback`
//! and hands the divergence to the [`RollbackCoordinator`]. The coordinator
//! runs the embedder's [`RollbackProcedure`] once and tells the control loop
//! what to do next:
//!
//! ```text
//! Divergence ──► rollback(last_applied, source)
//!                   │ Ok                     │ Err
//!                   ↓                        ↓
//!            ResumeSteady{source}   ChangeSyncSource{failed}
//!            (Secondary, refetch    (blacklist, Unknown,
//!             from last_applied)     pick another source)
//! ```

use crate::error::ReplicationError;
use crate::external::RollbackProcedure;
use crate::fetcher::DivergenceReason;
use crate::metrics;
use crate::oplog::OpTime;
use crate::remote::SyncSource;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, info_span, Instrument};

/// A divergence waiting to be rolled back.
#[derive(Debug, Clone)]
pub struct RollbackAttempt {
    pub source: SyncSource,
    pub last_applied: OpTime,
    pub reason: DivergenceReason,
}

/// What the control loop does after a rollback attempt.
#[derive(Debug)]
pub enum RollbackAction {
    /// Local history now matches `source`; keep fetching from it.
    ResumeSteady { source: SyncSource },
    /// The procedure failed against `failed`; try another source.
    ChangeSyncSource {
        failed: SyncSource,
        error: ReplicationError,
    },
}

/// Runs the rollback procedure and counts attempts.
pub struct RollbackCoordinator {
    procedure: Arc<dyn RollbackProcedure>,
    attempts: AtomicU64,
    failures: AtomicU64,
}

impl RollbackCoordinator {
    pub fn new(procedure: Arc<dyn RollbackProcedure>) -> Self {
        Self {
            procedure,
            attempts: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    /// Rollback attempts since construction.
    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::Relaxed)
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    pub async fn run(&self, attempt: RollbackAttempt) -> RollbackAction {
        let span = info_span!(
            "rollback",
            source = %attempt.source,
            last_applied = %attempt.last_applied,
            reason = attempt.reason.label()
        );

        async move {
            let number = self.attempts.fetch_add(1, Ordering::Relaxed) + 1;
            info!(attempt = number, divergence = %attempt.reason, "Starting rollback");
            let started = Instant::now();

            match self.procedure.rollback(attempt.last_applied, &attempt.source).await {
                Ok(()) => {
                    metrics::record_rollback(true);
                    info!(duration_ms = started.elapsed().as_millis() as u64, "Rollback completed");
                    RollbackAction::ResumeSteady {
                        source: attempt.source,
                    }
                }
                Err(e) => {
                    self.failures.fetch_add(1, Ordering::Relaxed);
                    metrics::record_rollback(false);
                    error!(error = %e, "Rollback failed");
                    RollbackAction::ChangeSyncSource {
                        failed: attempt.source,
                        error: e,
                    }
                }
            }
        }
        .instrument(span)
        .await
    }
}

impl std::fmt::Debug for RollbackCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RollbackCoordinator")
            .field("attempts", &self.attempts())
            .field("failures", &self.failures())
            .finish()
    }
}
