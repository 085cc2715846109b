// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Collaborator traits supplied by the embedding node.
//!
//! The replicator owns no data of its own. It drives these collaborators:
//!
//! | Trait | Role |
//! |-------|------|
//! | [`OplogApplier`] | Applies a batch of oplog records to local data |
//! | [`RollbackProcedure`] | Undoes local history after divergence |
//! | [`ProgressReporter`] | Tells upstream how far we have applied |
//! | [`FollowerStateControl`] | Sets the member's follower mode |
//! | [`SyncSourceClient`](crate::remote::SyncSourceClient) | Requests against a sync source |
//! | [`SyncSourceSelector`](crate::sync_source::SyncSourceSelector) | Picks and blacklists sources |
//! | [`StorageInterface`](crate::storage::StorageInterface) | Local collections and flags |
//!
//! All of them are held as `Arc<dyn Trait>` in [`Collaborators`].
//!
//! # Example
//!
//! ```rust,no_run
//! use data_replicator::external::{BoxFuture, OplogApplier};
//! use data_replicator::oplog::{OpTime, OplogRecord};
//! use data_replicator::ReplicationError;
//!
//! struct MyApplier;
//!
//! impl OplogApplier for MyApplier {
//!     fn apply_batch<'a>(&'a self, ops: &'a [OplogRecord]) -> BoxFuture<'a, OpTime> {
//!         Box::pin(async move {
//!             let last = ops.last().ok_or_else(|| ReplicationError::Internal("empty batch".into()))?;
//!             Ok(last.op_time())
//!         })
//!     }
//! }
//! ```

use crate::error::Result;
use crate::oplog::{OpTime, OplogRecord};
use crate::remote::{SyncSource, SyncSourceClient};
use crate::storage::StorageInterface;
use crate::sync_source::SyncSourceSelector;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};

/// Type alias for boxed async futures (reduces trait signature complexity).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Replica set member state, as far as the replicator drives it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemberState {
    Startup,
    Startup2,
    Primary,
    Secondary,
    Recovering,
    Rollback,
    Unknown,
}

impl fmt::Display for MemberState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Startup => write!(f, "STARTUP"),
            Self::Startup2 => write!(f, "STARTUP2"),
            Self::Primary => write!(f, "PRIMARY"),
            Self::Secondary => write!(f, "SECONDARY"),
            Self::Recovering => write!(f, "RECOVERING"),
            Self::Rollback => write!(f, "ROLLBACK"),
            Self::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

/// Applies oplog batches to local data.
///
/// May be called again with the same batch after a missing document has
/// been fetched, so implementations must tolerate replays of a batch that
/// failed part-way.
pub trait OplogApplier: Send + Sync + 'static {
    /// Apply `ops` in order and return the position reached.
    ///
    /// Return [`ReplicationError::NoMatchingDocument`](crate::ReplicationError::NoMatchingDocument)
    /// when an update or delete targets a document that does not exist locally.
    fn apply_batch<'a>(&'a self, ops: &'a [OplogRecord]) -> BoxFuture<'a, OpTime>;
}

/// Undoes local writes that diverged from the sync source.
pub trait RollbackProcedure: Send + Sync + 'static {
    fn rollback<'a>(&'a self, last_applied: OpTime, source: &'a SyncSource) -> BoxFuture<'a, ()>;
}

/// Sends replication progress upstream.
pub trait ProgressReporter: Send + Sync + 'static {
    fn report(&self, position: OpTime, member_state: MemberState) -> BoxFuture<'_, ()>;
}

/// Controls the member's follower mode.
pub trait FollowerStateControl: Send + Sync + 'static {
    /// Request a mode change. Returns whether the change was accepted.
    fn set_follower_mode(&self, state: MemberState) -> bool;

    /// Current follower mode.
    fn follower_mode(&self) -> MemberState;
}

/// The full set of collaborators a [`DataReplicator`](crate::DataReplicator) drives.
#[derive(Clone)]
pub struct Collaborators {
    pub client: Arc<dyn SyncSourceClient>,
    pub selector: Arc<dyn SyncSourceSelector>,
    pub storage: Arc<dyn StorageInterface>,
    pub applier: Arc<dyn OplogApplier>,
    pub rollback: Arc<dyn RollbackProcedure>,
    pub reporter: Arc<dyn ProgressReporter>,
    pub follower: Arc<dyn FollowerStateControl>,
}

impl fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collaborators")
            .field("follower_mode", &self.follower.follower_mode())
            .finish_non_exhaustive()
    }
}

/// A reporter that only logs. For standalone runs where nobody listens upstream.
#[derive(Debug, Clone, Default)]
pub struct NoOpProgressReporter;

impl ProgressReporter for NoOpProgressReporter {
    fn report(&self, position: OpTime, member_state: MemberState) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            tracing::debug!(%position, %member_state, "NoOp: would report progress upstream");
            Ok(())
        })
    }
}

/// Follower mode held in memory. Accepts every transition.
#[derive(Debug)]
pub struct InMemoryFollowerState {
    mode: Mutex<MemberState>,
}

impl InMemoryFollowerState {
    pub fn new(initial: MemberState) -> Self {
        Self {
            mode: Mutex::new(initial),
        }
    }
}

impl Default for InMemoryFollowerState {
    fn default() -> Self {
        Self::new(MemberState::Startup2)
    }
}

impl FollowerStateControl for InMemoryFollowerState {
    fn set_follower_mode(&self, state: MemberState) -> bool {
        let mut mode = self.mode.lock().unwrap_or_else(PoisonError::into_inner);
        if *mode != state {
            tracing::info!(from = %*mode, to = %state, "Follower mode changed");
        }
        *mode = state;
        true
    }

    fn follower_mode(&self) -> MemberState {
        *self.mode.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
