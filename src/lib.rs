//! # Data Replicator
//!
//! The replication engine of a replica set member: it brings an empty or
//! stale member up to date with a sync source and then keeps it there.
//!
//! ## Architecture
//!
//! The replicator sits between a remote sync source and local storage,
//! driving embedder-supplied collaborators for everything it does not own:
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────────────┐
//! │                             data-replicator                               │
//! │                                                                           │
//! │  ┌──────────────┐    ┌──────────────┐    ┌──────────────────────────────┐ │
//! │  │ SyncSource   │───►│ OplogFetcher │───►│ OplogBuffer ──► Applier      │ │
//! │  │ Selector     │    │ (tailing)    │    │ (bounded)      (own task)    │ │
//! │  └──────────────┘    └──────────────┘    └──────────────────────────────┘ │
//! │         ▲                   │ divergence                 │                │
//! │         │ blacklist         ▼                            ▼                │
//! │  ┌──────────────┐    ┌──────────────────┐    ┌─────────────────────────┐  │
//! │  │ ControlLoop  │◄───│ RollbackCoordin. │    │ Storage (SQLite)        │  │
//! │  │ (state)      │    └──────────────────┘    │ flag, applied position  │  │
//! │  └──────────────┘                            └─────────────────────────┘  │
//! └───────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Two Ways In
//!
//! 1. **Initial sync**: clone every database from the source, then apply the
//!    oplog written during the clone. See [`DataReplicator::initial_sync`].
//! 2. **Steady state**: tail the source's oplog from the last applied
//!    position. See [`DataReplicator::start`].
//!
//! ## Usage
//!
//! ```rust,ignore
//! use data_replicator::{Collaborators, DataReplicator, ReplicatorConfig};
//!
//! #[tokio::main]
//! async fn main() -> data_replicator::Result<()> {
//!     let config = ReplicatorConfig::default();
//!     let collaborators: Collaborators = build_collaborators().await?;
//!
//!     let replicator = DataReplicator::new(config, collaborators)?;
//!     replicator.initial_sync().await?;
//!
//!     // Replicates until shutdown is scheduled
//!     replicator.schedule_shutdown()?;
//!     replicator.wait_for_shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod applier;
pub mod buffer;
pub mod cloner;
pub mod config;
pub mod error;
pub mod external;
pub mod fetcher;
pub mod metrics;
pub mod oplog;
pub mod remote;
pub mod replicator;
pub mod resilience;
pub mod storage;
pub mod sync_source;

// Re-exports for convenience
pub use buffer::OplogBuffer;
pub use config::{
    ApplierConfig, CandidateConfig, FetcherConfig, InitialSyncConfig, ReplicatorConfig, StorageConfig,
    SyncSourceConfig,
};
pub use error::{ReplicationError, Result};
pub use external::{
    Collaborators, FollowerStateControl, InMemoryFollowerState, MemberState, NoOpProgressReporter, OplogApplier,
    ProgressReporter, RollbackProcedure,
};
pub use oplog::{Document, OpTime, OpType, OplogRecord, Timestamp};
pub use remote::{SyncSource, SyncSourceClient};
pub use replicator::{DataReplicator, DataReplicatorState, HealthCheck, InitialSyncFailPoint, InitialSyncStats};
pub use storage::{SqliteStorage, StorageInterface};
pub use sync_source::{CandidateSelector, SyncSourceSelector};
