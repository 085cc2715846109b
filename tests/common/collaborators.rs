//! Recording collaborators for testing.
//!
//! Each mock records every call for assertions. Failures are scripted as
//! queues consumed one call at a time.

use data_replicator::error::ReplicationError;
use data_replicator::external::{BoxFuture, MemberState, OplogApplier, ProgressReporter, RollbackProcedure};
use data_replicator::oplog::{Document, OpTime, OplogRecord, Timestamp};
use data_replicator::remote::SyncSource;
use data_replicator::storage::StorageInterface;
use data_replicator::DataReplicatorState;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::watch;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap()
}

// =============================================================================
// Storage
// =============================================================================

#[derive(Default)]
struct StorageState {
    collections: BTreeMap<String, Vec<Document>>,
    indexes: HashMap<String, Vec<Document>>,
    flag: bool,
    flag_history: Vec<bool>,
    applied_through: Option<OpTime>,
    missing_inserted: Vec<(String, Document)>,
    insert_sizes: Vec<(String, usize)>,
}

/// In-memory storage that keeps the initial sync flag's full history.
#[derive(Default)]
pub struct MemoryStorage {
    state: Mutex<StorageState>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn documents(&self, ns: &str) -> Vec<Document> {
        lock(&self.state).collections.get(ns).cloned().unwrap_or_default()
    }

    pub fn collection_names(&self) -> Vec<String> {
        lock(&self.state).collections.keys().cloned().collect()
    }

    pub fn indexes(&self, ns: &str) -> Vec<Document> {
        lock(&self.state).indexes.get(ns).cloned().unwrap_or_default()
    }

    pub fn flag(&self) -> bool {
        lock(&self.state).flag
    }

    /// Every value the initial sync flag was set to, in order.
    pub fn flag_history(&self) -> Vec<bool> {
        lock(&self.state).flag_history.clone()
    }

    pub fn applied_through(&self) -> Option<OpTime> {
        lock(&self.state).applied_through
    }

    pub fn missing_inserted(&self) -> Vec<(String, Document)> {
        lock(&self.state).missing_inserted.clone()
    }

    /// Size of every insert_documents call into `ns`, in order.
    pub fn insert_sizes(&self, ns: &str) -> Vec<usize> {
        lock(&self.state)
            .insert_sizes
            .iter()
            .filter(|(n, _)| n == ns)
            .map(|(_, size)| *size)
            .collect()
    }
}

impl StorageInterface for MemoryStorage {
    fn begin_collection<'a>(&'a self, ns: &'a str, _options: &'a Document, index_specs: &'a [Document]) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let mut state = lock(&self.state);
            state.collections.insert(ns.to_string(), Vec::new());
            state.indexes.insert(ns.to_string(), index_specs.to_vec());
            Ok(())
        })
    }

    fn insert_documents<'a>(&'a self, ns: &'a str, docs: &'a [Document]) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let mut state = lock(&self.state);
            state.insert_sizes.push((ns.to_string(), docs.len()));
            let collection = state
                .collections
                .get_mut(ns)
                .ok_or_else(|| ReplicationError::Storage(format!("no collection {}", ns)))?;
            for doc in docs {
                let id = doc.get("_id");
                if id.is_none() || collection.iter().any(|d| d.get("_id") == id) {
                    return Err(ReplicationError::Storage(format!("bad or duplicate _id in {}", ns)));
                }
                collection.push(doc.clone());
            }
            Ok(())
        })
    }

    fn insert_missing_document<'a>(&'a self, ns: &'a str, doc: &'a Document) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let mut state = lock(&self.state);
            state.missing_inserted.push((ns.to_string(), doc.clone()));
            let collection = state.collections.entry(ns.to_string()).or_default();
            collection.retain(|d| d.get("_id") != doc.get("_id"));
            collection.push(doc.clone());
            Ok(())
        })
    }

    fn get_initial_sync_flag(&self) -> BoxFuture<'_, bool> {
        Box::pin(async move { Ok(lock(&self.state).flag) })
    }

    fn set_initial_sync_flag(&self, value: bool) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let mut state = lock(&self.state);
            state.flag = value;
            state.flag_history.push(value);
            Ok(())
        })
    }

    fn set_applied_through(&self, position: OpTime) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            lock(&self.state).applied_through = Some(position);
            Ok(())
        })
    }
}

// =============================================================================
// Applier
// =============================================================================

/// Applies every batch successfully unless a scripted error is queued.
#[derive(Default)]
pub struct ScriptedApplier {
    errors: Mutex<VecDeque<ReplicationError>>,
    batches: Mutex<Vec<Vec<Timestamp>>>,
}

impl ScriptedApplier {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next call fails with `error`.
    pub fn fail_next(&self, error: ReplicationError) {
        lock(&self.errors).push_back(error);
    }

    /// Timestamps of every batch handed to the applier, failed calls included.
    pub fn batches(&self) -> Vec<Vec<Timestamp>> {
        lock(&self.batches).clone()
    }

    pub fn applied_timestamps(&self) -> Vec<Timestamp> {
        self.batches().into_iter().flatten().collect()
    }
}

impl OplogApplier for ScriptedApplier {
    fn apply_batch<'a>(&'a self, ops: &'a [OplogRecord]) -> BoxFuture<'a, OpTime> {
        Box::pin(async move {
            lock(&self.batches).push(ops.iter().map(OplogRecord::timestamp).collect());
            if let Some(error) = lock(&self.errors).pop_front() {
                return Err(error);
            }
            ops.last()
                .map(OplogRecord::op_time)
                .ok_or_else(|| ReplicationError::Internal("empty batch".into()))
        })
    }
}

// =============================================================================
// Rollback
// =============================================================================

/// A recorded rollback call.
#[derive(Debug, Clone)]
pub struct RollbackCall {
    pub last_applied: OpTime,
    pub source: SyncSource,
    /// Replicator state observed from inside the procedure.
    pub state_during: Option<DataReplicatorState>,
}

type RepairHook = Box<dyn Fn(&SyncSource) + Send + Sync>;

/// Rollback procedure with scripted outcomes (succeeds when none are queued).
#[derive(Default)]
pub struct RecordingRollback {
    outcomes: Mutex<VecDeque<bool>>,
    calls: Mutex<Vec<RollbackCall>>,
    state_rx: Mutex<Option<watch::Receiver<DataReplicatorState>>>,
    on_success: Mutex<Option<RepairHook>>,
    hanging: AtomicBool,
}

impl RecordingRollback {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&self, outcomes: &[bool]) {
        lock(&self.outcomes).extend(outcomes.iter().copied());
    }

    /// Record the replicator's state on each call.
    pub fn observe(&self, state_rx: watch::Receiver<DataReplicatorState>) {
        *lock(&self.state_rx) = Some(state_rx);
    }

    /// Run `hook` after each successful rollback, e.g. to make the source's
    /// oplog agree with ours again.
    pub fn on_success(&self, hook: impl Fn(&SyncSource) + Send + Sync + 'static) {
        *lock(&self.on_success) = Some(Box::new(hook));
    }

    pub fn calls(&self) -> Vec<RollbackCall> {
        lock(&self.calls).clone()
    }

    /// Every later call records itself and then never completes.
    pub fn hang(&self) {
        self.hanging.store(true, Ordering::SeqCst);
    }
}

impl RollbackProcedure for RecordingRollback {
    fn rollback<'a>(&'a self, last_applied: OpTime, source: &'a SyncSource) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let state_during = lock(&self.state_rx).as_ref().map(|rx| *rx.borrow());
            lock(&self.calls).push(RollbackCall {
                last_applied,
                source: source.clone(),
                state_during,
            });
            if self.hanging.load(Ordering::SeqCst) {
                std::future::pending::<()>().await;
            }

            let succeed = lock(&self.outcomes).pop_front().unwrap_or(true);
            if !succeed {
                return Err(ReplicationError::OperationFailed("rollback failed".into()));
            }
            if let Some(hook) = lock(&self.on_success).as_ref() {
                hook(source);
            }
            Ok(())
        })
    }
}

// =============================================================================
// Progress reporting
// =============================================================================

#[derive(Default)]
pub struct RecordingReporter {
    reports: Mutex<Vec<(OpTime, MemberState)>>,
}

impl RecordingReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reports(&self) -> Vec<(OpTime, MemberState)> {
        lock(&self.reports).clone()
    }
}

impl ProgressReporter for RecordingReporter {
    fn report(&self, position: OpTime, member_state: MemberState) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            lock(&self.reports).push((position, member_state));
            Ok(())
        })
    }
}
