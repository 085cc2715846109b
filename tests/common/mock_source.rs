//! Mock sync source for testing.
//!
//! Models each host's oplog as a list of entries with live tailing cursors,
//! plus a shared set of collections for cloning. Records every request as
//! `(host, operation)` for assertions.
//!
//! # Example
//! ```rust,ignore
//! let source = MockSyncSource::new();
//! source.set_oplog("host-0", vec![entry(1), entry(2)]);
//! source.fail_next("listDatabases", 1);
//!
//! // Use in tests...
//!
//! assert!(source.requests_for("host-0").contains(&"find".to_string()));
//! ```

use data_replicator::error::{ReplicationError, Result};
use data_replicator::external::BoxFuture;
use data_replicator::oplog::{split_namespace, timestamp_of, Document, Timestamp};
use data_replicator::remote::{CollectionInfo, DocumentBatch, OplogBatch, SourceMetadata, SyncSource, SyncSourceClient};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

/// How long an idle getMore blocks at most, regardless of the await timeout asked for.
const MAX_IDLE_GET_MORE: Duration = Duration::from_millis(20);

#[derive(Debug)]
struct Cursor {
    host: String,
    last: Timestamp,
    batch_size: usize,
}

/// Position of an open collection cursor.
#[derive(Debug)]
struct CollectionCursor {
    ns: String,
    offset: usize,
}

#[derive(Default)]
struct MockState {
    default_oplog: Vec<Document>,
    oplogs: HashMap<String, Vec<Document>>,
    metadata: HashMap<String, SourceMetadata>,
    find_scripts: HashMap<String, VecDeque<OplogBatch>>,
    cursors: HashMap<i64, Cursor>,
    collection_cursors: HashMap<i64, CollectionCursor>,
    next_cursor: i64,

    rollback_ids: VecDeque<i64>,
    latest: VecDeque<Document>,

    collections: BTreeMap<String, Vec<Document>>,
    indexes: HashMap<String, Vec<Document>>,
    fetchable: HashMap<String, Vec<Document>>,

    failures: HashMap<String, usize>,
    unreachable: HashSet<String>,
    hanging: HashSet<String>,
    requests: Vec<(String, String)>,
}

impl MockState {
    fn oplog(&self, host: &str) -> &[Document] {
        self.oplogs.get(host).unwrap_or(&self.default_oplog)
    }
}

/// Scriptable [`SyncSourceClient`].
pub struct MockSyncSource {
    state: Mutex<MockState>,
}

impl Default for MockSyncSource {
    fn default() -> Self {
        Self::new()
    }
}

impl MockSyncSource {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState {
                next_cursor: 1,
                ..Default::default()
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    // =========================================================================
    // Configuration
    // =========================================================================

    /// Oplog for hosts without one of their own.
    pub fn set_default_oplog(&self, entries: Vec<Document>) {
        self.lock().default_oplog = entries;
    }

    pub fn set_oplog(&self, host: &str, entries: Vec<Document>) {
        self.lock().oplogs.insert(host.to_string(), entries);
    }

    /// Append to a host's oplog. Open cursors see it on their next getMore.
    pub fn append_oplog(&self, host: &str, entry: Document) {
        let mut state = self.lock();
        let mut entries = state.oplog(host).to_vec();
        entries.push(entry);
        state.oplogs.insert(host.to_string(), entries);
    }

    /// Attach metadata to every oplog response from `host`.
    pub fn set_metadata(&self, host: &str, metadata: SourceMetadata) {
        self.lock().metadata.insert(host.to_string(), metadata);
    }

    /// Queue a literal response for the next find on `host`.
    pub fn script_find(&self, host: &str, batch: OplogBatch) {
        self.lock()
            .find_scripts
            .entry(host.to_string())
            .or_default()
            .push_back(batch);
    }

    /// Successive rollback ids; the last one repeats. Defaults to 1.
    pub fn set_rollback_ids(&self, ids: Vec<i64>) {
        self.lock().rollback_ids = ids.into();
    }

    /// Successive latest-entry responses; the last one repeats. Defaults to
    /// the newest entry of the host's oplog.
    pub fn set_latest_entries(&self, entries: Vec<Document>) {
        self.lock().latest = entries.into();
    }

    pub fn add_collection(&self, ns: &str, documents: Vec<Document>, indexes: Vec<Document>) {
        let mut state = self.lock();
        state.collections.insert(ns.to_string(), documents);
        state.indexes.insert(ns.to_string(), indexes);
    }

    /// A document reachable through findOne but not through cloning, as if
    /// it was written after the clone passed its collection.
    pub fn add_fetchable_document(&self, ns: &str, document: Document) {
        self.lock()
            .fetchable
            .entry(ns.to_string())
            .or_default()
            .push(document);
    }

    /// Fail the next `times` requests of `operation` on any host with a
    /// transport error.
    pub fn fail_next(&self, operation: &str, times: usize) {
        self.lock().failures.insert(operation.to_string(), times);
    }

    /// Every request to `host` fails with a transport error.
    pub fn set_unreachable(&self, host: &str) {
        self.lock().unreachable.insert(host.to_string());
    }

    /// Requests of `operation` never complete.
    pub fn hang_on(&self, operation: &str) {
        self.lock().hanging.insert(operation.to_string());
    }

    // =========================================================================
    // Assertions
    // =========================================================================

    pub fn requests(&self) -> Vec<(String, String)> {
        self.lock().requests.clone()
    }

    pub fn requests_for(&self, host: &str) -> Vec<String> {
        self.lock()
            .requests
            .iter()
            .filter(|(h, _)| h == host)
            .map(|(_, op)| op.clone())
            .collect()
    }

    pub fn request_count(&self, operation: &str) -> usize {
        self.lock().requests.iter().filter(|(_, op)| op == operation).count()
    }

    /// Collection cursors neither exhausted nor killed.
    pub fn open_collection_cursors(&self) -> usize {
        self.lock().collection_cursors.len()
    }

    // =========================================================================
    // Request plumbing
    // =========================================================================

    /// Record a request and decide its fate. `Ok(true)` means hang.
    fn begin(&self, source: &SyncSource, operation: &str) -> Result<bool> {
        let mut state = self.lock();
        state
            .requests
            .push((source.as_str().to_string(), operation.to_string()));

        if state.unreachable.contains(source.as_str()) {
            return Err(ReplicationError::remote(source.as_str(), operation, "connection refused"));
        }
        if let Some(remaining) = state.failures.get_mut(operation) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(ReplicationError::remote(source.as_str(), operation, "injected failure"));
            }
        }
        Ok(state.hanging.contains(operation))
    }

    fn open_cursor(&self, host: &str, from: Timestamp, batch_size: usize) -> OplogBatch {
        let mut state = self.lock();
        if let Some(batch) = state.find_scripts.get_mut(host).and_then(VecDeque::pop_front) {
            return batch;
        }

        let documents: Vec<Document> = state
            .oplog(host)
            .iter()
            .filter(|doc| match timestamp_of(doc) {
                Some(ts) => from.is_null() || ts >= from,
                None => false,
            })
            .take(batch_size.max(1))
            .cloned()
            .collect();
        let last = documents.last().and_then(timestamp_of).unwrap_or(from);

        let cursor_id = state.next_cursor;
        state.next_cursor += 1;
        state.cursors.insert(
            cursor_id,
            Cursor {
                host: host.to_string(),
                last,
                batch_size: batch_size.max(1),
            },
        );

        OplogBatch {
            cursor_id,
            documents,
            metadata: state.metadata.get(host).cloned(),
        }
    }

    fn advance_cursor(&self, cursor_id: i64) -> Option<OplogBatch> {
        let mut state = self.lock();
        let (host, last, batch_size) = {
            let cursor = state.cursors.get(&cursor_id)?;
            (cursor.host.clone(), cursor.last, cursor.batch_size)
        };
        let documents: Vec<Document> = state
            .oplog(&host)
            .iter()
            .filter(|doc| timestamp_of(doc).is_some_and(|ts| ts > last))
            .take(batch_size)
            .cloned()
            .collect();
        if let Some(newest) = documents.last().and_then(timestamp_of) {
            if let Some(cursor) = state.cursors.get_mut(&cursor_id) {
                cursor.last = newest;
            }
        }
        Some(OplogBatch {
            cursor_id,
            documents,
            metadata: state.metadata.get(&host).cloned(),
        })
    }

    /// Next `batch_size` documents of `ns` from `offset`. The cursor stays
    /// registered only while documents remain.
    fn collection_batch(&self, cursor_id: i64, ns: &str, offset: usize, batch_size: usize) -> DocumentBatch {
        let mut state = self.lock();
        let (documents, total) = {
            let all = state.collections.get(ns).map(Vec::as_slice).unwrap_or_default();
            let documents: Vec<Document> = all.iter().skip(offset).take(batch_size.max(1)).cloned().collect();
            (documents, all.len())
        };
        let next = offset + documents.len();

        if next < total {
            state.collection_cursors.insert(
                cursor_id,
                CollectionCursor {
                    ns: ns.to_string(),
                    offset: next,
                },
            );
            DocumentBatch { cursor_id, documents }
        } else {
            state.collection_cursors.remove(&cursor_id);
            DocumentBatch { cursor_id: 0, documents }
        }
    }
}

async fn hang<T>() -> Result<T> {
    std::future::pending::<()>().await;
    Err(ReplicationError::Internal("unreachable".into()))
}

impl SyncSourceClient for MockSyncSource {
    fn rollback_id(&self, source: &SyncSource) -> BoxFuture<'_, i64> {
        let source = source.clone();
        Box::pin(async move {
            if self.begin(&source, "replSetGetRBID")? {
                return hang().await;
            }
            let mut state = self.lock();
            let id = if state.rollback_ids.len() > 1 {
                state.rollback_ids.pop_front()
            } else {
                state.rollback_ids.front().copied()
            };
            Ok(id.unwrap_or(1))
        })
    }

    fn latest_oplog_entry(&self, source: &SyncSource) -> BoxFuture<'_, Option<Document>> {
        let source = source.clone();
        Box::pin(async move {
            if self.begin(&source, "latestOplogEntry")? {
                return hang().await;
            }
            let mut state = self.lock();
            if state.latest.len() > 1 {
                return Ok(state.latest.pop_front());
            }
            if let Some(entry) = state.latest.front() {
                return Ok(Some(entry.clone()));
            }
            Ok(state.oplog(source.as_str()).last().cloned())
        })
    }

    fn find_oplog(&self, source: &SyncSource, from: Timestamp, batch_size: usize) -> BoxFuture<'_, OplogBatch> {
        let source = source.clone();
        Box::pin(async move {
            if self.begin(&source, "find")? {
                return hang().await;
            }
            Ok(self.open_cursor(source.as_str(), from, batch_size))
        })
    }

    fn get_more_oplog(&self, source: &SyncSource, cursor_id: i64, await_timeout: Duration) -> BoxFuture<'_, OplogBatch> {
        let source = source.clone();
        Box::pin(async move {
            if self.begin(&source, "getMore")? {
                return hang().await;
            }
            let batch = self
                .advance_cursor(cursor_id)
                .ok_or_else(|| ReplicationError::OperationFailed(format!("cursor {} not found", cursor_id)))?;
            if batch.documents.is_empty() {
                tokio::time::sleep(await_timeout.min(MAX_IDLE_GET_MORE)).await;
            }
            Ok(batch)
        })
    }

    fn kill_cursor(&self, _source: &SyncSource, cursor_id: i64) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let mut state = self.lock();
            state.cursors.remove(&cursor_id);
            state.collection_cursors.remove(&cursor_id);
            Ok(())
        })
    }

    fn list_databases(&self, source: &SyncSource) -> BoxFuture<'_, Vec<String>> {
        let source = source.clone();
        Box::pin(async move {
            if self.begin(&source, "listDatabases")? {
                return hang().await;
            }
            let state = self.lock();
            let databases: BTreeSet<String> = state
                .collections
                .keys()
                .filter_map(|ns| split_namespace(ns).map(|(db, _)| db.to_string()))
                .collect();
            Ok(databases.into_iter().collect())
        })
    }

    fn list_collections(&self, source: &SyncSource, db: &str) -> BoxFuture<'_, Vec<CollectionInfo>> {
        let source = source.clone();
        let db = db.to_string();
        Box::pin(async move {
            if self.begin(&source, "listCollections")? {
                return hang().await;
            }
            let state = self.lock();
            Ok(state
                .collections
                .keys()
                .filter_map(|ns| split_namespace(ns))
                .filter(|(d, _)| *d == db)
                .map(|(_, coll)| CollectionInfo::new(coll))
                .collect())
        })
    }

    fn list_indexes(&self, source: &SyncSource, ns: &str) -> BoxFuture<'_, Vec<Document>> {
        let source = source.clone();
        let ns = ns.to_string();
        Box::pin(async move {
            if self.begin(&source, "listIndexes")? {
                return hang().await;
            }
            Ok(self.lock().indexes.get(&ns).cloned().unwrap_or_default())
        })
    }

    fn find_documents(&self, source: &SyncSource, ns: &str, batch_size: usize) -> BoxFuture<'_, DocumentBatch> {
        let source = source.clone();
        let ns = ns.to_string();
        Box::pin(async move {
            if self.begin(&source, "findDocuments")? {
                return hang().await;
            }
            let cursor_id = {
                let mut state = self.lock();
                let id = state.next_cursor;
                state.next_cursor += 1;
                id
            };
            Ok(self.collection_batch(cursor_id, &ns, 0, batch_size))
        })
    }

    fn get_more_documents(&self, source: &SyncSource, cursor_id: i64, batch_size: usize) -> BoxFuture<'_, DocumentBatch> {
        let source = source.clone();
        Box::pin(async move {
            if self.begin(&source, "getMoreDocuments")? {
                return hang().await;
            }
            let (ns, offset) = {
                let state = self.lock();
                let cursor = state
                    .collection_cursors
                    .get(&cursor_id)
                    .ok_or_else(|| ReplicationError::OperationFailed(format!("cursor {} not found", cursor_id)))?;
                (cursor.ns.clone(), cursor.offset)
            };
            Ok(self.collection_batch(cursor_id, &ns, offset, batch_size))
        })
    }

    fn find_one(&self, source: &SyncSource, ns: &str, key: &Document) -> BoxFuture<'_, Option<Document>> {
        let source = source.clone();
        let ns = ns.to_string();
        let key = key.clone();
        Box::pin(async move {
            if self.begin(&source, "findOne")? {
                return hang().await;
            }
            let state = self.lock();
            let id = key.get("_id");
            let found = state
                .fetchable
                .get(&ns)
                .into_iter()
                .chain(state.collections.get(&ns))
                .flatten()
                .find(|doc| doc.get("_id") == id)
                .cloned();
            Ok(found)
        })
    }
}
