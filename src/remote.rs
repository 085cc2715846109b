// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Requests against a sync source.
//!
//! [`SyncSourceClient`] is the transport seam: the replicator never opens
//! sockets itself. Every method takes the target [`SyncSource`] explicitly,
//! so one client can serve any number of candidate hosts.
//!
//! # Oplog Cursor Protocol
//!
//! ```text
//! find_oplog(from = T)      → first batch, first record has ts == T
//! get_more(cursor)          → next records (may be empty after await timeout)
//! get_more(cursor) → id 0   → cursor exhausted; reopen with find_oplog(last fetched)
//! ```
//!
//! Collection documents are read the same way, in batches of at most
//! `batch_size`, so cloning a large collection never holds more than one
//! batch in memory.

use crate::external::BoxFuture;
use crate::oplog::{Document, OpTime, Timestamp};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Address of a sync source (e.g. `host-0:27017`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SyncSource(String);

impl SyncSource {
    pub fn new(host: impl Into<String>) -> Self {
        Self(host.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SyncSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SyncSource {
    fn from(host: &str) -> Self {
        Self::new(host)
    }
}

/// Replication metadata a source attaches to oplog responses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceMetadata {
    /// The source's view of the majority-committed position.
    pub last_op_committed: OpTime,
    /// Newest position the source has made visible.
    pub last_op_visible: OpTime,
    pub term: i64,
    pub is_primary: bool,
    /// Whether the source itself is replicating from someone.
    pub has_sync_source: bool,
}

/// One response on the oplog cursor.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OplogBatch {
    /// Zero once the cursor is exhausted.
    pub cursor_id: i64,
    pub documents: Vec<Document>,
    pub metadata: Option<SourceMetadata>,
}

impl OplogBatch {
    pub fn is_exhausted(&self) -> bool {
        self.cursor_id == 0
    }
}

/// One response on a collection cursor.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DocumentBatch {
    /// Zero once the cursor is exhausted.
    pub cursor_id: i64,
    pub documents: Vec<Document>,
}

impl DocumentBatch {
    pub fn is_exhausted(&self) -> bool {
        self.cursor_id == 0
    }
}

/// A collection as listed by the source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionInfo {
    pub name: String,
    #[serde(default)]
    pub options: Document,
}

impl CollectionInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            options: Document::Object(Default::default()),
        }
    }
}

/// Transport to sync sources.
///
/// Implementations report transport failures as
/// [`ReplicationError::Remote`](crate::ReplicationError::Remote) and
/// command-level rejections (e.g. `ok: 0`) as
/// [`ReplicationError::OperationFailed`](crate::ReplicationError::OperationFailed).
pub trait SyncSourceClient: Send + Sync + 'static {
    /// The source's rollback id. Changes whenever the source rolls back.
    fn rollback_id(&self, source: &SyncSource) -> BoxFuture<'_, i64>;

    /// Newest oplog entry on the source, if its oplog is non-empty.
    fn latest_oplog_entry(&self, source: &SyncSource) -> BoxFuture<'_, Option<Document>>;

    /// Open a tailing cursor at `from` (inclusive).
    fn find_oplog(&self, source: &SyncSource, from: Timestamp, batch_size: usize)
        -> BoxFuture<'_, OplogBatch>;

    /// Continue a tailing cursor, waiting up to `await_timeout` for new records.
    fn get_more_oplog(
        &self,
        source: &SyncSource,
        cursor_id: i64,
        await_timeout: Duration,
    ) -> BoxFuture<'_, OplogBatch>;

    /// Release a cursor on the source. Best effort.
    fn kill_cursor(&self, _source: &SyncSource, _cursor_id: i64) -> BoxFuture<'_, ()> {
        Box::pin(async { Ok(()) })
    }

    fn list_databases(&self, source: &SyncSource) -> BoxFuture<'_, Vec<String>>;

    fn list_collections(&self, source: &SyncSource, db: &str) -> BoxFuture<'_, Vec<CollectionInfo>>;

    /// Index specs of a collection.
    fn list_indexes(&self, source: &SyncSource, ns: &str) -> BoxFuture<'_, Vec<Document>>;

    /// Open a cursor over a collection's documents.
    fn find_documents(&self, source: &SyncSource, ns: &str, batch_size: usize)
        -> BoxFuture<'_, DocumentBatch>;

    /// Next batch from a collection cursor.
    fn get_more_documents(&self, source: &SyncSource, cursor_id: i64, batch_size: usize)
        -> BoxFuture<'_, DocumentBatch>;

    /// One document by key, if it still exists on the source.
    fn find_one(&self, source: &SyncSource, ns: &str, key: &Document)
        -> BoxFuture<'_, Option<Document>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_source_display() {
        let source = SyncSource::new("host-0:27017");
        assert_eq!(source.to_string(), "host-0:27017");
        assert_eq!(source.as_str(), "host-0:27017");
        assert_eq!(SyncSource::from("host-0:27017"), source);
    }

    #[test]
    fn test_oplog_batch_exhausted() {
        let batch = OplogBatch::default();
        assert!(batch.is_exhausted());
        let batch = OplogBatch {
            cursor_id: 7,
            ..Default::default()
        };
        assert!(!batch.is_exhausted());
    }

    #[test]
    fn test_collection_info_defaults_options() {
        let info: CollectionInfo = serde_json::from_str(r#"{"name": "a"}"#).unwrap();
        assert_eq!(info.name, "a");
        assert!(info.options.is_null());
        assert!(CollectionInfo::new("b").options.is_object());
    }
}
