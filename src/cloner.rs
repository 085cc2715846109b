//! Databases cloner: copies every collection from the sync source.
//!
//! ```text
//! list_databases ─► for each db (except "local"):
//!                     list_collections ─► for each collection (concurrently):
//!                         list_indexes ─► begin_collection ─► find_documents ─► insert_documents
//!                                                              get_more_documents ─┘ (until exhausted)
//! ```
//!
//! Collections are cloned with bounded concurrency. The first failure aborts
//! the clone; the caller restarts the whole initial sync attempt.

use crate::error::{ReplicationError, Result};
use crate::metrics;
use crate::remote::{CollectionInfo, DocumentBatch, SyncSource, SyncSourceClient};
use crate::storage::StorageInterface;
use futures::stream::{self, StreamExt, TryStreamExt};
use std::ops::AddAssign;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, info_span, warn, Instrument};

/// Database holding the member's own replication state; never cloned.
pub const LOCAL_DATABASE: &str = "local";

/// Totals for one clone pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CloneStats {
    pub databases: usize,
    pub collections: usize,
    pub documents: usize,
    pub indexes: usize,
}

impl AddAssign for CloneStats {
    fn add_assign(&mut self, other: Self) {
        self.databases += other.databases;
        self.collections += other.collections;
        self.documents += other.documents;
        self.indexes += other.indexes;
    }
}

fn is_clonable_collection(name: &str) -> bool {
    !name.is_empty() && !name.starts_with("system.")
}

/// Clones all user databases from one source into local storage.
pub struct DatabasesCloner {
    client: Arc<dyn SyncSourceClient>,
    storage: Arc<dyn StorageInterface>,
    source: SyncSource,
    concurrency: usize,
    batch_size: usize,
}

impl DatabasesCloner {
    pub fn new(
        client: Arc<dyn SyncSourceClient>,
        storage: Arc<dyn StorageInterface>,
        source: SyncSource,
        concurrency: usize,
        batch_size: usize,
    ) -> Self {
        Self {
            client,
            storage,
            source,
            concurrency: concurrency.max(1),
            batch_size: batch_size.max(1),
        }
    }

    pub async fn run(&self) -> Result<CloneStats> {
        let span = info_span!("databases_cloner", source = %self.source);

        async move {
            let started = Instant::now();
            let databases = self.client.list_databases(&self.source).await?;
            let mut stats = CloneStats::default();

            for db in databases.iter().filter(|db| db.as_str() != LOCAL_DATABASE) {
                stats += self.clone_database(db).await?;
            }

            info!(
                databases = stats.databases,
                collections = stats.collections,
                documents = stats.documents,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Clone complete"
            );
            Ok(stats)
        }
        .instrument(span)
        .await
    }

    async fn clone_database(&self, db: &str) -> Result<CloneStats> {
        let collections = self.client.list_collections(&self.source, db).await?;
        debug!(db, collections = collections.len(), "Cloning database");

        let per_collection: Vec<CloneStats> = stream::iter(
            collections
                .into_iter()
                .filter(|info| is_clonable_collection(&info.name))
                .map(|info| self.clone_collection(db, info)),
        )
        .buffer_unordered(self.concurrency)
        .try_collect()
        .await?;

        let mut stats = CloneStats {
            databases: 1,
            ..Default::default()
        };
        for collection in per_collection {
            stats += collection;
        }
        Ok(stats)
    }

    async fn clone_collection(&self, db: &str, info: CollectionInfo) -> Result<CloneStats> {
        let ns = format!("{}.{}", db, info.name);
        let started = Instant::now();

        let indexes = self.client.list_indexes(&self.source, &ns).await?;
        self.storage.begin_collection(&ns, &info.options, &indexes).await?;

        let documents = self.copy_documents(&ns).await?;

        metrics::record_collection_cloned(documents, started.elapsed());
        debug!(ns = %ns, documents, indexes = indexes.len(), "Collection cloned");

        Ok(CloneStats {
            databases: 0,
            collections: 1,
            documents,
            indexes: indexes.len(),
        })
    }

    /// Stream a collection into storage one cursor batch at a time.
    async fn copy_documents(&self, ns: &str) -> Result<usize> {
        let mut batch: DocumentBatch = self.client.find_documents(&self.source, ns, self.batch_size).await?;
        let mut copied = 0;

        loop {
            if !batch.documents.is_empty() {
                if let Err(e) = self.storage.insert_documents(ns, &batch.documents).await {
                    self.release_cursor(batch.cursor_id).await;
                    return Err(match e {
                        ReplicationError::Storage(msg) => ReplicationError::Storage(format!("{}: {}", ns, msg)),
                        other => other,
                    });
                }
                copied += batch.documents.len();
            }
            if batch.is_exhausted() {
                return Ok(copied);
            }
            batch = self
                .client
                .get_more_documents(&self.source, batch.cursor_id, self.batch_size)
                .await?;
        }
    }

    async fn release_cursor(&self, cursor_id: i64) {
        if cursor_id == 0 {
            return;
        }
        if let Err(e) = self.client.kill_cursor(&self.source, cursor_id).await {
            warn!(cursor_id, error = %e, "Could not release collection cursor");
        }
    }
}
