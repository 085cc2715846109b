// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Local storage used by initial sync and the applier.
//!
//! [`StorageInterface`] is what the replicator needs from the node's storage
//! engine. [`SqliteStorage`] is a bundled implementation for standalone
//! deployments and tests.
//!
//! # Tables
//!
//! ```text
//! collections(ns PK, options, indexes, created_at)
//! documents(ns, doc_id, body, updated_at)  PK(ns, doc_id)
//! replication_meta(key PK, value, updated_at)
//!     initial_sync_flag = "1" | "0"
//!     applied_through   = {"timestamp": {...}, "term": n}
//! ```
//!
//! # Initial Sync Flag
//!
//! The flag is set before cloning starts and cleared only after the
//! replicator has applied through the end timestamp. A node that restarts
//! with the flag set holds an incomplete copy and must resync.
//!
//! # SQLite Busy Handling
//!
//! Writes are retried on SQLITE_BUSY/SQLITE_LOCKED with exponential backoff
//! capped at 500ms.

use crate::config::StorageConfig;
use crate::error::{ReplicationError, Result};
use crate::external::BoxFuture;
use crate::oplog::{Document, OpTime};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, warn};

/// What the replicator needs from local storage.
pub trait StorageInterface: Send + Sync + 'static {
    /// Create (or recreate empty) a collection ahead of cloning its documents.
    fn begin_collection<'a>(
        &'a self,
        ns: &'a str,
        options: &'a Document,
        index_specs: &'a [Document],
    ) -> BoxFuture<'a, ()>;

    /// Insert cloned documents. Each document must carry an `_id`.
    fn insert_documents<'a>(&'a self, ns: &'a str, docs: &'a [Document]) -> BoxFuture<'a, ()>;

    /// Upsert a document fetched to satisfy an apply that could not find it.
    fn insert_missing_document<'a>(&'a self, ns: &'a str, doc: &'a Document) -> BoxFuture<'a, ()>;

    fn get_initial_sync_flag(&self) -> BoxFuture<'_, bool>;

    fn set_initial_sync_flag(&self, value: bool) -> BoxFuture<'_, ()>;

    /// Durably record the last applied position. Default: not persisted.
    fn set_applied_through(&self, _position: OpTime) -> BoxFuture<'_, ()> {
        Box::pin(async { Ok(()) })
    }
}

/// Configuration for SQLite busy retry behavior
const SQLITE_RETRY_MAX_ATTEMPTS: u32 = 5;
const SQLITE_RETRY_BASE_DELAY_MS: u64 = 10;
const SQLITE_RETRY_MAX_DELAY_MS: u64 = 500;

const META_INITIAL_SYNC_FLAG: &str = "initial_sync_flag";
const META_APPLIED_THROUGH: &str = "applied_through";

/// Check if an error is a retryable SQLite busy/locked error
fn is_sqlite_busy_error(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db_err) => {
            // SQLite error codes: SQLITE_BUSY = 5, SQLITE_LOCKED = 6
            if let Some(code) = db_err.code() {
                return code == "5" || code == "6";
            }
            let msg = db_err.message().to_lowercase();
            msg.contains("database is locked") || msg.contains("database is busy")
        }
        _ => false,
    }
}

/// Execute a database operation with retry on SQLITE_BUSY/SQLITE_LOCKED
async fn execute_with_retry<F, Fut, T>(operation_name: &str, mut f: F) -> std::result::Result<T, sqlx::Error>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, sqlx::Error>>,
{
    let mut attempts = 0;
    let mut delay_ms = SQLITE_RETRY_BASE_DELAY_MS;

    loop {
        attempts += 1;
        match f().await {
            Ok(result) => {
                if attempts > 1 {
                    debug!(operation = operation_name, attempts, "SQLite operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(e) if is_sqlite_busy_error(&e) && attempts < SQLITE_RETRY_MAX_ATTEMPTS => {
                warn!(
                    operation = operation_name,
                    attempts,
                    max_attempts = SQLITE_RETRY_MAX_ATTEMPTS,
                    delay_ms,
                    "SQLite busy, retrying"
                );
                crate::metrics::storage_retries_total(operation_name);
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                delay_ms = (delay_ms * 2).min(SQLITE_RETRY_MAX_DELAY_MS);
            }
            Err(e) => return Err(e),
        }
    }
}

/// Stable text key for a document's `_id`.
fn document_id(ns: &str, doc: &Document) -> Result<String> {
    let id = doc
        .get("_id")
        .ok_or_else(|| ReplicationError::Storage(format!("document in {} has no _id", ns)))?;
    serde_json::to_string(id).map_err(|e| ReplicationError::Storage(e.to_string()))
}

fn to_json(value: &impl serde::Serialize) -> Result<String> {
    serde_json::to_string(value).map_err(|e| ReplicationError::Storage(e.to_string()))
}

/// SQLite-backed [`StorageInterface`].
pub struct SqliteStorage {
    pool: SqlitePool,
    path: String,
}

impl SqliteStorage {
    /// Open (creating if needed) the database described by `config`.
    pub async fn new(config: &StorageConfig) -> Result<Self> {
        info!(path = %config.sqlite_path, "Initializing replica storage");

        let (options, pool_options) = if config.is_in_memory() {
            // one connection holds the whole in-memory database
            let options = SqliteConnectOptions::from_str("sqlite::memory:")
                .map_err(|e| ReplicationError::Config(format!("Invalid SQLite path: {}", e)))?;
            let pool = SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None);
            (options, pool)
        } else {
            let mut options =
                SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", config.sqlite_path))
                    .map_err(|e| ReplicationError::Config(format!("Invalid SQLite path: {}", e)))?
                    .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
                    .create_if_missing(true);
            if config.wal_mode {
                options = options.journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);
            }
            (options, SqlitePoolOptions::new().max_connections(4))
        };

        let pool = pool_options.connect_with(options).await?;

        for ddl in [
            r#"
            CREATE TABLE IF NOT EXISTS collections (
                ns TEXT PRIMARY KEY,
                options TEXT NOT NULL,
                indexes TEXT NOT NULL,
                created_at INTEGER NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS documents (
                ns TEXT NOT NULL,
                doc_id TEXT NOT NULL,
                body TEXT NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (ns, doc_id)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS replication_meta (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        ] {
            sqlx::query(ddl).execute(&pool).await?;
        }

        Ok(Self {
            pool,
            path: config.sqlite_path.clone(),
        })
    }

    /// Get database path (for diagnostics).
    pub fn path(&self) -> &str {
        &self.path
    }

    async fn set_meta(&self, key: &str, value: &str) -> Result<()> {
        let now = chrono::Utc::now().timestamp_millis();
        let pool = &self.pool;
        execute_with_retry("meta_set", || async {
            sqlx::query(
                r#"
                INSERT INTO replication_meta (key, value, updated_at)
                VALUES (?, ?, ?)
                ON CONFLICT(key) DO UPDATE SET
                    value = excluded.value,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(key)
            .bind(value)
            .bind(now)
            .execute(pool)
            .await
        })
        .await?;
        Ok(())
    }

    async fn get_meta(&self, key: &str) -> Result<Option<String>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT value FROM replication_meta WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|(value,)| value))
    }

    /// Last position recorded with `set_applied_through`, if any.
    pub async fn applied_through(&self) -> Result<Option<OpTime>> {
        match self.get_meta(META_APPLIED_THROUGH).await? {
            Some(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|e| ReplicationError::Storage(format!("corrupt applied_through: {}", e))),
            None => Ok(None),
        }
    }

    /// Namespaces created by cloning, sorted.
    pub async fn collections(&self) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as("SELECT ns FROM collections ORDER BY ns")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|(ns,)| ns).collect())
    }

    /// Index specs stored for a collection.
    pub async fn index_specs(&self, ns: &str) -> Result<Vec<Document>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT indexes FROM collections WHERE ns = ?")
            .bind(ns)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some((raw,)) => serde_json::from_str(&raw).map_err(|e| ReplicationError::Storage(e.to_string())),
            None => Ok(Vec::new()),
        }
    }

    pub async fn document_count(&self, ns: &str) -> Result<u64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM documents WHERE ns = ?")
            .bind(ns)
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }

    /// Look a document up by its `_id` value.
    pub async fn find_by_id(&self, ns: &str, id: &serde_json::Value) -> Result<Option<Document>> {
        let doc_id = to_json(id)?;
        let row: Option<(String,)> = sqlx::query_as("SELECT body FROM documents WHERE ns = ? AND doc_id = ?")
            .bind(ns)
            .bind(&doc_id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some((body,)) => serde_json::from_str(&body)
                .map(Some)
                .map_err(|e| ReplicationError::Storage(e.to_string())),
            None => Ok(None),
        }
    }

    /// Force flush WAL to main database (for clean shutdown).
    pub async fn checkpoint(&self) -> Result<()> {
        let pool = &self.pool;
        execute_with_retry("storage_checkpoint", || async {
            sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)").execute(pool).await
        })
        .await?;
        debug!("WAL checkpoint complete");
        Ok(())
    }

    /// Close the connection pool gracefully.
    pub async fn close(&self) {
        if let Err(e) = self.checkpoint().await {
            warn!(error = %e, "Failed to checkpoint WAL on close");
        }
        self.pool.close().await;
        info!("Replica storage closed");
    }
}

impl StorageInterface for SqliteStorage {
    fn begin_collection<'a>(
        &'a self,
        ns: &'a str,
        options: &'a Document,
        index_specs: &'a [Document],
    ) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let options = to_json(options)?;
            let indexes = to_json(&index_specs)?;
            let now = chrono::Utc::now().timestamp_millis();
            let pool = &self.pool;

            execute_with_retry("begin_collection", || async {
                let mut tx = pool.begin().await?;
                sqlx::query(
                    r#"
                    INSERT INTO collections (ns, options, indexes, created_at)
                    VALUES (?, ?, ?, ?)
                    ON CONFLICT(ns) DO UPDATE SET
                        options = excluded.options,
                        indexes = excluded.indexes,
                        created_at = excluded.created_at
                    "#,
                )
                .bind(ns)
                .bind(&options)
                .bind(&indexes)
                .bind(now)
                .execute(&mut *tx)
                .await?;
                sqlx::query("DELETE FROM documents WHERE ns = ?")
                    .bind(ns)
                    .execute(&mut *tx)
                    .await?;
                tx.commit().await
            })
            .await?;

            debug!(ns, indexes = index_specs.len(), "Collection created");
            Ok(())
        })
    }

    fn insert_documents<'a>(&'a self, ns: &'a str, docs: &'a [Document]) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let mut rows = Vec::with_capacity(docs.len());
            for doc in docs {
                rows.push((document_id(ns, doc)?, to_json(doc)?));
            }
            let now = chrono::Utc::now().timestamp_millis();
            let pool = &self.pool;
            let rows = &rows;

            execute_with_retry("insert_documents", || async move {
                let mut tx = pool.begin().await?;
                for (doc_id, body) in rows {
                    sqlx::query("INSERT INTO documents (ns, doc_id, body, updated_at) VALUES (?, ?, ?, ?)")
                        .bind(ns)
                        .bind(doc_id)
                        .bind(body)
                        .bind(now)
                        .execute(&mut *tx)
                        .await?;
                }
                tx.commit().await
            })
            .await?;
            Ok(())
        })
    }

    fn insert_missing_document<'a>(&'a self, ns: &'a str, doc: &'a Document) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let doc_id = document_id(ns, doc)?;
            let body = to_json(doc)?;
            let now = chrono::Utc::now().timestamp_millis();
            let pool = &self.pool;

            execute_with_retry("insert_missing_document", || async {
                sqlx::query(
                    r#"
                    INSERT INTO documents (ns, doc_id, body, updated_at)
                    VALUES (?, ?, ?, ?)
                    ON CONFLICT(ns, doc_id) DO UPDATE SET
                        body = excluded.body,
                        updated_at = excluded.updated_at
                    "#,
                )
                .bind(ns)
                .bind(&doc_id)
                .bind(&body)
                .bind(now)
                .execute(pool)
                .await
            })
            .await?;

            debug!(ns, doc_id = %doc_id, "Inserted missing document");
            Ok(())
        })
    }

    fn get_initial_sync_flag(&self) -> BoxFuture<'_, bool> {
        Box::pin(async move {
            Ok(self.get_meta(META_INITIAL_SYNC_FLAG).await?.as_deref() == Some("1"))
        })
    }

    fn set_initial_sync_flag(&self, value: bool) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.set_meta(META_INITIAL_SYNC_FLAG, if value { "1" } else { "0" }).await?;
            info!(value, "Initial sync flag updated");
            Ok(())
        })
    }

    fn set_applied_through(&self, position: OpTime) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let value = to_json(&position)?;
            self.set_meta(META_APPLIED_THROUGH, &value).await
        })
    }
}
