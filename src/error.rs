// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the data replicator.
//!
//! Errors are categorized by where they originate (the sync source, local
//! storage, the apply callback, the state machine) and carry enough context
//! to log without a backtrace.
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Description |
//! |------------|-----------|-------------|
//! | `Remote` | Yes | Sync source unreachable, request timed out, cursor lost |
//! | `NoSyncSource` | Yes | No eligible sync source right now |
//! | `NoMatchingDocument` | Yes | Apply needs a document that is not local yet |
//! | `OperationFailed` | No | A collaborator rejected the work |
//! | `SourceRolledBack` | No | Sync source rolled back during initial sync |
//! | `InitialSyncFailure` | No | All initial sync attempts exhausted |
//! | `InvalidOplogEntry` | No | Malformed oplog document |
//! | `OplogOutOfOrder` | No | Source returned non-increasing timestamps |
//! | `Storage` / `Sqlite` | No | Local persistence errors |
//! | `AlreadyInitialized` | No | Entry point called in the wrong state |
//! | `IllegalOperation` | No | Entry point not valid right now |
//! | `Config` | No | Configuration invalid |
//! | `Shutdown` | No | Replicator is shutting down |
//! | `Internal` | No | Unexpected internal error |
//!
//! # Retry Behavior
//!
//! The fetcher retries [`ReplicationError::is_retryable()`] errors with
//! backoff before giving up on a sync source. Everything else is surfaced
//! to the state machine immediately.

use thiserror::Error;

/// Result type alias for replication operations.
pub type Result<T> = std::result::Result<T, ReplicationError>;

/// Errors that can occur during replication.
#[derive(Error, Debug)]
pub enum ReplicationError {
    /// A request to the sync source failed.
    ///
    /// Network errors, timeouts and lost cursors all land here.
    #[error("Remote error from {source_host} ({operation}): {message}")]
    Remote {
        source_host: String,
        operation: String,
        message: String,
    },

    /// The selector had no eligible sync source.
    #[error("No sync source available")]
    NoSyncSource,

    /// The apply callback could not find a document it needs to modify.
    ///
    /// Resolved inside the applier by fetching the document from the
    /// sync source; never reported past it.
    #[error("No matching document in {ns} for key {document_key}")]
    NoMatchingDocument {
        ns: String,
        document_key: serde_json::Value,
    },

    /// A collaborator (apply, rollback, storage, selector) rejected the work.
    #[error("Operation failed: {0}")]
    OperationFailed(String),

    /// The sync source's rollback id changed while an initial sync attempt
    /// was cloning from it.
    #[error("Sync source {source_host} rolled back during initial sync (rollback id {before} -> {after})")]
    SourceRolledBack {
        source_host: String,
        before: i64,
        after: i64,
    },

    /// Initial sync gave up after exhausting its attempts.
    #[error("Initial sync failed after {attempts} attempt(s): {cause}")]
    InitialSyncFailure {
        attempts: usize,
        #[source]
        cause: Box<ReplicationError>,
    },

    /// An oplog document could not be parsed.
    #[error("Invalid oplog entry: {0}")]
    InvalidOplogEntry(String),

    /// The sync source returned records that do not strictly increase.
    #[error("Oplog out of order: {next} does not follow {previous}")]
    OplogOutOfOrder { previous: String, next: String },

    /// Local storage rejected a write.
    #[error("Storage error: {0}")]
    Storage(String),

    /// SQLite error from the bundled storage backend.
    #[error("SQLite error: {0}")]
    Sqlite(#[from] sqlx::Error),

    /// `initial_sync` or `start` called when the replicator is already running.
    #[error("Already initialized")]
    AlreadyInitialized,

    /// The requested operation is not valid in the current state.
    #[error("Illegal operation: {0}")]
    IllegalOperation(String),

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Shutdown in progress.
    #[error("Shutdown in progress")]
    Shutdown,

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ReplicationError {
    /// Create a remote error for a request against `source_host`.
    pub fn remote(
        source_host: impl Into<String>,
        operation: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Remote {
            source_host: source_host.into(),
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Create a missing-document error.
    pub fn no_matching_document(ns: impl Into<String>, document_key: serde_json::Value) -> Self {
        Self::NoMatchingDocument {
            ns: ns.into(),
            document_key,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Remote { .. } => true,
            Self::NoSyncSource => true,
            Self::NoMatchingDocument { .. } => true,
            Self::OperationFailed(_) => false,
            Self::SourceRolledBack { .. } => false,
            Self::InitialSyncFailure { .. } => false,
            Self::InvalidOplogEntry(_) => false,
            Self::OplogOutOfOrder { .. } => false,
            Self::Storage(_) => false,
            Self::Sqlite(_) => false, // Local DB issues need attention
            Self::AlreadyInitialized => false,
            Self::IllegalOperation(_) => false,
            Self::Config(_) => false,
            Self::Shutdown => false,
            Self::Internal(_) => false,
        }
    }

    /// Short label for metrics and log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Remote { .. } => "remote",
            Self::NoSyncSource => "no_sync_source",
            Self::NoMatchingDocument { .. } => "no_matching_document",
            Self::OperationFailed(_) => "operation_failed",
            Self::SourceRolledBack { .. } => "source_rolled_back",
            Self::InitialSyncFailure { .. } => "initial_sync_failure",
            Self::InvalidOplogEntry(_) => "invalid_oplog_entry",
            Self::OplogOutOfOrder { .. } => "oplog_out_of_order",
            Self::Storage(_) | Self::Sqlite(_) => "storage",
            Self::AlreadyInitialized => "already_initialized",
            Self::IllegalOperation(_) => "illegal_operation",
            Self::Config(_) => "config",
            Self::Shutdown => "shutdown",
            Self::Internal(_) => "internal",
        }
    }
}
