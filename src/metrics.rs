//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics for:
//! - Replicator state and position
//! - Oplog fetching and buffering
//! - Apply batches and missing-document fetches
//! - Sync source changes, blacklisting and rollbacks
//! - Initial sync attempts and cloning
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `replication_` and follow Prometheus conventions:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track distributions (duration, size)
//!
//! # Usage
//!
//! ```rust,no_run
//! use data_replicator::metrics;
//! use std::time::Duration;
//!
//! metrics::record_fetch_batch("host-0:27017", 42, Duration::from_millis(8));
//! metrics::record_apply_batch(100, 2, Duration::from_millis(50));
//! ```

use crate::oplog::{OpTime, Timestamp};
use metrics::{counter, gauge, histogram};
use std::time::Duration;

/// Set the replicator state gauge (0=Uninitialized, 1=InitialSyncing, 2=Steady, 3=Rollback).
pub fn set_replicator_state(state: &str) {
    let value = match state {
        "Uninitialized" => 0.0,
        "InitialSyncing" => 1.0,
        "Steady" => 2.0,
        "Rollback" => 3.0,
        _ => -1.0,
    };
    gauge!("replication_replicator_state").set(value);
}

// =============================================================================
// Fetcher / Buffer
// =============================================================================

/// Record a batch of oplog records received from a sync source.
pub fn record_fetch_batch(source: &str, records: usize, latency: Duration) {
    counter!("replication_oplog_records_fetched_total", "source" => source.to_string())
        .increment(records as u64);
    histogram!("replication_oplog_fetch_duration_seconds", "source" => source.to_string())
        .record(latency.as_secs_f64());
}

/// Record a failed request against a sync source.
pub fn record_fetch_error(source: &str, kind: &str) {
    counter!(
        "replication_oplog_fetch_errors_total",
        "source" => source.to_string(),
        "kind" => kind.to_string()
    )
    .increment(1);
}

/// Record a detected divergence from the sync source's history.
pub fn record_divergence(source: &str, reason: &str) {
    counter!(
        "replication_oplog_divergence_total",
        "source" => source.to_string(),
        "reason" => reason.to_string()
    )
    .increment(1);
}

pub fn set_buffer_stats(count: usize, size_bytes: usize) {
    gauge!("replication_oplog_buffer_count").set(count as f64);
    gauge!("replication_oplog_buffer_bytes").set(size_bytes as f64);
}

pub fn set_last_fetched(ts: Timestamp) {
    gauge!("replication_last_fetched_seconds").set(ts.secs as f64);
}

// =============================================================================
// Applier
// =============================================================================

/// Record a successfully applied batch.
pub fn record_apply_batch(ops: usize, missing_documents: usize, duration: Duration) {
    counter!("replication_apply_batches_total").increment(1);
    counter!("replication_apply_ops_total").increment(ops as u64);
    if missing_documents > 0 {
        counter!("replication_missing_documents_fetched_total").increment(missing_documents as u64);
    }
    histogram!("replication_apply_batch_duration_seconds").record(duration.as_secs_f64());
    histogram!("replication_apply_batch_size").record(ops as f64);
}

/// Record a failed apply batch (it will be retried).
pub fn record_apply_error(kind: &str) {
    counter!("replication_apply_errors_total", "kind" => kind.to_string()).increment(1);
}

/// Record records discarded because they were at or before the applied position.
pub fn record_stale_records_discarded(count: usize) {
    counter!("replication_stale_records_discarded_total").increment(count as u64);
}

pub fn set_last_applied(position: OpTime) {
    gauge!("replication_last_applied_seconds").set(position.timestamp.secs as f64);
    gauge!("replication_last_applied_term").set(position.term as f64);
}

/// Record an upstream progress report.
pub fn record_progress_report(success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!("replication_progress_reports_total", "status" => status).increment(1);
}

// =============================================================================
// Sync Source / Rollback
// =============================================================================

/// Record a sync source change and why it happened.
pub fn record_sync_source_change(reason: &str) {
    counter!("replication_sync_source_changes_total", "reason" => reason.to_string()).increment(1);
}

pub fn record_sync_source_blacklisted(source: &str) {
    counter!("replication_sync_source_blacklisted_total", "source" => source.to_string()).increment(1);
}

/// Record the outcome of a rollback attempt.
pub fn record_rollback(success: bool) {
    let outcome = if success { "success" } else { "failure" };
    counter!("replication_rollbacks_total", "outcome" => outcome).increment(1);
}

// =============================================================================
// Initial Sync
// =============================================================================

/// Record the outcome of one initial sync attempt.
pub fn record_initial_sync_attempt(success: bool, duration: Duration) {
    let outcome = if success { "success" } else { "failure" };
    counter!("replication_initial_sync_attempts_total", "outcome" => outcome).increment(1);
    histogram!("replication_initial_sync_attempt_duration_seconds").record(duration.as_secs_f64());
}

/// Record one cloned collection.
pub fn record_collection_cloned(documents: usize, duration: Duration) {
    counter!("replication_collections_cloned_total").increment(1);
    counter!("replication_documents_cloned_total").increment(documents as u64);
    histogram!("replication_collection_clone_duration_seconds").record(duration.as_secs_f64());
}

/// Record storage SQLite retry (for SQLITE_BUSY/SQLITE_LOCKED).
pub fn storage_retries_total(operation: &str) {
    counter!("replication_storage_retries_total", "operation" => operation.to_string()).increment(1);
}
