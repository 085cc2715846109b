//! Configuration for the data replicator.
//!
//! Configuration is passed to [`DataReplicator::new()`](crate::DataReplicator::new)
//! and can be constructed programmatically or deserialized from YAML/JSON.
//!
//! # Quick Start
//!
//! ```rust
//! use data_replicator::config::{ReplicatorConfig, CandidateConfig};
//!
//! let mut config = ReplicatorConfig::for_testing("node-1");
//! config.sync_source.candidates = vec![
//!     CandidateConfig::new("host-0:27017", 0),
//!     CandidateConfig::new("host-1:27017", 1),
//! ];
//! assert!(config.validate().is_ok());
//! ```
//!
//! # Configuration Structure
//!
//! ```text
//! ReplicatorConfig
//! ├── member_id: String             # This member's name (logs, metrics)
//! ├── fetcher: FetcherConfig        # Oplog tailing and buffering
//! ├── applier: ApplierConfig        # Apply batching and retry
//! ├── initial_sync: InitialSyncConfig
//! ├── sync_source: SyncSourceConfig # Candidates and blacklisting
//! └── storage: StorageConfig        # SQLite persistence
//! ```
//!
//! # YAML Example
//!
//! ```yaml
//! member_id: "rs0.node-2"
//!
//! fetcher:
//!   batch_size: 500
//!   await_timeout: "5s"
//!
//! initial_sync:
//!   max_attempts: 10
//!   retry_wait: "1s"
//!
//! sync_source:
//!   candidates:
//!     - host: "node-1:27017"
//!       priority: 0
//!   blacklist_duration: "10s"
//!
//! storage:
//!   sqlite_path: "/var/lib/replica/data.db"
//! ```

use crate::error::{ReplicationError, Result};
use crate::resilience::RetryConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

fn parse_duration(value: &str, fallback: Duration) -> Duration {
    humantime::parse_duration(value).unwrap_or(fallback)
}

// ═══════════════════════════════════════════════════════════════════════════════
// Top-level config
// ═══════════════════════════════════════════════════════════════════════════════

/// The top-level config object passed to `DataReplicator::new()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicatorConfig {
    /// Name of the local member, attached to spans and log lines.
    pub member_id: String,

    #[serde(default)]
    pub fetcher: FetcherConfig,

    #[serde(default)]
    pub applier: ApplierConfig,

    #[serde(default)]
    pub initial_sync: InitialSyncConfig,

    #[serde(default)]
    pub sync_source: SyncSourceConfig,

    #[serde(default)]
    pub storage: StorageConfig,
}

impl Default for ReplicatorConfig {
    fn default() -> Self {
        Self {
            member_id: "local.member.default".to_string(),
            fetcher: FetcherConfig::default(),
            applier: ApplierConfig::default(),
            initial_sync: InitialSyncConfig::default(),
            sync_source: SyncSourceConfig::default(),
            storage: StorageConfig::default(),
        }
    }
}

impl ReplicatorConfig {
    /// Create a config with short timeouts and in-memory storage for tests.
    pub fn for_testing(member_id: &str) -> Self {
        Self {
            member_id: member_id.to_string(),
            fetcher: FetcherConfig {
                batch_size: 100,
                await_timeout: "20ms".to_string(),
                max_retries: 2,
                retry_initial_delay: "5ms".to_string(),
                retry_max_delay: "20ms".to_string(),
                request_timeout: "2s".to_string(),
                buffer_max_bytes: 1024 * 1024,
            },
            applier: ApplierConfig {
                max_batch_ops: 100,
                retry_wait: "10ms".to_string(),
                max_missing_document_fetches: 5,
            },
            initial_sync: InitialSyncConfig {
                max_attempts: 1,
                retry_wait: "5ms".to_string(),
                hand_off_to_steady_state: false,
                clone_concurrency: 2,
                clone_batch_size: 100,
                oplog_catch_up_timeout: "2s".to_string(),
            },
            sync_source: SyncSourceConfig {
                candidates: Vec::new(),
                blacklist_duration: "10s".to_string(),
                retry_wait: "10ms".to_string(),
            },
            storage: StorageConfig::in_memory(),
        }
    }

    /// Reject values that would stall or spin the replicator.
    pub fn validate(&self) -> Result<()> {
        if self.member_id.trim().is_empty() {
            return Err(ReplicationError::Config("member_id must not be empty".into()));
        }
        if self.fetcher.batch_size == 0 {
            return Err(ReplicationError::Config("fetcher.batch_size must be > 0".into()));
        }
        if self.fetcher.buffer_max_bytes == 0 {
            return Err(ReplicationError::Config(
                "fetcher.buffer_max_bytes must be > 0".into(),
            ));
        }
        if self.applier.max_batch_ops == 0 {
            return Err(ReplicationError::Config("applier.max_batch_ops must be > 0".into()));
        }
        if self.initial_sync.max_attempts == 0 {
            return Err(ReplicationError::Config(
                "initial_sync.max_attempts must be > 0".into(),
            ));
        }
        if self.initial_sync.clone_concurrency == 0 || self.initial_sync.clone_batch_size == 0 {
            return Err(ReplicationError::Config(
                "initial_sync.clone_concurrency and clone_batch_size must be > 0".into(),
            ));
        }

        let durations = [
            ("fetcher.await_timeout", &self.fetcher.await_timeout),
            ("fetcher.retry_initial_delay", &self.fetcher.retry_initial_delay),
            ("fetcher.retry_max_delay", &self.fetcher.retry_max_delay),
            ("fetcher.request_timeout", &self.fetcher.request_timeout),
            ("applier.retry_wait", &self.applier.retry_wait),
            ("initial_sync.retry_wait", &self.initial_sync.retry_wait),
            ("initial_sync.oplog_catch_up_timeout", &self.initial_sync.oplog_catch_up_timeout),
            ("sync_source.blacklist_duration", &self.sync_source.blacklist_duration),
            ("sync_source.retry_wait", &self.sync_source.retry_wait),
        ];
        for (name, value) in durations {
            if humantime::parse_duration(value).is_err() {
                return Err(ReplicationError::Config(format!(
                    "{} is not a valid duration: {:?}",
                    name, value
                )));
            }
        }

        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// FetcherConfig: oplog tailing
// ═══════════════════════════════════════════════════════════════════════════════

/// Oplog fetcher and buffer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetcherConfig {
    /// Maximum records requested per find/getMore.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// How long a tailing getMore waits on the source for new records (e.g. "5s").
    #[serde(default = "default_await_timeout")]
    pub await_timeout: String,

    /// Consecutive transport failures tolerated before the source is abandoned.
    #[serde(default = "default_fetcher_max_retries")]
    pub max_retries: usize,

    #[serde(default = "default_retry_initial_delay")]
    pub retry_initial_delay: String,

    #[serde(default = "default_retry_max_delay")]
    pub retry_max_delay: String,

    /// Upper bound on any single request to the sync source.
    #[serde(default = "default_request_timeout")]
    pub request_timeout: String,

    /// Byte cap on the oplog buffer. The fetcher waits when it is full.
    #[serde(default = "default_buffer_max_bytes")]
    pub buffer_max_bytes: usize,
}

fn default_batch_size() -> usize {
    500
}

fn default_await_timeout() -> String {
    "5s".to_string()
}

fn default_fetcher_max_retries() -> usize {
    3
}

fn default_retry_initial_delay() -> String {
    "100ms".to_string()
}

fn default_retry_max_delay() -> String {
    "5s".to_string()
}

fn default_request_timeout() -> String {
    "30s".to_string()
}

fn default_buffer_max_bytes() -> usize {
    256 * 1024 * 1024 // 256 MiB
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            await_timeout: default_await_timeout(),
            max_retries: default_fetcher_max_retries(),
            retry_initial_delay: default_retry_initial_delay(),
            retry_max_delay: default_retry_max_delay(),
            request_timeout: default_request_timeout(),
            buffer_max_bytes: default_buffer_max_bytes(),
        }
    }
}

impl FetcherConfig {
    pub fn await_timeout_duration(&self) -> Duration {
        parse_duration(&self.await_timeout, Duration::from_secs(5))
    }

    pub fn request_timeout_duration(&self) -> Duration {
        parse_duration(&self.request_timeout, Duration::from_secs(30))
    }

    /// Retry policy for transport errors against one sync source.
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.max_retries,
            initial_delay: parse_duration(&self.retry_initial_delay, Duration::from_millis(100)),
            max_delay: parse_duration(&self.retry_max_delay, Duration::from_secs(5)),
            backoff_factor: 2.0,
            request_timeout: self.request_timeout_duration(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ApplierConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// Apply batching configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplierConfig {
    /// Maximum records handed to the apply callback in one batch.
    #[serde(default = "default_max_batch_ops")]
    pub max_batch_ops: usize,

    /// Delay before a failed batch is retried.
    #[serde(default = "default_apply_retry_wait")]
    pub retry_wait: String,

    /// Missing documents fetched for one batch before the batch is failed.
    #[serde(default = "default_max_missing_document_fetches")]
    pub max_missing_document_fetches: usize,
}

fn default_max_batch_ops() -> usize {
    5000
}

fn default_apply_retry_wait() -> String {
    "1s".to_string()
}

fn default_max_missing_document_fetches() -> usize {
    100
}

impl Default for ApplierConfig {
    fn default() -> Self {
        Self {
            max_batch_ops: default_max_batch_ops(),
            retry_wait: default_apply_retry_wait(),
            max_missing_document_fetches: default_max_missing_document_fetches(),
        }
    }
}

impl ApplierConfig {
    pub fn retry_wait_duration(&self) -> Duration {
        parse_duration(&self.retry_wait, Duration::from_secs(1))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// InitialSyncConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// Initial sync configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitialSyncConfig {
    /// Attempts before initial sync reports `InitialSyncFailure`.
    #[serde(default = "default_initial_sync_attempts")]
    pub max_attempts: usize,

    /// Pause between attempts.
    #[serde(default = "default_initial_sync_retry_wait")]
    pub retry_wait: String,

    /// Keep the initial sync fetcher running and enter steady state on success.
    /// When false the replicator returns to Uninitialized after initial sync.
    #[serde(default = "default_true")]
    pub hand_off_to_steady_state: bool,

    /// Collections cloned concurrently.
    #[serde(default = "default_clone_concurrency")]
    pub clone_concurrency: usize,

    /// Documents per read from the source, and per storage insert, while cloning.
    #[serde(default = "default_clone_batch_size")]
    pub clone_batch_size: usize,

    /// How long catching up on the oplog after cloning may go without the
    /// fetcher delivering anything.
    #[serde(default = "default_oplog_catch_up_timeout")]
    pub oplog_catch_up_timeout: String,
}

fn default_true() -> bool {
    true
}

fn default_initial_sync_attempts() -> usize {
    10
}

fn default_initial_sync_retry_wait() -> String {
    "1s".to_string()
}

fn default_clone_concurrency() -> usize {
    4
}

fn default_clone_batch_size() -> usize {
    1000
}

fn default_oplog_catch_up_timeout() -> String {
    "5m".to_string()
}

impl Default for InitialSyncConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_initial_sync_attempts(),
            retry_wait: default_initial_sync_retry_wait(),
            hand_off_to_steady_state: true,
            clone_concurrency: default_clone_concurrency(),
            clone_batch_size: default_clone_batch_size(),
            oplog_catch_up_timeout: default_oplog_catch_up_timeout(),
        }
    }
}

impl InitialSyncConfig {
    pub fn retry_wait_duration(&self) -> Duration {
        parse_duration(&self.retry_wait, Duration::from_secs(1))
    }

    pub fn oplog_catch_up_timeout_duration(&self) -> Duration {
        parse_duration(&self.oplog_catch_up_timeout, Duration::from_secs(300))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// SyncSourceConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// One sync source candidate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateConfig {
    pub host: String,

    /// Lower values are preferred.
    #[serde(default)]
    pub priority: u32,
}

impl CandidateConfig {
    pub fn new(host: impl Into<String>, priority: u32) -> Self {
        Self {
            host: host.into(),
            priority,
        }
    }
}

/// Sync source selection configuration, used by
/// [`CandidateSelector`](crate::sync_source::CandidateSelector).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSourceConfig {
    #[serde(default)]
    pub candidates: Vec<CandidateConfig>,

    /// How long a failed source stays ineligible.
    #[serde(default = "default_blacklist_duration")]
    pub blacklist_duration: String,

    /// Delay before asking the selector again when no source was available.
    #[serde(default = "default_source_retry_wait")]
    pub retry_wait: String,
}

fn default_blacklist_duration() -> String {
    "10s".to_string()
}

fn default_source_retry_wait() -> String {
    "1s".to_string()
}

impl Default for SyncSourceConfig {
    fn default() -> Self {
        Self {
            candidates: Vec::new(),
            blacklist_duration: default_blacklist_duration(),
            retry_wait: default_source_retry_wait(),
        }
    }
}

impl SyncSourceConfig {
    pub fn blacklist_duration(&self) -> Duration {
        parse_duration(&self.blacklist_duration, Duration::from_secs(10))
    }

    pub fn retry_wait_duration(&self) -> Duration {
        parse_duration(&self.retry_wait, Duration::from_secs(1))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// StorageConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// SQLite storage configuration for [`SqliteStorage`](crate::storage::SqliteStorage).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub sqlite_path: String,

    /// Whether to use WAL mode for SQLite (recommended).
    #[serde(default = "default_true")]
    pub wal_mode: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            sqlite_path: "replica_data.db".to_string(),
            wal_mode: true,
        }
    }
}

impl StorageConfig {
    /// Create an in-memory config for testing.
    pub fn in_memory() -> Self {
        Self {
            sqlite_path: ":memory:".to_string(),
            wal_mode: false,
        }
    }

    pub fn is_in_memory(&self) -> bool {
        self.sqlite_path == ":memory:"
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = ReplicatorConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.initial_sync.hand_off_to_steady_state);
        assert_eq!(config.fetcher.batch_size, 500);
    }

    #[test]
    fn test_for_testing_is_valid_and_fast() {
        let config = ReplicatorConfig::for_testing("node-1");
        assert!(config.validate().is_ok());
        assert_eq!(config.member_id, "node-1");
        assert!(config.storage.is_in_memory());
        assert!(config.fetcher.await_timeout_duration() < Duration::from_secs(1));
        assert!(!config.initial_sync.hand_off_to_steady_state);
    }

    #[test]
    fn test_await_timeout_various_formats() {
        let test_cases = [
            ("5s", Duration::from_secs(5)),
            ("1m", Duration::from_secs(60)),
            ("500ms", Duration::from_millis(500)),
            ("2min", Duration::from_secs(120)),
        ];

        for (input, expected) in test_cases {
            let config = FetcherConfig {
                await_timeout: input.to_string(),
                ..Default::default()
            };
            assert_eq!(config.await_timeout_duration(), expected, "Failed for input: {}", input);
        }
    }

    #[test]
    fn test_invalid_duration_falls_back() {
        let config = ApplierConfig {
            retry_wait: "soon".to_string(),
            ..Default::default()
        };
        assert_eq!(config.retry_wait_duration(), Duration::from_secs(1));
    }

    #[test]
    fn test_validate_rejects_bad_duration() {
        let mut config = ReplicatorConfig::for_testing("node-1");
        config.sync_source.blacklist_duration = "forever".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("sync_source.blacklist_duration"));
    }

    #[test]
    fn test_validate_rejects_zero_sizes() {
        let mut config = ReplicatorConfig::for_testing("node-1");
        config.fetcher.batch_size = 0;
        assert!(config.validate().is_err());

        let mut config = ReplicatorConfig::for_testing("node-1");
        config.initial_sync.max_attempts = 0;
        assert!(config.validate().is_err());

        let mut config = ReplicatorConfig::for_testing("");
        config.member_id = "  ".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_retry_config_from_fetcher() {
        let config = FetcherConfig {
            max_retries: 7,
            retry_initial_delay: "50ms".to_string(),
            retry_max_delay: "1s".to_string(),
            ..Default::default()
        };
        let retry = config.retry_config();
        assert_eq!(retry.max_attempts, 7);
        assert_eq!(retry.initial_delay, Duration::from_millis(50));
        assert_eq!(retry.max_delay, Duration::from_secs(1));
    }

    #[test]
    fn test_deserialize_with_defaults() {
        let json = r#"{
            "member_id": "rs0.node-2",
            "sync_source": {
                "candidates": [{"host": "node-1:27017"}, {"host": "node-3:27017", "priority": 2}]
            },
            "initial_sync": {"max_attempts": 3}
        }"#;
        let config: ReplicatorConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.member_id, "rs0.node-2");
        assert_eq!(config.sync_source.candidates.len(), 2);
        assert_eq!(config.sync_source.candidates[0].priority, 0);
        assert_eq!(config.sync_source.candidates[1], CandidateConfig::new("node-3:27017", 2));
        assert_eq!(config.initial_sync.max_attempts, 3);
        assert_eq!(config.initial_sync.retry_wait_duration(), Duration::from_secs(1));
        assert!(config.initial_sync.hand_off_to_steady_state);
        assert_eq!(config.fetcher.buffer_max_bytes, 256 * 1024 * 1024);
        assert!(config.storage.wal_mode);
    }

    #[test]
    fn test_storage_in_memory() {
        let config = StorageConfig::in_memory();
        assert!(config.is_in_memory());
        assert!(!config.wal_mode);
        assert!(!StorageConfig::default().is_in_memory());
    }
}
