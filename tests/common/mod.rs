//! Shared test utilities for replicator integration tests.
//!
//! This module provides:
//! - A mock sync source with tailable per-host oplogs
//! - Recording storage, applier, rollback and progress collaborators
//! - A [`Harness`] wiring them into a [`DataReplicator`]
//! - Oplog entry helpers

#![allow(dead_code)]

pub mod collaborators;
pub mod mock_source;

pub use collaborators::*;
pub use mock_source::*;

use data_replicator::config::{CandidateConfig, ReplicatorConfig};
use data_replicator::external::{Collaborators, InMemoryFollowerState, MemberState};
use data_replicator::oplog::{Document, OpTime, Timestamp};
use data_replicator::sync_source::CandidateSelector;
use data_replicator::DataReplicator;
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};

pub const TERM: i64 = 1;

pub fn ts(secs: u32) -> Timestamp {
    Timestamp::new(secs, 0)
}

pub fn op_time(secs: u32) -> OpTime {
    OpTime::new(ts(secs), TERM)
}

/// A no-op oplog entry at `secs`.
pub fn entry(secs: u32) -> Document {
    json!({"ts": {"t": secs, "i": 0}, "t": TERM, "h": secs as i64, "v": 2, "op": "n", "ns": "", "o": {"msg": "noop"}})
}

pub fn insert_entry(secs: u32, ns: &str, id: i64) -> Document {
    json!({"ts": {"t": secs, "i": 0}, "t": TERM, "h": secs as i64, "v": 2, "op": "i", "ns": ns, "o": {"_id": id}})
}

pub fn update_entry(secs: u32, ns: &str, id: i64) -> Document {
    json!({
        "ts": {"t": secs, "i": 0}, "t": TERM, "h": secs as i64, "v": 2, "op": "u", "ns": ns,
        "o": {"$set": {"x": 1}}, "o2": {"_id": id}
    })
}

/// Poll `condition` until it holds, panicking after a few seconds.
pub async fn eventually(what: &str, condition: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        if Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Mock collaborators plus a matching configuration.
pub struct Harness {
    pub source: Arc<MockSyncSource>,
    pub storage: Arc<MemoryStorage>,
    pub applier: Arc<ScriptedApplier>,
    pub rollback: Arc<RecordingRollback>,
    pub reporter: Arc<RecordingReporter>,
    pub follower: Arc<InMemoryFollowerState>,
    pub selector: Arc<CandidateSelector>,
    pub config: ReplicatorConfig,
}

impl Harness {
    /// Candidates `host-0` .. `host-{hosts-1}`, preferred in that order.
    pub fn new(hosts: usize) -> Self {
        let candidates: Vec<CandidateConfig> = (0..hosts)
            .map(|i| CandidateConfig::new(format!("host-{}", i), i as u32))
            .collect();

        let mut config = ReplicatorConfig::for_testing("member-under-test");
        config.sync_source.candidates = candidates.clone();

        Self {
            source: Arc::new(MockSyncSource::new()),
            storage: Arc::new(MemoryStorage::new()),
            applier: Arc::new(ScriptedApplier::new()),
            rollback: Arc::new(RecordingRollback::new()),
            reporter: Arc::new(RecordingReporter::new()),
            follower: Arc::new(InMemoryFollowerState::new(MemberState::Secondary)),
            selector: Arc::new(CandidateSelector::new(&candidates)),
            config,
        }
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            client: self.source.clone(),
            selector: self.selector.clone(),
            storage: self.storage.clone(),
            applier: self.applier.clone(),
            rollback: self.rollback.clone(),
            reporter: self.reporter.clone(),
            follower: self.follower.clone(),
        }
    }

    pub fn replicator(&self) -> DataReplicator {
        DataReplicator::new(self.config.clone(), self.collaborators()).unwrap()
    }

    /// A replicator that has already applied through `secs`, with its
    /// state observed by the rollback mock.
    pub fn replicator_at(&self, secs: u32) -> DataReplicator {
        let replicator = self.replicator().with_last_applied(op_time(secs));
        self.rollback.observe(replicator.state_receiver());
        replicator
    }

    pub fn follower_mode(&self) -> MemberState {
        use data_replicator::external::FollowerStateControl;
        self.follower.follower_mode()
    }
}
