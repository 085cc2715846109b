//! Sync source selection and blacklisting.
//!
//! The replicator asks a [`SyncSourceSelector`] for a source whenever it has
//! none, and blacklists a source after a fetch failure or failed rollback.
//!
//! # Candidate Lifecycle
//!
//! ```text
//! Eligible ──choose──► Current ──failure──► Blacklisted(until)
//!    ▲                                            │
//!    └────────────── expiry / clear ──────────────┘
//! ```
//!
//! [`CandidateSelector`] is the bundled implementation: a static list of
//! candidates ordered by priority, with time-bounded blacklisting.

use crate::config::{CandidateConfig, SyncSourceConfig};
use crate::oplog::Timestamp;
use crate::remote::{SourceMetadata, SyncSource};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::time::Instant;
use tracing::{debug, info};

/// Chooses sync sources for the replicator.
pub trait SyncSourceSelector: Send + Sync + 'static {
    /// Pick a source that is ahead of `last_fetched`, or `None` if no
    /// candidate is eligible right now.
    fn choose_new_sync_source(&self, last_fetched: Timestamp) -> Option<SyncSource>;

    /// Make `source` ineligible until `until`.
    fn blacklist_sync_source(&self, source: &SyncSource, until: Instant);

    /// Forget every blacklist entry.
    fn clear_sync_source_blacklist(&self);

    /// Whether the replicator should move away from `current`, judging by
    /// the metadata `current` attached to its last response.
    fn should_change_sync_source(&self, current: &SyncSource, metadata: &SourceMetadata) -> bool;
}

/// Selection state shared by the selector's methods.
#[derive(Debug, Default)]
pub struct SyncSourceState {
    current: Option<SyncSource>,
    blacklist: HashMap<SyncSource, Instant>,
    /// Source judged stranded; passed over once by the next choice.
    avoid: Option<SyncSource>,
}

impl SyncSourceState {
    /// Drop entries whose blacklist period has passed.
    fn prune(&mut self, now: Instant) {
        self.blacklist.retain(|source, until| {
            let keep = *until > now;
            if !keep {
                debug!(%source, "Sync source blacklist entry expired");
            }
            keep
        });
    }

    fn is_blacklisted(&self, source: &SyncSource) -> bool {
        self.blacklist.contains_key(source)
    }

    pub fn current(&self) -> Option<&SyncSource> {
        self.current.as_ref()
    }
}

#[derive(Debug, Clone)]
struct Candidate {
    source: SyncSource,
    priority: u32,
}

/// Priority-ordered candidate list with time-bounded blacklisting.
///
/// Lower priority values win; ties keep configuration order.
#[derive(Debug)]
pub struct CandidateSelector {
    candidates: Vec<Candidate>,
    state: Mutex<SyncSourceState>,
}

impl CandidateSelector {
    pub fn new(candidates: &[CandidateConfig]) -> Self {
        let mut candidates: Vec<Candidate> = candidates
            .iter()
            .map(|c| Candidate {
                source: SyncSource::new(c.host.clone()),
                priority: c.priority,
            })
            .collect();
        // stable: equal priorities keep their configured order
        candidates.sort_by_key(|c| c.priority);
        Self {
            candidates,
            state: Mutex::new(SyncSourceState::default()),
        }
    }

    pub fn from_config(config: &SyncSourceConfig) -> Self {
        Self::new(&config.candidates)
    }

    fn lock(&self) -> MutexGuard<'_, SyncSourceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Currently blacklisted sources (expired entries excluded).
    pub fn blacklisted(&self) -> Vec<SyncSource> {
        let mut state = self.lock();
        state.prune(Instant::now());
        let mut out: Vec<_> = state.blacklist.keys().cloned().collect();
        out.sort();
        out
    }

    pub fn current(&self) -> Option<SyncSource> {
        self.lock().current().cloned()
    }
}

impl SyncSourceSelector for CandidateSelector {
    fn choose_new_sync_source(&self, last_fetched: Timestamp) -> Option<SyncSource> {
        let mut state = self.lock();
        state.prune(Instant::now());

        let avoid = state.avoid.take();
        let eligible = |c: &&Candidate| !state.is_blacklisted(&c.source);
        let chosen = self
            .candidates
            .iter()
            .filter(eligible)
            .find(|c| Some(&c.source) != avoid.as_ref())
            .or_else(|| self.candidates.iter().find(eligible))
            .map(|c| c.source.clone());

        match &chosen {
            Some(source) => info!(%source, %last_fetched, "Chose sync source"),
            None => info!(%last_fetched, candidates = self.candidates.len(), "No eligible sync source"),
        }
        state.current = chosen.clone();
        chosen
    }

    fn blacklist_sync_source(&self, source: &SyncSource, until: Instant) {
        let mut state = self.lock();
        info!(%source, for_ms = until.saturating_duration_since(Instant::now()).as_millis() as u64, "Blacklisting sync source");
        state.blacklist.insert(source.clone(), until);
        if state.current.as_ref() == Some(source) {
            state.current = None;
        }
    }

    fn clear_sync_source_blacklist(&self) {
        let mut state = self.lock();
        if !state.blacklist.is_empty() {
            info!(entries = state.blacklist.len(), "Clearing sync source blacklist");
        }
        state.blacklist.clear();
    }

    fn should_change_sync_source(&self, current: &SyncSource, metadata: &SourceMetadata) -> bool {
        // A source that is neither primary nor replicating from anyone will
        // not see new writes. Only move if somewhere else is eligible.
        if metadata.is_primary || metadata.has_sync_source {
            return false;
        }
        let mut state = self.lock();
        state.prune(Instant::now());
        let alternative = self
            .candidates
            .iter()
            .any(|c| &c.source != current && !state.is_blacklisted(&c.source));
        if alternative {
            info!(source = %current, "Sync source is stranded, will change");
            state.avoid = Some(current.clone());
        }
        alternative
    }
}
