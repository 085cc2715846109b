// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Oplog fetcher: tails a sync source's oplog into the [`OplogBuffer`].
//!
//! One fetcher task runs per fetch session. It reports to its owner through
//! an unbounded channel of [`FetcherEvent`]s tagged with the session's
//! generation, so events from a replaced session can be told apart and
//! ignored.
//!
//! # Continuity Check
//!
//! Every cursor is opened at the last fetched timestamp. The source must
//! return that exact record first; it proves the source's history contains
//! ours and is then dropped. Anything else is a divergence:
//!
//! ```text
//! first batch empty            → EmptyFirstBatch
//! first document has no ts     → MissingTimestamp
//! first ts != last fetched     → TimestampMismatch
//! ```
//!
//! A fetcher started from the null timestamp has nothing to match and
//! buffers every record it receives.
//!
//! # Failure Handling
//!
//! Retryable errors (transport, timeouts) reopen the cursor from the last
//! fetched timestamp with exponential backoff. Once the retry budget is
//! spent, or on a non-retryable error, the fetcher reports `Failed` and
//! exits. The owner decides whether to blacklist the source.

use crate::buffer::{OplogBuffer, PushOutcome};
use crate::config::FetcherConfig;
use crate::error::ReplicationError;
use crate::metrics;
use crate::oplog::{timestamp_of, Document, OplogRecord, Timestamp};
use crate::remote::{SourceMetadata, SyncSource, SyncSourceClient};
use crate::resilience::with_request_timeout;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Why the source's history was judged to differ from ours.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DivergenceReason {
    EmptyFirstBatch,
    MissingTimestamp,
    TimestampMismatch { expected: Timestamp, found: Timestamp },
}

impl DivergenceReason {
    pub fn label(&self) -> &'static str {
        match self {
            Self::EmptyFirstBatch => "empty_first_batch",
            Self::MissingTimestamp => "missing_timestamp",
            Self::TimestampMismatch { .. } => "timestamp_mismatch",
        }
    }
}

impl fmt::Display for DivergenceReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyFirstBatch => write!(f, "first batch was empty"),
            Self::MissingTimestamp => write!(f, "first document has no timestamp"),
            Self::TimestampMismatch { expected, found } => {
                write!(f, "expected first timestamp {}, found {}", expected, found)
            }
        }
    }
}

/// Check the first batch of a cursor against the last fetched timestamp.
pub fn check_continuity(documents: &[Document], expected: Timestamp) -> Result<(), DivergenceReason> {
    let first = documents.first().ok_or(DivergenceReason::EmptyFirstBatch)?;
    let found = timestamp_of(first).ok_or(DivergenceReason::MissingTimestamp)?;
    if found != expected {
        return Err(DivergenceReason::TimestampMismatch { expected, found });
    }
    Ok(())
}

/// Notification from a fetcher to its owner.
#[derive(Debug)]
pub enum FetcherEvent {
    /// Records were appended to the buffer (or metadata arrived with none).
    Batch {
        generation: u64,
        source: SyncSource,
        count: usize,
        last_fetched: Timestamp,
        metadata: Option<SourceMetadata>,
    },
    /// The source's history does not contain our last fetched record.
    Divergence {
        generation: u64,
        source: SyncSource,
        reason: DivergenceReason,
    },
    /// The fetcher gave up on the source.
    Failed {
        generation: u64,
        source: SyncSource,
        error: ReplicationError,
    },
}

impl FetcherEvent {
    pub fn generation(&self) -> u64 {
        match self {
            Self::Batch { generation, .. }
            | Self::Divergence { generation, .. }
            | Self::Failed { generation, .. } => *generation,
        }
    }
}

/// Owner's handle on a running fetcher.
#[derive(Debug)]
pub struct FetcherHandle {
    generation: u64,
    source: SyncSource,
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl FetcherHandle {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Ask the fetcher to stop without waiting for it.
    pub fn cancel(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Stop the fetcher and wait for its task to exit.
    pub async fn shutdown(self) {
        self.cancel();
        if let Err(e) = self.join.await {
            if e.is_panic() {
                error!(source = %self.source, generation = self.generation, "Oplog fetcher panicked");
            }
        }
    }
}

/// How one cursor's life ended.
enum CursorEnd {
    Shutdown,
    Superseded,
    Exhausted { delivered: bool },
    Diverged(DivergenceReason),
    Failed(ReplicationError),
}

/// A fetch session against one sync source.
pub struct OplogFetcher {
    generation: u64,
    source: SyncSource,
    start: Timestamp,
    client: Arc<dyn SyncSourceClient>,
    buffer: Arc<OplogBuffer>,
    config: FetcherConfig,
    events: mpsc::UnboundedSender<FetcherEvent>,
}

impl OplogFetcher {
    pub fn new(
        generation: u64,
        source: SyncSource,
        start: Timestamp,
        client: Arc<dyn SyncSourceClient>,
        buffer: Arc<OplogBuffer>,
        config: FetcherConfig,
        events: mpsc::UnboundedSender<FetcherEvent>,
    ) -> Self {
        Self {
            generation,
            source,
            start,
            client,
            buffer,
            config,
            events,
        }
    }

    /// Claim the buffer for this session and start tailing.
    pub fn spawn(self) -> FetcherHandle {
        self.buffer.begin_generation(self.generation, self.start);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let generation = self.generation;
        let source = self.source.clone();
        let join = tokio::spawn(self.run(shutdown_rx));
        FetcherHandle {
            generation,
            source,
            shutdown_tx,
            join,
        }
    }

    async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        let span = info_span!("oplog_fetcher", source = %self.source, generation = self.generation);

        async move {
            info!(start = %self.start, "Starting oplog fetcher");

            let retry = self.config.retry_config();
            let mut last_fetched = self.start;
            let mut failures = 0usize;

            loop {
                let end = self
                    .run_cursor(&mut last_fetched, &mut failures, &mut shutdown_rx)
                    .await;

                match end {
                    CursorEnd::Shutdown => {
                        debug!("Fetcher cancelled");
                        break;
                    }
                    CursorEnd::Superseded => {
                        debug!("Fetcher superseded by a newer session");
                        break;
                    }
                    CursorEnd::Exhausted { delivered } => {
                        // Nothing new: don't spin reopening an idle source.
                        if !delivered
                            && wait_or_cancel(&mut shutdown_rx, self.config.await_timeout_duration()).await
                        {
                            break;
                        }
                        debug!(%last_fetched, "Cursor exhausted, reopening");
                    }
                    CursorEnd::Diverged(reason) => {
                        warn!(%reason, %last_fetched, "Sync source history diverges from ours");
                        metrics::record_divergence(self.source.as_str(), reason.label());
                        self.notify(FetcherEvent::Divergence {
                            generation: self.generation,
                            source: self.source.clone(),
                            reason,
                        });
                        break;
                    }
                    CursorEnd::Failed(e) => {
                        failures += 1;
                        metrics::record_fetch_error(self.source.as_str(), e.kind());

                        if !e.is_retryable() || !retry.should_retry(failures) {
                            warn!(error = %e, failures, "Giving up on sync source");
                            self.notify(FetcherEvent::Failed {
                                generation: self.generation,
                                source: self.source.clone(),
                                error: e,
                            });
                            break;
                        }

                        let delay = retry.delay_for_attempt(failures);
                        warn!(error = %e, failures, delay_ms = delay.as_millis() as u64, "Fetch failed, retrying");
                        if wait_or_cancel(&mut shutdown_rx, delay).await {
                            break;
                        }
                    }
                }
            }

            info!(%last_fetched, "Oplog fetcher stopped");
        }
        .instrument(span)
        .await
    }

    async fn run_cursor(
        &self,
        last_fetched: &mut Timestamp,
        failures: &mut usize,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> CursorEnd {
        let host = self.source.as_str();
        let request_timeout = self.config.request_timeout_duration();
        let await_timeout = self.config.await_timeout_duration();

        let started = Instant::now();
        let find = with_request_timeout(
            request_timeout,
            host,
            "find",
            self.client.find_oplog(&self.source, *last_fetched, self.config.batch_size),
        );
        let first = tokio::select! {
            biased;
            _ = cancelled(shutdown_rx) => return CursorEnd::Shutdown,
            result = find => result,
        };
        let first = match first {
            Ok(batch) => batch,
            Err(e) => return CursorEnd::Failed(e),
        };
        *failures = 0;

        let mut documents = first.documents;
        if !last_fetched.is_null() {
            if let Err(reason) = check_continuity(&documents, *last_fetched) {
                return CursorEnd::Diverged(reason);
            }
            documents.remove(0);
        }

        let mut delivered = match self
            .deliver(documents, first.metadata, last_fetched, started, shutdown_rx)
            .await
        {
            Ok(count) => count > 0,
            Err(end) => return end,
        };

        let mut cursor_id = first.cursor_id;
        while cursor_id != 0 {
            let started = Instant::now();
            let more = with_request_timeout(
                request_timeout + await_timeout,
                host,
                "getMore",
                self.client.get_more_oplog(&self.source, cursor_id, await_timeout),
            );
            let result = tokio::select! {
                biased;
                _ = cancelled(shutdown_rx) => {
                    if let Err(e) = self.client.kill_cursor(&self.source, cursor_id).await {
                        debug!(error = %e, cursor_id, "Failed to kill oplog cursor");
                    }
                    return CursorEnd::Shutdown;
                }
                result = more => result,
            };
            let batch = match result {
                Ok(batch) => batch,
                Err(e) => return CursorEnd::Failed(e),
            };
            *failures = 0;

            match self
                .deliver(batch.documents, batch.metadata, last_fetched, started, shutdown_rx)
                .await
            {
                Ok(count) => delivered |= count > 0,
                Err(end) => return end,
            }
            cursor_id = batch.cursor_id;
        }

        CursorEnd::Exhausted { delivered }
    }

    /// Parse, validate ordering, buffer, and announce one batch.
    async fn deliver(
        &self,
        documents: Vec<Document>,
        metadata: Option<SourceMetadata>,
        last_fetched: &mut Timestamp,
        started: Instant,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> Result<usize, CursorEnd> {
        let mut records = Vec::with_capacity(documents.len());
        let mut previous = *last_fetched;
        for doc in &documents {
            let record = OplogRecord::from_document(doc).map_err(CursorEnd::Failed)?;
            if record.timestamp() <= previous {
                return Err(CursorEnd::Failed(ReplicationError::OplogOutOfOrder {
                    previous: previous.to_string(),
                    next: record.timestamp().to_string(),
                }));
            }
            previous = record.timestamp();
            records.push(record);
        }

        let count = records.len();
        if count == 0 && metadata.is_none() {
            return Ok(0);
        }

        if count > 0 {
            let outcome = tokio::select! {
                biased;
                _ = cancelled(shutdown_rx) => return Err(CursorEnd::Shutdown),
                outcome = self.buffer.push_many(self.generation, records) => outcome,
            };
            if outcome == PushOutcome::Superseded {
                return Err(CursorEnd::Superseded);
            }
            *last_fetched = previous;
            metrics::record_fetch_batch(self.source.as_str(), count, started.elapsed());
            metrics::set_last_fetched(previous);
            metrics::set_buffer_stats(self.buffer.count(), self.buffer.size_bytes());
            debug!(count, last_fetched = %previous, "Buffered oplog batch");
        }

        let sent = self.events.send(FetcherEvent::Batch {
            generation: self.generation,
            source: self.source.clone(),
            count,
            last_fetched: *last_fetched,
            metadata,
        });
        if sent.is_err() {
            return Err(CursorEnd::Superseded);
        }
        Ok(count)
    }

    fn notify(&self, event: FetcherEvent) {
        if self.events.send(event).is_err() {
            debug!("Fetcher owner is gone, dropping event");
        }
    }
}

/// Resolves once cancellation is requested or the handle is dropped.
pub(crate) async fn cancelled(shutdown_rx: &mut watch::Receiver<bool>) {
    let _ = shutdown_rx.wait_for(|stop| *stop).await;
}

/// Sleep for `delay`. Returns true if cancelled first.
pub(crate) async fn wait_or_cancel(shutdown_rx: &mut watch::Receiver<bool>, delay: std::time::Duration) -> bool {
    tokio::select! {
        biased;
        _ = cancelled(shutdown_rx) => true,
        _ = tokio::time::sleep(delay) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry(secs: u32) -> Document {
        json!({"ts": {"t": secs, "i": 0}, "t": 1, "op": "n", "ns": "", "o": {}})
    }

    #[test]
    fn test_continuity_ok() {
        let docs = vec![entry(1), entry(2)];
        assert_eq!(check_continuity(&docs, Timestamp::new(1, 0)), Ok(()));
    }

    #[test]
    fn test_continuity_empty_batch() {
        assert_eq!(
            check_continuity(&[], Timestamp::new(1, 0)),
            Err(DivergenceReason::EmptyFirstBatch)
        );
    }

    #[test]
    fn test_continuity_missing_timestamp() {
        assert_eq!(
            check_continuity(&[json!({})], Timestamp::new(1, 0)),
            Err(DivergenceReason::MissingTimestamp)
        );
    }

    #[test]
    fn test_continuity_mismatch() {
        let result = check_continuity(&[entry(2)], Timestamp::new(1, 0));
        assert_eq!(
            result,
            Err(DivergenceReason::TimestampMismatch {
                expected: Timestamp::new(1, 0),
                found: Timestamp::new(2, 0),
            })
        );
        let reason = result.unwrap_err();
        assert_eq!(reason.label(), "timestamp_mismatch");
        assert!(reason.to_string().contains("Timestamp(2, 0)"));
    }

    #[test]
    fn test_event_generation() {
        let event = FetcherEvent::Divergence {
            generation: 7,
            source: SyncSource::new("host-0"),
            reason: DivergenceReason::EmptyFirstBatch,
        };
        assert_eq!(event.generation(), 7);
    }

    #[tokio::test]
    async fn test_wait_or_cancel() {
        let (tx, mut rx) = watch::channel(false);
        assert!(!wait_or_cancel(&mut rx, std::time::Duration::from_millis(1)).await);
        tx.send(true).unwrap();
        assert!(wait_or_cancel(&mut rx, std::time::Duration::from_secs(60)).await);
        drop(tx);
        let (_tx2, mut rx2) = watch::channel(true);
        assert!(wait_or_cancel(&mut rx2, std::time::Duration::from_secs(60)).await);
    }
}
