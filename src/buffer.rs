//! Byte-capped FIFO of fetched oplog records awaiting apply.
//!
//! One fetcher at a time owns the write side. [`OplogBuffer::begin_generation`]
//! names the accepted writer; pushes tagged with any other generation are
//! rejected, so a fetcher that is being replaced can never append records
//! after its successor has started.
//!
//! ```text
//!  fetcher (gen N) ──push_many──► [ r1 r2 r3 ... ] ──pop_up_to──► applier
//!                                   ▲
//!                 push_front_many ──┘ (failed batch requeue)
//! ```

use crate::oplog::{OplogRecord, Timestamp};
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;

#[derive(Debug, Default)]
struct BufferInner {
    records: VecDeque<(OplogRecord, usize)>,
    size_bytes: usize,
    generation: u64,
    last_pushed: Timestamp,
}

impl BufferInner {
    fn push_back(&mut self, record: OplogRecord) {
        let size = record.approximate_size();
        self.size_bytes += size;
        self.records.push_back((record, size));
    }

    fn pop_front(&mut self) -> Option<OplogRecord> {
        let (record, size) = self.records.pop_front()?;
        self.size_bytes = self.size_bytes.saturating_sub(size);
        Some(record)
    }
}

/// Outcome of [`OplogBuffer::push_many`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Accepted,
    /// The writer's generation is no longer current; nothing was pushed.
    Superseded,
}

/// Shared oplog buffer between the fetcher and the applier.
#[derive(Debug)]
pub struct OplogBuffer {
    inner: Mutex<BufferInner>,
    space: Notify,
    max_size_bytes: usize,
}

impl OplogBuffer {
    pub fn new(max_size_bytes: usize) -> Self {
        Self {
            inner: Mutex::new(BufferInner::default()),
            space: Notify::new(),
            max_size_bytes: max_size_bytes.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BufferInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make `generation` the only accepted writer, fetching after `start`.
    ///
    /// Wakes any superseded writer blocked on backpressure so it can observe
    /// the rejection.
    pub fn begin_generation(&self, generation: u64, start: Timestamp) {
        {
            let mut inner = self.lock();
            inner.generation = generation;
            inner.last_pushed = start;
        }
        self.space.notify_waiters();
    }

    /// Stop accepting pushes from any writer and return the last pushed
    /// timestamp. Generation 0 is never handed to a fetcher.
    pub fn fence(&self) -> Timestamp {
        let last_pushed = {
            let mut inner = self.lock();
            inner.generation = 0;
            inner.last_pushed
        };
        self.space.notify_waiters();
        last_pushed
    }

    pub fn generation(&self) -> u64 {
        self.lock().generation
    }

    /// Timestamp of the last record pushed by the current generation, or its
    /// start timestamp if it has pushed nothing.
    pub fn last_pushed(&self) -> Timestamp {
        self.lock().last_pushed
    }

    /// Append records, waiting for space when the buffer is over its cap.
    ///
    /// A batch that is larger than the cap is accepted once the buffer is
    /// empty, so progress is always possible.
    pub async fn push_many(&self, generation: u64, records: Vec<OplogRecord>) -> PushOutcome {
        if records.is_empty() {
            return if self.generation() == generation {
                PushOutcome::Accepted
            } else {
                PushOutcome::Superseded
            };
        }
        let incoming: usize = records.iter().map(OplogRecord::approximate_size).sum();

        loop {
            let notified = self.space.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut inner = self.lock();
                if inner.generation != generation {
                    return PushOutcome::Superseded;
                }
                if inner.records.is_empty() || inner.size_bytes + incoming <= self.max_size_bytes {
                    if let Some(last) = records.last() {
                        inner.last_pushed = last.timestamp();
                    }
                    for record in records {
                        inner.push_back(record);
                    }
                    return PushOutcome::Accepted;
                }
            }

            notified.await;
        }
    }

    /// Pop up to `max` records from the front.
    pub fn pop_up_to(&self, max: usize) -> Vec<OplogRecord> {
        let popped = {
            let mut inner = self.lock();
            let n = max.min(inner.records.len());
            let mut out = Vec::with_capacity(n);
            for _ in 0..n {
                if let Some(record) = inner.pop_front() {
                    out.push(record);
                }
            }
            out
        };
        if !popped.is_empty() {
            self.space.notify_waiters();
        }
        popped
    }

    /// Pop up to `max` records whose timestamp is at or before `through`.
    pub fn pop_through(&self, through: Timestamp, max: usize) -> Vec<OplogRecord> {
        let popped = {
            let mut inner = self.lock();
            let mut out = Vec::new();
            while out.len() < max {
                match inner.records.front() {
                    Some((record, _)) if record.timestamp() <= through => {
                        if let Some(record) = inner.pop_front() {
                            out.push(record);
                        }
                    }
                    _ => break,
                }
            }
            out
        };
        if !popped.is_empty() {
            self.space.notify_waiters();
        }
        popped
    }

    /// Put a batch back at the front, preserving its order.
    pub fn push_front_many(&self, records: Vec<OplogRecord>) {
        let mut inner = self.lock();
        for record in records.into_iter().rev() {
            let size = record.approximate_size();
            inner.size_bytes += size;
            inner.records.push_front((record, size));
        }
    }

    pub fn clear(&self) {
        {
            let mut inner = self.lock();
            inner.records.clear();
            inner.size_bytes = 0;
        }
        self.space.notify_waiters();
    }

    pub fn count(&self) -> usize {
        self.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().records.is_empty()
    }

    pub fn size_bytes(&self) -> usize {
        self.lock().size_bytes
    }

    pub fn max_size_bytes(&self) -> usize {
        self.max_size_bytes
    }
}
