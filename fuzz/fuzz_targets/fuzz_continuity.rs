//! Fuzz target for the first-batch continuity check.
//!
//! Arbitrary batches must never panic, and the verdict must agree with the
//! first document's timestamp.

#![no_main]

use data_replicator::fetcher::{check_continuity, DivergenceReason};
use data_replicator::oplog::{timestamp_of, Timestamp};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: (u32, u32, &[u8])| {
    let (secs, inc, raw) = data;
    let expected = Timestamp::new(secs, inc);
    let docs: Vec<serde_json::Value> = match serde_json::from_slice(raw) {
        Ok(serde_json::Value::Array(docs)) => docs,
        Ok(doc) => vec![doc],
        Err(_) => Vec::new(),
    };

    match check_continuity(&docs, expected) {
        Ok(()) => assert_eq!(docs.first().and_then(timestamp_of), Some(expected)),
        Err(DivergenceReason::EmptyFirstBatch) => assert!(docs.is_empty()),
        Err(DivergenceReason::MissingTimestamp) => {
            assert!(docs.first().and_then(timestamp_of).is_none())
        }
        Err(DivergenceReason::TimestampMismatch { expected: e, found }) => {
            assert_eq!(e, expected);
            assert_ne!(found, expected);
        }
    }
});
