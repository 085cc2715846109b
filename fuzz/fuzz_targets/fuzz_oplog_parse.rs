//! Fuzz target for oplog entry parsing.
//!
//! Sources are untrusted: any JSON they send must parse or be rejected,
//! never panic.

#![no_main]

use data_replicator::oplog::{timestamp_of, OpTime, OplogRecord};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(doc) = serde_json::from_slice::<serde_json::Value>(data) else {
        return;
    };

    let _ = OpTime::from_document(&doc);
    let ts = timestamp_of(&doc);

    if let Ok(record) = OplogRecord::from_document(&doc) {
        // A parsed record agrees with the raw timestamp lookup.
        assert_eq!(Some(record.timestamp()), ts);
        let _ = record.document_key();
        let _ = record.db();
        assert!(record.approximate_size() > 0);

        // And survives a trip back to a document.
        let again = OplogRecord::from_document(&record.to_document()).expect("reparse");
        assert_eq!(again, record);
    }
});
