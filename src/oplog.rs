// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Oplog data model.
//!
//! Documents travel as [`serde_json::Value`]. Oplog records are parsed into
//! [`OplogRecord`] once, on the fetcher, and are immutable afterwards.
//!
//! # Wire Shape
//!
//! ```text
//! {
//!   "ts": {"t": 1700000000, "i": 3},   # Timestamp (secs, increment)
//!   "t":  1,                          # term (optional, default -1)
//!   "h":  12345,                      # hash (optional)
//!   "ns": "db.coll",
//!   "op": "i" | "u" | "d" | "c" | "n",
//!   "o":  { ... },                    # document / update spec / command
//!   "o2": { "_id": ... },             # update target (updates only)
//!   "v":  2
//! }
//! ```

use crate::error::{ReplicationError, Result};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;

/// A schemaless document, as exchanged with the sync source and storage.
pub type Document = serde_json::Value;

/// Term recorded for entries written before terms existed.
pub const UNINITIALIZED_TERM: i64 = -1;

/// Logical oplog timestamp. Totally ordered by `(secs, inc)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Timestamp {
    #[serde(rename = "t")]
    pub secs: u32,
    #[serde(rename = "i")]
    pub inc: u32,
}

impl Timestamp {
    pub const fn new(secs: u32, inc: u32) -> Self {
        Self { secs, inc }
    }

    /// The zero timestamp, meaning "nothing applied yet".
    pub const fn null() -> Self {
        Self { secs: 0, inc: 0 }
    }

    pub fn is_null(&self) -> bool {
        self.secs == 0 && self.inc == 0
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({}, {})", self.secs, self.inc)
    }
}

/// Replication position: `(timestamp, term)`, ordered by timestamp first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OpTime {
    pub timestamp: Timestamp,
    pub term: i64,
}

impl OpTime {
    pub const fn new(timestamp: Timestamp, term: i64) -> Self {
        Self { timestamp, term }
    }

    /// Position of a member that has applied nothing.
    pub const fn null() -> Self {
        Self {
            timestamp: Timestamp::null(),
            term: UNINITIALIZED_TERM,
        }
    }

    pub fn is_null(&self) -> bool {
        self.timestamp.is_null()
    }

    /// Read `ts` and `t` from an oplog document without parsing the rest.
    pub fn from_document(doc: &Document) -> Result<Self> {
        let timestamp = timestamp_of(doc)
            .ok_or_else(|| ReplicationError::InvalidOplogEntry("missing or invalid 'ts'".into()))?;
        let term = doc.get("t").and_then(|t| t.as_i64()).unwrap_or(UNINITIALIZED_TERM);
        Ok(Self::new(timestamp, term))
    }
}

impl Default for OpTime {
    fn default() -> Self {
        Self::null()
    }
}

impl fmt::Display for OpTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{ ts: {}, t: {} }}", self.timestamp, self.term)
    }
}

/// Extract the `ts` field of an oplog document, if present and well-formed.
pub fn timestamp_of(doc: &Document) -> Option<Timestamp> {
    doc.get("ts")
        .and_then(|ts| serde_json::from_value::<Timestamp>(ts.clone()).ok())
}

/// Kind of oplog operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OpType {
    #[serde(rename = "i")]
    Insert,
    #[serde(rename = "u")]
    Update,
    #[serde(rename = "d")]
    Delete,
    #[serde(rename = "c")]
    Command,
    #[serde(rename = "n")]
    Noop,
}

impl OpType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Insert => "i",
            Self::Update => "u",
            Self::Delete => "d",
            Self::Command => "c",
            Self::Noop => "n",
        }
    }
}

impl fmt::Display for OpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn default_term() -> i64 {
    UNINITIALIZED_TERM
}

fn default_version() -> i32 {
    2
}

/// One parsed oplog entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OplogRecord {
    #[serde(rename = "ts")]
    timestamp: Timestamp,
    #[serde(rename = "t", default = "default_term")]
    term: i64,
    #[serde(rename = "h", default)]
    hash: i64,
    #[serde(default)]
    ns: String,
    #[serde(rename = "op")]
    op_type: OpType,
    #[serde(rename = "o", default, skip_serializing_if = "Option::is_none")]
    object: Option<Document>,
    #[serde(rename = "o2", default, skip_serializing_if = "Option::is_none")]
    object2: Option<Document>,
    #[serde(rename = "v", default = "default_version")]
    version: i32,
}

impl OplogRecord {
    pub fn new(timestamp: Timestamp, term: i64, ns: impl Into<String>, op_type: OpType) -> Self {
        Self {
            timestamp,
            term,
            hash: 0,
            ns: ns.into(),
            op_type,
            object: None,
            object2: None,
            version: default_version(),
        }
    }

    /// Attach the operation's main document (`o`).
    pub fn with_object(mut self, object: Document) -> Self {
        self.object = Some(object);
        self
    }

    /// Attach the update target (`o2`).
    pub fn with_object2(mut self, object2: Document) -> Self {
        self.object2 = Some(object2);
        self
    }

    pub fn with_hash(mut self, hash: i64) -> Self {
        self.hash = hash;
        self
    }

    /// Parse an oplog document fetched from the sync source.
    pub fn from_document(doc: &Document) -> Result<Self> {
        if !doc.is_object() {
            return Err(ReplicationError::InvalidOplogEntry(format!(
                "expected an object, got {}",
                doc
            )));
        }
        if timestamp_of(doc).is_none() {
            return Err(ReplicationError::InvalidOplogEntry(
                "missing or invalid 'ts'".into(),
            ));
        }
        serde_json::from_value(doc.clone())
            .map_err(|e| ReplicationError::InvalidOplogEntry(e.to_string()))
    }

    /// Serialize back to the wire shape.
    pub fn to_document(&self) -> Document {
        serde_json::to_value(self).unwrap_or(Document::Null)
    }

    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    pub fn term(&self) -> i64 {
        self.term
    }

    pub fn op_time(&self) -> OpTime {
        OpTime::new(self.timestamp, self.term)
    }

    pub fn hash(&self) -> i64 {
        self.hash
    }

    pub fn ns(&self) -> &str {
        &self.ns
    }

    /// Database part of the namespace (`db` in `db.coll`).
    pub fn db(&self) -> &str {
        self.ns.split_once('.').map(|(db, _)| db).unwrap_or(&self.ns)
    }

    pub fn op_type(&self) -> OpType {
        self.op_type
    }

    pub fn object(&self) -> Option<&Document> {
        self.object.as_ref()
    }

    pub fn object2(&self) -> Option<&Document> {
        self.object2.as_ref()
    }

    pub fn version(&self) -> i32 {
        self.version
    }

    /// Key identifying the document an update or delete targets.
    ///
    /// Updates carry it in `o2`; deletes and inserts carry the `_id` in `o`.
    pub fn document_key(&self) -> Option<Document> {
        match self.op_type {
            OpType::Update => self.object2.clone(),
            OpType::Delete | OpType::Insert => self
                .object
                .as_ref()
                .and_then(|o| o.get("_id"))
                .map(|id| json!({ "_id": id })),
            OpType::Command | OpType::Noop => None,
        }
    }

    /// Rough in-memory footprint, used for buffer accounting.
    pub fn approximate_size(&self) -> usize {
        const FIXED: usize = 64;
        let docs = [&self.object, &self.object2]
            .into_iter()
            .flatten()
            .map(|d| serde_json::to_string(d).map(|s| s.len()).unwrap_or(0))
            .sum::<usize>();
        FIXED + self.ns.len() + docs
    }
}

/// Split `db.coll` into its parts.
pub fn split_namespace(ns: &str) -> Option<(&str, &str)> {
    ns.split_once('.').filter(|(db, coll)| !db.is_empty() && !coll.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_ordering() {
        assert!(Timestamp::new(1, 5) < Timestamp::new(2, 0));
        assert!(Timestamp::new(2, 1) < Timestamp::new(2, 2));
        assert!(Timestamp::null() < Timestamp::new(0, 1));
        assert!(Timestamp::null().is_null());
        assert_eq!(Timestamp::new(456, 0).to_string(), "Timestamp(456, 0)");
    }

    #[test]
    fn test_optime_orders_by_timestamp_first() {
        let a = OpTime::new(Timestamp::new(2, 0), 1);
        let b = OpTime::new(Timestamp::new(1, 0), 9);
        assert!(b < a);
        assert!(OpTime::null() < b);
    }

    #[test]
    fn test_timestamp_of() {
        let doc = json!({"ts": {"t": 123, "i": 4}, "op": "n"});
        assert_eq!(timestamp_of(&doc), Some(Timestamp::new(123, 4)));
        assert_eq!(timestamp_of(&json!({})), None);
        assert_eq!(timestamp_of(&json!({"ts": "yesterday"})), None);
    }

    #[test]
    fn test_parse_insert() {
        let doc = json!({
            "ts": {"t": 1, "i": 1}, "t": 3, "h": 42, "v": 2,
            "op": "i", "ns": "a.a", "o": {"_id": 1, "a": 1}
        });
        let record = OplogRecord::from_document(&doc).unwrap();
        assert_eq!(record.timestamp(), Timestamp::new(1, 1));
        assert_eq!(record.term(), 3);
        assert_eq!(record.hash(), 42);
        assert_eq!(record.op_type(), OpType::Insert);
        assert_eq!(record.ns(), "a.a");
        assert_eq!(record.db(), "a");
        assert_eq!(record.document_key(), Some(json!({"_id": 1})));
    }

    #[test]
    fn test_parse_update_uses_o2_key() {
        let doc = json!({
            "ts": {"t": 3, "i": 1}, "op": "u", "ns": "a.a",
            "o": {"$set": {"a": 1}}, "o2": {"_id": 1}
        });
        let record = OplogRecord::from_document(&doc).unwrap();
        assert_eq!(record.term(), UNINITIALIZED_TERM);
        assert_eq!(record.version(), 2);
        assert_eq!(record.document_key(), Some(json!({"_id": 1})));
    }

    #[test]
    fn test_parse_rejects_bad_entries() {
        let missing_ts = json!({"op": "n", "ns": ""});
        assert!(matches!(
            OplogRecord::from_document(&missing_ts),
            Err(ReplicationError::InvalidOplogEntry(_))
        ));

        let bad_op = json!({"ts": {"t": 1, "i": 1}, "op": "x"});
        assert!(OplogRecord::from_document(&bad_op).is_err());

        assert!(OplogRecord::from_document(&json!([1, 2])).is_err());
    }

    #[test]
    fn test_document_round_trip_keeps_fields() {
        let record = OplogRecord::new(Timestamp::new(9, 2), 1, "db.c", OpType::Update)
            .with_object(json!({"$set": {"x": 2}}))
            .with_object2(json!({"_id": "k"}))
            .with_hash(7);
        let parsed = OplogRecord::from_document(&record.to_document()).unwrap();
        assert_eq!(parsed, record);
    }

    #[test]
    fn test_approximate_size_grows_with_payload() {
        let small = OplogRecord::new(Timestamp::new(1, 1), 1, "a.b", OpType::Noop);
        let large = small.clone().with_object(json!({"payload": "x".repeat(1000)}));
        assert!(large.approximate_size() > small.approximate_size() + 1000);
    }

    #[test]
    fn test_optime_from_document() {
        let doc = json!({"ts": {"t": 5, "i": 0}, "t": 2});
        assert_eq!(
            OpTime::from_document(&doc).unwrap(),
            OpTime::new(Timestamp::new(5, 0), 2)
        );
        assert!(OpTime::from_document(&json!({"t": 2})).is_err());
    }

    #[test]
    fn test_split_namespace() {
        assert_eq!(split_namespace("a.b.c"), Some(("a", "b.c")));
        assert_eq!(split_namespace("nodot"), None);
        assert_eq!(split_namespace(".x"), None);
    }
}
