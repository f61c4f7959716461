//! Materialized state rows produced by the collector

use crate::core::event::FieldMap;
use crate::core::temporal::Timestamp;
use serde::{Deserialize, Serialize};

/// Latest known state of a single entity.
///
/// A row with `exists = false` is a tombstone: the slot is retained so
/// that out-of-order replays of older UPDATEs cannot resurrect the
/// entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityState {
    pub target: String,
    pub ns: String,
    pub id: String,
    pub state: Option<FieldMap>,
    pub exists: bool,
    pub last_event_ts: Timestamp,
    pub last_event_seq: u64,
}

/// Latest known state of a single relationship tuple.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationshipState {
    pub target: String,
    pub from: String,
    pub predicate: String,
    pub to: String,
    pub data: Option<FieldMap>,
    pub exists: bool,
    pub last_event_ts: Timestamp,
    pub last_event_seq: u64,
}

impl EntityState {
    /// The `(ts, seq)` key of the event that last wrote this slot.
    pub fn order_key(&self) -> (Timestamp, u64) {
        (self.last_event_ts, self.last_event_seq)
    }
}

impl RelationshipState {
    pub fn order_key(&self) -> (Timestamp, u64) {
        (self.last_event_ts, self.last_event_seq)
    }
}
