//! Change events: the atomic unit of the log

use crate::core::temporal::Timestamp;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use uuid::Uuid;

/// Opaque field map carried in pre/post-images, actor, and metadata.
pub type FieldMap = Map<String, Value>;

/// Operation kind of a change event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventOp {
    Create,
    Update,
    Delete,
}

impl EventOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventOp::Create => "create",
            EventOp::Update => "update",
            EventOp::Delete => "delete",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "create" => Some(EventOp::Create),
            "update" => Some(EventOp::Update),
            "delete" => Some(EventOp::Delete),
            _ => None,
        }
    }
}

impl fmt::Display for EventOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A change event.
///
/// `seq` is zero until the event is published; the manifest assigns a
/// dense sequence number at publish time and the event is immutable
/// thereafter. `(ts, seq)` is a strict total order over the log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Globally unique opaque id, generated by the writer
    pub id: String,
    /// Logical timestamp, milliseconds since the epoch
    pub ts: Timestamp,
    /// Dense sequence number assigned at publish time
    pub seq: u64,
    /// Operation kind
    pub op: EventOp,
    /// Canonical target identifier (`ns:id` or `ns:id:predicate:ns:id`)
    pub target: String,
    /// Pre-image; required for UPDATE and DELETE to support reverse replay
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before: Option<FieldMap>,
    /// Post-image; required for CREATE and UPDATE, absent for DELETE
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<FieldMap>,
    /// Optional actor descriptor
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor: Option<FieldMap>,
    /// Optional opaque metadata
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<FieldMap>,
}

impl ChangeEvent {
    /// Create a new unpublished event with a generated id.
    pub fn new(op: EventOp, target: impl Into<String>, ts: Timestamp) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            ts,
            seq: 0,
            op,
            target: target.into(),
            before: None,
            after: None,
            actor: None,
            metadata: None,
        }
    }

    /// Builder-style post-image
    pub fn with_after(mut self, after: FieldMap) -> Self {
        self.after = Some(after);
        self
    }

    /// Builder-style pre-image
    pub fn with_before(mut self, before: FieldMap) -> Self {
        self.before = Some(before);
        self
    }

    /// Builder-style actor
    pub fn with_actor(mut self, actor: FieldMap) -> Self {
        self.actor = Some(actor);
        self
    }

    /// Builder-style metadata
    pub fn with_metadata(mut self, metadata: FieldMap) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// The `(ts, seq)` ordering key
    pub fn order_key(&self) -> (Timestamp, u64) {
        (self.ts, self.seq)
    }
}
