//! Core data model: events, timestamps, targets, state rows

pub mod event;
pub mod state;
pub mod target;
pub mod temporal;

pub use event::{ChangeEvent, EventOp};
pub use state::{EntityState, RelationshipState};
pub use target::TargetRef;
pub use temporal::Timestamp;
