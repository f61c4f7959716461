//! Strata-DB: event-sourced document storage over columnar segments
//!
//! An embeddable storage core whose on-disk representation is an
//! append-only log of change events plus periodically derived
//! materialized state, both persisted as columnar row-group files in a
//! pluggable object store.
//!
//! # Core Concepts
//!
//! - **Events**: immutable change records ordered by `(ts, seq)`
//! - **Segments**: immutable columnar files described by a manifest
//! - **Manifest**: versioned index with conditional-write publication
//! - **Compaction**: folding a log prefix into entity/relationship
//!   state snapshots behind a watermark
//!
//! # Example
//!
//! ```no_run
//! use strata_db::prelude::*;
//!
//! # async fn example() -> strata_db::error::Result<()> {
//! let db = EventStore::in_memory("app").await?;
//!
//! let event = ChangeEvent::new(EventOp::Create, "user:1", Timestamp::now());
//! db.publish(vec![event]).await?;
//!
//! let events = db.scan(ScanRange::all(), None, None).await?;
//! # Ok(())
//! # }
//! ```

pub mod collector;
pub mod compactor;
pub mod config;
pub mod core;
pub mod error;
pub mod log;
pub mod manifest;
pub mod observe;
pub mod segment;
pub mod store;

/// Main store facade
pub mod db;

/// Prelude module for common imports
pub mod prelude {
    pub use crate::collector::StateCollector;
    pub use crate::compactor::{CompactionOptions, CompactionSummary};
    pub use crate::config::StoreConfig;
    pub use crate::core::{ChangeEvent, EntityState, EventOp, RelationshipState, Timestamp};
    pub use crate::db::EventStore;
    pub use crate::error::{Error, Result};
    pub use crate::log::{ScanPredicate, ScanRange};
    pub use crate::observe::{Notification, StoreObserver};
    pub use crate::store::{LocalStore, MemoryStore, ObjectStore};
}
