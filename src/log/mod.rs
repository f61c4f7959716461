//! Event log: segment writer and reader over the manifest

pub mod predicate;
pub mod reader;
pub mod writer;

pub use predicate::{ColumnBound, ScanPredicate};
pub use reader::{EventReader, ScanRange};
pub use writer::{EventWriter, PublishReceipt};
