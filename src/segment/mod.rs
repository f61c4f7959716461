//! Columnar segment codec: self-describing row-group files

pub mod format;
pub mod reader;
pub mod rows;
pub mod writer;

pub use format::{
    ColumnDef, ColumnStats, ColumnValue, Compression, Footer, LogicalType, RowGroupMeta, Scalar,
    Schema,
};
pub use reader::SegmentFileReader;
pub use writer::{EncodedSegment, SegmentEncoder};
