//! Segment encoder: batches of rows to columnar file bytes

use crate::error::{Error, Result};
use crate::segment::format::{
    compute_stats, encode_page, ColumnChunkMeta, ColumnValue, Compression, Footer, RowGroupMeta,
    Schema, FORMAT_VERSION, MAGIC,
};
use bytes::{BufMut, Bytes, BytesMut};

/// Finished segment bytes plus the footer that describes them.
#[derive(Debug, Clone)]
pub struct EncodedSegment {
    pub bytes: Bytes,
    pub footer: Footer,
}

impl EncodedSegment {
    pub fn size_bytes(&self) -> u64 {
        self.bytes.len() as u64
    }

    pub fn row_count(&self) -> u64 {
        self.footer.total_rows
    }
}

/// Buffers rows and encodes them into row groups on `finish`.
///
/// Rows are split into groups of at most `target_rows`; decoding
/// preserves row order exactly.
pub struct SegmentEncoder {
    schema: Schema,
    codec: Compression,
    target_rows: usize,
    rows: Vec<Vec<ColumnValue>>,
}

impl SegmentEncoder {
    pub fn new(schema: Schema, codec: Compression, target_rows: usize) -> Self {
        Self {
            schema,
            codec,
            target_rows: target_rows.max(1),
            rows: Vec::new(),
        }
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// Append one row; arity must match the schema.
    pub fn push_row(&mut self, row: Vec<ColumnValue>) -> Result<()> {
        if row.len() != self.schema.len() {
            return Err(Error::Serialization(format!(
                "row has {} values, schema has {} columns",
                row.len(),
                self.schema.len()
            )));
        }
        self.rows.push(row);
        Ok(())
    }

    /// Encode all buffered rows into a complete segment file.
    pub fn finish(self) -> Result<EncodedSegment> {
        let mut buf = BytesMut::new();
        buf.put_slice(MAGIC);

        let mut row_groups = Vec::new();
        for group in self.rows.chunks(self.target_rows) {
            let mut columns = Vec::with_capacity(self.schema.len());
            for (col_idx, def) in self.schema.iter().enumerate() {
                let values: Vec<ColumnValue> =
                    group.iter().map(|row| row[col_idx].clone()).collect();
                let stats = compute_stats(&values);
                let page = encode_page(&values, def.ty)?;
                let compressed = self.codec.compress(&page)?;

                let mut hasher = crc32fast::Hasher::new();
                hasher.update(&compressed);

                columns.push(ColumnChunkMeta {
                    offset: buf.len() as u64,
                    compressed_len: compressed.len() as u64,
                    uncompressed_len: page.len() as u64,
                    codec: self.codec,
                    crc: hasher.finalize(),
                    stats,
                });
                buf.put_slice(&compressed);
            }
            row_groups.push(RowGroupMeta {
                row_count: group.len() as u64,
                columns,
            });
        }

        let footer = Footer {
            version: FORMAT_VERSION,
            schema: self.schema,
            row_groups,
            total_rows: self.rows.len() as u64,
        };

        let footer_bytes = bincode::serialize(&footer)?;
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&footer_bytes);

        buf.put_slice(&footer_bytes);
        buf.put_u32_le(footer_bytes.len() as u32);
        buf.put_u32_le(hasher.finalize());
        buf.put_slice(MAGIC);

        Ok(EncodedSegment {
            bytes: buf.freeze(),
            footer,
        })
    }
}
