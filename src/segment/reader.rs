//! Segment decoder: footer-first range reads with column projection

use crate::error::{Error, Result};
use crate::segment::format::{
    decode_page, ColumnValue, Footer, FORMAT_VERSION, MAGIC, TAIL_LEN,
};
use crate::store::ObjectStore;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Reader over one segment file in an object store.
///
/// Opening fetches only the trailing footer region via range reads;
/// row groups are materialized on demand, column by column. The
/// `bytes_read` counter reports every payload byte fetched, which the
/// observation bus samples for pruning verification.
pub struct SegmentFileReader {
    store: Arc<dyn ObjectStore>,
    path: String,
    footer: Footer,
    bytes_read: AtomicU64,
}

impl std::fmt::Debug for SegmentFileReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentFileReader")
            .field("path", &self.path)
            .field("footer", &self.footer)
            .field("bytes_read", &self.bytes_read)
            .finish()
    }
}

impl SegmentFileReader {
    pub async fn open(store: Arc<dyn ObjectStore>, path: &str) -> Result<Self> {
        let size = store.stat(path).await?.size;
        let min_len = MAGIC.len() as u64 + TAIL_LEN;
        if size < min_len {
            return Err(Error::corrupt(path, format!("file too short: {size} bytes")));
        }

        let mut bytes_read = 0u64;

        let tail = store.read_range(path, size - TAIL_LEN, size).await?;
        bytes_read += tail.len() as u64;
        if &tail[8..12] != MAGIC {
            return Err(Error::corrupt(path, "bad trailing magic"));
        }
        let footer_len = u32::from_le_bytes([tail[0], tail[1], tail[2], tail[3]]) as u64;
        let footer_crc = u32::from_le_bytes([tail[4], tail[5], tail[6], tail[7]]);

        let footer_end = size - TAIL_LEN;
        if footer_len > footer_end - MAGIC.len() as u64 {
            return Err(Error::corrupt(path, "footer length out of bounds"));
        }
        let footer_bytes = store
            .read_range(path, footer_end - footer_len, footer_end)
            .await?;
        bytes_read += footer_bytes.len() as u64;

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&footer_bytes);
        if hasher.finalize() != footer_crc {
            return Err(Error::corrupt(path, "footer checksum mismatch"));
        }

        let footer: Footer = bincode::deserialize(&footer_bytes)
            .map_err(|e| Error::corrupt(path, format!("footer decode: {e}")))?;
        if footer.version != FORMAT_VERSION {
            return Err(Error::corrupt(
                path,
                format!("unknown format version {}", footer.version),
            ));
        }
        if footer
            .row_groups
            .iter()
            .any(|g| g.columns.len() != footer.schema.len())
        {
            return Err(Error::corrupt(
                path,
                "row group directory does not match schema arity",
            ));
        }

        let head = store.read_range(path, 0, MAGIC.len() as u64).await?;
        bytes_read += head.len() as u64;
        if head.as_ref() != MAGIC {
            return Err(Error::corrupt(path, "bad leading magic"));
        }

        Ok(Self {
            store,
            path: path.to_string(),
            footer,
            bytes_read: AtomicU64::new(bytes_read),
        })
    }

    pub fn footer(&self) -> &Footer {
        &self.footer
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Total payload bytes fetched from the store so far.
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read.load(Ordering::Relaxed)
    }

    fn with_path(&self, e: Error) -> Error {
        match e {
            Error::CorruptSegment { reason, .. } => Error::corrupt(self.path.clone(), reason),
            other => other,
        }
    }

    /// Materialize the requested columns of one row group.
    ///
    /// Returns full-arity rows in stored order; cells of columns
    /// outside the projection are `Null`. A projection naming a column
    /// absent from the schema fails with `CorruptSegment`.
    pub async fn read_row_group(
        &self,
        row_group_index: usize,
        projection: Option<&[&str]>,
    ) -> Result<Vec<Vec<ColumnValue>>> {
        let group = self
            .footer
            .row_groups
            .get(row_group_index)
            .ok_or_else(|| {
                Error::Unsupported(format!(
                    "row group {row_group_index} out of range for {}",
                    self.path
                ))
            })?;

        let column_indices: Vec<usize> = match projection {
            Some(names) => {
                let mut indices = Vec::with_capacity(names.len());
                for name in names {
                    let idx = self.footer.column_index(name).ok_or_else(|| {
                        Error::corrupt(
                            self.path.clone(),
                            format!("projected column {name} not in schema"),
                        )
                    })?;
                    indices.push(idx);
                }
                indices
            }
            None => (0..self.footer.schema.len()).collect(),
        };

        let row_count = group.row_count as usize;
        let mut rows = vec![vec![ColumnValue::Null; self.footer.schema.len()]; row_count];

        for col_idx in column_indices {
            let chunk = &group.columns[col_idx];
            let compressed = self
                .store
                .read_range(&self.path, chunk.offset, chunk.offset + chunk.compressed_len)
                .await?;
            self.bytes_read
                .fetch_add(compressed.len() as u64, Ordering::Relaxed);

            let mut hasher = crc32fast::Hasher::new();
            hasher.update(&compressed);
            if hasher.finalize() != chunk.crc {
                return Err(Error::corrupt(
                    self.path.clone(),
                    format!("column chunk checksum mismatch at offset {}", chunk.offset),
                ));
            }

            let page = chunk
                .codec
                .decompress(&compressed, chunk.uncompressed_len as usize)
                .map_err(|e| self.with_path(e))?;
            let values = decode_page(&page, self.footer.schema[col_idx].ty)
                .map_err(|e| self.with_path(e))?;
            if values.len() != row_count {
                return Err(Error::corrupt(
                    self.path.clone(),
                    format!(
                        "row group {row_group_index} column {col_idx}: expected {row_count} rows, got {}",
                        values.len()
                    ),
                ));
            }
            for (row, value) in rows.iter_mut().zip(values) {
                row[col_idx] = value;
            }
        }

        Ok(rows)
    }
}
