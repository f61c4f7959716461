//! On-disk layout of a columnar segment.
//!
//! ```text
//! +--------+----------------------+---------+------------+------------+--------+
//! | magic  | row group chunks ... | footer  | footer_len | footer_crc | magic  |
//! | 4 B    |                      | bincode | u32 LE     | u32 LE     | 4 B    |
//! +--------+----------------------+---------+------------+------------+--------+
//! ```
//!
//! Each row group stores one chunk per column; every chunk records its
//! absolute offset, codec, crc and per-column statistics in the footer,
//! so readers can locate and prune chunks from the footer alone.
//! Writers may leave padding between the last chunk and the footer;
//! readers never assume the chunks are contiguous with it.

use crate::error::{Error, Result};
use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io::{Read, Write};

/// Magic bytes at both ends of a segment file
pub const MAGIC: &[u8; 4] = b"STR1";

/// Current format version, recorded in the footer
pub const FORMAT_VERSION: u32 = 1;

/// Fixed-size tail: footer_len + footer_crc + trailing magic
pub const TAIL_LEN: u64 = 12;

/// Per-chunk compression codec.
///
/// `Snappy` is a reserved identifier for interoperability; this build
/// fails with `Unsupported` when asked to encode or decode it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    #[default]
    None,
    Snappy,
    Lz4,
    Gzip,
    Zstd,
}

impl Compression {
    pub fn compress(&self, raw: &[u8]) -> Result<Vec<u8>> {
        match self {
            Compression::None => Ok(raw.to_vec()),
            Compression::Snappy => Err(Error::Unsupported(
                "snappy codec is reserved but not available".to_string(),
            )),
            Compression::Lz4 => Ok(lz4_flex::compress_prepend_size(raw)),
            Compression::Gzip => {
                let mut encoder =
                    flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
                encoder.write_all(raw)?;
                Ok(encoder.finish()?)
            }
            Compression::Zstd => zstd::encode_all(raw, 3)
                .map_err(|e| Error::Serialization(format!("zstd encode: {e}"))),
        }
    }

    pub fn decompress(&self, compressed: &[u8], uncompressed_len: usize) -> Result<Vec<u8>> {
        let out = match self {
            Compression::None => compressed.to_vec(),
            Compression::Snappy => {
                return Err(Error::Unsupported(
                    "snappy codec is reserved but not available".to_string(),
                ))
            }
            Compression::Lz4 => lz4_flex::decompress_size_prepended(compressed)
                .map_err(|e| Error::corrupt("", format!("lz4 decode: {e}")))?,
            Compression::Gzip => {
                let mut decoder = flate2::read::GzDecoder::new(compressed);
                let mut out = Vec::with_capacity(uncompressed_len);
                decoder
                    .read_to_end(&mut out)
                    .map_err(|e| Error::corrupt("", format!("gzip decode: {e}")))?;
                out
            }
            Compression::Zstd => zstd::decode_all(compressed)
                .map_err(|e| Error::corrupt("", format!("zstd decode: {e}")))?,
        };
        if out.len() != uncompressed_len {
            return Err(Error::corrupt(
                "",
                format!(
                    "decompressed length mismatch: expected {uncompressed_len}, got {}",
                    out.len()
                ),
            ));
        }
        Ok(out)
    }
}

/// Logical type of a column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogicalType {
    Int64,
    Bool,
    Utf8,
    /// Opaque JSON document; carries no min/max statistics
    Json,
}

/// Column descriptor in the schema
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    pub ty: LogicalType,
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, ty: LogicalType) -> Self {
        Self {
            name: name.into(),
            ty,
        }
    }
}

/// Ordered column list of a segment file
pub type Schema = Vec<ColumnDef>;

/// Statistics scalar; comparisons are only meaningful within a variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Scalar {
    Int(i64),
    Bool(bool),
    Str(String),
}

impl Scalar {
    /// Ordering between scalars of the same variant.
    pub fn cmp_same(&self, other: &Scalar) -> Option<std::cmp::Ordering> {
        match (self, other) {
            (Scalar::Int(a), Scalar::Int(b)) => Some(a.cmp(b)),
            (Scalar::Bool(a), Scalar::Bool(b)) => Some(a.cmp(b)),
            (Scalar::Str(a), Scalar::Str(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }
}

/// A single cell value
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnValue {
    Null,
    Int(i64),
    Bool(bool),
    Str(String),
    Json(Value),
}

impl ColumnValue {
    pub fn is_null(&self) -> bool {
        matches!(self, ColumnValue::Null)
    }

    /// Statistics scalar for this value; `Json` values carry none.
    pub fn scalar(&self) -> Option<Scalar> {
        match self {
            ColumnValue::Int(v) => Some(Scalar::Int(*v)),
            ColumnValue::Bool(v) => Some(Scalar::Bool(*v)),
            ColumnValue::Str(v) => Some(Scalar::Str(v.clone())),
            ColumnValue::Null | ColumnValue::Json(_) => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            ColumnValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ColumnValue::Str(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ColumnValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn into_json(self) -> Option<Value> {
        match self {
            ColumnValue::Json(v) => Some(v),
            _ => None,
        }
    }
}

/// Per-column per-row-group statistics used for pruning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnStats {
    pub min: Option<Scalar>,
    pub max: Option<Scalar>,
    pub null_count: u64,
    pub row_count: u64,
}

impl ColumnStats {
    pub fn all_null(&self) -> bool {
        self.row_count > 0 && self.null_count == self.row_count
    }
}

/// Footer entry for one column chunk
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnChunkMeta {
    /// Absolute byte offset of the compressed page
    pub offset: u64,
    pub compressed_len: u64,
    pub uncompressed_len: u64,
    pub codec: Compression,
    /// CRC32 of the compressed page bytes
    pub crc: u32,
    pub stats: ColumnStats,
}

/// Footer entry for one row group
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowGroupMeta {
    pub row_count: u64,
    /// One chunk per schema column, in schema order
    pub columns: Vec<ColumnChunkMeta>,
}

/// Trailing footer: schema, row-group directory, file-level stats
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Footer {
    pub version: u32,
    pub schema: Schema,
    pub row_groups: Vec<RowGroupMeta>,
    pub total_rows: u64,
}

impl Footer {
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.schema.iter().position(|c| c.name == name)
    }
}

/// Encode one column page (uncompressed payload).
///
/// Layout: `row_count u32 | presence u8 per row | packed values`,
/// where Int64 is 8 bytes LE, Bool one byte, and Utf8/Json are u32
/// length-prefixed byte strings.
pub fn encode_page(values: &[ColumnValue], ty: LogicalType) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(values.len() * 8 + values.len() + 4);
    buf.put_u32_le(values.len() as u32);
    for v in values {
        buf.put_u8(u8::from(!v.is_null()));
    }
    for v in values {
        match (v, ty) {
            (ColumnValue::Null, _) => {}
            (ColumnValue::Int(i), LogicalType::Int64) => buf.put_i64_le(*i),
            (ColumnValue::Bool(b), LogicalType::Bool) => buf.put_u8(u8::from(*b)),
            (ColumnValue::Str(s), LogicalType::Utf8) => {
                buf.put_u32_le(s.len() as u32);
                buf.put_slice(s.as_bytes());
            }
            (ColumnValue::Json(j), LogicalType::Json) => {
                let bytes = serde_json::to_vec(j)?;
                buf.put_u32_le(bytes.len() as u32);
                buf.put_slice(&bytes);
            }
            (other, ty) => {
                return Err(Error::Serialization(format!(
                    "value {other:?} does not match column type {ty:?}"
                )))
            }
        }
    }
    Ok(buf)
}

/// Decode one column page, inverse of [`encode_page`].
pub fn decode_page(mut buf: &[u8], ty: LogicalType) -> Result<Vec<ColumnValue>> {
    if buf.len() < 4 {
        return Err(Error::corrupt("", "page shorter than header"));
    }
    let row_count = buf.get_u32_le() as usize;
    if buf.len() < row_count {
        return Err(Error::corrupt("", "page presence bytes truncated"));
    }
    let presence: Vec<bool> = (0..row_count).map(|_| buf.get_u8() != 0).collect();

    let mut values = Vec::with_capacity(row_count);
    for present in presence {
        if !present {
            values.push(ColumnValue::Null);
            continue;
        }
        let value = match ty {
            LogicalType::Int64 => {
                if buf.len() < 8 {
                    return Err(Error::corrupt("", "int64 page truncated"));
                }
                ColumnValue::Int(buf.get_i64_le())
            }
            LogicalType::Bool => {
                if buf.is_empty() {
                    return Err(Error::corrupt("", "bool page truncated"));
                }
                ColumnValue::Bool(buf.get_u8() != 0)
            }
            LogicalType::Utf8 | LogicalType::Json => {
                if buf.len() < 4 {
                    return Err(Error::corrupt("", "string page truncated"));
                }
                let len = buf.get_u32_le() as usize;
                if buf.len() < len {
                    return Err(Error::corrupt("", "string page truncated"));
                }
                let bytes = &buf[..len];
                buf.advance(len);
                match ty {
                    LogicalType::Utf8 => ColumnValue::Str(
                        std::str::from_utf8(bytes)
                            .map_err(|e| Error::corrupt("", format!("invalid utf8: {e}")))?
                            .to_string(),
                    ),
                    _ => ColumnValue::Json(
                        serde_json::from_slice(bytes)
                            .map_err(|e| Error::corrupt("", format!("invalid json: {e}")))?,
                    ),
                }
            }
        };
        values.push(value);
    }
    Ok(values)
}

/// Compute per-column statistics for one page of values.
pub fn compute_stats(values: &[ColumnValue]) -> ColumnStats {
    let mut min: Option<Scalar> = None;
    let mut max: Option<Scalar> = None;
    let mut null_count = 0u64;
    for v in values {
        match v.scalar() {
            Some(s) => {
                let lower = match &min {
                    Some(m) => s.cmp_same(m) == Some(std::cmp::Ordering::Less),
                    None => true,
                };
                if lower {
                    min = Some(s.clone());
                }
                let higher = match &max {
                    Some(m) => s.cmp_same(m) == Some(std::cmp::Ordering::Greater),
                    None => true,
                };
                if higher {
                    max = Some(s);
                }
            }
            None => {
                if v.is_null() {
                    null_count += 1;
                }
            }
        }
    }
    ColumnStats {
        min,
        max,
        null_count,
        row_count: values.len() as u64,
    }
}
