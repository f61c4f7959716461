//! Store configuration

use crate::error::{Error, Result};
use crate::segment::format::Compression;
use serde::{Deserialize, Serialize};

/// Thresholds that make [`needs_compaction`](crate::compactor) fire.
/// Any one trigger is sufficient.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompactionPolicy {
    /// Live event count that triggers compaction
    #[serde(default = "CompactionPolicy::default_min_events")]
    pub min_events: u64,
    /// Live event-segment bytes that trigger compaction
    #[serde(default = "CompactionPolicy::default_min_bytes")]
    pub min_bytes: u64,
    /// Age of the oldest live segment that triggers compaction
    #[serde(default = "CompactionPolicy::default_max_segment_age_ms")]
    pub max_segment_age_ms: i64,
}

impl CompactionPolicy {
    fn default_min_events() -> u64 {
        50_000
    }
    fn default_min_bytes() -> u64 {
        64 * 1024 * 1024
    }
    fn default_max_segment_age_ms() -> i64 {
        24 * 60 * 60 * 1000
    }
}

impl Default for CompactionPolicy {
    fn default() -> Self {
        Self {
            min_events: Self::default_min_events(),
            min_bytes: Self::default_min_bytes(),
            max_segment_age_ms: Self::default_max_segment_age_ms(),
        }
    }
}

/// Soft caps that make the writer close one segment and open the next.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentPolicy {
    #[serde(default = "SegmentPolicy::default_target_rows")]
    pub target_rows: usize,
    #[serde(default = "SegmentPolicy::default_target_bytes")]
    pub target_bytes: usize,
    /// Rows per row group inside a segment
    #[serde(default = "SegmentPolicy::default_row_group_rows")]
    pub row_group_rows: usize,
}

impl SegmentPolicy {
    fn default_target_rows() -> usize {
        100_000
    }
    fn default_target_bytes() -> usize {
        32 * 1024 * 1024
    }
    fn default_row_group_rows() -> usize {
        10_000
    }
}

impl Default for SegmentPolicy {
    fn default() -> Self {
        Self {
            target_rows: Self::default_target_rows(),
            target_bytes: Self::default_target_bytes(),
            row_group_rows: Self::default_row_group_rows(),
        }
    }
}

/// Reader-side knobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReaderPolicy {
    /// Row groups fetched in parallel per segment; must be at least 1
    #[serde(default = "ReaderPolicy::default_row_group_parallelism")]
    pub row_group_parallelism: usize,
}

impl ReaderPolicy {
    fn default_row_group_parallelism() -> usize {
        4
    }
}

impl Default for ReaderPolicy {
    fn default() -> Self {
        Self {
            row_group_parallelism: Self::default_row_group_parallelism(),
        }
    }
}

/// Bounded exponential backoff for manifest conflict retries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "RetryPolicy::default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "RetryPolicy::default_base_backoff_ms")]
    pub base_backoff_ms: u64,
}

impl RetryPolicy {
    fn default_max_retries() -> u32 {
        5
    }
    fn default_base_backoff_ms() -> u64 {
        20
    }

    /// Backoff before retry `attempt` (zero-based), capped at ~2s.
    pub fn backoff(&self, attempt: u32) -> std::time::Duration {
        let ms = self
            .base_backoff_ms
            .saturating_mul(1u64 << attempt.min(16))
            .min(2_000);
        std::time::Duration::from_millis(ms)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: Self::default_max_retries(),
            base_backoff_ms: Self::default_base_backoff_ms(),
        }
    }
}

/// Top-level configuration for one dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Logical dataset name, used as the object-key prefix
    pub dataset: String,
    #[serde(default)]
    pub default_compression: Compression,
    #[serde(default)]
    pub compaction: CompactionPolicy,
    #[serde(default)]
    pub segment: SegmentPolicy,
    #[serde(default)]
    pub reader: ReaderPolicy,
    #[serde(default)]
    pub retry: RetryPolicy,
}

impl StoreConfig {
    pub fn new(dataset: impl Into<String>) -> Self {
        Self {
            dataset: dataset.into(),
            default_compression: Compression::default(),
            compaction: CompactionPolicy::default(),
            segment: SegmentPolicy::default(),
            reader: ReaderPolicy::default(),
            retry: RetryPolicy::default(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.dataset.is_empty() {
            return Err(Error::Config("dataset must not be empty".to_string()));
        }
        if self.dataset.contains('/') {
            return Err(Error::Config(
                "dataset must not contain '/' (it is a key prefix)".to_string(),
            ));
        }
        if self.reader.row_group_parallelism < 1 {
            return Err(Error::Config(
                "reader.row_group_parallelism must be >= 1".to_string(),
            ));
        }
        if self.segment.target_rows == 0 || self.segment.row_group_rows == 0 {
            return Err(Error::Config(
                "segment.target_rows and segment.row_group_rows must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = StoreConfig::new("ds");
        assert_eq!(config.default_compression, Compression::None);
        assert_eq!(config.reader.row_group_parallelism, 4);
        config.validate().unwrap();
    }

    #[test]
    fn test_deserialize_partial() {
        let config: StoreConfig = serde_json::from_str(
            r#"{"dataset": "ds", "default_compression": "zstd", "compaction": {"min_events": 10}}"#,
        )
        .unwrap();
        assert_eq!(config.default_compression, Compression::Zstd);
        assert_eq!(config.compaction.min_events, 10);
        // Unspecified knobs keep their defaults.
        assert_eq!(config.compaction.min_bytes, 64 * 1024 * 1024);
        assert_eq!(config.segment.target_rows, 100_000);
    }

    #[test]
    fn test_validation() {
        assert!(StoreConfig::new("").validate().is_err());
        assert!(StoreConfig::new("a/b").validate().is_err());

        let mut config = StoreConfig::new("ds");
        config.reader.row_group_parallelism = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_backoff_growth_capped() {
        let retry = RetryPolicy::default();
        assert!(retry.backoff(0) < retry.backoff(3));
        assert!(retry.backoff(30).as_millis() <= 2_000);
    }
}
