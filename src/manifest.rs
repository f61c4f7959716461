//! Manifest: authoritative, versioned index of live segments.
//!
//! The manifest is stored as UTF-8 JSON under a fixed key and mutated
//! copy-on-write: every save writes a whole new byte sequence through a
//! conditional put keyed on the etag cached at load time. Within a
//! process the [`ManifestManager`] is the single serialization point;
//! across processes the conditional write provides multi-writer
//! safety.

use crate::core::temporal::Timestamp;
use crate::error::{Error, Result};
use crate::store::ObjectStore;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Manifest schema version
pub const MANIFEST_VERSION: u32 = 1;

pub fn manifest_key(dataset: &str) -> String {
    format!("{dataset}/events/_manifest.json")
}

pub fn event_segment_key(dataset: &str, segment_seq: u64) -> String {
    format!("{dataset}/events/seg-{segment_seq:010}.parquet")
}

pub fn snapshot_entities_key(dataset: &str, through: Timestamp) -> String {
    format!("{dataset}/snapshots/{}/entities.parquet", through.as_millis())
}

pub fn snapshot_relationships_key(dataset: &str, through: Timestamp) -> String {
    format!("{dataset}/snapshots/{}/rels.parquet", through.as_millis())
}

/// Descriptor of one live segment.
///
/// `min_seq`/`max_seq` are present for event segments only. Unknown
/// JSON keys are preserved across load/save for forward compatibility.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentMeta {
    pub seq: u64,
    pub path: String,
    pub min_ts: Timestamp,
    pub max_ts: Timestamp,
    pub min_seq: Option<u64>,
    pub max_seq: Option<u64>,
    pub row_count: u64,
    pub size_bytes: u64,
    pub created_at: Timestamp,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl SegmentMeta {
    pub fn is_event_segment(&self) -> bool {
        self.min_seq.is_some()
    }

    /// True when `[min_ts, max_ts]` intersects the inclusive range.
    pub fn overlaps(&self, lo: Option<Timestamp>, hi: Option<Timestamp>) -> bool {
        let after_lo = lo.map_or(true, |lo| self.max_ts >= lo);
        let before_hi = hi.map_or(true, |hi| self.min_ts <= hi);
        after_lo && before_hi
    }
}

/// Versioned index of a dataset's live segments and counters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub version: u32,
    pub dataset: String,
    pub segments: Vec<SegmentMeta>,
    pub next_event_seq: u64,
    pub next_segment_seq: u64,
    pub total_events: u64,
    pub compacted_through: Option<Timestamp>,
    pub updated_at: Timestamp,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Manifest {
    /// Synthesize the manifest of a dataset that has never been written.
    pub fn empty(dataset: impl Into<String>) -> Self {
        Self {
            version: MANIFEST_VERSION,
            dataset: dataset.into(),
            segments: Vec::new(),
            next_event_seq: 1,
            next_segment_seq: 1,
            total_events: 0,
            compacted_through: None,
            updated_at: Timestamp::now(),
            extra: Map::new(),
        }
    }

    /// Segments overlapping the inclusive time range, in manifest order.
    pub fn segments_in_range(
        &self,
        lo: Option<Timestamp>,
        hi: Option<Timestamp>,
    ) -> Vec<&SegmentMeta> {
        self.segments
            .iter()
            .filter(|s| s.overlaps(lo, hi))
            .collect()
    }

    /// Segments containing any row at or after `ts`.
    pub fn segments_after(&self, ts: Timestamp) -> Vec<&SegmentMeta> {
        self.segments_in_range(Some(ts), None)
    }

    /// Segments containing any row at or before `ts`.
    pub fn segments_before(&self, ts: Timestamp) -> Vec<&SegmentMeta> {
        self.segments_in_range(None, Some(ts))
    }

    pub fn segment(&self, seq: u64) -> Option<&SegmentMeta> {
        self.segments.iter().find(|s| s.seq == seq)
    }

    /// Segments wholly covered by the compaction watermark.
    pub fn compactable_segments(&self) -> Vec<&SegmentMeta> {
        match self.compacted_through {
            Some(watermark) => self
                .segments
                .iter()
                .filter(|s| s.max_ts <= watermark)
                .collect(),
            None => Vec::new(),
        }
    }

    /// Sum of `size_bytes` over live event segments.
    pub fn live_bytes(&self) -> u64 {
        self.segments
            .iter()
            .filter(|s| s.is_event_segment())
            .map(|s| s.size_bytes)
            .sum()
    }

    pub fn oldest_segment_created_at(&self) -> Option<Timestamp> {
        self.segments
            .iter()
            .filter(|s| s.is_event_segment())
            .map(|s| s.created_at)
            .min()
    }

    fn insert_segment(&mut self, meta: SegmentMeta) -> Result<()> {
        if self.segment(meta.seq).is_some() {
            return Err(Error::Conflict(format!(
                "segment seq {} already present in manifest",
                meta.seq
            )));
        }
        if meta.min_ts > meta.max_ts {
            return Err(Error::Conflict(format!(
                "segment {} has inverted bounds",
                meta.seq
            )));
        }

        self.next_segment_seq = self.next_segment_seq.max(meta.seq + 1);
        if meta.is_event_segment() {
            self.total_events += meta.row_count;
            if let Some(max_seq) = meta.max_seq {
                self.next_event_seq = self.next_event_seq.max(max_seq + 1);
            }
        }

        // Keep segments ordered by min_ts, ties broken by seq.
        let at = self
            .segments
            .partition_point(|s| (s.min_ts, s.seq) < (meta.min_ts, meta.seq));
        self.segments.insert(at, meta);
        Ok(())
    }

    fn drop_segments(&mut self, seqs: &BTreeSet<u64>) -> Vec<SegmentMeta> {
        let mut removed = Vec::new();
        self.segments.retain(|s| {
            if seqs.contains(&s.seq) {
                removed.push(s.clone());
                false
            } else {
                true
            }
        });
        for meta in &removed {
            if meta.is_event_segment() {
                self.total_events = self.total_events.saturating_sub(meta.row_count);
            }
        }
        removed
    }
}

struct Inner {
    manifest: Manifest,
    etag: Option<String>,
    dirty: bool,
}

/// Owner of the in-memory manifest and its conditional persistence.
pub struct ManifestManager {
    store: Arc<dyn ObjectStore>,
    key: String,
    inner: Mutex<Inner>,
}

impl ManifestManager {
    /// Load the current manifest, synthesizing an empty one when the
    /// key does not exist yet.
    pub async fn load(store: Arc<dyn ObjectStore>, dataset: &str) -> Result<Self> {
        let key = manifest_key(dataset);
        let (manifest, etag) = Self::fetch(&*store, &key, dataset).await?;
        Ok(Self {
            store,
            key,
            inner: Mutex::new(Inner {
                manifest,
                etag,
                dirty: false,
            }),
        })
    }

    async fn fetch(
        store: &dyn ObjectStore,
        key: &str,
        dataset: &str,
    ) -> Result<(Manifest, Option<String>)> {
        // Stat before read: if the object changes in between, the cached
        // etag is stale and the next conditional save fails safe.
        let etag = match store.stat(key).await {
            Ok(stat) => Some(stat.etag),
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(e),
        };
        let manifest = match etag {
            Some(_) => {
                let bytes = store.read_all(key).await?;
                let manifest: Manifest = serde_json::from_slice(&bytes)?;
                if manifest.version != MANIFEST_VERSION {
                    return Err(Error::Unsupported(format!(
                        "manifest version {} (supported: {MANIFEST_VERSION})",
                        manifest.version
                    )));
                }
                manifest
            }
            None => Manifest::empty(dataset),
        };
        Ok((manifest, etag))
    }

    /// Discard local mutations and re-read the stored manifest.
    pub async fn reload(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let dataset = inner.manifest.dataset.clone();
        let (manifest, etag) = Self::fetch(&*self.store, &self.key, &dataset).await?;
        if inner.dirty {
            warn!(dataset = %dataset, "discarding dirty manifest state on reload");
        }
        inner.manifest = manifest;
        inner.etag = etag;
        inner.dirty = false;
        Ok(())
    }

    /// Serialize and conditionally write the manifest.
    ///
    /// On a lost race this reloads the stored manifest (dropping local
    /// mutations) and fails with `ManifestConflict` so the caller can
    /// rebase and retry.
    pub async fn save(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.manifest.updated_at = Timestamp::now();
        let bytes = serde_json::to_vec(&inner.manifest)?;
        let expected = inner.etag.clone();
        match self
            .store
            .write_conditional(&self.key, bytes.into(), expected.as_deref())
            .await
        {
            Ok(stamp) => {
                debug!(
                    dataset = %inner.manifest.dataset,
                    segments = inner.manifest.segments.len(),
                    etag = %stamp.etag,
                    "manifest saved"
                );
                inner.etag = Some(stamp.etag);
                inner.dirty = false;
                Ok(())
            }
            Err(Error::PreconditionFailed(_)) => {
                let dataset = inner.manifest.dataset.clone();
                warn!(dataset = %dataset, "manifest save lost the conditional write race");
                let (manifest, etag) = Self::fetch(&*self.store, &self.key, &dataset).await?;
                inner.manifest = manifest;
                inner.etag = etag;
                inner.dirty = false;
                Err(Error::ManifestConflict)
            }
            Err(e) => Err(e),
        }
    }

    /// No-op when no mutator has run since the last save.
    pub async fn save_if_dirty(&self) -> Result<()> {
        {
            let inner = self.inner.lock().await;
            if !inner.dirty {
                return Ok(());
            }
        }
        self.save().await
    }

    /// Append a segment descriptor and update aggregates.
    pub async fn add_segment(&self, meta: SegmentMeta) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.manifest.insert_segment(meta)?;
        inner.dirty = true;
        Ok(())
    }

    /// Drop descriptors matching any seq in the set.
    ///
    /// Object bytes are not deleted; that is the caller's job.
    pub async fn remove_segments(&self, seqs: &BTreeSet<u64>) -> Result<Vec<SegmentMeta>> {
        let mut inner = self.inner.lock().await;
        let removed = inner.manifest.drop_segments(seqs);
        if !removed.is_empty() {
            inner.dirty = true;
        }
        Ok(removed)
    }

    /// Reserve `n` consecutive event seqs, returning the first.
    pub async fn reserve_event_seq(&self, n: u64) -> Result<u64> {
        let mut inner = self.inner.lock().await;
        let first = inner.manifest.next_event_seq;
        inner.manifest.next_event_seq += n;
        inner.dirty = true;
        Ok(first)
    }

    /// Advance the compaction watermark; it never moves backward.
    pub async fn set_compacted_through(&self, ts: Timestamp) -> Result<()> {
        let mut inner = self.inner.lock().await;
        match inner.manifest.compacted_through {
            Some(current) if ts < current => Err(Error::Conflict(format!(
                "watermark cannot move backward: {current} -> {ts}"
            ))),
            Some(current) if ts == current => Ok(()),
            _ => {
                inner.manifest.compacted_through = Some(ts);
                inner.dirty = true;
                Ok(())
            }
        }
    }

    /// Consistent clone of the current manifest.
    pub async fn snapshot(&self) -> Manifest {
        self.inner.lock().await.manifest.clone()
    }

    pub async fn next_segment_seq(&self) -> u64 {
        self.inner.lock().await.manifest.next_segment_seq
    }

    pub async fn is_dirty(&self) -> bool {
        self.inner.lock().await.dirty
    }

    pub async fn etag(&self) -> Option<String> {
        self.inner.lock().await.etag.clone()
    }

    pub fn dataset_key(&self) -> &str {
        &self.key
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn meta(seq: u64, min_ts: i64, max_ts: i64, rows: u64, seqs: Option<(u64, u64)>) -> SegmentMeta {
        SegmentMeta {
            seq,
            path: event_segment_key("ds", seq),
            min_ts: Timestamp::from_millis(min_ts),
            max_ts: Timestamp::from_millis(max_ts),
            min_seq: seqs.map(|s| s.0),
            max_seq: seqs.map(|s| s.1),
            row_count: rows,
            size_bytes: rows * 100,
            created_at: Timestamp::from_millis(max_ts),
            extra: Map::new(),
        }
    }

    #[tokio::test]
    async fn test_load_synthesizes_empty_manifest() {
        let store = Arc::new(MemoryStore::new());
        let manager = ManifestManager::load(store, "ds").await.unwrap();
        let manifest = manager.snapshot().await;
        assert_eq!(manifest.version, MANIFEST_VERSION);
        assert_eq!(manifest.dataset, "ds");
        assert_eq!(manifest.next_event_seq, 1);
        assert_eq!(manifest.next_segment_seq, 1);
        assert!(manifest.segments.is_empty());
        assert_eq!(manifest.compacted_through, None);
        assert!(!manager.is_dirty().await);
    }

    #[tokio::test]
    async fn test_add_save_load_roundtrip() {
        let store = Arc::new(MemoryStore::new());
        let manager = ManifestManager::load(store.clone(), "ds").await.unwrap();

        manager
            .add_segment(meta(1, 1000, 2000, 3, Some((1, 3))))
            .await
            .unwrap();
        assert!(manager.is_dirty().await);
        manager.save().await.unwrap();
        assert!(!manager.is_dirty().await);

        let reopened = ManifestManager::load(store, "ds").await.unwrap();
        let manifest = reopened.snapshot().await;
        assert_eq!(manifest.segments.len(), 1);
        assert_eq!(manifest.total_events, 3);
        assert_eq!(manifest.next_event_seq, 4);
        assert_eq!(manifest.next_segment_seq, 2);
        assert_eq!(manifest.segments[0].path, "ds/events/seg-0000000001.parquet");
    }

    #[tokio::test]
    async fn test_segments_sorted_by_min_ts_then_seq() {
        let store = Arc::new(MemoryStore::new());
        let manager = ManifestManager::load(store, "ds").await.unwrap();
        manager
            .add_segment(meta(1, 5000, 6000, 1, Some((1, 1))))
            .await
            .unwrap();
        manager
            .add_segment(meta(2, 1000, 2000, 1, Some((2, 2))))
            .await
            .unwrap();
        manager
            .add_segment(meta(3, 1000, 3000, 1, Some((3, 3))))
            .await
            .unwrap();

        let manifest = manager.snapshot().await;
        let seqs: Vec<u64> = manifest.segments.iter().map(|s| s.seq).collect();
        assert_eq!(seqs, vec![2, 3, 1]);

        let duplicate = manager.add_segment(meta(2, 0, 1, 1, None)).await;
        assert!(matches!(duplicate, Err(Error::Conflict(_))));
    }

    #[tokio::test]
    async fn test_reserve_event_seq_is_dense() {
        let store = Arc::new(MemoryStore::new());
        let manager = ManifestManager::load(store, "ds").await.unwrap();
        assert_eq!(manager.reserve_event_seq(3).await.unwrap(), 1);
        assert_eq!(manager.reserve_event_seq(2).await.unwrap(), 4);
        assert_eq!(manager.snapshot().await.next_event_seq, 6);
    }

    #[tokio::test]
    async fn test_conditional_save_conflict() {
        let store = Arc::new(MemoryStore::new());
        let first = ManifestManager::load(store.clone(), "ds").await.unwrap();
        let second = ManifestManager::load(store.clone(), "ds").await.unwrap();

        first
            .add_segment(meta(1, 1000, 2000, 1, Some((1, 1))))
            .await
            .unwrap();
        first.save().await.unwrap();

        second
            .add_segment(meta(1, 3000, 4000, 1, Some((1, 1))))
            .await
            .unwrap();
        let err = second.save().await.unwrap_err();
        assert!(matches!(err, Error::ManifestConflict));

        // The loser rebased onto the winner's state.
        let manifest = second.snapshot().await;
        assert_eq!(manifest.segments.len(), 1);
        assert_eq!(manifest.segments[0].min_ts, Timestamp::from_millis(1000));
        assert!(!second.is_dirty().await);
    }

    #[tokio::test]
    async fn test_watermark_monotonic() {
        let store = Arc::new(MemoryStore::new());
        let manager = ManifestManager::load(store, "ds").await.unwrap();
        manager
            .set_compacted_through(Timestamp::from_millis(1800))
            .await
            .unwrap();
        // Same value is idempotent.
        manager
            .set_compacted_through(Timestamp::from_millis(1800))
            .await
            .unwrap();
        let err = manager
            .set_compacted_through(Timestamp::from_millis(1000))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }

    #[tokio::test]
    async fn test_remove_segments_adjusts_aggregates() {
        let store = Arc::new(MemoryStore::new());
        let manager = ManifestManager::load(store, "ds").await.unwrap();
        manager
            .add_segment(meta(1, 1000, 2000, 5, Some((1, 5))))
            .await
            .unwrap();
        manager
            .add_segment(meta(2, 3000, 4000, 5, Some((6, 10))))
            .await
            .unwrap();

        let removed = manager
            .remove_segments(&BTreeSet::from([1]))
            .await
            .unwrap();
        assert_eq!(removed.len(), 1);

        let manifest = manager.snapshot().await;
        assert_eq!(manifest.total_events, 5);
        assert_eq!(manifest.segments.len(), 1);
        // Counters never regress on removal.
        assert_eq!(manifest.next_event_seq, 11);
        assert_eq!(manifest.next_segment_seq, 3);
    }

    #[tokio::test]
    async fn test_unknown_keys_preserved() {
        let store = Arc::new(MemoryStore::new());
        let manager = ManifestManager::load(store.clone(), "ds").await.unwrap();
        manager
            .add_segment(meta(1, 1000, 2000, 1, Some((1, 1))))
            .await
            .unwrap();
        manager.save().await.unwrap();

        // A future writer adds a key this version does not know.
        use crate::store::ObjectStore as _;
        let bytes = store.read_all(&manifest_key("ds")).await.unwrap();
        let mut value: Value = serde_json::from_slice(&bytes).unwrap();
        value["replication_epoch"] = Value::from(7);
        store
            .write(&manifest_key("ds"), serde_json::to_vec(&value).unwrap().into())
            .await
            .unwrap();

        let manager = ManifestManager::load(store.clone(), "ds").await.unwrap();
        assert_eq!(
            manager.snapshot().await.extra.get("replication_epoch"),
            Some(&Value::from(7))
        );
        manager.reserve_event_seq(1).await.unwrap();
        manager.save().await.unwrap();

        let bytes = store.read_all(&manifest_key("ds")).await.unwrap();
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["replication_epoch"], Value::from(7));
    }

    #[tokio::test]
    async fn test_query_helpers() {
        let store = Arc::new(MemoryStore::new());
        let manager = ManifestManager::load(store, "ds").await.unwrap();
        manager
            .add_segment(meta(1, 1000, 2000, 2, Some((1, 2))))
            .await
            .unwrap();
        manager
            .add_segment(meta(2, 2500, 3500, 2, Some((3, 4))))
            .await
            .unwrap();

        let manifest = manager.snapshot().await;
        let lo = |v| Some(Timestamp::from_millis(v));
        assert_eq!(manifest.segments_in_range(lo(0), lo(1500)).len(), 1);
        assert_eq!(manifest.segments_in_range(lo(0), lo(5000)).len(), 2);
        assert_eq!(manifest.segments_in_range(lo(2100), lo(2400)).len(), 0);
        assert_eq!(manifest.segments_after(Timestamp::from_millis(2000)).len(), 2);
        assert_eq!(manifest.segments_before(Timestamp::from_millis(2000)).len(), 1);
        assert!(manifest.segment(2).is_some());
        assert!(manifest.segment(9).is_none());

        assert!(manifest.compactable_segments().is_empty());
        manager
            .set_compacted_through(Timestamp::from_millis(2000))
            .await
            .unwrap();
        let manifest = manager.snapshot().await;
        let compactable: Vec<u64> = manifest.compactable_segments().iter().map(|s| s.seq).collect();
        assert_eq!(compactable, vec![1]);
    }
}
