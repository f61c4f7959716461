//! Compactor: fold a prefix of the log into state snapshots.
//!
//! A run gathers every event segment wholly at or before the cutoff,
//! folds it through a fresh collector, optionally writes the entity
//! and relationship snapshot segments, advances the watermark, and
//! only then retires the compacted segments. The manifest save is the
//! commit point: a crash before it changes nothing, a crash after it
//! leaves at most surplus object bytes.

use crate::config::{CompactionPolicy, StoreConfig};
use crate::collector::StateCollector;
use crate::core::state::{EntityState, RelationshipState};
use crate::core::temporal::Timestamp;
use crate::error::{Error, Result};
use crate::manifest::{
    snapshot_entities_key, snapshot_relationships_key, Manifest, ManifestManager, SegmentMeta,
};
use crate::observe::{Notification, ObserverBus};
use crate::segment::reader::SegmentFileReader;
use crate::segment::rows::{
    entity_schema, entity_to_row, relationship_schema, relationship_to_row, row_to_entity,
    row_to_event_one, row_to_relationship,
};
use crate::segment::writer::SegmentEncoder;
use crate::store::ObjectStore;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What a compaction run is allowed to do.
#[derive(Debug, Clone, Copy)]
pub struct CompactionOptions {
    /// Write entity/relationship snapshot segments
    pub create_snapshot: bool,
    /// Retire compacted segments from the manifest and delete their bytes
    pub delete_segments: bool,
}

impl Default for CompactionOptions {
    fn default() -> Self {
        Self {
            create_snapshot: true,
            delete_segments: false,
        }
    }
}

/// Summary of one compaction run.
#[derive(Debug, Clone, PartialEq)]
pub struct CompactionSummary {
    /// False when the run found nothing to do (benign)
    pub performed: bool,
    pub through: Timestamp,
    pub events_folded: u64,
    pub segments_compacted: usize,
    pub segments_retired: usize,
    pub entities: usize,
    pub relationships: usize,
}

impl CompactionSummary {
    fn threshold_unmet(through: Timestamp) -> Self {
        Self {
            performed: false,
            through,
            events_folded: 0,
            segments_compacted: 0,
            segments_retired: 0,
            entities: 0,
            relationships: 0,
        }
    }
}

/// Pure policy predicate: does the manifest call for a compaction run?
///
/// Any one trigger (live events, live bytes, oldest segment age) is
/// sufficient.
pub fn needs_compaction(manifest: &Manifest, policy: &CompactionPolicy, now: Timestamp) -> bool {
    if manifest.total_events >= policy.min_events {
        return true;
    }
    if manifest.live_bytes() >= policy.min_bytes {
        return true;
    }
    manifest
        .oldest_segment_created_at()
        .map_or(false, |oldest| {
            now.as_millis() - oldest.as_millis() >= policy.max_segment_age_ms
        })
}

pub struct Compactor {
    store: Arc<dyn ObjectStore>,
    manifest: Arc<ManifestManager>,
    config: StoreConfig,
    bus: Arc<ObserverBus>,
}

impl Compactor {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        manifest: Arc<ManifestManager>,
        config: StoreConfig,
        bus: Arc<ObserverBus>,
    ) -> Self {
        Self {
            store,
            manifest,
            config,
            bus,
        }
    }

    /// Compact every event at or before `through`.
    ///
    /// Compacting through zero, or through a cutoff no live segment is
    /// wholly under, is a benign no-op. A lost manifest race reloads
    /// and re-evaluates against the new watermark, so two racing
    /// compactors converge instead of double-folding.
    pub async fn compact(
        &self,
        through: Timestamp,
        options: CompactionOptions,
    ) -> Result<CompactionSummary> {
        if through == Timestamp::ZERO {
            return Ok(CompactionSummary::threshold_unmet(through));
        }

        self.bus.emit(Notification::CompactionStarted {
            dataset: self.config.dataset.clone(),
            through,
        });

        match self.compact_inner(through, options).await {
            Ok(summary) => {
                if summary.performed {
                    self.bus.emit(Notification::CompactionCompleted {
                        dataset: self.config.dataset.clone(),
                        through,
                        events_folded: summary.events_folded,
                        segments_retired: summary.segments_retired,
                    });
                }
                Ok(summary)
            }
            Err(e) => {
                self.bus.emit(Notification::CompactionFailed {
                    dataset: self.config.dataset.clone(),
                    through,
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }

    async fn compact_inner(
        &self,
        through: Timestamp,
        options: CompactionOptions,
    ) -> Result<CompactionSummary> {
        let mut attempt = 0u32;
        loop {
            let manifest = self.manifest.snapshot().await;
            if manifest.compacted_through.map_or(false, |w| w >= through) {
                debug!(
                    dataset = %self.config.dataset,
                    %through,
                    "watermark already covers cutoff; nothing to do"
                );
                return Ok(CompactionSummary::threshold_unmet(through));
            }

            // Strict filter: only segments wholly at or before the cutoff.
            let compact_set: Vec<SegmentMeta> = manifest
                .segments
                .iter()
                .filter(|s| s.is_event_segment() && s.max_ts <= through)
                .cloned()
                .collect();
            if compact_set.is_empty() {
                return Ok(CompactionSummary::threshold_unmet(through));
            }

            let collector = self.fold_segments(&compact_set, through).await?;
            let entities = collector.entities();
            let relationships = collector.relationships();
            let events_folded = collector.events_processed();

            if options.create_snapshot {
                self.write_snapshot(through, &entities, &relationships)
                    .await?;
            }

            match self.manifest.set_compacted_through(through).await {
                Ok(()) => {}
                // Another run advanced the watermark under us; the next
                // iteration sees it covered and no-ops.
                Err(Error::Conflict(_)) => continue,
                Err(e) => return Err(e),
            }

            let retired: Vec<SegmentMeta> = if options.delete_segments {
                let seqs: BTreeSet<u64> = compact_set.iter().map(|s| s.seq).collect();
                self.manifest.remove_segments(&seqs).await?
            } else {
                Vec::new()
            };

            match self.manifest.save().await {
                Ok(()) => {
                    // Physical deletes only after the commit point, so a
                    // crash here leaves surplus bytes, never lost ones.
                    for meta in &retired {
                        if let Err(e) = self.store.delete(&meta.path).await {
                            warn!(path = %meta.path, %e, "failed to delete retired segment");
                        }
                        self.bus.emit(Notification::SegmentRetired {
                            seq: meta.seq,
                            path: meta.path.clone(),
                        });
                    }
                    info!(
                        dataset = %self.config.dataset,
                        %through,
                        events = events_folded,
                        segments = compact_set.len(),
                        retired = retired.len(),
                        "compaction committed"
                    );
                    return Ok(CompactionSummary {
                        performed: true,
                        through,
                        events_folded,
                        segments_compacted: compact_set.len(),
                        segments_retired: retired.len(),
                        entities: entities.len(),
                        relationships: relationships.len(),
                    });
                }
                Err(Error::ManifestConflict) if attempt < self.config.retry.max_retries => {
                    attempt += 1;
                    warn!(
                        dataset = %self.config.dataset,
                        attempt,
                        "manifest conflict during compaction; re-evaluating"
                    );
                    // The manager reloaded; the loop re-checks the new
                    // watermark. Snapshot bytes at this cutoff key are
                    // rewritten identically if we do fold again.
                    tokio::time::sleep(self.config.retry.backoff(attempt - 1)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn fold_segments(
        &self,
        segments: &[SegmentMeta],
        through: Timestamp,
    ) -> Result<StateCollector> {
        let mut collector = StateCollector::new();
        for meta in segments {
            let reader = match SegmentFileReader::open(self.store.clone(), &meta.path).await {
                Ok(reader) => reader,
                Err(e @ Error::CorruptSegment { .. }) => {
                    self.quarantine(&meta.path, &e);
                    return Err(e);
                }
                Err(e) => return Err(e),
            };
            for idx in 0..reader.footer().row_groups.len() {
                let rows = match reader.read_row_group(idx, None).await {
                    Ok(rows) => rows,
                    Err(e @ Error::CorruptSegment { .. }) => {
                        self.quarantine(&meta.path, &e);
                        return Err(e);
                    }
                    Err(e) => return Err(e),
                };
                for row in rows {
                    let event = row_to_event_one(row)?;
                    // The segment filter is strict, so this only trims
                    // events a misbounded segment could smuggle past.
                    if event.ts <= through {
                        collector.process(&event);
                    }
                }
            }
        }
        Ok(collector)
    }

    async fn write_snapshot(
        &self,
        through: Timestamp,
        entities: &[EntityState],
        relationships: &[RelationshipState],
    ) -> Result<()> {
        let mut encoder = SegmentEncoder::new(
            entity_schema(),
            self.config.default_compression,
            self.config.segment.row_group_rows,
        );
        for row in entities {
            encoder.push_row(entity_to_row(row))?;
        }
        let encoded = encoder.finish()?;
        self.store
            .write_atomic(
                &snapshot_entities_key(&self.config.dataset, through),
                encoded.bytes,
            )
            .await?;

        let mut encoder = SegmentEncoder::new(
            relationship_schema(),
            self.config.default_compression,
            self.config.segment.row_group_rows,
        );
        for row in relationships {
            encoder.push_row(relationship_to_row(row))?;
        }
        let encoded = encoder.finish()?;
        self.store
            .write_atomic(
                &snapshot_relationships_key(&self.config.dataset, through),
                encoded.bytes,
            )
            .await?;
        Ok(())
    }

    /// Read back the snapshot written at a given cutoff.
    pub async fn read_snapshot(
        &self,
        through: Timestamp,
    ) -> Result<(Vec<EntityState>, Vec<RelationshipState>)> {
        let entities_key = snapshot_entities_key(&self.config.dataset, through);
        let reader = SegmentFileReader::open(self.store.clone(), &entities_key).await?;
        let mut entities = Vec::new();
        for idx in 0..reader.footer().row_groups.len() {
            for row in reader.read_row_group(idx, None).await? {
                entities.push(row_to_entity(row)?);
            }
        }

        let rels_key = snapshot_relationships_key(&self.config.dataset, through);
        let reader = SegmentFileReader::open(self.store.clone(), &rels_key).await?;
        let mut relationships = Vec::new();
        for idx in 0..reader.footer().row_groups.len() {
            for row in reader.read_row_group(idx, None).await? {
                relationships.push(row_to_relationship(row)?);
            }
        }
        Ok((entities, relationships))
    }

    fn quarantine(&self, path: &str, error: &Error) {
        warn!(path, %error, "segment failed validation during compaction");
        self.bus.emit(Notification::SegmentQuarantined {
            path: path.to_string(),
            reason: error.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::event::{ChangeEvent, EventOp};
    use crate::log::writer::EventWriter;
    use crate::store::{MemoryStore, ObjectStore as _};
    use serde_json::json;

    fn event(op: EventOp, ts: i64, target: &str, after: Option<serde_json::Value>) -> ChangeEvent {
        let mut ev = ChangeEvent::new(op, target, Timestamp::from_millis(ts));
        ev.after = after.and_then(|v| v.as_object().cloned());
        ev
    }

    async fn fixture(dataset: &str) -> (Arc<MemoryStore>, EventWriter, Compactor, Arc<ManifestManager>) {
        let store = Arc::new(MemoryStore::new());
        let config = StoreConfig::new(dataset);
        let manager = Arc::new(
            ManifestManager::load(store.clone(), dataset).await.unwrap(),
        );
        let bus = Arc::new(ObserverBus::new());
        let writer = EventWriter::new(store.clone(), manager.clone(), config.clone(), bus.clone());
        let compactor = Compactor::new(store.clone(), manager.clone(), config, bus);
        (store, writer, compactor, manager)
    }

    #[tokio::test]
    async fn test_compact_writes_snapshot_and_watermark() {
        let (store, writer, compactor, manager) = fixture("ds").await;
        writer
            .publish(vec![
                event(EventOp::Create, 1000, "u:1", Some(json!({"name": "A"}))),
                event(EventOp::Create, 1500, "u:2", Some(json!({"name": "B"}))),
            ])
            .await
            .unwrap();
        writer
            .publish(vec![event(
                EventOp::Update,
                2000,
                "u:1",
                Some(json!({"name": "A2"})),
            )])
            .await
            .unwrap();

        let summary = compactor
            .compact(Timestamp::from_millis(1800), CompactionOptions::default())
            .await
            .unwrap();
        assert!(summary.performed);
        assert_eq!(summary.events_folded, 2);
        assert_eq!(summary.segments_compacted, 1);
        assert_eq!(summary.entities, 2);
        assert_eq!(summary.segments_retired, 0);

        let manifest = manager.snapshot().await;
        assert_eq!(
            manifest.compacted_through,
            Some(Timestamp::from_millis(1800))
        );
        // Nothing retired: both segments still live.
        assert_eq!(manifest.segments.len(), 2);

        assert!(store
            .exists("ds/snapshots/1800/entities.parquet")
            .await
            .unwrap());
        assert!(store
            .exists("ds/snapshots/1800/rels.parquet")
            .await
            .unwrap());

        let (entities, rels) = compactor
            .read_snapshot(Timestamp::from_millis(1800))
            .await
            .unwrap();
        assert!(rels.is_empty());
        assert_eq!(entities.len(), 2);
        let u1 = entities.iter().find(|e| e.target == "u:1").unwrap();
        assert_eq!(u1.state, json!({"name": "A"}).as_object().cloned());
        assert_eq!(u1.last_event_ts, Timestamp::from_millis(1000));
        assert_eq!(u1.last_event_seq, 1);
    }

    #[tokio::test]
    async fn test_compact_through_zero_is_noop() {
        let (store, writer, compactor, _) = fixture("ds").await;
        writer
            .publish(vec![event(EventOp::Create, 1000, "u:1", Some(json!({})))])
            .await
            .unwrap();
        let before = store.read_all("ds/events/_manifest.json").await.unwrap();

        let summary = compactor
            .compact(Timestamp::ZERO, CompactionOptions::default())
            .await
            .unwrap();
        assert!(!summary.performed);

        let after = store.read_all("ds/events/_manifest.json").await.unwrap();
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn test_compact_retires_segments() {
        let (store, writer, compactor, manager) = fixture("ds").await;
        writer
            .publish(vec![
                event(EventOp::Create, 1000, "u:1", Some(json!({"n": 1}))),
                event(EventOp::Create, 1100, "u:2", Some(json!({"n": 2}))),
            ])
            .await
            .unwrap();
        writer
            .publish(vec![event(EventOp::Create, 5000, "u:3", Some(json!({"n": 3})))])
            .await
            .unwrap();

        let paths_before: Vec<String> = manager
            .snapshot()
            .await
            .segments
            .iter()
            .map(|s| s.path.clone())
            .collect();

        let summary = compactor
            .compact(
                Timestamp::from_millis(2000),
                CompactionOptions {
                    create_snapshot: true,
                    delete_segments: true,
                },
            )
            .await
            .unwrap();
        assert!(summary.performed);
        assert_eq!(summary.segments_retired, 1);

        let manifest = manager.snapshot().await;
        assert_eq!(manifest.segments.len(), 1);
        assert_eq!(manifest.total_events, 1);
        assert!(!store.exists(&paths_before[0]).await.unwrap());
        assert!(store.exists(&paths_before[1]).await.unwrap());
    }

    #[tokio::test]
    async fn test_compact_nothing_under_cutoff() {
        let (_, writer, compactor, manager) = fixture("ds").await;
        writer
            .publish(vec![event(EventOp::Create, 5000, "u:1", Some(json!({})))])
            .await
            .unwrap();

        // The only segment reaches past the cutoff; strict filter skips it.
        let summary = compactor
            .compact(Timestamp::from_millis(1000), CompactionOptions::default())
            .await
            .unwrap();
        assert!(!summary.performed);
        assert_eq!(manager.snapshot().await.compacted_through, None);
    }

    #[tokio::test]
    async fn test_racing_compactors_converge() {
        let store = Arc::new(MemoryStore::new());
        let config = StoreConfig::new("ds");
        let bus = Arc::new(ObserverBus::new());

        let m_writer = Arc::new(ManifestManager::load(store.clone(), "ds").await.unwrap());
        let writer = EventWriter::new(store.clone(), m_writer, config.clone(), bus.clone());
        writer
            .publish(vec![
                event(EventOp::Create, 1000, "u:1", Some(json!({"n": 1}))),
                event(EventOp::Create, 1500, "u:2", Some(json!({"n": 2}))),
            ])
            .await
            .unwrap();

        // Two compactors with independent manifest views and the same cutoff.
        let m1 = Arc::new(ManifestManager::load(store.clone(), "ds").await.unwrap());
        let m2 = Arc::new(ManifestManager::load(store.clone(), "ds").await.unwrap());
        let c1 = Compactor::new(store.clone(), m1, config.clone(), bus.clone());
        let c2 = Compactor::new(store.clone(), m2, config.clone(), bus);

        let (r1, r2) = tokio::join!(
            c1.compact(Timestamp::from_millis(1800), CompactionOptions::default()),
            c2.compact(Timestamp::from_millis(1800), CompactionOptions::default())
        );
        let (r1, r2) = (r1.unwrap(), r2.unwrap());

        // Exactly one run did the work; the loser re-evaluated against
        // the advanced watermark and reported a benign no-op.
        assert!(r1.performed ^ r2.performed);

        let reloaded = ManifestManager::load(store, "ds").await.unwrap();
        assert_eq!(
            reloaded.snapshot().await.compacted_through,
            Some(Timestamp::from_millis(1800))
        );
    }

    #[tokio::test]
    async fn test_needs_compaction_triggers() {
        let policy = CompactionPolicy {
            min_events: 10,
            min_bytes: 1_000_000,
            max_segment_age_ms: 60_000,
        };
        let now = Timestamp::from_millis(100_000);

        let mut manifest = Manifest::empty("ds");
        assert!(!needs_compaction(&manifest, &policy, now));

        manifest.total_events = 10;
        assert!(needs_compaction(&manifest, &policy, now));
        manifest.total_events = 9;
        assert!(!needs_compaction(&manifest, &policy, now));

        manifest.segments.push(SegmentMeta {
            seq: 1,
            path: "p".into(),
            min_ts: Timestamp::from_millis(0),
            max_ts: Timestamp::from_millis(1),
            min_seq: Some(1),
            max_seq: Some(9),
            row_count: 9,
            size_bytes: 2_000_000,
            created_at: Timestamp::from_millis(99_000),
            extra: serde_json::Map::new(),
        });
        // Byte threshold fires.
        assert!(needs_compaction(&manifest, &policy, now));

        manifest.segments[0].size_bytes = 100;
        assert!(!needs_compaction(&manifest, &policy, now));

        // Age threshold fires once the oldest segment is stale enough.
        manifest.segments[0].created_at = Timestamp::from_millis(30_000);
        assert!(needs_compaction(&manifest, &policy, now));
    }
}
