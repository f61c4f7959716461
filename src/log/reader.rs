//! Event reader: pruned, projected scans over the segment log.
//!
//! Every scan runs against one manifest snapshot, so concurrent
//! publishes are invisible to it. Candidate segments come from the
//! manifest's time index; their footers are fetched by range read and
//! row groups that statistics prove irrelevant are never downloaded.

use crate::config::StoreConfig;
use crate::core::event::ChangeEvent;
use crate::core::temporal::Timestamp;
use crate::error::{Error, Result};
use crate::log::predicate::ScanPredicate;
use crate::manifest::{ManifestManager, SegmentMeta};
use crate::observe::{Notification, ObserverBus};
use crate::segment::reader::SegmentFileReader;
use crate::segment::rows::{row_to_event_one, EVENT_CORE_COLUMNS};
use crate::store::ObjectStore;
use futures::stream::{self, StreamExt, TryStreamExt};
use std::sync::Arc;
use tracing::{debug, warn};

/// Inclusive time range of a scan.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ScanRange {
    pub start: Option<Timestamp>,
    pub end: Option<Timestamp>,
}

impl ScanRange {
    /// The whole log.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn since(start: Timestamp) -> Self {
        Self {
            start: Some(start),
            end: None,
        }
    }

    pub fn through(end: Timestamp) -> Self {
        Self {
            start: None,
            end: Some(end),
        }
    }

    pub fn between(start: Timestamp, end: Timestamp) -> Self {
        Self {
            start: Some(start),
            end: Some(end),
        }
    }

    pub fn contains(&self, ts: Timestamp) -> bool {
        self.start.map_or(true, |s| ts >= s) && self.end.map_or(true, |e| ts <= e)
    }
}

pub struct EventReader {
    store: Arc<dyn ObjectStore>,
    manifest: Arc<ManifestManager>,
    config: StoreConfig,
    bus: Arc<ObserverBus>,
}

impl EventReader {
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

    /// Time-range scan in `(ts, seq)` order.
    ///
    /// The core columns (`id`, `ts`, `seq`, `op`, `target`) are always
    /// materialized; `projection` selects which of the optional map
    /// columns are. Unprojected maps come back as `None`.
    pub async fn scan(
        &self,
        range: ScanRange,
        predicate: Option<&ScanPredicate>,
        projection: Option<&[&str]>,
    ) -> Result<Vec<ChangeEvent>> {
        let manifest = self.snapshot_with_lag_sample().await;

        let mut effective = predicate.cloned().unwrap_or_default();
        if range.start.is_some() || range.end.is_some() {
            effective = effective.with_int_range(
                "ts",
                range.start.map(|t| t.as_millis()),
                range.end.map(|t| t.as_millis()),
            );
        }

        let candidates: Vec<SegmentMeta> = manifest
            .segments_in_range(range.start, range.end)
            .into_iter()
            .filter(|m| m.is_event_segment())
            .cloned()
            .collect();
        debug!(
            dataset = %self.config.dataset,
            candidates = candidates.len(),
            "scan candidate segments selected"
        );

        let mut events = Vec::new();
        for meta in candidates {
            self.scan_segment(&meta, &effective, projection, &mut events)
                .await?;
        }
        events.sort_by_key(|e| (e.ts, e.seq));
        Ok(events)
    }

    /// Ordered tail of the log: every event with `seq > after`.
    pub async fn scan_after_seq(&self, after: u64) -> Result<Vec<ChangeEvent>> {
        let manifest = self.snapshot_with_lag_sample().await;

        let predicate = ScanPredicate::new().with_int_range("seq", Some(after as i64 + 1), None);
        let candidates: Vec<SegmentMeta> = manifest
            .segments
            .iter()
            .filter(|m| m.is_event_segment() && m.max_seq.map_or(false, |s| s > after))
            .cloned()
            .collect();

        let mut events = Vec::new();
        for meta in candidates {
            self.scan_segment(&meta, &predicate, None, &mut events)
                .await?;
        }
        events.sort_by_key(|e| e.seq);
        Ok(events)
    }

    async fn snapshot_with_lag_sample(&self) -> crate::manifest::Manifest {
        let manifest = self.manifest.snapshot().await;
        let lag_ms = Timestamp::now().as_millis() - manifest.updated_at.as_millis();
        self.bus.emit(Notification::ConsistencyLag {
            dataset: self.config.dataset.clone(),
            lag_ms,
        });
        manifest
    }

    async fn scan_segment(
        &self,
        meta: &SegmentMeta,
        predicate: &ScanPredicate,
        projection: Option<&[&str]>,
        out: &mut Vec<ChangeEvent>,
    ) -> Result<()> {
        let reader = match SegmentFileReader::open(self.store.clone(), &meta.path).await {
            Ok(reader) => reader,
            Err(e @ Error::CorruptSegment { .. }) => {
                self.quarantine(&meta.path, &e);
                return Err(e);
            }
            Err(e) => return Err(e),
        };
        let footer_bytes = reader.bytes_read();
        let footer = reader.footer();

        let surviving: Vec<usize> = (0..footer.row_groups.len())
            .filter(|&idx| !predicate.excludes_group(&footer.schema, &footer.row_groups[idx]))
            .collect();
        if surviving.len() < footer.row_groups.len() {
            debug!(
                path = %meta.path,
                kept = surviving.len(),
                total = footer.row_groups.len(),
                "row groups pruned by statistics"
            );
        }

        // The decoder needs the core columns plus whatever the caller
        // and the predicate reference.
        let effective_projection: Option<Vec<&str>> = projection.map(|cols| {
            let mut all: Vec<&str> = EVENT_CORE_COLUMNS.to_vec();
            all.extend(cols.iter().copied());
            all.extend(predicate.columns());
            all.sort();
            all.dedup();
            all
        });

        let parallelism = self.config.reader.row_group_parallelism.max(1);
        let groups: Vec<Vec<Vec<crate::segment::ColumnValue>>> = stream::iter(
            surviving
                .into_iter()
                .map(|idx| reader.read_row_group(idx, effective_projection.as_deref())),
        )
        .buffered(parallelism)
        .try_collect()
        .await
        .map_err(|e| {
            if let Error::CorruptSegment { .. } = &e {
                self.quarantine(&meta.path, &e);
            }
            e
        })?;

        for rows in groups {
            for row in rows {
                if !predicate.matches_row(&reader.footer().schema, &row) {
                    continue;
                }
                out.push(row_to_event_one(row)?);
            }
        }

        self.bus.emit(Notification::BytesRead {
            path: meta.path.clone(),
            bytes: reader.bytes_read(),
            page_bytes: reader.bytes_read() - footer_bytes,
        });
        Ok(())
    }

    fn quarantine(&self, path: &str, error: &Error) {
        warn!(path, %error, "segment failed validation; quarantined");
        self.bus.emit(Notification::SegmentQuarantined {
            path: path.to_string(),
            reason: error.to_string(),
        });
    }
}
