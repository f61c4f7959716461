//! Event segment writer: batches in, published segments out.
//!
//! Publication is a two-phase commit against the manifest. Segment
//! bytes are first claimed and uploaded under a key derived from the
//! next segment seq — the claim is an if-none-match conditional write,
//! so two writers can never publish different bytes under one key.
//! The manifest is then saved through its own conditional write; a
//! lost race reloads and retries with bounded backoff, reusing bytes
//! already uploaded whenever the rebased counters still match them.
//! Abandoned claims become orphan bytes for an out-of-band reconciler.

use crate::config::StoreConfig;
use crate::core::event::ChangeEvent;
use crate::core::temporal::Timestamp;
use crate::error::{Error, Result};
use crate::manifest::{event_segment_key, ManifestManager, SegmentMeta};
use crate::observe::{Notification, ObserverBus};
use crate::segment::rows::{event_schema, event_to_row};
use crate::segment::writer::SegmentEncoder;
use crate::store::ObjectStore;
use bytes::Bytes;
use serde_json::Map;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Claim attempts before a publish gives up on finding a free seg seq.
const MAX_CLAIM_ATTEMPTS: u32 = 64;

/// Outcome of a successful publish.
#[derive(Debug, Clone)]
pub struct PublishReceipt {
    /// Descriptors of the segments created, in order
    pub segments: Vec<SegmentMeta>,
    /// First event seq assigned to the batch (0 for an empty batch)
    pub first_seq: u64,
    /// Number of events published
    pub events: usize,
}

impl PublishReceipt {
    fn empty() -> Self {
        Self {
            segments: Vec::new(),
            first_seq: 0,
            events: 0,
        }
    }
}

struct PreparedSegment {
    meta: SegmentMeta,
    bytes: Bytes,
    uploaded: bool,
}

pub struct EventWriter {
    store: Arc<dyn ObjectStore>,
    manifest: Arc<ManifestManager>,
    config: StoreConfig,
    bus: Arc<ObserverBus>,
}

impl EventWriter {
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

    /// Publish a batch of events as one or more immutable segments.
    ///
    /// An empty batch is a no-op and leaves the manifest untouched.
    pub async fn publish(&self, events: Vec<ChangeEvent>) -> Result<PublishReceipt> {
        if events.is_empty() {
            return Ok(PublishReceipt::empty());
        }
        let started = Instant::now();
        self.bus.emit(Notification::WriteStarted {
            dataset: self.config.dataset.clone(),
            rows: events.len(),
        });

        match self.publish_inner(events).await {
            Ok(receipt) => {
                let bytes = receipt.segments.iter().map(|s| s.size_bytes).sum();
                self.bus.emit(Notification::WriteCompleted {
                    dataset: self.config.dataset.clone(),
                    rows: receipt.events,
                    bytes,
                    elapsed_ms: started.elapsed().as_millis() as u64,
                });
                Ok(receipt)
            }
            Err(e) => {
                self.bus.emit(Notification::WriteFailed {
                    dataset: self.config.dataset.clone(),
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }

    async fn publish_inner(&self, mut events: Vec<ChangeEvent>) -> Result<PublishReceipt> {
        // Input is expected ordered by ts; verify, and restore the
        // order if a writer slipped.
        if events.windows(2).any(|w| w[0].ts > w[1].ts) {
            debug!(
                dataset = %self.config.dataset,
                "publish batch arrived out of ts order; sorting"
            );
            events.sort_by_key(|e| e.ts);
        }

        let batch_len = events.len() as u64;
        let mut first_seq: Option<u64> = None;
        let mut parts: Option<Vec<PreparedSegment>> = None;
        let mut encoded_for = 0u64;
        // Keys this publish has claimed; overwriting them is safe.
        let mut claimed: HashSet<String> = HashSet::new();
        // Lower bound on usable segment seqs, bumped past foreign claims.
        let mut seq_floor = 0u64;
        let mut save_attempts = 0u32;
        let mut claim_attempts = 0u32;

        'publish: loop {
            let fs = match first_seq {
                Some(fs) => fs,
                None => {
                    let fs = self.manifest.reserve_event_seq(batch_len).await?;
                    first_seq = Some(fs);
                    fs
                }
            };
            let base_seq = self.manifest.next_segment_seq().await.max(seq_floor);

            if parts.is_none() || encoded_for != fs {
                for (i, event) in events.iter_mut().enumerate() {
                    event.seq = fs + i as u64;
                }
                // Stamping preserves input order, so (ts, seq) is now
                // sorted end to end.
                parts = Some(self.encode_batch(&events)?);
                encoded_for = fs;
            }
            let prepared = parts.as_mut().expect("parts prepared above");

            for (idx, part) in prepared.iter_mut().enumerate() {
                let seq = base_seq + idx as u64;
                if part.meta.seq != seq {
                    part.meta.seq = seq;
                    part.meta.path = event_segment_key(&self.config.dataset, seq);
                    part.uploaded = false;
                }
            }

            for part in prepared.iter_mut() {
                if part.uploaded {
                    continue;
                }
                if claimed.contains(&part.meta.path) {
                    self.store
                        .write_atomic(&part.meta.path, part.bytes.clone())
                        .await?;
                    part.uploaded = true;
                    continue;
                }
                match self
                    .store
                    .write_conditional(&part.meta.path, part.bytes.clone(), None)
                    .await
                {
                    Ok(_) => {
                        claimed.insert(part.meta.path.clone());
                        part.uploaded = true;
                    }
                    Err(Error::PreconditionFailed(_)) => {
                        // Another writer owns this seg seq; skip past it.
                        claim_attempts += 1;
                        if claim_attempts > MAX_CLAIM_ATTEMPTS {
                            let _ = self.manifest.reload().await;
                            return Err(Error::Conflict(format!(
                                "could not claim a segment key after {MAX_CLAIM_ATTEMPTS} attempts"
                            )));
                        }
                        debug!(
                            dataset = %self.config.dataset,
                            seq = part.meta.seq,
                            "segment key already claimed; advancing"
                        );
                        seq_floor = part.meta.seq + 1;
                        continue 'publish;
                    }
                    Err(e) => {
                        let _ = self.manifest.reload().await;
                        return Err(e);
                    }
                }
            }

            for part in prepared.iter() {
                self.manifest.add_segment(part.meta.clone()).await?;
            }

            match self.manifest.save().await {
                Ok(()) => {
                    for part in prepared.iter() {
                        self.bus.emit(Notification::SegmentCreated {
                            seq: part.meta.seq,
                            path: part.meta.path.clone(),
                            rows: part.meta.row_count,
                            bytes: part.meta.size_bytes,
                        });
                    }
                    info!(
                        dataset = %self.config.dataset,
                        events = batch_len,
                        segments = prepared.len(),
                        first_seq = fs,
                        "batch published"
                    );
                    let segments = prepared.iter().map(|p| p.meta.clone()).collect();
                    return Ok(PublishReceipt {
                        segments,
                        first_seq: fs,
                        events: events.len(),
                    });
                }
                Err(Error::ManifestConflict) if save_attempts < self.config.retry.max_retries => {
                    save_attempts += 1;
                    warn!(
                        dataset = %self.config.dataset,
                        attempt = save_attempts,
                        "manifest conflict during publish; rebasing"
                    );
                    // The manager reloaded; our reservation is gone.
                    first_seq = None;
                    tokio::time::sleep(self.config.retry.backoff(save_attempts - 1)).await;
                }
                Err(e) => {
                    let _ = self.manifest.reload().await;
                    return Err(e);
                }
            }
        }
    }

    fn encode_batch(&self, events: &[ChangeEvent]) -> Result<Vec<PreparedSegment>> {
        let mut prepared = Vec::new();
        for chunk in self.split_batch(events) {
            let mut encoder = SegmentEncoder::new(
                event_schema(),
                self.config.default_compression,
                self.config.segment.row_group_rows,
            );
            for event in chunk {
                encoder.push_row(event_to_row(event))?;
            }
            let encoded = encoder.finish()?;

            // seq and path are assigned when the publish loop rebases
            // onto the current manifest counters.
            let meta = SegmentMeta {
                seq: 0,
                path: String::new(),
                min_ts: chunk.first().map(|e| e.ts).unwrap_or(Timestamp::ZERO),
                max_ts: chunk.last().map(|e| e.ts).unwrap_or(Timestamp::ZERO),
                min_seq: chunk.first().map(|e| e.seq),
                max_seq: chunk.last().map(|e| e.seq),
                row_count: encoded.row_count(),
                size_bytes: encoded.size_bytes(),
                created_at: Timestamp::now(),
                extra: Map::new(),
            };
            prepared.push(PreparedSegment {
                meta,
                bytes: encoded.bytes,
                uploaded: false,
            });
        }
        Ok(prepared)
    }

    /// Split a sorted batch along the soft segment caps.
    fn split_batch<'a>(&self, events: &'a [ChangeEvent]) -> Vec<&'a [ChangeEvent]> {
        let target_rows = self.config.segment.target_rows.max(1);
        let target_bytes = self.config.segment.target_bytes.max(1);

        let mut chunks = Vec::new();
        let mut start = 0usize;
        let mut chunk_bytes = 0usize;
        for (i, event) in events.iter().enumerate() {
            let estimate = estimate_event_bytes(event);
            let rows_in_chunk = i - start;
            if rows_in_chunk > 0
                && (rows_in_chunk >= target_rows || chunk_bytes + estimate > target_bytes)
            {
                chunks.push(&events[start..i]);
                start = i;
                chunk_bytes = 0;
            }
            chunk_bytes += estimate;
        }
        chunks.push(&events[start..]);
        chunks
    }
}

fn estimate_event_bytes(event: &ChangeEvent) -> usize {
    let maps = [&event.before, &event.after, &event.actor, &event.metadata];
    let map_bytes: usize = maps
        .iter()
        .filter_map(|m| m.as_ref())
        .map(|m| serde_json::to_vec(m).map(|v| v.len()).unwrap_or(0))
        .sum();
    event.id.len() + event.target.len() + 32 + map_bytes
}
