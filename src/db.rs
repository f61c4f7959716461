//! Embeddable event store facade.
//!
//! Wires the object store, manifest manager, writer, reader and
//! compactor together behind one handle, the way an embedding
//! application consumes the storage core.

use crate::compactor::{needs_compaction, CompactionOptions, CompactionSummary, Compactor};
use crate::collector::StateCollector;
use crate::config::StoreConfig;
use crate::core::event::ChangeEvent;
use crate::core::state::{EntityState, RelationshipState};
use crate::core::temporal::Timestamp;
use crate::error::Result;
use crate::log::predicate::ScanPredicate;
use crate::log::reader::{EventReader, ScanRange};
use crate::log::writer::{EventWriter, PublishReceipt};
use crate::manifest::{Manifest, ManifestManager};
use crate::observe::{ObserverBus, StoreObserver};
use crate::store::{LocalStore, MemoryStore, ObjectStore};
use std::path::Path;
use std::sync::Arc;

/// Event-sourced document store over columnar segments.
pub struct EventStore {
    store: Arc<dyn ObjectStore>,
    config: StoreConfig,
    manifest: Arc<ManifestManager>,
    bus: Arc<ObserverBus>,
    writer: EventWriter,
    reader: EventReader,
    compactor: Compactor,
}

impl EventStore {
    /// Open a store over any object-store backend.
    pub async fn open(store: Arc<dyn ObjectStore>, config: StoreConfig) -> Result<Self> {
        config.validate()?;
        let manifest = Arc::new(ManifestManager::load(store.clone(), &config.dataset).await?);
        let bus = Arc::new(ObserverBus::new());

        let writer = EventWriter::new(store.clone(), manifest.clone(), config.clone(), bus.clone());
        let reader = EventReader::new(store.clone(), manifest.clone(), config.clone(), bus.clone());
        let compactor = Compactor::new(store.clone(), manifest.clone(), config.clone(), bus.clone());

        Ok(Self {
            store,
            config,
            manifest,
            bus,
            writer,
            reader,
            compactor,
        })
    }

    /// Ephemeral store for tests and experiments.
    pub async fn in_memory(dataset: &str) -> Result<Self> {
        Self::open(Arc::new(MemoryStore::new()), StoreConfig::new(dataset)).await
    }

    /// Store rooted at a local directory.
    pub async fn local(root: impl AsRef<Path>, config: StoreConfig) -> Result<Self> {
        Self::open(Arc::new(LocalStore::new(root)?), config).await
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn object_store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    /// Register an observer for lifecycle notifications.
    pub fn subscribe(&self, observer: Arc<dyn StoreObserver>) {
        self.bus.subscribe(observer);
    }

    /// Publish a batch of events; see [`EventWriter::publish`].
    pub async fn publish(&self, events: Vec<ChangeEvent>) -> Result<PublishReceipt> {
        self.writer.publish(events).await
    }

    /// Time-range scan in `(ts, seq)` order.
    pub async fn scan(
        &self,
        range: ScanRange,
        predicate: Option<&ScanPredicate>,
        projection: Option<&[&str]>,
    ) -> Result<Vec<ChangeEvent>> {
        self.reader.scan(range, predicate, projection).await
    }

    /// Ordered tail of events with `seq > after`.
    pub async fn scan_after_seq(&self, after: u64) -> Result<Vec<ChangeEvent>> {
        self.reader.scan_after_seq(after).await
    }

    /// Fold the whole live log into current state tables.
    pub async fn collect_state(&self) -> Result<StateCollector> {
        let events = self.reader.scan(ScanRange::all(), None, None).await?;
        let mut collector = StateCollector::new();
        for event in &events {
            collector.process(event);
        }
        Ok(collector)
    }

    /// Run a compaction through `through`.
    pub async fn compact(
        &self,
        through: Timestamp,
        options: CompactionOptions,
    ) -> Result<CompactionSummary> {
        self.compactor.compact(through, options).await
    }

    /// Policy predicate over the current manifest.
    pub async fn needs_compaction(&self) -> bool {
        let manifest = self.manifest.snapshot().await;
        needs_compaction(&manifest, &self.config.compaction, Timestamp::now())
    }

    /// Read back the snapshot written at a cutoff.
    pub async fn read_snapshot(
        &self,
        through: Timestamp,
    ) -> Result<(Vec<EntityState>, Vec<RelationshipState>)> {
        self.compactor.read_snapshot(through).await
    }

    /// Consistent clone of the current manifest.
    pub async fn manifest(&self) -> Manifest {
        self.manifest.snapshot().await
    }
}
