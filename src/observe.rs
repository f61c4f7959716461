//! Observation bus: typed lifecycle notifications.
//!
//! Dispatch is synchronous with the emitting operation and strictly
//! fire-and-forget: a panicking observer is caught, logged, and never
//! propagated into a storage operation. Within one operation the
//! delivery order follows emission order; nothing is promised across
//! operations.

use crate::core::temporal::Timestamp;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, RwLock};
use tracing::warn;

/// Typed notification emitted by the storage core.
#[derive(Debug, Clone)]
pub enum Notification {
    WriteStarted {
        dataset: String,
        rows: usize,
    },
    WriteCompleted {
        dataset: String,
        rows: usize,
        bytes: u64,
        elapsed_ms: u64,
    },
    WriteFailed {
        dataset: String,
        error: String,
    },
    SegmentCreated {
        seq: u64,
        path: String,
        rows: u64,
        bytes: u64,
    },
    SegmentRetired {
        seq: u64,
        path: String,
    },
    SegmentQuarantined {
        path: String,
        reason: String,
    },
    CompactionStarted {
        dataset: String,
        through: Timestamp,
    },
    CompactionCompleted {
        dataset: String,
        through: Timestamp,
        events_folded: u64,
        segments_retired: usize,
    },
    CompactionFailed {
        dataset: String,
        through: Timestamp,
        error: String,
    },
    /// Sampled when a reader captures its manifest snapshot
    ConsistencyLag {
        dataset: String,
        lag_ms: i64,
    },
    /// Bytes fetched from the object store by a reader; `page_bytes`
    /// excludes the footer and magic regions
    BytesRead {
        path: String,
        bytes: u64,
        page_bytes: u64,
    },
}

/// Receiver of core notifications.
pub trait StoreObserver: Send + Sync {
    fn notify(&self, notification: &Notification);
}

/// Fan-out of notifications to registered observers.
#[derive(Default)]
pub struct ObserverBus {
    observers: RwLock<Vec<Arc<dyn StoreObserver>>>,
}

impl ObserverBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, observer: Arc<dyn StoreObserver>) {
        self.observers
            .write()
            .expect("observer bus lock poisoned")
            .push(observer);
    }

    pub fn emit(&self, notification: Notification) {
        let observers = self
            .observers
            .read()
            .expect("observer bus lock poisoned")
            .clone();
        for observer in observers {
            let result = catch_unwind(AssertUnwindSafe(|| observer.notify(&notification)));
            if result.is_err() {
                warn!(?notification, "observer panicked; notification dropped");
            }
        }
    }
}
