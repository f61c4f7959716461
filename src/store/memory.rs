//! In-memory object store for tests and ephemeral datasets

use crate::error::{Error, Result};
use crate::store::{check_prefix, check_range, Capabilities, ObjectStat, ObjectStore, PutStamp};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Clone)]
struct Entry {
    bytes: Bytes,
    etag: String,
}

/// In-memory backend. Etags are a per-store monotonic version counter,
/// so every write observes a fresh etag.
pub struct MemoryStore {
    objects: DashMap<String, Entry>,
    version: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            objects: DashMap::new(),
            version: AtomicU64::new(1),
        }
    }

    fn next_etag(&self) -> String {
        format!("v{}", self.version.fetch_add(1, Ordering::SeqCst))
    }

    fn put(&self, key: &str, bytes: Bytes) -> PutStamp {
        let etag = self.next_etag();
        let size = bytes.len() as u64;
        self.objects.insert(
            key.to_string(),
            Entry {
                bytes,
                etag: etag.clone(),
            },
        );
        PutStamp { etag, size }
    }

    fn get(&self, key: &str) -> Result<Entry> {
        self.objects
            .get(key)
            .map(|e| e.clone())
            .ok_or_else(|| Error::NotFound(key.to_string()))
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    fn capabilities(&self) -> Capabilities {
        Capabilities {
            streamable: false,
            multipart: false,
            transactional: true,
        }
    }

    async fn read_all(&self, key: &str) -> Result<Bytes> {
        Ok(self.get(key)?.bytes)
    }

    async fn read_range(&self, key: &str, start: u64, end: u64) -> Result<Bytes> {
        let entry = self.get(key)?;
        check_range(start, end, entry.bytes.len() as u64, key)?;
        Ok(entry.bytes.slice(start as usize..end as usize))
    }

    async fn read_range_clamped(&self, key: &str, start: u64, end: u64) -> Result<Bytes> {
        let entry = self.get(key)?;
        let size = entry.bytes.len() as u64;
        let end = end.min(size);
        check_range(start, end, size, key)?;
        Ok(entry.bytes.slice(start as usize..end as usize))
    }

    async fn write(&self, key: &str, bytes: Bytes) -> Result<PutStamp> {
        Ok(self.put(key, bytes))
    }

    async fn write_atomic(&self, key: &str, bytes: Bytes) -> Result<PutStamp> {
        // A whole-value insert is already atomic here.
        Ok(self.put(key, bytes))
    }

    async fn write_conditional(
        &self,
        key: &str,
        bytes: Bytes,
        expected_etag: Option<&str>,
    ) -> Result<PutStamp> {
        use dashmap::mapref::entry::Entry as MapEntry;

        let etag = self.next_etag();
        let size = bytes.len() as u64;
        match self.objects.entry(key.to_string()) {
            MapEntry::Occupied(mut occupied) => match expected_etag {
                Some(expected) if occupied.get().etag == expected => {
                    occupied.insert(Entry {
                        bytes,
                        etag: etag.clone(),
                    });
                    Ok(PutStamp { etag, size })
                }
                _ => Err(Error::PreconditionFailed(key.to_string())),
            },
            MapEntry::Vacant(vacant) => match expected_etag {
                None => {
                    vacant.insert(Entry {
                        bytes,
                        etag: etag.clone(),
                    });
                    Ok(PutStamp { etag, size })
                }
                Some(_) => Err(Error::PreconditionFailed(key.to_string())),
            },
        }
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.objects.contains_key(key))
    }

    async fn stat(&self, key: &str) -> Result<ObjectStat> {
        let entry = self.get(key)?;
        Ok(ObjectStat {
            key: key.to_string(),
            size: entry.bytes.len() as u64,
            etag: entry.etag,
        })
    }

    async fn list_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys: Vec<String> = self
            .objects
            .iter()
            .filter(|e| e.key().starts_with(prefix))
            .map(|e| e.key().clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.objects
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| Error::NotFound(key.to_string()))
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<usize> {
        check_prefix(prefix)?;
        let keys: Vec<String> = self
            .objects
            .iter()
            .filter(|e| e.key().starts_with(prefix))
            .map(|e| e.key().clone())
            .collect();
        let mut removed = 0;
        for key in keys {
            if self.objects.remove(&key).is_some() {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn copy(&self, from: &str, to: &str) -> Result<()> {
        let entry = self.get(from)?;
        self.put(to, entry.bytes);
        Ok(())
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        let (_, entry) = self
            .objects
            .remove(from)
            .ok_or_else(|| Error::NotFound(from.to_string()))?;
        self.put(to, entry.bytes);
        Ok(())
    }

    async fn append(&self, key: &str, bytes: Bytes) -> Result<PutStamp> {
        let mut combined = match self.objects.get(key) {
            Some(existing) => existing.bytes.to_vec(),
            None => Vec::new(),
        };
        combined.extend_from_slice(&bytes);
        Ok(self.put(key, Bytes::from(combined)))
    }

    async fn make_dir(&self, _key: &str) -> Result<()> {
        // Flat keyspace: directories are implicit.
        Ok(())
    }

    async fn remove_dir(&self, _key: &str) -> Result<()> {
        Ok(())
    }
}
