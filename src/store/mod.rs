//! Object store abstraction: byte-addressed, optionally conditional
//! key/value persistence over a flat string keyspace.

pub mod local;
pub mod memory;

pub use local::LocalStore;
pub use memory::MemoryStore;

use crate::error::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;

/// What a backend guarantees beyond the baseline contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// Range reads do not require buffering the whole object
    pub streamable: bool,
    /// Large objects may be uploaded in parts
    pub multipart: bool,
    /// `write_conditional` honors `if_match`/`if_none_match` across writers
    pub transactional: bool,
}

/// Stamp returned by every successful write.
///
/// Two writes of identical bytes may yield the same etag; writes of
/// different bytes always yield different etags on the same backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutStamp {
    pub etag: String,
    pub size: u64,
}

/// Metadata for a stored object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectStat {
    pub key: String,
    pub size: u64,
    pub etag: String,
}

/// Byte-addressed key/value persistence.
///
/// Keys are flat strings; `/` in a key is a naming convention, not a
/// directory structure, except where `make_dir`/`remove_dir` give a
/// backend the chance to materialize one.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    fn capabilities(&self) -> Capabilities;

    /// Read the entire object.
    async fn read_all(&self, key: &str) -> Result<Bytes>;

    /// Read exactly `end - start` bytes from `[start, end)`.
    ///
    /// Fails with `Unsupported` if the range is out of bounds; a caller
    /// that can tolerate a short tail opts in via
    /// [`read_range_clamped`](ObjectStore::read_range_clamped).
    async fn read_range(&self, key: &str, start: u64, end: u64) -> Result<Bytes>;

    /// Like `read_range` but clamps `end` to the object size.
    async fn read_range_clamped(&self, key: &str, start: u64, end: u64) -> Result<Bytes>;

    /// Write the object, replacing any previous bytes.
    async fn write(&self, key: &str, bytes: Bytes) -> Result<PutStamp>;

    /// Write such that no partial bytes are ever observable at `key`
    /// (temp-key-then-rename or equivalent).
    async fn write_atomic(&self, key: &str, bytes: Bytes) -> Result<PutStamp>;

    /// Compare-and-swap write.
    ///
    /// With `expected_etag = Some(e)` the write succeeds only if the
    /// current etag equals `e`; with `None` it succeeds only if the key
    /// does not exist. Mismatch fails with `PreconditionFailed`.
    async fn write_conditional(
        &self,
        key: &str,
        bytes: Bytes,
        expected_etag: Option<&str>,
    ) -> Result<PutStamp>;

    async fn exists(&self, key: &str) -> Result<bool>;

    async fn stat(&self, key: &str) -> Result<ObjectStat>;

    /// List all keys with the given prefix, in ascending key order.
    async fn list_prefix(&self, prefix: &str) -> Result<Vec<String>>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// Delete every key under `prefix`, returning the count removed.
    ///
    /// An empty prefix is rejected here so a caller bug cannot wipe the
    /// whole keyspace.
    async fn delete_prefix(&self, prefix: &str) -> Result<usize>;

    async fn copy(&self, from: &str, to: &str) -> Result<()>;

    /// Atomically rename `from` to `to`.
    async fn rename(&self, from: &str, to: &str) -> Result<()>;

    /// Append bytes to an existing object, creating it if absent.
    async fn append(&self, key: &str, bytes: Bytes) -> Result<PutStamp>;

    async fn make_dir(&self, key: &str) -> Result<()>;

    async fn remove_dir(&self, key: &str) -> Result<()>;
}

/// Run a store call under a caller-supplied deadline.
///
/// On expiry the operation fails with `Timeout` and the manifest is
/// untouched unless its conditional save had already succeeded.
pub async fn with_deadline<T>(
    deadline: std::time::Duration,
    operation: impl std::future::Future<Output = Result<T>>,
) -> Result<T> {
    match tokio::time::timeout(deadline, operation).await {
        Ok(result) => result,
        Err(_) => Err(Error::Timeout(format!(
            "object store call exceeded {}ms",
            deadline.as_millis()
        ))),
    }
}

pub(crate) fn check_prefix(prefix: &str) -> Result<()> {
    if prefix.is_empty() {
        return Err(Error::Unsupported(
            "refusing delete_prefix with empty prefix".to_string(),
        ));
    }
    Ok(())
}

pub(crate) fn check_range(start: u64, end: u64, size: u64, key: &str) -> Result<()> {
    if start > end {
        return Err(Error::Unsupported(format!(
            "invalid range [{start}, {end}) for {key}"
        )));
    }
    if end > size {
        return Err(Error::Unsupported(format!(
            "range [{start}, {end}) out of bounds for {key} (size {size})"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_with_deadline_maps_to_timeout() {
        let result: Result<()> = with_deadline(std::time::Duration::from_millis(5), async {
            tokio::time::sleep(std::time::Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(Error::Timeout(_))));

        let result = with_deadline(std::time::Duration::from_secs(5), async { Ok(7) }).await;
        assert_eq!(result.unwrap(), 7);
    }

    // Contract tests shared by both backends.
    pub(crate) async fn exercise_store(store: &dyn ObjectStore) {
        // write / read_all
        let stamp = store
            .write("a/one", Bytes::from_static(b"hello world"))
            .await
            .unwrap();
        assert_eq!(stamp.size, 11);
        assert_eq!(store.read_all("a/one").await.unwrap().as_ref(), b"hello world");

        // distinct bytes, distinct etag
        let stamp2 = store
            .write("a/one", Bytes::from_static(b"hello there"))
            .await
            .unwrap();
        assert_ne!(stamp.etag, stamp2.etag);

        // read_range strict
        let r = store.read_range("a/one", 0, 5).await.unwrap();
        assert_eq!(r.as_ref(), b"hello");
        assert!(store.read_range("a/one", 0, 100).await.is_err());
        let clamped = store.read_range_clamped("a/one", 6, 100).await.unwrap();
        assert_eq!(clamped.as_ref(), b"there");

        // stat / exists
        let st = store.stat("a/one").await.unwrap();
        assert_eq!(st.size, 11);
        assert!(store.exists("a/one").await.unwrap());
        assert!(!store.exists("a/missing").await.unwrap());
        assert!(store.stat("a/missing").await.unwrap_err().is_not_found());

        // conditional writes
        let err = store
            .write_conditional("a/one", Bytes::from_static(b"x"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PreconditionFailed(_)));

        let stamp3 = store
            .write_conditional("a/one", Bytes::from_static(b"swapped"), Some(&st.etag))
            .await
            .unwrap();
        assert_ne!(stamp3.etag, st.etag);
        let err = store
            .write_conditional("a/one", Bytes::from_static(b"stale"), Some(&st.etag))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PreconditionFailed(_)));
        assert_eq!(store.read_all("a/one").await.unwrap().as_ref(), b"swapped");

        let created = store
            .write_conditional("a/fresh", Bytes::from_static(b"new"), None)
            .await
            .unwrap();
        assert!(!created.etag.is_empty());

        // atomic write + rename + copy
        store
            .write_atomic("a/two", Bytes::from_static(b"atomic"))
            .await
            .unwrap();
        store.copy("a/two", "a/three").await.unwrap();
        store.rename("a/three", "b/three").await.unwrap();
        assert!(!store.exists("a/three").await.unwrap());
        assert_eq!(store.read_all("b/three").await.unwrap().as_ref(), b"atomic");

        // append
        store.append("a/log", Bytes::from_static(b"one,")).await.unwrap();
        store.append("a/log", Bytes::from_static(b"two")).await.unwrap();
        assert_eq!(store.read_all("a/log").await.unwrap().as_ref(), b"one,two");

        // list / delete_prefix
        let keys = store.list_prefix("a/").await.unwrap();
        assert!(keys.contains(&"a/one".to_string()));
        assert!(keys.contains(&"a/two".to_string()));
        assert!(!keys.contains(&"b/three".to_string()));

        assert!(store.delete_prefix("").await.is_err());
        let removed = store.delete_prefix("a/").await.unwrap();
        assert!(removed >= 4);
        assert!(!store.exists("a/one").await.unwrap());

        // delete
        store.delete("b/three").await.unwrap();
        assert!(store.delete("b/three").await.unwrap_err().is_not_found());
    }
}
