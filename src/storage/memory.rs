//! In-memory object store.
//!
//! Buckets are held in a `tokio::sync::RwLock<HashMap<...>>` of ordered
//! maps, so listings come back in key order.  Read and write calls are
//! counted, which lets callers assert that a run touched nothing.

use bytes::Bytes;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};

use super::backend::ObjectStore;
use crate::errors::ObjectNotFound;

/// Call counters for a [`MemoryStore`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AccessCounts {
    pub lists: u64,
    pub reads: u64,
    pub writes: u64,
}

/// Object store backed by process memory.
#[derive(Default)]
pub struct MemoryStore {
    /// bucket -> (object name -> data).
    buckets: tokio::sync::RwLock<HashMap<String, BTreeMap<String, Bytes>>>,
    lists: AtomicU64,
    reads: AtomicU64,
    writes: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an object without counting it as a write.
    pub async fn insert(&self, bucket: &str, name: &str, data: impl Into<Bytes>) {
        let mut buckets = self.buckets.write().await;
        buckets
            .entry(bucket.to_string())
            .or_default()
            .insert(name.to_string(), data.into());
    }

    /// Current contents of an object, without counting it as a read.
    pub async fn snapshot(&self, bucket: &str, name: &str) -> Option<Bytes> {
        let buckets = self.buckets.read().await;
        buckets.get(bucket).and_then(|b| b.get(name)).cloned()
    }

    pub fn access_counts(&self) -> AccessCounts {
        AccessCounts {
            lists: self.lists.load(Ordering::Relaxed),
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
        }
    }
}

impl ObjectStore for MemoryStore {
    fn list(
        &self,
        bucket: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Vec<String>>> + Send + '_>> {
        let bucket = bucket.to_string();
        Box::pin(async move {
            self.lists.fetch_add(1, Ordering::Relaxed);
            let buckets = self.buckets.read().await;
            Ok(buckets
                .get(&bucket)
                .map(|objects| objects.keys().cloned().collect())
                .unwrap_or_default())
        })
    }

    fn read(
        &self,
        bucket: &str,
        name: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Bytes>> + Send + '_>> {
        let bucket = bucket.to_string();
        let name = name.to_string();
        Box::pin(async move {
            self.reads.fetch_add(1, Ordering::Relaxed);
            let buckets = self.buckets.read().await;
            match buckets.get(&bucket).and_then(|b| b.get(&name)) {
                Some(data) => Ok(data.clone()),
                None => Err(ObjectNotFound { bucket, name }.into()),
            }
        })
    }

    fn write(
        &self,
        bucket: &str,
        name: &str,
        data: Bytes,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        let bucket = bucket.to_string();
        let name = name.to_string();
        Box::pin(async move {
            self.writes.fetch_add(1, Ordering::Relaxed);
            let mut buckets = self.buckets.write().await;
            buckets.entry(bucket).or_default().insert(name, data);
            Ok(())
        })
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_list_in_key_order() {
        let store = MemoryStore::new();
        store.insert("b", "z/meta.json", "1").await;
        store.insert("b", "a/meta.json", "2").await;
        store.insert("other", "m/meta.json", "3").await;

        let names = store.list("b").await.unwrap();
        assert_eq!(names, vec!["a/meta.json", "z/meta.json"]);
        assert!(store.list("missing").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_read_write_roundtrip_and_counts() {
        let store = MemoryStore::new();
        store
            .write("b", "x/meta.json", Bytes::from_static(b"hello"))
            .await
            .unwrap();
        assert_eq!(store.read("b", "x/meta.json").await.unwrap(), "hello");
        assert_eq!(
            store.access_counts(),
            AccessCounts {
                lists: 0,
                reads: 1,
                writes: 1
            }
        );
    }

    #[tokio::test]
    async fn test_read_missing_is_not_found() {
        let store = MemoryStore::new();
        let err = store.read("b", "nope").await.unwrap_err();
        assert!(err.downcast_ref::<ObjectNotFound>().is_some());
    }

    #[tokio::test]
    async fn test_seeding_is_not_counted() {
        let store = MemoryStore::new();
        store.insert("b", "k", "v").await;
        assert_eq!(store.snapshot("b", "k").await.unwrap(), "v");
        assert_eq!(store.access_counts(), AccessCounts::default());
    }
}
