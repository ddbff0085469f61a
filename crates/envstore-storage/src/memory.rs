//! In-memory storage backend for testing and development.
//!
//! This backend stores all data in a `BTreeMap` behind a `RwLock`. It is not
//! persistent; all data is lost when the process exits. A batch commit
//! holds the write lock for its whole duration, which makes the conditional
//! check and the writes a single atomic step.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::{StorageBackend, StorageError, WriteBatch};

/// An in-memory storage backend backed by a `BTreeMap`.
///
/// Thread-safe and async-compatible. Clones share the same data.
///
/// # Examples
///
/// ```
/// # use envstore_storage::{MemoryBackend, StorageBackend, WriteBatch};
/// # #[tokio::main]
/// # async fn main() {
/// let backend = MemoryBackend::new();
/// let mut batch = WriteBatch::new();
/// batch.insert("vars/p/dev/PORT", b"8080".to_vec());
/// backend.commit(batch).await.unwrap();
/// let val = backend.get("vars/p/dev/PORT").await.unwrap();
/// assert_eq!(val, Some(b"8080".to_vec()));
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct MemoryBackend {
    data: Arc<RwLock<BTreeMap<String, Vec<u8>>>>,
}

impl MemoryBackend {
    /// Create a new empty in-memory backend.
    #[must_use]
    pub fn new() -> Self {
        Self {
            data: Arc::new(RwLock::new(BTreeMap::new())),
        }
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl StorageBackend for MemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let data = self.data.read().await;
        Ok(data.get(key).cloned())
    }

    async fn get_many(&self, keys: &[String]) -> Result<BTreeMap<String, Vec<u8>>, StorageError> {
        let data = self.data.read().await;
        let found = keys
            .iter()
            .filter_map(|k| data.get(k).map(|v| (k.clone(), v.clone())))
            .collect();
        Ok(found)
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let data = self.data.read().await;
        let keys = data
            .range(prefix.to_owned()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect();
        Ok(keys)
    }

    async fn commit(&self, batch: WriteBatch) -> Result<(), StorageError> {
        let mut data = self.data.write().await;

        let taken: Vec<String> = batch
            .insert_keys()
            .filter(|k| data.contains_key(*k))
            .map(str::to_owned)
            .collect();
        if !taken.is_empty() {
            return Err(StorageError::KeyExists { keys: taken });
        }

        for op in batch.into_ops() {
            data.insert(op.key, op.value);
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    async fn seed(backend: &MemoryBackend, entries: &[(&str, &[u8])]) {
        let mut batch = WriteBatch::new();
        for (k, v) in entries {
            batch.upsert(*k, v.to_vec());
        }
        backend.commit(batch).await.unwrap();
    }

    #[tokio::test]
    async fn get_nonexistent_returns_none() {
        let backend = MemoryBackend::new();
        let result = backend.get("does/not/exist").await.unwrap();
        assert_eq!(result, None);
    }

    #[tokio::test]
    async fn commit_then_get_roundtrip() {
        let backend = MemoryBackend::new();
        seed(&backend, &[("vars/p/dev/A", b"hello")]).await;
        let val = backend.get("vars/p/dev/A").await.unwrap();
        assert_eq!(val, Some(b"hello".to_vec()));
    }

    #[tokio::test]
    async fn upsert_overwrites_existing() {
        let backend = MemoryBackend::new();
        seed(&backend, &[("key", b"v1")]).await;
        seed(&backend, &[("key", b"v2")]).await;
        let val = backend.get("key").await.unwrap();
        assert_eq!(val, Some(b"v2".to_vec()));
    }

    #[tokio::test]
    async fn insert_on_existing_key_rejects_whole_batch() {
        let backend = MemoryBackend::new();
        seed(&backend, &[("b", b"old")]).await;

        let mut batch = WriteBatch::new();
        batch.insert("a", b"1".to_vec());
        batch.insert("b", b"2".to_vec());
        batch.upsert("c", b"3".to_vec());
        let err = backend.commit(batch).await.unwrap_err();

        assert!(matches!(err, StorageError::KeyExists { ref keys } if keys == &["b"]));
        assert_eq!(backend.get("a").await.unwrap(), None);
        assert_eq!(backend.get("b").await.unwrap(), Some(b"old".to_vec()));
        assert_eq!(backend.get("c").await.unwrap(), None);
    }

    #[tokio::test]
    async fn get_many_returns_only_present_keys() {
        let backend = MemoryBackend::new();
        seed(&backend, &[("a", b"1"), ("c", b"3")]).await;

        let found = backend
            .get_many(&["a".to_owned(), "b".to_owned(), "c".to_owned()])
            .await
            .unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(found.get("a"), Some(&b"1".to_vec()));
        assert!(!found.contains_key("b"));
    }

    #[tokio::test]
    async fn list_with_prefix() {
        let backend = MemoryBackend::new();
        seed(
            &backend,
            &[
                ("vars/p/dev/A", b"1"),
                ("vars/p/dev/B", b"2"),
                ("vars/p/prod/A", b"3"),
                ("vars/q/dev/A", b"4"),
            ],
        )
        .await;

        let keys = backend.list("vars/p/dev/").await.unwrap();
        assert_eq!(keys, vec!["vars/p/dev/A", "vars/p/dev/B"]);
    }

    #[tokio::test]
    async fn list_no_matches_returns_empty() {
        let backend = MemoryBackend::new();
        seed(&backend, &[("sys/config", b"1")]).await;
        let keys = backend.list("vars/").await.unwrap();
        assert!(keys.is_empty());
    }

    #[tokio::test]
    async fn empty_batch_is_noop() {
        let backend = MemoryBackend::new();
        backend.commit(WriteBatch::new()).await.unwrap();
        assert!(backend.list("").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn clone_shares_state() {
        let backend = MemoryBackend::new();
        let clone = backend.clone();
        seed(&backend, &[("key", b"val")]).await;
        let val = clone.get("key").await.unwrap();
        assert_eq!(val, Some(b"val".to_vec()));
    }
}
