//! Storage backend abstraction for envstore.
//!
//! This crate defines the [`StorageBackend`] trait: a key-value storage
//! interface that knows nothing about projects, environments, or encryption.
//! The variable repository in `envstore-core` lays rows out as keys and
//! relies on two guarantees from every backend:
//!
//! - keys are unique, so a key is the storage-level uniqueness constraint;
//! - [`StorageBackend::commit`] applies a [`WriteBatch`] atomically and
//!   re-checks insert-only writes inside its own transaction.
//!
//! Four implementations are provided:
//!
//! - [`RedbBackend`]: default, pure-Rust B-tree (feature `redb-backend`)
//! - [`RocksDbBackend`]: `RocksDB` transaction database (feature `rocksdb-backend`)
//! - [`PostgresBackend`]: `PostgreSQL` via sqlx (feature `postgres-backend`)
//! - [`MemoryBackend`]: in-memory, for testing and development

mod batch;
mod error;
mod memory;
#[cfg(feature = "postgres-backend")]
mod postgres_backend;
#[cfg(feature = "redb-backend")]
mod redb_backend;
#[cfg(feature = "rocksdb-backend")]
mod rocksdb_backend;

use std::collections::BTreeMap;

pub use batch::{WriteBatch, WriteMode, WriteOp};
pub use error::StorageError;
pub use memory::MemoryBackend;
#[cfg(feature = "postgres-backend")]
pub use postgres_backend::PostgresBackend;
#[cfg(feature = "redb-backend")]
pub use redb_backend::RedbBackend;
#[cfg(feature = "rocksdb-backend")]
pub use rocksdb_backend::RocksDbBackend;

/// A pluggable key-value storage backend.
///
/// Keys are UTF-8 strings using `/` as a separator (e.g.
/// `vars/my-project/production/DATABASE_URL`). Values are opaque byte arrays.
///
/// Implementations must be safe to share across async tasks (`Send + Sync`).
#[async_trait::async_trait]
pub trait StorageBackend: Send + Sync + 'static {
    /// Retrieve a value by key.
    ///
    /// Returns `Ok(None)` if the key does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Read`] if the underlying backend fails.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    /// Retrieve every present key from `keys` in one consistent read.
    ///
    /// Absent keys are simply missing from the returned map. The default
    /// implementation calls [`get`](StorageBackend::get) per key; backends
    /// with read transactions override it to read from a single snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Read`] if the underlying backend fails.
    async fn get_many(&self, keys: &[String]) -> Result<BTreeMap<String, Vec<u8>>, StorageError> {
        let mut found = BTreeMap::new();
        for key in keys {
            if let Some(value) = self.get(key).await? {
                found.insert(key.clone(), value);
            }
        }
        Ok(found)
    }

    /// List all keys that start with the given prefix, in ascending order.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::List`] if the underlying backend fails.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError>;

    /// Apply every write in `batch` atomically.
    ///
    /// [`WriteMode::Insert`] operations are checked against the stored data
    /// inside the same transaction that performs the writes. If any of them
    /// targets an existing key, nothing is written and
    /// [`StorageError::KeyExists`] lists every such key. Backends that lock
    /// rows take the locks in [`WriteBatch::into_key_order`] order, so
    /// overlapping concurrent batches serialize rather than deadlock.
    /// An empty batch is a no-op.
    ///
    /// # Errors
    ///
    /// - [`StorageError::KeyExists`] if an insert-only key is already present.
    /// - [`StorageError::Write`] or [`StorageError::Transaction`] if the
    ///   backend fails; in that case nothing is written either.
    async fn commit(&self, batch: WriteBatch) -> Result<(), StorageError>;
}
