//! Pure-Rust redb storage backend, the default.
//!
//! redb uses a copy-on-write B-tree with serializable write transactions, so
//! a batch commit is a single write transaction: conditional checks and
//! writes see the same state, and an aborted transaction leaves no trace.
//! Blocking redb calls are offloaded to the Tokio blocking thread pool.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use redb::{Database, ReadableTable, TableDefinition};

use crate::{StorageBackend, StorageError, WriteBatch, WriteMode};

/// The single table used for all key-value data.
/// Key namespacing is handled by the repository.
const DATA_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("data");

/// A storage backend backed by redb (pure Rust, B-tree based).
///
/// Thread-safe via `Arc<Database>`.
///
/// # Examples
///
/// ```no_run
/// # use envstore_storage::RedbBackend;
/// let backend = RedbBackend::open("/var/lib/envstore/envstore.redb").unwrap();
/// ```
#[derive(Clone)]
pub struct RedbBackend {
    db: Arc<Database>,
    path: PathBuf,
}

impl std::fmt::Debug for RedbBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedbBackend")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

fn txn_err(e: impl std::fmt::Display) -> StorageError {
    StorageError::Transaction {
        reason: e.to_string(),
    }
}

fn table_err(e: impl std::fmt::Display) -> StorageError {
    StorageError::MissingTable {
        name: format!("data: {e}"),
    }
}

impl RedbBackend {
    /// Open or create a redb database at the given path.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Open`] if redb fails to open or create the
    /// database file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref();
        let db = Database::create(path).map_err(|e| StorageError::Open {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;

        // Opening the table in a write txn creates it if missing.
        let txn = db.begin_write().map_err(txn_err)?;
        {
            let _table = txn.open_table(DATA_TABLE).map_err(table_err)?;
        }
        txn.commit().map_err(txn_err)?;

        tracing::debug!(path = %path.display(), "opened redb storage");

        Ok(Self {
            db: Arc::new(db),
            path: path.to_path_buf(),
        })
    }
}

#[async_trait::async_trait]
impl StorageBackend for RedbBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let db = Arc::clone(&self.db);
        let key = key.to_owned();
        tokio::task::spawn_blocking(move || {
            let txn = db.begin_read().map_err(txn_err)?;
            let table = txn.open_table(DATA_TABLE).map_err(table_err)?;
            let result = table
                .get(key.as_str())
                .map_err(|e| StorageError::Read {
                    key: key.clone(),
                    reason: e.to_string(),
                })?
                .map(|v| v.value().to_vec());
            Ok(result)
        })
        .await
        .map_err(|e| StorageError::Read {
            key: String::new(),
            reason: format!("blocking task panicked: {e}"),
        })?
    }

    async fn get_many(&self, keys: &[String]) -> Result<BTreeMap<String, Vec<u8>>, StorageError> {
        let db = Arc::clone(&self.db);
        let keys = keys.to_vec();
        tokio::task::spawn_blocking(move || {
            // One read transaction = one snapshot for every key.
            let txn = db.begin_read().map_err(txn_err)?;
            let table = txn.open_table(DATA_TABLE).map_err(table_err)?;
            let mut found = BTreeMap::new();
            for key in keys {
                let value = table
                    .get(key.as_str())
                    .map_err(|e| StorageError::Read {
                        key: key.clone(),
                        reason: e.to_string(),
                    })?
                    .map(|v| v.value().to_vec());
                if let Some(value) = value {
                    found.insert(key, value);
                }
            }
            Ok(found)
        })
        .await
        .map_err(|e| StorageError::Read {
            key: String::new(),
            reason: format!("blocking task panicked: {e}"),
        })?
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let db = Arc::clone(&self.db);
        let prefix = prefix.to_owned();
        tokio::task::spawn_blocking(move || {
            let txn = db.begin_read().map_err(txn_err)?;
            let table = txn.open_table(DATA_TABLE).map_err(table_err)?;

            let mut keys = Vec::new();
            let range = table
                .range(prefix.as_str()..)
                .map_err(|e| StorageError::List {
                    prefix: prefix.clone(),
                    reason: e.to_string(),
                })?;
            for item in range {
                let (k, _) = item.map_err(|e| StorageError::List {
                    prefix: prefix.clone(),
                    reason: e.to_string(),
                })?;
                let key_str = k.value();
                if !key_str.starts_with(&prefix) {
                    break;
                }
                keys.push(key_str.to_owned());
            }
            Ok(keys)
        })
        .await
        .map_err(|e| StorageError::List {
            prefix: String::new(),
            reason: format!("blocking task panicked: {e}"),
        })?
    }

    async fn commit(&self, batch: WriteBatch) -> Result<(), StorageError> {
        if batch.is_empty() {
            return Ok(());
        }

        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || {
            let txn = db.begin_write().map_err(txn_err)?;
            let taken = {
                let mut table = txn.open_table(DATA_TABLE).map_err(table_err)?;

                let mut taken = Vec::new();
                for op in batch.ops() {
                    if op.mode != WriteMode::Insert {
                        continue;
                    }
                    let present = table
                        .get(op.key.as_str())
                        .map_err(|e| StorageError::Read {
                            key: op.key.clone(),
                            reason: e.to_string(),
                        })?
                        .is_some();
                    if present {
                        taken.push(op.key.clone());
                    }
                }

                if taken.is_empty() {
                    for op in batch.ops() {
                        table
                            .insert(op.key.as_str(), op.value.as_slice())
                            .map_err(|e| StorageError::Write {
                                key: op.key.clone(),
                                reason: e.to_string(),
                            })?;
                    }
                }
                taken
            };

            if !taken.is_empty() {
                txn.abort().map_err(txn_err)?;
                return Err(StorageError::KeyExists { keys: taken });
            }

            txn.commit().map_err(txn_err)?;
            Ok(())
        })
        .await
        .map_err(|e| StorageError::Transaction {
            reason: format!("blocking task panicked: {e}"),
        })?
    }
}
