//! `RocksDB` storage backend.
//!
//! Wraps a pessimistic `RocksDB` transaction database behind the
//! [`StorageBackend`] trait. Batch commits lock every key of the batch with
//! `get_for_update`, in key order, before writing, so two overlapping
//! commits cannot both claim the same key. Lock timeouts are retried a
//! bounded number of times. All operations run on a blocking thread via
//! [`tokio::task::spawn_blocking`].

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rocksdb::{ErrorKind, MultiThreaded, Options, TransactionDB, TransactionDBOptions};

use crate::{StorageBackend, StorageError, WriteBatch, WriteMode, WriteOp};

type Db = TransactionDB<MultiThreaded>;

fn txn_err(e: impl std::fmt::Display) -> StorageError {
    StorageError::Transaction {
        reason: e.to_string(),
    }
}

/// A storage backend backed by a `RocksDB` transaction database.
///
/// Thread-safe (`Arc<TransactionDB>` internally) and safe to share across
/// async tasks.
///
/// # Examples
///
/// ```no_run
/// # use envstore_storage::RocksDbBackend;
/// let backend = RocksDbBackend::open("/var/lib/envstore/data").unwrap();
/// ```
#[derive(Clone)]
pub struct RocksDbBackend {
    db: Arc<Db>,
    path: PathBuf,
}

impl std::fmt::Debug for RocksDbBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RocksDbBackend")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl RocksDbBackend {
    /// Open a `RocksDB` transaction database at the given path.
    ///
    /// Creates the database directory if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Open`] if `RocksDB` fails to open or create the
    /// database at the specified path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref();
        let mut opts = Options::default();
        opts.create_if_missing(true);

        let db = Db::open(&opts, &TransactionDBOptions::default(), path).map_err(|e| {
            StorageError::Open {
                path: path.display().to_string(),
                reason: e.to_string(),
            }
        })?;

        tracing::debug!(path = %path.display(), "opened RocksDB storage");

        Ok(Self {
            db: Arc::new(db),
            path: path.to_path_buf(),
        })
    }
}

#[async_trait::async_trait]
impl StorageBackend for RocksDbBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let db = Arc::clone(&self.db);
        let key = key.to_owned();
        tokio::task::spawn_blocking(move || {
            db.get(key.as_bytes()).map_err(|e| StorageError::Read {
                key,
                reason: e.to_string(),
            })
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
            let snapshot = db.snapshot();
            let mut found = BTreeMap::new();
            for key in keys {
                let value = snapshot
                    .get(key.as_bytes())
                    .map_err(|e| StorageError::Read {
                        key: key.clone(),
                        reason: e.to_string(),
                    })?;
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
            let iter = db.iterator(rocksdb::IteratorMode::From(
                prefix.as_bytes(),
                rocksdb::Direction::Forward,
            ));

            let mut keys = Vec::new();
            for item in iter {
                let (k, _) = item.map_err(|e| StorageError::List {
                    prefix: prefix.clone(),
                    reason: e.to_string(),
                })?;
                let key_str =
                    String::from_utf8(k.to_vec()).map_err(|e| StorageError::InvalidKey {
                        reason: e.to_string(),
                    })?;
                if !key_str.starts_with(&prefix) {
                    break;
                }
                keys.push(key_str);
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
        let ops = batch.into_key_order();
        tokio::task::spawn_blocking(move || {
            let mut attempt = 1;
            loop {
                match apply_batch(&db, &ops) {
                    Ok(()) => return Ok(()),
                    Err(CommitFailure::Contended { key, reason })
                        if attempt < MAX_COMMIT_ATTEMPTS =>
                    {
                        tracing::debug!(
                            key = %key,
                            attempt,
                            reason = %reason,
                            "row lock contended, retrying commit"
                        );
                        attempt += 1;
                    }
                    Err(CommitFailure::Contended { key, reason }) => {
                        return Err(StorageError::Write { key, reason });
                    }
                    Err(CommitFailure::Failed(e)) => return Err(e),
                }
            }
        })
        .await
        .map_err(|e| StorageError::Transaction {
            reason: format!("blocking task panicked: {e}"),
        })?
    }
}

/// Commit attempts before lock contention is reported as a write failure.
const MAX_COMMIT_ATTEMPTS: u32 = 3;

enum CommitFailure {
    /// A lock wait timed out or the transaction was busy. Retryable.
    Contended { key: String, reason: String },
    Failed(StorageError),
}

fn is_contention(e: &rocksdb::Error) -> bool {
    matches!(
        e.kind(),
        ErrorKind::TimedOut | ErrorKind::Busy | ErrorKind::TryAgain
    )
}

/// Run one transaction over `ops`, which must be in key order.
///
/// Every key is locked with `get_for_update` before anything is written.
/// Dropping the transaction on an early return rolls it back.
fn apply_batch(db: &Db, ops: &[WriteOp]) -> Result<(), CommitFailure> {
    let txn = db.transaction();

    let mut taken = Vec::new();
    for op in ops {
        let present = txn
            .get_for_update(op.key.as_bytes(), true)
            .map_err(|e| {
                if is_contention(&e) {
                    CommitFailure::Contended {
                        key: op.key.clone(),
                        reason: e.to_string(),
                    }
                } else {
                    CommitFailure::Failed(StorageError::Read {
                        key: op.key.clone(),
                        reason: e.to_string(),
                    })
                }
            })?
            .is_some();
        if present && op.mode == WriteMode::Insert {
            taken.push(op.key.clone());
        }
    }

    if !taken.is_empty() {
        txn.rollback()
            .map_err(|e| CommitFailure::Failed(txn_err(e)))?;
        return Err(CommitFailure::Failed(StorageError::KeyExists { keys: taken }));
    }

    for op in ops {
        txn.put(op.key.as_bytes(), &op.value).map_err(|e| {
            CommitFailure::Failed(StorageError::Write {
                key: op.key.clone(),
                reason: e.to_string(),
            })
        })?;
    }

    txn.commit().map_err(|e| {
        if is_contention(&e) {
            CommitFailure::Contended {
                key: String::new(),
                reason: e.to_string(),
            }
        } else {
            CommitFailure::Failed(txn_err(e))
        }
    })
}
