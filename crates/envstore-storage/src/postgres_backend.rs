//! `PostgreSQL` storage backend.
//!
//! Stores all key-value data in a single `kv_store` table whose primary key
//! is the storage key, so the database itself enforces uniqueness. A batch
//! commit runs inside one transaction and writes rows in key order: insert-only
//! writes use `ON CONFLICT DO NOTHING` and any write that affects no row rolls
//! the whole transaction back. A transaction the server aborts to break a
//! deadlock with a foreign writer is retried.
//!
//! Feature-gated behind `postgres-backend`. Uses `sqlx` with the Tokio
//! runtime for fully async operations, so no `spawn_blocking` is needed.

use std::collections::BTreeMap;

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

use crate::{StorageBackend, StorageError, WriteBatch, WriteMode, WriteOp};

/// A storage backend backed by `PostgreSQL`.
///
/// Thread-safe via `PgPool` (connection pool). All operations are fully async.
///
/// # Examples
///
/// ```no_run
/// # use envstore_storage::PostgresBackend;
/// # #[tokio::main]
/// # async fn main() {
/// let backend = PostgresBackend::connect("postgres://localhost/envstore").await.unwrap();
/// # }
/// ```
#[derive(Clone)]
pub struct PostgresBackend {
    pool: PgPool,
}

impl std::fmt::Debug for PostgresBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresBackend")
            .field("pool", &"[PgPool]")
            .finish_non_exhaustive()
    }
}

fn txn_err(e: impl std::fmt::Display) -> StorageError {
    StorageError::Transaction {
        reason: e.to_string(),
    }
}

impl PostgresBackend {
    /// Connect to `PostgreSQL` and create the `kv_store` table if needed.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Open`] if the connection or migration fails.
    pub async fn connect(database_url: &str) -> Result<Self, StorageError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .map_err(|e| StorageError::Open {
                path: "[database url]".to_owned(),
                reason: e.to_string(),
            })?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS kv_store (\
                key   TEXT  PRIMARY KEY, \
                value BYTEA NOT NULL\
            )",
        )
        .execute(&pool)
        .await
        .map_err(|e| StorageError::Open {
            path: "[database url]".to_owned(),
            reason: format!("migration failed: {e}"),
        })?;

        // Prefix index for list operations.
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_kv_store_key_prefix \
             ON kv_store (key text_pattern_ops)",
        )
        .execute(&pool)
        .await
        .map_err(|e| StorageError::Open {
            path: "[database url]".to_owned(),
            reason: format!("index creation failed: {e}"),
        })?;

        Ok(Self { pool })
    }
}

/// Escape `LIKE` metacharacters so a prefix matches literally.
fn like_prefix(prefix: &str) -> String {
    let mut pattern = String::with_capacity(prefix.len().saturating_add(1));
    for c in prefix.chars() {
        if matches!(c, '%' | '_' | '\\') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push('%');
    pattern
}

#[async_trait::async_trait]
impl StorageBackend for PostgresBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let row: Option<(Vec<u8>,)> = sqlx::query_as("SELECT value FROM kv_store WHERE key = $1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StorageError::Read {
                key: key.to_owned(),
                reason: e.to_string(),
            })?;

        Ok(row.map(|(v,)| v))
    }

    async fn get_many(&self, keys: &[String]) -> Result<BTreeMap<String, Vec<u8>>, StorageError> {
        let rows: Vec<(String, Vec<u8>)> =
            sqlx::query_as("SELECT key, value FROM kv_store WHERE key = ANY($1)")
                .bind(keys)
                .fetch_all(&self.pool)
                .await
                .map_err(|e| StorageError::Read {
                    key: format!("{} keys", keys.len()),
                    reason: e.to_string(),
                })?;

        Ok(rows.into_iter().collect())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT key FROM kv_store WHERE key LIKE $1 ESCAPE '\\' ORDER BY key")
                .bind(like_prefix(prefix))
                .fetch_all(&self.pool)
                .await
                .map_err(|e| StorageError::List {
                    prefix: prefix.to_owned(),
                    reason: e.to_string(),
                })?;

        Ok(rows.into_iter().map(|(k,)| k).collect())
    }

    async fn commit(&self, batch: WriteBatch) -> Result<(), StorageError> {
        if batch.is_empty() {
            return Ok(());
        }

        let ops = batch.into_key_order();
        let mut attempt = 1;
        loop {
            match self.apply_batch(&ops).await {
                Ok(()) => return Ok(()),
                Err(CommitFailure::Contended { key, reason }) if attempt < MAX_COMMIT_ATTEMPTS => {
                    tracing::debug!(
                        key = %key,
                        attempt,
                        reason = %reason,
                        "transaction aborted by a concurrent writer, retrying commit"
                    );
                    attempt += 1;
                }
                Err(CommitFailure::Contended { key, reason }) => {
                    return Err(StorageError::Write { key, reason });
                }
                Err(CommitFailure::Failed(e)) => return Err(e),
            }
        }
    }
}

/// Commit attempts before a deadlock or serialization abort is reported as a
/// write failure.
const MAX_COMMIT_ATTEMPTS: u32 = 3;

/// SQLSTATE codes for transactions the server aborted to break a lock cycle.
const DEADLOCK_DETECTED: &str = "40P01";
const SERIALIZATION_FAILURE: &str = "40001";

enum CommitFailure {
    Contended { key: String, reason: String },
    Failed(StorageError),
}

fn is_contention(e: &sqlx::Error) -> bool {
    e.as_database_error()
        .and_then(|db| db.code())
        .is_some_and(|code| code == DEADLOCK_DETECTED || code == SERIALIZATION_FAILURE)
}

impl PostgresBackend {
    /// Run one transaction over `ops`, which must be in key order.
    ///
    /// Each statement locks its row, so key order is lock order. An early
    /// return drops `tx`, which rolls it back.
    async fn apply_batch(&self, ops: &[WriteOp]) -> Result<(), CommitFailure> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| CommitFailure::Failed(txn_err(e)))?;
        let mut taken = Vec::new();

        for op in ops {
            let sql = match op.mode {
                WriteMode::Insert => {
                    "INSERT INTO kv_store (key, value) VALUES ($1, $2) \
                     ON CONFLICT (key) DO NOTHING"
                }
                WriteMode::Upsert => {
                    "INSERT INTO kv_store (key, value) VALUES ($1, $2) \
                     ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value"
                }
            };
            let result = sqlx::query(sql)
                .bind(&op.key)
                .bind(&op.value)
                .execute(&mut *tx)
                .await
                .map_err(|e| {
                    if is_contention(&e) {
                        CommitFailure::Contended {
                            key: op.key.clone(),
                            reason: e.to_string(),
                        }
                    } else {
                        CommitFailure::Failed(StorageError::Write {
                            key: op.key.clone(),
                            reason: e.to_string(),
                        })
                    }
                })?;

            if op.mode == WriteMode::Insert && result.rows_affected() == 0 {
                taken.push(op.key.clone());
            }
        }

        if !taken.is_empty() {
            tx.rollback()
                .await
                .map_err(|e| CommitFailure::Failed(txn_err(e)))?;
            return Err(CommitFailure::Failed(StorageError::KeyExists { keys: taken }));
        }

        tx.commit().await.map_err(|e| {
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
}
