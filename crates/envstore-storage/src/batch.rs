//! Atomic write batches.
//!
//! A [`WriteBatch`] is applied by [`StorageBackend::commit`](crate::StorageBackend::commit)
//! as a single unit: either every operation lands or none does.

use std::fmt;

/// How a single write treats an existing value at the same key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Write only if the key is absent. A present key fails the whole batch
    /// with [`StorageError::KeyExists`](crate::StorageError::KeyExists).
    Insert,
    /// Write unconditionally, replacing any existing value.
    Upsert,
}

/// One key-value write inside a batch.
#[derive(Clone)]
pub struct WriteOp {
    pub key: String,
    pub value: Vec<u8>,
    pub mode: WriteMode,
}

impl fmt::Debug for WriteOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriteOp")
            .field("key", &self.key)
            .field("value_len", &self.value.len())
            .field("mode", &self.mode)
            .finish()
    }
}

/// An ordered set of writes committed atomically.
#[derive(Debug, Clone, Default)]
pub struct WriteBatch {
    ops: Vec<WriteOp>,
}

impl WriteBatch {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a write that fails the batch if `key` already exists.
    pub fn insert(&mut self, key: impl Into<String>, value: Vec<u8>) {
        self.ops.push(WriteOp {
            key: key.into(),
            value,
            mode: WriteMode::Insert,
        });
    }

    /// Queue a write that replaces any existing value at `key`.
    pub fn upsert(&mut self, key: impl Into<String>, value: Vec<u8>) {
        self.ops.push(WriteOp {
            key: key.into(),
            value,
            mode: WriteMode::Upsert,
        });
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    #[must_use]
    pub fn ops(&self) -> &[WriteOp] {
        &self.ops
    }

    #[must_use]
    pub fn into_ops(self) -> Vec<WriteOp> {
        self.ops
    }

    /// Consume the batch, returning its writes sorted by key.
    ///
    /// Backends that take row locks while applying a batch must acquire them
    /// in this order. Two overlapping batches then always lock their shared
    /// keys in the same sequence and wait on each other instead of
    /// deadlocking. The sort is stable.
    #[must_use]
    pub fn into_key_order(self) -> Vec<WriteOp> {
        let mut ops = self.ops;
        ops.sort_by(|a, b| a.key.cmp(&b.key));
        ops
    }

    /// Keys of insert-only operations, in batch order.
    pub fn insert_keys(&self) -> impl Iterator<Item = &str> {
        self.ops
            .iter()
            .filter(|op| op.mode == WriteMode::Insert)
            .map(|op| op.key.as_str())
    }
}
