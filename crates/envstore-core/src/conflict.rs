//! Conflict detection between a proposed batch and stored rows.

use std::collections::{BTreeMap, BTreeSet};

use crate::error::{ConflictError, KeyConflict};

/// A key scoped to one environment. Comparison is case-sensitive.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ScopedKey {
    pub environment_id: String,
    pub key: String,
}

impl ScopedKey {
    #[must_use]
    pub fn new(environment_id: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            environment_id: environment_id.into(),
            key: key.into(),
        }
    }
}

/// Decides whether a proposed batch may be written over existing rows.
///
/// Override is a batch-wide intent, so the decision is one set
/// intersection rather than a per-row choice.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConflictResolver;

impl ConflictResolver {
    /// Intersect `existing` with `proposed`.
    ///
    /// An empty intersection always succeeds. A non-empty one succeeds only
    /// with `allow_override`.
    ///
    /// # Errors
    ///
    /// Returns [`ConflictError`] with one entry per colliding key (sorted by
    /// key), each listing every environment it collides in.
    pub fn resolve(
        existing: &BTreeSet<ScopedKey>,
        proposed: &BTreeSet<ScopedKey>,
        allow_override: bool,
    ) -> Result<(), ConflictError> {
        if allow_override {
            return Ok(());
        }

        let mut by_key: BTreeMap<&str, Vec<String>> = BTreeMap::new();
        for pair in existing.intersection(proposed) {
            by_key
                .entry(pair.key.as_str())
                .or_default()
                .push(pair.environment_id.clone());
        }

        if by_key.is_empty() {
            return Ok(());
        }

        // BTreeSet iteration is ordered by (environment_id, key), so each
        // environment list is already sorted.
        let conflicts = by_key
            .into_iter()
            .map(|(key, environment_ids)| KeyConflict {
                key: key.to_owned(),
                environment_ids,
            })
            .collect();

        Err(ConflictError { conflicts })
    }
}
