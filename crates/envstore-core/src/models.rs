//! Variable data models.
//!
//! Request and result types exchanged with callers, plus the record format
//! each row is persisted as. Plaintext values never appear in `Debug`
//! output.

use std::collections::HashSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::cipher::SealedValue;
use crate::error::{CreateError, RepositoryError};

// ── Requests ─────────────────────────────────────────────────────────

/// A `(key, value)` pair proposed for creation.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Variable {
    pub key: String,
    pub value: String,
}

impl Variable {
    #[must_use]
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

impl fmt::Debug for Variable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Variable")
            .field("key", &self.key)
            .field("value", &"[REDACTED]")
            .finish()
    }
}

/// One create call: every variable written to every environment.
///
/// Deserializes from the camelCase form payload
/// (`environmentIds`, `variables`, `isSecret`, `override`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRequest {
    /// A single id is accepted in place of a list.
    #[serde(deserialize_with = "one_or_many")]
    pub environment_ids: Vec<String>,
    pub variables: Vec<Variable>,
    /// Applies to the whole batch.
    #[serde(default)]
    pub is_secret: bool,
    /// Batch-wide: overwrite existing rows instead of rejecting them.
    #[serde(default, rename = "override")]
    pub allow_override: bool,
}

impl CreateRequest {
    /// Environment ids with empty entries dropped and duplicates collapsed,
    /// in order of first appearance.
    #[must_use]
    pub fn environment_scope(&self) -> Vec<&str> {
        let mut seen = HashSet::new();
        self.environment_ids
            .iter()
            .map(String::as_str)
            .filter(|id| !id.is_empty() && seen.insert(*id))
            .collect()
    }
}

fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(id) => vec![id],
        OneOrMany::Many(ids) => ids,
    })
}

// ── Results ──────────────────────────────────────────────────────────

/// Row counts for a successful create.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CreateSummary {
    pub inserted: usize,
    pub overwritten: usize,
}

impl CreateSummary {
    #[must_use]
    pub fn rows(&self) -> usize {
        self.inserted.saturating_add(self.overwritten)
    }
}

/// Outcome of [`VariableRepository::create`](crate::VariableRepository::create).
pub type CreateResult = Result<CreateSummary, CreateError>;

/// A stored variable, with its value opened if it was sealed.
#[derive(Clone, PartialEq, Eq)]
pub struct StoredVariable {
    pub project_id: String,
    pub environment_id: String,
    pub key: String,
    pub value: String,
    pub is_secret: bool,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl fmt::Debug for StoredVariable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoredVariable")
            .field("project_id", &self.project_id)
            .field("environment_id", &self.environment_id)
            .field("key", &self.key)
            .field("value", &"[REDACTED]")
            .field("is_secret", &self.is_secret)
            .field("version", &self.version)
            .field("created_at", &self.created_at)
            .field("updated_at", &self.updated_at)
            .finish()
    }
}

/// A listing row. Secret values are withheld.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VariableSummary {
    pub key: String,
    pub is_secret: bool,
    /// `None` when the variable is secret.
    pub value: Option<String>,
    pub version: u64,
    pub updated_at: DateTime<Utc>,
}

// ── Persisted records ────────────────────────────────────────────────

/// The value half of a persisted row.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub(crate) enum StoredValue {
    Plain { text: String },
    /// Base64 of the sealed bytes.
    Sealed { ciphertext: String },
}

impl StoredValue {
    pub(crate) fn sealed(value: &SealedValue) -> Self {
        Self::Sealed {
            ciphertext: value.to_base64(),
        }
    }

    pub(crate) fn is_secret(&self) -> bool {
        matches!(self, Self::Sealed { .. })
    }
}

impl fmt::Debug for StoredValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Plain { text } => write!(f, "Plain({} bytes)", text.len()),
            Self::Sealed { ciphertext } => write!(f, "Sealed({} chars)", ciphertext.len()),
        }
    }
}

/// The JSON document stored at a variable's path.
#[derive(Clone, Serialize, Deserialize)]
pub(crate) struct StoredRecord {
    pub key: String,
    pub value: StoredValue,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl StoredRecord {
    pub(crate) fn encode(&self, path: &str) -> Result<Vec<u8>, RepositoryError> {
        serde_json::to_vec(self).map_err(|e| RepositoryError::CorruptRecord {
            path: path.to_owned(),
            reason: e.to_string(),
        })
    }

    pub(crate) fn decode(path: &str, bytes: &[u8]) -> Result<Self, RepositoryError> {
        serde_json::from_slice(bytes).map_err(|e| RepositoryError::CorruptRecord {
            path: path.to_owned(),
            reason: e.to_string(),
        })
    }
}

/// Storage prefix for every variable of one environment, ending in `/`.
pub(crate) fn environment_prefix(project_id: &str, environment_id: &str) -> String {
    format!(
        "vars/{}/{}/",
        urlencoding::encode(project_id),
        urlencoding::encode(environment_id)
    )
}

/// Storage path of one variable.
pub(crate) fn variable_path(project_id: &str, environment_id: &str, key: &str) -> String {
    let mut path = environment_prefix(project_id, environment_id);
    path.push_str(&urlencoding::encode(key));
    path
}
