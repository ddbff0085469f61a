//! Error types for `envstore-core`.
//!
//! Each error variant carries enough context to diagnose the problem without
//! a debugger. Crypto errors never include key material and no error ever
//! includes a variable value. Messages carry only keys, environment
//! identifiers, or operation descriptions.

use std::fmt;

use envstore_storage::StorageError;

/// Errors from cryptographic operations.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    /// AES-256-GCM encryption failed.
    #[error("encryption failed: {reason}")]
    Encryption { reason: String },

    /// AES-256-GCM decryption failed (wrong key, corrupted ciphertext, or tampered tag).
    #[error("decryption failed: {reason}")]
    Decryption { reason: String },

    /// HKDF key derivation failed.
    #[error("key derivation failed for context '{context}': {reason}")]
    KeyDerivation { context: String, reason: String },

    /// Ciphertext is too short to contain a valid nonce + tag.
    #[error("ciphertext too short: expected at least {expected} bytes, got {actual}")]
    CiphertextTooShort { expected: usize, actual: usize },

    /// Encoded key material could not be decoded into a 256-bit key.
    #[error("invalid key material: {reason}")]
    InvalidKeyMaterial { reason: String },
}

/// Errors from the secret cipher.
#[derive(Debug, thiserror::Error)]
pub enum CipherError {
    /// No key material is loaded, so secrets can be neither sealed nor opened.
    #[error("encryption key is not available")]
    KeyUnavailable,

    /// A cryptographic operation within the cipher failed.
    #[error("cipher crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// An opened value was not valid UTF-8.
    #[error("decrypted value is not valid UTF-8")]
    InvalidUtf8,
}

/// Why a proposed variable key was rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    #[error("key is required")]
    Empty,

    #[error("key must not start with a digit")]
    LeadingDigit,

    /// Only ASCII letters, digits, and `_` are allowed.
    #[error("key contains invalid character {character:?}; use letters, digits, and underscores")]
    InvalidCharacter { character: char },

    #[error("keys starting with '{prefix}' are reserved")]
    ReservedPrefix { prefix: String },

    #[error("key is {actual} characters long; the maximum is {max}")]
    TooLong { max: usize, actual: usize },
}

/// Why a proposed variable value was rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValueError {
    #[error("value is required")]
    Empty,

    #[error("value is {actual} bytes; the maximum is {max}")]
    TooLarge { max: usize, actual: usize },
}

/// A single key colliding with stored rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyConflict {
    pub key: String,
    /// Every environment in which the key already has a value, sorted.
    pub environment_ids: Vec<String>,
}

/// Proposed keys already exist and override was not requested.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{} key(s) already exist", .conflicts.len())]
pub struct ConflictError {
    /// One entry per colliding key, sorted by key.
    pub conflicts: Vec<KeyConflict>,
}

/// Infrastructure failures: storage, key material, or unreadable records.
///
/// These are never the caller's fault and are never retried here.
#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    /// The storage backend failed.
    #[error("repository storage error: {0}")]
    Storage(#[from] StorageError),

    /// Sealing or opening a secret failed.
    #[error("repository cipher error: {0}")]
    Cipher(#[from] CipherError),

    /// A stored record could not be decoded.
    #[error("corrupt record at '{path}': {reason}")]
    CorruptRecord { path: String, reason: String },
}

/// What went wrong with one variable of a create request.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VariableErrorKind {
    #[error(transparent)]
    InvalidKey(KeyError),

    #[error(transparent)]
    InvalidValue(ValueError),

    /// The same key appears more than once in the submitted batch.
    #[error("key is used more than once in this request")]
    DuplicateInBatch,

    /// The key already has a value in these environments.
    #[error("key already exists in {}; choose override to replace it", .environment_ids.join(", "))]
    Conflict { environment_ids: Vec<String> },
}

/// A per-variable error, attached by the caller to the offending row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariableError {
    pub key: String,
    pub kind: VariableErrorKind,
}

impl VariableError {
    #[must_use]
    pub fn new(key: impl Into<String>, kind: VariableErrorKind) -> Self {
        Self {
            key: key.into(),
            kind,
        }
    }
}

impl fmt::Display for VariableError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.key, self.kind)
    }
}

impl std::error::Error for VariableError {}

/// Whole-request failures, attached by the caller to the form as a whole.
#[derive(Debug, thiserror::Error)]
pub enum BatchError {
    #[error("at least one environment is required")]
    MissingEnvironments,

    #[error("at least one variable is required")]
    MissingVariables,

    /// Opaque to the caller; the cause is available through `source()`.
    #[error("failed to store environment variables")]
    Infrastructure(#[source] RepositoryError),
}

/// Why a create call wrote nothing.
#[derive(Debug, thiserror::Error)]
pub enum CreateError {
    #[error(transparent)]
    Batch(#[from] BatchError),

    /// Ordered by first appearance in the request, one entry per key.
    #[error("{} variable(s) rejected", .0.len())]
    Variables(Vec<VariableError>),
}

impl CreateError {
    /// Per-variable errors, or an empty slice for batch-level failures.
    #[must_use]
    pub fn variable_errors(&self) -> &[VariableError] {
        match self {
            Self::Variables(errors) => errors,
            Self::Batch(_) => &[],
        }
    }
}
