//! Core library for envstore.
//!
//! Stores project-scoped environment variables: every variable of a batch is
//! written to every requested environment in one atomic commit, secret
//! values are sealed with AES-256-GCM before they reach storage, and callers
//! get back either a row count or a precise per-key failure list. This crate
//! depends on `envstore-storage` for the storage backend trait.

pub mod cipher;
pub mod conflict;
pub mod crypto;
pub mod error;
pub mod models;
pub mod repository;
pub mod validation;

pub use cipher::{SealedValue, SecretCipher};
pub use conflict::{ConflictResolver, ScopedKey};
pub use crypto::EncryptionKey;
pub use error::{
    BatchError, CipherError, ConflictError, CreateError, CryptoError, KeyConflict, KeyError,
    RepositoryError, ValueError, VariableError, VariableErrorKind,
};
pub use models::{
    CreateRequest, CreateResult, CreateSummary, StoredVariable, Variable, VariableSummary,
};
pub use repository::VariableRepository;
pub use validation::{KeyValidator, ValidationRules};
