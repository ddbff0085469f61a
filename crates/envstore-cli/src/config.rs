//! Configuration for the `envstore` binary.
//!
//! Loads configuration from environment variables with sensible defaults.
//! Absent or unparseable values fall back to the default.

use envstore_core::ValidationRules;
use envstore_core::validation::{DEFAULT_MAX_KEY_LEN, DEFAULT_MAX_VALUE_BYTES};

/// Store configuration.
#[derive(Clone)]
pub struct StoreConfig {
    /// Storage backend type.
    pub storage_backend: StorageBackendType,
    /// Log level filter used when `RUST_LOG` is unset.
    pub log_level: String,
    /// Base64 root key. Secrets cannot be stored or read without it.
    pub encryption_key: Option<String>,
    /// Key and value rules applied to every create.
    pub validation: ValidationRules,
}

impl std::fmt::Debug for StoreConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreConfig")
            .field("storage_backend", &self.storage_backend)
            .field("log_level", &self.log_level)
            .field(
                "encryption_key",
                &self.encryption_key.as_ref().map(|_| "[REDACTED]"),
            )
            .field("validation", &self.validation)
            .finish()
    }
}

/// Supported storage backend types.
#[derive(Clone, PartialEq, Eq)]
pub enum StorageBackendType {
    /// In-memory (data lost when the process exits).
    Memory,
    /// Redb single-file storage.
    Redb { path: String },
    /// `RocksDB` persistent storage.
    RocksDb { path: String },
    /// `PostgreSQL` storage.
    Postgres { url: String },
}

impl std::fmt::Debug for StorageBackendType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Memory => write!(f, "Memory"),
            Self::Redb { path } => write!(f, "Redb({path})"),
            Self::RocksDb { path } => write!(f, "RocksDb({path})"),
            // Connection strings carry credentials.
            Self::Postgres { .. } => write!(f, "Postgres([redacted])"),
        }
    }
}

impl StoreConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `ENVSTORE_STORAGE`: `memory`, `redb`, `rocksdb`, or `postgres` (default: `redb`)
    /// - `ENVSTORE_STORAGE_PATH`: path for redb/RocksDB
    ///   (default: `./envstore.redb` / `./envstore-data`)
    /// - `DATABASE_URL`: PostgreSQL connection string (default: `postgres://localhost/envstore`)
    /// - `ENVSTORE_LOG_LEVEL`: log filter (default: `warn`)
    /// - `ENVSTORE_ENCRYPTION_KEY`: base64 32-byte root key (optional)
    /// - `ENVSTORE_RESERVED_PREFIXES`: comma-separated reserved key prefixes (default: none)
    /// - `ENVSTORE_MAX_KEY_LENGTH`: maximum key length (default: `256`)
    /// - `ENVSTORE_MAX_VALUE_BYTES`: maximum value size (default: `1048576`)
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through `lookup` instead of the process environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let storage_path = lookup("ENVSTORE_STORAGE_PATH").filter(|p| !p.is_empty());

        let storage_backend = match lookup("ENVSTORE_STORAGE")
            .unwrap_or_else(|| "redb".to_owned())
            .to_lowercase()
            .as_str()
        {
            "memory" => StorageBackendType::Memory,
            "rocksdb" => StorageBackendType::RocksDb {
                path: storage_path.unwrap_or_else(|| "./envstore-data".to_owned()),
            },
            "postgres" | "postgresql" => StorageBackendType::Postgres {
                url: lookup("DATABASE_URL")
                    .unwrap_or_else(|| "postgres://localhost/envstore".to_owned()),
            },
            _ => StorageBackendType::Redb {
                path: storage_path.unwrap_or_else(|| "./envstore.redb".to_owned()),
            },
        };

        let log_level = lookup("ENVSTORE_LOG_LEVEL").unwrap_or_else(|| "warn".to_owned());

        let encryption_key = lookup("ENVSTORE_ENCRYPTION_KEY").filter(|k| !k.trim().is_empty());

        let reserved_prefixes = lookup("ENVSTORE_RESERVED_PREFIXES")
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|p| !p.is_empty())
                    .map(str::to_owned)
                    .collect()
            })
            .unwrap_or_default();

        let max_key_len = lookup("ENVSTORE_MAX_KEY_LENGTH")
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_MAX_KEY_LEN);

        let max_value_bytes = lookup("ENVSTORE_MAX_VALUE_BYTES")
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_MAX_VALUE_BYTES);

        Self {
            storage_backend,
            log_level,
            encryption_key,
            validation: ValidationRules {
                reserved_prefixes,
                max_key_len,
                max_value_bytes,
            },
        }
    }
}
