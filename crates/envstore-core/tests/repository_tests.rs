//! Integration tests for `VariableRepository`.
//!
//! Every failure path is checked for the same thing: storage is byte-for-byte
//! unchanged afterwards.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::collections::BTreeMap;
use std::sync::Arc;

use envstore_core::{
    BatchError, CreateError, CreateRequest, CreateSummary, EncryptionKey, KeyError, KeyValidator,
    RepositoryError, SecretCipher, ValidationRules, Variable, VariableError, VariableErrorKind,
    VariableRepository,
};
use envstore_storage::{MemoryBackend, RedbBackend, StorageBackend, StorageError, WriteBatch};

// ── Helpers ──────────────────────────────────────────────────────────

fn keyed_cipher() -> Arc<SecretCipher> {
    Arc::new(SecretCipher::from_root_key(&EncryptionKey::generate()).unwrap())
}

fn repo_on(storage: Arc<dyn StorageBackend>) -> VariableRepository {
    VariableRepository::new(storage, keyed_cipher(), KeyValidator::default())
}

fn request(envs: &[&str], vars: &[(&str, &str)]) -> CreateRequest {
    CreateRequest {
        environment_ids: envs.iter().map(|e| (*e).to_owned()).collect(),
        variables: vars.iter().map(|(k, v)| Variable::new(*k, *v)).collect(),
        is_secret: false,
        allow_override: false,
    }
}

/// Snapshot of every stored row, for "nothing changed" assertions.
async fn dump(storage: &dyn StorageBackend) -> BTreeMap<String, Vec<u8>> {
    let keys = storage.list("").await.unwrap();
    storage.get_many(&keys).await.unwrap()
}

fn error_keys(err: &CreateError) -> Vec<&str> {
    err.variable_errors().iter().map(|e| e.key.as_str()).collect()
}

/// Commits a competing row at the first insert-only key right before
/// delegating, as if another writer won the race after the snapshot read.
struct RacingBackend {
    inner: MemoryBackend,
}

#[async_trait::async_trait]
impl StorageBackend for RacingBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        self.inner.get(key).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        self.inner.list(prefix).await
    }

    async fn commit(&self, batch: WriteBatch) -> Result<(), StorageError> {
        if let Some(key) = batch.insert_keys().next() {
            let mut competing = WriteBatch::new();
            competing.upsert(key, batch.ops()[0].value.clone());
            self.inner.commit(competing).await?;
        }
        self.inner.commit(batch).await
    }
}

/// Reads work, every commit fails.
struct BrokenCommitBackend {
    inner: MemoryBackend,
}

#[async_trait::async_trait]
impl StorageBackend for BrokenCommitBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        self.inner.get(key).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        self.inner.list(prefix).await
    }

    async fn commit(&self, _batch: WriteBatch) -> Result<(), StorageError> {
        Err(StorageError::Transaction {
            reason: "disk full".to_owned(),
        })
    }
}

// ── Success paths ────────────────────────────────────────────────────

#[tokio::test]
async fn create_writes_every_environment_key_pair() {
    let repo = repo_on(Arc::new(MemoryBackend::new()));
    let req = request(
        &["dev", "staging", "prod"],
        &[("DATABASE_URL", "postgres://db"), ("PORT", "8080")],
    );

    let summary = repo.create("proj", req).await.unwrap();
    assert_eq!(
        summary,
        CreateSummary {
            inserted: 6,
            overwritten: 0
        }
    );

    for env in ["dev", "staging", "prod"] {
        let url = repo.get("proj", env, "DATABASE_URL").await.unwrap().unwrap();
        assert_eq!(url.value, "postgres://db");
        assert_eq!(url.environment_id, env);
        assert_eq!(url.version, 1);
        assert!(!url.is_secret);
        let port = repo.get("proj", env, "PORT").await.unwrap().unwrap();
        assert_eq!(port.value, "8080");
    }
}

#[tokio::test]
async fn plain_values_are_stored_exactly() {
    let repo = repo_on(Arc::new(MemoryBackend::new()));
    let tricky = "  \t\"quoted\" = 'x' # not a comment \\n \u{00e9}\u{1F600} ";
    repo.create("p", request(&["dev"], &[("TRICKY", tricky)]))
        .await
        .unwrap();

    let stored = repo.get("p", "dev", "TRICKY").await.unwrap().unwrap();
    assert_eq!(stored.value.as_bytes(), tricky.as_bytes());
}

#[tokio::test]
async fn secret_values_roundtrip_and_are_sealed_at_rest() {
    let storage = Arc::new(MemoryBackend::new());
    let repo = repo_on(storage.clone());
    let mut req = request(&["dev", "prod"], &[("API_TOKEN", "tok_live_123")]);
    req.is_secret = true;

    repo.create("p", req).await.unwrap();

    for env in ["dev", "prod"] {
        let stored = repo.get("p", env, "API_TOKEN").await.unwrap().unwrap();
        assert!(stored.is_secret);
        assert_eq!(stored.value, "tok_live_123");
    }

    for bytes in dump(storage.as_ref()).await.values() {
        let text = String::from_utf8_lossy(bytes);
        assert!(!text.contains("tok_live_123"), "plaintext leaked: {text}");
    }
}

#[tokio::test]
async fn sealed_row_does_not_open_at_another_path() {
    let storage = Arc::new(MemoryBackend::new());
    let repo = repo_on(storage.clone());
    let mut req = request(&["dev", "prod"], &[("API_TOKEN", "tok_live_123")]);
    req.is_secret = true;
    repo.create("p", req).await.unwrap();

    let rows = dump(storage.as_ref()).await;
    let (dev_path, dev_bytes) = rows.iter().find(|(k, _)| k.contains("/dev/")).unwrap();
    let (_, prod_bytes) = rows.iter().find(|(k, _)| k.contains("/prod/")).unwrap();
    assert_ne!(dev_bytes, prod_bytes, "each row is sealed separately");

    let mut copy = WriteBatch::new();
    copy.upsert(dev_path.clone(), prod_bytes.clone());
    storage.commit(copy).await.unwrap();

    let err = repo.get("p", "dev", "API_TOKEN").await.unwrap_err();
    assert!(matches!(err, RepositoryError::Cipher(_)), "{err:?}");
    assert_eq!(
        repo.get("p", "prod", "API_TOKEN").await.unwrap().unwrap().value,
        "tok_live_123"
    );
}

#[tokio::test]
async fn non_secret_batch_never_needs_key_material() {
    let repo = VariableRepository::new(
        Arc::new(MemoryBackend::new()),
        Arc::new(SecretCipher::new()),
        KeyValidator::default(),
    );
    repo.create("p", request(&["dev"], &[("A", "1")]))
        .await
        .unwrap();
    assert_eq!(repo.get("p", "dev", "A").await.unwrap().unwrap().value, "1");
}

#[tokio::test]
async fn override_twice_is_last_write_wins() {
    let repo = repo_on(Arc::new(MemoryBackend::new()));
    let mut first = request(&["dev", "prod"], &[("A", "first"), ("B", "first")]);
    first.allow_override = true;
    let mut second = request(&["dev", "prod"], &[("A", "second"), ("B", "second")]);
    second.allow_override = true;

    repo.create("p", first).await.unwrap();
    let summary = repo.create("p", second).await.unwrap();
    assert_eq!(
        summary,
        CreateSummary {
            inserted: 0,
            overwritten: 4
        }
    );

    for env in ["dev", "prod"] {
        for key in ["A", "B"] {
            let stored = repo.get("p", env, key).await.unwrap().unwrap();
            assert_eq!(stored.value, "second");
            assert_eq!(stored.version, 2);
        }
    }
}

#[tokio::test]
async fn override_replaces_existing_token() {
    let repo = repo_on(Arc::new(MemoryBackend::new()));
    repo.create("p", request(&["dev"], &[("TOKEN", "old")]))
        .await
        .unwrap();

    let mut req = request(&["dev"], &[("TOKEN", "new")]);
    req.allow_override = true;
    repo.create("p", req).await.unwrap();

    let stored = repo.get("p", "dev", "TOKEN").await.unwrap().unwrap();
    assert_eq!(stored.value, "new");
}

#[tokio::test]
async fn override_mixes_inserts_and_overwrites() {
    let repo = repo_on(Arc::new(MemoryBackend::new()));
    repo.create("p", request(&["dev"], &[("A", "1")]))
        .await
        .unwrap();

    let mut req = request(&["dev", "prod"], &[("A", "2")]);
    req.allow_override = true;
    let summary = repo.create("p", req).await.unwrap();
    assert_eq!(
        summary,
        CreateSummary {
            inserted: 1,
            overwritten: 1
        }
    );
    assert_eq!(repo.get("p", "prod", "A").await.unwrap().unwrap().version, 1);
    assert_eq!(repo.get("p", "dev", "A").await.unwrap().unwrap().version, 2);
}

#[tokio::test]
async fn keys_are_case_sensitive() {
    let repo = repo_on(Arc::new(MemoryBackend::new()));
    repo.create("p", request(&["dev"], &[("api_key", "lower")]))
        .await
        .unwrap();
    repo.create("p", request(&["dev"], &[("API_KEY", "upper")]))
        .await
        .unwrap();

    let lower = repo.get("p", "dev", "api_key").await.unwrap().unwrap();
    let upper = repo.get("p", "dev", "API_KEY").await.unwrap().unwrap();
    assert_eq!(lower.value, "lower");
    assert_eq!(upper.value, "upper");

    // Same spelling twice in one batch, differing only by case, is not a duplicate.
    repo.create("p", request(&["prod"], &[("Key", "1"), ("KEY", "2")]))
        .await
        .unwrap();
}

#[tokio::test]
async fn projects_and_environments_are_isolated() {
    let repo = repo_on(Arc::new(MemoryBackend::new()));
    repo.create("alpha", request(&["dev"], &[("A", "alpha")]))
        .await
        .unwrap();
    repo.create("beta", request(&["dev"], &[("A", "beta")]))
        .await
        .unwrap();
    repo.create("alpha", request(&["dev2"], &[("A", "dev2")]))
        .await
        .unwrap();

    assert_eq!(repo.list("alpha", "dev").await.unwrap().len(), 1);
    assert_eq!(
        repo.get("beta", "dev", "A").await.unwrap().unwrap().value,
        "beta"
    );
    assert!(repo.get("beta", "prod", "A").await.unwrap().is_none());
}

#[tokio::test]
async fn duplicate_environment_ids_collapse() {
    let repo = repo_on(Arc::new(MemoryBackend::new()));
    let summary = repo
        .create("p", request(&["dev", "dev", ""], &[("A", "1")]))
        .await
        .unwrap();
    assert_eq!(summary.rows(), 1);
}

// ── Batch-level failures ─────────────────────────────────────────────

#[tokio::test]
async fn empty_request_is_batch_error() {
    let repo = repo_on(Arc::new(MemoryBackend::new()));

    let err = repo
        .create("p", request(&[], &[("A", "1")]))
        .await
        .unwrap_err();
    assert!(matches!(err, CreateError::Batch(BatchError::MissingEnvironments)));
    assert!(err.variable_errors().is_empty());

    let err = repo.create("p", request(&["dev"], &[])).await.unwrap_err();
    assert!(matches!(err, CreateError::Batch(BatchError::MissingVariables)));
}

#[tokio::test]
async fn missing_key_material_fails_secret_batch_without_writes() {
    let storage = Arc::new(MemoryBackend::new());
    let repo = VariableRepository::new(
        storage.clone(),
        Arc::new(SecretCipher::new()),
        KeyValidator::default(),
    );
    let mut req = request(&["dev", "prod"], &[("A", "1"), ("B", "2")]);
    req.is_secret = true;

    let err = repo.create("p", req).await.unwrap_err();
    match err {
        CreateError::Batch(BatchError::Infrastructure(RepositoryError::Cipher(_))) => {}
        other => panic!("expected cipher infrastructure error, got {other:?}"),
    }
    assert!(dump(storage.as_ref()).await.is_empty());
}

#[tokio::test]
async fn infrastructure_message_is_opaque() {
    let inner = MemoryBackend::new();
    let repo = repo_on(Arc::new(BrokenCommitBackend {
        inner: inner.clone(),
    }));

    let err = repo
        .create("p", request(&["dev"], &[("A", "1")]))
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "failed to store environment variables");
    let source = std::error::Error::source(&err)
        .and_then(std::error::Error::source)
        .map(ToString::to_string)
        .unwrap_or_default();
    assert!(source.contains("disk full"), "cause should be chained: {source}");
    assert!(dump(&inner).await.is_empty());
}

// ── Per-key failures ─────────────────────────────────────────────────

#[tokio::test]
async fn second_create_without_override_names_every_key() {
    let storage = Arc::new(MemoryBackend::new());
    let repo = repo_on(storage.clone());
    let req = request(&["dev", "staging"], &[("A", "1"), ("B", "2"), ("C", "3")]);

    repo.create("p", req.clone()).await.unwrap();
    let before = dump(storage.as_ref()).await;

    let err = repo.create("p", req).await.unwrap_err();
    assert_eq!(error_keys(&err), vec!["A", "B", "C"]);
    for e in err.variable_errors() {
        assert_eq!(
            e.kind,
            VariableErrorKind::Conflict {
                environment_ids: vec!["dev".to_owned(), "staging".to_owned()]
            }
        );
    }
    assert_eq!(dump(storage.as_ref()).await, before);
}

#[tokio::test]
async fn partial_conflict_writes_nothing() {
    let storage = Arc::new(MemoryBackend::new());
    let repo = repo_on(storage.clone());
    repo.create("p", request(&["prod"], &[("B", "old")]))
        .await
        .unwrap();
    let before = dump(storage.as_ref()).await;

    let err = repo
        .create("p", request(&["dev", "prod"], &[("A", "1"), ("B", "2")]))
        .await
        .unwrap_err();
    assert_eq!(
        err.variable_errors(),
        &[VariableError::new(
            "B",
            VariableErrorKind::Conflict {
                environment_ids: vec!["prod".to_owned()]
            }
        )]
    );
    assert_eq!(dump(storage.as_ref()).await, before);
    assert!(repo.get("p", "dev", "A").await.unwrap().is_none());
}

#[tokio::test]
async fn one_invalid_key_writes_nothing() {
    let storage = Arc::new(MemoryBackend::new());
    let repo = repo_on(storage.clone());

    let err = repo
        .create(
            "p",
            request(
                &["dev", "staging"],
                &[("GOOD_ONE", "1"), ("1BAD", "x"), ("ALSO-BAD", "y"), ("GOOD_TWO", "2")],
            ),
        )
        .await
        .unwrap_err();

    assert_eq!(
        err.variable_errors(),
        &[
            VariableError::new("1BAD", VariableErrorKind::InvalidKey(KeyError::LeadingDigit)),
            VariableError::new(
                "ALSO-BAD",
                VariableErrorKind::InvalidKey(KeyError::InvalidCharacter { character: '-' })
            ),
        ]
    );
    assert!(dump(storage.as_ref()).await.is_empty());
}

#[tokio::test]
async fn leading_digit_is_invalid_key() {
    let storage = Arc::new(MemoryBackend::new());
    let repo = repo_on(storage.clone());
    let err = repo
        .create("p", request(&["dev"], &[("1BAD", "x")]))
        .await
        .unwrap_err();
    assert_eq!(
        err.variable_errors(),
        &[VariableError::new(
            "1BAD",
            VariableErrorKind::InvalidKey(KeyError::LeadingDigit)
        )]
    );
    assert!(dump(storage.as_ref()).await.is_empty());
}

#[tokio::test]
async fn duplicate_key_in_batch_writes_nothing() {
    let storage = Arc::new(MemoryBackend::new());
    let repo = repo_on(storage.clone());
    let err = repo
        .create(
            "p",
            request(&["dev", "staging"], &[("API_KEY", "abc"), ("API_KEY", "xyz")]),
        )
        .await
        .unwrap_err();
    assert_eq!(
        err.variable_errors(),
        &[VariableError::new("API_KEY", VariableErrorKind::DuplicateInBatch)]
    );
    assert!(dump(storage.as_ref()).await.is_empty());
}

#[tokio::test]
async fn reserved_prefix_is_rejected() {
    let repo = VariableRepository::new(
        Arc::new(MemoryBackend::new()),
        keyed_cipher(),
        KeyValidator::new(ValidationRules {
            reserved_prefixes: vec!["PLATFORM_".to_owned()],
            ..ValidationRules::default()
        }),
    );
    let err = repo
        .create("p", request(&["dev"], &[("PLATFORM_ID", "1")]))
        .await
        .unwrap_err();
    assert_eq!(error_keys(&err), vec!["PLATFORM_ID"]);
}

#[tokio::test]
async fn lost_race_is_reported_as_conflict() {
    let inner = MemoryBackend::new();
    let repo = repo_on(Arc::new(RacingBackend {
        inner: inner.clone(),
    }));

    let err = repo
        .create("p", request(&["dev", "prod"], &[("A", "1"), ("B", "2")]))
        .await
        .unwrap_err();

    assert_eq!(
        err.variable_errors(),
        &[VariableError::new(
            "A",
            VariableErrorKind::Conflict {
                environment_ids: vec!["dev".to_owned()]
            }
        )]
    );
    // Only the competing writer's row exists.
    assert_eq!(inner.list("").await.unwrap().len(), 1);
}

// ── Reads ────────────────────────────────────────────────────────────

#[tokio::test]
async fn list_is_sorted_and_hides_secrets() {
    let repo = repo_on(Arc::new(MemoryBackend::new()));
    repo.create("p", request(&["dev"], &[("ZED", "z"), ("ALPHA", "a")]))
        .await
        .unwrap();
    let mut secret = request(&["dev"], &[("MIDDLE", "m")]);
    secret.is_secret = true;
    repo.create("p", secret).await.unwrap();

    let listed = repo.list("p", "dev").await.unwrap();
    let keys: Vec<&str> = listed.iter().map(|s| s.key.as_str()).collect();
    assert_eq!(keys, vec!["ALPHA", "MIDDLE", "ZED"]);
    assert_eq!(listed[1].value, None);
    assert!(listed[1].is_secret);
    assert_eq!(listed[2].value.as_deref(), Some("z"));
}

#[tokio::test]
async fn get_missing_is_none() {
    let repo = repo_on(Arc::new(MemoryBackend::new()));
    assert!(repo.get("p", "dev", "NOPE").await.unwrap().is_none());
}

#[tokio::test]
async fn secrets_survive_redb_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("envstore.redb");
    let root = EncryptionKey::generate();

    {
        let storage = Arc::new(RedbBackend::open(&path).unwrap());
        let repo = VariableRepository::new(
            storage,
            Arc::new(SecretCipher::from_root_key(&root).unwrap()),
            KeyValidator::default(),
        );
        let mut req = request(&["dev"], &[("SECRET", "s3cret")]);
        req.is_secret = true;
        repo.create("p", req).await.unwrap();
    }

    let storage = Arc::new(RedbBackend::open(&path).unwrap());
    let repo = VariableRepository::new(
        storage,
        Arc::new(SecretCipher::from_root_key(&root).unwrap()),
        KeyValidator::default(),
    );
    let stored = repo.get("p", "dev", "SECRET").await.unwrap().unwrap();
    assert_eq!(stored.value, "s3cret");

    let err = repo
        .create("p", request(&["dev"], &[("SECRET", "again")]))
        .await
        .unwrap_err();
    assert_eq!(error_keys(&err), vec!["SECRET"]);
}
