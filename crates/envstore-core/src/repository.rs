//! The variable repository.
//!
//! [`VariableRepository::create`] writes a batch of variables to every
//! requested environment of a project in one atomic commit. It validates
//! every row, rejects duplicates inside the batch, resolves conflicts with
//! stored rows against the override flag, and seals secret values, all
//! before anything touches storage. Either every `(environment, key)` row of
//! the batch is written or none is.
//!
//! The conflict check reads one snapshot of the affected rows. Storage
//! re-checks insert-only rows inside the commit, so a row created by a
//! concurrent call between the snapshot and the commit is still reported as
//! a per-key conflict.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use envstore_storage::{StorageBackend, StorageError, WriteBatch};

use crate::cipher::{SealedValue, SecretCipher};
use crate::conflict::{ConflictResolver, ScopedKey};
use crate::error::{
    BatchError, CreateError, KeyConflict, RepositoryError, VariableError, VariableErrorKind,
};
use crate::models::{
    CreateRequest, CreateResult, CreateSummary, StoredRecord, StoredValue, StoredVariable,
    Variable, VariableSummary, environment_prefix, variable_path,
};
use crate::validation::KeyValidator;

/// One `(environment, key)` row of a batch.
struct PlannedRow<'a> {
    path: String,
    scope: ScopedKey,
    variable: &'a Variable,
}

/// Project-scoped variable store.
pub struct VariableRepository {
    storage: Arc<dyn StorageBackend>,
    cipher: Arc<SecretCipher>,
    validator: KeyValidator,
}

impl VariableRepository {
    #[must_use]
    pub fn new(
        storage: Arc<dyn StorageBackend>,
        cipher: Arc<SecretCipher>,
        validator: KeyValidator,
    ) -> Self {
        Self {
            storage,
            cipher,
            validator,
        }
    }

    /// Whether secret batches can be sealed, i.e. key material is configured.
    pub fn can_seal(&self) -> bool {
        self.cipher.is_ready()
    }

    /// Write every variable of `request` to every one of its environments.
    ///
    /// `project_id` is trusted; access checks happen upstream.
    ///
    /// # Errors
    ///
    /// Nothing is written on any error.
    ///
    /// - [`BatchError::MissingEnvironments`] / [`BatchError::MissingVariables`]
    ///   for an empty request.
    /// - [`CreateError::Variables`] with one entry per offending key, in
    ///   request order, for invalid keys or values, keys repeated in the
    ///   batch, or keys that already exist without override. Each stage
    ///   reports every failing key before returning.
    /// - [`BatchError::Infrastructure`] if sealing, reading or committing
    ///   fails for any reason other than a lost insert race.
    pub async fn create(&self, project_id: &str, request: CreateRequest) -> CreateResult {
        let environments = request.environment_scope();
        if environments.is_empty() {
            return Err(BatchError::MissingEnvironments.into());
        }
        if request.variables.is_empty() {
            return Err(BatchError::MissingVariables.into());
        }

        self.check_rows(&request.variables)?;
        check_duplicates(&request.variables)?;

        let plan = plan_rows(project_id, &environments, &request.variables);
        let paths: Vec<String> = plan.iter().map(|row| row.path.clone()).collect();

        let existing = self
            .storage
            .get_many(&paths)
            .await
            .map_err(|e| infrastructure(project_id, e))?;

        let existing_scopes: BTreeSet<ScopedKey> = plan
            .iter()
            .filter(|row| existing.contains_key(&row.path))
            .map(|row| row.scope.clone())
            .collect();
        let proposed: BTreeSet<ScopedKey> = plan.iter().map(|row| row.scope.clone()).collect();

        if let Err(conflict) =
            ConflictResolver::resolve(&existing_scopes, &proposed, request.allow_override)
        {
            tracing::info!(
                project_id,
                keys = conflict.conflicts.len(),
                "create rejected: keys already exist"
            );
            return Err(conflict_errors(conflict.conflicts, &request.variables));
        }

        let values = self
            .prepare_values(&plan, request.is_secret)
            .map_err(|e| infrastructure(project_id, e))?;

        let (batch, summary) = build_batch(&plan, values, &existing, request.allow_override)
            .map_err(|e| infrastructure(project_id, e))?;

        match self.storage.commit(batch).await {
            Ok(()) => {}
            Err(StorageError::KeyExists { keys }) => {
                tracing::info!(
                    project_id,
                    keys = keys.len(),
                    "create lost a race with a concurrent writer"
                );
                let taken: HashSet<&str> = keys.iter().map(String::as_str).collect();
                let conflicts = group_conflicts(
                    plan.iter()
                        .filter(|row| taken.contains(row.path.as_str()))
                        .map(|row| &row.scope),
                );
                return Err(conflict_errors(conflicts, &request.variables));
            }
            Err(e) => return Err(infrastructure(project_id, e)),
        }

        tracing::info!(
            project_id,
            environments = environments.len(),
            variables = request.variables.len(),
            inserted = summary.inserted,
            overwritten = summary.overwritten,
            is_secret = request.is_secret,
            "environment variables stored"
        );

        Ok(summary)
    }

    /// Read one variable, opening it if it is secret.
    ///
    /// # Errors
    ///
    /// - [`RepositoryError::Storage`] if the read fails.
    /// - [`RepositoryError::CorruptRecord`] if the stored record is unreadable.
    /// - [`RepositoryError::Cipher`] if a secret cannot be opened.
    pub async fn get(
        &self,
        project_id: &str,
        environment_id: &str,
        key: &str,
    ) -> Result<Option<StoredVariable>, RepositoryError> {
        let path = variable_path(project_id, environment_id, key);
        let Some(bytes) = self.storage.get(&path).await? else {
            return Ok(None);
        };
        let record = StoredRecord::decode(&path, &bytes)?;

        let is_secret = record.value.is_secret();
        let value = match record.value {
            StoredValue::Plain { text } => text,
            StoredValue::Sealed { ciphertext } => {
                let sealed = SealedValue::from_base64(&ciphertext).map_err(|e| {
                    RepositoryError::CorruptRecord {
                        path: path.clone(),
                        reason: e.to_string(),
                    }
                })?;
                self.cipher.open(&sealed, &path)?
            }
        };

        Ok(Some(StoredVariable {
            project_id: project_id.to_owned(),
            environment_id: environment_id.to_owned(),
            key: record.key,
            value,
            is_secret,
            version: record.version,
            created_at: record.created_at,
            updated_at: record.updated_at,
        }))
    }

    /// List every variable of one environment, sorted by key.
    ///
    /// Secret values are withheld; nothing is decrypted.
    ///
    /// # Errors
    ///
    /// - [`RepositoryError::Storage`] if the listing or read fails.
    /// - [`RepositoryError::CorruptRecord`] if a stored record is unreadable.
    pub async fn list(
        &self,
        project_id: &str,
        environment_id: &str,
    ) -> Result<Vec<VariableSummary>, RepositoryError> {
        let prefix = environment_prefix(project_id, environment_id);
        let paths = self.storage.list(&prefix).await?;
        let rows = self.storage.get_many(&paths).await?;

        let mut summaries = Vec::with_capacity(rows.len());
        for (path, bytes) in &rows {
            let record = StoredRecord::decode(path, bytes)?;
            let (is_secret, value) = match record.value {
                StoredValue::Plain { text } => (false, Some(text)),
                StoredValue::Sealed { .. } => (true, None),
            };
            summaries.push(VariableSummary {
                key: record.key,
                is_secret,
                value,
                version: record.version,
                updated_at: record.updated_at,
            });
        }
        summaries.sort_by(|a, b| a.key.cmp(&b.key));

        tracing::debug!(
            project_id,
            environment_id,
            count = summaries.len(),
            "listed variables"
        );
        Ok(summaries)
    }

    /// Validate every key and value, one error per key.
    fn check_rows(&self, variables: &[Variable]) -> Result<(), CreateError> {
        let mut reported = HashSet::new();
        let mut errors = Vec::new();

        for variable in variables {
            let kind = match self.validator.validate(&variable.key) {
                Err(e) => Some(VariableErrorKind::InvalidKey(e)),
                Ok(()) => self
                    .validator
                    .validate_value(&variable.value)
                    .err()
                    .map(VariableErrorKind::InvalidValue),
            };
            if let Some(kind) = kind {
                if reported.insert(variable.key.as_str()) {
                    errors.push(VariableError::new(&variable.key, kind));
                }
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            tracing::debug!(rejected = errors.len(), "create rejected: invalid variables");
            Err(CreateError::Variables(errors))
        }
    }

    /// The stored value for each planned row, in plan order.
    ///
    /// Secret batches seal every row for its own path; any failure aborts the
    /// whole batch. Plain batches never touch the cipher.
    fn prepare_values(
        &self,
        plan: &[PlannedRow<'_>],
        is_secret: bool,
    ) -> Result<Vec<StoredValue>, RepositoryError> {
        plan.iter()
            .map(|row| {
                if is_secret {
                    let sealed = self.cipher.seal(&row.variable.value, &row.path)?;
                    Ok(StoredValue::sealed(&sealed))
                } else {
                    Ok(StoredValue::Plain {
                        text: row.variable.value.clone(),
                    })
                }
            })
            .collect()
    }
}

impl std::fmt::Debug for VariableRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VariableRepository")
            .field("validator", &self.validator)
            .finish_non_exhaustive()
    }
}

/// Report every key that appears more than once, in first-appearance order.
fn check_duplicates(variables: &[Variable]) -> Result<(), CreateError> {
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for variable in variables {
        *counts.entry(variable.key.as_str()).or_default() += 1;
    }

    let mut reported = HashSet::new();
    let errors: Vec<VariableError> = variables
        .iter()
        .map(|v| v.key.as_str())
        .filter(|key| counts.get(key).is_some_and(|n| *n > 1) && reported.insert(*key))
        .map(|key| VariableError::new(key, VariableErrorKind::DuplicateInBatch))
        .collect();

    if errors.is_empty() {
        Ok(())
    } else {
        tracing::debug!(rejected = errors.len(), "create rejected: duplicate keys in batch");
        Err(CreateError::Variables(errors))
    }
}

/// The cross product `environments × variables`.
fn plan_rows<'a>(
    project_id: &str,
    environments: &[&str],
    variables: &'a [Variable],
) -> Vec<PlannedRow<'a>> {
    let mut plan = Vec::with_capacity(environments.len().saturating_mul(variables.len()));
    for environment_id in environments {
        for variable in variables {
            plan.push(PlannedRow {
                path: variable_path(project_id, environment_id, &variable.key),
                scope: ScopedKey::new(*environment_id, variable.key.as_str()),
                variable,
            });
        }
    }
    plan
}

/// Turn the plan and its prepared values into one write batch.
///
/// Without override every row is a conditional insert. With override every
/// row is an upsert; rows present in the snapshot keep their `created_at`
/// and get the next version.
fn build_batch(
    plan: &[PlannedRow<'_>],
    values: Vec<StoredValue>,
    existing: &BTreeMap<String, Vec<u8>>,
    allow_override: bool,
) -> Result<(WriteBatch, CreateSummary), RepositoryError> {
    let now = Utc::now();
    let mut batch = WriteBatch::new();
    let mut summary = CreateSummary::default();

    for (row, value) in plan.iter().zip(values) {

        let previous = existing
            .get(&row.path)
            .map(|bytes| StoredRecord::decode(&row.path, bytes))
            .transpose()?;

        let record = StoredRecord {
            key: row.variable.key.clone(),
            value,
            version: previous
                .as_ref()
                .map_or(1, |p| p.version.saturating_add(1)),
            created_at: previous.as_ref().map_or(now, |p| p.created_at),
            updated_at: now,
        };
        let bytes = record.encode(&row.path)?;

        if previous.is_some() {
            summary.overwritten += 1;
        } else {
            summary.inserted += 1;
        }

        if allow_override {
            batch.upsert(row.path.clone(), bytes);
        } else {
            batch.insert(row.path.clone(), bytes);
        }
    }

    Ok((batch, summary))
}

/// Group colliding rows into one entry per key with sorted environments.
fn group_conflicts<'a>(scopes: impl Iterator<Item = &'a ScopedKey>) -> Vec<KeyConflict> {
    let mut by_key: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
    for scope in scopes {
        by_key
            .entry(scope.key.as_str())
            .or_default()
            .insert(scope.environment_id.as_str());
    }
    by_key
        .into_iter()
        .map(|(key, environments)| KeyConflict {
            key: key.to_owned(),
            environment_ids: environments.into_iter().map(str::to_owned).collect(),
        })
        .collect()
}

/// Per-key conflict errors, reordered to match the request.
fn conflict_errors(conflicts: Vec<KeyConflict>, variables: &[Variable]) -> CreateError {
    let mut by_key: HashMap<String, Vec<String>> = conflicts
        .into_iter()
        .map(|c| (c.key, c.environment_ids))
        .collect();

    let errors = variables
        .iter()
        .filter_map(|v| {
            by_key.remove(&v.key).map(|environment_ids| {
                VariableError::new(&v.key, VariableErrorKind::Conflict { environment_ids })
            })
        })
        .collect();

    CreateError::Variables(errors)
}

/// Log the cause and hide it behind the opaque batch error.
fn infrastructure(project_id: &str, err: impl Into<RepositoryError>) -> CreateError {
    let err = err.into();
    tracing::error!(project_id, error = %err, "failed to store environment variables");
    BatchError::Infrastructure(err).into()
}
