//! `envstore`: command-line front end for the envstore variable repository.
//!
//! Opens the configured storage backend directly, so every command runs as
//! one request against the repository.

#![allow(clippy::print_stdout, clippy::print_stderr)]

mod config;
mod dotenv;

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use envstore_core::{
    CreateError, CreateRequest, EncryptionKey, KeyValidator, SecretCipher, Variable,
    VariableErrorKind, VariableRepository,
};
use envstore_storage::{MemoryBackend, StorageBackend};

use crate::config::{StorageBackendType, StoreConfig};

// ── ANSI color helpers ───────────────────────────────────────────────

const RESET: &str = "\x1b[0m";
const BOLD: &str = "\x1b[1m";
const DIM: &str = "\x1b[2m";
const RED: &str = "\x1b[31m";
const GREEN: &str = "\x1b[32m";
const YELLOW: &str = "\x1b[33m";
const CYAN: &str = "\x1b[36m";

// ── CLI structure ────────────────────────────────────────────────────

/// envstore: project-scoped environment variables.
#[derive(Parser)]
#[command(
    name = "envstore",
    version,
    about = "envstore CLI: store environment variables across deployment environments",
    long_about = None,
    after_help = format!(
        "{DIM}Environment variables:{RESET}\n  \
         ENVSTORE_STORAGE          memory | redb | rocksdb | postgres (default: redb)\n  \
         ENVSTORE_STORAGE_PATH     Path for redb/RocksDB storage\n  \
         DATABASE_URL              PostgreSQL connection string\n  \
         ENVSTORE_ENCRYPTION_KEY   Base64 root key for secrets (see `envstore keygen`)\n  \
         ENVSTORE_LOG_LEVEL        Log filter (default: warn)\n\n\
         {DIM}Examples:{RESET}\n  \
         envstore create --project web --env dev --env staging --var PORT=8080\n  \
         envstore create --project web --env prod --from-file .env.prod --secret\n  \
         envstore get --project web --env dev PORT\n  \
         envstore list --project web --env dev"
    ),
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Store variables in one or more environments, all or nothing.
    Create {
        /// Project identifier.
        #[arg(long)]
        project: String,
        /// Target environment (repeatable).
        #[arg(long = "env", value_name = "ENV")]
        environments: Vec<String>,
        /// Variable as KEY=VALUE (repeatable).
        #[arg(long = "var", value_name = "KEY=VALUE")]
        vars: Vec<String>,
        /// Read variables from a .env file (added before any --var).
        #[arg(long, value_name = "PATH")]
        from_file: Option<String>,
        /// Encrypt every value in this batch at rest.
        #[arg(long)]
        secret: bool,
        /// Overwrite keys that already exist instead of failing.
        #[arg(long = "override")]
        allow_override: bool,
    },
    /// Print one variable's value (decrypted if secret).
    Get {
        /// Project identifier.
        #[arg(long)]
        project: String,
        /// Environment to read from.
        #[arg(long = "env", value_name = "ENV")]
        environment: String,
        /// Variable key.
        key: String,
    },
    /// List variables of one environment. Secret values are hidden.
    List {
        /// Project identifier.
        #[arg(long)]
        project: String,
        /// Environment to list.
        #[arg(long = "env", value_name = "ENV")]
        environment: String,
        /// Output as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Generate a new base64 root encryption key.
    Keygen,
}

// ── Setup ────────────────────────────────────────────────────────────

fn init_tracing(config: &StoreConfig) {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level)),
        )
        .with_writer(std::io::stderr)
        .json()
        .init();
}

async fn open_storage(backend: &StorageBackendType) -> Result<Arc<dyn StorageBackend>> {
    let storage: Arc<dyn StorageBackend> = match backend {
        StorageBackendType::Memory => {
            tracing::info!("using in-memory storage (data will not persist)");
            Arc::new(MemoryBackend::new())
        }
        #[cfg(feature = "redb-backend")]
        StorageBackendType::Redb { path } => {
            tracing::info!(path = %path, "using redb storage");
            Arc::new(
                envstore_storage::RedbBackend::open(path)
                    .context("failed to open redb storage")?,
            )
        }
        #[cfg(not(feature = "redb-backend"))]
        StorageBackendType::Redb { .. } => {
            bail!("redb backend requested but feature 'redb-backend' is not enabled");
        }
        #[cfg(feature = "rocksdb-backend")]
        StorageBackendType::RocksDb { path } => {
            tracing::info!(path = %path, "using RocksDB storage");
            Arc::new(
                envstore_storage::RocksDbBackend::open(path)
                    .context("failed to open RocksDB storage")?,
            )
        }
        #[cfg(not(feature = "rocksdb-backend"))]
        StorageBackendType::RocksDb { .. } => {
            bail!("RocksDB backend requested but feature 'rocksdb-backend' is not enabled");
        }
        #[cfg(feature = "postgres-backend")]
        StorageBackendType::Postgres { url } => {
            tracing::info!(url = %"[redacted]", "using PostgreSQL storage");
            Arc::new(
                envstore_storage::PostgresBackend::connect(url)
                    .await
                    .context("failed to connect to PostgreSQL storage")?,
            )
        }
        #[cfg(not(feature = "postgres-backend"))]
        StorageBackendType::Postgres { .. } => {
            bail!("PostgreSQL backend requested but feature 'postgres-backend' is not enabled");
        }
    };
    Ok(storage)
}

fn build_cipher(config: &StoreConfig) -> Result<SecretCipher> {
    let Some(encoded) = config.encryption_key.as_deref() else {
        tracing::debug!("no encryption key configured; secrets are unavailable");
        return Ok(SecretCipher::new());
    };
    let root_key =
        EncryptionKey::from_base64(encoded).context("invalid ENVSTORE_ENCRYPTION_KEY")?;
    SecretCipher::from_root_key(&root_key).context("failed to derive secrets key")
}

async fn build_repository(config: &StoreConfig) -> Result<VariableRepository> {
    let storage = open_storage(&config.storage_backend).await?;
    let cipher = build_cipher(config)?;
    Ok(VariableRepository::new(
        storage,
        Arc::new(cipher),
        KeyValidator::new(config.validation.clone()),
    ))
}

// ── Command dispatch ─────────────────────────────────────────────────

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let config = StoreConfig::from_env();
    init_tracing(&config);

    match run(&config, cli.command).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!();
            eprintln!("  {RED}{BOLD}✗ Error:{RESET} {e:#}");
            eprintln!();
            ExitCode::FAILURE
        }
    }
}

async fn run(config: &StoreConfig, cmd: Commands) -> Result<()> {
    match cmd {
        Commands::Keygen => {
            cmd_keygen();
            Ok(())
        }
        Commands::Create {
            project,
            environments,
            vars,
            from_file,
            secret,
            allow_override,
        } => {
            let mut variables = match from_file {
                Some(path) => read_env_file(&path)?,
                None => Vec::new(),
            };
            for pair in &vars {
                variables.push(parse_var(pair)?);
            }
            let request = CreateRequest {
                environment_ids: environments,
                variables,
                is_secret: secret,
                allow_override,
            };
            let repo = build_repository(config).await?;
            cmd_create(&repo, &project, request).await
        }
        Commands::Get {
            project,
            environment,
            key,
        } => {
            let repo = build_repository(config).await?;
            cmd_get(&repo, &project, &environment, &key).await
        }
        Commands::List {
            project,
            environment,
            json,
        } => {
            let repo = build_repository(config).await?;
            cmd_list(&repo, &project, &environment, json).await
        }
    }
}

// ── Input parsing ────────────────────────────────────────────────────

/// Parse a `KEY=VALUE` argument, splitting on the first `=`.
fn parse_var(pair: &str) -> Result<Variable> {
    let Some((key, value)) = pair.split_once('=') else {
        bail!("invalid --var '{pair}': expected KEY=VALUE");
    };
    Ok(Variable::new(key, value))
}

fn read_env_file(path: &str) -> Result<Vec<Variable>> {
    let file = std::path::Path::new(path);
    if !file.exists() {
        bail!("file not found: {path}");
    }
    let reader = std::fs::File::open(file).with_context(|| format!("failed to read {path}"))?;
    dotenv::parse_dotenv(reader).with_context(|| format!("failed to parse {path}"))
}

// ── Commands ─────────────────────────────────────────────────────────

fn cmd_keygen() {
    println!("{}", EncryptionKey::generate().to_base64());
}

async fn cmd_create(
    repo: &VariableRepository,
    project: &str,
    request: CreateRequest,
) -> Result<()> {
    if request.is_secret && !repo.can_seal() {
        bail!("--secret requires ENVSTORE_ENCRYPTION_KEY; generate one with `envstore keygen`");
    }
    let environments = request.environment_scope().len();
    let kind = if request.is_secret { "secret" } else { "plain" };

    match repo.create(project, request).await {
        Ok(summary) => {
            println!();
            println!(
                "  {GREEN}{BOLD}✓{RESET} Stored {BOLD}{}{RESET} {kind} row(s) across {BOLD}{environments}{RESET} environment(s)",
                summary.rows()
            );
            println!(
                "    {DIM}{} new, {} overwritten{RESET}",
                summary.inserted, summary.overwritten
            );
            println!();
            Ok(())
        }
        Err(CreateError::Variables(errors)) => {
            eprintln!();
            for error in &errors {
                eprintln!("  {RED}✗{RESET} {BOLD}{}{RESET}: {}", error.key, error.kind);
            }
            if errors
                .iter()
                .any(|e| matches!(e.kind, VariableErrorKind::Conflict { .. }))
            {
                eprintln!();
                eprintln!("  {YELLOW}Hint:{RESET} pass --override to replace existing values");
            }
            bail!("{} variable(s) rejected; nothing was written", errors.len())
        }
        Err(e @ CreateError::Batch(_)) => Err(anyhow::Error::new(e)),
    }
}

async fn cmd_get(
    repo: &VariableRepository,
    project: &str,
    environment: &str,
    key: &str,
) -> Result<()> {
    let variable = repo
        .get(project, environment, key)
        .await
        .context("failed to read variable")?;
    let Some(variable) = variable else {
        bail!("variable '{key}' not found in environment '{environment}'");
    };
    println!("{}", variable.value);
    Ok(())
}

async fn cmd_list(
    repo: &VariableRepository,
    project: &str,
    environment: &str,
    json: bool,
) -> Result<()> {
    let variables = repo
        .list(project, environment)
        .await
        .context("failed to list variables")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&variables)?);
        return Ok(());
    }

    if variables.is_empty() {
        println!("  {DIM}No variables in {project}/{environment}.{RESET}");
        return Ok(());
    }

    let width = variables.iter().map(|v| v.key.len()).max().unwrap_or(0);
    println!();
    println!("  {BOLD}{project}/{environment}{RESET}");
    println!();
    for variable in &variables {
        let shown = match &variable.value {
            Some(value) => value.clone(),
            None => format!("{DIM}•••••••• (secret){RESET}"),
        };
        println!(
            "  {CYAN}{:<width$}{RESET}  {DIM}v{}{RESET}  {shown}",
            variable.key, variable.version
        );
    }
    println!();
    Ok(())
}
