//! The `islm` command surface.
//!
//! Every subcommand maps to one handler function; [`run_cli`] is the only
//! dispatcher. Commands that touch a database take `--db` or `--conn-id`.

#![allow(clippy::missing_errors_doc)]

pub mod config;

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, Once};

use anyhow::{anyhow, bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use islm_core::{
    hash_bytes, render_artifacts, ArtifactManifest, ArtifactOptions, ArtifactSet, ArtifactTarget,
    MigrationRegistry, SqliteDialect, TestResult, MANIFEST_FILE,
};
use islm_orchestrator::{Orchestrator, OrchestratorConfig, TestGate, DEFAULT_LOCK_TIMEOUT};
use islm_store_core::LifecycleStore;
use islm_store_sqlite::SqliteLifecycleStore;
use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::{connections_path, resolve_connection, Manifest};

pub const LOG_ENV: &str = "ISLM_LOG";

#[derive(Debug, Parser)]
#[command(name = "islm")]
#[command(about = "Information schema lifecycle management")]
pub struct Cli {
    /// `SQLite` database file. Takes precedence over `--conn-id`.
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Connection identifier resolved through the connections file.
    #[arg(short = 'c', long, global = true)]
    conn_id: Option<String>,

    #[arg(long, global = true, env = "ISLM_CONNECTIONS")]
    connections: Option<PathBuf>,

    #[arg(long, global = true, default_value = "islm.toml")]
    manifest: PathBuf,

    /// Write log output to this file instead of stderr.
    #[arg(long, global = true)]
    log_results: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Generate installable artifacts.
    Generate {
        #[command(subcommand)]
        command: GenerateCommand,
    },
    /// Install every version from generated artifacts.
    Bootstrap(TargetArgs),
    Load(VersionArgs),
    Migrate(VersionArgs),
    Rollback(RollbackArgs),
    Status(VersionArgs),
    /// Run regression suites, or record external TAP output.
    Test(TestArgs),
    History(VersionArgs),
    /// Remove the artifact directory.
    Clean(TargetArgs),
    /// generate sql, bootstrap, then test.
    IslmBootstrap(GenerateSqlArgs),
    /// load, then migrate.
    IslmMigrate(VersionArgs),
}

#[derive(Debug, Subcommand)]
pub enum GenerateCommand {
    Sql(GenerateSqlArgs),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum DialectArg {
    Postgres,
    Sqlite,
}

#[derive(Debug, Args)]
pub struct GenerateSqlArgs {
    #[arg(short = 't', long)]
    target: Option<PathBuf>,
    #[arg(long, value_enum, default_value_t = DialectArg::Postgres)]
    dialect: DialectArg,
    /// Keep previously generated files instead of clearing them first.
    #[arg(long)]
    overwrite: bool,
}

#[derive(Debug, Args)]
pub struct TargetArgs {
    #[arg(short = 't', long)]
    target: Option<PathBuf>,
}

#[derive(Debug, Args)]
pub struct VersionArgs {
    /// Version id; all registered versions when omitted.
    #[arg(long)]
    migration: Option<String>,
}

#[derive(Debug, Args)]
pub struct RollbackArgs {
    #[arg(long)]
    migration: String,
}

#[derive(Debug, Args)]
pub struct TestArgs {
    /// Suite from the manifest; every suite when omitted.
    #[arg(long, conflicts_with = "tap_file")]
    suite: Option<String>,
    /// TAP output from an external runner such as `pg_prove`.
    #[arg(long)]
    tap_file: Option<PathBuf>,
    #[arg(long, default_value = "external")]
    test_name: String,
    #[arg(long)]
    migration: Option<String>,
}

pub fn run_cli(cli: Cli) -> Result<()> {
    init_tracing(cli.log_results.as_deref())?;
    let manifest = Manifest::load(&cli.manifest)?;
    let registry = manifest.registry()?;

    match &cli.command {
        Command::Generate {
            command: GenerateCommand::Sql(args),
        } => print_json(&generate_sql(&manifest, &registry, args)?),
        Command::Bootstrap(args) => {
            let store = open_store(&cli)?;
            print_json(&bootstrap(&manifest, &registry, &store, args.target.as_deref())?)
        }
        Command::Load(args) => {
            let store = open_store(&cli)?;
            let lifecycle = orchestrator(&manifest, &registry, &store);
            match &args.migration {
                Some(version_id) => print_json(&lifecycle.load(version_id)?),
                None => print_json(&lifecycle.load_all()?),
            }
        }
        Command::Migrate(args) => {
            let store = open_store(&cli)?;
            print_json(&migrate(&orchestrator(&manifest, &registry, &store), args)?)
        }
        Command::Rollback(args) => {
            let store = open_store(&cli)?;
            let lifecycle = orchestrator(&manifest, &registry, &store);
            print_json(&lifecycle.rollback(&args.migration)?)
        }
        Command::Status(args) => {
            let store = open_store(&cli)?;
            let lifecycle = orchestrator(&manifest, &registry, &store);
            match &args.migration {
                Some(version_id) => print_json(&lifecycle.status(version_id)?),
                None => print_json(&lifecycle.status_all()?),
            }
        }
        Command::Test(args) => {
            let store = open_store(&cli)?;
            let results = run_tests(&manifest, &store, args)?;
            print_json(&results)?;
            ensure_passed(&results)
        }
        Command::History(args) => {
            let store = open_store(&cli)?;
            let lifecycle = orchestrator(&manifest, &registry, &store);
            print_json(&lifecycle.history(args.migration.as_deref())?)
        }
        Command::Clean(args) => print_json(&clean(&manifest.target_dir(args.target.as_deref()))?),
        Command::IslmBootstrap(args) => {
            let generated = generate_sql(&manifest, &registry, args)?;
            let store = open_store(&cli)?;
            let loaded = bootstrap(&manifest, &registry, &store, args.target.as_deref())?;
            let tests = run_tests(
                &manifest,
                &store,
                &TestArgs {
                    suite: None,
                    tap_file: None,
                    test_name: "external".to_string(),
                    migration: None,
                },
            )?;
            print_json(&json!({ "generated": generated, "loaded": loaded, "tests": tests }))?;
            ensure_passed(&tests)
        }
        Command::IslmMigrate(args) => {
            let store = open_store(&cli)?;
            let lifecycle = orchestrator(&manifest, &registry, &store);
            let loaded = match &args.migration {
                Some(version_id) => serde_json::to_value(lifecycle.load(version_id)?)?,
                None => serde_json::to_value(lifecycle.load_all()?)?,
            };
            let migrated = migrate(&lifecycle, args)?;
            print_json(&json!({ "loaded": loaded, "migrated": migrated }))
        }
    }
}

/// Initializes tracing once per process. `ISLM_LOG` holds an `EnvFilter`
/// directive and defaults to `islm=info`.
pub fn init_tracing(log_file: Option<&Path>) -> Result<()> {
    static INIT: Once = Once::new();

    let writer = match log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open log file {}", path.display()))?;
            BoxMakeWriter::new(Mutex::new(file))
        }
        None => BoxMakeWriter::new(std::io::stderr),
    };
    let ansi = log_file.is_none();

    INIT.call_once(move || {
        let filter =
            EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("islm=info"));
        let _ = tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .with_writer(writer)
                    .with_ansi(ansi)
                    .with_target(true),
            )
            .with(filter)
            .try_init();
    });
    Ok(())
}

fn open_store(cli: &Cli) -> Result<SqliteLifecycleStore> {
    let path = match (&cli.db, &cli.conn_id) {
        (Some(path), _) => path.clone(),
        (None, Some(conn_id)) => {
            let file = connections_path(cli.connections.as_deref())?;
            resolve_connection(conn_id, &file)?
        }
        (None, None) => bail!("either --db or --conn-id is required for this command"),
    };

    let store = SqliteLifecycleStore::open(&path)?;
    store.migrate()?;
    Ok(store)
}

fn orchestrator<'a>(
    manifest: &Manifest,
    registry: &'a MigrationRegistry,
    store: &'a SqliteLifecycleStore,
) -> Orchestrator<'a> {
    Orchestrator::new(
        store,
        registry,
        OrchestratorConfig {
            namespace: manifest.namespace.clone(),
            actor: manifest.actor.clone(),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        },
    )
}

fn migrate(lifecycle: &Orchestrator<'_>, args: &VersionArgs) -> Result<serde_json::Value> {
    Ok(match &args.migration {
        Some(version_id) => serde_json::to_value(lifecycle.migrate(version_id)?)?,
        None => serde_json::to_value(lifecycle.migrate_pending()?)?,
    })
}

fn generate_sql(
    manifest: &Manifest,
    registry: &MigrationRegistry,
    args: &GenerateSqlArgs,
) -> Result<ArtifactManifest> {
    let set = render(manifest, registry, args.dialect)?;

    let dir = manifest.target_dir(args.target.as_deref());
    if dir.exists() && !args.overwrite {
        remove_generated(&dir)?;
    }
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create target directory {}", dir.display()))?;

    for artifact in &set.artifacts {
        let path = dir.join(&artifact.file_name);
        std::fs::write(&path, &artifact.content)
            .with_context(|| format!("failed to write {}", path.display()))?;
    }
    let manifest_path = dir.join(MANIFEST_FILE);
    std::fs::write(&manifest_path, serde_json::to_string_pretty(&set.manifest)?)
        .with_context(|| format!("failed to write {}", manifest_path.display()))?;

    info!(
        target_dir = %dir.display(),
        dialect = %set.manifest.dialect,
        files = set.artifacts.len(),
        "artifacts generated"
    );
    Ok(set.manifest)
}

fn bootstrap(
    manifest: &Manifest,
    registry: &MigrationRegistry,
    store: &SqliteLifecycleStore,
    target: Option<&Path>,
) -> Result<serde_json::Value> {
    let dir = manifest.target_dir(target);
    verify_generated(manifest, registry, &dir)?;

    let lifecycle = orchestrator(manifest, registry, store);
    let loaded = lifecycle.load_all()?;
    Ok(serde_json::to_value(loaded)?)
}

fn render(
    manifest: &Manifest,
    registry: &MigrationRegistry,
    dialect: DialectArg,
) -> Result<ArtifactSet> {
    let target = match dialect {
        DialectArg::Postgres => ArtifactTarget::Postgres(manifest.postgres_dialect()?),
        DialectArg::Sqlite => ArtifactTarget::Sqlite(SqliteDialect),
    };
    Ok(render_artifacts(
        registry,
        &target,
        &ArtifactOptions {
            namespace: manifest.namespace.clone(),
            actor: manifest.actor.clone(),
        },
    )?)
}

/// Re-renders the recorded dialect and compares every script on disk with
/// it, so a manifest edited after `generate sql` cannot be loaded.
fn verify_generated(manifest: &Manifest, registry: &MigrationRegistry, dir: &Path) -> Result<()> {
    let manifest_path = dir.join(MANIFEST_FILE);
    require_generated(&manifest_path)?;
    let raw = std::fs::read_to_string(&manifest_path)
        .with_context(|| format!("failed to read {}", manifest_path.display()))?;
    let recorded: ArtifactManifest = serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse {}", manifest_path.display()))?;

    let dialect = match recorded.dialect.as_str() {
        "postgres" => DialectArg::Postgres,
        "sqlite" => DialectArg::Sqlite,
        other => bail!("{} records unknown dialect `{other}`", manifest_path.display()),
    };
    let expected = render(manifest, registry, dialect)?;
    if recorded != expected.manifest {
        return Err(out_of_date(&manifest_path));
    }

    for artifact in &expected.artifacts {
        let path = dir.join(&artifact.file_name);
        require_generated(&path)?;
        let on_disk =
            std::fs::read(&path).with_context(|| format!("failed to read {}", path.display()))?;
        if hash_bytes(&on_disk) != hash_bytes(artifact.content.as_bytes()) {
            return Err(out_of_date(&path));
        }
    }
    Ok(())
}

fn out_of_date(path: &Path) -> anyhow::Error {
    anyhow!(
        "{} is out of date. Did you run 'generate sql' command?",
        path.display()
    )
}

fn require_generated(path: &Path) -> Result<()> {
    if path.exists() {
        return Ok(());
    }
    Err(anyhow!(
        "{} does not exist. Did you run 'generate sql' command?",
        path.display()
    ))
}

fn run_tests(
    manifest: &Manifest,
    store: &dyn LifecycleStore,
    args: &TestArgs,
) -> Result<Vec<TestResult>> {
    let gate = TestGate::new(store, &manifest.actor);

    let results: Vec<TestResult> = if let Some(path) = &args.tap_file {
        let tap = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read TAP file {}", path.display()))?;
        vec![gate.record_tap(
            &manifest.namespace,
            &args.test_name,
            args.migration.as_deref(),
            &tap,
            &format!("tap-file:{}", path.display()),
        )?]
    } else {
        let suites = match &args.suite {
            Some(name) => vec![manifest.suite(name)?],
            None => manifest.suites.iter().collect(),
        };
        if suites.is_empty() {
            bail!("the manifest defines no test suites");
        }
        suites
            .into_iter()
            .map(|suite| gate.run_suite(&manifest.namespace, suite, args.migration.as_deref()))
            .collect::<Result<_>>()?
    };

    Ok(results)
}

fn ensure_passed(results: &[TestResult]) -> Result<()> {
    if let Some(failed) = results.iter().find(|result| !result.success) {
        warn!(test_name = %failed.test_name, "regression tests failed");
        bail!(
            "test `{}` failed; migrate is not allowed until a passing run is recorded",
            failed.test_name
        );
    }
    Ok(())
}

fn clean(dir: &Path) -> Result<serde_json::Value> {
    let existed = dir.exists();
    if existed {
        if !dir.join(MANIFEST_FILE).exists() {
            bail!(
                "refusing to remove {}: no {MANIFEST_FILE} found, it was not written by 'generate sql'",
                dir.display()
            );
        }
        std::fs::remove_dir_all(dir)
            .with_context(|| format!("failed to remove {}", dir.display()))?;
        info!(target_dir = %dir.display(), "artifact directory removed");
    }
    Ok(json!({ "target": dir.display().to_string(), "removed": existed }))
}

fn remove_generated(dir: &Path) -> Result<()> {
    let entries =
        std::fs::read_dir(dir).with_context(|| format!("failed to list {}", dir.display()))?;
    for entry in entries {
        let path = entry?.path();
        let generated = path.file_name().and_then(|name| name.to_str()).is_some_and(|name| {
            name == MANIFEST_FILE
                || (name.starts_with("driver_") && name.ends_with(".auto.sql"))
        });
        if generated {
            std::fs::remove_file(&path)
                .with_context(|| format!("failed to remove {}", path.display()))?;
        }
    }
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_line_parses_composite_commands() {
        let cli = match Cli::try_parse_from([
            "islm",
            "--db",
            "ledger.sqlite3",
            "islm-bootstrap",
            "--dialect",
            "sqlite",
            "--overwrite",
        ]) {
            Ok(cli) => cli,
            Err(err) => panic!("failed to parse: {err}"),
        };

        match cli.command {
            Command::IslmBootstrap(args) => {
                assert_eq!(args.dialect, DialectArg::Sqlite);
                assert!(args.overwrite);
            }
            other => panic!("unexpected command {other:?}"),
        }
        assert_eq!(cli.manifest, PathBuf::from("islm.toml"));
    }

    #[test]
    fn rollback_requires_an_explicit_version() {
        assert!(Cli::try_parse_from(["islm", "--db", "x.sqlite3", "rollback"]).is_err());
    }

    #[test]
    fn missing_artifact_message_points_at_generate() {
        let path = std::env::temp_dir().join("islm-missing-artifact.auto.sql");
        match require_generated(&path) {
            Ok(()) => panic!("missing file should fail"),
            Err(err) => assert_eq!(
                err.to_string(),
                format!(
                    "{} does not exist. Did you run 'generate sql' command?",
                    path.display()
                )
            ),
        }
    }
}
