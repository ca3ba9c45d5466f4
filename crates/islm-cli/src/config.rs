//! `islm.toml` migration manifests and the connections file.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use islm_core::{
    Ident, MigrationDefinition, MigrationRegistry, MigrationStep, MigrationVersion,
    PostgresDialect, StatusProbe, TestSuite, DEFAULT_ACTOR,
};
use serde::Deserialize;
use time::OffsetDateTime;

pub const CONNECTIONS_ENV: &str = "ISLM_CONNECTIONS";

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Manifest {
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default = "default_actor")]
    pub actor: String,
    /// Artifact directory, relative to the manifest file.
    #[serde(default = "default_target")]
    pub target: PathBuf,
    #[serde(default)]
    pub postgres: PostgresSettings,
    #[serde(default)]
    pub migrations: Vec<MigrationEntry>,
    #[serde(default)]
    pub suites: Vec<TestSuite>,
    #[serde(skip)]
    base_dir: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PostgresSettings {
    #[serde(default = "default_schema")]
    pub schema: String,
    #[serde(default = "default_governance_schema")]
    pub governance_schema: String,
}

impl Default for PostgresSettings {
    fn default() -> Self {
        Self {
            schema: default_schema(),
            governance_schema: default_governance_schema(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MigrationEntry {
    pub description: String,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    #[serde(default)]
    pub apply: Vec<MigrationStep>,
    #[serde(default)]
    pub rollback: Vec<MigrationStep>,
    pub status: StatusProbe,
}

impl Manifest {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read manifest {}", path.display()))?;
        let mut manifest: Self = toml::from_str(&raw)
            .with_context(|| format!("failed to parse manifest {}", path.display()))?;
        manifest.base_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        Ok(manifest)
    }

    /// Builds the registry. Versions are validated here, before any database
    /// is opened.
    pub fn registry(&self) -> Result<MigrationRegistry> {
        let mut definitions = Vec::with_capacity(self.migrations.len());
        for entry in &self.migrations {
            let version = MigrationVersion::new(entry.description.clone(), entry.timestamp)?;
            definitions.push(MigrationDefinition::new(
                version,
                entry.apply.clone(),
                entry.rollback.clone(),
                entry.status.clone(),
            ));
        }
        Ok(MigrationRegistry::from_definitions(definitions)?)
    }

    pub fn postgres_dialect(&self) -> Result<PostgresDialect> {
        Ok(PostgresDialect::new(
            Ident::new(self.postgres.schema.clone())?,
            Ident::new(self.postgres.governance_schema.clone())?,
        ))
    }

    /// `explicit` wins over the manifest's `target`.
    #[must_use]
    pub fn target_dir(&self, explicit: Option<&Path>) -> PathBuf {
        match explicit {
            Some(path) => path.to_path_buf(),
            None if self.target.is_absolute() => self.target.clone(),
            None => self.base_dir.join(&self.target),
        }
    }

    pub fn suite(&self, name: &str) -> Result<&TestSuite> {
        self.suites
            .iter()
            .find(|suite| suite.name == name)
            .ok_or_else(|| anyhow!("manifest has no test suite named `{name}`"))
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConnectionsFile {
    #[serde(default)]
    pub connections: BTreeMap<String, ConnectionEntry>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConnectionEntry {
    /// SQLite database file.
    pub path: PathBuf,
}

/// `explicit` (flag or `ISLM_CONNECTIONS`) or `~/.islm/connections.toml`.
pub fn connections_path(explicit: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = explicit {
        return Ok(path.to_path_buf());
    }
    let home = dirs::home_dir()
        .ok_or_else(|| anyhow!("cannot locate a home directory; set {CONNECTIONS_ENV}"))?;
    Ok(home.join(".islm").join("connections.toml"))
}

pub fn resolve_connection(conn_id: &str, connections_file: &Path) -> Result<PathBuf> {
    let raw = std::fs::read_to_string(connections_file).with_context(|| {
        format!(
            "failed to read connections file {}",
            connections_file.display()
        )
    })?;
    let file: ConnectionsFile = toml::from_str(&raw).with_context(|| {
        format!(
            "failed to parse connections file {}",
            connections_file.display()
        )
    })?;

    let entry = file.connections.get(conn_id).ok_or_else(|| {
        anyhow!(
            "connection `{conn_id}` is not defined in {}",
            connections_file.display()
        )
    })?;

    if entry.path.is_absolute() {
        return Ok(entry.path.clone());
    }
    Ok(connections_file
        .parent()
        .map_or_else(|| entry.path.clone(), |dir| dir.join(&entry.path)))
}

fn default_namespace() -> String {
    "dv".to_string()
}

fn default_actor() -> String {
    DEFAULT_ACTOR.to_string()
}

fn default_target() -> PathBuf {
    PathBuf::from("target/islm")
}

fn default_schema() -> String {
    "dv".to_string()
}

fn default_governance_schema() -> String {
    "info_schema_lifecycle".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    const MANIFEST: &str = r#"
namespace = "dv"
target = "generated"

[[migrations]]
description = "update-table1"
timestamp = "2024-08-02T10:00:00Z"
status = { kind = "column_exists", table = "sat_exception_diagnostics", column = "elaboration" }

[[migrations.apply]]
kind = "add_column"
table = "sat_exception_diagnostics"
column = { name = "elaboration", type = "json", nullable = true }

[[migrations.rollback]]
kind = "drop_column"
table = "sat_exception_diagnostics"
column = "elaboration"

[[migrations]]
description = "create-tables"
timestamp = "2024-08-01T10:00:00Z"
status = { kind = "table_exists", table = "hub_exception" }

[[migrations.apply]]
kind = "create_schema_objects"
tables = [{ role = "hub", name = "exception" }]

[[migrations.apply]]
kind = "create_index"
name = "idx_hub_exception_key"
table = "hub_exception"
columns = ["key"]
deferred = true

[[suites]]
name = "smoke"

[[suites.assertions]]
kind = "probe"
description = "ledger exists"
probe = { kind = "table_exists", table = "islm_governance" }
"#;

    fn parsed() -> Manifest {
        must_ok(toml::from_str::<Manifest>(MANIFEST))
    }

    #[test]
    fn manifest_builds_an_ordered_registry() {
        let manifest = parsed();
        let registry = must_ok(manifest.registry());
        let ids: Vec<String> = registry
            .list()
            .iter()
            .map(MigrationDefinition::version_id)
            .collect();

        assert_eq!(
            ids,
            vec![
                "v2024_08_01_10_00_00_create_tables".to_string(),
                "v2024_08_02_10_00_00_update_table1".to_string(),
            ]
        );
        assert_eq!(must_ok(manifest.suite("smoke")).assertions.len(), 1);
        assert!(manifest.suite("missing").is_err());
    }

    #[test]
    fn demo_manifest_parses() {
        let manifest = must_ok(toml::from_str::<Manifest>(include_str!(
            "../../../demos/islm.toml"
        )));
        let registry = must_ok(manifest.registry());

        assert_eq!(registry.list().len(), 2);
        assert_eq!(must_ok(manifest.suite("smoke")).assertions.len(), 2);
        must_ok(manifest.postgres_dialect());
    }

    #[test]
    fn long_descriptions_are_rejected_before_any_database_work() {
        let raw = MANIFEST.replace("update-table1", "a-description-that-is-too-long");
        let manifest = must_ok(toml::from_str::<Manifest>(&raw));
        match manifest.registry() {
            Ok(_) => panic!("registry should reject the description"),
            Err(err) => assert!(err.to_string().contains("at most 20")),
        }
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let raw = format!("{MANIFEST}\nunexpected = true\n");
        assert!(toml::from_str::<Manifest>(&raw).is_err());
    }

    #[test]
    fn target_dir_is_relative_to_the_manifest() {
        let mut manifest = parsed();
        manifest.base_dir = PathBuf::from("/work/project");
        assert_eq!(
            manifest.target_dir(None),
            PathBuf::from("/work/project/generated")
        );
        assert_eq!(
            manifest.target_dir(Some(Path::new("/tmp/out"))),
            PathBuf::from("/tmp/out")
        );
    }

    #[test]
    fn connection_ids_resolve_relative_to_the_connections_file() {
        let dir = std::env::temp_dir().join(format!(
            "islm-connections-{}",
            std::process::id()
        ));
        must_ok(std::fs::create_dir_all(&dir));
        let file = dir.join("connections.toml");
        must_ok(std::fs::write(
            &file,
            "[connections.local]\npath = \"local.sqlite3\"\n\n[connections.shared]\npath = \"/srv/islm.sqlite3\"\n",
        ));

        assert_eq!(
            must_ok(resolve_connection("local", &file)),
            dir.join("local.sqlite3")
        );
        assert_eq!(
            must_ok(resolve_connection("shared", &file)),
            PathBuf::from("/srv/islm.sqlite3")
        );
        assert!(resolve_connection("missing", &file).is_err());

        let _ = std::fs::remove_dir_all(&dir);
    }
}
