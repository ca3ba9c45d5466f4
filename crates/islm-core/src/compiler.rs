//! Turns typed migration steps into dialect-specific SQL.
//!
//! The compiler never interpolates raw identifiers: every name is an [`Ident`]
//! quoted by the dialect and every value goes through [`SqlDialect::literal`].

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::definition::{
    MigrationDefinition, MigrationStep, MigrationVersion, RoutineKind, RoutineNames, StatusProbe,
};
use crate::schema::{
    ColumnDescriptor, ColumnType, DefaultValue, Ident, IndexDescriptor, SeedRow, SqlValue,
    TableDescriptor,
};
use crate::{hash_json, IslmError};

pub const GOVERNANCE_TABLE: &str = "islm_governance";
pub const TEST_RESULT_TABLE: &str = "islm_test_result";
pub const DIAGNOSTICS_TABLE: &str = "islm_exception_diagnostics";
pub const ROUTINE_TABLE: &str = "islm_migration_routine";
pub const LOCK_TABLE: &str = "islm_advisory_lock";

pub trait SqlDialect: Send + Sync {
    fn name(&self) -> &'static str;

    fn quote(&self, ident: &Ident) -> String {
        format!("\"{ident}\"")
    }

    /// Fully qualified reference to a warehouse object.
    fn qualify(&self, ident: &Ident) -> String;

    fn column_type(&self, column_type: ColumnType) -> &'static str;

    fn boolean_literal(&self, value: bool) -> &'static str;

    fn literal(&self, value: &SqlValue) -> String {
        match value {
            SqlValue::Boolean(flag) => self.boolean_literal(*flag).to_string(),
            SqlValue::Integer(number) => number.to_string(),
            SqlValue::Text(text) => text_literal(text),
        }
    }

    fn default_expression(&self, default: &DefaultValue) -> String {
        match default {
            DefaultValue::Null => "NULL".to_string(),
            DefaultValue::CurrentTimestamp => "CURRENT_TIMESTAMP".to_string(),
            DefaultValue::Value(value) => self.literal(value),
        }
    }

    fn column_definition(&self, column: &ColumnDescriptor) -> String {
        let mut definition = format!(
            "{} {}",
            self.quote(&column.name),
            self.column_type(column.column_type)
        );
        if column.primary_key {
            definition.push_str(" PRIMARY KEY");
        }
        if !column.nullable || column.primary_key {
            definition.push_str(" NOT NULL");
        }
        if let Some(default) = &column.default {
            definition.push_str(" DEFAULT ");
            definition.push_str(&self.default_expression(default));
        }
        definition
    }

    fn create_table(&self, table: &TableDescriptor) -> String {
        let mut parts: Vec<String> = table
            .columns
            .iter()
            .map(|column| self.column_definition(column))
            .collect();
        for unique in &table.unique {
            parts.push(format!("UNIQUE ({})", self.column_list(unique)));
        }
        for fk in &table.foreign_keys {
            parts.push(format!(
                "FOREIGN KEY ({}) REFERENCES {} ({})",
                self.quote(&fk.column),
                self.qualify(&fk.references_table),
                self.quote(&fk.references_column)
            ));
        }

        format!(
            "CREATE TABLE IF NOT EXISTS {} (\n    {}\n)",
            self.qualify(&table.name),
            parts.join(",\n    ")
        )
    }

    fn column_list(&self, columns: &[Ident]) -> String {
        columns
            .iter()
            .map(|column| self.quote(column))
            .collect::<Vec<_>>()
            .join(", ")
    }

    fn create_index(&self, index: &IndexDescriptor) -> String {
        format!(
            "CREATE {}INDEX IF NOT EXISTS {} ON {} ({})",
            if index.unique { "UNIQUE " } else { "" },
            self.quote(&index.name),
            self.qualify(&index.table),
            self.column_list(&index.columns)
        )
    }

    /// Index build that runs outside the migration transaction.
    fn deferred_index(&self, index: &IndexDescriptor) -> String {
        self.create_index(index)
    }

    fn drop_index(&self, name: &Ident) -> String {
        format!("DROP INDEX IF EXISTS {}", self.qualify(name))
    }

    fn add_column(&self, table: &Ident, column: &ColumnDescriptor) -> String {
        format!(
            "ALTER TABLE {} ADD COLUMN {}",
            self.qualify(table),
            self.column_definition(column)
        )
    }

    fn drop_column(&self, table: &Ident, column: &Ident) -> String {
        format!(
            "ALTER TABLE {} DROP COLUMN {}",
            self.qualify(table),
            self.quote(column)
        )
    }

    fn drop_table(&self, table: &Ident) -> String {
        format!("DROP TABLE IF EXISTS {}", self.qualify(table))
    }

    fn insert_ignore(&self, table: &Ident, row: &SeedRow) -> String {
        let columns: Vec<String> = row.keys().map(|column| self.quote(column)).collect();
        let values: Vec<String> = row.values().map(|value| self.literal(value)).collect();
        format!(
            "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT DO NOTHING",
            self.qualify(table),
            columns.join(", "),
            values.join(", ")
        )
    }

    /// Boolean SQL expression over catalog metadata only.
    fn probe_condition(&self, probe: &StatusProbe) -> String;

    /// Single-row, single-column query yielding `0` or `1`.
    fn probe_query(&self, probe: &StatusProbe) -> String {
        format!(
            "SELECT CASE WHEN {} THEN 1 ELSE 0 END",
            self.probe_condition(probe)
        )
    }

    /// DDL for the ledger, test result, diagnostics, routine and lock tables.
    fn governance_schema(&self) -> String;
}

pub(crate) fn text_literal(text: &str) -> String {
    format!("'{}'", text.replace('\'', "''"))
}

fn combine(dialect: &dyn SqlDialect, probes: &[StatusProbe], joiner: &str, empty: &str) -> String {
    if probes.is_empty() {
        return empty.to_string();
    }
    let parts: Vec<String> = probes
        .iter()
        .map(|probe| dialect.probe_condition(probe))
        .collect();
    format!("({})", parts.join(joiner))
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteDialect;

const SQLITE_GOVERNANCE_SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS islm_governance (
  seq INTEGER PRIMARY KEY AUTOINCREMENT,
  islm_governance_id TEXT NOT NULL UNIQUE,
  namespace TEXT NOT NULL,
  migrate_version TEXT NOT NULL,
  sp_migration TEXT NOT NULL,
  sp_migration_undo TEXT NOT NULL,
  fn_migration_status TEXT NOT NULL,
  from_state TEXT NOT NULL CHECK (from_state IN ('NONE', 'SQLLOADED', 'MIGRATED', 'ROLLEDBACK', 'FAILED')),
  to_state TEXT NOT NULL CHECK (to_state IN ('NONE', 'SQLLOADED', 'MIGRATED', 'ROLLEDBACK', 'FAILED')),
  transition_reason TEXT NOT NULL,
  transition_result TEXT NOT NULL,
  created_at TEXT NOT NULL,
  created_by TEXT NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS ux_islm_governance_load
  ON islm_governance(namespace, migrate_version, from_state, to_state)
  WHERE from_state = 'NONE' AND to_state = 'SQLLOADED';

CREATE INDEX IF NOT EXISTS idx_islm_governance_version
  ON islm_governance(namespace, migrate_version, seq);

CREATE TRIGGER IF NOT EXISTS trg_islm_governance_no_update
BEFORE UPDATE ON islm_governance
BEGIN
  SELECT RAISE(FAIL, 'islm_governance is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_islm_governance_no_delete
BEFORE DELETE ON islm_governance
BEGIN
  SELECT RAISE(FAIL, 'islm_governance is append-only');
END;

CREATE TABLE IF NOT EXISTS islm_test_result (
  seq INTEGER PRIMARY KEY AUTOINCREMENT,
  namespace TEXT NOT NULL,
  migration_version TEXT,
  test_name TEXT NOT NULL,
  tap_output TEXT NOT NULL,
  success INTEGER NOT NULL CHECK (success IN (0, 1)),
  created_at TEXT NOT NULL,
  created_by TEXT NOT NULL,
  provenance TEXT
);

CREATE INDEX IF NOT EXISTS idx_islm_test_result_namespace
  ON islm_test_result(namespace, seq);

CREATE TRIGGER IF NOT EXISTS trg_islm_test_result_no_update
BEFORE UPDATE ON islm_test_result
BEGIN
  SELECT RAISE(FAIL, 'islm_test_result is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_islm_test_result_no_delete
BEFORE DELETE ON islm_test_result
BEGIN
  SELECT RAISE(FAIL, 'islm_test_result is append-only');
END;

CREATE TABLE IF NOT EXISTS islm_exception_diagnostics (
  seq INTEGER PRIMARY KEY AUTOINCREMENT,
  namespace TEXT NOT NULL,
  migrate_version TEXT NOT NULL,
  routine TEXT NOT NULL,
  code TEXT NOT NULL,
  message TEXT NOT NULL,
  detail TEXT,
  hint TEXT,
  context TEXT,
  created_at TEXT NOT NULL,
  created_by TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS islm_migration_routine (
  routine_name TEXT PRIMARY KEY,
  namespace TEXT NOT NULL,
  migrate_version TEXT NOT NULL,
  kind TEXT NOT NULL CHECK (kind IN ('apply', 'rollback', 'status')),
  body_json TEXT NOT NULL,
  checksum TEXT NOT NULL,
  installed_at TEXT NOT NULL
);

CREATE TRIGGER IF NOT EXISTS trg_islm_migration_routine_no_update
BEFORE UPDATE ON islm_migration_routine
BEGIN
  SELECT RAISE(FAIL, 'islm_migration_routine is append-only');
END;

CREATE TABLE IF NOT EXISTS islm_advisory_lock (
  lock_key INTEGER PRIMARY KEY,
  operation TEXT NOT NULL,
  holder TEXT NOT NULL,
  acquired_at_unix INTEGER NOT NULL,
  expires_at_unix INTEGER NOT NULL
);
";

impl SqlDialect for SqliteDialect {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn qualify(&self, ident: &Ident) -> String {
        self.quote(ident)
    }

    fn column_type(&self, column_type: ColumnType) -> &'static str {
        match column_type {
            ColumnType::Text | ColumnType::Json | ColumnType::Timestamp => "TEXT",
            ColumnType::Integer | ColumnType::Boolean => "INTEGER",
        }
    }

    fn boolean_literal(&self, value: bool) -> &'static str {
        if value {
            "1"
        } else {
            "0"
        }
    }

    fn probe_condition(&self, probe: &StatusProbe) -> String {
        match probe {
            StatusProbe::ColumnExists { table, column } => format!(
                "EXISTS (SELECT 1 FROM pragma_table_info({}) WHERE name = {})",
                text_literal(table.as_str()),
                text_literal(column.as_str())
            ),
            StatusProbe::ColumnAbsent { table, column } => format!(
                "NOT {}",
                self.probe_condition(&StatusProbe::ColumnExists {
                    table: table.clone(),
                    column: column.clone(),
                })
            ),
            StatusProbe::TableExists { table } => format!(
                "EXISTS (SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = {})",
                text_literal(table.as_str())
            ),
            StatusProbe::TableAbsent { table } => format!(
                "NOT {}",
                self.probe_condition(&StatusProbe::TableExists {
                    table: table.clone()
                })
            ),
            StatusProbe::IndexExists { name } => format!(
                "EXISTS (SELECT 1 FROM sqlite_master WHERE type = 'index' AND name = {})",
                text_literal(name.as_str())
            ),
            StatusProbe::IndexAbsent { name } => format!(
                "NOT {}",
                self.probe_condition(&StatusProbe::IndexExists { name: name.clone() })
            ),
            StatusProbe::AllOf { probes } => combine(self, probes, " AND ", "1 = 1"),
            StatusProbe::AnyOf { probes } => combine(self, probes, " OR ", "1 = 0"),
            StatusProbe::Never => "1 = 0".to_string(),
        }
    }

    fn governance_schema(&self) -> String {
        SQLITE_GOVERNANCE_SCHEMA.to_string()
    }
}

/// PL/pgSQL target. Warehouse objects live in `schema`; the ledger tables live
/// in `governance_schema`.
#[derive(Debug, Clone)]
pub struct PostgresDialect {
    pub schema: Ident,
    pub governance_schema: Ident,
}

impl PostgresDialect {
    #[must_use]
    pub fn new(schema: Ident, governance_schema: Ident) -> Self {
        Self {
            schema,
            governance_schema,
        }
    }

    #[must_use]
    pub fn governance_table(&self, table: &str) -> String {
        format!("{}.\"{table}\"", self.quote(&self.governance_schema))
    }

}

impl SqlDialect for PostgresDialect {
    fn name(&self) -> &'static str {
        "postgres"
    }

    fn qualify(&self, ident: &Ident) -> String {
        format!("{}.{}", self.quote(&self.schema), self.quote(ident))
    }

    fn column_type(&self, column_type: ColumnType) -> &'static str {
        match column_type {
            ColumnType::Text => "TEXT",
            ColumnType::Integer => "BIGINT",
            ColumnType::Boolean => "BOOLEAN",
            ColumnType::Json => "JSONB",
            ColumnType::Timestamp => "TIMESTAMPTZ",
        }
    }

    fn boolean_literal(&self, value: bool) -> &'static str {
        if value {
            "TRUE"
        } else {
            "FALSE"
        }
    }

    fn deferred_index(&self, index: &IndexDescriptor) -> String {
        self.create_index(index)
            .replacen("INDEX IF NOT EXISTS", "INDEX CONCURRENTLY IF NOT EXISTS", 1)
    }

    fn probe_condition(&self, probe: &StatusProbe) -> String {
        let schema = text_literal(self.schema.as_str());
        match probe {
            StatusProbe::ColumnExists { table, column } => format!(
                "EXISTS (SELECT 1 FROM information_schema.columns WHERE table_schema = {schema} AND table_name = {} AND column_name = {})",
                text_literal(table.as_str()),
                text_literal(column.as_str())
            ),
            StatusProbe::ColumnAbsent { table, column } => format!(
                "NOT {}",
                self.probe_condition(&StatusProbe::ColumnExists {
                    table: table.clone(),
                    column: column.clone(),
                })
            ),
            StatusProbe::TableExists { table } => format!(
                "EXISTS (SELECT 1 FROM information_schema.tables WHERE table_schema = {schema} AND table_name = {})",
                text_literal(table.as_str())
            ),
            StatusProbe::TableAbsent { table } => format!(
                "NOT {}",
                self.probe_condition(&StatusProbe::TableExists {
                    table: table.clone()
                })
            ),
            StatusProbe::IndexExists { name } => format!(
                "EXISTS (SELECT 1 FROM pg_indexes WHERE schemaname = {schema} AND indexname = {})",
                text_literal(name.as_str())
            ),
            StatusProbe::IndexAbsent { name } => format!(
                "NOT {}",
                self.probe_condition(&StatusProbe::IndexExists { name: name.clone() })
            ),
            StatusProbe::AllOf { probes } => combine(self, probes, " AND ", "TRUE"),
            StatusProbe::AnyOf { probes } => combine(self, probes, " OR ", "FALSE"),
            StatusProbe::Never => "FALSE".to_string(),
        }
    }

    fn governance_schema(&self) -> String {
        let schema = self.quote(&self.governance_schema);
        let governance = self.governance_table(GOVERNANCE_TABLE);
        let test_result = self.governance_table(TEST_RESULT_TABLE);
        let diagnostics = self.governance_table(DIAGNOSTICS_TABLE);
        format!(
            r"CREATE SCHEMA IF NOT EXISTS {schema};

CREATE TABLE IF NOT EXISTS {governance} (
  seq BIGSERIAL PRIMARY KEY,
  islm_governance_id TEXT NOT NULL UNIQUE,
  namespace TEXT NOT NULL,
  migrate_version TEXT NOT NULL,
  sp_migration TEXT NOT NULL,
  sp_migration_undo TEXT NOT NULL,
  fn_migration_status TEXT NOT NULL,
  from_state TEXT NOT NULL CHECK (from_state IN ('NONE', 'SQLLOADED', 'MIGRATED', 'ROLLEDBACK', 'FAILED')),
  to_state TEXT NOT NULL CHECK (to_state IN ('NONE', 'SQLLOADED', 'MIGRATED', 'ROLLEDBACK', 'FAILED')),
  transition_reason TEXT NOT NULL,
  transition_result JSONB NOT NULL DEFAULT '{{}}'::jsonb,
  created_at TIMESTAMPTZ NOT NULL DEFAULT CURRENT_TIMESTAMP,
  created_by TEXT NOT NULL DEFAULT 'Admin'
);

CREATE UNIQUE INDEX IF NOT EXISTS ux_islm_governance_load
  ON {governance} (namespace, migrate_version, from_state, to_state)
  WHERE from_state = 'NONE' AND to_state = 'SQLLOADED';

CREATE TABLE IF NOT EXISTS {test_result} (
  seq BIGSERIAL PRIMARY KEY,
  namespace TEXT NOT NULL,
  migration_version TEXT,
  test_name TEXT NOT NULL,
  tap_output TEXT NOT NULL,
  success BOOLEAN NOT NULL,
  created_at TIMESTAMPTZ NOT NULL DEFAULT CURRENT_TIMESTAMP,
  created_by TEXT NOT NULL DEFAULT 'Admin',
  provenance TEXT
);

CREATE TABLE IF NOT EXISTS {diagnostics} (
  seq BIGSERIAL PRIMARY KEY,
  namespace TEXT NOT NULL,
  migrate_version TEXT NOT NULL,
  routine TEXT NOT NULL,
  code TEXT NOT NULL,
  message TEXT NOT NULL,
  detail TEXT,
  hint TEXT,
  context TEXT,
  created_at TIMESTAMPTZ NOT NULL DEFAULT CURRENT_TIMESTAMP,
  created_by TEXT NOT NULL DEFAULT 'Admin'
);

CREATE OR REPLACE FUNCTION {schema}.islm_append_only() RETURNS trigger
LANGUAGE plpgsql AS $islmAppendOnly$
BEGIN
  RAISE EXCEPTION '% is append-only', TG_TABLE_NAME;
END;
$islmAppendOnly$;

DROP TRIGGER IF EXISTS trg_islm_governance_append_only ON {governance};
CREATE TRIGGER trg_islm_governance_append_only
  BEFORE UPDATE OR DELETE ON {governance}
  FOR EACH ROW EXECUTE FUNCTION {schema}.islm_append_only();

DROP TRIGGER IF EXISTS trg_islm_test_result_append_only ON {test_result};
CREATE TRIGGER trg_islm_test_result_append_only
  BEFORE UPDATE OR DELETE ON {test_result}
  FOR EACH ROW EXECUTE FUNCTION {schema}.islm_append_only();
"
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum StepMode {
    /// Runs inside the version's single transaction.
    Transactional,
    /// Transactional, but a unique-constraint conflict is logged and skipped.
    Seed,
    /// Runs after commit, outside any transaction, under the named advisory lock.
    Deferred { lock_operation: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CompiledStep {
    pub label: String,
    pub sql: String,
    /// Skip the statement when this probe evaluates to 1 against the live catalog.
    #[serde(default)]
    pub skip_when: Option<StatusProbe>,
    pub mode: StepMode,
}

impl CompiledStep {
    fn transactional(label: String, sql: String, skip_when: Option<StatusProbe>) -> Self {
        Self {
            label,
            sql,
            skip_when,
            mode: StepMode::Transactional,
        }
    }

    #[must_use]
    pub fn is_deferred(&self) -> bool {
        matches!(self.mode, StepMode::Deferred { .. })
    }
}

/// Orders tables so that every referenced table precedes its dependents.
///
/// Ties are broken by role rank and then by name. References to tables outside
/// `tables` are assumed to exist already.
///
/// # Errors
/// Returns [`IslmError::Compile`] for duplicate table names or reference cycles.
pub fn order_tables(tables: Vec<TableDescriptor>) -> Result<Vec<TableDescriptor>, IslmError> {
    let mut by_name: BTreeMap<Ident, TableDescriptor> = BTreeMap::new();
    for table in tables {
        let name = table.name.clone();
        if by_name.insert(name.clone(), table).is_some() {
            return Err(IslmError::Compile(format!(
                "table {name} is declared more than once"
            )));
        }
    }

    let mut pending: BTreeMap<Ident, BTreeSet<Ident>> = by_name
        .iter()
        .map(|(name, table)| {
            let deps = table
                .references()
                .filter(|reference| by_name.contains_key(*reference))
                .cloned()
                .collect();
            (name.clone(), deps)
        })
        .collect();

    let mut ordered = Vec::with_capacity(by_name.len());
    loop {
        let next = pending
            .iter()
            .filter(|(_, deps)| deps.is_empty())
            .map(|(name, _)| {
                let rank = by_name.get(name).map_or(u8::MAX, |table| table.role.rank());
                (rank, name.clone())
            })
            .min();
        let Some((_, name)) = next else {
            break;
        };

        pending.remove(&name);
        for deps in pending.values_mut() {
            deps.remove(&name);
        }
        if let Some(table) = by_name.remove(&name) {
            ordered.push(table);
        }
    }

    if !pending.is_empty() {
        let names: Vec<&str> = pending.keys().map(Ident::as_str).collect();
        return Err(IslmError::Compile(format!(
            "foreign key cycle detected among tables: {}",
            names.join(", ")
        )));
    }

    Ok(ordered)
}

/// # Errors
/// Returns [`IslmError`] when a table spec is invalid, tables form a cycle, or a
/// step is structurally empty.
pub fn compile_steps(
    steps: &[MigrationStep],
    dialect: &dyn SqlDialect,
) -> Result<Vec<CompiledStep>, IslmError> {
    let mut compiled = Vec::new();
    for step in steps {
        match step {
            MigrationStep::CreateSchemaObjects { tables } => {
                let described = tables
                    .iter()
                    .map(crate::schema::TableSpec::describe)
                    .collect::<Result<Vec<_>, _>>()?;
                for table in order_tables(described)? {
                    compiled.push(CompiledStep::transactional(
                        format!("create table {}", table.name),
                        dialect.create_table(&table),
                        None,
                    ));
                    for row in &table.seed {
                        compiled.push(seed_step(dialect, &table.name, row)?);
                    }
                }
            }
            MigrationStep::AddColumn { table, column } => {
                compiled.push(CompiledStep::transactional(
                    format!("add column {table}.{}", column.name),
                    dialect.add_column(table, column),
                    Some(StatusProbe::ColumnExists {
                        table: table.clone(),
                        column: column.name.clone(),
                    }),
                ));
            }
            MigrationStep::DropColumn { table, column } => {
                compiled.push(CompiledStep::transactional(
                    format!("drop column {table}.{column}"),
                    dialect.drop_column(table, column),
                    Some(StatusProbe::ColumnAbsent {
                        table: table.clone(),
                        column: column.clone(),
                    }),
                ));
            }
            MigrationStep::CreateIndex(index) => {
                if index.columns.is_empty() {
                    return Err(IslmError::Compile(format!(
                        "index {} must cover at least one column",
                        index.name
                    )));
                }
                let skip_when = Some(StatusProbe::IndexExists {
                    name: index.name.clone(),
                });
                let label = format!("create index {}", index.name);
                if index.deferred {
                    compiled.push(CompiledStep {
                        label,
                        sql: dialect.deferred_index(index),
                        skip_when,
                        mode: StepMode::Deferred {
                            lock_operation: format!("islm_index_build:{}", index.name),
                        },
                    });
                } else {
                    compiled.push(CompiledStep::transactional(
                        label,
                        dialect.create_index(index),
                        skip_when,
                    ));
                }
            }
            MigrationStep::DropIndex { name } => {
                compiled.push(CompiledStep::transactional(
                    format!("drop index {name}"),
                    dialect.drop_index(name),
                    None,
                ));
            }
            MigrationStep::DropTable { table } => {
                compiled.push(CompiledStep::transactional(
                    format!("drop table {table}"),
                    dialect.drop_table(table),
                    None,
                ));
            }
            MigrationStep::Seed { table, rows } => {
                for row in rows {
                    compiled.push(seed_step(dialect, table, row)?);
                }
            }
            MigrationStep::Statement { sql } => {
                let sql = sql.trim().trim_end_matches(';').trim();
                if sql.is_empty() {
                    return Err(IslmError::Compile(
                        "statement step must not be empty".to_string(),
                    ));
                }
                compiled.push(CompiledStep::transactional(
                    "statement".to_string(),
                    sql.to_string(),
                    None,
                ));
            }
        }
    }
    Ok(compiled)
}

fn seed_step(
    dialect: &dyn SqlDialect,
    table: &Ident,
    row: &SeedRow,
) -> Result<CompiledStep, IslmError> {
    if row.is_empty() {
        return Err(IslmError::Compile(format!(
            "seed row for {table} must set at least one column"
        )));
    }
    Ok(CompiledStep {
        label: format!("seed {table}"),
        sql: dialect.insert_ignore(table, row),
        skip_when: None,
        mode: StepMode::Seed,
    })
}

/// A single migration version compiled for one dialect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledMigration {
    pub version: MigrationVersion,
    pub routines: RoutineNames,
    pub apply: Vec<CompiledStep>,
    pub rollback: Vec<CompiledStep>,
    pub status: StatusProbe,
    pub status_query: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutineBody {
    pub name: String,
    pub kind: RoutineKind,
    pub body: Value,
    pub checksum: String,
}

impl CompiledMigration {
    #[must_use]
    pub fn version_id(&self) -> String {
        self.version.version_id()
    }

    /// The three installable routines, each with its own body checksum.
    ///
    /// # Errors
    /// Returns [`IslmError::Compile`] if a body cannot be serialized.
    pub fn routine_bodies(&self) -> Result<Vec<RoutineBody>, IslmError> {
        let apply = serde_json::to_value(&self.apply)
            .map_err(|err| IslmError::Compile(format!("failed to encode apply body: {err}")))?;
        let rollback = serde_json::to_value(&self.rollback)
            .map_err(|err| IslmError::Compile(format!("failed to encode rollback body: {err}")))?;
        let status = json!({
            "probe": serde_json::to_value(&self.status)
                .map_err(|err| IslmError::Compile(format!("failed to encode status probe: {err}")))?,
            "query": self.status_query,
        });

        [
            (self.routines.migrate.clone(), RoutineKind::Apply, apply),
            (self.routines.undo.clone(), RoutineKind::Rollback, rollback),
            (self.routines.status.clone(), RoutineKind::Status, status),
        ]
        .into_iter()
        .map(|(name, kind, body)| -> Result<RoutineBody, IslmError> {
            let checksum = hash_json(&body)?;
            Ok(RoutineBody {
                name,
                kind,
                body,
                checksum,
            })
        })
        .collect()
    }

    /// Checksum over all three routine bodies.
    ///
    /// # Errors
    /// Returns [`IslmError::Compile`] if a body cannot be serialized.
    pub fn checksum(&self) -> Result<String, IslmError> {
        let checksums: Vec<String> = self
            .routine_bodies()?
            .into_iter()
            .map(|routine| routine.checksum)
            .collect();
        Ok(crate::hash_bytes(checksums.join(":").as_bytes()))
    }

    #[must_use]
    pub fn transactional_apply(&self) -> Vec<CompiledStep> {
        self.apply
            .iter()
            .filter(|step| !step.is_deferred())
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn deferred_apply(&self) -> Vec<CompiledStep> {
        self.apply
            .iter()
            .filter(|step| step.is_deferred())
            .cloned()
            .collect()
    }
}

/// # Errors
/// Returns [`IslmError`] when any step fails to compile.
pub fn compile_migration(
    definition: &MigrationDefinition,
    dialect: &dyn SqlDialect,
) -> Result<CompiledMigration, IslmError> {
    Ok(CompiledMigration {
        version: definition.version.clone(),
        routines: definition.version.routine_names(),
        apply: compile_steps(&definition.apply, dialect)?,
        rollback: compile_steps(&definition.rollback, dialect)?,
        status: definition.status.clone(),
        status_query: dialect.probe_query(&definition.status),
    })
}

/// Decodes an installed apply or rollback routine body.
///
/// # Errors
/// Returns [`IslmError::Configuration`] when the stored body is not a step list.
pub fn decode_steps(body: &Value) -> Result<Vec<CompiledStep>, IslmError> {
    serde_json::from_value(body.clone()).map_err(|err| {
        IslmError::Configuration(format!("installed routine body is not a step list: {err}"))
    })
}
