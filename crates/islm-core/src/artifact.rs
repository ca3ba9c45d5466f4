//! Installable SQL artifacts: one install, migrate, rollback and destroy script
//! per version, plus a manifest listing every file with its checksum.

use serde::{Deserialize, Serialize};

use crate::compiler::{
    compile_migration, order_tables, text_literal, CompiledMigration, CompiledStep,
    PostgresDialect, SqlDialect, SqliteDialect, StepMode, DIAGNOSTICS_TABLE, GOVERNANCE_TABLE,
    ROUTINE_TABLE, TEST_RESULT_TABLE,
};
use crate::definition::{MigrationDefinition, MigrationStep};
use crate::registry::MigrationRegistry;
use crate::schema::TableSpec;
use crate::{hash_bytes, IslmError, TransitionStatus};

pub const MANIFEST_FILE: &str = "manifest.json";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Load,
    Migrate,
    Rollback,
    Destroy,
}

impl ArtifactKind {
    pub const ALL: [Self; 4] = [Self::Load, Self::Migrate, Self::Rollback, Self::Destroy];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Load => "load",
            Self::Migrate => "migrate",
            Self::Rollback => "rollback",
            Self::Destroy => "destroy",
        }
    }

    #[must_use]
    pub fn file_name(self, version_id: &str) -> String {
        let prefix = match self {
            Self::Load => "driver_islm_load_",
            Self::Migrate => "driver_migrate_",
            Self::Rollback => "driver_rollback_",
            Self::Destroy => "driver_destroy_",
        };
        format!("{prefix}{version_id}.auto.sql")
    }
}

#[derive(Debug, Clone)]
pub enum ArtifactTarget {
    Postgres(PostgresDialect),
    Sqlite(SqliteDialect),
}

impl ArtifactTarget {
    #[must_use]
    pub fn dialect(&self) -> &dyn SqlDialect {
        match self {
            Self::Postgres(dialect) => dialect,
            Self::Sqlite(dialect) => dialect,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ArtifactOptions {
    pub namespace: String,
    pub actor: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub kind: ArtifactKind,
    pub version_id: String,
    pub file_name: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ManifestEntry {
    pub file_name: String,
    pub kind: ArtifactKind,
    pub version_id: String,
    pub checksum: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ArtifactManifest {
    pub namespace: String,
    pub dialect: String,
    pub files: Vec<ManifestEntry>,
}

#[derive(Debug, Clone)]
pub struct ArtifactSet {
    pub artifacts: Vec<Artifact>,
    pub manifest: ArtifactManifest,
}

/// Renders four scripts per registered version, in registry order.
///
/// # Errors
/// Returns [`IslmError`] when a definition fails to compile.
pub fn render_artifacts(
    registry: &MigrationRegistry,
    target: &ArtifactTarget,
    options: &ArtifactOptions,
) -> Result<ArtifactSet, IslmError> {
    let mut artifacts = Vec::new();
    for definition in registry.list() {
        let compiled = compile_migration(definition, target.dialect())?;
        let predecessors: Vec<String> = registry
            .predecessors(&compiled.version_id())
            .iter()
            .map(MigrationDefinition::version_id)
            .collect();
        let successors: Vec<String> = registry
            .successors(&compiled.version_id())
            .iter()
            .map(MigrationDefinition::version_id)
            .collect();
        let context = RenderContext {
            options,
            compiled: &compiled,
            predecessors: &predecessors,
            successors: &successors,
        };

        for kind in ArtifactKind::ALL {
            let content = match target {
                ArtifactTarget::Postgres(dialect) => {
                    postgres_script(dialect, kind, &context, definition)?
                }
                ArtifactTarget::Sqlite(dialect) => sqlite_script(dialect, kind, &context, definition)?,
            };
            artifacts.push(Artifact {
                kind,
                version_id: compiled.version_id(),
                file_name: kind.file_name(&compiled.version_id()),
                content,
            });
        }
    }

    let manifest = ArtifactManifest {
        namespace: options.namespace.clone(),
        dialect: target.dialect().name().to_string(),
        files: artifacts
            .iter()
            .map(|artifact| ManifestEntry {
                file_name: artifact.file_name.clone(),
                kind: artifact.kind,
                version_id: artifact.version_id.clone(),
                checksum: hash_bytes(artifact.content.as_bytes()),
            })
            .collect(),
    };

    Ok(ArtifactSet {
        artifacts,
        manifest,
    })
}

struct RenderContext<'a> {
    options: &'a ArtifactOptions,
    compiled: &'a CompiledMigration,
    predecessors: &'a [String],
    successors: &'a [String],
}

fn header(kind: ArtifactKind, context: &RenderContext<'_>) -> String {
    format!(
        "-- islm {} script for {} (namespace {})\n-- generated file, do not edit\n\n",
        kind.as_str(),
        context.compiled.version_id(),
        context.options.namespace
    )
}

/// Tables created by the apply body, dependents first.
fn created_tables_reversed(
    definition: &MigrationDefinition,
) -> Result<Vec<crate::schema::Ident>, IslmError> {
    let mut described = Vec::new();
    for step in &definition.apply {
        if let MigrationStep::CreateSchemaObjects { tables } = step {
            for spec in tables {
                described.push(TableSpec::describe(spec)?);
            }
        }
    }
    let mut names: Vec<_> = order_tables(described)?
        .into_iter()
        .map(|table| table.name)
        .collect();
    names.reverse();
    Ok(names)
}

fn postgres_script(
    dialect: &PostgresDialect,
    kind: ArtifactKind,
    context: &RenderContext<'_>,
    definition: &MigrationDefinition,
) -> Result<String, IslmError> {
    let mut script = header(kind, context);
    script.push_str("\\set ON_ERROR_STOP on\n\n");
    let compiled = context.compiled;
    let namespace = text_literal(&context.options.namespace);
    let version = text_literal(&compiled.version_id());
    let routine = |name: &str| format!("{}.{}", dialect.quote(&dialect.governance_schema), quoted(name));
    let governance = dialect.governance_table(GOVERNANCE_TABLE);
    let latest = postgres_latest_state(&governance, &namespace, &version);

    match kind {
        ArtifactKind::Load => {
            script.push_str(&dialect.governance_schema());
            script.push_str(&format!(
                "\nCREATE SCHEMA IF NOT EXISTS {};\n\n",
                dialect.quote(&dialect.schema)
            ));
            script.push_str(&postgres_migrate_procedure(dialect, context));
            script.push_str(&postgres_undo_procedure(dialect, context));
            script.push_str(&format!(
                r"CREATE OR REPLACE FUNCTION {status}()
RETURNS INTEGER
LANGUAGE plpgsql AS $islmStatus$
DECLARE
  status INTEGER := 0;
BEGIN
  IF {condition} THEN
    status := 1;
  END IF;
  RETURN status;
END;
$islmStatus$;

INSERT INTO {governance} (
  islm_governance_id, namespace, migrate_version, sp_migration, sp_migration_undo,
  fn_migration_status, from_state, to_state, transition_reason, transition_result, created_by
) VALUES (
  gen_random_uuid()::text, {namespace}, {version}, {migrate}, {undo},
  {status_name}, 'NONE', 'SQLLOADED', 'SQL load for migration', '{{}}'::jsonb, {actor}
) ON CONFLICT DO NOTHING;
",
                status = routine(&compiled.routines.status),
                condition = dialect.probe_condition(&compiled.status),
                migrate = text_literal(&compiled.routines.migrate),
                undo = text_literal(&compiled.routines.undo),
                status_name = text_literal(&compiled.routines.status),
                actor = text_literal(&context.options.actor),
            ));
        }
        ArtifactKind::Migrate => {
            let deferred = compiled.deferred_apply();
            script.push_str(&postgres_call(dialect, context, &routine(&compiled.routines.migrate)));
            for step in &deferred {
                script.push_str(&postgres_deferred(step));
            }
            if !deferred.is_empty() {
                script.push_str("\n-- recorded once every deferred step has run\n");
                script.push_str(&postgres_ledger_insert(
                    dialect,
                    context,
                    &LedgerRow {
                        from_state: &latest,
                        to_state: TransitionStatus::Migrated,
                        reason: "Migration applied",
                        guard: &format!("{latest} <> 'MIGRATED'"),
                    },
                ));
            }
        }
        ArtifactKind::Rollback => {
            let deferred: Vec<&CompiledStep> =
                compiled.rollback.iter().filter(|step| step.is_deferred()).collect();
            script.push_str(&postgres_call(dialect, context, &routine(&compiled.routines.undo)));
            for step in &deferred {
                script.push_str(&postgres_deferred(step));
            }
            if !deferred.is_empty() {
                script.push_str("\n-- recorded once every deferred step has run\n");
                script.push_str(&postgres_ledger_insert(
                    dialect,
                    context,
                    &LedgerRow {
                        from_state: &latest,
                        to_state: TransitionStatus::RolledBack,
                        reason: "Migration rolled back",
                        guard: &format!("{latest} <> 'ROLLEDBACK'"),
                    },
                ));
            }
        }
        ArtifactKind::Destroy => {
            script.push_str(&format!(
                "DROP PROCEDURE IF EXISTS {}();\nDROP PROCEDURE IF EXISTS {}();\nDROP FUNCTION IF EXISTS {}();\n\n",
                routine(&compiled.routines.migrate),
                routine(&compiled.routines.undo),
                routine(&compiled.routines.status),
            ));
            for table in created_tables_reversed(definition)? {
                script.push_str(&format!("{};\n", dialect.drop_table(&table)));
            }
            script.push_str(&format!(
                "-- {DIAGNOSTICS_TABLE}, {GOVERNANCE_TABLE} and {TEST_RESULT_TABLE} are retained\n"
            ));
        }
    }
    Ok(script)
}

/// Calls a lifecycle procedure and fails the script when the call recorded
/// a new diagnostics row. The procedure itself swallows body errors so the
/// diagnostics insert survives its rollback.
fn postgres_call(dialect: &PostgresDialect, context: &RenderContext<'_>, procedure: &str) -> String {
    let namespace = text_literal(&context.options.namespace);
    let version = text_literal(&context.compiled.version_id());
    let diagnostics = dialect.governance_table(DIAGNOSTICS_TABLE);
    format!(
        r"DROP TABLE IF EXISTS pg_temp.islm_diagnostics_seen;
CREATE TEMP TABLE islm_diagnostics_seen AS
  SELECT COALESCE(MAX(seq), 0) AS seq FROM {diagnostics}
  WHERE namespace = {namespace} AND migrate_version = {version};

CALL {procedure}();

DO $islmCheck$
BEGIN
  IF EXISTS (
    SELECT 1 FROM {diagnostics} d, islm_diagnostics_seen seen
    WHERE d.namespace = {namespace} AND d.migrate_version = {version} AND d.seq > seen.seq
  ) THEN
    RAISE EXCEPTION 'Migration % failed. Details recorded in {DIAGNOSTICS_TABLE}.', {version};
  END IF;
END;
$islmCheck$;
"
    )
}

fn postgres_latest_state(governance: &str, namespace: &str, version: &str) -> String {
    format!(
        "COALESCE((SELECT to_state FROM {governance} WHERE namespace = {namespace} AND migrate_version = {version} ORDER BY seq DESC LIMIT 1), 'NONE')"
    )
}

fn postgres_version_array(versions: &[String]) -> String {
    let items: Vec<String> = versions.iter().map(|item| text_literal(item)).collect();
    format!("ARRAY[{}]::text[]", items.join(", "))
}

struct LedgerRow<'a> {
    from_state: &'a str,
    to_state: TransitionStatus,
    reason: &'a str,
    guard: &'a str,
}

fn postgres_ledger_insert(
    dialect: &PostgresDialect,
    context: &RenderContext<'_>,
    row: &LedgerRow<'_>,
) -> String {
    let compiled = context.compiled;
    format!(
        r"INSERT INTO {governance} (
  islm_governance_id, namespace, migrate_version, sp_migration, sp_migration_undo,
  fn_migration_status, from_state, to_state, transition_reason, transition_result, created_by
) SELECT
  gen_random_uuid()::text, {namespace}, {version}, {migrate}, {undo},
  {status}, {from_state}, '{to_state}', '{reason}', '{{}}'::jsonb, {actor}
WHERE {guard};
",
        governance = dialect.governance_table(GOVERNANCE_TABLE),
        namespace = text_literal(&context.options.namespace),
        version = text_literal(&compiled.version_id()),
        migrate = text_literal(&compiled.routines.migrate),
        undo = text_literal(&compiled.routines.undo),
        status = text_literal(&compiled.routines.status),
        from_state = row.from_state,
        to_state = row.to_state,
        reason = row.reason,
        guard = row.guard,
        actor = text_literal(&context.options.actor),
    )
}

fn postgres_body(dialect: &PostgresDialect, steps: &[CompiledStep]) -> String {
    let mut body = String::new();
    for step in steps.iter().filter(|step| !step.is_deferred()) {
        let statement = match step.mode {
            StepMode::Seed => format!(
                "BEGIN\n      {};\n    EXCEPTION WHEN unique_violation THEN\n      RAISE NOTICE '%: row already exists. Insert skipped.', {};\n    END;",
                step.sql,
                text_literal(&step.label)
            ),
            _ => format!("{};", step.sql),
        };
        body.push_str(&format!("    -- {}\n", step.label));
        match &step.skip_when {
            Some(probe) => body.push_str(&format!(
                "    IF NOT {} THEN\n      {statement}\n    END IF;\n",
                dialect.probe_condition(probe)
            )),
            None => body.push_str(&format!("    {statement}\n")),
        }
    }
    body
}

/// Inner block around a procedure body. A failure is written to the
/// diagnostics table and downgraded to a warning: re-raising would roll the
/// diagnostics row back together with the body.
fn postgres_guarded_body(
    dialect: &PostgresDialect,
    context: &RenderContext<'_>,
    routine: &str,
    body: &str,
    ledger: &str,
) -> String {
    let version = text_literal(&context.compiled.version_id());
    format!(
        r"  BEGIN
{body}{ledger}  EXCEPTION WHEN OTHERS THEN
    GET STACKED DIAGNOSTICS
      err_message = MESSAGE_TEXT,
      err_state = RETURNED_SQLSTATE,
      err_detail = PG_EXCEPTION_DETAIL,
      err_hint = PG_EXCEPTION_HINT,
      err_context = PG_EXCEPTION_CONTEXT;
    INSERT INTO {diagnostics} (
      namespace, migrate_version, routine, code, message, detail, hint, context, created_by
    ) VALUES (
      {namespace}, {version}, {routine}, err_state, err_message,
      NULLIF(err_detail, ''), NULLIF(err_hint, ''), NULLIF(err_context, ''), {actor}
    );
    RAISE WARNING 'Migration % failed in %: % (SQLSTATE %)', {version}, {routine}, err_message, err_state;
  END;
",
        diagnostics = dialect.governance_table(DIAGNOSTICS_TABLE),
        namespace = text_literal(&context.options.namespace),
        routine = text_literal(routine),
        actor = text_literal(&context.options.actor),
    )
}

/// The in-procedure ledger insert, or nothing when deferred steps follow the
/// call and the script records the transition itself.
fn postgres_procedure_ledger(
    dialect: &PostgresDialect,
    context: &RenderContext<'_>,
    has_deferred: bool,
    to_state: TransitionStatus,
    reason: &str,
) -> String {
    if has_deferred {
        return format!("    -- {to_state} is recorded by the script after its deferred steps\n");
    }
    let insert = postgres_ledger_insert(
        dialect,
        context,
        &LedgerRow {
            from_state: "current_state",
            to_state,
            reason,
            guard: "TRUE",
        },
    );
    insert
        .lines()
        .map(|line| format!("    {line}\n"))
        .collect()
}

const POSTGRES_ERROR_DECLARATIONS: &str = "  err_message TEXT;
  err_state TEXT;
  err_detail TEXT;
  err_hint TEXT;
  err_context TEXT;
";

fn postgres_migrate_procedure(dialect: &PostgresDialect, context: &RenderContext<'_>) -> String {
    let compiled = context.compiled;
    let namespace = text_literal(&context.options.namespace);
    let version = text_literal(&compiled.version_id());
    let governance = dialect.governance_table(GOVERNANCE_TABLE);
    let test_result = dialect.governance_table(TEST_RESULT_TABLE);
    let latest = postgres_latest_state(&governance, &namespace, &version);
    let prior_state = postgres_latest_state(&governance, &namespace, "prior.version");
    let ledger = postgres_procedure_ledger(
        dialect,
        context,
        !compiled.deferred_apply().is_empty(),
        TransitionStatus::Migrated,
        "Migration applied",
    );

    format!(
        r"CREATE OR REPLACE PROCEDURE {schema}.{name}()
LANGUAGE plpgsql AS $islmMigrate$
DECLARE
  islm_test_status BOOLEAN;
  current_state TEXT;
{declarations}BEGIN
  SELECT success INTO islm_test_status FROM {test_result}
    WHERE namespace = {namespace} ORDER BY seq DESC LIMIT 1;
  IF islm_test_status IS NOT TRUE THEN
    RAISE EXCEPTION 'ISLM test gate is closed for namespace %. Migration not allowed.', {namespace};
  END IF;

  current_state := {latest};
  IF current_state = 'MIGRATED' THEN
    RAISE NOTICE 'Migration % already applied.', {version};
    RETURN;
  END IF;
  IF current_state = 'NONE' THEN
    RAISE EXCEPTION 'Migration % is not loaded.', {version};
  END IF;

  IF EXISTS (
    SELECT 1 FROM unnest({predecessors}) AS prior(version)
    WHERE {prior_state} <> 'MIGRATED'
  ) THEN
    RAISE EXCEPTION 'Earlier versions must be migrated before %.', {version};
  END IF;

{guarded}END;
$islmMigrate$;

",
        schema = dialect.quote(&dialect.governance_schema),
        name = quoted(&compiled.routines.migrate),
        declarations = POSTGRES_ERROR_DECLARATIONS,
        predecessors = postgres_version_array(context.predecessors),
        guarded = postgres_guarded_body(
            dialect,
            context,
            &compiled.routines.migrate,
            &postgres_body(dialect, &compiled.apply),
            &ledger,
        ),
    )
}

fn postgres_undo_procedure(dialect: &PostgresDialect, context: &RenderContext<'_>) -> String {
    let compiled = context.compiled;
    let namespace = text_literal(&context.options.namespace);
    let version = text_literal(&compiled.version_id());
    let governance = dialect.governance_table(GOVERNANCE_TABLE);
    let latest = postgres_latest_state(&governance, &namespace, &version);
    let later_state = postgres_latest_state(&governance, &namespace, "later.version");
    let ledger = postgres_procedure_ledger(
        dialect,
        context,
        compiled.rollback.iter().any(CompiledStep::is_deferred),
        TransitionStatus::RolledBack,
        "Migration rolled back",
    );

    format!(
        r"CREATE OR REPLACE PROCEDURE {schema}.{name}()
LANGUAGE plpgsql AS $islmUndo$
DECLARE
  current_state TEXT;
{declarations}BEGIN
  current_state := {latest};
  IF current_state = 'ROLLEDBACK' THEN
    RAISE NOTICE 'Migration % already rolled back.', {version};
    RETURN;
  END IF;
  IF current_state NOT IN ('MIGRATED', 'FAILED') THEN
    RAISE EXCEPTION 'Migration % is not migrated (state %).', {version}, current_state;
  END IF;

  IF EXISTS (
    SELECT 1 FROM unnest({successors}) AS later(version)
    WHERE {later_state} = 'MIGRATED'
  ) THEN
    RAISE EXCEPTION 'Later versions must be rolled back before %.', {version};
  END IF;

{guarded}END;
$islmUndo$;

",
        schema = dialect.quote(&dialect.governance_schema),
        name = quoted(&compiled.routines.undo),
        declarations = POSTGRES_ERROR_DECLARATIONS,
        successors = postgres_version_array(context.successors),
        guarded = postgres_guarded_body(
            dialect,
            context,
            &compiled.routines.undo,
            &postgres_body(dialect, &compiled.rollback),
            &ledger,
        ),
    )
}

fn postgres_deferred(step: &CompiledStep) -> String {
    let StepMode::Deferred { lock_operation } = &step.mode else {
        return String::new();
    };
    let key = format!("hashtext({})", text_literal(lock_operation));
    format!(
        "\n-- {} (outside the migration transaction)\nSELECT pg_advisory_lock({key});\n{};\nSELECT pg_advisory_unlock({key});\n",
        step.label, step.sql
    )
}

// Routine names derive from validated version ids.
fn quoted(name: &str) -> String {
    format!("\"{name}\"")
}

fn sqlite_script(
    dialect: &SqliteDialect,
    kind: ArtifactKind,
    context: &RenderContext<'_>,
    definition: &MigrationDefinition,
) -> Result<String, IslmError> {
    let mut script = header(kind, context);
    let compiled = context.compiled;
    let namespace = text_literal(&context.options.namespace);
    let version = text_literal(&compiled.version_id());
    let actor = text_literal(&context.options.actor);
    let now = "strftime('%Y-%m-%dT%H:%M:%SZ', 'now')";
    let latest = sqlite_latest_state(&namespace, &version);
    let ledger_insert = |to_state: TransitionStatus, reason: &str, guard: &str, conflict: &str| {
        format!(
            "INSERT INTO {GOVERNANCE_TABLE} (\n  islm_governance_id, namespace, migrate_version, sp_migration, sp_migration_undo,\n  fn_migration_status, from_state, to_state, transition_reason, transition_result, created_at, created_by\n) SELECT\n  {SQLITE_ULID}, {namespace}, {version}, {}, {},\n  {}, {from}, '{to_state}', '{reason}', '{{}}', {now}, {actor}\nWHERE {guard}{conflict};\n",
            text_literal(&compiled.routines.migrate),
            text_literal(&compiled.routines.undo),
            text_literal(&compiled.routines.status),
            from = if to_state == TransitionStatus::SqlLoaded {
                "'NONE'".to_string()
            } else {
                latest.clone()
            },
        )
    };

    match kind {
        ArtifactKind::Load => {
            script.push_str(&dialect.governance_schema());
            script.push('\n');
            for routine in compiled.routine_bodies()? {
                let body = serde_json::to_string(&routine.body).map_err(|err| {
                    IslmError::Compile(format!("failed to encode routine body: {err}"))
                })?;
                script.push_str(&format!(
                    "INSERT OR IGNORE INTO {ROUTINE_TABLE} (routine_name, namespace, migrate_version, kind, body_json, checksum, installed_at)\nVALUES ({}, {namespace}, {version}, '{}', {}, '{}', {now});\n",
                    text_literal(&routine.name),
                    routine.kind.as_str(),
                    text_literal(&body),
                    routine.checksum,
                ));
            }
            script.push('\n');
            script.push_str(&ledger_insert(
                TransitionStatus::SqlLoaded,
                "SQL load for migration",
                "TRUE",
                " ON CONFLICT DO NOTHING",
            ));
        }
        ArtifactKind::Migrate => {
            script.push_str(SQLITE_BAIL_NOTE);
            script.push_str("BEGIN;\n\n");
            script.push_str(&sqlite_guard(
                "islm_gate_check",
                "ISLM test gate is closed. Migration not allowed.",
                &format!(
                    "COALESCE((SELECT success FROM {TEST_RESULT_TABLE} WHERE namespace = {namespace} ORDER BY seq DESC LIMIT 1), 0) <> 1"
                ),
            ));
            script.push_str(&sqlite_guard(
                "islm_loaded_check",
                "Migration is not loaded.",
                &format!("{latest} = 'NONE'"),
            ));
            script.push_str(&sqlite_guard(
                "islm_applied_check",
                "Migration already applied.",
                &format!("{latest} = 'MIGRATED'"),
            ));
            if !context.predecessors.is_empty() {
                script.push_str(&sqlite_guard(
                    "islm_predecessor_check",
                    "Earlier versions must be migrated first.",
                    &format!(
                        "EXISTS (SELECT 1 FROM ({}) AS prior WHERE {} <> 'MIGRATED')",
                        sqlite_version_rows(context.predecessors),
                        sqlite_latest_state(&namespace, "prior.version"),
                    ),
                ));
            }

            let deferred = compiled.deferred_apply();
            script.push_str(&sqlite_body(&compiled.transactional_apply()));
            if deferred.is_empty() {
                script.push_str(&ledger_insert(
                    TransitionStatus::Migrated,
                    "Migration applied",
                    "TRUE",
                    "",
                ));
            }
            script.push_str("\nCOMMIT;\n");
            for step in &deferred {
                script.push_str(&format!("\n-- {} (after commit)\n{};\n", step.label, step.sql));
            }
            if !deferred.is_empty() {
                script.push_str("\n-- recorded once every deferred step has run\n");
                script.push_str(&ledger_insert(
                    TransitionStatus::Migrated,
                    "Migration applied",
                    &format!("{latest} IN ('SQLLOADED', 'ROLLEDBACK', 'FAILED')"),
                    "",
                ));
            }
        }
        ArtifactKind::Rollback => {
            script.push_str(SQLITE_BAIL_NOTE);
            script.push_str("BEGIN;\n\n");
            script.push_str(&sqlite_guard(
                "islm_rolled_back_check",
                "Migration already rolled back.",
                &format!("{latest} = 'ROLLEDBACK'"),
            ));
            script.push_str(&sqlite_guard(
                "islm_migrated_check",
                "Migration is not migrated.",
                &format!("{latest} NOT IN ('MIGRATED', 'FAILED')"),
            ));
            if !context.successors.is_empty() {
                script.push_str(&sqlite_guard(
                    "islm_successor_check",
                    "Later versions must be rolled back first.",
                    &format!(
                        "EXISTS (SELECT 1 FROM ({}) AS later WHERE {} = 'MIGRATED')",
                        sqlite_version_rows(context.successors),
                        sqlite_latest_state(&namespace, "later.version"),
                    ),
                ));
            }
            script.push_str(&sqlite_body(&compiled.rollback));
            script.push_str(&ledger_insert(
                TransitionStatus::RolledBack,
                "Migration rolled back",
                "TRUE",
                "",
            ));
            script.push_str("\nCOMMIT;\n");
        }
        ArtifactKind::Destroy => {
            for table in created_tables_reversed(definition)? {
                script.push_str(&format!("{};\n", dialect.drop_table(&table)));
            }
            script.push_str(&format!(
                "-- {DIAGNOSTICS_TABLE}, {GOVERNANCE_TABLE} and {ROUTINE_TABLE} are retained\n"
            ));
        }
    }
    Ok(script)
}

/// A random 26-character Crockford id that parses as a ULID.
const SQLITE_ULID: &str = "(WITH RECURSIVE id(n, s) AS (SELECT 0, '' UNION ALL SELECT n + 1, s || substr('0123456789ABCDEFGHJKMNPQRSTVWXYZ', abs(random() % CASE WHEN n = 0 THEN 8 ELSE 32 END) + 1, 1) FROM id WHERE n < 26) SELECT s FROM id WHERE n = 26)";

const SQLITE_BAIL_NOTE: &str =
    "-- run with `sqlite3 -bail`: a failed guard rolls the transaction back\n\n";

fn sqlite_latest_state(namespace: &str, version: &str) -> String {
    format!(
        "COALESCE((SELECT to_state FROM {GOVERNANCE_TABLE} WHERE namespace = {namespace} AND migrate_version = {version} ORDER BY seq DESC LIMIT 1), 'NONE')"
    )
}

fn sqlite_version_rows(versions: &[String]) -> String {
    let rows: Vec<String> = versions
        .iter()
        .map(|item| format!("SELECT {} AS version", text_literal(item)))
        .collect();
    rows.join(" UNION ALL ")
}

/// Temp trigger that rolls the open transaction back when `violated` holds.
/// Trigger messages are constants, so they name no version.
fn sqlite_guard(name: &str, message: &str, violated: &str) -> String {
    format!(
        r"CREATE TEMP TABLE IF NOT EXISTS {name} (violated INTEGER);
CREATE TEMP TRIGGER IF NOT EXISTS {name}_guard
BEFORE INSERT ON {name}
WHEN NEW.violated
BEGIN
  SELECT RAISE(ROLLBACK, {message});
END;
INSERT INTO {name} (violated) SELECT {violated};

",
        message = text_literal(message)
    )
}

fn sqlite_body(steps: &[CompiledStep]) -> String {
    let mut body = String::new();
    for step in steps {
        body.push_str(&format!("-- {}\n", step.label));
        if step.skip_when.is_some() {
            body.push_str("-- guarded step: `islm migrate` skips it when already applied\n");
        }
        body.push_str(&format!("{};\n\n", step.sql));
    }
    body
}
