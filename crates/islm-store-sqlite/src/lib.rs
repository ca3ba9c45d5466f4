#![allow(clippy::missing_errors_doc)]

use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use islm_core::{
    advisory_lock_key, format_rfc3339, now_utc, parse_rfc3339_utc, BodyReport, CompiledMigration,
    CompiledStep, ExceptionDiagnostic, GovernanceRecord, GovernanceRecordInput, InstalledRoutine,
    LockLease, RoutineKind, SqlDialect, SqliteDialect, StepMode, TestResult, TestResultInput,
    TransitionStatus,
};
use islm_store_core::{LifecycleStore, LoadReceipt, LockTimeout, StateConflict};
use rusqlite::{ffi, params, Connection, OptionalExtension, Transaction, TransactionBehavior};
use serde_json::Value;
use time::OffsetDateTime;
use tracing::{debug, info, warn};
use ulid::Ulid;

/// Crashed holders lose their advisory locks after this long.
pub const DEFAULT_LOCK_LEASE: Duration = Duration::from_secs(15 * 60);

const MAX_LOCK_BACKOFF: Duration = Duration::from_secs(1);

const LEDGER_COLUMNS: &[&str] = &[
    "seq",
    "islm_governance_id",
    "namespace",
    "migrate_version",
    "sp_migration",
    "sp_migration_undo",
    "fn_migration_status",
    "from_state",
    "to_state",
    "transition_reason",
    "transition_result",
    "created_at",
    "created_by",
];

const GOVERNANCE_SELECT: &str = "SELECT
    seq, islm_governance_id, namespace, migrate_version, sp_migration, sp_migration_undo,
    fn_migration_status, from_state, to_state, transition_reason, transition_result,
    created_at, created_by
 FROM islm_governance";

const TEST_RESULT_SELECT: &str = "SELECT
    seq, namespace, migration_version, test_name, tap_output, success,
    created_at, created_by, provenance
 FROM islm_test_result";

pub struct SqliteLifecycleStore {
    conn: Connection,
    dialect: SqliteDialect,
    holder: String,
    lock_lease: Duration,
}

impl SqliteLifecycleStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self {
            conn,
            dialect: SqliteDialect,
            holder: format!("pid{}-{}", std::process::id(), Ulid::new()),
            lock_lease: DEFAULT_LOCK_LEASE,
        })
    }

    #[must_use]
    pub fn with_lock_lease(mut self, lease: Duration) -> Self {
        self.lock_lease = lease;
        self
    }

    #[must_use]
    pub fn holder(&self) -> &str {
        &self.holder
    }

    fn try_acquire(&self, lock_key: i64, operation: &str) -> Result<Option<LockLease>> {
        let now = now_utc();
        let expires_at = now + self.lock_lease;

        self.conn
            .execute(
                "DELETE FROM islm_advisory_lock WHERE lock_key = ?1 AND expires_at_unix <= ?2",
                params![lock_key, now.unix_timestamp()],
            )
            .context("failed to reclaim expired advisory lock")?;

        let changed = self
            .conn
            .execute(
                "INSERT INTO islm_advisory_lock(lock_key, operation, holder, acquired_at_unix, expires_at_unix)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(lock_key) DO UPDATE SET expires_at_unix = excluded.expires_at_unix
                 WHERE holder = excluded.holder",
                params![
                    lock_key,
                    operation,
                    self.holder,
                    now.unix_timestamp(),
                    expires_at.unix_timestamp()
                ],
            )
            .context("failed to acquire advisory lock")?;

        if changed == 0 {
            return Ok(None);
        }

        Ok(Some(LockLease {
            lock_key,
            operation: operation.to_string(),
            holder: self.holder.clone(),
            expires_at,
        }))
    }

    fn lock_holder(&self, lock_key: i64) -> Result<Option<String>> {
        self.conn
            .query_row(
                "SELECT holder FROM islm_advisory_lock WHERE lock_key = ?1",
                params![lock_key],
                |row| row.get(0),
            )
            .optional()
            .context("failed to read advisory lock holder")
    }

    #[cfg(test)]
    fn connection(&self) -> &Connection {
        &self.conn
    }
}

impl LifecycleStore for SqliteLifecycleStore {
    fn dialect(&self) -> &dyn SqlDialect {
        &self.dialect
    }

    fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(&self.dialect.governance_schema())
            .context("failed to apply governance schema")?;

        ensure_table_has_columns(&self.conn, "islm_governance", LEDGER_COLUMNS)?;
        Ok(())
    }

    fn install_routines(
        &self,
        migration: &CompiledMigration,
        load_record: &GovernanceRecordInput,
    ) -> Result<LoadReceipt> {
        load_record
            .validate()
            .map_err(|err| anyhow!("load record validation failed: {err}"))?;
        let routines = migration
            .routine_bodies()
            .map_err(|err| anyhow!("failed to encode routines: {err}"))?;
        let installed_at = format_rfc3339(now_utc()).map_err(|err| anyhow!(err.to_string()))?;

        let tx = self
            .conn
            .unchecked_transaction()
            .context("failed to start load transaction")?;

        let mut installed = false;
        for routine in &routines {
            let existing: Option<String> = tx
                .query_row(
                    "SELECT checksum FROM islm_migration_routine WHERE routine_name = ?1",
                    params![routine.name],
                    |row| row.get(0),
                )
                .optional()
                .context("failed to read installed routine checksum")?;

            match existing {
                Some(checksum) if checksum == routine.checksum => {}
                Some(checksum) => bail!(
                    "routine {} is installed with checksum {checksum}, refusing to replace it with {}",
                    routine.name,
                    routine.checksum
                ),
                None => {
                    tx.execute(
                        "INSERT INTO islm_migration_routine(
                            routine_name, namespace, migrate_version, kind, body_json, checksum, installed_at
                         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                        params![
                            routine.name,
                            load_record.namespace,
                            load_record.migrate_version,
                            routine.kind.as_str(),
                            serde_json::to_string(&routine.body)
                                .context("failed to serialize routine body")?,
                            routine.checksum,
                            installed_at,
                        ],
                    )
                    .with_context(|| format!("failed to install routine {}", routine.name))?;
                    installed = true;
                }
            }
        }

        let record = insert_governance(&tx, load_record, true)?;
        tx.commit().context("failed to commit load transaction")?;

        Ok(LoadReceipt {
            installed: installed || record.is_some(),
            record,
        })
    }

    fn installed_routines(&self, migrate_version: &str) -> Result<Vec<InstalledRoutine>> {
        let mut stmt = self.conn.prepare(
            "SELECT routine_name, namespace, migrate_version, kind, body_json, checksum, installed_at
             FROM islm_migration_routine
             WHERE migrate_version = ?1
             ORDER BY routine_name ASC",
        )?;
        let rows = stmt.query_map(params![migrate_version], parse_routine_row)?;
        collect_rows(rows)
    }

    fn current_state(&self, namespace: &str, migrate_version: &str) -> Result<TransitionStatus> {
        latest_state(&self.conn, namespace, migrate_version)
    }

    fn governance_history(
        &self,
        namespace: &str,
        migrate_version: Option<&str>,
    ) -> Result<Vec<GovernanceRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            "{GOVERNANCE_SELECT}
             WHERE namespace = ?1 AND (?2 IS NULL OR migrate_version = ?2)
             ORDER BY seq ASC"
        ))?;
        let rows = stmt.query_map(params![namespace, migrate_version], parse_governance_row)?;
        collect_rows(rows)
    }

    fn governance_count(&self) -> Result<i64> {
        self.conn
            .query_row("SELECT COUNT(*) FROM islm_governance", [], |row| row.get(0))
            .context("failed to count governance records")
    }

    fn append_governance(&self, record: &GovernanceRecordInput) -> Result<GovernanceRecord> {
        record
            .validate()
            .map_err(|err| anyhow!("governance record validation failed: {err}"))?;

        let tx = Transaction::new_unchecked(&self.conn, TransactionBehavior::Immediate)
            .context("failed to start governance transaction")?;
        ensure_from_state(&tx, record)?;
        let stored = insert_governance(&tx, record, false)?
            .ok_or_else(|| anyhow!("governance insert was ignored"))?;
        tx.commit().context("failed to commit governance transaction")?;
        Ok(stored)
    }

    fn execute_body(
        &self,
        routine: &str,
        steps: &[CompiledStep],
        record: &GovernanceRecordInput,
        append: bool,
    ) -> Result<(BodyReport, Option<GovernanceRecord>)> {
        record
            .validate()
            .map_err(|err| anyhow!("governance record validation failed: {err}"))?;

        let tx = Transaction::new_unchecked(&self.conn, TransactionBehavior::Immediate)
            .with_context(|| format!("failed to start transaction for {routine}"))?;
        ensure_from_state(&tx, record)?;

        let mut report = BodyReport::default();
        for (index, step) in steps.iter().enumerate() {
            if let Err(err) = run_step(&tx, &self.dialect, step, &mut report) {
                drop(tx);
                let diagnostic = diagnostic_from_error(record, routine, index, step, &err);
                warn!(
                    routine,
                    step = %step.label,
                    code = %diagnostic.code,
                    "migration body failed; transaction rolled back"
                );
                if let Err(sink_err) = self.record_diagnostic(&diagnostic) {
                    warn!(routine, error = %sink_err, "failed to record exception diagnostics");
                }
                return Err(err.context(format!(
                    "step {} ({}) of {routine} failed",
                    index + 1,
                    step.label
                )));
            }
        }

        let stored = if append {
            Some(
                insert_governance(&tx, record, false)?
                    .ok_or_else(|| anyhow!("governance insert was ignored"))?,
            )
        } else {
            None
        };
        tx.commit()
            .with_context(|| format!("failed to commit transaction for {routine}"))?;

        debug!(
            routine,
            executed = report.executed.len(),
            skipped = report.skipped.len(),
            "migration body committed"
        );
        Ok((report, stored))
    }

    fn execute_deferred(&self, step: &CompiledStep) -> Result<BodyReport> {
        let mut report = BodyReport::default();
        run_step(&self.conn, &self.dialect, step, &mut report)?;
        Ok(report)
    }

    fn evaluate_probe(&self, query: &str) -> Result<bool> {
        let mut stmt = self
            .conn
            .prepare(query)
            .context("failed to prepare status probe")?;
        if !stmt.readonly() {
            bail!("status probe must be read-only");
        }
        let value: Option<i64> = stmt
            .query_row([], |row| row.get(0))
            .optional()
            .context("failed to evaluate status probe")?;
        Ok(value.unwrap_or(0) != 0)
    }

    fn run_assertion(&self, query: &str) -> Result<bool> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("failed to start assertion transaction")?;

        let outcome = tx
            .query_row(query, [], |row| row.get::<_, rusqlite::types::Value>(0))
            .optional()
            .context("assertion query failed");

        tx.rollback()
            .context("failed to roll back assertion transaction")?;

        Ok(match outcome? {
            Some(rusqlite::types::Value::Integer(number)) => number != 0,
            Some(rusqlite::types::Value::Real(number)) => number != 0.0,
            Some(rusqlite::types::Value::Text(text)) => {
                text.trim().parse::<i64>().is_ok_and(|number| number != 0)
            }
            Some(rusqlite::types::Value::Null | rusqlite::types::Value::Blob(_)) | None => false,
        })
    }

    fn append_test_result(&self, input: &TestResultInput) -> Result<TestResult> {
        input
            .validate()
            .map_err(|err| anyhow!("test result validation failed: {err}"))?;
        let created_at = now_utc();

        self.conn
            .execute(
                "INSERT INTO islm_test_result(
                    namespace, migration_version, test_name, tap_output, success,
                    created_at, created_by, provenance
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    input.namespace,
                    input.migration_version,
                    input.test_name,
                    input.tap_output,
                    bool_to_sql(input.success),
                    format_rfc3339(created_at).map_err(|err| anyhow!(err.to_string()))?,
                    input.created_by,
                    input.provenance,
                ],
            )
            .context("failed to append test result")?;

        Ok(TestResult {
            seq: self.conn.last_insert_rowid(),
            namespace: input.namespace.clone(),
            migration_version: input.migration_version.clone(),
            test_name: input.test_name.clone(),
            tap_output: input.tap_output.clone(),
            success: input.success,
            created_at,
            created_by: input.created_by.clone(),
            provenance: input.provenance.clone(),
        })
    }

    fn latest_test_result(&self, namespace: &str) -> Result<Option<TestResult>> {
        self.conn
            .query_row(
                &format!("{TEST_RESULT_SELECT} WHERE namespace = ?1 ORDER BY seq DESC LIMIT 1"),
                params![namespace],
                parse_test_result_row,
            )
            .optional()
            .context("failed to read latest test result")
    }

    fn record_diagnostic(&self, diagnostic: &ExceptionDiagnostic) -> Result<()> {
        let created_at = format_rfc3339(now_utc()).map_err(|err| anyhow!(err.to_string()))?;
        self.conn
            .execute(
                "INSERT INTO islm_exception_diagnostics(
                    namespace, migrate_version, routine, code, message, detail, hint, context,
                    created_at, created_by
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    diagnostic.namespace,
                    diagnostic.migrate_version,
                    diagnostic.routine,
                    diagnostic.code,
                    diagnostic.message,
                    diagnostic.detail,
                    diagnostic.hint,
                    diagnostic.context,
                    created_at,
                    diagnostic.created_by,
                ],
            )
            .context("failed to record exception diagnostics")?;
        Ok(())
    }

    fn diagnostics(&self, namespace: &str) -> Result<Vec<ExceptionDiagnostic>> {
        let mut stmt = self.conn.prepare(
            "SELECT namespace, migrate_version, routine, code, message, detail, hint, context, created_by
             FROM islm_exception_diagnostics
             WHERE namespace = ?1
             ORDER BY seq ASC",
        )?;
        let rows = stmt.query_map(params![namespace], |row| {
            Ok(ExceptionDiagnostic {
                namespace: row.get(0)?,
                migrate_version: row.get(1)?,
                routine: row.get(2)?,
                code: row.get(3)?,
                message: row.get(4)?,
                detail: row.get(5)?,
                hint: row.get(6)?,
                context: row.get(7)?,
                created_by: row.get(8)?,
            })
        })?;
        collect_rows(rows)
    }

    fn acquire_advisory_lock(&self, operation: &str, timeout: Duration) -> Result<LockLease> {
        let lock_key = advisory_lock_key(operation);
        let started = Instant::now();
        let mut backoff = Duration::from_millis(25);

        loop {
            if let Some(lease) = self.try_acquire(lock_key, operation)? {
                debug!(operation, lock_key, "advisory lock acquired");
                return Ok(lease);
            }

            let waited = started.elapsed();
            if waited >= timeout {
                let holder = self
                    .lock_holder(lock_key)?
                    .unwrap_or_else(|| "unknown".to_string());
                return Err(LockTimeout {
                    operation: operation.to_string(),
                    holder,
                    waited_ms: waited.as_millis(),
                }
                .into());
            }

            std::thread::sleep(backoff.min(timeout - waited));
            backoff = (backoff * 2).min(MAX_LOCK_BACKOFF);
        }
    }

    fn release_advisory_lock(&self, lease: &LockLease) -> Result<()> {
        let removed = self
            .conn
            .execute(
                "DELETE FROM islm_advisory_lock WHERE lock_key = ?1 AND holder = ?2",
                params![lease.lock_key, lease.holder],
            )
            .context("failed to release advisory lock")?;
        if removed == 0 {
            warn!(
                operation = %lease.operation,
                "advisory lock was already released or reclaimed"
            );
        }
        Ok(())
    }

    fn catalog_snapshot(&self) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT type || ':' || name || ':' || COALESCE(sql, '')
             FROM sqlite_master
             ORDER BY type ASC, name ASC",
        )?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        collect_rows(rows)
    }
}

fn run_step(
    conn: &Connection,
    dialect: &SqliteDialect,
    step: &CompiledStep,
    report: &mut BodyReport,
) -> Result<()> {
    if let Some(probe) = &step.skip_when {
        let applied: i64 = conn
            .query_row(&dialect.probe_query(probe), [], |row| row.get(0))
            .with_context(|| format!("failed to evaluate guard for {}", step.label))?;
        if applied != 0 {
            debug!(step = %step.label, "guard satisfied, step skipped");
            report.skipped.push(step.label.clone());
            return Ok(());
        }
    }

    match (&step.mode, conn.execute_batch(&step.sql)) {
        (_, Ok(())) => {
            report.executed.push(step.label.clone());
            Ok(())
        }
        (StepMode::Seed, Err(err)) if is_unique_violation(&err) => {
            let notice = format!("{}: row already exists. Insert skipped.", step.label);
            info!(step = %step.label, "{notice}");
            report.notices.push(notice);
            Ok(())
        }
        (_, Err(err)) => Err(err).with_context(|| format!("failed to execute {}", step.label)),
    }
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(failure, _)
            if failure.extended_code == ffi::SQLITE_CONSTRAINT_UNIQUE
                || failure.extended_code == ffi::SQLITE_CONSTRAINT_PRIMARYKEY
    )
}

fn sqlite_code_name(extended_code: i32) -> String {
    let name = match extended_code {
        ffi::SQLITE_CONSTRAINT_UNIQUE => "SQLITE_CONSTRAINT_UNIQUE",
        ffi::SQLITE_CONSTRAINT_PRIMARYKEY => "SQLITE_CONSTRAINT_PRIMARYKEY",
        ffi::SQLITE_CONSTRAINT_FOREIGNKEY => "SQLITE_CONSTRAINT_FOREIGNKEY",
        ffi::SQLITE_CONSTRAINT_NOTNULL => "SQLITE_CONSTRAINT_NOTNULL",
        ffi::SQLITE_CONSTRAINT_CHECK => "SQLITE_CONSTRAINT_CHECK",
        ffi::SQLITE_CONSTRAINT_TRIGGER => "SQLITE_CONSTRAINT_TRIGGER",
        ffi::SQLITE_BUSY => "SQLITE_BUSY",
        ffi::SQLITE_LOCKED => "SQLITE_LOCKED",
        ffi::SQLITE_ERROR => "SQLITE_ERROR",
        other => return format!("SQLITE_{other}"),
    };
    name.to_string()
}

fn hint_for(message: &str) -> Option<String> {
    let hint = if message.contains("duplicate column name") {
        "guard the step with a column_exists probe so re-application is a no-op"
    } else if message.contains("no such table") || message.contains("no such column") {
        "an earlier version may not be migrated yet, or the object was renamed"
    } else if message.contains("UNIQUE constraint failed") {
        "inserts outside seed steps must use ON CONFLICT DO NOTHING"
    } else if message.contains("FOREIGN KEY constraint failed") {
        "referenced rows must exist before dependents are written"
    } else {
        return None;
    };
    Some(hint.to_string())
}

fn diagnostic_from_error(
    record: &GovernanceRecordInput,
    routine: &str,
    index: usize,
    step: &CompiledStep,
    err: &anyhow::Error,
) -> ExceptionDiagnostic {
    let sqlite = err
        .chain()
        .find_map(|cause| cause.downcast_ref::<rusqlite::Error>());
    let (code, message) = match sqlite {
        Some(rusqlite::Error::SqliteFailure(failure, message)) => (
            sqlite_code_name(failure.extended_code),
            message.clone().unwrap_or_else(|| failure.to_string()),
        ),
        Some(other) => ("SQLITE_ERROR".to_string(), other.to_string()),
        None => ("ISLM_ERROR".to_string(), err.to_string()),
    };

    ExceptionDiagnostic {
        namespace: record.namespace.clone(),
        migrate_version: record.migrate_version.clone(),
        routine: routine.to_string(),
        hint: hint_for(&message),
        detail: Some(format!("{err:#}")),
        context: Some(format!(
            "step {} of {routine}: {}\n{}",
            index + 1,
            step.label,
            step.sql
        )),
        code,
        message,
        created_by: record.created_by.clone(),
    }
}

fn latest_state(
    conn: &Connection,
    namespace: &str,
    migrate_version: &str,
) -> Result<TransitionStatus> {
    let latest: Option<String> = conn
        .query_row(
            "SELECT to_state FROM islm_governance
             WHERE namespace = ?1 AND migrate_version = ?2
             ORDER BY seq DESC
             LIMIT 1",
            params![namespace, migrate_version],
            |row| row.get(0),
        )
        .optional()
        .context("failed to read current transition state")?;

    match latest {
        Some(raw) => TransitionStatus::parse(&raw)
            .ok_or_else(|| anyhow!("ledger holds unknown transition state `{raw}`")),
        None => Ok(TransitionStatus::None),
    }
}

/// Must run inside a write-locked transaction so no other writer can append
/// between the check and the insert.
fn ensure_from_state(conn: &Connection, record: &GovernanceRecordInput) -> Result<()> {
    let actual = latest_state(conn, &record.namespace, &record.migrate_version)?;
    if actual != record.from_state {
        return Err(StateConflict {
            migrate_version: record.migrate_version.clone(),
            expected: record.from_state,
            actual,
            attempted: record.to_state,
        }
        .into());
    }
    Ok(())
}

fn insert_governance(
    conn: &Connection,
    input: &GovernanceRecordInput,
    ignore_conflict: bool,
) -> Result<Option<GovernanceRecord>> {
    let id = Ulid::new();
    let created_at = now_utc();
    let conflict = if ignore_conflict {
        " ON CONFLICT DO NOTHING"
    } else {
        ""
    };

    let changed = conn
        .execute(
            &format!(
                "INSERT INTO islm_governance(
                    islm_governance_id, namespace, migrate_version, sp_migration, sp_migration_undo,
                    fn_migration_status, from_state, to_state, transition_reason, transition_result,
                    created_at, created_by
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12){conflict}"
            ),
            params![
                id.to_string(),
                input.namespace,
                input.migrate_version,
                input.sp_migration_name,
                input.sp_migration_undo_name,
                input.fn_migration_status_name,
                input.from_state.as_str(),
                input.to_state.as_str(),
                input.transition_reason,
                serde_json::to_string(&input.transition_result)
                    .context("failed to serialize transition_result")?,
                format_rfc3339(created_at).map_err(|err| anyhow!(err.to_string()))?,
                input.created_by,
            ],
        )
        .context("failed to append governance record")?;

    if changed == 0 {
        return Ok(None);
    }

    Ok(Some(GovernanceRecord {
        seq: conn.last_insert_rowid(),
        islm_governance_id: id,
        namespace: input.namespace.clone(),
        migrate_version: input.migrate_version.clone(),
        sp_migration_name: input.sp_migration_name.clone(),
        sp_migration_undo_name: input.sp_migration_undo_name.clone(),
        fn_migration_status_name: input.fn_migration_status_name.clone(),
        from_state: input.from_state,
        to_state: input.to_state,
        transition_reason: input.transition_reason.clone(),
        transition_result: input.transition_result.clone(),
        created_at,
        created_by: input.created_by.clone(),
    }))
}

fn parse_governance_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<GovernanceRecord> {
    let id_raw: String = row.get(1)?;
    let from_raw: String = row.get(7)?;
    let to_raw: String = row.get(8)?;
    let result_raw: String = row.get(10)?;
    let created_raw: String = row.get(11)?;

    let islm_governance_id = Ulid::from_string(&id_raw)
        .map_err(|err| conversion_error(1, rusqlite::types::Type::Text, err.to_string()))?;
    let from_state = parse_state(7, &from_raw)?;
    let to_state = parse_state(8, &to_raw)?;
    let transition_result: Value = serde_json::from_str(&result_raw)
        .map_err(|err| conversion_error(10, rusqlite::types::Type::Text, err.to_string()))?;
    let created_at = parse_timestamp(11, &created_raw)?;

    Ok(GovernanceRecord {
        seq: row.get(0)?,
        islm_governance_id,
        namespace: row.get(2)?,
        migrate_version: row.get(3)?,
        sp_migration_name: row.get(4)?,
        sp_migration_undo_name: row.get(5)?,
        fn_migration_status_name: row.get(6)?,
        from_state,
        to_state,
        transition_reason: row.get(9)?,
        transition_result,
        created_at,
        created_by: row.get(12)?,
    })
}

fn parse_test_result_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<TestResult> {
    let success: i64 = row.get(5)?;
    let created_raw: String = row.get(6)?;
    Ok(TestResult {
        seq: row.get(0)?,
        namespace: row.get(1)?,
        migration_version: row.get(2)?,
        test_name: row.get(3)?,
        tap_output: row.get(4)?,
        success: success != 0,
        created_at: parse_timestamp(6, &created_raw)?,
        created_by: row.get(7)?,
        provenance: row.get(8)?,
    })
}

fn parse_routine_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<InstalledRoutine> {
    let kind_raw: String = row.get(3)?;
    let body_raw: String = row.get(4)?;
    let installed_raw: String = row.get(6)?;

    let kind = RoutineKind::parse(&kind_raw).ok_or_else(|| {
        conversion_error(
            3,
            rusqlite::types::Type::Text,
            format!("invalid routine kind: {kind_raw}"),
        )
    })?;
    let body: Value = serde_json::from_str(&body_raw)
        .map_err(|err| conversion_error(4, rusqlite::types::Type::Text, err.to_string()))?;

    Ok(InstalledRoutine {
        routine_name: row.get(0)?,
        namespace: row.get(1)?,
        migrate_version: row.get(2)?,
        kind,
        body,
        checksum: row.get(5)?,
        installed_at: parse_timestamp(6, &installed_raw)?,
    })
}

fn parse_state(index: usize, raw: &str) -> rusqlite::Result<TransitionStatus> {
    TransitionStatus::parse(raw).ok_or_else(|| {
        conversion_error(
            index,
            rusqlite::types::Type::Text,
            format!("invalid transition state: {raw}"),
        )
    })
}

fn parse_timestamp(index: usize, raw: &str) -> rusqlite::Result<OffsetDateTime> {
    parse_rfc3339_utc(raw)
        .map_err(|err| conversion_error(index, rusqlite::types::Type::Text, err.to_string()))
}

fn conversion_error(
    index: usize,
    column_type: rusqlite::types::Type,
    message: String,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        index,
        column_type,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
}

fn bool_to_sql(value: bool) -> i64 {
    i64::from(value)
}

fn ensure_table_has_columns(conn: &Connection, table_name: &str, columns: &[&str]) -> Result<()> {
    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info({table_name})"))
        .with_context(|| format!("failed to inspect table_info for {table_name}"))?;
    let mut rows = stmt.query([])?;

    let mut available = Vec::new();
    while let Some(row) = rows.next()? {
        available.push(row.get::<_, String>(1)?);
    }

    for required in columns {
        if !available.iter().any(|candidate| candidate == required) {
            return Err(anyhow!(
                "governance schema check failed: missing column {table_name}.{required}"
            ));
        }
    }

    Ok(())
}

fn collect_rows<T>(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>>,
) -> Result<Vec<T>> {
    let mut values = Vec::new();
    for row in rows {
        values.push(row?);
    }
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use islm_core::{
        compile_migration, render_artifacts, ArtifactKind, ArtifactOptions, ArtifactTarget,
        ColumnDescriptor, ColumnType, Ident, MigrationDefinition, MigrationRegistry, MigrationStep,
        MigrationVersion, StatusProbe, TableSpec, DEFAULT_ACTOR,
    };
    use proptest::prelude::*;
    use serde_json::json;
    use time::macros::datetime;

    const NAMESPACE: &str = "dv";

    fn must_ok<T, E: std::fmt::Display>(result: std::result::Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    fn ident(raw: &str) -> Ident {
        must_ok(Ident::new(raw))
    }

    fn fixture_store() -> SqliteLifecycleStore {
        let store = must_ok(SqliteLifecycleStore::open(Path::new(":memory:")));
        must_ok(store.migrate());
        store
    }

    fn temp_db_path() -> std::path::PathBuf {
        std::env::temp_dir().join(format!("islm-store-{}.sqlite3", Ulid::new()))
    }

    fn fixture_migration() -> CompiledMigration {
        let definition = MigrationDefinition::new(
            must_ok(MigrationVersion::new(
                "create-tables",
                datetime!(2024-08-01 10:00 UTC),
            )),
            vec![MigrationStep::CreateSchemaObjects {
                tables: vec![
                    TableSpec::Hub {
                        name: ident("exception"),
                        columns: Vec::new(),
                    },
                    TableSpec::Satellite {
                        hub: ident("exception"),
                        name: ident("diagnostics"),
                        columns: vec![ColumnDescriptor::nullable(
                            ident("message"),
                            ColumnType::Text,
                        )],
                    },
                    TableSpec::Enum {
                        name: ident("severity"),
                        values: vec!["LOW".to_string(), "HIGH".to_string()],
                    },
                ],
            }],
            vec![MigrationStep::DropTable {
                table: ident("sat_exception_diagnostics"),
            }],
            StatusProbe::TableExists {
                table: ident("sat_exception_diagnostics"),
            },
        );
        must_ok(compile_migration(&definition, &SqliteDialect))
    }

    fn transition(
        migration: &CompiledMigration,
        from: TransitionStatus,
        to: TransitionStatus,
    ) -> GovernanceRecordInput {
        GovernanceRecordInput::for_transition(
            NAMESPACE,
            &migration.version,
            from,
            to,
            "test transition",
            json!({}),
            DEFAULT_ACTOR,
        )
    }

    #[test]
    fn migrate_is_idempotent() {
        let store = fixture_store();
        must_ok(store.migrate());
        assert_eq!(must_ok(store.governance_count()), 0);
    }

    #[test]
    fn governance_rows_reject_update_and_delete() {
        let store = fixture_store();
        let migration = fixture_migration();
        must_ok(store.append_governance(&transition(
            &migration,
            TransitionStatus::None,
            TransitionStatus::SqlLoaded,
        )));

        let update = store
            .connection()
            .execute("UPDATE islm_governance SET created_by = 'mallory'", []);
        let delete = store.connection().execute("DELETE FROM islm_governance", []);

        for result in [update, delete] {
            match result {
                Ok(_) => panic!("ledger mutation should fail"),
                Err(err) => assert!(err.to_string().contains("append-only")),
            }
        }
        assert_eq!(must_ok(store.governance_count()), 1);
    }

    #[test]
    fn test_results_are_append_only_and_latest_wins() {
        let store = fixture_store();
        assert!(must_ok(store.latest_test_result(NAMESPACE)).is_none());

        for success in [false, true] {
            must_ok(store.append_test_result(&TestResultInput {
                namespace: NAMESPACE.to_string(),
                migration_version: None,
                test_name: "suite".to_string(),
                tap_output: "1..1\nok 1 - x".to_string(),
                success,
                created_by: DEFAULT_ACTOR.to_string(),
                provenance: None,
            }));
        }

        let latest = must_ok(store.latest_test_result(NAMESPACE));
        assert_eq!(latest.map(|result| result.success), Some(true));
        assert!(store
            .connection()
            .execute("DELETE FROM islm_test_result", [])
            .is_err());
    }

    #[test]
    fn install_routines_is_idempotent_and_records_load_once() {
        let store = fixture_store();
        let migration = fixture_migration();
        let record = transition(&migration, TransitionStatus::None, TransitionStatus::SqlLoaded);

        let first = must_ok(store.install_routines(&migration, &record));
        let second = must_ok(store.install_routines(&migration, &record));

        assert!(first.installed);
        assert!(first.record.is_some());
        assert!(!second.installed);
        assert!(second.record.is_none());
        assert_eq!(must_ok(store.governance_count()), 1);
        assert_eq!(must_ok(store.installed_routines(&migration.version_id())).len(), 3);
        assert_eq!(
            must_ok(store.current_state(NAMESPACE, &migration.version_id())),
            TransitionStatus::SqlLoaded
        );
    }

    fn loaded_store(migration: &CompiledMigration) -> SqliteLifecycleStore {
        let store = fixture_store();
        must_ok(store.install_routines(
            migration,
            &transition(migration, TransitionStatus::None, TransitionStatus::SqlLoaded),
        ));
        store
    }

    #[test]
    fn execute_body_commits_steps_and_record_together() {
        let migration = fixture_migration();
        let store = loaded_store(&migration);

        let (report, stored) = must_ok(store.execute_body(
            &migration.routines.migrate,
            &migration.transactional_apply(),
            &transition(&migration, TransitionStatus::SqlLoaded, TransitionStatus::Migrated),
            true,
        ));

        assert_eq!(
            stored.map(|record| record.to_state),
            Some(TransitionStatus::Migrated)
        );
        assert!(report.executed.iter().any(|label| label == "create table hub_exception"));
        assert!(must_ok(store.evaluate_probe(&migration.status_query)));
        let seeded: i64 = must_ok(store.connection().query_row(
            "SELECT COUNT(*) FROM severity",
            [],
            |row| row.get(0),
        ));
        assert_eq!(seeded, 2);
    }

    #[test]
    fn failing_body_rolls_back_and_captures_diagnostics() {
        let migration = fixture_migration();
        let store = loaded_store(&migration);
        let mut steps = migration.transactional_apply();
        steps.push(CompiledStep {
            label: "broken statement".to_string(),
            sql: "INSERT INTO no_such_table(x) VALUES (1)".to_string(),
            skip_when: None,
            mode: StepMode::Transactional,
        });

        let before = must_ok(store.catalog_snapshot());
        let result = store.execute_body(
            &migration.routines.migrate,
            &steps,
            &transition(&migration, TransitionStatus::SqlLoaded, TransitionStatus::Migrated),
            true,
        );

        assert!(result.is_err());
        assert_eq!(must_ok(store.catalog_snapshot()), before);
        assert_eq!(must_ok(store.governance_count()), 1);

        let diagnostics = must_ok(store.diagnostics(NAMESPACE));
        assert_eq!(diagnostics.len(), 1);
        assert_eq!(diagnostics[0].code, "SQLITE_ERROR");
        assert!(diagnostics[0].message.contains("no such table"));
        assert!(diagnostics[0]
            .context
            .as_deref()
            .is_some_and(|context| context.contains("broken statement")));
    }

    #[test]
    fn stale_from_state_is_rejected_without_side_effects() {
        let migration = fixture_migration();
        let store = fixture_store();

        let premature = store.execute_body(
            &migration.routines.migrate,
            &migration.transactional_apply(),
            &transition(&migration, TransitionStatus::SqlLoaded, TransitionStatus::Migrated),
            true,
        );
        match premature {
            Ok(_) => panic!("body should not run before the version is loaded"),
            Err(err) => {
                let conflict = err.downcast_ref::<StateConflict>();
                assert_eq!(conflict.map(|c| c.actual), Some(TransitionStatus::None));
            }
        }
        assert!(!must_ok(store.evaluate_probe(&migration.status_query)));
        assert_eq!(must_ok(store.governance_count()), 0);
        assert!(must_ok(store.diagnostics(NAMESPACE)).is_empty());
    }

    #[test]
    fn concurrent_migrations_record_one_transition() {
        let path = temp_db_path();
        let migration = fixture_migration();
        let first = must_ok(SqliteLifecycleStore::open(&path));
        must_ok(first.migrate());
        let second = must_ok(SqliteLifecycleStore::open(&path));
        must_ok(first.install_routines(
            &migration,
            &transition(&migration, TransitionStatus::None, TransitionStatus::SqlLoaded),
        ));

        // Both saw SQLLOADED before either one committed.
        let record = transition(&migration, TransitionStatus::SqlLoaded, TransitionStatus::Migrated);
        let steps = migration.transactional_apply();
        let winner = first.execute_body(&migration.routines.migrate, &steps, &record, true);
        let loser = second.execute_body(&migration.routines.migrate, &steps, &record, true);

        assert!(winner.is_ok());
        match loser {
            Ok(_) => panic!("second migration should see the committed transition"),
            Err(err) => {
                let conflict = err.downcast_ref::<StateConflict>();
                assert_eq!(conflict.map(|c| c.actual), Some(TransitionStatus::Migrated));
            }
        }
        assert!(second
            .append_governance(&record)
            .is_err_and(|err| err.downcast_ref::<StateConflict>().is_some()));

        let migrated: i64 = must_ok(first.connection().query_row(
            "SELECT COUNT(*) FROM islm_governance WHERE to_state = 'MIGRATED'",
            [],
            |row| row.get(0),
        ));
        assert_eq!(migrated, 1);

        drop(first);
        drop(second);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn seed_conflicts_become_notices() {
        let store = fixture_store();
        must_ok(store.connection().execute_batch(
            "CREATE TABLE lookup (code TEXT PRIMARY KEY NOT NULL, value TEXT NOT NULL);",
        ));
        let step = CompiledStep {
            label: "seed lookup".to_string(),
            sql: "INSERT INTO lookup (code, value) VALUES ('A', 'A')".to_string(),
            skip_when: None,
            mode: StepMode::Seed,
        };

        let first = must_ok(store.execute_deferred(&step));
        let second = must_ok(store.execute_deferred(&step));
        assert_eq!(first.executed.len(), 1);
        assert_eq!(second.notices.len(), 1);
        assert!(second.notices[0].contains("Insert skipped"));
    }

    #[test]
    fn guarded_add_column_is_skipped_when_present() {
        let store = fixture_store();
        must_ok(store.connection().execute_batch("CREATE TABLE t (a TEXT);"));
        let step = CompiledStep {
            label: "add column t.b".to_string(),
            sql: "ALTER TABLE \"t\" ADD COLUMN \"b\" TEXT".to_string(),
            skip_when: Some(StatusProbe::ColumnExists {
                table: ident("t"),
                column: ident("b"),
            }),
            mode: StepMode::Transactional,
        };

        let first = must_ok(store.execute_deferred(&step));
        let second = must_ok(store.execute_deferred(&step));
        assert_eq!(first.executed, vec!["add column t.b".to_string()]);
        assert_eq!(second.skipped, vec!["add column t.b".to_string()]);
    }

    #[test]
    fn assertions_never_leave_side_effects() {
        let store = fixture_store();
        must_ok(store.connection().execute_batch("CREATE TABLE t (a INTEGER);"));

        let passed = must_ok(store.run_assertion("SELECT COUNT(*) = 0 FROM t"));
        assert!(passed);
        must_ok(store.run_assertion("INSERT INTO t (a) VALUES (1) RETURNING a"));

        let count: i64 = must_ok(store.connection().query_row("SELECT COUNT(*) FROM t", [], |row| row.get(0)));
        assert_eq!(count, 0);
        assert!(!must_ok(store.run_assertion("SELECT 0")));
        assert!(store.run_assertion("SELECT * FROM missing").is_err());
    }

    #[test]
    fn probes_must_be_read_only() {
        let store = fixture_store();
        assert!(store.evaluate_probe("CREATE TABLE sneaky (a TEXT)").is_err());
        assert!(!must_ok(store.evaluate_probe(
            &SqliteDialect.probe_query(&StatusProbe::TableExists { table: ident("sneaky") })
        )));
    }

    #[test]
    fn advisory_lock_excludes_other_holders_until_released() {
        let path = temp_db_path();
        let first = must_ok(SqliteLifecycleStore::open(&path));
        must_ok(first.migrate());
        let second = must_ok(SqliteLifecycleStore::open(&path));

        let lease = must_ok(first.acquire_advisory_lock("islm_index_build:idx", Duration::from_millis(50)));
        let blocked = second.acquire_advisory_lock("islm_index_build:idx", Duration::from_millis(80));
        match blocked {
            Ok(_) => panic!("second holder should time out"),
            Err(err) => assert!(err.downcast_ref::<LockTimeout>().is_some()),
        }

        must_ok(first.release_advisory_lock(&lease));
        let reacquired = must_ok(second.acquire_advisory_lock("islm_index_build:idx", Duration::from_millis(50)));
        must_ok(second.release_advisory_lock(&reacquired));

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn expired_lease_is_reclaimed() {
        let path = temp_db_path();
        let crashed = must_ok(SqliteLifecycleStore::open(&path)).with_lock_lease(Duration::ZERO);
        must_ok(crashed.migrate());
        let survivor = must_ok(SqliteLifecycleStore::open(&path));

        must_ok(crashed.acquire_advisory_lock("islm_index_build:idx", Duration::from_millis(50)));
        let lease = must_ok(survivor.acquire_advisory_lock("islm_index_build:idx", Duration::from_millis(50)));
        assert_eq!(lease.holder, survivor.holder());

        let _ = std::fs::remove_file(&path);
    }

    fn script_registry() -> MigrationRegistry {
        let create = MigrationDefinition::new(
            must_ok(MigrationVersion::new(
                "create-tables",
                datetime!(2024-08-01 10:00 UTC),
            )),
            vec![MigrationStep::CreateSchemaObjects {
                tables: vec![TableSpec::Hub {
                    name: ident("exception"),
                    columns: Vec::new(),
                }],
            }],
            Vec::new(),
            StatusProbe::TableExists {
                table: ident("hub_exception"),
            },
        );
        let update = MigrationDefinition::new(
            must_ok(MigrationVersion::new(
                "update-table1",
                datetime!(2024-08-02 10:00 UTC),
            )),
            vec![MigrationStep::AddColumn {
                table: ident("hub_exception"),
                column: ColumnDescriptor::nullable(ident("note"), ColumnType::Text),
            }],
            vec![MigrationStep::DropColumn {
                table: ident("hub_exception"),
                column: ident("note"),
            }],
            StatusProbe::ColumnExists {
                table: ident("hub_exception"),
                column: ident("note"),
            },
        );
        must_ok(MigrationRegistry::from_definitions([create, update]))
    }

    #[test]
    fn rendered_scripts_refuse_out_of_order_transitions() {
        const CREATE: &str = "v2024_08_01_10_00_00_create_tables";
        const UPDATE: &str = "v2024_08_02_10_00_00_update_table1";

        let store = fixture_store();
        let set = must_ok(render_artifacts(
            &script_registry(),
            &ArtifactTarget::Sqlite(SqliteDialect),
            &ArtifactOptions {
                namespace: NAMESPACE.to_string(),
                actor: DEFAULT_ACTOR.to_string(),
            },
        ));
        must_ok(store.append_test_result(&TestResultInput {
            namespace: NAMESPACE.to_string(),
            migration_version: None,
            test_name: "suite".to_string(),
            tap_output: "1..1\nok 1 - x".to_string(),
            success: true,
            created_by: DEFAULT_ACTOR.to_string(),
            provenance: None,
        }));

        let run = |version_id: &str, kind: ArtifactKind| {
            let artifact = set
                .artifacts
                .iter()
                .find(|artifact| artifact.version_id == version_id && artifact.kind == kind);
            match artifact {
                Some(artifact) => store.connection().execute_batch(&artifact.content),
                None => panic!("no {} script for {version_id}", kind.as_str()),
            }
        };
        let refused = |result: rusqlite::Result<()>, message: &str| match result {
            Ok(()) => panic!("script should refuse with `{message}`"),
            Err(err) => assert!(err.to_string().contains(message), "unexpected error: {err}"),
        };
        let state = |version_id: &str| must_ok(store.current_state(NAMESPACE, version_id));

        refused(run(CREATE, ArtifactKind::Migrate), "Migration is not loaded.");
        assert_eq!(must_ok(store.governance_count()), 0);
        assert!(!must_ok(store.catalog_snapshot())
            .iter()
            .any(|entry| entry.contains("hub_exception")));

        must_ok(run(CREATE, ArtifactKind::Load));
        must_ok(run(UPDATE, ArtifactKind::Load));
        refused(
            run(UPDATE, ArtifactKind::Migrate),
            "Earlier versions must be migrated first.",
        );
        refused(run(CREATE, ArtifactKind::Rollback), "Migration is not migrated.");
        assert_eq!(state(UPDATE), TransitionStatus::SqlLoaded);
        assert_eq!(must_ok(store.governance_count()), 2);

        must_ok(run(CREATE, ArtifactKind::Migrate));
        refused(run(CREATE, ArtifactKind::Migrate), "Migration already applied.");
        assert_eq!(state(CREATE), TransitionStatus::Migrated);

        must_ok(run(UPDATE, ArtifactKind::Migrate));
        refused(
            run(CREATE, ArtifactKind::Rollback),
            "Later versions must be rolled back first.",
        );
        must_ok(run(UPDATE, ArtifactKind::Rollback));
        refused(
            run(UPDATE, ArtifactKind::Rollback),
            "Migration already rolled back.",
        );
        assert_eq!(state(UPDATE), TransitionStatus::RolledBack);

        let history = must_ok(store.governance_history(NAMESPACE, Some(CREATE)));
        let transitions: Vec<(TransitionStatus, TransitionStatus)> = history
            .iter()
            .map(|record| (record.from_state, record.to_state))
            .collect();
        assert_eq!(
            transitions,
            vec![
                (TransitionStatus::None, TransitionStatus::SqlLoaded),
                (TransitionStatus::SqlLoaded, TransitionStatus::Migrated),
            ]
        );
        assert_eq!(must_ok(store.governance_count()), 5);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(48))]

        #[test]
        fn ledger_count_never_decreases(operations in proptest::collection::vec(0_u8..3, 1..24)) {
            let store = fixture_store();
            let migration = fixture_migration();
            let mut last = 0_i64;

            for operation in operations {
                match operation {
                    0 => {
                        let from = must_ok(store.current_state(NAMESPACE, &migration.version_id()));
                        let to = match from {
                            TransitionStatus::None => TransitionStatus::SqlLoaded,
                            TransitionStatus::Migrated => TransitionStatus::RolledBack,
                            _ => TransitionStatus::Migrated,
                        };
                        must_ok(store.append_governance(&transition(&migration, from, to)));
                    }
                    1 => {
                        let _ = store.connection().execute("DELETE FROM islm_governance", []);
                    }
                    _ => {
                        let _ = store.connection().execute("UPDATE islm_governance SET to_state = 'NONE'", []);
                    }
                }

                let count = must_ok(store.governance_count());
                prop_assert!(count >= last);
                last = count;
            }
        }
    }
}
