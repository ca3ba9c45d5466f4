#![forbid(unsafe_code)]

use std::time::Duration;

use anyhow::Result;
use islm_core::{
    BodyReport, CompiledMigration, CompiledStep, ExceptionDiagnostic, GovernanceRecord,
    GovernanceRecordInput, InstalledRoutine, LockLease, SqlDialect, TestResult, TestResultInput,
    TransitionStatus,
};

/// Raised when an advisory lock stays held by another holder past the timeout.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
#[error("timed out after {waited_ms} ms waiting for advisory lock `{operation}` held by {holder}")]
pub struct LockTimeout {
    pub operation: String,
    pub holder: String,
    pub waited_ms: u128,
}

/// Raised when the ledger moved past `expected` between reading a version's
/// state and appending its next transition.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
#[error("{migrate_version} is {actual}, expected {expected} before recording {attempted}")]
pub struct StateConflict {
    pub migrate_version: String,
    pub expected: TransitionStatus,
    pub actual: TransitionStatus,
    pub attempted: TransitionStatus,
}

/// Result of installing a version's routines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadReceipt {
    /// False when identical routines and the load record were already present.
    pub installed: bool,
    pub record: Option<GovernanceRecord>,
}

/// Persistence and execution seam used by the lifecycle orchestrator.
///
/// Implementations own the governance ledger, the test result table, the
/// diagnostics sink, installed routines and advisory locks for one database.
pub trait LifecycleStore {
    /// Dialect used to compile bodies executed by this store.
    fn dialect(&self) -> &dyn SqlDialect;

    #[allow(clippy::missing_errors_doc)]
    fn migrate(&self) -> Result<()>;

    /// Installs the three routines and appends `NONE -> SQLLOADED` in one
    /// transaction. Re-installing identical routines is a no-op.
    #[allow(clippy::missing_errors_doc)]
    fn install_routines(
        &self,
        migration: &CompiledMigration,
        load_record: &GovernanceRecordInput,
    ) -> Result<LoadReceipt>;

    #[allow(clippy::missing_errors_doc)]
    fn installed_routines(&self, migrate_version: &str) -> Result<Vec<InstalledRoutine>>;

    /// Latest `to_state` for the pair, or `NONE` when nothing was recorded.
    #[allow(clippy::missing_errors_doc)]
    fn current_state(&self, namespace: &str, migrate_version: &str) -> Result<TransitionStatus>;

    #[allow(clippy::missing_errors_doc)]
    fn governance_history(
        &self,
        namespace: &str,
        migrate_version: Option<&str>,
    ) -> Result<Vec<GovernanceRecord>>;

    #[allow(clippy::missing_errors_doc)]
    fn governance_count(&self) -> Result<i64>;

    /// Appends `record` when the latest state still equals its `from_state`,
    /// otherwise fails with [`StateConflict`].
    #[allow(clippy::missing_errors_doc)]
    fn append_governance(&self, record: &GovernanceRecordInput) -> Result<GovernanceRecord>;

    /// Runs `steps` in one write-locked transaction and, when `append` is set,
    /// appends `record` inside the same transaction. The latest state is
    /// re-read first and must equal `record.from_state` ([`StateConflict`]
    /// otherwise). On a step failure nothing is committed
    /// and the error is captured into the diagnostics sink, attributed to
    /// `record`'s namespace and version, before being returned.
    #[allow(clippy::missing_errors_doc)]
    fn execute_body(
        &self,
        routine: &str,
        steps: &[CompiledStep],
        record: &GovernanceRecordInput,
        append: bool,
    ) -> Result<(BodyReport, Option<GovernanceRecord>)>;

    /// Runs one deferred step outside any transaction.
    #[allow(clippy::missing_errors_doc)]
    fn execute_deferred(&self, step: &CompiledStep) -> Result<BodyReport>;

    /// Evaluates a probe query read-only; true when it yields 1.
    #[allow(clippy::missing_errors_doc)]
    fn evaluate_probe(&self, query: &str) -> Result<bool>;

    /// Runs an assertion query inside a transaction that is always rolled back.
    #[allow(clippy::missing_errors_doc)]
    fn run_assertion(&self, query: &str) -> Result<bool>;

    #[allow(clippy::missing_errors_doc)]
    fn append_test_result(&self, input: &TestResultInput) -> Result<TestResult>;

    #[allow(clippy::missing_errors_doc)]
    fn latest_test_result(&self, namespace: &str) -> Result<Option<TestResult>>;

    #[allow(clippy::missing_errors_doc)]
    fn record_diagnostic(&self, diagnostic: &ExceptionDiagnostic) -> Result<()>;

    #[allow(clippy::missing_errors_doc)]
    fn diagnostics(&self, namespace: &str) -> Result<Vec<ExceptionDiagnostic>>;

    /// Blocks with backoff until the named lock is acquired or `timeout` elapses.
    #[allow(clippy::missing_errors_doc)]
    fn acquire_advisory_lock(&self, operation: &str, timeout: Duration) -> Result<LockLease>;

    #[allow(clippy::missing_errors_doc)]
    fn release_advisory_lock(&self, lease: &LockLease) -> Result<()>;

    /// Sorted `sql` text of every schema object, for equality checks.
    #[allow(clippy::missing_errors_doc)]
    fn catalog_snapshot(&self) -> Result<Vec<String>>;
}
