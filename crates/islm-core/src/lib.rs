pub mod artifact;
pub mod compiler;
pub mod definition;
pub mod registry;
pub mod schema;
pub mod tap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use time::{OffsetDateTime, UtcOffset};
use ulid::Ulid;

pub use artifact::{
    render_artifacts, Artifact, ArtifactKind, ArtifactManifest, ArtifactOptions, ArtifactSet,
    ArtifactTarget, ManifestEntry, MANIFEST_FILE,
};
pub use compiler::{
    compile_migration, compile_steps, decode_steps, order_tables, CompiledMigration, CompiledStep,
    PostgresDialect, RoutineBody, SqlDialect, SqliteDialect, StepMode,
};
pub use definition::{
    Assertion, MigrationDefinition, MigrationStep, MigrationVersion, RoutineKind, RoutineNames,
    StatusProbe, TestSuite, MAX_DESCRIPTION_LEN,
};
pub use registry::MigrationRegistry;
pub use schema::{
    ColumnDescriptor, ColumnType, DefaultValue, ForeignKey, Ident, IndexDescriptor, SqlValue,
    TableDescriptor, TableRole, TableSpec,
};
pub use tap::{AssertionOutcome, TapReport};

pub const DEFAULT_ACTOR: &str = "Admin";

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum IslmError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("compile error: {0}")]
    Compile(String),
}

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum RegistrationError {
    #[error(
        "migration description `{description}` has {length} characters; at most {max} are allowed",
        max = MAX_DESCRIPTION_LEN
    )]
    DescriptionTooLong { description: String, length: usize },
    #[error("invalid migration description `{description}`: {reason}")]
    InvalidDescription { description: String, reason: String },
    #[error("migration {version_id} conflicts with registered version {existing}")]
    DuplicateVersion { version_id: String, existing: String },
}

/// Lifecycle state of one `(namespace, version)` pair, as recorded in the ledger.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransitionStatus {
    #[default]
    None,
    #[serde(rename = "SQLLOADED")]
    SqlLoaded,
    Migrated,
    #[serde(rename = "ROLLEDBACK")]
    RolledBack,
    Failed,
}

impl TransitionStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "NONE",
            Self::SqlLoaded => "SQLLOADED",
            Self::Migrated => "MIGRATED",
            Self::RolledBack => "ROLLEDBACK",
            Self::Failed => "FAILED",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "NONE" => Some(Self::None),
            "SQLLOADED" => Some(Self::SqlLoaded),
            "MIGRATED" => Some(Self::Migrated),
            "ROLLEDBACK" => Some(Self::RolledBack),
            "FAILED" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Whether the ledger may record `self -> to`.
    #[must_use]
    pub fn can_transition_to(self, to: Self) -> bool {
        matches!(
            (self, to),
            (Self::None, Self::SqlLoaded)
                | (
                    Self::SqlLoaded | Self::RolledBack | Self::Failed,
                    Self::Migrated | Self::Failed
                )
                | (Self::Migrated | Self::Failed, Self::RolledBack)
        )
    }
}

impl std::fmt::Display for TransitionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GovernanceRecordInput {
    pub namespace: String,
    pub migrate_version: String,
    pub sp_migration_name: String,
    pub sp_migration_undo_name: String,
    pub fn_migration_status_name: String,
    pub from_state: TransitionStatus,
    pub to_state: TransitionStatus,
    pub transition_reason: String,
    pub transition_result: Value,
    pub created_by: String,
}

impl GovernanceRecordInput {
    #[must_use]
    pub fn for_transition(
        namespace: &str,
        version: &MigrationVersion,
        from_state: TransitionStatus,
        to_state: TransitionStatus,
        transition_reason: impl Into<String>,
        transition_result: Value,
        created_by: &str,
    ) -> Self {
        let routines = version.routine_names();
        Self {
            namespace: namespace.to_string(),
            migrate_version: version.version_id(),
            sp_migration_name: routines.migrate,
            sp_migration_undo_name: routines.undo,
            fn_migration_status_name: routines.status,
            from_state,
            to_state,
            transition_reason: transition_reason.into(),
            transition_result,
            created_by: created_by.to_string(),
        }
    }

    /// # Errors
    /// Returns [`IslmError::Validation`] for empty fields, a non-object result, or
    /// a transition the state table does not allow.
    pub fn validate(&self) -> Result<(), IslmError> {
        ensure_non_empty("namespace", &self.namespace)?;
        ensure_non_empty("migrate_version", &self.migrate_version)?;
        ensure_non_empty("sp_migration_name", &self.sp_migration_name)?;
        ensure_non_empty("sp_migration_undo_name", &self.sp_migration_undo_name)?;
        ensure_non_empty("fn_migration_status_name", &self.fn_migration_status_name)?;
        ensure_non_empty("transition_reason", &self.transition_reason)?;
        ensure_non_empty("created_by", &self.created_by)?;

        if !self.transition_result.is_object() {
            return Err(IslmError::Validation(
                "transition_result MUST be a JSON object".to_string(),
            ));
        }

        if !self.from_state.can_transition_to(self.to_state) {
            return Err(IslmError::Validation(format!(
                "transition {} -> {} is not allowed",
                self.from_state.as_str(),
                self.to_state.as_str()
            )));
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GovernanceRecord {
    pub seq: i64,
    pub islm_governance_id: Ulid,
    pub namespace: String,
    pub migrate_version: String,
    pub sp_migration_name: String,
    pub sp_migration_undo_name: String,
    pub fn_migration_status_name: String,
    pub from_state: TransitionStatus,
    pub to_state: TransitionStatus,
    pub transition_reason: String,
    pub transition_result: Value,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    pub created_by: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TestResultInput {
    pub namespace: String,
    pub migration_version: Option<String>,
    pub test_name: String,
    pub tap_output: String,
    pub success: bool,
    pub created_by: String,
    pub provenance: Option<String>,
}

impl TestResultInput {
    /// # Errors
    /// Returns [`IslmError::Validation`] when a required field is empty.
    pub fn validate(&self) -> Result<(), IslmError> {
        ensure_non_empty("namespace", &self.namespace)?;
        ensure_non_empty("test_name", &self.test_name)?;
        ensure_non_empty("created_by", &self.created_by)?;
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TestResult {
    pub seq: i64,
    pub namespace: String,
    pub migration_version: Option<String>,
    pub test_name: String,
    pub tap_output: String,
    pub success: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    pub created_by: String,
    pub provenance: Option<String>,
}

/// Error details captured when an apply or rollback body fails.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExceptionDiagnostic {
    pub namespace: String,
    pub migrate_version: String,
    pub routine: String,
    pub code: String,
    pub message: String,
    pub detail: Option<String>,
    pub hint: Option<String>,
    pub context: Option<String>,
    pub created_by: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InstalledRoutine {
    pub routine_name: String,
    pub namespace: String,
    pub migrate_version: String,
    pub kind: RoutineKind,
    pub body: Value,
    pub checksum: String,
    #[serde(with = "time::serde::rfc3339")]
    pub installed_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LockLease {
    pub lock_key: i64,
    pub operation: String,
    pub holder: String,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
}

/// What happened to each step of a body that ran to completion.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct BodyReport {
    pub executed: Vec<String>,
    pub skipped: Vec<String>,
    pub notices: Vec<String>,
}

impl BodyReport {
    #[must_use]
    pub fn to_json(&self) -> Value {
        serde_json::json!({
            "executed": self.executed,
            "skipped": self.skipped,
            "notices": self.notices,
        })
    }
}

/// Stable advisory-lock key: the first eight bytes of SHA-256 as a signed integer.
#[must_use]
pub fn advisory_lock_key(operation: &str) -> i64 {
    let digest = Sha256::digest(operation.as_bytes());
    let mut bytes = [0_u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    i64::from_be_bytes(bytes)
}

#[must_use]
pub fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// SHA-256 over the `serde_json` encoding of `value`.
///
/// # Errors
/// Returns [`IslmError::Compile`] if serialization fails.
pub fn hash_json(value: &Value) -> Result<String, IslmError> {
    let bytes = serde_json::to_vec(value)
        .map_err(|err| IslmError::Compile(format!("failed to encode JSON for hashing: {err}")))?;
    Ok(hash_bytes(&bytes))
}

/// # Errors
/// Returns [`IslmError::Validation`] when the value is empty after trimming.
pub fn ensure_non_empty(field_name: &str, value: &str) -> Result<(), IslmError> {
    if value.trim().is_empty() {
        return Err(IslmError::Validation(format!("{field_name} MUST be non-empty")));
    }
    Ok(())
}

/// Parses an RFC3339 timestamp.
///
/// # Errors
/// Returns [`IslmError::Validation`] for malformed input or a non-UTC offset.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, IslmError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| IslmError::Validation(format!("invalid RFC3339 timestamp: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(IslmError::Validation(
            "timestamp MUST use UTC offset Z".to_string(),
        ));
    }

    Ok(parsed)
}

/// # Errors
/// Returns [`IslmError::Validation`] if the timestamp cannot be formatted.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, IslmError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| IslmError::Validation(format!("failed to format RFC3339 timestamp: {err}")))
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use time::macros::datetime;

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    fn fixture_version() -> MigrationVersion {
        must_ok(MigrationVersion::new(
            "update-table1",
            datetime!(2024-08-04 09:55:45 UTC),
        ))
    }

    #[test]
    fn transition_status_round_trips_and_rejects_unknown_values() {
        for status in [
            TransitionStatus::None,
            TransitionStatus::SqlLoaded,
            TransitionStatus::Migrated,
            TransitionStatus::RolledBack,
            TransitionStatus::Failed,
        ] {
            assert_eq!(TransitionStatus::parse(status.as_str()), Some(status));
            let encoded = must_ok(serde_json::to_string(&status));
            assert_eq!(encoded, format!("\"{}\"", status.as_str()));
        }
        assert_eq!(TransitionStatus::parse("_stateful_"), None);
        assert_eq!(TransitionStatus::parse("migrated"), None);
    }

    #[test]
    fn transition_table_matches_lifecycle() {
        use TransitionStatus::{Failed, Migrated, None, RolledBack, SqlLoaded};

        assert!(None.can_transition_to(SqlLoaded));
        assert!(SqlLoaded.can_transition_to(Migrated));
        assert!(RolledBack.can_transition_to(Migrated));
        assert!(Failed.can_transition_to(Migrated));
        assert!(Migrated.can_transition_to(RolledBack));
        assert!(Failed.can_transition_to(RolledBack));

        assert!(!None.can_transition_to(Migrated));
        assert!(!SqlLoaded.can_transition_to(RolledBack));
        assert!(!Migrated.can_transition_to(Migrated));
        assert!(!Migrated.can_transition_to(SqlLoaded));
        assert!(!RolledBack.can_transition_to(RolledBack));
    }

    #[test]
    fn governance_input_validates_transition_and_fields() {
        let version = fixture_version();
        let valid = GovernanceRecordInput::for_transition(
            "dv",
            &version,
            TransitionStatus::None,
            TransitionStatus::SqlLoaded,
            "SQL load for migration",
            json!({}),
            DEFAULT_ACTOR,
        );
        must_ok(valid.validate());
        assert_eq!(
            valid.sp_migration_undo_name,
            "migrate_v2024_08_04_09_55_45_update_table1_undo"
        );

        let mut skipped_load = valid.clone();
        skipped_load.to_state = TransitionStatus::RolledBack;
        assert!(skipped_load.validate().is_err());

        let mut not_object = valid.clone();
        not_object.transition_result = json!([1, 2]);
        assert!(not_object.validate().is_err());

        let mut anonymous = valid;
        anonymous.created_by = "  ".to_string();
        assert!(anonymous.validate().is_err());
    }

    #[test]
    fn advisory_lock_key_is_stable_and_distinct() {
        let first = advisory_lock_key("islm_index_build:idx_a");
        assert_eq!(first, advisory_lock_key("islm_index_build:idx_a"));
        assert_ne!(first, advisory_lock_key("islm_index_build:idx_b"));
    }

    #[test]
    fn rfc3339_helpers_require_utc() {
        let parsed = must_ok(parse_rfc3339_utc("2024-08-04T09:55:45Z"));
        assert_eq!(must_ok(format_rfc3339(parsed)), "2024-08-04T09:55:45Z");
        assert!(parse_rfc3339_utc("2024-08-04T09:55:45+02:00").is_err());
    }
}
