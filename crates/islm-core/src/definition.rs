use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use time::{OffsetDateTime, UtcOffset};

use crate::schema::{ColumnDescriptor, Ident, IndexDescriptor, SeedRow, TableSpec};
use crate::RegistrationError;

pub const MAX_DESCRIPTION_LEN: usize = 20;

/// Identity of one migration: a short description plus the UTC instant it was authored.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MigrationVersion {
    description: String,
    #[serde(with = "time::serde::rfc3339")]
    timestamp: OffsetDateTime,
}

impl MigrationVersion {
    /// # Errors
    /// Returns [`RegistrationError::DescriptionTooLong`] for descriptions over
    /// [`MAX_DESCRIPTION_LEN`] characters (never truncated) and
    /// [`RegistrationError::InvalidDescription`] for empty descriptions, characters
    /// outside `[a-z0-9_-]`, or timestamps outside years 1970..=9999.
    pub fn new(
        description: impl Into<String>,
        timestamp: OffsetDateTime,
    ) -> Result<Self, RegistrationError> {
        let description = description.into();
        let length = description.chars().count();

        if length > MAX_DESCRIPTION_LEN {
            return Err(RegistrationError::DescriptionTooLong {
                description,
                length,
            });
        }

        if length == 0 {
            return Err(RegistrationError::InvalidDescription {
                description,
                reason: "description must not be empty".to_string(),
            });
        }

        if let Some(bad) = description
            .chars()
            .find(|ch| !(ch.is_ascii_lowercase() || ch.is_ascii_digit() || *ch == '_' || *ch == '-'))
        {
            return Err(RegistrationError::InvalidDescription {
                reason: format!("character `{bad}` is outside [a-z0-9_-]"),
                description,
            });
        }

        // Version ids carry whole seconds only.
        let timestamp = match timestamp.to_offset(UtcOffset::UTC).replace_nanosecond(0) {
            Ok(value) => value,
            Err(err) => {
                return Err(RegistrationError::InvalidDescription {
                    reason: format!("invalid timestamp: {err}"),
                    description,
                })
            }
        };
        if !(1970..=9999).contains(&timestamp.year()) {
            return Err(RegistrationError::InvalidDescription {
                reason: format!("timestamp year {} is outside 1970..=9999", timestamp.year()),
                description,
            });
        }

        Ok(Self {
            description,
            timestamp,
        })
    }

    #[must_use]
    pub fn description(&self) -> &str {
        &self.description
    }

    #[must_use]
    pub fn timestamp(&self) -> OffsetDateTime {
        self.timestamp
    }

    /// `v<YYYY_MM_DD_HH_MM_SS>_<slug>`; lexical order equals chronological order.
    #[must_use]
    pub fn version_id(&self) -> String {
        let ts = self.timestamp;
        format!(
            "v{:04}_{:02}_{:02}_{:02}_{:02}_{:02}_{}",
            ts.year(),
            u8::from(ts.month()),
            ts.day(),
            ts.hour(),
            ts.minute(),
            ts.second(),
            self.description.replace('-', "_"),
        )
    }

    #[must_use]
    pub fn routine_names(&self) -> RoutineNames {
        let version_id = self.version_id();
        RoutineNames {
            migrate: format!("migrate_{version_id}"),
            undo: format!("migrate_{version_id}_undo"),
            status: format!("migrate_{version_id}_status"),
        }
    }
}

impl Ord for MigrationVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        self.timestamp
            .cmp(&other.timestamp)
            .then_with(|| self.description.cmp(&other.description))
    }
}

impl PartialOrd for MigrationVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutineNames {
    pub migrate: String,
    pub undo: String,
    pub status: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RoutineKind {
    Apply,
    Rollback,
    Status,
}

impl RoutineKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Apply => "apply",
            Self::Rollback => "rollback",
            Self::Status => "status",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "apply" => Some(Self::Apply),
            "rollback" => Some(Self::Rollback),
            "status" => Some(Self::Status),
            _ => None,
        }
    }
}

/// One typed schema change. Compiled to SQL by a dialect; never hand-interpolated.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MigrationStep {
    CreateSchemaObjects {
        tables: Vec<TableSpec>,
    },
    AddColumn {
        table: Ident,
        column: ColumnDescriptor,
    },
    DropColumn {
        table: Ident,
        column: Ident,
    },
    CreateIndex(IndexDescriptor),
    DropIndex {
        name: Ident,
    },
    DropTable {
        table: Ident,
    },
    Seed {
        table: Ident,
        rows: Vec<SeedRow>,
    },
    /// Raw SQL escape hatch. The statement must be idempotent on its own.
    Statement {
        sql: String,
    },
}

/// Read-only catalog check answering "is this version applied?".
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StatusProbe {
    ColumnExists { table: Ident, column: Ident },
    ColumnAbsent { table: Ident, column: Ident },
    TableExists { table: Ident },
    TableAbsent { table: Ident },
    IndexExists { name: Ident },
    IndexAbsent { name: Ident },
    AllOf { probes: Vec<StatusProbe> },
    AnyOf { probes: Vec<StatusProbe> },
    Never,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationDefinition {
    pub version: MigrationVersion,
    pub apply: Vec<MigrationStep>,
    pub rollback: Vec<MigrationStep>,
    pub status: StatusProbe,
}

impl MigrationDefinition {
    #[must_use]
    pub fn new(
        version: MigrationVersion,
        apply: Vec<MigrationStep>,
        rollback: Vec<MigrationStep>,
        status: StatusProbe,
    ) -> Self {
        Self {
            version,
            apply,
            rollback,
            status,
        }
    }

    #[must_use]
    pub fn version_id(&self) -> String {
        self.version.version_id()
    }
}

/// Regression assertions whose aggregate outcome feeds the test gate.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TestSuite {
    pub name: String,
    #[serde(default)]
    pub migration_version: Option<String>,
    pub assertions: Vec<Assertion>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Assertion {
    /// Passes when the probe evaluates to 1.
    Probe {
        description: String,
        probe: StatusProbe,
    },
    /// Passes when the first column of the first row is non-zero.
    Query { description: String, sql: String },
}

impl Assertion {
    #[must_use]
    pub fn description(&self) -> &str {
        match self {
            Self::Probe { description, .. } | Self::Query { description, .. } => description,
        }
    }
}
