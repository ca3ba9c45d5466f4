//! Typed schema-object descriptors.
//!
//! Tables, columns and indexes are described as data and only turned into SQL
//! text by a [`crate::compiler::SqlDialect`]. Identifiers are validated once, on
//! construction, and quoted by the dialect on emission.

use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::IslmError;

/// PostgreSQL truncates identifiers beyond 63 bytes; both dialects share the limit.
pub const MAX_IDENT_LEN: usize = 63;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Ident(String);

impl Ident {
    /// Validates a raw SQL identifier.
    ///
    /// # Errors
    /// Returns [`IslmError::Validation`] unless the value matches
    /// `[A-Za-z_][A-Za-z0-9_]*` and is at most [`MAX_IDENT_LEN`] bytes.
    pub fn new(raw: impl Into<String>) -> Result<Self, IslmError> {
        let raw = raw.into();
        let mut chars = raw.chars();
        let valid_head = chars
            .next()
            .is_some_and(|head| head.is_ascii_alphabetic() || head == '_');
        let valid_tail = chars.all(|ch| ch.is_ascii_alphanumeric() || ch == '_');

        if !valid_head || !valid_tail {
            return Err(IslmError::Validation(format!(
                "invalid identifier `{raw}`: expected [A-Za-z_][A-Za-z0-9_]*"
            )));
        }

        if raw.len() > MAX_IDENT_LEN {
            return Err(IslmError::Validation(format!(
                "identifier `{raw}` exceeds {MAX_IDENT_LEN} bytes"
            )));
        }

        Ok(Self(raw))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for Ident {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Ident {
    type Error = IslmError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl TryFrom<&str> for Ident {
    type Error = IslmError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Ident> for String {
    fn from(value: Ident) -> Self {
        value.0
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Text,
    Integer,
    Boolean,
    Json,
    Timestamp,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum SqlValue {
    Boolean(bool),
    Integer(i64),
    Text(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DefaultValue {
    Null,
    CurrentTimestamp,
    Value(SqlValue),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ColumnDescriptor {
    pub name: Ident,
    #[serde(rename = "type")]
    pub column_type: ColumnType,
    #[serde(default)]
    pub nullable: bool,
    #[serde(default)]
    pub default: Option<DefaultValue>,
    #[serde(default)]
    pub primary_key: bool,
}

impl ColumnDescriptor {
    #[must_use]
    pub fn required(name: Ident, column_type: ColumnType) -> Self {
        Self {
            name,
            column_type,
            nullable: false,
            default: None,
            primary_key: false,
        }
    }

    #[must_use]
    pub fn nullable(name: Ident, column_type: ColumnType) -> Self {
        Self {
            nullable: true,
            ..Self::required(name, column_type)
        }
    }

    #[must_use]
    pub fn primary_key(name: Ident) -> Self {
        Self {
            primary_key: true,
            ..Self::required(name, ColumnType::Text)
        }
    }

    #[must_use]
    pub fn with_default(mut self, default: DefaultValue) -> Self {
        self.default = Some(default);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForeignKey {
    pub column: Ident,
    pub references_table: Ident,
    pub references_column: Ident,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TableRole {
    Hub,
    EnumLookup,
    Satellite,
    Link,
    Plain,
}

impl TableRole {
    /// Tie-break rank used when two tables have no dependency between them.
    #[must_use]
    pub fn rank(self) -> u8 {
        match self {
            Self::Hub => 0,
            Self::EnumLookup => 1,
            Self::Satellite => 2,
            Self::Link => 3,
            Self::Plain => 4,
        }
    }
}

pub type SeedRow = BTreeMap<Ident, SqlValue>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TableDescriptor {
    pub name: Ident,
    pub role: TableRole,
    pub columns: Vec<ColumnDescriptor>,
    #[serde(default)]
    pub foreign_keys: Vec<ForeignKey>,
    #[serde(default)]
    pub unique: Vec<Vec<Ident>>,
    #[serde(default)]
    pub seed: Vec<SeedRow>,
}

impl TableDescriptor {
    /// `hub_<name>` with a text key and housekeeping columns.
    ///
    /// # Errors
    /// Returns [`IslmError::Validation`] when a derived identifier is invalid.
    pub fn hub(name: &str) -> Result<Self, IslmError> {
        TableSpec::Hub {
            name: Ident::new(name)?,
            columns: Vec::new(),
        }
        .describe()
    }

    /// `sat_<hub>_<name>` referencing the hub named by `hub` (without prefix).
    ///
    /// # Errors
    /// Returns [`IslmError::Validation`] when a derived identifier is invalid.
    pub fn satellite(
        hub: &str,
        name: &str,
        columns: Vec<ColumnDescriptor>,
    ) -> Result<Self, IslmError> {
        TableSpec::Satellite {
            hub: Ident::new(hub)?,
            name: Ident::new(name)?,
            columns,
        }
        .describe()
    }

    /// # Errors
    /// Returns [`IslmError::Validation`] for fewer than two hubs or invalid names.
    pub fn link(name: &str, hubs: &[&str]) -> Result<Self, IslmError> {
        TableSpec::Link {
            name: Ident::new(name)?,
            hubs: hubs
                .iter()
                .map(|hub| Ident::new(*hub))
                .collect::<Result<Vec<_>, _>>()?,
            columns: Vec::new(),
        }
        .describe()
    }

    /// # Errors
    /// Returns [`IslmError::Validation`] for an empty value list or invalid name.
    pub fn enum_table(name: &str, values: &[&str]) -> Result<Self, IslmError> {
        TableSpec::Enum {
            name: Ident::new(name)?,
            values: values.iter().map(|value| (*value).to_string()).collect(),
        }
        .describe()
    }

    /// Tables this one references, excluding itself.
    pub fn references(&self) -> impl Iterator<Item = &Ident> {
        self.foreign_keys
            .iter()
            .map(|fk| &fk.references_table)
            .filter(move |table| *table != &self.name)
    }

    #[must_use]
    pub fn primary_key(&self) -> Option<&ColumnDescriptor> {
        self.columns.iter().find(|column| column.primary_key)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IndexDescriptor {
    pub name: Ident,
    pub table: Ident,
    pub columns: Vec<Ident>,
    #[serde(default)]
    pub unique: bool,
    /// Built outside the main migration transaction under an advisory lock.
    #[serde(default)]
    pub deferred: bool,
}

/// Data-vault authoring surface. Each variant expands into a full
/// [`TableDescriptor`] with the conventional key and housekeeping columns.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum TableSpec {
    Hub {
        name: Ident,
        #[serde(default)]
        columns: Vec<ColumnDescriptor>,
    },
    Satellite {
        hub: Ident,
        name: Ident,
        #[serde(default)]
        columns: Vec<ColumnDescriptor>,
    },
    Link {
        name: Ident,
        hubs: Vec<Ident>,
        #[serde(default)]
        columns: Vec<ColumnDescriptor>,
    },
    Enum {
        name: Ident,
        values: Vec<String>,
    },
    Plain {
        name: Ident,
        columns: Vec<ColumnDescriptor>,
        #[serde(default)]
        foreign_keys: Vec<ForeignKey>,
        #[serde(default)]
        unique: Vec<Vec<Ident>>,
    },
}

impl TableSpec {
    /// Expands the spec into a concrete table descriptor.
    ///
    /// # Errors
    /// Returns [`IslmError::Validation`] when a derived identifier is invalid
    /// or the spec is structurally empty.
    pub fn describe(&self) -> Result<TableDescriptor, IslmError> {
        match self {
            Self::Hub { name, columns } => {
                let table = prefixed("hub", name)?;
                let mut all = vec![
                    ColumnDescriptor::primary_key(suffixed(&table, "id")?),
                    ColumnDescriptor::nullable(Ident::new("key")?, ColumnType::Text),
                ];
                all.extend(columns.iter().cloned());
                all.extend(housekeeping_columns()?);
                ensure_unique_columns(&table, &all)?;
                Ok(TableDescriptor {
                    name: table,
                    role: TableRole::Hub,
                    columns: all,
                    foreign_keys: Vec::new(),
                    unique: Vec::new(),
                    seed: Vec::new(),
                })
            }
            Self::Satellite { hub, name, columns } => {
                let hub_table = prefixed("hub", hub)?;
                let hub_key = suffixed(&hub_table, "id")?;
                let table = Ident::new(format!("sat_{hub}_{name}"))?;
                let mut all = vec![
                    ColumnDescriptor::primary_key(suffixed(&table, "id")?),
                    ColumnDescriptor::required(hub_key.clone(), ColumnType::Text),
                ];
                all.extend(columns.iter().cloned());
                all.extend(housekeeping_columns()?);
                ensure_unique_columns(&table, &all)?;
                Ok(TableDescriptor {
                    name: table,
                    role: TableRole::Satellite,
                    columns: all,
                    foreign_keys: vec![ForeignKey {
                        column: hub_key.clone(),
                        references_table: hub_table,
                        references_column: hub_key,
                    }],
                    unique: Vec::new(),
                    seed: Vec::new(),
                })
            }
            Self::Link {
                name,
                hubs,
                columns,
            } => {
                if hubs.len() < 2 {
                    return Err(IslmError::Validation(format!(
                        "link {name} must reference at least two hubs"
                    )));
                }

                let table = prefixed("link", name)?;
                let mut all = vec![ColumnDescriptor::primary_key(suffixed(&table, "id")?)];
                let mut foreign_keys = Vec::new();
                for hub in hubs {
                    let hub_table = prefixed("hub", hub)?;
                    let hub_key = suffixed(&hub_table, "id")?;
                    all.push(ColumnDescriptor::required(hub_key.clone(), ColumnType::Text));
                    foreign_keys.push(ForeignKey {
                        column: hub_key.clone(),
                        references_table: hub_table,
                        references_column: hub_key,
                    });
                }
                all.extend(columns.iter().cloned());
                all.extend(housekeeping_columns()?);
                ensure_unique_columns(&table, &all)?;
                let unique = vec![foreign_keys.iter().map(|fk| fk.column.clone()).collect()];
                Ok(TableDescriptor {
                    name: table,
                    role: TableRole::Link,
                    columns: all,
                    foreign_keys,
                    unique,
                    seed: Vec::new(),
                })
            }
            Self::Enum { name, values } => {
                if values.is_empty() {
                    return Err(IslmError::Validation(format!(
                        "enum table {name} requires at least one value"
                    )));
                }

                let code = Ident::new("code")?;
                let value = Ident::new("value")?;
                let seed = values
                    .iter()
                    .map(|item| {
                        let mut row = SeedRow::new();
                        row.insert(code.clone(), SqlValue::Text(item.clone()));
                        row.insert(value.clone(), SqlValue::Text(item.clone()));
                        row
                    })
                    .collect();

                Ok(TableDescriptor {
                    name: name.clone(),
                    role: TableRole::EnumLookup,
                    columns: vec![
                        ColumnDescriptor::primary_key(code),
                        ColumnDescriptor::required(value, ColumnType::Text),
                        ColumnDescriptor::required(Ident::new("created_at")?, ColumnType::Timestamp)
                            .with_default(DefaultValue::CurrentTimestamp),
                    ],
                    foreign_keys: Vec::new(),
                    unique: Vec::new(),
                    seed,
                })
            }
            Self::Plain {
                name,
                columns,
                foreign_keys,
                unique,
            } => {
                if columns.is_empty() {
                    return Err(IslmError::Validation(format!(
                        "table {name} must declare at least one column"
                    )));
                }
                ensure_unique_columns(name, columns)?;
                Ok(TableDescriptor {
                    name: name.clone(),
                    role: TableRole::Plain,
                    columns: columns.clone(),
                    foreign_keys: foreign_keys.clone(),
                    unique: unique.clone(),
                    seed: Vec::new(),
                })
            }
        }
    }
}

fn prefixed(prefix: &str, name: &Ident) -> Result<Ident, IslmError> {
    Ident::new(format!("{prefix}_{name}"))
}

fn suffixed(name: &Ident, suffix: &str) -> Result<Ident, IslmError> {
    Ident::new(format!("{name}_{suffix}"))
}

fn housekeeping_columns() -> Result<Vec<ColumnDescriptor>, IslmError> {
    Ok(vec![
        ColumnDescriptor::required(Ident::new("created_at")?, ColumnType::Timestamp)
            .with_default(DefaultValue::CurrentTimestamp),
        ColumnDescriptor::nullable(Ident::new("created_by")?, ColumnType::Text)
            .with_default(DefaultValue::Value(SqlValue::Text("UNKNOWN".to_string()))),
        ColumnDescriptor::nullable(Ident::new("provenance")?, ColumnType::Text),
    ])
}

fn ensure_unique_columns(table: &Ident, columns: &[ColumnDescriptor]) -> Result<(), IslmError> {
    let mut seen = std::collections::BTreeSet::new();
    for column in columns {
        if !seen.insert(&column.name) {
            return Err(IslmError::Validation(format!(
                "table {table} declares column {} more than once",
                column.name
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ident(raw: &str) -> Ident {
        match Ident::new(raw) {
            Ok(value) => value,
            Err(err) => panic!("invalid fixture identifier {raw}: {err}"),
        }
    }

    #[test]
    fn ident_rejects_quotes_and_leading_digits() {
        assert!(Ident::new("hub_interaction").is_ok());
        assert!(Ident::new("_private").is_ok());
        assert!(Ident::new("1table").is_err());
        assert!(Ident::new("bad\"name").is_err());
        assert!(Ident::new("drop table x; --").is_err());
        assert!(Ident::new("").is_err());
        assert!(Ident::new("x".repeat(MAX_IDENT_LEN + 1)).is_err());
    }

    #[test]
    fn satellite_references_its_hub() {
        let spec = TableSpec::Satellite {
            hub: ident("exception"),
            name: ident("diagnostics"),
            columns: vec![ColumnDescriptor::required(ident("message"), ColumnType::Text)],
        };

        let table = match spec.describe() {
            Ok(value) => value,
            Err(err) => panic!("describe failed: {err}"),
        };

        assert_eq!(table.name.as_str(), "sat_exception_diagnostics");
        assert_eq!(table.role, TableRole::Satellite);
        assert_eq!(
            table.primary_key().map(|column| column.name.as_str()),
            Some("sat_exception_diagnostics_id")
        );
        let references: Vec<&str> = table.references().map(Ident::as_str).collect();
        assert_eq!(references, vec!["hub_exception"]);
        assert!(table
            .columns
            .iter()
            .any(|column| column.name.as_str() == "provenance"));
    }

    #[test]
    fn enum_table_seeds_every_value() {
        let spec = TableSpec::Enum {
            name: ident("file_exchange_protocol"),
            values: vec!["SFTP".to_string(), "S3".to_string()],
        };
        let table = match spec.describe() {
            Ok(value) => value,
            Err(err) => panic!("describe failed: {err}"),
        };

        assert_eq!(table.role, TableRole::EnumLookup);
        assert_eq!(table.seed.len(), 2);
    }

    #[test]
    fn link_requires_two_hubs_and_duplicate_columns_fail() {
        let lonely = TableSpec::Link {
            name: ident("solo"),
            hubs: vec![ident("interaction")],
            columns: Vec::new(),
        };
        assert!(lonely.describe().is_err());

        let duplicated = TableSpec::Hub {
            name: ident("interaction"),
            columns: vec![ColumnDescriptor::nullable(ident("key"), ColumnType::Text)],
        };
        assert!(duplicated.describe().is_err());
    }

    #[test]
    fn table_spec_deserializes_from_toml() {
        let raw = r#"
role = "satellite"
hub = "interaction"
name = "http_request"
columns = [
  { name = "payload", type = "json" },
  { name = "nature", type = "json", nullable = true },
]
"#;
        let spec: TableSpec = match toml::from_str(raw) {
            Ok(value) => value,
            Err(err) => panic!("failed to parse table spec: {err}"),
        };
        let table = match spec.describe() {
            Ok(value) => value,
            Err(err) => panic!("describe failed: {err}"),
        };
        assert_eq!(table.name.as_str(), "sat_interaction_http_request");
    }
}
