use std::fmt;

use thiserror::Error;

const MAX_TABLE_NAME_LEN: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("target table name is not configured (`table_name` or MAILTRAIL_TABLE_NAME)")]
    MissingTableName,
    #[error("invalid table name `{0}`: expected 1-64 of [A-Za-z0-9_]")]
    InvalidTableName(String),
}

/// A validated store identifier, safe to interpolate into SQL.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TableName(String);

impl TableName {
    pub fn parse(value: &str) -> Result<Self, ConfigError> {
        let value = value.trim();
        let valid = !value.is_empty()
            && value.len() <= MAX_TABLE_NAME_LEN
            && value.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_');

        if valid {
            Ok(Self(value.to_string()))
        } else {
            Err(ConfigError::InvalidTableName(value.to_string()))
        }
    }
}

impl fmt::Display for TableName {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Runs before any message of an invocation is touched. A missing or blank
/// table name is fatal for the whole batch.
pub fn require_table_name(value: Option<&str>) -> Result<TableName, ConfigError> {
    match value.map(str::trim) {
        None | Some("") => Err(ConfigError::MissingTableName),
        Some(name) => TableName::parse(name),
    }
}
