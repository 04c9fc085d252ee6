//! Column encoding shared by the SQLite repositories.
//!
//! Ids are stored as UUID strings, JSON as TEXT, status enums as their serde
//! names, and timestamps as fixed-width RFC 3339 (microseconds, `Z`) so that
//! text ordering matches time ordering.

use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use leadflow_types::error::RepositoryError;
use serde::Serialize;
use serde::de::DeserializeOwned;

pub(crate) fn parse_id<T>(s: &str) -> Result<T, RepositoryError>
where
    T: FromStr<Err = uuid::Error>,
{
    s.parse::<T>()
        .map_err(|e| RepositoryError::Query(format!("invalid UUID: {e}")))
}

pub(crate) fn parse_opt_id<T>(s: Option<&str>) -> Result<Option<T>, RepositoryError>
where
    T: FromStr<Err = uuid::Error>,
{
    s.map(parse_id).transpose()
}

pub(crate) fn parse_datetime(s: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Query(format!("invalid datetime: {e}")))
}

pub(crate) fn parse_opt_datetime(s: Option<&str>) -> Result<Option<DateTime<Utc>>, RepositoryError> {
    s.map(parse_datetime).transpose()
}

pub(crate) fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_json<T: DeserializeOwned>(s: &str, column: &str) -> Result<T, RepositoryError> {
    serde_json::from_str(s).map_err(|e| RepositoryError::Query(format!("invalid {column} JSON: {e}")))
}

pub(crate) fn to_json<T: Serialize>(value: &T) -> Result<String, RepositoryError> {
    serde_json::to_string(value).map_err(|e| RepositoryError::Query(format!("serialize: {e}")))
}

/// The serde name of a unit enum variant (`StepStatus::Queued` -> `"queued"`).
pub(crate) fn enum_str<T: Serialize>(value: &T) -> Result<String, RepositoryError> {
    match serde_json::to_value(value) {
        Ok(serde_json::Value::String(s)) => Ok(s),
        Ok(other) => Err(RepositoryError::Query(format!("not a unit variant: {other}"))),
        Err(e) => Err(RepositoryError::Query(e.to_string())),
    }
}

pub(crate) fn parse_enum<T: DeserializeOwned>(s: &str, column: &str) -> Result<T, RepositoryError> {
    serde_json::from_value(serde_json::Value::String(s.to_string()))
        .map_err(|_| RepositoryError::Query(format!("invalid {column}: {s}")))
}

pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db_err) if db_err.message().contains("UNIQUE"))
}
