//! Text encodings shared by the repositories.

use chrono::{DateTime, Utc};

use salla_mirror_core::entities::format_timestamp;
use salla_mirror_core::errors::{DatabaseError, Error, Result};

pub(crate) fn enum_to_db<T: serde::Serialize>(value: &T) -> Result<String> {
    Ok(serde_json::to_string(value)?.trim_matches('"').to_string())
}

pub(crate) fn enum_from_db<T: serde::de::DeserializeOwned>(value: &str) -> Result<T> {
    Ok(serde_json::from_str(&format!("\"{}\"", value))?)
}

pub(crate) fn timestamp_to_db(value: DateTime<Utc>) -> String {
    format_timestamp(value)
}

pub(crate) fn timestamp_from_db(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|parsed| parsed.with_timezone(&Utc))
        .map_err(|err| {
            Error::Database(DatabaseError::Internal(format!(
                "Stored timestamp '{}' is not RFC 3339: {}",
                value, err
            )))
        })
}

pub(crate) fn count_from_db(value: i32, column: &str) -> Result<u32> {
    u32::try_from(value).map_err(|_| {
        Error::Database(DatabaseError::Internal(format!(
            "Stored {} is negative: {}",
            column, value
        )))
    })
}

pub(crate) fn count_to_db(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}
