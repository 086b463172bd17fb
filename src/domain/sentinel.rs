//! Completion sentinels.
//!
//! A sentinel column holds either the reserved unset marker or the time the
//! stage completed. The marker is not a parseable timestamp, so it can never
//! be confused with a real completion time.

use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};

/// Reserved value stored in a sentinel column that has not been set
pub const UNSET_MARKER: &str = "0000-00-00 00:00:00";

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f";

/// Completion state of a single stage on a single unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Sentinel {
    #[default]
    Unset,
    Done(DateTime<Utc>),
}

impl Sentinel {
    pub fn is_set(&self) -> bool {
        matches!(self, Sentinel::Done(_))
    }

    /// Encode for storage
    pub fn encode(&self) -> String {
        match self {
            Sentinel::Unset => UNSET_MARKER.to_string(),
            Sentinel::Done(ts) => encode_timestamp(*ts),
        }
    }

    /// Decode a stored value
    pub fn decode(raw: &str) -> Option<Self> {
        if raw == UNSET_MARKER {
            return Some(Sentinel::Unset);
        }
        decode_timestamp(raw).map(Sentinel::Done)
    }
}

/// Timestamp encoding shared by sentinels and other stored times.
///
/// Fixed-width UTC text so that string comparison in SQL orders correctly.
pub fn encode_timestamp(ts: DateTime<Utc>) -> String {
    ts.format("%Y-%m-%d %H:%M:%S%.6f").to_string()
}

/// Inverse of [`encode_timestamp`]
pub fn decode_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(raw, TIMESTAMP_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

impl ToSql for Sentinel {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.encode()))
    }
}

impl FromSql for Sentinel {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let raw = value.as_str()?;
        Sentinel::decode(raw).ok_or_else(|| {
            FromSqlError::Other(format!("invalid sentinel value: {raw}").into())
        })
    }
}
