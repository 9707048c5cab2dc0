//! Timestamp utilities
//!
//! Timestamps are persisted as fixed-width RFC 3339 UTC strings
//! (`2025-01-31T12:00:00.000000Z`) so that text comparison in SQL orders chronologically.

use chrono::{DateTime, Months, SecondsFormat, Utc};

use crate::{Error, Result};

/// Get current UTC timestamp
pub fn now() -> DateTime<Utc> {
    Utc::now()
}

/// Format a timestamp for storage
pub fn to_db(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse a stored timestamp
pub fn from_db(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::Internal(format!("Failed to parse timestamp '{}': {}", value, e)))
}

/// Parse an optional stored timestamp
pub fn from_db_opt(value: Option<String>) -> Result<Option<DateTime<Utc>>> {
    value.as_deref().map(from_db).transpose()
}

/// Add calendar months (clamped to the end of shorter months)
pub fn add_months(ts: DateTime<Utc>, months: u32) -> Result<DateTime<Utc>> {
    ts.checked_add_months(Months::new(months))
        .ok_or_else(|| Error::InvalidInput(format!("Timestamp overflow adding {} months", months)))
}

/// Whole days elapsed from `earlier` to `later` (never negative)
pub fn whole_days_between(earlier: DateTime<Utc>, later: DateTime<Utc>) -> i64 {
    (later - earlier).num_days().max(0)
}
