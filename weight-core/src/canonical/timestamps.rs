//! Canonical UTC timestamps: `YYYY-MM-DDTHH:MM:SSZ`, whole seconds only.

use chrono::{DateTime, NaiveDateTime, Utc};
use thiserror::Error;

pub const CANONICAL_TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TimestampError {
    #[error("timestamp must end with 'Z'")]
    MissingZulu,
    #[error("timestamp must not carry fractional seconds")]
    Fractional,
    #[error("timestamp must be exactly 20 characters, got {0}")]
    BadLength(usize),
    #[error("unparseable timestamp: {0}")]
    Parse(String),
}

/// Current time in canonical form.
pub fn canonical_timestamp() -> String {
    format_timestamp(Utc::now())
}

pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.format(CANONICAL_TIMESTAMP_FORMAT).to_string()
}

/// Strict format check without building a `DateTime`.
pub fn validate_timestamp_format(ts: &str) -> Result<(), TimestampError> {
    if !ts.ends_with('Z') {
        return Err(TimestampError::MissingZulu);
    }
    if ts.contains('.') {
        return Err(TimestampError::Fractional);
    }
    if ts.len() != 20 {
        return Err(TimestampError::BadLength(ts.len()));
    }
    Ok(())
}

pub fn parse_canonical_timestamp(ts: &str) -> Result<DateTime<Utc>, TimestampError> {
    validate_timestamp_format(ts)?;
    NaiveDateTime::parse_from_str(ts, CANONICAL_TIMESTAMP_FORMAT)
        .map(|naive| naive.and_utc())
        .map_err(|e| TimestampError::Parse(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn formats_whole_seconds_with_zulu() {
        let at = Utc.with_ymd_and_hms(2025, 1, 2, 3, 4, 5).unwrap();
        assert_eq!(format_timestamp(at), "2025-01-02T03:04:05Z");
        assert_eq!(canonical_timestamp().len(), 20);
    }

    #[test]
    fn rejects_non_canonical_forms() {
        assert_eq!(
            validate_timestamp_format("2025-01-02T03:04:05"),
            Err(TimestampError::MissingZulu)
        );
        assert_eq!(
            validate_timestamp_format("2025-01-02T03:04:05.123Z"),
            Err(TimestampError::Fractional)
        );
        assert!(parse_canonical_timestamp("2025-13-02T03:04:05Z").is_err());
    }

    #[test]
    fn parse_round_trips() {
        let at = Utc.with_ymd_and_hms(2024, 12, 31, 23, 59, 59).unwrap();
        assert_eq!(parse_canonical_timestamp(&format_timestamp(at)).unwrap(), at);
    }
}
