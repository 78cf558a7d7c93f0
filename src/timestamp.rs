//! Canonical textual form of persisted lifecycle instants.
//!
//! Instants are written as
//! `YYYY-MM-DD HH:MM:SS.fffffffff ±HHMM TZN` — four whitespace-separated
//! fields. The zone name field is skipped when parsing; the numeric offset
//! is authoritative.

use chrono::DateTime;
use chrono::Local;

/// The pattern used to render an instant.
const FORMAT: &str = "%Y-%m-%d %H:%M:%S%.9f %z %Z";

/// The pattern used to parse an instant.
///
/// The fractional seconds are flexible on input so files written with
/// trailing zeros trimmed still parse.
const PARSE_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f %z %Z";

/// Errors raised when a persisted instant cannot be parsed.
#[derive(Debug, thiserror::Error)]
pub enum TimestampError {
    /// The text did not have exactly four whitespace-separated fields.
    #[error("timestamp must have exactly four whitespace-separated fields")]
    FieldCount,

    /// The fields did not parse as an instant.
    #[error(transparent)]
    Parse(#[from] chrono::ParseError),
}

/// Renders an instant in the canonical textual form.
pub fn format(instant: &DateTime<Local>) -> String {
    instant.format(FORMAT).to_string()
}

/// Parses an instant from the canonical textual form.
///
/// # Errors
///
/// Returns an error if the text does not have exactly four fields or the
/// fields do not parse.
pub fn parse(text: &str) -> Result<DateTime<Local>, TimestampError> {
    let text = text.trim();
    if text.split_whitespace().count() != 4 {
        return Err(TimestampError::FieldCount);
    }

    let parsed = DateTime::parse_from_str(text, PARSE_FORMAT)?;
    Ok(parsed.with_timezone(&Local))
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone as _;

    use super::*;

    #[test]
    fn test_round_trip() {
        let instant = Local.with_ymd_and_hms(2024, 3, 5, 10, 11, 12).unwrap()
            + chrono::Duration::nanoseconds(123_456_789);
        let rendered = format(&instant);
        assert_eq!(rendered.split_whitespace().count(), 4);
        assert_eq!(parse(&rendered).unwrap(), instant);
    }

    #[test]
    fn test_round_trip_whole_second() {
        let instant = Local.with_ymd_and_hms(2023, 12, 31, 23, 59, 59).unwrap();
        assert_eq!(parse(&format(&instant)).unwrap(), instant);
    }

    #[test]
    fn test_rejects_wrong_field_count() {
        let result = parse("2024-03-05 10:11:12.000000000 +0000");
        assert!(matches!(result, Err(TimestampError::FieldCount)));
    }

    #[test]
    fn test_parses_trimmed_fraction() {
        // Files from older deployments trim trailing fraction zeros.
        let parsed = parse("2024-03-05 10:11:12.5 +0000 UTC").unwrap();
        assert_eq!(parsed.timestamp_subsec_millis(), 500);
    }
}
