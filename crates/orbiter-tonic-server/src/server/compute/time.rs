//! Timestamp parsing and formatting.

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use core::time::Duration;
use orbiter::ComputeError;

const NAIVE_FORMATS: [&str; 2] = ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"];

/// Parses an RFC 3339 timestamp. A timestamp without offset (with either a
/// `T` or a space between date and time) is read as UTC.
pub fn parse_timestamp(raw: &str, field: &str) -> Result<DateTime<Utc>, ComputeError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(ComputeError::invalid_input(format!("{field} is empty")));
    }

    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Ok(parsed.with_timezone(&Utc));
    }

    NAIVE_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(raw, format).ok())
        .map(|naive| naive.and_utc())
        .ok_or_else(|| {
            ComputeError::invalid_input(format!(
                "invalid timestamp for {field}: '{raw}' (expected YYYY-MM-DDTHH:MM:SSZ)"
            ))
        })
}

/// RFC 3339 with millisecond precision and a `Z` suffix.
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// A validated `[start, end]` window.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    pub fn parse(start: &str, end: &str) -> Result<Self, ComputeError> {
        let start = parse_timestamp(start, "start_date")?;
        let end = parse_timestamp(end, "end_date")?;
        if end < start {
            return Err(ComputeError::invalid_input(format!(
                "end_date {} is before start_date {}",
                format_timestamp(end),
                format_timestamp(start)
            )));
        }
        Ok(Self { start, end })
    }

    pub fn duration(&self) -> Duration {
        (self.end - self.start).to_std().unwrap_or_default()
    }

    pub fn seconds(&self) -> f64 {
        self.duration().as_secs_f64()
    }
}

/// `at` shifted by a (possibly fractional) number of seconds.
pub fn offset_seconds(at: DateTime<Utc>, seconds: f64) -> DateTime<Utc> {
    at + chrono::Duration::microseconds((seconds * 1e6).round() as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn parses_offsets_and_naive_forms() {
        let expected = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        assert_eq!(parse_timestamp("2024-01-01T12:00:00Z", "t").unwrap(), expected);
        assert_eq!(
            parse_timestamp("2024-01-01T14:00:00+02:00", "t").unwrap(),
            expected
        );
        assert_eq!(parse_timestamp("2024-01-01T12:00:00", "t").unwrap(), expected);
        assert_eq!(parse_timestamp(" 2024-01-01 12:00:00 ", "t").unwrap(), expected);
    }

    #[test]
    fn rejects_garbage_and_empty() {
        let err = parse_timestamp("sit minim", "start_date").unwrap_err();
        assert_eq!(err.kind, orbiter::FailureKind::InvalidInput);
        assert!(err.message.contains("start_date"));
        assert!(parse_timestamp("  ", "end_date").is_err());
    }

    #[test]
    fn formats_with_millis() {
        let at = Utc.with_ymd_and_hms(2024, 3, 5, 6, 7, 8).unwrap()
            + chrono::Duration::milliseconds(9);
        assert_eq!(format_timestamp(at), "2024-03-05T06:07:08.009Z");
    }

    #[test]
    fn window_must_not_run_backwards() {
        assert!(TimeWindow::parse("2024-01-02T00:00:00Z", "2024-01-01T00:00:00Z").is_err());
        let window = TimeWindow::parse("2024-01-01T00:00:00Z", "2024-01-01T01:30:00Z").unwrap();
        assert_eq!(window.duration(), Duration::from_secs(5400));
    }
}
