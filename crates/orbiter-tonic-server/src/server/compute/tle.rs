//! Two-line element set parsing.
//!
//! Columns follow the NORAD fixed-width layout. Only the mean elements that
//! a two-body propagation needs are decoded; drag terms are skipped.

use super::time::format_timestamp;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use orbiter::ComputeError;

pub const TLE_LINE_LENGTH: usize = 69;

#[derive(Clone, Debug, PartialEq)]
pub struct Tle {
    pub catalog_number: u32,
    /// `U`, `C` or `S`; `?` when the column holds anything else.
    pub classification: char,
    /// Launch year, launch number and piece, e.g. `98067A`.
    pub international_designator: String,
    pub epoch: DateTime<Utc>,
    pub inclination_deg: f64,
    pub raan_deg: f64,
    pub eccentricity: f64,
    pub arg_perigee_deg: f64,
    pub mean_anomaly_deg: f64,
    pub mean_motion_rev_per_day: f64,
}

/// Both lines are long enough and start with their line numbers.
pub fn is_valid_tle(line1: &str, line2: &str) -> bool {
    line1.len() >= TLE_LINE_LENGTH
        && line2.len() >= TLE_LINE_LENGTH
        && line1.starts_with('1')
        && line2.starts_with('2')
}

/// Modulo-10 checksum over the first 68 columns: digits count their value,
/// minus signs count 1, everything else 0.
pub fn checksum(line: &str) -> u32 {
    line.bytes()
        .take(TLE_LINE_LENGTH - 1)
        .map(|b| match b {
            b'0'..=b'9' => u32::from(b - b'0'),
            b'-' => 1,
            _ => 0,
        })
        .sum::<u32>()
        % 10
}

/// NORAD catalog number from columns 3-7 of line 1, if readable.
pub fn catalog_number(line1: &str) -> Option<u32> {
    line1.get(2..7)?.trim().parse().ok()
}

pub fn classification(line1: &str) -> char {
    match line1.as_bytes().get(7) {
        Some(b'U') => 'U',
        Some(b'C') => 'C',
        Some(b'S') => 'S',
        _ => '?',
    }
}

pub fn international_designator(line1: &str) -> String {
    line1.get(9..17).map(str::trim).unwrap_or_default().to_owned()
}

fn field<'a>(
    line: &'a str,
    range: core::ops::Range<usize>,
    name: &str,
) -> Result<&'a str, ComputeError> {
    line.get(range)
        .map(str::trim)
        .ok_or_else(|| ComputeError::invalid_input(format!("{name} is out of range")))
}

fn number(line: &str, range: core::ops::Range<usize>, name: &str) -> Result<f64, ComputeError> {
    let raw = field(line, range, name)?;
    raw.parse()
        .map_err(|_| ComputeError::invalid_input(format!("{name} '{raw}' is not a number")))
}

fn verify_checksum(line: &str, which: u8) -> Result<(), ComputeError> {
    let expected = line
        .as_bytes()
        .get(TLE_LINE_LENGTH - 1)
        .filter(|b| b.is_ascii_digit())
        .map(|b| u32::from(b - b'0'))
        .ok_or_else(|| ComputeError::invalid_input(format!("line {which} has no checksum digit")))?;
    let actual = checksum(line);
    if actual != expected {
        return Err(ComputeError::invalid_input(format!(
            "line {which} checksum mismatch (expected {expected}, computed {actual})"
        )));
    }
    Ok(())
}

/// Epoch from the `YYDDD.DDDDDDDD` field. Two-digit years below 57 are 20xx.
fn epoch(line1: &str) -> Result<DateTime<Utc>, ComputeError> {
    let year: i32 = field(line1, 18..20, "epoch year")?
        .parse()
        .map_err(|_| ComputeError::invalid_input("epoch year is not a number"))?;
    let year = if year < 57 { 2000 + year } else { 1900 + year };
    let day = number(line1, 20..32, "epoch day")?;
    if !(1.0..367.0).contains(&day) {
        return Err(ComputeError::invalid_input(format!(
            "epoch day {day} is out of range"
        )));
    }

    let start = NaiveDate::from_ymd_opt(year, 1, 1)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .ok_or_else(|| ComputeError::invalid_input(format!("epoch year {year} is invalid")))?
        .and_utc();
    Ok(start + Duration::microseconds(((day - 1.0) * 86_400e6).round() as i64))
}

impl Tle {
    pub fn parse(line1: &str, line2: &str) -> Result<Self, ComputeError> {
        let (line1, line2) = (line1.trim_end(), line2.trim_end());
        if !line1.is_ascii() || !line2.is_ascii() {
            return Err(ComputeError::invalid_input("TLE lines must be ASCII"));
        }
        if !is_valid_tle(line1, line2) {
            return Err(ComputeError::invalid_input(format!(
                "TLE lines must be at least {TLE_LINE_LENGTH} characters and start with '1' and '2'"
            )));
        }
        verify_checksum(line1, 1)?;
        verify_checksum(line2, 2)?;

        let catalog_number = catalog_number(line1)
            .ok_or_else(|| ComputeError::invalid_input("line 1 catalog number is unreadable"))?;
        let line2_catalog: u32 = field(line2, 2..7, "line 2 catalog number")?
            .parse()
            .map_err(|_| ComputeError::invalid_input("line 2 catalog number is unreadable"))?;
        if catalog_number != line2_catalog {
            return Err(ComputeError::invalid_input(format!(
                "catalog numbers differ between lines ({catalog_number} vs {line2_catalog})"
            )));
        }

        let eccentricity = field(line2, 26..33, "eccentricity")?;
        let eccentricity: f64 = format!("0.{eccentricity}").parse().map_err(|_| {
            ComputeError::invalid_input(format!("eccentricity '{eccentricity}' is not a number"))
        })?;

        let mean_motion_rev_per_day = number(line2, 52..63, "mean motion")?;
        if mean_motion_rev_per_day <= 0.0 {
            return Err(ComputeError::invalid_input("mean motion must be positive"));
        }

        Ok(Self {
            catalog_number,
            classification: classification(line1),
            international_designator: international_designator(line1),
            epoch: epoch(line1)?,
            inclination_deg: number(line2, 8..16, "inclination")?,
            raan_deg: number(line2, 17..25, "right ascension")?,
            eccentricity,
            arg_perigee_deg: number(line2, 34..42, "argument of perigee")?,
            mean_anomaly_deg: number(line2, 43..51, "mean anomaly")?,
            mean_motion_rev_per_day,
        })
    }
}

impl core::fmt::Display for Tle {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "{} ({}, {}) epoch {}",
            self.catalog_number,
            self.international_designator,
            self.classification,
            format_timestamp(self.epoch)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::compute::fixtures::{ISS_LINE1, ISS_LINE2};
    use chrono::TimeZone;
    use orbiter::FailureKind;

    #[test]
    fn parses_iss_elements() {
        let tle = Tle::parse(ISS_LINE1, ISS_LINE2).unwrap();
        assert_eq!(tle.catalog_number, 25544);
        assert_eq!(tle.classification, 'U');
        assert_eq!(tle.international_designator, "98067A");
        assert!((tle.inclination_deg - 51.6416).abs() < 1e-12);
        assert!((tle.eccentricity - 0.000_670_3).abs() < 1e-12);
        assert!((tle.mean_motion_rev_per_day - 15.721_253_91).abs() < 1e-9);

        // Day 264 of 2008 is 20 September.
        let midnight = Utc.with_ymd_and_hms(2008, 9, 20, 0, 0, 0).unwrap();
        let offset = (tle.epoch - midnight).num_milliseconds();
        assert!((offset - 44_740_104).abs() <= 1, "offset {offset}");
    }

    #[test]
    fn checksums_match_published_lines() {
        assert_eq!(checksum(ISS_LINE1), 7);
        assert_eq!(checksum(ISS_LINE2), 7);
    }

    #[test]
    fn rejects_bad_checksum() {
        let corrupted = ISS_LINE1.replace("2927", "2928");
        let err = Tle::parse(&corrupted, ISS_LINE2).unwrap_err();
        assert_eq!(err.kind, FailureKind::InvalidInput);
        assert!(err.message.contains("line 1 checksum"));
    }

    #[test]
    fn rejects_short_or_swapped_lines() {
        assert!(!is_valid_tle("1 25544U", ISS_LINE2));
        assert!(!is_valid_tle(ISS_LINE2, ISS_LINE1));
        assert!(Tle::parse(ISS_LINE2, ISS_LINE1).is_err());
        assert!(Tle::parse("", "").is_err());
    }

    #[test]
    fn rejects_mismatched_catalog_numbers() {
        // Same digit sum, so both checksums still hold.
        let other = ISS_LINE2
            .replacen("25544", "25553", 1)
            .replacen("51.6416", "51.6407", 1);
        assert_eq!(checksum(&other), checksum(ISS_LINE2));
        let err = Tle::parse(ISS_LINE1, &other).unwrap_err();
        assert!(err.message.contains("catalog numbers differ"));
    }

    #[test]
    fn reads_header_fields_leniently() {
        assert_eq!(catalog_number(ISS_LINE1), Some(25544));
        assert_eq!(catalog_number("1 ab"), None);
        assert_eq!(classification("1 25544X"), '?');
        assert_eq!(classification("1 25544S 98067A"), 'S');
        assert_eq!(international_designator("1"), "");
    }
}
