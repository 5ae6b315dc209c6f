//! UTC timestamp parsing and formatting.
//!
//! All timestamps in this crate are UTC. The formats here are the fixed ones
//! used in headers, directory names and the dump-trigger protocol, so they
//! are written out by hand rather than pulled from a format description.

use time::{Date, Month, OffsetDateTime, PrimitiveDateTime, Time};

use super::constants::{MJD_UNIX_EPOCH, SECONDS_PER_DAY};
use super::error::ValidationError;

/// Parse a `yyyy-mm-dd hh:mm:ss` UTC timestamp.
pub fn parse_utc(s: &str) -> Result<OffsetDateTime, ValidationError> {
    let bad = || ValidationError::BadStartTime(s.to_string());
    let (date_part, time_part) = s.trim().split_once(' ').ok_or_else(bad)?;

    let mut ymd = date_part.split('-');
    let year: i32 = ymd.next().ok_or_else(bad)?.parse().map_err(|_| bad())?;
    let month: u8 = ymd.next().ok_or_else(bad)?.parse().map_err(|_| bad())?;
    let day: u8 = ymd.next().ok_or_else(bad)?.parse().map_err(|_| bad())?;
    if ymd.next().is_some() {
        return Err(bad());
    }

    let mut hms = time_part.split(':');
    let hour: u8 = hms.next().ok_or_else(bad)?.parse().map_err(|_| bad())?;
    let minute: u8 = hms.next().ok_or_else(bad)?.parse().map_err(|_| bad())?;
    let second: u8 = hms.next().ok_or_else(bad)?.parse().map_err(|_| bad())?;
    if hms.next().is_some() {
        return Err(bad());
    }

    let month = Month::try_from(month).map_err(|_| bad())?;
    let date = Date::from_calendar_date(year, month, day).map_err(|_| bad())?;
    let time = Time::from_hms(hour, minute, second).map_err(|_| bad())?;
    Ok(PrimitiveDateTime::new(date, time).assume_utc())
}

/// Format as `yyyy-mm-dd hh:mm:ss`.
pub fn format_utc(t: OffsetDateTime) -> String {
    format!(
        "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
        t.year(),
        u8::from(t.month()),
        t.day(),
        t.hour(),
        t.minute(),
        t.second()
    )
}

/// Format as `yyyy-mm-dd-hh:mm:ss`, the form used in the dump-trigger protocol.
pub fn format_utc_dashed(t: OffsetDateTime) -> String {
    format!(
        "{:04}-{:02}-{:02}-{:02}:{:02}:{:02}",
        t.year(),
        u8::from(t.month()),
        t.day(),
        t.hour(),
        t.minute(),
        t.second()
    )
}

/// Format as `yyyymmdd`, the per-day directory name.
pub fn format_date(t: OffsetDateTime) -> String {
    format!("{:04}{:02}{:02}", t.year(), u8::from(t.month()), t.day())
}

/// Format as `yyyy.mm.dd-hh:mm:ss.SOURCE`, the per-observation directory name.
pub fn format_datetimesource(t: OffsetDateTime, source: &str) -> String {
    format!(
        "{:04}.{:02}.{:02}-{:02}:{:02}:{:02}.{}",
        t.year(),
        u8::from(t.month()),
        t.day(),
        t.hour(),
        t.minute(),
        t.second(),
        source
    )
}

/// Modified Julian Date of a UTC instant.
pub fn mjd(t: OffsetDateTime) -> f64 {
    let unix = t.unix_timestamp_nanos() as f64 / 1e9;
    MJD_UNIX_EPOCH + unix / SECONDS_PER_DAY
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_format_roundtrip() {
        let t = match parse_utc("2019-03-02 13:37:00") {
            Ok(t) => t,
            Err(_) => panic!(),
        };
        assert_eq!(format_utc(t), "2019-03-02 13:37:00");
        assert_eq!(format_date(t), "20190302");
        assert_eq!(
            format_datetimesource(t, "B0531+21"),
            "2019.03.02-13:37:00.B0531+21"
        );
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_utc("yesterday").is_err());
        assert!(parse_utc("2019-13-02 00:00:00").is_err());
        assert!(parse_utc("2019-03-02").is_err());
    }

    #[test]
    fn test_mjd_epoch() {
        let t = OffsetDateTime::from_unix_timestamp(0).unwrap();
        assert!((mjd(t) - 40587.0).abs() < 1e-9);
        // one day later
        let t = OffsetDateTime::from_unix_timestamp(86400).unwrap();
        assert!((mjd(t) - 40588.0).abs() < 1e-9);
    }
}
