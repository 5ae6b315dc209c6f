//! Sky coordinate handling: sexagesimal parsing, and the transforms needed
//! for header metadata (Galactic, horizontal, local sidereal time).
//!
//! These are pure functions of the coordinate and the instant; nothing here
//! talks to the telescope.

use time::OffsetDateTime;

use super::constants::{SECONDS_PER_DAY, WSRT_LATITUDE_DEG, WSRT_LONGITUDE_DEG};
use super::error::CoordError;

// J2000 north galactic pole and the galactic longitude of the north
// celestial pole, degrees.
const RA_NGP: f64 = 192.85948;
const DEC_NGP: f64 = 27.12825;
const L_NCP: f64 = 122.93192;

// Julian date of J2000.0.
const JD_J2000: f64 = 2451545.0;
const JD_UNIX_EPOCH: f64 = 2440587.5;

/// An equatorial J2000 coordinate in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SkyCoord {
    pub ra_deg: f64,
    pub dec_deg: f64,
}

impl SkyCoord {
    pub fn new(ra_deg: f64, dec_deg: f64) -> Self {
        Self { ra_deg, dec_deg }
    }

    /// Parse from `hh:mm:ss.s` right ascension and `dd:mm:ss.s` declination.
    pub fn from_hmsdms(ra: &str, dec: &str) -> Result<Self, CoordError> {
        let ra_deg = parse_ra(ra)?;
        let dec_deg = parse_dec(dec)?;
        Ok(Self { ra_deg, dec_deg })
    }

    /// Right ascension as `hh:mm:ss.sss`.
    pub fn ra_hms(&self) -> String {
        let mut r = self.ra_deg.rem_euclid(360.0) / 15.0;
        let hr = r as u32;
        r = (r - hr as f64) * 60.0;
        let min = r as u32;
        let sec = (r - min as f64) * 60.0;
        format!("{:02}:{:02}:{:06.3}", hr, min, sec)
    }

    /// Declination as `[-]dd:mm:ss.sss`.
    pub fn dec_dms(&self) -> String {
        let sign = if self.dec_deg < 0.0 { "-" } else { "" };
        let mut d = self.dec_deg.abs();
        let deg = d as u32;
        d = (d - deg as f64) * 60.0;
        let min = d as u32;
        let sec = (d - min as f64) * 60.0;
        format!("{}{:02}:{:02}:{:06.3}", sign, deg, min, sec)
    }

    /// Transform to galactic longitude and latitude, degrees.
    pub fn to_galactic(&self) -> (f64, f64) {
        let ra = self.ra_deg.to_radians();
        let dec = self.dec_deg.to_radians();
        let ra_ngp = RA_NGP.to_radians();
        let dec_ngp = DEC_NGP.to_radians();

        let sin_b =
            dec.sin() * dec_ngp.sin() + dec.cos() * dec_ngp.cos() * (ra - ra_ngp).cos();
        let b = sin_b.asin();
        let y = dec.cos() * (ra - ra_ngp).sin();
        let x = dec.sin() * dec_ngp.cos() - dec.cos() * dec_ngp.sin() * (ra - ra_ngp).cos();
        let l = (L_NCP - y.atan2(x).to_degrees()).rem_euclid(360.0);
        (l, b.to_degrees())
    }

    /// Altitude and azimuth (east of north), degrees, as seen from WSRT at
    /// the given instant.
    pub fn to_altaz(&self, t: OffsetDateTime) -> (f64, f64) {
        let lst = local_sidereal_time_deg(t);
        let ha = (lst - self.ra_deg + 180.0).rem_euclid(360.0) - 180.0;
        let ha = ha.to_radians();
        let dec = self.dec_deg.to_radians();
        let lat = WSRT_LATITUDE_DEG.to_radians();

        let sin_alt = dec.sin() * lat.sin() + dec.cos() * lat.cos() * ha.cos();
        let alt = sin_alt.asin();
        // azimuth from north through east
        let y = -ha.sin() * dec.cos();
        let x = dec.sin() - sin_alt * lat.sin();
        let az = y.atan2(x).to_degrees().rem_euclid(360.0);
        (alt.to_degrees(), az)
    }

    /// Zenith angle in degrees at the given instant.
    pub fn zenith_angle(&self, t: OffsetDateTime) -> f64 {
        90.0 - self.to_altaz(t).0
    }
}

/// Local apparent sidereal time at WSRT, in degrees.
///
/// Mean sidereal time is good to well under a second here, which is plenty
/// for header metadata.
pub fn local_sidereal_time_deg(t: OffsetDateTime) -> f64 {
    let jd = JD_UNIX_EPOCH + t.unix_timestamp_nanos() as f64 / 1e9 / SECONDS_PER_DAY;
    let d = jd - JD_J2000;
    let tc = d / 36525.0;
    let gmst = 280.46061837 + 360.98564736629 * d + 0.000387933 * tc * tc
        - tc * tc * tc / 38710000.0;
    (gmst + WSRT_LONGITUDE_DEG).rem_euclid(360.0)
}

fn parse_ra(ra: &str) -> Result<f64, CoordError> {
    let fields: Vec<&str> = ra.trim().split(':').collect();
    if fields.len() != 3 {
        return Err(CoordError::BadRightAscension(ra.to_string()));
    }
    let hr: f64 = fields[0].parse()?;
    let min: f64 = fields[1].parse()?;
    let sec: f64 = fields[2].parse()?;
    if !(0.0..24.0).contains(&hr) || !(0.0..60.0).contains(&min) || !(0.0..60.0).contains(&sec) {
        return Err(CoordError::BadRightAscension(ra.to_string()));
    }
    Ok((hr + min / 60.0 + sec / 3600.0) * 15.0)
}

fn parse_dec(dec: &str) -> Result<f64, CoordError> {
    let trimmed = dec.trim().trim_start_matches('+');
    let fields: Vec<&str> = trimmed.split(':').collect();
    if fields.len() != 3 {
        return Err(CoordError::BadDeclination(dec.to_string()));
    }
    let deg: f64 = fields[0].parse()?;
    let min: f64 = fields[1].parse()?;
    let sec: f64 = fields[2].parse()?;
    if deg.abs() > 90.0 || !(0.0..60.0).contains(&min) || !(0.0..60.0).contains(&sec) {
        return Err(CoordError::BadDeclination(dec.to_string()));
    }
    let sign = if fields[0].starts_with('-') { -1.0 } else { 1.0 };
    Ok(deg + sign * min / 60.0 + sign * sec / 3600.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_hmsdms() {
        let c = match SkyCoord::from_hmsdms("05:34:30", "+22:00:52") {
            Ok(c) => c,
            Err(_) => panic!(),
        };
        assert!((c.ra_deg - 83.625).abs() < 1e-6);
        assert!((c.dec_deg - 22.014444).abs() < 1e-5);
    }

    #[test]
    fn test_parse_negative_dec() {
        let c = SkyCoord::from_hmsdms("00:00:00", "-01:30:00").unwrap();
        assert!((c.dec_deg + 1.5).abs() < 1e-9);
    }

    #[test]
    fn test_format_roundtrip() {
        let c = SkyCoord::new(83.633212, 22.01446);
        let back = SkyCoord::from_hmsdms(&c.ra_hms(), &c.dec_dms()).unwrap();
        assert!((back.ra_deg - c.ra_deg).abs() < 1e-4);
        assert!((back.dec_deg - c.dec_deg).abs() < 1e-4);
    }

    #[test]
    fn test_galactic_crab() {
        // Crab pulsar: l ~ 184.56, b ~ -5.78
        let c = SkyCoord::new(83.633212, 22.01446);
        let (l, b) = c.to_galactic();
        assert!((l - 184.56).abs() < 0.05);
        assert!((b + 5.78).abs() < 0.05);
    }

    #[test]
    fn test_bad_input_rejected() {
        assert!(SkyCoord::from_hmsdms("25:00:00", "00:00:00").is_err());
        assert!(SkyCoord::from_hmsdms("midnight", "00:00:00").is_err());
        assert!(SkyCoord::from_hmsdms("00:00:00", "95:00:00").is_err());
    }

    #[test]
    fn test_altaz_in_range() {
        let t = OffsetDateTime::from_unix_timestamp(1_550_000_000).unwrap();
        let c = SkyCoord::new(83.633212, 22.01446);
        let (alt, az) = c.to_altaz(t);
        assert!((-90.0..=90.0).contains(&alt));
        assert!((0.0..360.0).contains(&az));
        assert!((c.zenith_angle(t) - (90.0 - alt)).abs() < 1e-9);
    }
}
