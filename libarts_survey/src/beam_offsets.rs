//! Per-beam pointing offsets.
//!
//! Each compound beam sits at a fixed angular offset from the boresight
//! pointing. The offsets come from an externally generated table (the PAF
//! element grid projected on the sky); this module only consumes it. A
//! default table is bundled with the library, a measured one can be loaded
//! from disk per observation.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use fxhash::FxHashMap;
use time::OffsetDateTime;

use super::coordinates::SkyCoord;
use super::error::OffsetTableError;

const ENTRIES_PER_LINE: usize = 3; // beam, dRA, dDec

/// Load the default table for windows
#[cfg(target_family = "windows")]
fn load_default_table() -> String {
    String::from(include_str!("data\\cb_offsets.csv"))
}

/// Load the default table for macos and linux
#[cfg(target_family = "unix")]
fn load_default_table() -> String {
    String::from(include_str!("data/cb_offsets.csv"))
}

/// The sky position of one compound beam, with the transforms precomputed
/// for header metadata.
#[derive(Debug, Clone, Copy)]
pub struct BeamPosition {
    pub coord: SkyCoord,
    pub gl: f64,
    pub gb: f64,
    pub alt: f64,
    pub az: f64,
    pub lst_deg: f64,
}

/// BeamOffsets maps a compound beam index to its (dRA, dDec) offset in degrees.
///
/// The table is a CSV file with a header line and three columns per row:
/// beam index, RA offset, Dec offset. Beams that are permanently disabled
/// simply have no row.
#[derive(Debug, Clone, Default)]
pub struct BeamOffsets {
    table: FxHashMap<usize, (f64, f64)>,
}

impl BeamOffsets {
    /// Create a new BeamOffsets table.
    /// If the path is None, we load the default that is bundled with the library
    pub fn new(path: Option<&Path>) -> Result<Self, OffsetTableError> {
        let mut contents = String::new();
        if let Some(p) = path {
            if !p.exists() {
                return Err(OffsetTableError::BadFilePath(p.to_path_buf()));
            }
            let mut file = File::open(p)?;
            file.read_to_string(&mut contents)?;
        } else {
            contents = load_default_table();
        }

        let mut offsets = BeamOffsets::default();
        let mut lines = contents.lines();
        lines.next(); // Skip the header
        for line in lines {
            if line.trim().is_empty() {
                continue;
            }
            let entries: Vec<&str> = line.split_terminator(',').collect();
            if entries.len() != ENTRIES_PER_LINE {
                return Err(OffsetTableError::BadFileFormat);
            }
            let beam: usize = entries[0].trim().parse()?;
            let dra: f64 = entries[1].trim().parse()?;
            let ddec: f64 = entries[2].trim().parse()?;
            offsets.table.insert(beam, (dra, ddec));
        }

        Ok(offsets)
    }

    /// Number of beams in the table.
    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// The sky coordinate of a beam given the boresight pointing.
    ///
    /// The RA offset in the table is measured on the sky, so it grows by
    /// 1/cos(dec) in coordinate terms. A beam without a table entry is
    /// observed at the unshifted boresight position; that only costs the
    /// position correction, so it is a warning rather than an error.
    pub fn resolve(&self, beam: usize, boresight: SkyCoord) -> SkyCoord {
        match self.table.get(&beam) {
            Some(&(dra, ddec)) => {
                let dec = boresight.dec_deg + ddec;
                let ra = boresight.ra_deg + dra / dec.to_radians().cos();
                SkyCoord::new(ra, dec)
            }
            None => {
                log::warn!(
                    "No offset known for beam {}, using boresight position",
                    beam
                );
                boresight
            }
        }
    }

    /// Invert `resolve`: recover the boresight pointing from a beam position.
    pub fn unresolve(&self, beam: usize, position: SkyCoord) -> SkyCoord {
        match self.table.get(&beam) {
            Some(&(dra, ddec)) => {
                let ra = position.ra_deg - dra / position.dec_deg.to_radians().cos();
                let dec = position.dec_deg - ddec;
                SkyCoord::new(ra, dec)
            }
            None => position,
        }
    }

    /// Resolve a beam and precompute the metadata transforms at `t`.
    pub fn resolve_full(&self, beam: usize, boresight: SkyCoord, t: OffsetDateTime) -> BeamPosition {
        let coord = self.resolve(beam, boresight);
        let (gl, gb) = coord.to_galactic();
        let (alt, az) = coord.to_altaz(t);
        BeamPosition {
            coord,
            gl,
            gb,
            alt,
            az,
            lst_deg: super::coordinates::local_sidereal_time_deg(t),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_table() {
        let offsets = match BeamOffsets::new(None) {
            Ok(t) => t,
            Err(_) => {
                panic!();
            }
        };
        // 40 beams minus the 8 permanently missing ones
        assert_eq!(offsets.len(), 32);
    }

    #[test]
    fn test_central_beam_unshifted_in_dec() {
        let offsets = BeamOffsets::new(None).unwrap();
        let boresight = SkyCoord::new(180.0, 40.0);
        let pos = offsets.resolve(21, boresight);
        // CB21 is on the central row of the grid
        assert!((pos.dec_deg - boresight.dec_deg).abs() < 1e-9);
        assert!(pos.ra_deg != boresight.ra_deg);
    }

    #[test]
    fn test_missing_beam_passes_through() {
        let offsets = BeamOffsets::new(None).unwrap();
        let boresight = SkyCoord::new(123.4, 56.7);
        // beam 4 is on the permanent exclusion list, so it has no entry
        let pos = offsets.resolve(4, boresight);
        assert_eq!(pos, boresight);
        assert_eq!(offsets.unresolve(4, pos), boresight);
    }

    #[test]
    fn test_resolve_roundtrip() {
        let offsets = BeamOffsets::new(None).unwrap();
        let boresight = SkyCoord::new(83.633, 22.014);
        for beam in [0, 3, 21, 38] {
            let pos = offsets.resolve(beam, boresight);
            let back = offsets.unresolve(beam, pos);
            assert!((back.ra_deg - boresight.ra_deg).abs() < 1e-9);
            assert!((back.dec_deg - boresight.dec_deg).abs() < 1e-9);
        }
    }

    #[test]
    fn test_ra_compression_grows_with_dec() {
        let offsets = BeamOffsets::new(None).unwrap();
        let low = offsets.resolve(20, SkyCoord::new(100.0, 10.0));
        let high = offsets.resolve(20, SkyCoord::new(100.0, 70.0));
        let d_low = low.ra_deg - 100.0;
        let d_high = high.ra_deg - 100.0;
        assert!(d_high > d_low);
    }
}
