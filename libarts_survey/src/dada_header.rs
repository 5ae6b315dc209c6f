//! The self-describing header block written at the start of each raw data
//! stream.
//!
//! The format is fixed: one key per line, padded to a 4096 byte block by the
//! ringbuffer daemon. Only the values change per beam; the schema must not,
//! since every downstream consumer parses it positionally by key.

use super::beam_config::BeamConfig;
use super::beam_offsets::BeamPosition;
use super::constants::DADA_HDR_SIZE;

/// Number of 1.024 s pages per output file.
const PAGES_PER_FILE: usize = 10;

/// Render the header block for one beam.
///
/// The RA and DEC keys carry the beam position, not the boresight. The
/// PARSET key embeds a single-line copy of the original request, so a data
/// file on disk is traceable to what the operator asked for.
pub fn render(config: &BeamConfig, position: &BeamPosition, provenance: &str) -> String {
    let file_size = PAGES_PER_FILE * config.nchan * config.pagesize;
    let bytes_per_second = config.nchan as f64 / config.tsamp;
    let resolution = config.nchan * config.pagesize;

    format!(
        "HEADER       DADA
HDR_VERSION  1.0
HDR_SIZE     {hdr_size}
DADA_VERSION 1.0
OBS_ID       {datetimesource}
PRIMARY      unset
SECONDARY    unset
FILE_NAME    CB{beam:02}
FILE_SIZE    {file_size}
FILE_NUMBER  0
UTC_START    {utc_start}
MJD_START    {mjd_start:.9}
OBS_OFFSET   0
OBS_OVERLAP  0
SOURCE       {source}
RA           {ra}
DEC          {dec}
AZ_START     {az:.4}
ZA_START     {za:.4}
LST_START    {lst:.4}
TELESCOPE    WSRT
INSTRUMENT   ARTS
FREQ         {freq}
BW           {bw}
TSAMP        {tsamp}
MIN_FREQUENCY {min_freq}
CHANNELS     {nchan}
NCHAN        {nchan}
CHANNEL_BANDWIDTH {chan_width}
SAMPLES_PER_BATCH {pagesize}
BEAM         {beam}
NBIT         {nbit}
NDIM         2
NPOL         2
IN_USE       1
RESOLUTION   {resolution}
BYTES_PER_SECOND {bps}
PARSET       {provenance}
",
        hdr_size = DADA_HDR_SIZE,
        datetimesource = config.datetimesource,
        beam = config.beam,
        file_size = file_size,
        utc_start = config.startutc,
        mjd_start = config.startmjd,
        source = config.source,
        ra = position.coord.ra_hms().replace(':', ""),
        dec = position.coord.dec_dms().replace(':', ""),
        az = position.az,
        za = 90.0 - position.alt,
        lst = position.lst_deg,
        freq = config.freq,
        bw = config.bw,
        tsamp = config.tsamp,
        min_freq = config.min_freq,
        nchan = config.nchan,
        chan_width = config.chan_width,
        pagesize = config.pagesize,
        nbit = config.nbit,
        resolution = resolution,
        bps = bytes_per_second,
        provenance = provenance,
    )
}

/// Header file name for one beam.
pub fn file_name(beam: usize) -> String {
    format!("CB{:02}.txt", beam)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::beam_config::sample_config;
    use crate::coordinates::SkyCoord;

    fn position() -> BeamPosition {
        BeamPosition {
            coord: SkyCoord::new(83.633, 22.014),
            gl: 184.56,
            gb: -5.78,
            alt: 45.0,
            az: 120.0,
            lst_deg: 100.0,
        }
    }

    #[test]
    fn test_header_keys_present() {
        let header = render(&sample_config(21), &position(), "source=test");
        for key in [
            "HEADER       DADA",
            "UTC_START",
            "MJD_START",
            "SOURCE",
            "RA",
            "DEC",
            "AZ_START",
            "ZA_START",
            "LST_START",
            "MIN_FREQUENCY",
            "SAMPLES_PER_BATCH",
            "BEAM         21",
            "PARSET       source=test",
        ] {
            assert!(header.contains(key), "missing {}", key);
        }
    }

    #[test]
    fn test_header_fits_block() {
        let header = render(&sample_config(0), &position(), "source=test");
        assert!(header.len() < DADA_HDR_SIZE);
    }

    #[test]
    fn test_coordinates_without_colons() {
        let header = render(&sample_config(21), &position(), "");
        // sexagesimal but with the colons stripped
        for line in header.lines() {
            if let Some(ra) = line.strip_prefix("RA           ") {
                assert!(!ra.contains(':'));
            }
        }
    }
}
