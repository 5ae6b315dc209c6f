//! Fixed instrument and site parameters.

/// Observations can only start on multiples of this interval, measured from
/// the synchronization epoch. One ringbuffer page also spans this interval.
pub const ALIGNMENT_SEC: f64 = 1.024;
/// Alignment window in nanoseconds (exact).
pub const ALIGNMENT_NS: i128 = 1_024_000_000;

/// Westerbork Synthesis Radio Telescope reference position.
pub const WSRT_LATITUDE_DEG: f64 = 52.91474;
pub const WSRT_LONGITUDE_DEG: f64 = 6.60334;

/// MJD of the unix epoch (1970-01-01 00:00:00 UTC).
pub const MJD_UNIX_EPOCH: f64 = 40587.0;

pub const SECONDS_PER_DAY: f64 = 86400.0;

/// Size of the self-describing header block at the start of each raw data file.
pub const DADA_HDR_SIZE: usize = 4096;

/// The compound beam that sits on the boresight pointing. Used for the
/// pulsar fold test, which only makes sense on the central beam.
pub const CENTRAL_BEAM: usize = 21;
