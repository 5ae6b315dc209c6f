//! Start packet computation.
//!
//! Every capture process on every node starts recording at the same packet
//! counter value, which is what keeps ~40 machines sampling in lock-step.
//! The counter runs at `time_unit` ticks per second from a synchronization
//! epoch owned by the central timing hardware. This module turns a requested
//! wall-clock start time into that shared counter value, aligned to the
//! 1.024 s observation granularity so the tick count is exact.

use std::io::{BufRead, BufReader, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use time::OffsetDateTime;

use super::constants::ALIGNMENT_NS;
use super::error::SyncError;
use super::timestamps::format_utc;

/// A simultaneous reading of the packet counter and the wall clock,
/// as reported by the timing server.
#[derive(Debug, Clone, Copy)]
pub struct SyncPoint {
    pub packet: u64,
    pub utc: OffsetDateTime,
}

/// The agreed start of the observation: the packet counter value every
/// capture process is handed, and the UTC instant it corresponds to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartPacket {
    pub packet: u64,
    pub utc: OffsetDateTime,
}

/// The central timing source. One synchronous query, its own failure mode.
pub trait TimingOracle {
    fn query(&self) -> Result<SyncPoint, SyncError>;
}

/// Production timing source: one-line text protocol against the timing
/// daemon on the correlator control unit. The reply is
/// `<packet> <unix_seconds>`.
#[derive(Debug, Clone)]
pub struct TimingServer {
    pub host: String,
    pub port: u16,
    pub timeout: Duration,
}

impl TimingServer {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            host: host.to_string(),
            port,
            timeout: Duration::from_secs(5),
        }
    }
}

impl TimingOracle for TimingServer {
    fn query(&self) -> Result<SyncPoint, SyncError> {
        let addr = (self.host.as_str(), self.port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| SyncError::BadReply(format!("cannot resolve {}", self.host)))?;
        let mut stream = TcpStream::connect_timeout(&addr, self.timeout)?;
        stream.set_read_timeout(Some(self.timeout))?;
        stream.write_all(b"SYNC\n")?;

        let mut reply = String::new();
        BufReader::new(&stream).read_line(&mut reply)?;
        parse_sync_reply(&reply)
    }
}

fn parse_sync_reply(reply: &str) -> Result<SyncPoint, SyncError> {
    let mut fields = reply.split_whitespace();
    let packet: u64 = fields
        .next()
        .and_then(|f| f.parse().ok())
        .ok_or_else(|| SyncError::BadReply(reply.to_string()))?;
    let unix: i64 = fields
        .next()
        .and_then(|f| f.parse().ok())
        .ok_or_else(|| SyncError::BadReply(reply.to_string()))?;
    let utc = OffsetDateTime::from_unix_timestamp(unix)
        .map_err(|_| SyncError::BadReply(reply.to_string()))?;
    Ok(SyncPoint { packet, utc })
}

/// Ticks in one 1.024 s alignment window. Exact by construction; the
/// settings check rejects time units where it would not be.
pub fn ticks_per_window(time_unit: u64) -> Result<u64, SyncError> {
    if time_unit * 128 % 125 != 0 {
        return Err(SyncError::BadTimeUnit(time_unit));
    }
    Ok(time_unit * 128 / 125)
}

/// Compute the shared start packet for an observation.
///
/// The requested start time is rounded to the nearest whole number of
/// 1.024 s windows past the synchronization point, so the resulting packet
/// value has no fractional ticks and the reconstructed UTC time is exact.
/// Called once per observation; the result is handed unchanged to every
/// beam. Recomputing per beam would break lock-step alignment.
pub fn compute_start_packet(
    requested: OffsetDateTime,
    time_unit: u64,
    oracle: &dyn TimingOracle,
) -> Result<StartPacket, SyncError> {
    let window_ticks = ticks_per_window(time_unit)?;
    let sync = oracle.query()?;

    let delta_ns = requested.unix_timestamp_nanos() - sync.utc.unix_timestamp_nanos();
    if delta_ns < 0 {
        return Err(SyncError::StartBeforeSync {
            requested: format_utc(requested),
            sync: format_utc(sync.utc),
        });
    }
    // round to the nearest alignment window
    let windows = ((delta_ns + ALIGNMENT_NS / 2) / ALIGNMENT_NS) as u64;

    let packet = sync.packet + windows * window_ticks;
    let utc_ns = sync.utc.unix_timestamp_nanos() + windows as i128 * ALIGNMENT_NS;
    let utc = OffsetDateTime::from_unix_timestamp_nanos(utc_ns)
        .map_err(|_| SyncError::BadReply("aligned start time out of range".to_string()))?;
    Ok(StartPacket { packet, utc })
}

/// Debug fallback: derive the packet counter directly from the requested
/// wall-clock time, as if the counter had started at the unix epoch. Lower
/// precision, only for offline tests against recorded data.
pub fn debug_start_packet(requested: OffsetDateTime, time_unit: u64) -> StartPacket {
    let ns = requested.unix_timestamp_nanos();
    let packet = (ns * time_unit as i128 / 1_000_000_000) as u64;
    StartPacket {
        packet,
        utc: requested,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedOracle {
        point: SyncPoint,
    }

    impl TimingOracle for FixedOracle {
        fn query(&self) -> Result<SyncPoint, SyncError> {
            Ok(self.point)
        }
    }

    struct FailingOracle;

    impl TimingOracle for FailingOracle {
        fn query(&self) -> Result<SyncPoint, SyncError> {
            Err(SyncError::BadReply("no sync".to_string()))
        }
    }

    fn oracle_at(unix: i64, packet: u64) -> FixedOracle {
        FixedOracle {
            point: SyncPoint {
                packet,
                utc: OffsetDateTime::from_unix_timestamp(unix).unwrap(),
            },
        }
    }

    #[test]
    fn test_window_ticks_exact() {
        assert_eq!(ticks_per_window(781250).unwrap(), 800000);
        assert_eq!(ticks_per_window(625000).unwrap(), 640000);
        assert!(ticks_per_window(1000000).is_err());
    }

    #[test]
    fn test_rounding_is_monotonic_and_exact() {
        let oracle = oracle_at(1_500_000_000, 42);
        let t0 = OffsetDateTime::from_unix_timestamp(1_500_000_000).unwrap()
            + time::Duration::seconds_f64(10.24);
        let t1 = t0 + time::Duration::seconds_f64(1.024);

        let p0 = compute_start_packet(t0, 781250, &oracle).unwrap();
        let p1 = compute_start_packet(t1, 781250, &oracle).unwrap();
        assert_eq!(p1.packet - p0.packet, 800000);
        // 10.24 s is exactly 10 windows
        assert_eq!(p0.packet, 42 + 10 * 800000);
    }

    #[test]
    fn test_alignment_rounds_to_nearest_window() {
        let oracle = oracle_at(1_500_000_000, 0);
        // 1.5 s is closer to one window (1.024 s) than to two
        let t = OffsetDateTime::from_unix_timestamp(1_500_000_000).unwrap()
            + time::Duration::seconds_f64(1.5);
        let p = compute_start_packet(t, 781250, &oracle).unwrap();
        assert_eq!(p.packet, 800000);
        let expected_ns = 1_500_000_000_000_000_000i128 + ALIGNMENT_NS;
        assert_eq!(p.utc.unix_timestamp_nanos(), expected_ns);
    }

    #[test]
    fn test_start_before_sync_rejected() {
        let oracle = oracle_at(1_500_000_000, 0);
        let t = OffsetDateTime::from_unix_timestamp(1_400_000_000).unwrap();
        match compute_start_packet(t, 781250, &oracle) {
            Err(SyncError::StartBeforeSync { .. }) => (),
            _ => panic!(),
        }
    }

    #[test]
    fn test_oracle_failure_propagates() {
        let t = OffsetDateTime::from_unix_timestamp(1_500_000_000).unwrap();
        assert!(compute_start_packet(t, 781250, &FailingOracle).is_err());
    }

    #[test]
    fn test_debug_fallback() {
        let t = OffsetDateTime::from_unix_timestamp(1_000).unwrap();
        let p = debug_start_packet(t, 781250);
        assert_eq!(p.packet, 781_250_000);
        assert_eq!(p.utc, t);
    }

    #[test]
    fn test_parse_sync_reply() {
        let p = parse_sync_reply("123456 1500000000\n").unwrap();
        assert_eq!(p.packet, 123456);
        assert_eq!(p.utc.unix_timestamp(), 1_500_000_000);
        assert!(parse_sync_reply("garbage\n").is_err());
    }
}
