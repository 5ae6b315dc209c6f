//! Candidate trigger watching.
//!
//! The dedispersion search appends candidates to a text file while the
//! observation runs. The watcher polls that file, picks the best unseen
//! candidate, filters it, and forwards qualifying events to the data-dump
//! service. This is a best-effort alerting path: the raw data has already
//! been written independently, so a missed trigger is an acceptable loss
//! and nothing here retries or propagates errors upward.

use std::io::Write;
use std::net::TcpStream;
use std::path::PathBuf;
use std::time::Duration;

use time::OffsetDateTime;

use super::config::TriggerSettings;
use super::error::TriggerError;
use super::timestamps::format_utc_dashed;

/// One row of the candidate file. Column order is fixed: beam, batch,
/// sample, integration step, compacted integration steps, arrival time,
/// DM, compacted DMs, S/N.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candidate {
    pub beam: u32,
    pub batch: u64,
    pub sample: u64,
    pub integration_step: f64,
    pub compacted_integration_steps: u32,
    pub time_sec: f64,
    pub dm: f64,
    pub compacted_dms: u32,
    pub snr: f64,
}

impl std::str::FromStr for Candidate {
    type Err = TriggerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || TriggerError::BadCandidate(s.to_string());
        let fields: Vec<&str> = s.split_whitespace().collect();
        if fields.len() != 9 {
            return Err(bad());
        }
        Ok(Candidate {
            beam: fields[0].parse().map_err(|_| bad())?,
            batch: fields[1].parse().map_err(|_| bad())?,
            sample: fields[2].parse().map_err(|_| bad())?,
            integration_step: fields[3].parse().map_err(|_| bad())?,
            compacted_integration_steps: fields[4].parse().map_err(|_| bad())?,
            time_sec: fields[5].parse().map_err(|_| bad())?,
            dm: fields[6].parse().map_err(|_| bad())?,
            compacted_dms: fields[7].parse().map_err(|_| bad())?,
            snr: fields[8].parse().map_err(|_| bad())?,
        })
    }
}

/// A dump request for one event, in the fixed wire layout the dump service
/// expects: an event count line, the observation UTC start, then one line
/// per event with window start/end (timestamp plus second fraction), DM,
/// S/N, pulse width and beam.
#[derive(Debug, Clone, PartialEq)]
pub struct DumpRequest {
    pub utc_start: OffsetDateTime,
    pub window_start: OffsetDateTime,
    pub window_end: OffsetDateTime,
    pub dm: f64,
    pub snr: f64,
    pub width_sec: f64,
    pub beam: u32,
}

impl DumpRequest {
    pub fn render(&self) -> String {
        format!(
            "N_EVENTS 1\nUTC_START {}\n{} {:.3} {} {:.3} {:.2} {:.2} {:.5} {:02}\n",
            format_utc_dashed(self.utc_start),
            format_utc_dashed(self.window_start),
            subsecond(self.window_start),
            format_utc_dashed(self.window_end),
            subsecond(self.window_end),
            self.dm,
            self.snr,
            self.width_sec,
            self.beam,
        )
    }
}

fn subsecond(t: OffsetDateTime) -> f64 {
    t.nanosecond() as f64 / 1e9
}

pub struct TriggerWatcher {
    candidates_file: PathBuf,
    /// Observation start; candidate arrival times are offsets from this.
    tstart: OffsetDateTime,
    tsamp: f64,
    settings: TriggerSettings,
    dump_addr: String,
    /// Rows already inspected. The file is re-read from scratch every poll
    /// and this count selects the new tail, so a full rewrite of the file
    /// is survivable where a byte offset would not be.
    rows_seen: usize,
}

impl TriggerWatcher {
    pub fn new(
        candidates_file: PathBuf,
        tstart: OffsetDateTime,
        tsamp: f64,
        settings: TriggerSettings,
        dump_host: &str,
        dump_port: u16,
    ) -> Self {
        Self {
            candidates_file,
            tstart,
            tsamp,
            settings,
            dump_addr: format!("{}:{}", dump_host, dump_port),
            rows_seen: 0,
        }
    }

    /// Poll loop. Runs until `deadline`, or forever when none is given; the
    /// production watcher is killed with its node session.
    pub fn run(&mut self, deadline: Option<OffsetDateTime>) {
        let interval = Duration::from_secs_f64(self.settings.interval_sec);
        loop {
            if let Some(deadline) = deadline {
                if OffsetDateTime::now_utc() >= deadline {
                    return;
                }
            }
            match self.poll(OffsetDateTime::now_utc()) {
                Ok(Some(request)) => {
                    log::info!(
                        "Trigger: DM={:.2} S/N={:.2} beam={:02}",
                        request.dm,
                        request.snr,
                        request.beam
                    );
                    if let Err(e) = self.send(&request) {
                        // missed triggers are acceptable, keep watching
                        log::error!("{}", e);
                    }
                }
                Ok(None) => (),
                Err(e) => log::warn!("Trigger poll failed: {}", e),
            }
            std::thread::sleep(interval);
        }
    }

    /// One poll: read the candidate file, evaluate the best new row.
    /// Returns the dump request to deliver, if any row qualifies.
    pub fn poll(&mut self, now: OffsetDateTime) -> Result<Option<DumpRequest>, TriggerError> {
        // the file may not exist until the search finds something
        if !self.candidates_file.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(&self.candidates_file)?;
        let rows: Vec<&str> = contents
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .collect();

        if rows.len() < self.rows_seen {
            // the search restarted and rewrote the file; start over and let
            // the age filter drop whatever is stale
            log::warn!("Candidate file shrank, resetting row counter");
            self.rows_seen = 0;
        }
        if rows.len() == self.rows_seen {
            return Ok(None);
        }

        let mut new: Vec<Candidate> = Vec::new();
        for row in &rows[self.rows_seen..] {
            match row.parse() {
                Ok(candidate) => new.push(candidate),
                Err(e) => log::warn!("{}", e),
            }
        }
        self.rows_seen = rows.len();

        // brightest new candidate only
        new.sort_by(|a, b| b.snr.partial_cmp(&a.snr).unwrap_or(std::cmp::Ordering::Equal));
        let best = match new.first() {
            Some(c) => *c,
            None => return Ok(None),
        };
        Ok(self.evaluate(best, now))
    }

    fn evaluate(&self, candidate: Candidate, now: OffsetDateTime) -> Option<DumpRequest> {
        if candidate.snr < self.settings.snrmin {
            return None;
        }
        if candidate.dm < self.settings.dm_min || candidate.dm > self.settings.dm_max {
            log::info!("Ignoring trigger at DM {:.2}, outside window", candidate.dm);
            return None;
        }
        let event_time = self.tstart + time::Duration::seconds_f64(candidate.time_sec);
        let age = (now - event_time).as_seconds_f64();
        if age > self.settings.max_age_sec {
            // e.g. a backlog flushed after the search stalled
            log::warn!("Ignoring stale trigger, age {:.1} s", age);
            return None;
        }

        let half_window = time::Duration::seconds_f64(self.settings.window_sec / 2.0);
        Some(DumpRequest {
            utc_start: self.tstart,
            window_start: event_time - half_window,
            window_end: event_time + half_window,
            dm: candidate.dm,
            snr: candidate.snr,
            width_sec: candidate.integration_step * self.tsamp,
            beam: candidate.beam,
        })
    }

    /// Deliver a dump request over a fresh connection, closing the write
    /// side so the service sees end-of-message.
    pub fn send(&self, request: &DumpRequest) -> Result<(), TriggerError> {
        let mut stream =
            TcpStream::connect(&self.dump_addr).map_err(TriggerError::DeliveryFailed)?;
        stream
            .write_all(request.render().as_bytes())
            .map_err(TriggerError::DeliveryFailed)?;
        stream
            .shutdown(std::net::Shutdown::Write)
            .map_err(TriggerError::DeliveryFailed)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    fn settings() -> TriggerSettings {
        TriggerSettings {
            interval_sec: 2.0,
            snrmin: 10.0,
            dm_min: 50.0,
            dm_max: 65.0,
            max_age_sec: 10.0,
            window_sec: 5.0,
        }
    }

    fn watcher(file: PathBuf, tstart: OffsetDateTime) -> TriggerWatcher {
        TriggerWatcher::new(file, tstart, 4.096e-5, settings(), "localhost", 0)
    }

    fn candidate_row(snr: f64, dm: f64, time_sec: f64) -> String {
        format!("21 3 1200 10 1 {} {} 1 {}\n", time_sec, dm, snr)
    }

    fn temp_file(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!("trigger_test_{}_{}.trigger", tag, std::process::id()))
    }

    #[test]
    fn test_candidate_parsing() {
        let c: Candidate = "21 3 1200 10 1 3.0 55.0 1 15.0".parse().unwrap();
        assert_eq!(c.beam, 21);
        assert_eq!(c.batch, 3);
        assert!((c.snr - 15.0).abs() < 1e-9);
        assert!((c.dm - 55.0).abs() < 1e-9);
        assert!("not a candidate".parse::<Candidate>().is_err());
    }

    #[test]
    fn test_qualifying_candidate_triggers_once() {
        let file = temp_file("once");
        let tstart = OffsetDateTime::from_unix_timestamp(1_551_000_000).unwrap();
        let now = tstart + time::Duration::seconds_f64(6.0);
        let mut watcher = watcher(file.clone(), tstart);

        // S/N 15 >= 10, DM 55 in [50, 65], age 3 s <= 10 s
        std::fs::write(&file, candidate_row(15.0, 55.0, 3.0)).unwrap();
        let request = watcher.poll(now).unwrap().expect("should trigger");
        assert_eq!(request.beam, 21);
        assert!((request.dm - 55.0).abs() < 1e-9);

        // the same row again on the next poll: already counted, no re-emit
        assert!(watcher.poll(now).unwrap().is_none());

        std::fs::remove_file(&file).unwrap();
    }

    #[test]
    fn test_stale_candidate_dropped() {
        let file = temp_file("stale");
        let tstart = OffsetDateTime::from_unix_timestamp(1_551_000_000).unwrap();
        // event happened 30 s ago, well past the 10 s age limit
        let now = tstart + time::Duration::seconds_f64(33.0);
        let mut watcher = watcher(file.clone(), tstart);

        std::fs::write(&file, candidate_row(15.0, 55.0, 3.0)).unwrap();
        assert!(watcher.poll(now).unwrap().is_none());

        std::fs::remove_file(&file).unwrap();
    }

    #[test]
    fn test_filters_by_snr_and_dm() {
        let file = temp_file("filters");
        let tstart = OffsetDateTime::from_unix_timestamp(1_551_000_000).unwrap();
        let now = tstart + time::Duration::seconds_f64(5.0);
        let mut watcher = watcher(file.clone(), tstart);

        std::fs::write(&file, candidate_row(5.0, 55.0, 3.0)).unwrap();
        assert!(watcher.poll(now).unwrap().is_none());
        std::fs::write(
            &file,
            [candidate_row(5.0, 55.0, 3.0), candidate_row(15.0, 300.0, 3.0)].concat(),
        )
        .unwrap();
        assert!(watcher.poll(now).unwrap().is_none());

        std::fs::remove_file(&file).unwrap();
    }

    #[test]
    fn test_growing_file_picks_brightest_new_row() {
        let file = temp_file("grow");
        let tstart = OffsetDateTime::from_unix_timestamp(1_551_000_000).unwrap();
        let now = tstart + time::Duration::seconds_f64(6.0);
        let mut watcher = watcher(file.clone(), tstart);

        std::fs::write(&file, candidate_row(12.0, 55.0, 3.0)).unwrap();
        assert!(watcher.poll(now).unwrap().is_some());

        // two more rows appended; only the brighter of the two is considered
        let mut contents = std::fs::read_to_string(&file).unwrap();
        contents.push_str(&candidate_row(11.0, 60.0, 4.0));
        contents.push_str(&candidate_row(20.0, 52.0, 4.0));
        std::fs::write(&file, contents).unwrap();
        let request = watcher.poll(now).unwrap().expect("should trigger");
        assert!((request.snr - 20.0).abs() < 1e-9);

        std::fs::remove_file(&file).unwrap();
    }

    #[test]
    fn test_rewritten_file_resets_counter() {
        let file = temp_file("rewrite");
        let tstart = OffsetDateTime::from_unix_timestamp(1_551_000_000).unwrap();
        let now = tstart + time::Duration::seconds_f64(6.0);
        let mut watcher = watcher(file.clone(), tstart);

        std::fs::write(
            &file,
            [candidate_row(12.0, 55.0, 3.0), candidate_row(13.0, 55.0, 3.0)].concat(),
        )
        .unwrap();
        assert!(watcher.poll(now).unwrap().is_some());

        // full rewrite with fewer rows: counter resets, fresh row triggers
        std::fs::write(&file, candidate_row(14.0, 55.0, 4.0)).unwrap();
        assert!(watcher.poll(now).unwrap().is_some());

        std::fs::remove_file(&file).unwrap();
    }

    #[test]
    fn test_dump_request_wire_format() {
        let tstart = OffsetDateTime::from_unix_timestamp(1_551_000_000).unwrap();
        let event = tstart + time::Duration::seconds_f64(3.0);
        let request = DumpRequest {
            utc_start: tstart,
            window_start: event - time::Duration::seconds_f64(2.5),
            window_end: event + time::Duration::seconds_f64(2.5),
            dm: 55.0,
            snr: 15.0,
            width_sec: 4.096e-4,
            beam: 21,
        };
        let rendered = request.render();
        let mut lines = rendered.lines();
        assert_eq!(lines.next().unwrap(), "N_EVENTS 1");
        assert!(lines.next().unwrap().starts_with("UTC_START "));
        let event_line = lines.next().unwrap();
        let fields: Vec<&str> = event_line.split_whitespace().collect();
        // start, frac, end, frac, DM, S/N, width, beam
        assert_eq!(fields.len(), 8);
        assert_eq!(fields[4], "55.00");
        assert_eq!(fields[5], "15.00");
        assert_eq!(fields[7], "21");
        assert!(lines.next().is_none());
    }

    #[test]
    fn test_delivery_over_tcp() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut received = String::new();
            stream.read_to_string(&mut received).unwrap();
            received
        });

        let tstart = OffsetDateTime::from_unix_timestamp(1_551_000_000).unwrap();
        let watcher = TriggerWatcher::new(
            temp_file("tcp"),
            tstart,
            4.096e-5,
            settings(),
            "127.0.0.1",
            port,
        );
        let request = DumpRequest {
            utc_start: tstart,
            window_start: tstart,
            window_end: tstart + time::Duration::seconds_f64(5.0),
            dm: 55.0,
            snr: 15.0,
            width_sec: 4.096e-4,
            beam: 21,
        };
        watcher.send(&request).unwrap();
        let received = handle.join().unwrap();
        assert_eq!(received, request.render());
    }

    #[test]
    fn test_delivery_failure_is_reported_not_fatal() {
        let tstart = OffsetDateTime::from_unix_timestamp(1_551_000_000).unwrap();
        // port 1 is never listening
        let watcher = TriggerWatcher::new(temp_file("dead"), tstart, 4.096e-5, settings(), "127.0.0.1", 1);
        let request = DumpRequest {
            utc_start: tstart,
            window_start: tstart,
            window_end: tstart,
            dm: 55.0,
            snr: 15.0,
            width_sec: 4.096e-4,
            beam: 21,
        };
        match watcher.send(&request) {
            Err(TriggerError::DeliveryFailed(_)) => (),
            _ => panic!(),
        }
    }
}
