//! Observation compilation.
//!
//! The compiler turns one observation request into the complete set of
//! per-beam configuration records, plus the shared files (headers,
//! coordinate summary, observation info) the rest of the system reads.
//! Validation happens first and any failure aborts before a single file is
//! written or a single node is contacted; a partially configured
//! observation must never start.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::PathBuf;

use serde::Serialize;
use time::OffsetDateTime;

use super::beam_config::BeamConfig;
use super::beam_offsets::{BeamOffsets, BeamPosition};
use super::config::{render_template, Settings};
use super::constants::ALIGNMENT_SEC;
use super::dada_header;
use super::error::{CompilerError, ValidationError};
use super::observation::{ObsMode, ObservationRequest, StartTime};
use super::start_packet::{compute_start_packet, debug_start_packet, StartPacket, TimingOracle};
use super::timestamps;

/// Everything the orchestrator and lifecycle tracker need to run one
/// observation. The start packet in here was computed exactly once; every
/// beam references it.
#[derive(Debug)]
pub struct CompiledObservation {
    pub start: StartPacket,
    pub end_utc: OffsetDateTime,
    pub duration_sec: f64,
    pub date: String,
    pub datetimesource: String,
    pub master_dir: PathBuf,
    pub header_dir: PathBuf,
    pub beams: BTreeMap<usize, BeamConfig>,
    pub positions: BTreeMap<usize, BeamPosition>,
}

/// The shared observation summary, written to `info.yaml` in the master
/// directory and picked up by the notifier.
#[derive(Debug, Serialize)]
struct ObservationInfo<'a> {
    source: &'a str,
    ra: String,
    dec: String,
    startutc: String,
    startmjd: f64,
    startpacket: u64,
    duration_sec: f64,
    nbatch: usize,
    science_case: String,
    science_mode: String,
    obs_mode: String,
    beams: Vec<usize>,
    ntabs: usize,
    snrmin: f64,
    dm_min: f64,
    dm_max: f64,
    taskid: Option<&'a str>,
}

/// Compile an observation request into per-beam configurations and persist
/// them.
///
/// The timing oracle is consulted exactly once. In debug mode it is not
/// consulted at all; the requested time itself becomes the tick basis.
pub fn compile(
    request: &ObservationRequest,
    settings: &Settings,
    offsets: &BeamOffsets,
    oracle: &dyn TimingOracle,
) -> Result<CompiledObservation, CompilerError> {
    // Everything up to the file writes below must stay side-effect free.
    request.validate()?;

    let case = settings.case(request.science_case);
    let mode_name = request.science_mode.to_string();
    if !case
        .valid_modes
        .iter()
        .any(|m| m.eq_ignore_ascii_case(&mode_name))
    {
        return Err(ValidationError::UnsupportedMode {
            mode: mode_name,
            case: request.science_case.to_string(),
        }
        .into());
    }
    let mode = settings.mode(request.science_mode);

    let beams = request.beams.resolve(case)?;

    // round up to a whole number of ringbuffer pages
    let duration_sec = (request.duration_sec / ALIGNMENT_SEC).ceil() * ALIGNMENT_SEC;
    let nbatch = (duration_sec / ALIGNMENT_SEC).round() as usize;

    let requested = match request.tstart {
        StartTime::At(t) => t,
        StartTime::Soonest => {
            OffsetDateTime::now_utc() + time::Duration::seconds(settings.general.start_lead_sec)
        }
    };
    let start = if request.debug {
        log::warn!("Debug mode: deriving start packet from the wall clock, not the timing server");
        debug_start_packet(requested, case.time_unit)
    } else {
        compute_start_packet(requested, case.time_unit, oracle)?
    };

    let date = timestamps::format_date(start.utc);
    let datetimesource = timestamps::format_datetimesource(start.utc, &request.source);
    let startutc = timestamps::format_utc(start.utc);
    let startmjd = timestamps::mjd(start.utc);

    let chan_width = case.bw / case.nchan as f64;
    let min_freq = case.freq - case.bw / 2.0 + chan_width / 2.0;
    let buffersize = mode.ntabs * case.nchan * case.pagesize;
    let nreader = request.obs_mode.nreaders(settings.amber.instances.len());

    let master_dir = PathBuf::from(render_template(
        &settings.general.master_dir,
        &date,
        &datetimesource,
    ));
    let header_dir = PathBuf::from(render_template(
        &settings.general.header_dir,
        &date,
        &datetimesource,
    ));
    let log_dir = render_template(&settings.general.log_dir, &date, &datetimesource);
    let output_dir = render_template(&settings.general.output_dir, &date, &datetimesource);
    let amber_dir = render_template(&settings.general.amber_dir, &date, &datetimesource);

    let provenance = request.provenance();
    let mut configs: BTreeMap<usize, BeamConfig> = BTreeMap::new();
    let mut positions: BTreeMap<usize, BeamPosition> = BTreeMap::new();
    for &beam in &beams {
        let position = offsets.resolve_full(beam, request.boresight, start.utc);
        let config = BeamConfig {
            beam,
            hostname: settings.node_of_beam(beam),
            science_case: request.science_case.number(),
            fill_mode: mode.fill_mode,
            obs_mode: request.obs_mode.to_string(),
            ntabs: mode.ntabs,
            nsynbeams: mode.nsynbeams,
            nbit: case.nbit,
            nchan: case.nchan,
            pagesize: case.pagesize,
            buffersize,
            nbuffer: case.nbuffer,
            nreader,
            dadakey: format!("{:04x}", settings.general.dadakey_base + 2 * beam as u32),
            network_port: case.network_port_start + beam as u16,
            startpacket: start.packet,
            startutc: startutc.clone(),
            startmjd,
            duration_sec,
            nbatch,
            tsamp: case.tsamp,
            freq: case.freq,
            bw: case.bw,
            chan_width,
            min_freq,
            source: request.source.clone(),
            ra: position.coord.ra_hms(),
            dec: position.coord.dec_dms(),
            date: date.clone(),
            datetimesource: datetimesource.clone(),
            output_dir: output_dir.clone(),
            log_dir: log_dir.clone(),
            master_dir: master_dir.to_string_lossy().into_owned(),
            amber_dir: amber_dir.clone(),
            amber_conf_dir: settings.general.amber_conf_dir.clone(),
            fits_templates: settings.general.fits_templates.clone(),
            header: header_dir
                .join(dada_header::file_name(beam))
                .to_string_lossy()
                .into_owned(),
            snrmin: request.snrmin,
            dm_min: request.dm_min,
            dm_max: request.dm_max,
            proctrigger: request.proctrigger,
            debug: request.debug,
            dada_dir: request
                .dada_dir
                .as_ref()
                .map(|p| p.to_string_lossy().into_owned()),
            atdb: request.atdb,
            taskid: request.taskid.clone(),
        };
        configs.insert(beam, config);
        positions.insert(beam, position);
    }

    log::info!(
        "Compiled {} beams, Tobs {} s, start packet {}, buffer {} per beam",
        configs.len(),
        duration_sec,
        start.packet,
        human_bytes::human_bytes(buffersize as f64),
    );

    // All validation has passed; only now touch the filesystem.
    std::fs::create_dir_all(&master_dir)?;
    std::fs::create_dir_all(&header_dir)?;
    for (beam, config) in &configs {
        config.write(&master_dir)?;
        let header = dada_header::render(config, &positions[beam], &provenance);
        std::fs::write(&config.header, header)?;
    }
    write_coordinates(&master_dir, &positions)?;
    write_info(&master_dir, request, &beams, mode.ntabs, start, duration_sec, nbatch, &startutc, startmjd)?;

    // dump-mode data gets converted to filterbank offline; note the command
    if request.obs_mode == ObsMode::Dump {
        let beam_list = beams
            .iter()
            .map(|b| b.to_string())
            .collect::<Vec<_>>()
            .join(",");
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&settings.general.filterbank_cmds)?;
        writeln!(
            file,
            "convert_to_filterbank.py {} {} {}",
            date, datetimesource, beam_list
        )?;
    }

    let end_utc = start.utc + time::Duration::seconds_f64(duration_sec);
    Ok(CompiledObservation {
        start,
        end_utc,
        duration_sec,
        date,
        datetimesource,
        master_dir,
        header_dir,
        beams: configs,
        positions,
    })
}

/// One line per beam: index, RA, Dec, galactic l, galactic b.
fn write_coordinates(
    master_dir: &std::path::Path,
    positions: &BTreeMap<usize, BeamPosition>,
) -> Result<(), CompilerError> {
    let mut contents = String::new();
    for (beam, position) in positions {
        contents.push_str(&format!(
            "{:02} {} {} {:.4} {:.4}\n",
            beam,
            position.coord.ra_hms(),
            position.coord.dec_dms(),
            position.gl,
            position.gb,
        ));
    }
    std::fs::write(master_dir.join("coordinates.txt"), contents)?;
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn write_info(
    master_dir: &std::path::Path,
    request: &ObservationRequest,
    beams: &[usize],
    ntabs: usize,
    start: StartPacket,
    duration_sec: f64,
    nbatch: usize,
    startutc: &str,
    startmjd: f64,
) -> Result<(), CompilerError> {
    let info = ObservationInfo {
        source: &request.source,
        ra: request.boresight.ra_hms(),
        dec: request.boresight.dec_dms(),
        startutc: startutc.to_string(),
        startmjd,
        startpacket: start.packet,
        duration_sec,
        nbatch,
        science_case: request.science_case.to_string(),
        science_mode: request.science_mode.to_string(),
        obs_mode: request.obs_mode.to_string(),
        beams: beams.to_vec(),
        ntabs,
        snrmin: request.snrmin,
        dm_min: request.dm_min,
        dm_max: request.dm_max,
        taskid: request.taskid.as_deref(),
    };
    let yaml_str = serde_yaml::to_string(&info)?;
    std::fs::write(master_dir.join("info.yaml"), yaml_str)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinates::SkyCoord;
    use crate::error::SyncError;
    use crate::observation::{BeamSelection, ScienceCase, ScienceMode};
    use crate::start_packet::SyncPoint;

    struct FixedOracle;

    impl TimingOracle for FixedOracle {
        fn query(&self) -> Result<SyncPoint, SyncError> {
            Ok(SyncPoint {
                packet: 1000,
                utc: OffsetDateTime::from_unix_timestamp(1_551_000_000).unwrap(),
            })
        }
    }

    struct FailingOracle;

    impl TimingOracle for FailingOracle {
        fn query(&self) -> Result<SyncPoint, SyncError> {
            Err(SyncError::BadReply("unreachable".to_string()))
        }
    }

    fn test_settings(tag: &str) -> (Settings, PathBuf) {
        let base = std::env::temp_dir().join(format!("compiler_test_{}_{}", tag, std::process::id()));
        let mut settings = Settings::default();
        let s = base.to_string_lossy().into_owned();
        settings.general.master_dir = format!("{}/master/{{date}}/{{datetimesource}}", s);
        settings.general.header_dir = format!("{}/header/{{date}}/{{datetimesource}}", s);
        settings.general.log_dir = format!("{}/log/{{date}}/{{datetimesource}}", s);
        settings.general.filterbank_cmds = format!("{}/filterbank_cmds.txt", s);
        (settings, base)
    }

    fn test_request(beams: &str, mode: ScienceMode, obs_mode: ObsMode) -> ObservationRequest {
        ObservationRequest {
            source: "B0531+21".to_string(),
            boresight: SkyCoord::from_hmsdms("05:34:30", "+22:00:52").unwrap(),
            duration_sec: 10.24,
            tstart: StartTime::At(
                OffsetDateTime::from_unix_timestamp(1_551_000_000).unwrap()
                    + time::Duration::seconds_f64(10.24),
            ),
            science_case: ScienceCase::Sc4,
            science_mode: mode,
            obs_mode,
            beams: BeamSelection::parse_list(beams).unwrap(),
            snrmin: 10.0,
            dm_min: 20.0,
            dm_max: 5000.0,
            proctrigger: false,
            pulsar: false,
            debug: false,
            dada_dir: None,
            atdb: false,
            taskid: None,
        }
    }

    #[test]
    fn test_survey_compiles_three_beams() {
        let (settings, base) = test_settings("three");
        let offsets = BeamOffsets::new(None).unwrap();
        let request = test_request("20,21,22", ScienceMode::IIab, ObsMode::Fil);

        let compiled = compile(&request, &settings, &offsets, &FixedOracle).unwrap();
        assert_eq!(compiled.beams.len(), 3);

        // every beam carries the identical start packet and duration
        let packets: Vec<u64> = compiled.beams.values().map(|c| c.startpacket).collect();
        assert!(packets.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(compiled.start.packet, packets[0]);
        for config in compiled.beams.values() {
            assert_eq!(config.duration_sec, 10.24);
            assert_eq!(config.nbatch, 10);
            // IAB: ntabs = 1
            assert_eq!(config.buffersize, 1536 * 25000);
            assert!(compiled.master_dir.join(BeamConfig::file_name(config.beam)).exists());
            assert!(std::path::Path::new(&config.header).exists());
        }
        assert!(compiled.master_dir.join("coordinates.txt").exists());
        assert!(compiled.master_dir.join("info.yaml").exists());

        std::fs::remove_dir_all(&base).unwrap();
    }

    #[test]
    fn test_beam_dependent_fields_differ() {
        let (settings, base) = test_settings("fields");
        let offsets = BeamOffsets::new(None).unwrap();
        let request = test_request("20,21", ScienceMode::IIab, ObsMode::Fil);

        let compiled = compile(&request, &settings, &offsets, &FixedOracle).unwrap();
        let cb20 = &compiled.beams[&20];
        let cb21 = &compiled.beams[&21];
        assert_eq!(cb20.network_port, 5020);
        assert_eq!(cb21.network_port, 5021);
        assert_ne!(cb20.dadakey, cb21.dadakey);
        assert_ne!(cb20.ra, cb21.ra);
        assert_eq!(cb20.hostname, "arts021");
        assert_eq!(cb21.hostname, "arts022");

        std::fs::remove_dir_all(&base).unwrap();
    }

    #[test]
    fn test_iquv_mode_rejected() {
        let (settings, _base) = test_settings("iquv");
        let offsets = BeamOffsets::new(None).unwrap();
        let request = test_request("21", ScienceMode::IquvIab, ObsMode::Fil);

        match compile(&request, &settings, &offsets, &FixedOracle) {
            Err(CompilerError::Validation(ValidationError::UnsupportedMode { .. })) => (),
            _ => panic!(),
        }
    }

    #[test]
    fn test_oracle_failure_aborts_before_writes() {
        let (settings, base) = test_settings("oracle");
        let offsets = BeamOffsets::new(None).unwrap();
        let request = test_request("20,21,22", ScienceMode::IIab, ObsMode::Fil);

        match compile(&request, &settings, &offsets, &FailingOracle) {
            Err(CompilerError::Sync(_)) => (),
            _ => panic!(),
        }
        // nothing may exist on disk after the abort
        assert!(!base.exists());
    }

    #[test]
    fn test_duration_rounds_up_to_pages() {
        let (settings, base) = test_settings("pages");
        let offsets = BeamOffsets::new(None).unwrap();
        let mut request = test_request("21", ScienceMode::IIab, ObsMode::Fil);
        request.duration_sec = 10.0;

        let compiled = compile(&request, &settings, &offsets, &FixedOracle).unwrap();
        assert!((compiled.duration_sec - 10.24).abs() < 1e-9);
        assert_eq!(compiled.beams[&21].nbatch, 10);

        std::fs::remove_dir_all(&base).unwrap();
    }

    #[test]
    fn test_dump_mode_notes_conversion() {
        let (settings, base) = test_settings("dump");
        let offsets = BeamOffsets::new(None).unwrap();
        std::fs::create_dir_all(&base).unwrap();
        let request = test_request("20,21,22", ScienceMode::IIab, ObsMode::Dump);

        let compiled = compile(&request, &settings, &offsets, &FixedOracle).unwrap();
        let notes = std::fs::read_to_string(&settings.general.filterbank_cmds).unwrap();
        assert!(notes.contains("20,21,22"));
        assert!(notes.contains(&compiled.date));

        std::fs::remove_dir_all(&base).unwrap();
    }
}
