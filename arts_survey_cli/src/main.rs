//! # arts_survey_cli
//!
//! Part of the arts_survey crate family.
//!
//! The operator entry point for ARTS survey observations. Three subcommands:
//!
//! - `new`: write an editable copy of the bundled cluster settings
//! - `start`: compile and launch an observation across the cluster
//! - `watch`: tail a candidate file and forward qualifying triggers
//!
//! ```bash
//! arts_survey_cli start --source B0531+21 --ra 05:34:30 --dec 22:00:52 \
//!     --duration 300 --beams 20,21,22 --science-mode I+IAB --obs-mode survey
//! ```
//!
//! A bare invocation prints the help text and starts nothing; an
//! observation always takes at least the subcommand.

use clap::{Arg, ArgAction, Command};
use indicatif::{MultiProgress, ProgressBar};
use indicatif_log_bridge::LogWrapper;
use std::path::{Path, PathBuf};
use std::sync::mpsc::channel;
use std::sync::Arc;

use libarts_survey::beam_offsets::BeamOffsets;
use libarts_survey::compiler::compile;
use libarts_survey::config::Settings;
use libarts_survey::coordinates::SkyCoord;
use libarts_survey::launch_status::NodeState;
use libarts_survey::lifecycle::{DeferredAction, LifecycleTracker};
use libarts_survey::observation::{
    BeamSelection, ObservationRequest, ObsMode, ScienceCase, ScienceMode, StartTime,
};
use libarts_survey::orchestrator::Orchestrator;
use libarts_survey::remote::{LocalExecutor, RemoteExecutor, SshExecutor};
use libarts_survey::start_packet::TimingServer;
use libarts_survey::timestamps::parse_utc;
use libarts_survey::trigger_watcher::TriggerWatcher;

fn main() {
    let matches = Command::new("arts_survey_cli")
        .about("Observation control for the ARTS FRB survey")
        .arg_required_else_help(true)
        .subcommand_required(true)
        .subcommand(
            Command::new("new")
                .about("Write a template settings yaml file")
                .arg(
                    Arg::new("path")
                        .short('p')
                        .long("path")
                        .required(true)
                        .help("Path to write the template to"),
                ),
        )
        .subcommand(start_command())
        .subcommand(watch_command())
        .get_matches();

    // Initialize feedback
    let pb_manager = MultiProgress::new();
    let logger = simplelog::CombinedLogger::new(vec![
        simplelog::TermLogger::new(
            simplelog::LevelFilter::Info,
            simplelog::Config::default(),
            simplelog::TerminalMode::Mixed,
            simplelog::ColorChoice::Auto,
        ),
        simplelog::WriteLogger::new(
            simplelog::LevelFilter::Debug,
            simplelog::Config::default(),
            std::fs::File::create("./arts_survey.log").expect("Could not create log file!"),
        ),
    ]);
    LogWrapper::new(pb_manager.clone(), logger)
        .try_init()
        .expect("Could not create logging/progress!");
    log::set_max_level(log::LevelFilter::Debug);

    match matches.subcommand() {
        Some(("new", sub)) => {
            let path = PathBuf::from(sub.get_one::<String>("path").expect("required"));
            log::info!("Making a template settings file at {}...", path.to_string_lossy());
            if let Err(e) = Settings::write_template(&path) {
                log::error!("{e}");
                std::process::exit(1);
            }
            log::info!("Done.");
        }
        Some(("start", sub)) => run_start(sub, &pb_manager),
        Some(("watch", sub)) => run_watch(sub),
        _ => unreachable!(),
    }
}

fn start_command() -> Command {
    Command::new("start")
        .about("Start a survey mode observation on the cluster")
        .arg(Arg::new("settings").long("settings").help("Cluster settings yaml (default: bundled)"))
        .arg(Arg::new("offsets").long("offsets").help("Beam offset table csv (default: bundled)"))
        .arg(
            Arg::new("source")
                .long("source")
                .default_value("None")
                .help("Source name"),
        )
        .arg(
            Arg::new("ra")
                .long("ra")
                .default_value("00:00:00")
                .help("J2000 RA in hh:mm:ss.s format"),
        )
        .arg(
            Arg::new("dec")
                .long("dec")
                .default_value("00:00:00")
                .help("J2000 DEC in dd:mm:ss.s format"),
        )
        .arg(
            Arg::new("duration")
                .long("duration")
                .value_parser(clap::value_parser!(f64))
                .default_value("10.24")
                .help("Observation duration in seconds"),
        )
        .arg(
            Arg::new("tstart")
                .long("tstart")
                .default_value("default")
                .help("Start time (UTC), e.g. \"2019-01-01 00:00:00\" (default: now + start lead)"),
        )
        .arg(
            Arg::new("sbeam")
                .long("sbeam")
                .value_parser(clap::value_parser!(usize))
                .default_value("21")
                .help("First CB to record"),
        )
        .arg(
            Arg::new("ebeam")
                .long("ebeam")
                .value_parser(clap::value_parser!(usize))
                .default_value("0")
                .help("Last CB to record (default: same as sbeam)"),
        )
        .arg(
            Arg::new("beams")
                .long("beams")
                .conflicts_with_all(["sbeam", "ebeam"])
                .help("List of beams to process. Use instead of sbeam and ebeam"),
        )
        .arg(
            Arg::new("obs_mode")
                .long("obs-mode")
                .default_value("fil")
                .help("Observation mode: dump, scrub, fil, fits, amber, survey"),
        )
        .arg(
            Arg::new("science_case")
                .long("science-case")
                .default_value("4")
                .help("Science case: 3 or 4"),
        )
        .arg(
            Arg::new("science_mode")
                .long("science-mode")
                .default_value("I+TAB")
                .help("Science mode: I+TAB, IQUV+TAB, I+IAB, IQUV+IAB"),
        )
        .arg(
            Arg::new("snrmin")
                .long("snrmin")
                .value_parser(clap::value_parser!(f64))
                .default_value("10")
                .help("Minimum S/N in the search"),
        )
        .arg(
            Arg::new("dmmin")
                .long("dmmin")
                .value_parser(clap::value_parser!(f64))
                .default_value("20")
                .help("Minimum dispersion measure for triggers"),
        )
        .arg(
            Arg::new("dmmax")
                .long("dmmax")
                .value_parser(clap::value_parser!(f64))
                .default_value("5000")
                .help("Maximum dispersion measure for triggers"),
        )
        .arg(
            Arg::new("proctrigger")
                .long("proctrigger")
                .action(ArgAction::SetTrue)
                .help("Process and aggregate triggers after the observation"),
        )
        .arg(
            Arg::new("pulsar")
                .long("pulsar")
                .action(ArgAction::SetTrue)
                .help("Fold the test pulsar on the central beam afterwards"),
        )
        .arg(
            Arg::new("debug")
                .long("debug")
                .action(ArgAction::SetTrue)
                .requires("dada_dir")
                .help("Offline test mode: replay recorded data, skip the timing server"),
        )
        .arg(
            Arg::new("dada_dir")
                .long("dada-dir")
                .help("Directory with recorded pages to replay (debug mode)"),
        )
        .arg(
            Arg::new("atdb")
                .long("atdb")
                .action(ArgAction::SetTrue)
                .requires("taskid")
                .help("Register data products with the archive"),
        )
        .arg(Arg::new("taskid").long("taskid").help("Archive task id"))
}

fn watch_command() -> Command {
    Command::new("watch")
        .about("Watch a candidate file and forward qualifying triggers")
        .arg(Arg::new("settings").long("settings").help("Cluster settings yaml (default: bundled)"))
        .arg(
            Arg::new("file")
                .long("file")
                .required(true)
                .help("Candidate file to watch"),
        )
        .arg(
            Arg::new("tstart")
                .long("tstart")
                .required(true)
                .help("Observation start time (UTC), e.g. \"2019-01-01 00:00:00\""),
        )
        .arg(
            Arg::new("science_case")
                .long("science-case")
                .default_value("4")
                .help("Science case: 3 or 4"),
        )
        .arg(
            Arg::new("duration")
                .long("duration")
                .value_parser(clap::value_parser!(f64))
                .help("Stop watching this many seconds after the start time"),
        )
        .arg(
            Arg::new("snrmin")
                .long("snrmin")
                .value_parser(clap::value_parser!(f64))
                .help("Minimum S/N (default: from settings)"),
        )
        .arg(
            Arg::new("dmmin")
                .long("dmmin")
                .value_parser(clap::value_parser!(f64))
                .help("Minimum DM (default: from settings)"),
        )
        .arg(
            Arg::new("dmmax")
                .long("dmmax")
                .value_parser(clap::value_parser!(f64))
                .help("Maximum DM (default: from settings)"),
        )
        .arg(
            Arg::new("maxage")
                .long("maxage")
                .value_parser(clap::value_parser!(f64))
                .help("Maximum candidate age in seconds (default: from settings)"),
        )
        .arg(Arg::new("dump_host").long("dump-host").help("Dump service host"))
        .arg(
            Arg::new("dump_port")
                .long("dump-port")
                .value_parser(clap::value_parser!(u16))
                .help("Dump service port"),
        )
}

fn load_settings(matches: &clap::ArgMatches) -> Settings {
    let path = matches.get_one::<String>("settings").map(PathBuf::from);
    match Settings::read_config_file(path.as_deref()) {
        Ok(settings) => settings,
        Err(e) => {
            log::error!("{e}");
            std::process::exit(1);
        }
    }
}

/// Log the violated constraint and exit before anything was touched.
fn fail(e: impl std::fmt::Display) -> ! {
    log::error!("{e}");
    std::process::exit(1);
}

/// Build the observation request from the command line. Any rejection here
/// happens before a single file is written or node is contacted.
fn parse_request(matches: &clap::ArgMatches) -> ObservationRequest {
    let boresight = SkyCoord::from_hmsdms(
        matches.get_one::<String>("ra").expect("defaulted"),
        matches.get_one::<String>("dec").expect("defaulted"),
    )
    .unwrap_or_else(|e| fail(e));

    let tstart = match matches.get_one::<String>("tstart").expect("defaulted").as_str() {
        "default" | "soonest" => StartTime::Soonest,
        other => StartTime::At(parse_utc(other).unwrap_or_else(|e| fail(e))),
    };

    let beams = match matches.get_one::<String>("beams") {
        Some(list) => BeamSelection::parse_list(list).unwrap_or_else(|e| fail(e)),
        None => BeamSelection::Range {
            sbeam: *matches.get_one::<usize>("sbeam").expect("defaulted"),
            ebeam: *matches.get_one::<usize>("ebeam").expect("defaulted"),
        },
    };

    let science_case: ScienceCase = matches
        .get_one::<String>("science_case")
        .expect("defaulted")
        .parse()
        .unwrap_or_else(|e| fail(e));
    let science_mode: ScienceMode = matches
        .get_one::<String>("science_mode")
        .expect("defaulted")
        .parse()
        .unwrap_or_else(|e| fail(e));
    let obs_mode: ObsMode = matches
        .get_one::<String>("obs_mode")
        .expect("defaulted")
        .parse()
        .unwrap_or_else(|e| fail(e));

    let request = ObservationRequest {
        source: matches.get_one::<String>("source").expect("defaulted").clone(),
        boresight,
        duration_sec: *matches.get_one::<f64>("duration").expect("defaulted"),
        tstart,
        science_case,
        science_mode,
        obs_mode,
        beams,
        snrmin: *matches.get_one::<f64>("snrmin").expect("defaulted"),
        dm_min: *matches.get_one::<f64>("dmmin").expect("defaulted"),
        dm_max: *matches.get_one::<f64>("dmmax").expect("defaulted"),
        proctrigger: matches.get_flag("proctrigger"),
        pulsar: matches.get_flag("pulsar"),
        debug: matches.get_flag("debug"),
        dada_dir: matches.get_one::<String>("dada_dir").map(PathBuf::from),
        atdb: matches.get_flag("atdb"),
        taskid: matches.get_one::<String>("taskid").cloned(),
    };
    if let Err(e) = request.validate() {
        fail(e);
    }
    request
}

fn run_start(matches: &clap::ArgMatches, pb_manager: &MultiProgress) {
    let settings = load_settings(matches);
    let request = parse_request(matches);

    let offsets_path = matches.get_one::<String>("offsets").map(PathBuf::from);
    let offsets = match BeamOffsets::new(offsets_path.as_deref()) {
        Ok(offsets) => offsets,
        Err(e) => {
            log::error!("{e}");
            std::process::exit(1);
        }
    };

    log::info!("Source: {}", request.source);
    log::info!(
        "Boresight: {} {}",
        request.boresight.ra_hms(),
        request.boresight.dec_dms()
    );
    log::info!(
        "Science case {} mode {}, obs mode {}",
        request.science_case,
        request.science_mode,
        request.obs_mode
    );

    let oracle = TimingServer::new(&settings.general.timing_host, settings.general.timing_port);
    let compiled = match compile(&request, &settings, &offsets, &oracle) {
        Ok(compiled) => compiled,
        Err(e) => {
            log::error!("{e}");
            std::process::exit(1);
        }
    };
    log::info!(
        "Observation compiled: {} beams, start {} (packet {}), Tobs {} s",
        compiled.beams.len(),
        compiled.beams.values().next().map(|c| c.startutc.as_str()).unwrap_or("?"),
        compiled.start.packet,
        compiled.duration_sec
    );

    // Debug observations replay data on this machine; everything else goes
    // over ssh to the nodes.
    let executor: Arc<dyn RemoteExecutor> = if request.debug {
        Arc::new(LocalExecutor)
    } else {
        Arc::new(SshExecutor::new(settings.general.ssh_timeout_sec))
    };

    let compiled = Arc::new(compiled);
    let (tx, rx) = channel();
    let handle = std::thread::spawn({
        let compiled = Arc::clone(&compiled);
        let settings = settings.clone();
        let executor = Arc::clone(&executor);
        move || {
            let orchestrator = Orchestrator::new(executor.as_ref(), &settings);
            orchestrator.launch_all(compiled.beams.values(), &tx)
        }
    });

    // One tick per beam; the orchestrator reports states as it goes
    let pb = pb_manager.add(ProgressBar::new(compiled.beams.len() as u64));
    for status in rx {
        match status.state {
            NodeState::Completed | NodeState::Failed => pb.inc(1),
            _ => (),
        }
    }
    pb.finish();

    let states = match handle.join() {
        Ok(states) => states,
        Err(_) => {
            log::error!("Failed to join launch task!");
            std::process::exit(1);
        }
    };
    report_states(&states);

    let mut actions = Vec::new();
    if request.proctrigger {
        actions.push(DeferredAction::TriggerAggregation);
    }
    if request.atdb {
        actions.push(DeferredAction::CompletionCheck);
        actions.push(DeferredAction::ArchiveIngest);
    }
    if request.pulsar {
        actions.push(DeferredAction::PulsarFold);
    }
    if !actions.is_empty() {
        log::info!(
            "Scheduling {} deferred actions for the end of the observation",
            actions.len()
        );
        let tracker = LifecycleTracker::new(Arc::clone(&executor), &settings);
        for handle in tracker.schedule_deferred(&compiled, &actions) {
            let _ = handle.join();
        }
    }

    log::info!("Done.");
}

fn report_states(states: &[(usize, NodeState)]) {
    let failed = states
        .iter()
        .filter(|(_, state)| *state == NodeState::Failed)
        .count();
    for (beam, state) in states {
        match state {
            NodeState::Failed => log::warn!("CB{:02}: {}", beam, state),
            _ => log::info!("CB{:02}: {}", beam, state),
        }
    }
    if failed > 0 {
        log::warn!(
            "{} of {} beams failed to launch; observation continues on the rest",
            failed,
            states.len()
        );
    } else {
        log::info!("All {} beams launched", states.len());
    }
}

fn run_watch(matches: &clap::ArgMatches) {
    let settings = load_settings(matches);
    let tstart = match parse_utc(matches.get_one::<String>("tstart").expect("required")) {
        Ok(t) => t,
        Err(e) => {
            log::error!("{e}");
            std::process::exit(1);
        }
    };

    let science_case: ScienceCase = match matches
        .get_one::<String>("science_case")
        .expect("defaulted")
        .parse()
    {
        Ok(case) => case,
        Err(e) => {
            log::error!("{e}");
            std::process::exit(1);
        }
    };
    let tsamp = settings.case(science_case).tsamp;

    let mut trigger_settings = settings.trigger.clone();
    if let Some(snrmin) = matches.get_one::<f64>("snrmin") {
        trigger_settings.snrmin = *snrmin;
    }
    if let Some(dm_min) = matches.get_one::<f64>("dmmin") {
        trigger_settings.dm_min = *dm_min;
    }
    if let Some(dm_max) = matches.get_one::<f64>("dmmax") {
        trigger_settings.dm_max = *dm_max;
    }
    if let Some(max_age) = matches.get_one::<f64>("maxage") {
        trigger_settings.max_age_sec = *max_age;
    }

    let dump_host = matches
        .get_one::<String>("dump_host")
        .cloned()
        .unwrap_or_else(|| settings.general.dump_host.clone());
    let dump_port = matches
        .get_one::<u16>("dump_port")
        .copied()
        .unwrap_or(settings.general.dump_port);

    let deadline = matches
        .get_one::<f64>("duration")
        .map(|duration| tstart + time::Duration::seconds_f64(*duration));

    let file = Path::new(matches.get_one::<String>("file").expect("required")).to_path_buf();
    log::info!("Watching {} for triggers", file.to_string_lossy());
    let mut watcher = TriggerWatcher::new(
        file,
        tstart,
        tsamp,
        trigger_settings,
        &dump_host,
        dump_port,
    );
    watcher.run(deadline);
    log::info!("Done.");
}
