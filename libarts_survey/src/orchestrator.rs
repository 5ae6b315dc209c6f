//! Per-beam node orchestration.
//!
//! For each beam the owning node is walked through a strictly ordered
//! startup sequence: clean up leftovers, create the ringbuffer, attach all
//! readers, then start the one writer that ingests the live stream. The
//! remote side gives no synchronous ready signal for buffer creation or
//! process attach, so a short settle sleep sits between the stages.
//!
//! Beams are independent. A node that cannot be reached costs that beam and
//! nothing else; a missed observation window cannot be recovered by
//! retrying, so none is attempted.

use std::sync::mpsc::Sender;
use std::time::Duration;

use super::beam_config::BeamConfig;
use super::config::{AmberSettings, Settings};
use super::constants::DADA_HDR_SIZE;
use super::error::OrchestratorError;
use super::launch_status::{LaunchStatus, NodeState};
use super::observation::ObsMode;
use super::remote::{RemoteCommand, RemoteExecutor};

pub struct Orchestrator<'a> {
    executor: &'a dyn RemoteExecutor,
    amber: AmberSettings,
    settle: Duration,
}

impl<'a> Orchestrator<'a> {
    pub fn new(executor: &'a dyn RemoteExecutor, settings: &Settings) -> Self {
        Self {
            executor,
            amber: settings.amber.clone(),
            settle: Duration::from_secs_f64(settings.general.settle_sec),
        }
    }

    /// Override the settle delay, mainly for tests.
    pub fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    /// Launch every beam in turn. Dispatch is fire-and-forget per beam, so
    /// this returns once every node has been told what to do, not when the
    /// observation ends. Failures are isolated: a dead node marks its beam
    /// Failed and the remaining beams launch normally.
    pub fn launch_all<'b, I>(&self, beams: I, tx: &Sender<LaunchStatus>) -> Vec<(usize, NodeState)>
    where
        I: IntoIterator<Item = &'b BeamConfig>,
    {
        let mut states = Vec::new();
        for config in beams {
            match self.launch_beam(config, tx) {
                Ok(()) => states.push((config.beam, NodeState::Completed)),
                Err(e) => {
                    log::error!(
                        "Abandoning beam {} on {}: {}",
                        config.beam,
                        config.hostname,
                        e
                    );
                    let _ = tx.send(LaunchStatus::new(1.0, config.beam, NodeState::Failed));
                    states.push((config.beam, NodeState::Failed));
                }
            }
        }
        states
    }

    /// Run the startup sequence for one beam.
    pub fn launch_beam(
        &self,
        config: &BeamConfig,
        tx: &Sender<LaunchStatus>,
    ) -> Result<(), OrchestratorError> {
        let host = config.hostname.as_str();
        log::info!("Starting beam {} on {}", config.beam, host);

        self.executor
            .execute(host, &RemoteCommand::new(&["mkdir", "-p", &config.log_dir]))?;

        tx.send(LaunchStatus::new(0.0, config.beam, NodeState::Cleaning))?;
        for command in clean_commands(config) {
            self.executor.execute(host, &command)?;
        }
        std::thread::sleep(2 * self.settle);

        self.executor.execute(host, &ringbuffer_command(config))?;
        tx.send(LaunchStatus::new(
            0.25,
            config.beam,
            NodeState::BufferAllocated,
        ))?;
        std::thread::sleep(self.settle);

        for command in reader_commands(config, &self.amber)? {
            self.executor.execute(host, &command)?;
        }
        tx.send(LaunchStatus::new(
            0.5,
            config.beam,
            NodeState::ReadersAttached,
        ))?;
        std::thread::sleep(self.settle);

        self.executor.execute(host, &writer_command(config)?)?;
        tx.send(LaunchStatus::new(
            0.75,
            config.beam,
            NodeState::NetworkCapturing,
        ))?;
        std::thread::sleep(self.settle);

        tx.send(LaunchStatus::new(1.0, config.beam, NodeState::Completed))?;
        log::info!("Beam {} started on {}", config.beam, host);
        Ok(())
    }
}

/// Best-effort teardown of whatever a previous observation left behind.
/// "Nothing to clean" is the common case, so failures are expected and
/// swallowed. Removing the ringbuffer also stops any reader still attached
/// to its key.
fn clean_commands(config: &BeamConfig) -> Vec<RemoteCommand> {
    vec![
        RemoteCommand::new(&["dada_db", "-d", "-k", &config.dadakey]).allow_failure(),
        RemoteCommand::new(&["pkill", "fill_ringbuffer"]).allow_failure(),
        RemoteCommand::new(&["pkill", "amber"]).allow_failure(),
    ]
}

fn ringbuffer_command(config: &BeamConfig) -> RemoteCommand {
    RemoteCommand::new(&[
        "dada_db",
        "-a",
        &DADA_HDR_SIZE.to_string(),
        "-k",
        &config.dadakey,
        "-b",
        &config.buffersize.to_string(),
        "-n",
        &config.nbuffer.to_string(),
        "-p",
        "-r",
        &config.nreader.to_string(),
    ])
    .background()
    .log_to(&beam_log(config, "dada_db"))
}

/// The consumer processes for the requested mode, mkdirs included. The
/// number of background readers here must equal `config.nreader`, or late
/// readers block forever on a full buffer.
fn reader_commands(
    config: &BeamConfig,
    amber: &AmberSettings,
) -> Result<Vec<RemoteCommand>, OrchestratorError> {
    let mode: ObsMode = config.obs_mode.parse()?;
    let mut commands = Vec::new();
    match mode {
        ObsMode::Dump => {
            let dir = format!("{}/dada", config.output_dir);
            commands.push(RemoteCommand::new(&["mkdir", "-p", &dir]));
            commands.push(
                RemoteCommand::new(&["dada_dbdisk", "-k", &config.dadakey, "-D", &dir])
                    .background()
                    .log_to(&beam_log(config, "dada_dbdisk")),
            );
        }
        ObsMode::Scrub => {
            commands.push(
                RemoteCommand::new(&["dada_dbscrubber", "-k", &config.dadakey])
                    .background()
                    .log_to(&beam_log(config, "dada_dbscrubber")),
            );
        }
        ObsMode::Fil => commands.extend(filterbank_commands(config)),
        ObsMode::Fits => commands.extend(fits_commands(config)),
        ObsMode::Amber => commands.extend(amber_commands(config, amber)),
        ObsMode::Survey => {
            commands.extend(amber_commands(config, amber));
            commands.extend(filterbank_commands(config));
            commands.extend(fits_commands(config));
        }
    }
    Ok(commands)
}

fn filterbank_commands(config: &BeamConfig) -> Vec<RemoteCommand> {
    let dir = format!("{}/filterbank", config.output_dir);
    let prefix = format!("{}/CB{:02}", dir, config.beam);
    vec![
        RemoteCommand::new(&["mkdir", "-p", &dir]),
        RemoteCommand::new(&[
            "dadafilterbank",
            "-k",
            &config.dadakey,
            "-n",
            &prefix,
            "-l",
            &beam_log(config, "dadafilterbank"),
        ])
        .background(),
    ]
}

fn fits_commands(config: &BeamConfig) -> Vec<RemoteCommand> {
    let dir = format!("{}/fits/CB{:02}", config.output_dir, config.beam);
    vec![
        RemoteCommand::new(&["mkdir", "-p", &dir]),
        RemoteCommand::new(&[
            "dadafits",
            "-k",
            &config.dadakey,
            "-l",
            &beam_log(config, "dadafits"),
            "-t",
            &config.fits_templates,
            "-d",
            &dir,
        ])
        .background(),
    ]
}

/// One search process per configured GPU instance, each covering its own
/// slice of the DM grid.
fn amber_commands(config: &BeamConfig, amber: &AmberSettings) -> Vec<RemoteCommand> {
    let conf_dir = &config.amber_conf_dir;
    let mut commands = vec![RemoteCommand::new(&["mkdir", "-p", &config.amber_dir])];
    for (ind, instance) in amber.instances.iter().enumerate() {
        let step = ind + 1;
        let output = format!("{}/CB{:02}_step{}", config.amber_dir, config.beam, step);
        commands.push(
            RemoteCommand::new(&[
                "amber",
                "-sync",
                "-print",
                "-opencl_platform",
                &amber.opencl_platform.to_string(),
                "-opencl_device",
                &instance.opencl_device.to_string(),
                "-device_name",
                &amber.device_name,
                "-padding_file",
                &format!("{}/padding.conf", conf_dir),
                "-zapped_channels",
                &format!("{}/zapped_channels.conf", conf_dir),
                "-integration_steps",
                &format!("{}/{}", conf_dir, instance.integration_file),
                "-subband_dedispersion",
                "-dedispersion_stepone_file",
                &format!("{}/dedispersion_stepone.conf", conf_dir),
                "-dedispersion_steptwo_file",
                &format!("{}/dedispersion_steptwo.conf", conf_dir),
                "-integration_file",
                &format!("{}/integration.conf", conf_dir),
                "-snr_file",
                &format!("{}/snr.conf", conf_dir),
                "-subbands",
                &amber.subbands.to_string(),
                "-dms",
                &instance.num_dm.to_string(),
                "-dm_first",
                &instance.dm_first.to_string(),
                "-dm_step",
                &instance.dm_step.to_string(),
                "-threshold",
                &config.snrmin.to_string(),
                "-output",
                &output,
                "-beams",
                &config.ntabs.to_string(),
                "-synthesized_beams",
                &config.nsynbeams.to_string(),
                "-dada",
                "-dada_key",
                &config.dadakey,
                "-batches",
                &config.nbatch.to_string(),
                "-compact_results",
            ])
            .background()
            .log_to(&beam_log(config, &format!("amber_{}", step))),
        );
    }
    commands
}

/// The single writer. In production it captures the network stream from the
/// beamformer; in debug mode it replays previously recorded pages from
/// disk, which only works when the data directory is reachable from here.
fn writer_command(config: &BeamConfig) -> Result<RemoteCommand, OrchestratorError> {
    if config.debug {
        let dada_dir = config.dada_dir.as_deref().unwrap_or_default();
        let mut entries: Vec<String> = std::fs::read_dir(dada_dir)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path().to_string_lossy().into_owned())
            .collect();
        entries.sort();
        let mut argv = vec![
            "dada_diskdb".to_string(),
            "-k".to_string(),
            config.dadakey.clone(),
        ];
        for entry in entries {
            argv.push("-f".to_string());
            argv.push(entry);
        }
        return Ok(RemoteCommand::from_argv(argv)
            .background()
            .log_to(&beam_log(config, "dada_diskdb")));
    }

    Ok(RemoteCommand::new(&[
        "fill_ringbuffer",
        "-h",
        &config.header,
        "-c",
        &config.science_case.to_string(),
        "-m",
        &config.fill_mode.to_string(),
        "-b",
        &config.pagesize.to_string(),
        "-k",
        &config.dadakey,
        "-s",
        &config.startpacket.to_string(),
        "-d",
        &config.duration_sec.to_string(),
        "-p",
        &config.network_port.to_string(),
        "-l",
        &beam_log(config, "fill_ringbuffer"),
    ])
    .background())
}

fn beam_log(config: &BeamConfig, name: &str) -> String {
    format!("{}/{}.{:02}", config.log_dir, name, config.beam)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::beam_config::sample_config;
    use crate::error::RemoteError;
    use std::sync::mpsc::channel;
    use std::sync::Mutex;

    /// Records every dispatched command instead of running it.
    #[derive(Default)]
    struct RecordingExecutor {
        calls: Mutex<Vec<(String, String)>>,
        unreachable: Option<String>,
    }

    impl RecordingExecutor {
        fn refusing(host: &str) -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                unreachable: Some(host.to_string()),
            }
        }

        fn lines(&self) -> Vec<String> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .map(|(_, line)| line.clone())
                .collect()
        }
    }

    impl RemoteExecutor for RecordingExecutor {
        fn execute(&self, host: &str, command: &RemoteCommand) -> Result<(), RemoteError> {
            if self.unreachable.as_deref() == Some(host) {
                return Err(RemoteError::NodeUnreachable(host.to_string()));
            }
            self.calls
                .lock()
                .unwrap()
                .push((host.to_string(), command.shell_line()));
            Ok(())
        }

        fn capture(&self, host: &str, command: &RemoteCommand) -> Result<String, RemoteError> {
            self.execute(host, command)?;
            Ok(String::new())
        }
    }

    fn orchestrator(executor: &RecordingExecutor) -> Orchestrator<'_> {
        Orchestrator::new(executor, &crate::config::Settings::default())
            .with_settle(Duration::ZERO)
    }

    fn index_of(lines: &[String], needle: &str) -> usize {
        lines
            .iter()
            .position(|line| line.contains(needle))
            .unwrap_or_else(|| panic!("no command matching {:?}", needle))
    }

    #[test]
    fn test_stage_ordering() {
        let executor = RecordingExecutor::default();
        let (tx, _rx) = channel();
        let config = sample_config(21);
        orchestrator(&executor).launch_beam(&config, &tx).unwrap();

        let lines = executor.lines();
        let clean = index_of(&lines, "dada_db -d");
        let buffer = index_of(&lines, "dada_db -a");
        let search = index_of(&lines, "amber -sync");
        let filterbank = index_of(&lines, "dadafilterbank");
        let fits = index_of(&lines, "dadafits");
        let writer = index_of(&lines, "fill_ringbuffer");
        assert!(clean < buffer);
        assert!(buffer < search);
        assert!(search < writer);
        assert!(filterbank < writer);
        assert!(fits < writer);
    }

    #[test]
    fn test_survey_reader_count_matches_config() {
        let settings = crate::config::Settings::default();
        let config = sample_config(21);
        let commands = reader_commands(&config, &settings.amber).unwrap();
        let readers = commands.iter().filter(|c| c.is_background()).count();
        assert_eq!(readers, config.nreader);
    }

    #[test]
    fn test_writer_carries_start_packet() {
        let config = sample_config(21);
        let writer = writer_command(&config).unwrap();
        assert!(writer.shell_line().contains("-s 800000"));
        assert!(writer.is_background());
    }

    #[test]
    fn test_unreachable_node_abandons_beam_only() {
        // beam 20 lives on arts021, which refuses connections here
        let executor = RecordingExecutor::refusing("arts021");
        let (tx, rx) = channel();
        let configs = vec![sample_config(20), sample_config(21)];
        let states = orchestrator(&executor).launch_all(configs.iter(), &tx);

        assert_eq!(states, vec![(20, NodeState::Failed), (21, NodeState::Completed)]);
        // the surviving beam went through the full sequence
        let lines = executor.lines();
        assert!(lines.iter().any(|line| line.contains("fill_ringbuffer")));
        drop(tx);
        let last: Vec<LaunchStatus> = rx.iter().collect();
        assert!(last
            .iter()
            .any(|s| s.beam == 20 && s.state == NodeState::Failed));
        assert!(last
            .iter()
            .any(|s| s.beam == 21 && s.state == NodeState::Completed));
    }

    #[test]
    fn test_clean_is_idempotent_by_construction() {
        for command in clean_commands(&sample_config(0)) {
            // teardown must tolerate "nothing to clean"
            assert!(command.shell_line().contains("2> /dev/null"));
        }
    }
}
