//! Deferred end-of-observation actions.
//!
//! Aggregation, completion verification and archive ingest all fire at the
//! computed end time of the observation, independent of the orchestration
//! that started it and independent of each other: one action failing must
//! not keep another from running. Each action gets its own thread that
//! sleeps until the end time and then runs once.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use time::OffsetDateTime;

use super::beam_config::BeamConfig;
use super::compiler::CompiledObservation;
use super::config::Settings;
use super::constants::CENTRAL_BEAM;
use super::error::{LifecycleError, RemoteError};
use super::remote::{LocalExecutor, RemoteCommand, RemoteExecutor};
use super::retry::{poll_until, Poll, PollOutcome};

/// Delay between the writer exiting and the follow-up touching its output.
const POST_OBS_GRACE: Duration = Duration::from_secs(10);
const CHECK_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeferredAction {
    /// Collect the per-beam candidate summaries and hand them to the
    /// notifier.
    TriggerAggregation,
    /// Verify every beam produced its data product, update task status.
    CompletionCheck,
    /// Register the data products with the archive.
    ArchiveIngest,
    /// Fold the test pulsar on the central beam.
    PulsarFold,
}

/// Snapshot of the observation shared by the action threads.
struct ObsShared {
    end_utc: OffsetDateTime,
    master_dir: PathBuf,
    beams: Vec<BeamConfig>,
}

pub struct LifecycleTracker {
    executor: Arc<dyn RemoteExecutor>,
    settings: Settings,
}

impl LifecycleTracker {
    pub fn new(executor: Arc<dyn RemoteExecutor>, settings: &Settings) -> Self {
        Self {
            executor,
            settings: settings.clone(),
        }
    }

    /// Schedule actions to run at the observation's end time. Returns the
    /// handles; the caller may join them or let them run to completion on
    /// their own.
    pub fn schedule_deferred(
        &self,
        compiled: &CompiledObservation,
        actions: &[DeferredAction],
    ) -> Vec<JoinHandle<()>> {
        let shared = Arc::new(ObsShared {
            end_utc: compiled.end_utc,
            master_dir: compiled.master_dir.clone(),
            beams: compiled.beams.values().cloned().collect(),
        });

        actions
            .iter()
            .map(|&action| {
                let shared = Arc::clone(&shared);
                let executor = Arc::clone(&self.executor);
                let settings = self.settings.clone();
                std::thread::spawn(move || {
                    sleep_until(shared.end_utc);
                    std::thread::sleep(POST_OBS_GRACE);
                    log::info!("Running deferred action {:?}", action);
                    let result = run_action(action, &shared, executor.as_ref(), &settings);
                    match result {
                        Ok(()) => log::info!("Deferred action {:?} done", action),
                        Err(e) => log::error!("Deferred action {:?} failed: {}", action, e),
                    }
                })
            })
            .collect()
    }
}

fn run_action(
    action: DeferredAction,
    shared: &ObsShared,
    executor: &dyn RemoteExecutor,
    settings: &Settings,
) -> Result<(), LifecycleError> {
    match action {
        DeferredAction::TriggerAggregation => aggregate_triggers(shared, settings),
        DeferredAction::CompletionCheck => check_completion(shared, executor, settings),
        DeferredAction::ArchiveIngest => ingest_dataproducts(shared, executor, settings),
        DeferredAction::PulsarFold => fold_pulsar(shared, executor, settings),
    }
}

/// Wait for the per-beam summary files to land in the master directory.
/// Returns the beams whose summary never appeared.
pub fn wait_for_summaries(
    master_dir: &Path,
    beams: &[usize],
    interval: Duration,
    timeout: Duration,
) -> Vec<usize> {
    let outcome: PollOutcome<(), LifecycleError> = poll_until(interval, timeout, || {
        let missing = missing_summaries(master_dir, beams);
        if missing.is_empty() {
            Ok(Poll::Ready(()))
        } else {
            log::info!(
                "Received {} out of {} beam summaries",
                beams.len() - missing.len(),
                beams.len()
            );
            Ok(Poll::NotReady)
        }
    });
    match outcome {
        PollOutcome::Ready(()) => Vec::new(),
        _ => missing_summaries(master_dir, beams),
    }
}

fn missing_summaries(master_dir: &Path, beams: &[usize]) -> Vec<usize> {
    beams
        .iter()
        .copied()
        .filter(|beam| !master_dir.join(format!("CB{:02}_summary.yaml", beam)).exists())
        .collect()
}

fn aggregate_triggers(shared: &ObsShared, settings: &Settings) -> Result<(), LifecycleError> {
    let beams: Vec<usize> = shared.beams.iter().map(|b| b.beam).collect();
    let missing = wait_for_summaries(
        &shared.master_dir,
        &beams,
        CHECK_INTERVAL,
        Duration::from_secs(settings.general.aggregation_timeout_sec),
    );
    if !missing.is_empty() {
        log::warn!(
            "No summary from beams {:?}, aggregating what is there",
            missing
        );
    }

    let beam_list = beams
        .iter()
        .map(|b| b.to_string())
        .collect::<Vec<_>>()
        .join(",");
    let ntabs = shared.beams.first().map(|b| b.ntabs).unwrap_or(1);
    let master_dir = shared.master_dir.to_string_lossy();
    LocalExecutor.execute(
        "master",
        &RemoteCommand::new(&[
            &settings.general.notify_cmd,
            &master_dir,
            &beam_list,
            &ntabs.to_string(),
        ]),
    )?;
    Ok(())
}

/// Poll each node for its data product until every beam is ready or the
/// timeout passes. An unreachable node counts as not-yet-ready; after the
/// timeout whatever is missing is reported instead of waited on forever.
fn check_completion(
    shared: &ObsShared,
    executor: &dyn RemoteExecutor,
    settings: &Settings,
) -> Result<(), LifecycleError> {
    let mut pending: Vec<&BeamConfig> = shared.beams.iter().collect();
    let timeout = Duration::from_secs(settings.general.completion_timeout_sec);

    let outcome: PollOutcome<(), LifecycleError> = poll_until(CHECK_INTERVAL, timeout, || {
        pending.retain(|config| !beam_ready(executor, config));
        if pending.is_empty() {
            Ok(Poll::Ready(()))
        } else {
            Ok(Poll::NotReady)
        }
    });

    let missing: Vec<usize> = pending.iter().map(|c| c.beam).collect();

    // Update the task status regardless; the archive keeps its own bookkeeping.
    if let Some(taskid) = shared.beams.first().and_then(|b| b.taskid.as_deref()) {
        LocalExecutor.execute(
            "master",
            &RemoteCommand::new(&[
                &settings.general.atdb_service,
                "-o",
                "change_status",
                "--resource",
                "observations",
                "--search_key",
                &format!("taskid:{}", taskid),
                "--status",
                "completing",
            ]),
        )?;
    }

    match outcome {
        PollOutcome::Ready(()) => {
            log::info!("All beams completed");
            Ok(())
        }
        _ => Err(LifecycleError::Incomplete(missing)),
    }
}

fn beam_ready(executor: &dyn RemoteExecutor, config: &BeamConfig) -> bool {
    let pattern = format!("{}/fits/CB{:02}/*.fits", config.output_dir, config.beam);
    let probe = RemoteCommand::new(&["ls", &pattern]);
    match executor.capture(&config.hostname, &probe) {
        Ok(_) => {
            log::info!("{} ready", config.hostname);
            true
        }
        Err(RemoteError::NodeUnreachable(host)) => {
            log::warn!("Failed to connect to {}", host);
            false
        }
        Err(_) => {
            log::info!("{} not ready", config.hostname);
            false
        }
    }
}

/// Register each beam's FITS output with the archive. IAB observations have
/// one data product per beam, TAB observations one per tied-array beam.
fn ingest_dataproducts(
    shared: &ObsShared,
    executor: &dyn RemoteExecutor,
    settings: &Settings,
) -> Result<(), LifecycleError> {
    for config in &shared.beams {
        let taskid = match config.taskid.as_deref() {
            Some(id) => id,
            None => continue,
        };
        let fits_dir = format!("{}/fits/CB{:02}", config.output_dir, config.beam);
        let products: Vec<(String, String)> = if config.ntabs == 1 {
            vec![(
                format!("{}/tabA.fits", fits_dir),
                format!("ARTS{}_CB{:02}.fits", taskid, config.beam),
            )]
        } else {
            (1..=config.ntabs)
                .map(|tab| {
                    let letter = (b'A' + tab as u8 - 1) as char;
                    (
                        format!("{}/tab{}.fits", fits_dir, letter),
                        format!("ARTS{}_CB{:02}_TAB{:02}.fits", taskid, config.beam, tab),
                    )
                })
                .collect()
        };

        for (tab_file, product) in products {
            let link = format!("{}/{}", fits_dir, product);
            let result = executor
                .execute(
                    &config.hostname,
                    &RemoteCommand::new(&["ln", "-s", &tab_file, &link]).allow_failure(),
                )
                .and_then(|()| {
                    executor.execute(
                        &config.hostname,
                        &RemoteCommand::new(&[
                            &settings.general.atdb_service,
                            "-o",
                            "add_dataproduct",
                            "--taskid",
                            taskid,
                            "--node",
                            &config.hostname,
                            "--data_dir",
                            &fits_dir,
                            "--filename",
                            &product,
                        ]),
                    )
                });
            // a node that lost its product should not block the others
            if let Err(e) = result {
                log::error!(
                    "Could not ingest {} from {}: {}",
                    product,
                    config.hostname,
                    e
                );
            }
        }
    }
    Ok(())
}

fn fold_pulsar(
    shared: &ObsShared,
    executor: &dyn RemoteExecutor,
    settings: &Settings,
) -> Result<(), LifecycleError> {
    let central = match shared.beams.iter().find(|b| b.beam == CENTRAL_BEAM) {
        Some(config) => config,
        None => {
            log::warn!(
                "Pulsar fold requested but central beam {} not observed",
                CENTRAL_BEAM
            );
            return Ok(());
        }
    };
    executor.execute(
        &central.hostname,
        &RemoteCommand::new(&[
            &settings.general.fold_cmd,
            "--obs_dir",
            &central.output_dir,
        ])
        .background(),
    )?;
    Ok(())
}

fn sleep_until(t: OffsetDateTime) {
    let remaining = (t - OffsetDateTime::now_utc()).as_seconds_f64();
    if remaining > 0.0 {
        std::thread::sleep(Duration::from_secs_f64(remaining));
    }
}
