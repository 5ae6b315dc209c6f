use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum CoordError {
    #[error("Could not parse right ascension {0}; expected hh:mm:ss.s")]
    BadRightAscension(String),
    #[error("Could not parse declination {0}; expected dd:mm:ss.s")]
    BadDeclination(String),
    #[error("Coordinate field failed to parse as a number: {0}")]
    ParsingError(#[from] std::num::ParseFloatError),
}

#[derive(Debug, Error)]
pub enum OffsetTableError {
    #[error("Could not load beam offset table because file {0:?} does not exist")]
    BadFilePath(PathBuf),
    #[error("Beam offset table failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Beam offset table was given a file with the incorrect format; most likely the number of columns is incorrect")]
    BadFileFormat,
    #[error("Beam offset table failed to parse a beam index: {0}")]
    BadBeamIndex(#[from] std::num::ParseIntError),
    #[error("Beam offset table failed to parse an offset: {0}")]
    BadOffset(#[from] std::num::ParseFloatError),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load settings as file {0:?} does not exist")]
    BadFilePath(PathBuf),
    #[error("Settings failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Settings failed to parse YAML: {0}")]
    ParsingError(#[from] serde_yaml::Error),
    #[error("Settings are inconsistent: {0}")]
    BadValue(String),
}

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Unknown science case: {0}; supported cases are 3 and 4")]
    UnknownScienceCase(String),
    #[error("Unknown science mode: {0}; valid modes are I+TAB, IQUV+TAB, I+IAB, IQUV+IAB")]
    UnknownScienceMode(String),
    #[error("Unknown observation mode: {0}; valid modes are dump, scrub, fil, fits, amber, survey")]
    UnknownObsMode(String),
    #[error("Science mode {mode} is not supported for science case {case}")]
    UnsupportedMode { mode: String, case: String },
    #[error("Beam {beam} is outside the valid range 0..{nbeams}")]
    BadBeamIndex { beam: usize, nbeams: usize },
    #[error("Could not parse beam list entry: {0}")]
    BadBeamList(String),
    #[error("No beams left to observe after removing missing beams")]
    EmptyBeamSelection,
    #[error("Could not parse start time {0}; expected yyyy-mm-dd hh:mm:ss")]
    BadStartTime(String),
    #[error("Observation duration must be positive, got {0}")]
    BadDuration(f64),
    #[error("Debug mode requires a data directory with recorded pages")]
    MissingDataDir,
    #[error("Archive ingest requires a task ID")]
    MissingTaskId,
    #[error("Bad boresight coordinate: {0}")]
    BadCoordinate(#[from] CoordError),
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Timing server unreachable: {0}")]
    Unreachable(#[from] std::io::Error),
    #[error("Timing server sent an unparseable reply: {0}")]
    BadReply(String),
    #[error("Requested start time {requested} predates the synchronization point {sync}")]
    StartBeforeSync { requested: String, sync: String },
    #[error("Time unit {0} does not divide the 1.024 s alignment window into whole ticks")]
    BadTimeUnit(u64),
}

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("Failed to spawn remote command on {host}: {source}")]
    SpawnFailed {
        host: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Node {0} is unreachable")]
    NodeUnreachable(String),
    #[error("Remote command on {host} exited with status {code}")]
    CommandFailed { host: String, code: i32 },
}

#[derive(Debug, Error)]
pub enum CompilerError {
    #[error("Compiler rejected the observation request: {0}")]
    Validation(#[from] ValidationError),
    #[error("Compiler failed to obtain a start packet: {0}")]
    Sync(#[from] SyncError),
    #[error("Compiler failed due to settings error: {0}")]
    Config(#[from] ConfigError),
    #[error("Compiler failed due to beam offset table error: {0}")]
    Offsets(#[from] OffsetTableError),
    #[error("Compiler failed to serialize a beam configuration: {0}")]
    Serialize(#[from] serde_yaml::Error),
    #[error("Compiler failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Orchestrator failed due to remote error: {0}")]
    Remote(#[from] RemoteError),
    #[error("Orchestrator was given an invalid beam configuration: {0}")]
    BadConfig(#[from] ValidationError),
    #[error("Orchestrator failed due to Send error: {0}")]
    SendError(#[from] std::sync::mpsc::SendError<crate::launch_status::LaunchStatus>),
    #[error("Orchestrator failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("Deferred action failed due to remote error: {0}")]
    Remote(#[from] RemoteError),
    #[error("Deferred action failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Observation incomplete on beams {0:?}")]
    Incomplete(Vec<usize>),
}

#[derive(Debug, Error)]
pub enum TriggerError {
    #[error("Trigger watcher failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Could not parse candidate row: {0}")]
    BadCandidate(String),
    #[error("Failed to deliver dump request: {0}")]
    DeliveryFailed(std::io::Error),
}

#[derive(Debug, Error)]
pub enum ObservationError {
    #[error("Observation failed due to compiler error: {0}")]
    Compiler(#[from] CompilerError),
    #[error("Observation failed due to orchestrator error: {0}")]
    Orchestrator(#[from] OrchestratorError),
    #[error("Observation failed due to lifecycle error: {0}")]
    Lifecycle(#[from] LifecycleError),
    #[error("Observation failed due to settings error: {0}")]
    Config(#[from] ConfigError),
    #[error("Observation failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
}
