//! # arts_survey
//!
//! arts_survey is the observation control system for the ARTS FRB search on
//! the Apertif/WSRT cluster, written in Rust. From a single command on the
//! master node it computes the observation parameters, compiles one
//! configuration record per compound beam, and walks every worker node
//! through its startup sequence (ringbuffer, readers, network capture) so
//! that ~40 machines begin sampling on the same packet counter tick.
//!
//! ## Installation
//!
//! Install from source with `cargo install --path ./arts_survey_cli` from
//! the top level arts_survey repository. The binary ends up in your cargo
//! install location (typically `~/.cargo/bin/`) and is invoked as
//! `arts_survey_cli`.
//!
//! The signal-processing programs themselves (the PSRDADA tools, the
//! network capture process, the dedispersion search, the filterbank and
//! FITS converters) are not part of this crate; they must be installed on
//! the worker nodes and reachable through `PATH`. The master node reaches
//! the workers over passwordless ssh.
//!
//! ## Configuration
//!
//! Cluster settings (hosts, paths, science case profiles, search engine
//! tuning) live in one YAML document. A default is bundled; write an
//! editable copy with the `new` subcommand and pass it back with
//! `--settings`. Science case profiles describe the instrument
//! configuration (channel count, bandwidth, packet rate); observing mode
//! profiles describe the polarization/beamforming setup. Per observation,
//! everything else is given on the command line:
//!
//! ```bash
//! arts_survey_cli start --source B0531+21 --ra 05:34:30 --dec 22:00:52 \
//!     --duration 300 --beams 20,21,22 --science-case 4 \
//!     --science-mode I+IAB --obs-mode survey
//! ```
//!
//! Either `--beams` with an explicit list or `--sbeam`/`--ebeam` with a
//! range selects the compound beams; beams on the permanent missing list
//! are removed automatically. The observation starts at the next 1.024 s
//! boundary after the requested time, as dictated by the packet counter of
//! the central timing hardware; if the timing server cannot be reached the
//! observation is aborted rather than started on a guessed epoch.
//!
//! ## Output
//!
//! Per observation the master writes one `CBnn.yaml` configuration per
//! beam, one raw-data header per beam, a `coordinates.txt` with the beam
//! positions and an `info.yaml` summary, all under a dated master
//! directory. Worker nodes write their data products under their local
//! output directories; logs of every launched process go to the dated log
//! directory. A controller log of the master itself is written next to the
//! terminal output.
pub mod beam_config;
pub mod beam_offsets;
pub mod compiler;
pub mod config;
pub mod constants;
pub mod coordinates;
pub mod dada_header;
pub mod error;
pub mod launch_status;
pub mod lifecycle;
pub mod observation;
pub mod orchestrator;
pub mod remote;
pub mod retry;
pub mod start_packet;
pub mod timestamps;
pub mod trigger_watcher;
