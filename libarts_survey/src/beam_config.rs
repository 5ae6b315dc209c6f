//! The per-beam configuration record.
//!
//! One of these is compiled per selected beam and written to the master
//! directory as `CBnn.yaml`. It carries every value the worker node needs;
//! nodes never read global settings, so a settings change mid-observation
//! cannot produce a half-updated cluster.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use super::error::ConfigError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BeamConfig {
    /// Compound beam index.
    pub beam: usize,
    /// Node expected to run this beam; node-side tooling warns on mismatch.
    pub hostname: String,

    pub science_case: u32,
    /// Mode number handed to the network capture process.
    pub fill_mode: u32,
    pub obs_mode: String,
    pub ntabs: usize,
    pub nsynbeams: usize,

    pub nbit: u32,
    pub nchan: usize,
    pub pagesize: usize,
    pub buffersize: usize,
    pub nbuffer: usize,
    pub nreader: usize,
    /// Ringbuffer key, lowercase hex.
    pub dadakey: String,
    pub network_port: u16,

    pub startpacket: u64,
    pub startutc: String,
    pub startmjd: f64,
    pub duration_sec: f64,
    pub nbatch: usize,

    pub tsamp: f64,
    pub freq: f64,
    pub bw: f64,
    pub chan_width: f64,
    pub min_freq: f64,

    pub source: String,
    /// Beam sky position, sexagesimal.
    pub ra: String,
    pub dec: String,

    pub date: String,
    pub datetimesource: String,
    pub output_dir: String,
    pub log_dir: String,
    pub master_dir: String,
    pub amber_dir: String,
    pub amber_conf_dir: String,
    pub fits_templates: String,
    /// Path of this beam's raw-data header file.
    pub header: String,

    pub snrmin: f64,
    pub dm_min: f64,
    pub dm_max: f64,

    pub proctrigger: bool,
    pub debug: bool,
    pub dada_dir: Option<String>,
    pub atdb: bool,
    pub taskid: Option<String>,
}

impl BeamConfig {
    /// The file this record is persisted to, under the master directory.
    pub fn file_name(beam: usize) -> String {
        format!("CB{:02}.yaml", beam)
    }

    pub fn write(&self, master_dir: &Path) -> Result<PathBuf, ConfigError> {
        let path = master_dir.join(Self::file_name(self.beam));
        let yaml_str = serde_yaml::to_string(self)?;
        std::fs::write(&path, yaml_str)?;
        Ok(path)
    }

    /// Read a record back, as done by node-side tooling.
    pub fn read(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::BadFilePath(path.to_path_buf()));
        }
        let yaml_str = std::fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&yaml_str)?)
    }
}

/// A filled-in record for unit tests elsewhere in the crate.
#[cfg(test)]
pub(crate) fn sample_config(beam: usize) -> BeamConfig {
    BeamConfig {
        beam,
        hostname: format!("arts0{:02}", beam + 1),
        science_case: 4,
        fill_mode: 2,
        obs_mode: "survey".to_string(),
        ntabs: 1,
        nsynbeams: 1,
        nbit: 8,
        nchan: 1536,
        pagesize: 25000,
        buffersize: 38_400_000,
        nbuffer: 5,
        nreader: 4,
        dadakey: "dada".to_string(),
        network_port: 5000 + beam as u16,
        startpacket: 800000,
        startutc: "2019-03-02 13:37:00".to_string(),
        startmjd: 58544.567361,
        duration_sec: 10.24,
        nbatch: 10,
        tsamp: 4.096e-5,
        freq: 1400.0,
        bw: 300.0,
        chan_width: 300.0 / 1536.0,
        min_freq: 1250.097656,
        source: "B0531+21".to_string(),
        ra: "05:34:30.000".to_string(),
        dec: "22:00:52.000".to_string(),
        date: "20190302".to_string(),
        datetimesource: "2019.03.02-13:37:00.B0531+21".to_string(),
        output_dir: "/tmp/output".to_string(),
        log_dir: "/tmp/log".to_string(),
        master_dir: "/tmp/master".to_string(),
        amber_dir: "/tmp/amber".to_string(),
        amber_conf_dir: "/tmp/amber_conf".to_string(),
        fits_templates: "/tmp/templates".to_string(),
        header: "/tmp/header/CB21.txt".to_string(),
        snrmin: 10.0,
        dm_min: 20.0,
        dm_max: 5000.0,
        proctrigger: false,
        debug: false,
        dada_dir: None,
        atdb: false,
        taskid: None,
    }
}
