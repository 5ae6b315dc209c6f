//! Cluster and instrument settings.
//!
//! Everything that used to live in shared dotfiles on the master node is
//! collected here in one typed document, constructed once at process start
//! and handed to the components that need it. Settings are serializable and
//! deserializable to YAML using serde and serde_yaml; a default document is
//! bundled with the library.

use serde::{Deserialize, Serialize};
use std::path::Path;

use super::error::ConfigError;
use super::observation::{ScienceCase, ScienceMode};

/// Load the default settings for windows
#[cfg(target_family = "windows")]
fn load_default_settings() -> &'static str {
    include_str!("data\\default_settings.yaml")
}

/// Load the default settings for macos and linux
#[cfg(target_family = "unix")]
fn load_default_settings() -> &'static str {
    include_str!("data/default_settings.yaml")
}

/// Cluster-wide paths, hosts and timing knobs.
///
/// Directory fields are templates; `{date}` and `{datetimesource}` are
/// filled in per observation with [`render_template`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct General {
    pub timing_host: String,
    pub timing_port: u16,
    pub node_prefix: String,
    pub output_dir: String,
    pub master_dir: String,
    pub log_dir: String,
    pub header_dir: String,
    pub amber_dir: String,
    pub amber_conf_dir: String,
    pub fits_templates: String,
    pub filterbank_cmds: String,
    pub notify_cmd: String,
    pub fold_cmd: String,
    pub atdb_service: String,
    pub dump_host: String,
    pub dump_port: u16,
    pub dadakey_base: u32,
    pub settle_sec: f64,
    pub ssh_timeout_sec: u32,
    pub completion_timeout_sec: u64,
    pub aggregation_timeout_sec: u64,
    pub start_lead_sec: i64,
}

/// Candidate filter defaults for the trigger watcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerSettings {
    pub interval_sec: f64,
    pub snrmin: f64,
    pub dm_min: f64,
    pub dm_max: f64,
    pub max_age_sec: f64,
    pub window_sec: f64,
}

/// One dedispersion search instance (one GPU worth of DM trials).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AmberInstance {
    pub opencl_device: u32,
    pub dm_first: f64,
    pub dm_step: f64,
    pub num_dm: u32,
    pub integration_file: String,
}

/// Search engine settings shared by all beams.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AmberSettings {
    pub opencl_platform: u32,
    pub device_name: String,
    pub subbands: u32,
    pub instances: Vec<AmberInstance>,
}

/// One science case: a fixed hardware/bandwidth profile of the instrument.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaseProfile {
    pub nbit: u32,
    pub nchan: usize,
    pub nbeams: usize,
    pub missing_beams: Vec<usize>,
    pub nbuffer: usize,
    pub valid_modes: Vec<String>,
    pub network_port_start: u16,
    /// Packet counter ticks per second.
    pub time_unit: u64,
    pub tsamp: f64,
    /// Samples per ringbuffer page; one page spans 1.024 s.
    pub pagesize: usize,
    pub freq: f64,
    pub bw: f64,
}

/// One science mode: the polarization/beamforming profile.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModeProfile {
    pub ntabs: usize,
    pub nsynbeams: usize,
    /// Mode number passed to the network capture process.
    pub fill_mode: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub general: General,
    pub trigger: TriggerSettings,
    pub amber: AmberSettings,
    sc3: CaseProfile,
    sc4: CaseProfile,
    #[serde(rename = "i+tab")]
    i_tab: ModeProfile,
    #[serde(rename = "i+iab")]
    i_iab: ModeProfile,
    #[serde(rename = "iquv+tab")]
    iquv_tab: ModeProfile,
    #[serde(rename = "iquv+iab")]
    iquv_iab: ModeProfile,
}

impl Default for Settings {
    /// The settings bundled with the library.
    fn default() -> Self {
        // the bundled document must parse, or the library is unusable
        serde_yaml::from_str(load_default_settings()).expect("bundled default settings are invalid")
    }
}

impl Settings {
    /// Read settings from a YAML file.
    /// If the path is None, the bundled defaults are used.
    pub fn read_config_file(config_path: Option<&Path>) -> Result<Self, ConfigError> {
        let settings: Settings = match config_path {
            Some(path) => {
                if !path.exists() {
                    return Err(ConfigError::BadFilePath(path.to_path_buf()));
                }
                let yaml_str = std::fs::read_to_string(path)?;
                serde_yaml::from_str(&yaml_str)?
            }
            None => serde_yaml::from_str(load_default_settings())?,
        };
        settings.check()?;
        Ok(settings)
    }

    /// Write a template settings file for operators to edit.
    pub fn write_template(path: &Path) -> Result<(), ConfigError> {
        std::fs::write(path, load_default_settings())?;
        Ok(())
    }

    pub fn case(&self, sc: ScienceCase) -> &CaseProfile {
        match sc {
            ScienceCase::Sc3 => &self.sc3,
            ScienceCase::Sc4 => &self.sc4,
        }
    }

    pub fn mode(&self, mode: ScienceMode) -> &ModeProfile {
        match mode {
            ScienceMode::ITab => &self.i_tab,
            ScienceMode::IIab => &self.i_iab,
            ScienceMode::IquvTab => &self.iquv_tab,
            ScienceMode::IquvIab => &self.iquv_iab,
        }
    }

    /// Hostname of the node that owns a compound beam. Node numbering is
    /// one-based: arts001 owns CB00.
    pub fn node_of_beam(&self, beam: usize) -> String {
        format!("{}{:02}", self.general.node_prefix, beam + 1)
    }

    fn check(&self) -> Result<(), ConfigError> {
        for (name, case) in [("sc3", &self.sc3), ("sc4", &self.sc4)] {
            // a ringbuffer page must span exactly one alignment window
            let page_sec = case.tsamp * case.pagesize as f64;
            if (page_sec - super::constants::ALIGNMENT_SEC).abs() > 1e-9 {
                return Err(ConfigError::BadValue(format!(
                    "{}: tsamp * pagesize is {} s, expected 1.024 s",
                    name, page_sec
                )));
            }
            if case.time_unit * 128 % 125 != 0 {
                return Err(ConfigError::BadValue(format!(
                    "{}: time_unit {} does not give whole ticks per 1.024 s",
                    name, case.time_unit
                )));
            }
        }
        if self.amber.instances.is_empty() {
            return Err(ConfigError::BadValue(
                "amber needs at least one instance".to_string(),
            ));
        }
        Ok(())
    }
}

/// Fill in the `{date}` and `{datetimesource}` fields of a path template.
pub fn render_template(template: &str, date: &str, datetimesource: &str) -> String {
    template
        .replace("{date}", date)
        .replace("{datetimesource}", datetimesource)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bundled_defaults_parse() {
        let settings = Settings::default();
        assert_eq!(settings.case(ScienceCase::Sc4).nchan, 1536);
        assert_eq!(settings.case(ScienceCase::Sc4).time_unit, 781250);
        assert_eq!(settings.mode(ScienceMode::IIab).ntabs, 1);
        assert_eq!(settings.mode(ScienceMode::ITab).ntabs, 12);
    }

    #[test]
    fn test_node_numbering() {
        let settings = Settings::default();
        assert_eq!(settings.node_of_beam(0), "arts001");
        assert_eq!(settings.node_of_beam(21), "arts022");
    }

    #[test]
    fn test_template_render() {
        let rendered = render_template(
            "/data2/output/{date}/{datetimesource}",
            "20190302",
            "2019.03.02-13:37:00.B0531+21",
        );
        assert_eq!(
            rendered,
            "/data2/output/20190302/2019.03.02-13:37:00.B0531+21"
        );
    }

    #[test]
    fn test_missing_file_rejected() {
        let path = Path::new("/definitely/not/a/settings.yaml");
        match Settings::read_config_file(Some(path)) {
            Err(ConfigError::BadFilePath(_)) => (),
            _ => panic!(),
        }
    }
}
