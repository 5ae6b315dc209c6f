//! The observation request as handed to the master node.
//!
//! A request is immutable once built; everything derived from it lives in
//! the per-beam configurations produced by the compiler.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use bit_set::BitSet;
use time::OffsetDateTime;

use super::config::CaseProfile;
use super::coordinates::SkyCoord;
use super::error::ValidationError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScienceCase {
    Sc3,
    Sc4,
}

impl FromStr for ScienceCase {
    type Err = ValidationError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "3" => Ok(Self::Sc3),
            "4" => Ok(Self::Sc4),
            other => Err(ValidationError::UnknownScienceCase(other.to_string())),
        }
    }
}

impl fmt::Display for ScienceCase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sc3 => write!(f, "sc3"),
            Self::Sc4 => write!(f, "sc4"),
        }
    }
}

impl ScienceCase {
    /// The numeric case id used on external command lines.
    pub fn number(&self) -> u32 {
        match self {
            Self::Sc3 => 3,
            Self::Sc4 => 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScienceMode {
    ITab,
    IquvTab,
    IIab,
    IquvIab,
}

impl FromStr for ScienceMode {
    type Err = ValidationError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "i+tab" => Ok(Self::ITab),
            "iquv+tab" => Ok(Self::IquvTab),
            "i+iab" => Ok(Self::IIab),
            "iquv+iab" => Ok(Self::IquvIab),
            other => Err(ValidationError::UnknownScienceMode(other.to_string())),
        }
    }
}

impl fmt::Display for ScienceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ITab => write!(f, "I+TAB"),
            Self::IquvTab => write!(f, "IQUV+TAB"),
            Self::IIab => write!(f, "I+IAB"),
            Self::IquvIab => write!(f, "IQUV+IAB"),
        }
    }
}

impl ScienceMode {
    /// Number of polarization products this mode records.
    pub fn npol(&self) -> usize {
        match self {
            Self::ITab | Self::IIab => 1,
            Self::IquvTab | Self::IquvIab => 4,
        }
    }
}

/// What consumes the ringbuffer on each node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObsMode {
    /// Write raw pages to disk.
    Dump,
    /// Read and discard, for network tests.
    Scrub,
    /// Filterbank conversion.
    Fil,
    /// FITS conversion.
    Fits,
    /// Dedispersion search only.
    Amber,
    /// The full survey set: search, filterbank and FITS.
    Survey,
}

impl FromStr for ObsMode {
    type Err = ValidationError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "dump" => Ok(Self::Dump),
            "scrub" => Ok(Self::Scrub),
            "fil" => Ok(Self::Fil),
            "fits" => Ok(Self::Fits),
            "amber" => Ok(Self::Amber),
            "survey" => Ok(Self::Survey),
            other => Err(ValidationError::UnknownObsMode(other.to_string())),
        }
    }
}

impl fmt::Display for ObsMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Dump => "dump",
            Self::Scrub => "scrub",
            Self::Fil => "fil",
            Self::Fits => "fits",
            Self::Amber => "amber",
            Self::Survey => "survey",
        };
        write!(f, "{}", name)
    }
}

impl ObsMode {
    /// Number of ringbuffer readers this mode attaches. The buffer must be
    /// created with exactly this count or readers block forever.
    pub fn nreaders(&self, amber_instances: usize) -> usize {
        match self {
            Self::Dump | Self::Scrub | Self::Fil | Self::Fits => 1,
            Self::Amber => amber_instances,
            Self::Survey => amber_instances + 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartTime {
    /// As soon as the cluster can be brought up, now plus a fixed lead.
    Soonest,
    At(OffsetDateTime),
}

/// Which compound beams to record: an explicit list, or a first/last range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BeamSelection {
    Range { sbeam: usize, ebeam: usize },
    List(Vec<usize>),
}

impl BeamSelection {
    /// Parse a comma-separated beam list.
    pub fn parse_list(s: &str) -> Result<Self, ValidationError> {
        let mut beams = Vec::new();
        for field in s.split(',') {
            let beam = field
                .trim()
                .parse::<usize>()
                .map_err(|_| ValidationError::BadBeamList(field.to_string()))?;
            beams.push(beam);
        }
        Ok(Self::List(beams))
    }

    /// Expand to the sorted list of beams to observe for a science case,
    /// with the permanently missing beams removed.
    pub fn resolve(&self, case: &CaseProfile) -> Result<Vec<usize>, ValidationError> {
        let requested: Vec<usize> = match self {
            Self::List(beams) => beams.clone(),
            Self::Range { sbeam, ebeam } => {
                let ebeam = match ebeam {
                    // ebeam 0 means "same as sbeam", a single-beam observation
                    0 => *sbeam,
                    e if e < sbeam => {
                        log::warn!(
                            "ebeam cannot be smaller than sbeam, setting ebeam to sbeam ({})",
                            sbeam
                        );
                        *sbeam
                    }
                    e => *e,
                };
                (*sbeam..=ebeam).collect()
            }
        };

        let mut selected = BitSet::with_capacity(case.nbeams);
        for beam in requested {
            if beam >= case.nbeams {
                return Err(ValidationError::BadBeamIndex {
                    beam,
                    nbeams: case.nbeams,
                });
            }
            selected.insert(beam);
        }
        for missing in &case.missing_beams {
            if selected.remove(*missing) {
                log::info!("Skipping missing beam {}", missing);
            }
        }

        if selected.is_empty() {
            return Err(ValidationError::EmptyBeamSelection);
        }
        Ok(selected.iter().collect())
    }
}

/// A fully parsed observation request. Invalid combinations are rejected by
/// [`ObservationRequest::validate`] before any file is written or any node
/// is contacted.
#[derive(Debug, Clone)]
pub struct ObservationRequest {
    pub source: String,
    pub boresight: SkyCoord,
    pub duration_sec: f64,
    pub tstart: StartTime,
    pub science_case: ScienceCase,
    pub science_mode: ScienceMode,
    pub obs_mode: ObsMode,
    pub beams: BeamSelection,
    pub snrmin: f64,
    pub dm_min: f64,
    pub dm_max: f64,
    pub proctrigger: bool,
    pub pulsar: bool,
    pub debug: bool,
    pub dada_dir: Option<PathBuf>,
    pub atdb: bool,
    pub taskid: Option<String>,
}

impl ObservationRequest {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.duration_sec <= 0.0 {
            return Err(ValidationError::BadDuration(self.duration_sec));
        }
        if self.debug && self.dada_dir.is_none() {
            return Err(ValidationError::MissingDataDir);
        }
        if self.atdb && self.taskid.is_none() {
            return Err(ValidationError::MissingTaskId);
        }
        Ok(())
    }

    /// A single-line copy of the request, embedded in data headers for
    /// provenance.
    pub fn provenance(&self) -> String {
        format!(
            "source={};ra={};dec={};duration={};case={};mode={};obs_mode={};snrmin={};dm={}..{};taskid={}",
            self.source,
            self.boresight.ra_hms(),
            self.boresight.dec_dms(),
            self.duration_sec,
            self.science_case,
            self.science_mode,
            self.obs_mode,
            self.snrmin,
            self.dm_min,
            self.dm_max,
            self.taskid.as_deref().unwrap_or("none"),
        )
    }
}
