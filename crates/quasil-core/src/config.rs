//! Option resolution.
//!
//! [`ConfigResolver::resolve`] turns the loosely-typed [`RawOptions`] gathered
//! from the command line into an immutable [`PipelineConfig`] in which every
//! optional feature has a definite value. Resolution is pure: it touches
//! neither the filesystem nor the environment.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{QuasilError, Result};

/// Default TI schedule in seconds.
pub const DEFAULT_TIS: [f64; 13] = [
    0.04, 0.34, 0.64, 0.94, 1.24, 1.54, 1.84, 2.14, 2.44, 2.74, 3.04, 3.34, 3.64,
];

/// Phases acquired per TI: six crusher phases plus one low flip angle phase.
pub const QUASAR_PHASES: usize = 7;

/// Smallest phase count that still leaves an outer pair and an inner tissue set
/// after the low flip angle phase is discarded.
pub const MIN_PHASES: usize = 4;

/// Default output directory base name.
pub const DEFAULT_OUTPUT: &str = "quasil_out";

/// Options as received from the command line, before defaults and parsing.
#[derive(Debug, Clone, Default)]
pub struct RawOptions {
    pub input: Option<PathBuf>,
    pub output: Option<PathBuf>,
    pub mask: Option<PathBuf>,
    pub t1b: Option<String>,
    pub t1: Option<String>,
    pub t1wm: Option<String>,
    pub slicedt: Option<String>,
    pub fa: Option<String>,
    pub lfa: Option<String>,
    pub alpha: Option<String>,
    pub tis: Option<String>,
    pub tau: Option<String>,
    pub iform: Option<String>,
    pub disp: bool,
    pub infertau: bool,
    pub mfree: bool,
    pub corrcal: bool,
    pub pvcorr: bool,
    pub fslanat: Option<PathBuf>,
    pub ccmds: Option<String>,
    pub region_stats: bool,
    pub debug: bool,
}

/// Layout of the raw acquisition volumes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RawFormat {
    /// `q`: TI outer, repeat middle, phase inner.
    Nested,
    /// `f`: TI outer, phase inner, repeats already averaged.
    Flat,
}

impl RawFormat {
    fn parse(tag: &str) -> Result<Self> {
        match tag.trim() {
            "q" => Ok(RawFormat::Nested),
            "f" => Ok(RawFormat::Flat),
            other => Err(QuasilError::config("iform", other, "expected 'q' or 'f'")),
        }
    }
}

/// Timing and sequence layout of the acquisition.
///
/// The TI count is derived from the TI list at construction, so the two can
/// never disagree.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AcquisitionLayout {
    ntis: usize,
    tis: Vec<f64>,
    nphases: usize,
    format: RawFormat,
}

impl AcquisitionLayout {
    /// Create a layout; fails on an empty TI list or too few phases.
    pub fn new(tis: Vec<f64>, nphases: usize, format: RawFormat) -> Result<Self> {
        if tis.is_empty() {
            return Err(QuasilError::config("tis", "", "at least one TI is required"));
        }
        if nphases < MIN_PHASES {
            return Err(QuasilError::config(
                "nphases",
                nphases.to_string(),
                format!("at least {MIN_PHASES} phases per TI are required"),
            ));
        }
        Ok(Self {
            ntis: tis.len(),
            tis,
            nphases,
            format,
        })
    }

    pub fn ntis(&self) -> usize {
        self.ntis
    }

    pub fn tis(&self) -> &[f64] {
        &self.tis
    }

    /// Phases per TI, including the low flip angle phase.
    pub fn nphases(&self) -> usize {
        self.nphases
    }

    /// Phases per TI used by the estimation stages.
    pub fn analysed_phases(&self) -> usize {
        self.nphases - 1
    }

    pub fn format(&self) -> RawFormat {
        self.format
    }

    /// Tag/control pairs in the canonical flattened dataset.
    pub fn canonical_pairs(&self) -> usize {
        self.ntis * self.nphases
    }
}

/// Physiological and sequence constants.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct TimingParams {
    /// Arterial blood T1 (s).
    pub t1b: f64,
    /// Tissue T1 (s).
    pub t1t: f64,
    /// White matter T1 (s).
    pub t1wm: f64,
    /// TI increment per slice (s).
    pub slicedt: f64,
    /// Look-Locker readout flip angle (degrees).
    pub fa: f64,
    /// Flip angle of the final phase (degrees).
    pub lfa: f64,
    /// Inversion efficiency.
    pub alpha: f64,
    /// Bolus duration (s).
    pub tau: f64,
}

impl Default for TimingParams {
    fn default() -> Self {
        Self {
            t1b: 1.6,
            t1t: 1.3,
            t1wm: 1.1,
            slicedt: 0.035,
            fa: 35.0,
            lfa: 11.7,
            alpha: 0.91,
            tau: 0.64,
        }
    }
}

/// Dispersion kernel applied to the arterial input.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Dispersion {
    None,
    Gamma,
}

impl Dispersion {
    pub fn directive_value(&self) -> &'static str {
        match self {
            Dispersion::None => "none",
            Dispersion::Gamma => "gamma",
        }
    }
}

/// Kinetic model switches that change the inferred parameter set.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ModelFeatures {
    pub dispersion: Dispersion,
    pub infer_tau: bool,
    /// Always false: tissue T1 is inferred. Kept so the prior slot table
    /// covers the fixed-T1 layout.
    pub t1_fixed: bool,
}

/// Which estimation strategy runs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisStrategy {
    ModelBased,
    ModelFree,
}

/// Partial volume correction source.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PvCorrection {
    Disabled,
    /// Structural image and tissue estimates from an `fsl_anat` directory.
    Structural { fslanat: PathBuf },
    /// Segmentation derived from the calibration T1 map.
    SelfSegmented,
}

impl PvCorrection {
    pub fn enabled(&self) -> bool {
        !matches!(self, PvCorrection::Disabled)
    }
}

/// How the magnetization reference is obtained.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CalibrationMode {
    /// Voxelwise saturation recovery fit of the control images.
    Internal,
    /// External calibration routine with user supplied arguments.
    External { args: Vec<String> },
}

/// Fully resolved, immutable run configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PipelineConfig {
    pub input: PathBuf,
    pub output_base: PathBuf,
    pub mask: Option<PathBuf>,
    pub layout: AcquisitionLayout,
    pub timing: TimingParams,
    pub features: ModelFeatures,
    pub strategy: AnalysisStrategy,
    pub pv_correction: PvCorrection,
    /// `fsl_anat` directory as given, whether or not correction uses it.
    pub fslanat: Option<PathBuf>,
    pub calibration: CalibrationMode,
    pub edge_correction: bool,
    pub region_stats: bool,
    pub debug: bool,
}

impl PipelineConfig {
    /// The `fsl_anat` directory when nothing will read it: no correction and
    /// no region statistics.
    pub fn unused_fslanat(&self) -> Option<&Path> {
        match &self.fslanat {
            Some(dir) if !self.pv_correction.enabled() && !self.region_stats => Some(dir),
            _ => None,
        }
    }
}

/// Resolves raw options into a [`PipelineConfig`].
pub struct ConfigResolver;

impl ConfigResolver {
    /// Apply defaults, parse values and settle mutually exclusive flags.
    ///
    /// Relative paths are anchored at `invocation_dir` so later stages only
    /// ever see absolute paths.
    pub fn resolve(raw: &RawOptions, invocation_dir: &Path) -> Result<PipelineConfig> {
        let input = raw
            .input
            .as_deref()
            .ok_or_else(|| QuasilError::config("input", "", "an input dataset is required (-i)"))?;

        let defaults = TimingParams::default();
        let timing = TimingParams {
            t1b: parse_positive("t1b", raw.t1b.as_deref(), defaults.t1b)?,
            t1t: parse_positive("t1", raw.t1.as_deref(), defaults.t1t)?,
            t1wm: parse_positive("t1wm", raw.t1wm.as_deref(), defaults.t1wm)?,
            slicedt: parse_non_negative("slicedt", raw.slicedt.as_deref(), defaults.slicedt)?,
            fa: parse_positive("fa", raw.fa.as_deref(), defaults.fa)?,
            lfa: parse_positive("lfa", raw.lfa.as_deref(), defaults.lfa)?,
            alpha: parse_positive("alpha", raw.alpha.as_deref(), defaults.alpha)?,
            tau: parse_positive("tau", raw.tau.as_deref(), defaults.tau)?,
        };
        if timing.alpha > 1.0 {
            return Err(QuasilError::config(
                "alpha",
                timing.alpha.to_string(),
                "inversion efficiency cannot exceed 1",
            ));
        }

        let tis = match raw.tis.as_deref() {
            Some(list) => parse_ti_list(list)?,
            None => DEFAULT_TIS.to_vec(),
        };
        let format = match raw.iform.as_deref() {
            Some(tag) => RawFormat::parse(tag)?,
            None => RawFormat::Nested,
        };
        let layout = AcquisitionLayout::new(tis, QUASAR_PHASES, format)?;

        if raw.mfree && raw.pvcorr {
            return Err(QuasilError::config(
                "pvcorr",
                "",
                "partial volume correction needs the kinetic model fit; drop --mfree",
            ));
        }
        let fslanat = raw.fslanat.as_deref().map(|dir| anchor(invocation_dir, dir));
        let pv_correction = match (raw.pvcorr, &fslanat) {
            (true, Some(dir)) => PvCorrection::Structural { fslanat: dir.clone() },
            (true, None) => PvCorrection::SelfSegmented,
            (false, _) => PvCorrection::Disabled,
        };

        let calibration = match raw.ccmds.as_deref() {
            Some(cmds) => {
                let args: Vec<String> = cmds.split_whitespace().map(str::to_string).collect();
                if args.is_empty() {
                    return Err(QuasilError::config(
                        "ccmds",
                        cmds,
                        "calibration arguments must not be empty",
                    ));
                }
                CalibrationMode::External { args }
            }
            None => CalibrationMode::Internal,
        };

        let strategy = if raw.mfree {
            AnalysisStrategy::ModelFree
        } else {
            AnalysisStrategy::ModelBased
        };

        Ok(PipelineConfig {
            input: anchor(invocation_dir, input),
            output_base: anchor(
                invocation_dir,
                raw.output.as_deref().unwrap_or(Path::new(DEFAULT_OUTPUT)),
            ),
            mask: raw.mask.as_deref().map(|m| anchor(invocation_dir, m)),
            layout,
            timing,
            features: ModelFeatures {
                dispersion: if raw.disp {
                    Dispersion::Gamma
                } else {
                    Dispersion::None
                },
                infer_tau: raw.infertau,
                t1_fixed: false,
            },
            strategy,
            pv_correction,
            fslanat,
            calibration,
            edge_correction: raw.corrcal,
            region_stats: raw.region_stats,
            debug: raw.debug,
        })
    }
}

/// Parse a comma-separated TI list.
pub fn parse_ti_list(list: &str) -> Result<Vec<f64>> {
    if list.trim().is_empty() {
        return Err(QuasilError::config("tis", list, "TI list is empty"));
    }
    list.split(',')
        .map(|item| {
            let item = item.trim();
            let ti: f64 = item
                .parse()
                .map_err(|_| QuasilError::config("tis", list, format!("'{item}' is not a number")))?;
            if !ti.is_finite() || ti < 0.0 {
                return Err(QuasilError::config(
                    "tis",
                    list,
                    format!("'{item}' is not a valid inversion time"),
                ));
            }
            Ok(ti)
        })
        .collect()
}

fn parse_number(field: &'static str, value: Option<&str>, default: f64) -> Result<f64> {
    let Some(text) = value else {
        return Ok(default);
    };
    let parsed: f64 = text
        .trim()
        .parse()
        .map_err(|_| QuasilError::config(field, text, "not a number"))?;
    if !parsed.is_finite() {
        return Err(QuasilError::config(field, text, "must be finite"));
    }
    Ok(parsed)
}

fn parse_positive(field: &'static str, value: Option<&str>, default: f64) -> Result<f64> {
    let parsed = parse_number(field, value, default)?;
    if parsed <= 0.0 {
        return Err(QuasilError::config(field, parsed.to_string(), "must be positive"));
    }
    Ok(parsed)
}

fn parse_non_negative(field: &'static str, value: Option<&str>, default: f64) -> Result<f64> {
    let parsed = parse_number(field, value, default)?;
    if parsed < 0.0 {
        return Err(QuasilError::config(field, parsed.to_string(), "must not be negative"));
    }
    Ok(parsed)
}

fn anchor(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}
