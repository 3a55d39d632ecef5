//! Magnetization reference and tissue T1.
//!
//! The internal mode fits a saturation recovery model to the control images;
//! the external mode hands the control images to the calibration routine with
//! whatever arguments the user supplied. Both end in a [`CalibrationResult`]
//! whose [`Scaling`] tells the output stage how to turn fitted signal into
//! physiological units.

use std::path::Path;

use tracing::{debug, info};

use crate::config::{CalibrationMode, PipelineConfig};
use crate::error::{QuasilError, Result};
use crate::model_spec::{ModelSpec, ModelSpecBuilder};
use crate::reshape::PreparedData;
use crate::stage::Stage;
use crate::toolkit::Toolkit;
use crate::volume::VolumeRef;
use crate::workspace::Workspace;

/// Blood/tissue water partition coefficient.
pub const PARTITION_COEFFICIENT: f64 = 0.9;

/// Neighbourhood radius used when extrapolating M0 back over the eroded edge.
pub const EDGE_NEIGHBOUR_RADIUS: u32 = 5;

/// How fitted signal is brought into absolute units.
#[derive(Debug, Clone, PartialEq)]
pub enum Scaling {
    /// Divide voxelwise by an arterial M0 volume.
    Volume(VolumeRef),
    /// Divide by a single arterial M0 value.
    Scalar(f64),
}

impl Scaling {
    /// Image algebra that divides by M0 and multiplies by `multiplier`.
    pub fn ops(&self, multiplier: f64) -> Vec<String> {
        match self {
            Scaling::Volume(m0a) => {
                let mut ops = vec!["-div".to_string(), m0a.arg()];
                if multiplier != 1.0 {
                    ops.push("-mul".to_string());
                    ops.push(multiplier.to_string());
                }
                ops
            }
            Scaling::Scalar(m0a) => vec!["-mul".to_string(), calibrated_factor(multiplier, *m0a).to_string()],
        }
    }
}

/// Factor applied to fitted signal when M0 is a scalar.
pub fn calibrated_factor(multiplier: f64, m0: f64) -> f64 {
    multiplier / m0
}

/// Output of the calibration stage.
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationResult {
    pub scaling: Scaling,

    /// Fitted tissue T1.
    pub t1t: VolumeRef,

    /// Magnetization map at ASL resolution, when calibration produced one.
    /// Registration uses it alongside the T1 map.
    pub m0: Option<VolumeRef>,

    /// Saturation efficiency map; only the internal fit produces one.
    pub g: Option<VolumeRef>,

    /// Model specification of the saturation recovery fit, if it ran.
    pub spec: Option<ModelSpec>,
}

pub async fn calibrate(
    toolkit: &Toolkit,
    ws: &Workspace,
    config: &PipelineConfig,
    data: &PreparedData,
) -> Result<CalibrationResult> {
    match &config.calibration {
        CalibrationMode::Internal => internal(toolkit, ws, config, data).await,
        CalibrationMode::External { args } => external(toolkit, ws, config, data, args).await,
    }
}

/// Saturation recovery model for the control images.
pub fn satrecov_spec(config: &PipelineConfig) -> ModelSpec {
    let timing = &config.timing;
    ModelSpecBuilder::new()
        .setting("method", "spatialvb")
        .setting("noise", "white")
        .setting("model", "satrecov")
        .setting("repeats", 1)
        .setting("phases", config.layout.analysed_phases())
        .tis(config.layout.tis())
        .setting("t1", timing.t1t)
        .setting("FA", timing.fa)
        .setting("LFA", timing.lfa)
        .setting("slicedt", timing.slicedt)
        .build()
}

async fn internal(
    toolkit: &Toolkit,
    ws: &Workspace,
    config: &PipelineConfig,
    data: &PreparedData,
) -> Result<CalibrationResult> {
    let stage = Stage::Calibration;
    info!("fitting saturation recovery to control images");

    let spec = satrecov_spec(config);
    let options = ws.scratch_dir().join("satrecov_options.txt");
    spec.write_to(&options)?;

    let fit_dir = ws.scratch_dir().join("satrecov");
    toolkit
        .fabber(stage, &data.control, &data.mask, &fit_dir, &options)
        .await?;

    let t1t = adopt_fitted(toolkit, ws, &fit_dir, "T1t").await?;
    let g = adopt_fitted(toolkit, ws, &fit_dir, "g").await?;
    let mut m0t = adopt_fitted(toolkit, ws, &fit_dir, "M0t").await?;

    if config.edge_correction {
        let uncorrected = ws.scratch("M0t_uncorr");
        toolkit.copy(stage, &m0t, &uncorrected).await?;
        m0t = correct_edges(toolkit, ws, &m0t, &data.mask).await?;
        toolkit.copy(stage, &uncorrected, &ws.output("M0t_uncorr")).await?;
    }

    // Arterial M0 from tissue M0.
    let m0a = ws.scratch("M0a");
    toolkit
        .maths(
            stage,
            &m0t,
            &[
                "-div".to_string(),
                PARTITION_COEFFICIENT.to_string(),
                "-mul".to_string(),
                config.timing.alpha.to_string(),
            ],
            &m0a,
        )
        .await?;

    toolkit.copy(stage, &m0t, &ws.output("M0t")).await?;
    toolkit.copy(stage, &t1t, &ws.output("T1t")).await?;

    Ok(CalibrationResult {
        scaling: Scaling::Volume(m0a),
        t1t,
        m0: Some(m0t),
        g: Some(g),
        spec: Some(spec),
    })
}

/// Copy `mean_<param>` out of the fit directory under its own name.
async fn adopt_fitted(toolkit: &Toolkit, ws: &Workspace, fit_dir: &Path, param: &str) -> Result<VolumeRef> {
    let source = VolumeRef::in_dir(fit_dir, &format!("mean_{param}"));
    toolkit.expect_volume(Stage::Calibration, &source)?;
    let dest = ws.scratch(param);
    toolkit.copy(Stage::Calibration, &source, &dest).await?;
    Ok(dest)
}

/// Median filter and erode the M0 map, then grow it back out to the mask.
async fn correct_edges(
    toolkit: &Toolkit,
    ws: &Workspace,
    m0t: &VolumeRef,
    mask: &VolumeRef,
) -> Result<VolumeRef> {
    let stage = Stage::Calibration;
    debug!("correcting M0 edge artefact");

    let eroded = ws.scratch("M0t_ero");
    toolkit
        .maths(
            stage,
            m0t,
            &[
                "-fmedian".to_string(),
                "-mas".to_string(),
                mask.arg(),
                "-ero".to_string(),
            ],
            &eroded,
        )
        .await?;

    let corrected = ws.scratch("M0t_corr");
    toolkit
        .asl_file(
            stage,
            vec![
                format!("--data={}", eroded.arg()),
                "--ntis=1".to_string(),
                format!("--mask={}", mask.arg()),
                "--extrapolate".to_string(),
                format!("--neighbour={EDGE_NEIGHBOUR_RADIUS}"),
                format!("--out={}", corrected.arg()),
            ],
        )
        .await?;
    toolkit.expect_volume(stage, &corrected)?;
    Ok(corrected)
}

async fn external(
    toolkit: &Toolkit,
    ws: &Workspace,
    config: &PipelineConfig,
    data: &PreparedData,
    user_args: &[String],
) -> Result<CalibrationResult> {
    let stage = Stage::Calibration;
    info!(args = ?user_args, "running external calibration");

    let calib_dir = ws.scratch_dir().join("calib");
    let timing = &config.timing;
    let tis = config
        .layout
        .tis()
        .iter()
        .map(f64::to_string)
        .collect::<Vec<_>>()
        .join(",");

    let mut args = user_args.to_vec();
    args.extend([
        "-c".to_string(),
        data.control.arg(),
        "-m".to_string(),
        data.mask.arg(),
        "-o".to_string(),
        calib_dir.to_string_lossy().into_owned(),
        format!("--tis={tis}"),
        format!("--fa={}", timing.fa),
        format!("--lfa={}", timing.lfa),
        format!("--slicedt={}", timing.slicedt),
    ]);
    toolkit.asl_calib(stage, args).await?;

    let t1t_fit = VolumeRef::in_dir(&calib_dir, "T1t");
    toolkit.expect_volume(stage, &t1t_fit)?;
    let t1t = ws.scratch("T1t");
    toolkit.copy(stage, &t1t_fit, &t1t).await?;
    toolkit.copy(stage, &t1t, &ws.output("T1t")).await?;

    let scalar_file = calib_dir.join("M0.txt");
    let m0_map = VolumeRef::in_dir(&calib_dir, "M0");
    let (scaling, m0) = if scalar_file.is_file() {
        let value = read_scalar(stage, &scalar_file)?;
        std::fs::write(ws.output_dir().join("M0a.txt"), format!("{value}\n"))?;
        (Scaling::Scalar(value), None)
    } else if m0_map.exists() {
        let m0a = ws.scratch("M0a");
        toolkit.copy(stage, &m0_map, &m0a).await?;
        toolkit.copy(stage, &m0a, &ws.output("M0a")).await?;
        (Scaling::Volume(m0a.clone()), Some(m0a))
    } else {
        return Err(QuasilError::MissingArtifact {
            stage,
            path: scalar_file,
        });
    };

    Ok(CalibrationResult {
        scaling,
        t1t,
        m0,
        g: None,
        spec: None,
    })
}

/// First number in a text file; zero or unparseable values count as missing.
fn read_scalar(stage: Stage, path: &Path) -> Result<f64> {
    let text = std::fs::read_to_string(path)?;
    text.split_whitespace()
        .next()
        .and_then(|t| t.parse::<f64>().ok())
        .filter(|v| v.is_finite() && *v != 0.0)
        .ok_or_else(|| QuasilError::MissingArtifact {
            stage,
            path: path.to_path_buf(),
        })
}
