//! Model-free perfusion by deconvolution.
//!
//! The crusher phases separate the signal: the outermost pair keeps the
//! arterial component, the inner phases keep tissue only. Their difference
//! gives the arterial signal, from which a fitted AIF shape per voxel is
//! deconvolved out of the smoothed tissue signal.

use std::path::PathBuf;

use tracing::info;

use crate::calibrate::CalibrationResult;
use crate::config::PipelineConfig;
use crate::error::Result;
use crate::model_spec::{ModelSpec, ModelSpecBuilder, PriorKind};
use crate::reshape::{split_name, PreparedData};
use crate::stage::Stage;
use crate::toolkit::Toolkit;
use crate::volume::VolumeRef;
use crate::workspace::Workspace;

/// Gaussian kernel sigma (mm) applied to the tissue signal.
pub const TISSUE_SMOOTHING_SIGMA: f64 = 2.1;

/// Sampling interval passed to the deconvolution solver (s).
pub const TIME_STEP: f64 = 0.3;

/// Voxels whose arterial blood volume falls below this are excluded from
/// deconvolution.
pub const ACBV_THRESHOLD: f64 = 0.012;

/// Raw output of the model-free path.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelFreeFit {
    /// Specification of the AIF fit.
    pub aif_spec: ModelSpec,

    /// Deconvolved residue magnitude, uncalibrated.
    pub magnitude: VolumeRef,

    /// Arterial blood volume, already calibrated.
    pub acbv: VolumeRef,
}

/// Phase indices averaged into the no-crush and tissue signals.
pub fn phase_groups(analysed_phases: usize) -> (Vec<usize>, Vec<usize>) {
    let last = analysed_phases.saturating_sub(1);
    let nocrush = vec![0, last];
    let tissue = (1..last).collect();
    (nocrush, tissue)
}

/// AIF shape model fitted to the arterial signal.
pub fn aif_spec(config: &PipelineConfig, g: Option<&VolumeRef>) -> ModelSpec {
    let timing = &config.timing;
    let g_prior = match g {
        Some(v) => PriorKind::Image(v.clone()),
        None => PriorKind::NonSpatial,
    };
    ModelSpecBuilder::new()
        .setting("method", "spatialvb")
        .setting("noise", "white")
        .setting("model", "quasar")
        .flag("inferart")
        .flag("artonly")
        .flag("infert1")
        .flag("usecalib")
        .setting("disp", "gamma")
        .tis(config.layout.tis())
        .setting("t1b", timing.t1b)
        .setting("tau", timing.tau)
        .setting("slicedt", timing.slicedt)
        .setting("fa", timing.fa)
        .setting("repeats", 1)
        .setting("phases", 1)
        .infer("fblood", PriorKind::Ard)
        .infer("deltblood", PriorKind::NonSpatial)
        .infer("T1b", PriorKind::NonSpatial)
        .infer("g", g_prior)
        .build()
}

pub async fn run(
    toolkit: &Toolkit,
    ws: &Workspace,
    config: &PipelineConfig,
    data: &PreparedData,
    calib: &CalibrationResult,
) -> Result<ModelFreeFit> {
    let stage = Stage::ModelFree;
    let phases = config.layout.analysed_phases();
    info!(phases, "separating arterial and tissue signal");

    // One volume series per crusher phase, TIs along time.
    let prefix = ws.scratch("phase_");
    toolkit
        .asl_file(
            stage,
            vec![
                format!("--data={}", data.diff.arg()),
                format!("--ntis={phases}"),
                "--ibf=rpt".to_string(),
                "--iaf=diff".to_string(),
                format!("--split={}", prefix.arg()),
            ],
        )
        .await?;

    let (nocrush_idx, tissue_idx) = phase_groups(phases);
    let nocrush = ws.scratch("nocrush");
    average(toolkit, &prefix, &nocrush_idx, &nocrush).await?;
    let tissue = ws.scratch("tissue");
    average(toolkit, &prefix, &tissue_idx, &tissue).await?;

    let arterial = ws.scratch("arterial");
    toolkit
        .maths(stage, &nocrush, &["-sub".to_string(), tissue.arg()], &arterial)
        .await?;

    let aif_spec = aif_spec(config, calib.g.as_ref());
    let options = ws.scratch_dir().join("aif_options.txt");
    aif_spec.write_to(&options)?;
    let fit_dir: PathBuf = ws.scratch_dir().join("aif");
    toolkit.fabber(stage, &arterial, &data.mask, &fit_dir, &options).await?;

    let fblood = VolumeRef::in_dir(&fit_dir, "mean_fblood");
    let modelfit = VolumeRef::in_dir(&fit_dir, "modelfit");
    toolkit.expect_volume(stage, &fblood)?;
    toolkit.expect_volume(stage, &modelfit)?;

    let acbv = ws.scratch("aCBV");
    toolkit
        .maths(stage, &fblood, &calib.scaling.ops(1.0), &acbv)
        .await?;

    // Unit-area AIF shapes.
    let aif = ws.scratch("aif_norm");
    toolkit
        .maths(stage, &modelfit, &["-div".to_string(), fblood.arg()], &aif)
        .await?;

    let smoothed = ws.scratch("tissue_smooth");
    toolkit
        .maths(
            stage,
            &tissue,
            &["-s".to_string(), TISSUE_SMOOTHING_SIGMA.to_string()],
            &smoothed,
        )
        .await?;

    let out = ws.scratch("mfree");
    toolkit
        .asl_mfree(
            stage,
            vec![
                format!("--data={}", smoothed.arg()),
                format!("--mask={}", data.mask.arg()),
                format!("--aif={}", aif.arg()),
                format!("--dt={TIME_STEP}"),
                format!("--metric={}", acbv.arg()),
                format!("--mthresh={ACBV_THRESHOLD}"),
                "--tcorrect".to_string(),
                format!("--out={}", out.arg()),
            ],
        )
        .await?;
    let magnitude = out.with_suffix("_mag");
    toolkit.expect_volume(stage, &magnitude)?;

    Ok(ModelFreeFit {
        aif_spec,
        magnitude,
        acbv,
    })
}

/// Mean of the listed phase volumes.
async fn average(toolkit: &Toolkit, prefix: &VolumeRef, phases: &[usize], out: &VolumeRef) -> Result<()> {
    let Some((first, rest)) = phases.split_first() else {
        return Ok(());
    };
    let mut ops = Vec::with_capacity(rest.len() * 2 + 2);
    for phase in rest {
        ops.push("-add".to_string());
        ops.push(split_name(prefix, *phase).arg());
    }
    ops.push("-div".to_string());
    ops.push(phases.len().to_string());
    toolkit
        .maths(Stage::ModelFree, &split_name(prefix, *first), &ops, out)
        .await
}
