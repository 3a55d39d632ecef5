//! Grey and white matter fractions at ASL resolution.
//!
//! With an `fsl_anat` directory the existing high resolution tissue
//! estimates are brought down through a registration of the calibration
//! maps to the structural image: M0 first for a coarse alignment, then T1
//! refining from it. Without one the T1 map is taken up to the
//! standard template, segmented there, and the classes are brought back.

use std::path::Path;

use tracing::info;

use crate::calibrate::CalibrationResult;
use crate::config::{PipelineConfig, PvCorrection};
use crate::error::{QuasilError, Result};
use crate::stage::Stage;
use crate::toolkit::Toolkit;
use crate::volume::VolumeRef;
use crate::workspace::Workspace;

/// Fractions below this are zeroed; the same threshold defines the masks.
pub const PV_THRESHOLD: f64 = 0.1;

/// Fraction maps and masks for the two tissue classes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PvMaps {
    pub pvgm: VolumeRef,
    pub pvwm: VolumeRef,
    pub gm_mask: VolumeRef,
    pub wm_mask: VolumeRef,
}

impl PvMaps {
    pub fn fractions(&self) -> TissueFractions {
        TissueFractions {
            gm: self.pvgm.clone(),
            wm: self.pvwm.clone(),
        }
    }
}

/// Grey and white matter fractions at ASL resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TissueFractions {
    pub gm: VolumeRef,
    pub wm: VolumeRef,
}

/// Run partial volume estimation if the configuration asks for it.
pub async fn estimate(
    toolkit: &Toolkit,
    ws: &Workspace,
    config: &PipelineConfig,
    calib: &CalibrationResult,
) -> Result<Option<PvMaps>> {
    let (gm_raw, wm_raw) = match &config.pv_correction {
        PvCorrection::Disabled => return Ok(None),
        PvCorrection::Structural { fslanat } => from_structural(toolkit, ws, fslanat, calib).await?,
        PvCorrection::SelfSegmented => self_segmented(toolkit, ws, &calib.t1t).await?,
    };

    let stage = Stage::PartialVolume;
    let maps = PvMaps {
        pvgm: ws.scratch("pvgm_lowres"),
        pvwm: ws.scratch("pvwm_lowres"),
        gm_mask: ws.scratch("gm_mask"),
        wm_mask: ws.scratch("wm_mask"),
    };
    threshold(toolkit, &gm_raw, &maps.pvgm, &maps.gm_mask).await?;
    threshold(toolkit, &wm_raw, &maps.pvwm, &maps.wm_mask).await?;

    for volume in [&maps.pvgm, &maps.pvwm, &maps.gm_mask, &maps.wm_mask] {
        toolkit.copy(stage, volume, &ws.output(&volume.name())).await?;
    }
    Ok(Some(maps))
}

/// Bring the `fsl_anat` tissue estimates to ASL resolution for region
/// statistics only. Nothing is published.
pub async fn region_fractions(
    toolkit: &Toolkit,
    ws: &Workspace,
    fslanat: &Path,
    calib: &CalibrationResult,
) -> Result<TissueFractions> {
    let (gm, wm) = from_structural(toolkit, ws, fslanat, calib).await?;
    Ok(TissueFractions { gm, wm })
}

/// Zero fractions under the threshold, cap at 1, and binarize into a mask.
async fn threshold(toolkit: &Toolkit, raw: &VolumeRef, fraction: &VolumeRef, mask: &VolumeRef) -> Result<()> {
    let stage = Stage::PartialVolume;
    toolkit
        .maths(
            stage,
            raw,
            &[
                "-thr".to_string(),
                PV_THRESHOLD.to_string(),
                "-min".to_string(),
                "1".to_string(),
            ],
            fraction,
        )
        .await?;
    toolkit.maths(stage, fraction, &["-bin".to_string()], mask).await
}

async fn from_structural(
    toolkit: &Toolkit,
    ws: &Workspace,
    fslanat: &Path,
    calib: &CalibrationResult,
) -> Result<(VolumeRef, VolumeRef)> {
    let stage = Stage::PartialVolume;
    info!(fslanat = %fslanat.display(), "partial volume estimates from structural analysis");

    let structural = VolumeRef::in_dir(fslanat, "T1_biascorr");
    let pve_gm = VolumeRef::in_dir(fslanat, "T1_fast_pve_1");
    let pve_wm = VolumeRef::in_dir(fslanat, "T1_fast_pve_2");
    for input in [&structural, &pve_gm, &pve_wm] {
        if !input.exists() {
            return Err(QuasilError::MissingInput(input.base().to_path_buf()));
        }
    }

    let brain = ws.scratch("struc_brain");
    toolkit.bet(stage, &structural, &brain, false).await?;

    let t1t = &calib.t1t;
    let asl2struc = ws.scratch_dir().join("asl2struc.mat");
    match &calib.m0 {
        Some(m0) => {
            let coarse = ws.scratch_dir().join("asl2struc_init.mat");
            toolkit.flirt(stage, m0, &brain, &coarse, None, None, 6).await?;
            toolkit
                .flirt(stage, t1t, &brain, &asl2struc, None, Some(&coarse), 6)
                .await?;
        }
        None => toolkit.flirt(stage, t1t, &brain, &asl2struc, None, None, 6).await?,
    }
    let struc2asl = ws.scratch_dir().join("struc2asl.mat");
    toolkit.invert_xfm(stage, &asl2struc, &struc2asl).await?;

    let gm = ws.scratch("pvgm_resampled");
    let wm = ws.scratch("pvwm_resampled");
    toolkit.applywarp(stage, &pve_gm, t1t, &struc2asl, &gm).await?;
    toolkit.applywarp(stage, &pve_wm, t1t, &struc2asl, &wm).await?;
    Ok((gm, wm))
}

async fn self_segmented(toolkit: &Toolkit, ws: &Workspace, t1t: &VolumeRef) -> Result<(VolumeRef, VolumeRef)> {
    let stage = Stage::PartialVolume;
    let template = toolkit.config().standard_template().ok_or_else(|| {
        QuasilError::config(
            "pvcorr",
            "",
            "FSLDIR must be set to segment without --fslanat",
        )
    })?;
    info!(template = %template, "segmenting T1 map in standard space");

    let asl2std = ws.scratch_dir().join("asl2std.mat");
    let upsampled = ws.scratch("T1t_std");
    toolkit
        .flirt(stage, t1t, &template, &asl2std, Some(&upsampled), None, 12)
        .await?;
    let std2asl = ws.scratch_dir().join("std2asl.mat");
    toolkit.invert_xfm(stage, &asl2std, &std2asl).await?;

    let [pve_csf, pve_gm, pve_wm] = toolkit.fast(stage, &upsampled, &ws.scratch("T1t_std_seg")).await?;

    let csf = ws.scratch("pvcsf_resampled");
    let gm = ws.scratch("pvgm_resampled");
    let wm = ws.scratch("pvwm_resampled");
    toolkit.applywarp(stage, &pve_csf, t1t, &std2asl, &csf).await?;
    toolkit.applywarp(stage, &pve_gm, t1t, &std2asl, &gm).await?;
    toolkit.applywarp(stage, &pve_wm, t1t, &std2asl, &wm).await?;
    Ok((gm, wm))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibrate::Scaling;
    use crate::config::{ConfigResolver, RawOptions};
    use crate::fakes::{touch_input_volume, RecordingToolRunner};
    use crate::toolkit::ToolkitConfig;
    use crate::workspace::WorkspaceOptions;
    use std::path::PathBuf;
    use std::sync::Arc;

    fn setup(dir: &Path, fslanat: Option<PathBuf>) -> (PipelineConfig, Workspace, CalibrationResult) {
        let raw = RawOptions {
            input: Some(dir.join("asl")),
            pvcorr: true,
            fslanat,
            ..Default::default()
        };
        let config = ConfigResolver::resolve(&raw, dir).unwrap();
        let options = WorkspaceOptions::new(dir).with_scratch_root(dir.join("tmp"));
        let ws = Workspace::allocate(&dir.join("out"), &options).unwrap();
        let calib = CalibrationResult {
            scaling: Scaling::Scalar(1500.0),
            t1t: ws.scratch("T1t"),
            m0: None,
            g: None,
            spec: None,
        };
        touch_input_volume(calib.t1t.base()).unwrap();
        (config, ws, calib)
    }

    fn fslanat_dir(dir: &Path) -> PathBuf {
        let anat = dir.join("struc.anat");
        for name in ["T1_biascorr", "T1_fast_pve_1", "T1_fast_pve_2"] {
            touch_input_volume(&anat.join(name)).unwrap();
        }
        anat
    }

    #[tokio::test]
    async fn test_disabled_does_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let (mut config, ws, calib) = setup(dir.path(), None);
        config.pv_correction = PvCorrection::Disabled;
        let runner = Arc::new(RecordingToolRunner::new());
        let toolkit = Toolkit::new(runner.clone(), ToolkitConfig::default());

        assert!(estimate(&toolkit, &ws, &config, &calib).await.unwrap().is_none());
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn test_structural_branch() {
        let dir = tempfile::tempdir().unwrap();
        let anat = fslanat_dir(dir.path());
        let (config, ws, mut calib) = setup(dir.path(), Some(anat));
        calib.m0 = Some(ws.scratch("M0t"));
        touch_input_volume(ws.scratch("M0t").base()).unwrap();
        let runner = Arc::new(RecordingToolRunner::new());
        let toolkit = Toolkit::new(runner.clone(), ToolkitConfig::default());

        let maps = estimate(&toolkit, &ws, &config, &calib).await.unwrap().unwrap();

        assert!(runner.calls_to("fast").is_empty());
        let flirts = runner.calls_to("flirt");
        assert_eq!(flirts.len(), 2);
        let coarse = ws.scratch_dir().join("asl2struc_init.mat").to_string_lossy().into_owned();
        assert_eq!(flirts[0].args[..2], ["-in".to_string(), ws.scratch("M0t").arg()]);
        assert!(flirts[0].args.windows(2).any(|w| w == ["-omat", coarse.as_str()]));
        assert_eq!(flirts[1].args[..2], ["-in".to_string(), calib.t1t.arg()]);
        assert!(flirts[1].args.windows(2).any(|w| w == ["-init", coarse.as_str()]));
        for flirt in &flirts {
            assert!(flirt.args.windows(2).any(|w| w == ["-dof", "6"]));
        }
        assert_eq!(runner.calls_to("applywarp").len(), 2);
        let warp = &runner.calls_to("applywarp")[0];
        assert!(warp.args.contains(&"--superlevel=4".to_string()));
        assert!(warp.args.contains(&"--interp=spline".to_string()));
        for name in ["pvgm_lowres", "pvwm_lowres", "gm_mask", "wm_mask"] {
            assert!(ws.output(name).exists(), "{name} missing");
        }
        assert_eq!(maps.gm_mask, ws.scratch("gm_mask"));
    }

    #[tokio::test]
    async fn test_structural_without_m0_registers_t1_alone() {
        let dir = tempfile::tempdir().unwrap();
        let anat = fslanat_dir(dir.path());
        let (config, ws, calib) = setup(dir.path(), Some(anat));
        let runner = Arc::new(RecordingToolRunner::new());
        let toolkit = Toolkit::new(runner.clone(), ToolkitConfig::default());

        estimate(&toolkit, &ws, &config, &calib).await.unwrap();

        let flirts = runner.calls_to("flirt");
        assert_eq!(flirts.len(), 1);
        assert_eq!(flirts[0].args[1], calib.t1t.arg());
        assert!(!flirts[0].args.contains(&"-init".to_string()));
    }

    #[tokio::test]
    async fn test_region_fractions_are_not_published() {
        let dir = tempfile::tempdir().unwrap();
        let anat = fslanat_dir(dir.path());
        let (_config, ws, calib) = setup(dir.path(), None);
        let runner = Arc::new(RecordingToolRunner::new());
        let toolkit = Toolkit::new(runner.clone(), ToolkitConfig::default());

        let fractions = region_fractions(&toolkit, &ws, &anat, &calib).await.unwrap();

        assert_eq!(fractions.gm, ws.scratch("pvgm_resampled"));
        assert_eq!(fractions.wm, ws.scratch("pvwm_resampled"));
        assert!(runner.calls_to("fslmaths").is_empty());
        for name in ["pvgm_lowres", "pvwm_lowres", "gm_mask", "wm_mask"] {
            assert!(!ws.output(name).exists(), "{name} published");
        }
    }

    #[tokio::test]
    async fn test_thresholds_then_binarizes() {
        let dir = tempfile::tempdir().unwrap();
        let anat = fslanat_dir(dir.path());
        let (config, ws, calib) = setup(dir.path(), Some(anat));
        let runner = Arc::new(RecordingToolRunner::new());
        let toolkit = Toolkit::new(runner.clone(), ToolkitConfig::default());

        estimate(&toolkit, &ws, &config, &calib).await.unwrap();

        let maths = runner.calls_to("fslmaths");
        assert_eq!(maths[0].args[1..5], ["-thr", "0.1", "-min", "1"]);
        assert_eq!(maths[0].args[5], ws.scratch("pvgm_lowres").arg());
        assert_eq!(maths[1].args, vec![ws.scratch("pvgm_lowres").arg(), "-bin".into(), ws.scratch("gm_mask").arg()]);
    }

    #[tokio::test]
    async fn test_structural_missing_estimates_is_missing_input() {
        let dir = tempfile::tempdir().unwrap();
        let (config, ws, calib) = setup(dir.path(), Some(dir.path().join("empty.anat")));
        let runner = Arc::new(RecordingToolRunner::new());
        let toolkit = Toolkit::new(runner.clone(), ToolkitConfig::default());

        let err = estimate(&toolkit, &ws, &config, &calib).await.unwrap_err();
        assert!(matches!(err, QuasilError::MissingInput(_)));
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn test_self_segmented_branch() {
        let dir = tempfile::tempdir().unwrap();
        let (config, ws, calib) = setup(dir.path(), None);
        let runner = Arc::new(RecordingToolRunner::new());
        let toolkit = Toolkit::new(
            runner.clone(),
            ToolkitConfig {
                fsldir: Some(PathBuf::from("/opt/fsl")),
            },
        );

        estimate(&toolkit, &ws, &config, &calib).await.unwrap();

        let flirt = &runner.calls_to("flirt")[0];
        assert!(flirt.args.contains(&"/opt/fsl/data/standard/MNI152_T1_2mm".to_string()));
        assert!(flirt.args.windows(2).any(|w| w == ["-dof", "12"]));
        assert_eq!(runner.calls_to("fast").len(), 1);
        assert_eq!(runner.calls_to("applywarp").len(), 3);
        assert!(ws.output("wm_mask").exists());
    }

    #[tokio::test]
    async fn test_self_segmented_needs_template() {
        let dir = tempfile::tempdir().unwrap();
        let (config, ws, calib) = setup(dir.path(), None);
        let toolkit = Toolkit::new(Arc::new(RecordingToolRunner::new()), ToolkitConfig::default());

        let err = estimate(&toolkit, &ws, &config, &calib).await.unwrap_err();
        assert!(matches!(err, QuasilError::Config { field: "pvcorr", .. }));
    }
}
