//! End-to-end pipeline runs against the recording tool runner.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use quasil_core::fakes::{touch_input_volume, RecordingToolRunner};
use quasil_core::manifest::{digest_text, read_manifest};
use quasil_core::{
    ConfigResolver, PipelineConfig, PipelineResult, QuasilError, QuasilPipeline, RawOptions, Stage,
    ToolkitConfig, WorkspaceOptions,
};
use tempfile::TempDir;

const PV_ARTIFACTS: [&str; 4] = ["pvgm_lowres", "pvwm_lowres", "gm_mask", "wm_mask"];

struct Harness {
    dir: TempDir,
    runner: Arc<RecordingToolRunner>,
    toolkit: ToolkitConfig,
}

impl Harness {
    fn new() -> Self {
        Self::with_runner(RecordingToolRunner::new())
    }

    fn with_runner(runner: RecordingToolRunner) -> Self {
        let dir = tempfile::tempdir().unwrap();
        touch_input_volume(&dir.path().join("asl_raw")).unwrap();
        Self {
            dir,
            runner: Arc::new(runner),
            toolkit: ToolkitConfig::default(),
        }
    }

    fn root(&self) -> &Path {
        self.dir.path()
    }

    fn scratch_root(&self) -> PathBuf {
        self.root().join("tmp")
    }

    fn config(&self, raw: RawOptions) -> PipelineConfig {
        let raw = RawOptions {
            input: Some(PathBuf::from("asl_raw.nii.gz")),
            ..raw
        };
        ConfigResolver::resolve(&raw, self.root()).unwrap()
    }

    async fn run(&self, raw: RawOptions) -> Result<PipelineResult, QuasilError> {
        let config = self.config(raw);
        let pipeline = QuasilPipeline::new(
            self.runner.clone(),
            self.toolkit.clone(),
            WorkspaceOptions::new(self.root()).with_scratch_root(self.scratch_root()),
        );
        pipeline.run(&config).await
    }

    fn scratch_entries(&self) -> usize {
        std::fs::read_dir(self.scratch_root())
            .map(|entries| entries.count())
            .unwrap_or(0)
    }
}

fn exists(dir: &Path, name: &str) -> bool {
    dir.join(format!("{name}.nii.gz")).is_file()
}

/// Default options, nested input: basic outputs, nothing partial-volume related.
#[tokio::test]
async fn test_default_run_produces_basic_outputs() {
    let h = Harness::new();
    let result = h.run(RawOptions::default()).await.expect("run failed");

    assert_eq!(result.output_dir, std::fs::canonicalize(h.root().join("quasil_out")).unwrap());
    assert_eq!(result.outputs.names(), vec!["perfusion", "perfusion_raw", "arrival", "aCBV"]);
    for name in ["perfusion", "perfusion_raw", "arrival", "aCBV", "mask", "M0t", "T1t"] {
        assert!(exists(&result.output_dir, name), "{name} missing");
    }
    for name in PV_ARTIFACTS.iter().chain(&["perfusion_gm", "bolus_duration", "M0t_uncorr"]) {
        assert!(!exists(&result.output_dir, name), "{name} unexpected");
    }

    // scratch released, nothing kept
    assert!(result.retained_scratch.is_none());
    assert_eq!(h.scratch_entries(), 0);
}

#[tokio::test]
async fn test_structural_pv_correction_outputs() {
    let h = Harness::new();
    let anat = h.root().join("struc.anat");
    for name in ["T1_biascorr", "T1_fast_pve_1", "T1_fast_pve_2"] {
        touch_input_volume(&anat.join(name)).unwrap();
    }

    let result = h
        .run(RawOptions {
            pvcorr: true,
            fslanat: Some(PathBuf::from("struc.anat")),
            ..Default::default()
        })
        .await
        .expect("run failed");

    for name in PV_ARTIFACTS
        .iter()
        .chain(&["perfusion_gm", "perfusion_wm", "perfusion_wm_raw", "arrival_wm"])
    {
        assert!(exists(&result.output_dir, name), "{name} missing");
    }
    assert!(result.outputs.get("perfusion").is_none());
    assert!(h.runner.calls_to("fast").is_empty());

    // calibration M0 seeds the T1 registration
    let flirts = h.runner.calls_to("flirt");
    assert_eq!(flirts.len(), 2);
    assert!(flirts[0].args[1].ends_with("/M0t"));
    assert!(flirts[1].args[1].ends_with("/T1t"));
    let init = flirts[1].args.iter().position(|a| a == "-init").expect("-init missing");
    assert!(flirts[1].args[init + 1].ends_with("asl2struc_init.mat"));

    let basil = h
        .runner
        .captured_options()
        .into_iter()
        .find(|o| o.stage == Stage::ModelBased)
        .unwrap();
    let lines: Vec<&str> = basil.text.lines().collect();
    assert!(lines.contains(&"--param-spatial-priors=MNMNANIIIII"));
    assert!(lines.iter().any(|l| l.starts_with("--image-prior7=") && l.ends_with("/T1t")));
    assert!(lines.iter().any(|l| l.starts_with("--image-prior10=") && l.ends_with("/pvgm_lowres")));
}

#[tokio::test]
async fn test_self_segmented_pv_correction() {
    let mut h = Harness::new();
    h.toolkit = ToolkitConfig {
        fsldir: Some(PathBuf::from("/opt/fsl")),
    };

    let result = h
        .run(RawOptions {
            pvcorr: true,
            infertau: true,
            ..Default::default()
        })
        .await
        .expect("run failed");

    assert_eq!(h.runner.calls_to("fast").len(), 1);
    assert!(exists(&result.output_dir, "bolus_duration"));
    let basil = h.runner.captured_options().pop().unwrap();
    assert!(basil.text.contains("--image-prior13="));
}

#[tokio::test]
async fn test_model_free_never_builds_model_based_spec() {
    let h = Harness::new();
    let result = h
        .run(RawOptions {
            mfree: true,
            ..Default::default()
        })
        .await
        .expect("run failed");

    assert_eq!(result.outputs.names(), vec!["perfusion", "aCBV"]);
    for name in ["perfusion_raw", "arrival", "bolus_duration"] {
        assert!(!exists(&result.output_dir, name), "{name} unexpected");
    }
    assert_eq!(h.runner.calls_to("asl_mfree").len(), 1);
    let options = h.runner.captured_options();
    let stages: Vec<Stage> = options.iter().map(|o| o.stage).collect();
    assert_eq!(stages, vec![Stage::Calibration, Stage::ModelFree]);
    // the only kinetic model run is the arterial-only input function fit
    for captured in &options {
        let lines: Vec<&str> = captured.text.lines().collect();
        if lines.contains(&"--model=quasar") {
            assert!(lines.contains(&"--artonly"), "tissue fit in {:?}", captured.stage);
        }
    }
    assert!(options.iter().all(|o| !o.text.contains("--param-spatial-priors")));
    assert!(h.runner.calls().iter().all(|c| c.stage != Stage::ModelBased));

    let manifest = read_manifest(&result.output_dir).unwrap();
    let labels: Vec<&str> = manifest.model_specs.iter().map(|s| s.label.as_str()).collect();
    assert_eq!(labels, vec!["satrecov", "aif"]);
}

#[tokio::test]
async fn test_external_calibration_skips_internal_fit() {
    let h = Harness::new();
    let result = h
        .run(RawOptions {
            ccmds: Some("--mode longtr --tr 4.8 --cgain 1.0".to_string()),
            ..Default::default()
        })
        .await
        .expect("run failed");

    assert!(result.output_dir.join("M0a.txt").is_file());
    assert!(exists(&result.output_dir, "T1t"));
    assert!(!exists(&result.output_dir, "M0t"));
    assert_eq!(h.runner.calls_to("asl_calib").len(), 1);
    assert!(h
        .runner
        .calls_to("fabber_asl")
        .iter()
        .all(|c| c.stage != Stage::Calibration));
}

#[tokio::test]
async fn test_tool_failure_names_stage_and_releases_scratch() {
    let h = Harness::with_runner(RecordingToolRunner::new().failing("fabber_asl"));
    let err = h.run(RawOptions::default()).await.unwrap_err();

    assert_eq!(err.stage(), Some(Stage::Calibration));
    assert!(err.to_string().contains("calibration"));
    assert_eq!(h.scratch_entries(), 0);
    // output directory stays, without a manifest
    let out = h.root().join("quasil_out");
    assert!(out.is_dir());
    assert!(!out.join("quasil_manifest.json").exists());
    // nothing after the failing call ran
    assert_eq!(h.runner.calls().last().unwrap().tool_name(), "fabber_asl");
}

#[tokio::test]
async fn test_missing_artifact_is_fatal() {
    let h = Harness::with_runner(RecordingToolRunner::new().silent("bet"));
    let err = h.run(RawOptions::default()).await.unwrap_err();

    assert!(matches!(err, QuasilError::MissingArtifact { stage: Stage::Mask, .. }));
    assert_eq!(h.scratch_entries(), 0);
}

#[tokio::test]
async fn test_debug_keeps_scratch_beside_invocation_dir() {
    let h = Harness::new();
    let result = h
        .run(RawOptions {
            debug: true,
            ..Default::default()
        })
        .await
        .expect("run failed");

    let kept = result.retained_scratch.expect("scratch should be retained");
    assert_eq!(kept.parent().unwrap(), h.root());
    assert!(kept.join("basil_options.txt").is_file());
    assert!(kept.join("asldiff.nii.gz").is_file());
    assert_eq!(h.scratch_entries(), 0);
}

#[tokio::test]
async fn test_repeated_runs_get_fresh_output_dirs() {
    let h = Harness::new();
    let first = h.run(RawOptions::default()).await.unwrap();
    let second = h.run(RawOptions::default()).await.unwrap();

    assert_ne!(first.output_dir, second.output_dir);
    assert_eq!(second.output_dir.file_name().unwrap(), "quasil_out+");
}

#[tokio::test]
async fn test_manifest_records_run() {
    let h = Harness::new();
    let result = h
        .run(RawOptions {
            region_stats: true,
            ..Default::default()
        })
        .await
        .unwrap();

    let manifest = read_manifest(&result.output_dir).unwrap();
    assert_eq!(manifest.run_id, result.run_id);
    assert_eq!(manifest.invocations.len(), h.runner.calls().len());
    assert_eq!(manifest.outputs.len(), 4);

    let basil = h
        .runner
        .captured_options()
        .into_iter()
        .find(|o| o.stage == Stage::ModelBased)
        .unwrap();
    let digest = manifest.model_specs.iter().find(|s| s.label == "basil").unwrap();
    assert_eq!(digest.sha256, digest_text(&basil.text));
    assert_eq!(digest.spatial_priors, "MNANII");

    let table = result.region_table.expect("region table");
    let text = std::fs::read_to_string(table).unwrap();
    assert!(text.starts_with("name\tNvoxels\tMean\tStd\tMedian\tIQR\n"));
    assert!(text.contains("brain\t250\t45.200000\t12.100000\t44.000000\t14.500000\n"));
}

#[tokio::test]
async fn test_region_stats_from_structural_without_correction() {
    let h = Harness::new();
    let anat = h.root().join("struc.anat");
    for name in ["T1_biascorr", "T1_fast_pve_1", "T1_fast_pve_2"] {
        touch_input_volume(&anat.join(name)).unwrap();
    }

    let result = h
        .run(RawOptions {
            fslanat: Some(PathBuf::from("struc.anat")),
            region_stats: true,
            ..Default::default()
        })
        .await
        .expect("run failed");

    // tissue fractions feed the table only
    for name in PV_ARTIFACTS.iter().chain(&["perfusion_gm"]) {
        assert!(!exists(&result.output_dir, name), "{name} unexpected");
    }
    assert!(exists(&result.output_dir, "perfusion"));

    let text = std::fs::read_to_string(result.region_table.expect("region table")).unwrap();
    let names: Vec<&str> = text.lines().skip(1).map(|l| l.split('\t').next().unwrap()).collect();
    assert_eq!(names, vec!["brain", "GM", "WM"]);
    let rois: Vec<_> = h
        .runner
        .calls_to("fslmaths")
        .into_iter()
        .filter(|c| c.stage == Stage::RegionStats)
        .collect();
    assert_eq!(rois.len(), 2);
    assert!(rois.iter().all(|c| c.args[1..4] == ["-thr", "0.8", "-bin"]));
}
