//! Typed access to the external imaging tools.
//!
//! [`Toolkit`] turns stage intents ("threshold this map", "fit this model")
//! into [`ToolInvocation`]s, runs them through a [`ToolRunner`], fails fast on
//! non-zero exits and missing outputs, and keeps a record of every call for
//! the run manifest.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::error::{QuasilError, Result};
use crate::obs;
use crate::runner::{ToolInvocation, ToolOutcome, ToolRunner};
use crate::stage::Stage;
use crate::volume::VolumeRef;

/// Where the toolkit lives.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ToolkitConfig {
    /// Toolkit installation root. Tools resolve to `<fsldir>/bin/<tool>`
    /// when set, otherwise through `PATH`.
    pub fsldir: Option<PathBuf>,
}

impl ToolkitConfig {
    /// Read the installation root from `FSLDIR`.
    pub fn from_env() -> Self {
        Self {
            fsldir: std::env::var_os("FSLDIR")
                .filter(|v| !v.is_empty())
                .map(PathBuf::from),
        }
    }

    /// Program path for a tool name.
    pub fn program(&self, tool: &str) -> String {
        match &self.fsldir {
            Some(root) => root.join("bin").join(tool).to_string_lossy().into_owned(),
            None => tool.to_string(),
        }
    }

    /// The 2mm standard-space T1 template shipped with the toolkit.
    pub fn standard_template(&self) -> Option<VolumeRef> {
        self.fsldir
            .as_ref()
            .map(|root| VolumeRef::new(root.join("data/standard/MNI152_T1_2mm")))
    }
}

/// One completed tool call, as kept for provenance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InvocationRecord {
    pub stage: Stage,
    pub program: String,
    pub args: Vec<String>,
    pub exit_code: i32,
    pub duration_ms: u64,
}

/// Spline interpolation order used when resampling fraction maps.
pub const SUPERSAMPLING_LEVEL: u32 = 4;

/// Typed front end to the external imaging tools.
pub struct Toolkit {
    runner: Arc<dyn ToolRunner>,
    config: ToolkitConfig,
    records: Mutex<Vec<InvocationRecord>>,
}

impl Toolkit {
    pub fn new(runner: Arc<dyn ToolRunner>, config: ToolkitConfig) -> Self {
        Self {
            runner,
            config,
            records: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &ToolkitConfig {
        &self.config
    }

    /// Every call made so far, in order.
    pub fn records(&self) -> Vec<InvocationRecord> {
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Run `tool` and fail unless it exits cleanly.
    pub async fn exec(&self, stage: Stage, tool: &str, args: Vec<String>) -> Result<ToolOutcome> {
        let invocation = ToolInvocation::new(stage, self.config.program(tool), args);
        obs::emit_tool_started(stage, tool);

        let outcome = self.runner.run(&invocation).await?;
        obs::emit_tool_finished(stage, tool, outcome.exit_code, outcome.duration_ms);

        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(InvocationRecord {
                stage,
                program: invocation.program.clone(),
                args: invocation.args,
                exit_code: outcome.exit_code,
                duration_ms: outcome.duration_ms,
            });

        if !outcome.passed() {
            return Err(QuasilError::ToolFailed {
                stage,
                program: invocation.program,
                exit_code: outcome.exit_code,
                stderr: outcome.stderr.trim().to_string(),
            });
        }
        Ok(outcome)
    }

    /// Fail with `MissingArtifact` unless `volume` exists.
    pub fn expect_volume(&self, stage: Stage, volume: &VolumeRef) -> Result<()> {
        if volume.exists() {
            Ok(())
        } else {
            Err(QuasilError::MissingArtifact {
                stage,
                path: volume.base().to_path_buf(),
            })
        }
    }

    /// Fail with `MissingArtifact` unless the plain file `path` exists.
    pub fn expect_file(&self, stage: Stage, path: &Path) -> Result<()> {
        if path.is_file() {
            Ok(())
        } else {
            Err(QuasilError::MissingArtifact {
                stage,
                path: path.to_path_buf(),
            })
        }
    }

    /// Voxelwise algebra: `fslmaths <input> <ops..> <out>`.
    pub async fn maths(
        &self,
        stage: Stage,
        input: &VolumeRef,
        ops: &[String],
        out: &VolumeRef,
    ) -> Result<()> {
        let mut args = vec![input.arg()];
        args.extend(ops.iter().cloned());
        args.push(out.arg());
        self.exec(stage, "fslmaths", args).await?;
        self.expect_volume(stage, out)
    }

    /// Copy a volume, whatever its on-disk suffix.
    pub async fn copy(&self, stage: Stage, from: &VolumeRef, to: &VolumeRef) -> Result<()> {
        self.exec(stage, "imcp", vec![from.arg(), to.arg()]).await?;
        self.expect_volume(stage, to)
    }

    /// Concatenate volumes along time.
    pub async fn merge(&self, stage: Stage, out: &VolumeRef, inputs: &[VolumeRef]) -> Result<()> {
        let mut args = vec!["-t".to_string(), out.arg()];
        args.extend(inputs.iter().map(VolumeRef::arg));
        self.exec(stage, "fslmerge", args).await?;
        self.expect_volume(stage, out)
    }

    /// Extract `len` volumes starting at `start`.
    pub async fn roi(
        &self,
        stage: Stage,
        input: &VolumeRef,
        out: &VolumeRef,
        start: usize,
        len: usize,
    ) -> Result<()> {
        let args = vec![input.arg(), out.arg(), start.to_string(), len.to_string()];
        self.exec(stage, "fslroi", args).await?;
        self.expect_volume(stage, out)
    }

    /// ASL-aware reordering, splitting and differencing. Callers check the
    /// outputs they asked for.
    pub async fn asl_file(&self, stage: Stage, args: Vec<String>) -> Result<()> {
        self.exec(stage, "asl_file", args).await.map(|_| ())
    }

    /// Brain extraction; returns the binary mask when `with_mask` is set.
    pub async fn bet(
        &self,
        stage: Stage,
        input: &VolumeRef,
        out: &VolumeRef,
        with_mask: bool,
    ) -> Result<Option<VolumeRef>> {
        let mut args = vec![input.arg(), out.arg()];
        if with_mask {
            args.push("-m".to_string());
        }
        self.exec(stage, "bet", args).await?;
        self.expect_volume(stage, out)?;

        if with_mask {
            let mask = out.with_suffix("_mask");
            self.expect_volume(stage, &mask)?;
            Ok(Some(mask))
        } else {
            Ok(None)
        }
    }

    /// Affine registration of `input` to `reference`, writing the matrix and
    /// optionally the resampled image. `init` seeds the search with an
    /// earlier registration.
    #[allow(clippy::too_many_arguments)]
    pub async fn flirt(
        &self,
        stage: Stage,
        input: &VolumeRef,
        reference: &VolumeRef,
        omat: &Path,
        out: Option<&VolumeRef>,
        init: Option<&Path>,
        dof: u32,
    ) -> Result<()> {
        let mut args = vec![
            "-in".to_string(),
            input.arg(),
            "-ref".to_string(),
            reference.arg(),
            "-omat".to_string(),
            omat.to_string_lossy().into_owned(),
            "-dof".to_string(),
            dof.to_string(),
        ];
        if let Some(init) = init {
            args.push("-init".to_string());
            args.push(init.to_string_lossy().into_owned());
        }
        if let Some(out) = out {
            args.push("-out".to_string());
            args.push(out.arg());
        }
        self.exec(stage, "flirt", args).await?;
        self.expect_file(stage, omat)?;
        if let Some(out) = out {
            self.expect_volume(stage, out)?;
        }
        Ok(())
    }

    /// Invert an affine matrix.
    pub async fn invert_xfm(&self, stage: Stage, input: &Path, out: &Path) -> Result<()> {
        let args = vec![
            "-omat".to_string(),
            out.to_string_lossy().into_owned(),
            "-inverse".to_string(),
            input.to_string_lossy().into_owned(),
        ];
        self.exec(stage, "convert_xfm", args).await?;
        self.expect_file(stage, out)
    }

    /// Resample `input` into the grid of `reference` through `premat`, using
    /// spline interpolation with supersampling.
    pub async fn applywarp(
        &self,
        stage: Stage,
        input: &VolumeRef,
        reference: &VolumeRef,
        premat: &Path,
        out: &VolumeRef,
    ) -> Result<()> {
        let args = vec![
            format!("--in={}", input.arg()),
            format!("--ref={}", reference.arg()),
            format!("--premat={}", premat.display()),
            format!("--out={}", out.arg()),
            "--super".to_string(),
            format!("--superlevel={SUPERSAMPLING_LEVEL}"),
            "--interp=spline".to_string(),
        ];
        self.exec(stage, "applywarp", args).await?;
        self.expect_volume(stage, out)
    }

    /// Three-class tissue segmentation. Returns the CSF, grey and white
    /// matter partial volume estimates in that order.
    pub async fn fast(&self, stage: Stage, input: &VolumeRef, out: &VolumeRef) -> Result<[VolumeRef; 3]> {
        let args = vec![
            "-t".to_string(),
            "1".to_string(),
            "-n".to_string(),
            "3".to_string(),
            "-o".to_string(),
            out.arg(),
            input.arg(),
        ];
        self.exec(stage, "fast", args).await?;

        let pves = [
            out.with_suffix("_pve_0"),
            out.with_suffix("_pve_1"),
            out.with_suffix("_pve_2"),
        ];
        for pve in &pves {
            self.expect_volume(stage, pve)?;
        }
        Ok(pves)
    }

    /// Run the Bayesian fitting engine with a model specification file.
    pub async fn fabber(
        &self,
        stage: Stage,
        data: &VolumeRef,
        mask: &VolumeRef,
        out_dir: &Path,
        options_file: &Path,
    ) -> Result<()> {
        let args = vec![
            format!("--data={}", data.arg()),
            format!("--mask={}", mask.arg()),
            format!("--output={}", out_dir.display()),
            "--data-order=singlefile".to_string(),
            "--save-model-fit".to_string(),
            "-@".to_string(),
            options_file.to_string_lossy().into_owned(),
        ];
        self.exec(stage, "fabber_asl", args).await.map(|_| ())
    }

    /// Run the external calibration routine.
    pub async fn asl_calib(&self, stage: Stage, args: Vec<String>) -> Result<()> {
        self.exec(stage, "asl_calib", args).await.map(|_| ())
    }

    /// Run the model-free deconvolution solver.
    pub async fn asl_mfree(&self, stage: Stage, args: Vec<String>) -> Result<()> {
        self.exec(stage, "asl_mfree", args).await.map(|_| ())
    }

    /// Image statistics within `mask`; returns the tool's stdout.
    pub async fn stats(
        &self,
        stage: Stage,
        input: &VolumeRef,
        mask: &VolumeRef,
        options: &[&str],
    ) -> Result<String> {
        let mut args = vec![input.arg(), "-k".to_string(), mask.arg()];
        args.extend(options.iter().map(|o| o.to_string()));
        let outcome = self.exec(stage, "fslstats", args).await?;
        Ok(outcome.stdout)
    }
}
