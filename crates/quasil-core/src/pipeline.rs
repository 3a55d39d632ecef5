//! Pipeline orchestration.
//!
//! [`QuasilPipeline::run`] checks inputs, allocates the workspace, runs the
//! stages strictly in order and writes the run manifest. The scratch
//! directory is released on every exit path: explicitly on success, by the
//! workspace's `Drop` on any early return.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tracing::{info, warn, Instrument};
use uuid::Uuid;

use crate::analysis::{self, AnalysisOutcome};
use crate::calibrate;
use crate::config::{AnalysisStrategy, PipelineConfig, PvCorrection};
use crate::error::{QuasilError, Result};
use crate::manifest::{write_manifest, RunManifest, SpecDigest};
use crate::obs;
use crate::output::{AnalysisResult, OutputAssembler};
use crate::pvcorr;
use crate::region_stats;
use crate::reshape;
use crate::runner::ToolRunner;
use crate::stage::Stage;
use crate::toolkit::{Toolkit, ToolkitConfig};
use crate::volume::VolumeRef;
use crate::workspace::{Workspace, WorkspaceOptions};

/// Result of a completed run.
#[derive(Debug, Clone)]
pub struct PipelineResult {
    pub run_id: String,

    /// Absolute output directory.
    pub output_dir: PathBuf,

    /// Published result volumes.
    pub outputs: AnalysisResult,

    pub manifest_path: PathBuf,

    /// Region statistics table, when requested.
    pub region_table: Option<PathBuf>,

    /// Where the scratch directory was kept in debug mode.
    pub retained_scratch: Option<PathBuf>,

    pub duration_ms: u64,
}

/// What the stages hand back to the orchestrator.
struct StageOutputs {
    outputs: AnalysisResult,
    specs: Vec<SpecDigest>,
    region_table: Option<PathBuf>,
}

/// Runs the quantification pipeline against a [`ToolRunner`].
pub struct QuasilPipeline {
    runner: Arc<dyn ToolRunner>,
    toolkit_config: ToolkitConfig,
    workspace: WorkspaceOptions,
}

impl QuasilPipeline {
    pub fn new(runner: Arc<dyn ToolRunner>, toolkit_config: ToolkitConfig, workspace: WorkspaceOptions) -> Self {
        Self {
            runner,
            toolkit_config,
            workspace,
        }
    }

    /// Execute one run.
    pub async fn run(&self, config: &PipelineConfig) -> Result<PipelineResult> {
        let run_id = Uuid::new_v4().to_string();
        self.execute(&run_id, config)
            .instrument(obs::run_span(&run_id))
            .await
    }

    async fn execute(&self, run_id: &str, config: &PipelineConfig) -> Result<PipelineResult> {
        let started_at = Utc::now();
        let start = Instant::now();
        let toolkit = Toolkit::new(self.runner.clone(), self.toolkit_config.clone());

        preflight(config, &toolkit)?;
        if let Some(dir) = config.unused_fslanat() {
            warn!(fslanat = %dir.display(), "--fslanat given without --pvcorr or --regionstats; ignoring");
        }
        let strategy = serde_json::to_value(config.strategy)?;
        obs::emit_run_started(run_id, &config.input, strategy.as_str().unwrap_or_default());

        let options = self.workspace.clone().with_debug(config.debug);
        let mut ws = Workspace::allocate(&config.output_base, &options)?;

        let staged = match run_stages(&toolkit, &ws, config).await {
            Ok(staged) => staged,
            Err(e) => {
                obs::emit_run_failed(run_id, &e);
                return Err(e);
            }
        };

        let manifest = RunManifest {
            run_id: run_id.to_string(),
            tool_version: env!("CARGO_PKG_VERSION").to_string(),
            started_at,
            finished_at: Utc::now(),
            strategy: config.strategy,
            config: config.clone(),
            output_dir: ws.output_dir().to_path_buf(),
            invocations: toolkit.records(),
            outputs: staged.outputs.volumes.clone(),
            model_specs: staged.specs,
        };
        let manifest_path = write_manifest(&manifest, ws.output_dir())?;

        let output_dir = ws.output_dir().to_path_buf();
        let retained_scratch = ws.release();
        let duration_ms = start.elapsed().as_millis() as u64;
        obs::emit_run_finished(run_id, duration_ms, staged.outputs.volumes.len());

        Ok(PipelineResult {
            run_id: run_id.to_string(),
            output_dir,
            outputs: staged.outputs,
            manifest_path,
            region_table: staged.region_table,
            retained_scratch,
            duration_ms,
        })
    }
}

/// Checks that need no workspace: inputs exist and the requested plan can
/// run with the toolkit available.
fn preflight(config: &PipelineConfig, toolkit: &Toolkit) -> Result<()> {
    if !VolumeRef::new(&config.input).exists() {
        return Err(QuasilError::MissingInput(config.input.clone()));
    }
    if let Some(mask) = &config.mask {
        if !VolumeRef::new(mask).exists() {
            return Err(QuasilError::MissingInput(mask.clone()));
        }
    }
    if let Some(fslanat) = &config.fslanat {
        let read = config.pv_correction.enabled() || config.region_stats;
        if read && !fslanat.is_dir() {
            return Err(QuasilError::MissingInput(fslanat.clone()));
        }
    }
    match &config.pv_correction {
        PvCorrection::SelfSegmented if toolkit.config().standard_template().is_none() => Err(QuasilError::config(
            "pvcorr",
            "",
            "FSLDIR must be set to segment without --fslanat",
        )),
        _ => Ok(()),
    }
}

async fn run_stages(toolkit: &Toolkit, ws: &Workspace, config: &PipelineConfig) -> Result<StageOutputs> {
    let data = timed(Stage::Reshape, reshape::prepare(toolkit, ws, config)).await?;
    let calib = timed(Stage::Calibration, calibrate::calibrate(toolkit, ws, config, &data)).await?;
    let pv = timed(Stage::PartialVolume, pvcorr::estimate(toolkit, ws, config, &calib)).await?;

    let analysis_stage = match config.strategy {
        AnalysisStrategy::ModelBased => Stage::ModelBased,
        AnalysisStrategy::ModelFree => Stage::ModelFree,
    };
    let outcome: AnalysisOutcome = timed(
        analysis_stage,
        analysis::run(toolkit, ws, config, &data, &calib, pv.as_ref()),
    )
    .await?;

    let outputs = timed(
        Stage::Output,
        OutputAssembler::new(toolkit, ws, &calib).assemble(&outcome, pv.as_ref(), config.timing.tau),
    )
    .await?;

    let region_table = if config.region_stats {
        let tissue = match (&pv, &config.fslanat) {
            (Some(maps), _) => Some(maps.fractions()),
            (None, Some(fslanat)) => Some(
                timed(
                    Stage::PartialVolume,
                    pvcorr::region_fractions(toolkit, ws, fslanat, &calib),
                )
                .await?,
            ),
            (None, None) => None,
        };
        Some(
            timed(
                Stage::RegionStats,
                region_stats::analyse(toolkit, ws, &data.mask, &outputs, tissue.as_ref()),
            )
            .await?,
        )
    } else {
        None
    };

    let mut specs = Vec::new();
    if let Some(spec) = &calib.spec {
        specs.push(SpecDigest::of("satrecov", spec));
    }
    for (label, spec) in outcome.specs() {
        specs.push(SpecDigest::of(label, spec));
    }
    info!(outputs = outputs.volumes.len(), "all stages complete");

    Ok(StageOutputs {
        outputs,
        specs,
        region_table,
    })
}

async fn timed<T>(stage: Stage, work: impl Future<Output = Result<T>>) -> Result<T> {
    obs::emit_stage_started(stage);
    let start = Instant::now();
    let out = work.await?;
    obs::emit_stage_finished(stage, start.elapsed().as_millis() as u64);
    Ok(out)
}
