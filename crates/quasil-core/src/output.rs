//! Final result volumes.
//!
//! Raw fitted maps are calibrated, masked where partial volume correction
//! ran, and written into the output directory under their published names.

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::analysis::{AnalysisOutcome, ModelBasedFit, ModelFreeFit};
use crate::calibrate::{CalibrationResult, Scaling};
use crate::error::Result;
use crate::pvcorr::PvMaps;
use crate::stage::Stage;
use crate::toolkit::Toolkit;
use crate::volume::VolumeRef;
use crate::workspace::Workspace;

/// Converts fitted perfusion to ml/100g/min.
pub const PERFUSION_UNITS: f64 = 6000.0;

/// One published result volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultVolume {
    pub name: String,
    pub volume: VolumeRef,
}

/// Named result volumes of a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub volumes: Vec<ResultVolume>,
}

impl AnalysisResult {
    pub fn get(&self, name: &str) -> Option<&VolumeRef> {
        self.volumes.iter().find(|r| r.name == name).map(|r| &r.volume)
    }

    pub fn names(&self) -> Vec<&str> {
        self.volumes.iter().map(|r| r.name.as_str()).collect()
    }
}

/// Multiplier applied to deconvolved magnitude: unit conversion and the
/// inverse bolus duration, since the AIFs were normalised to unit area.
pub fn model_free_multiplier(tau: f64) -> f64 {
    PERFUSION_UNITS / tau
}

/// Writes result volumes into the output directory.
pub struct OutputAssembler<'a> {
    toolkit: &'a Toolkit,
    ws: &'a Workspace,
    scaling: &'a Scaling,
    result: AnalysisResult,
}

impl<'a> OutputAssembler<'a> {
    pub fn new(toolkit: &'a Toolkit, ws: &'a Workspace, calib: &'a CalibrationResult) -> Self {
        Self {
            toolkit,
            ws,
            scaling: &calib.scaling,
            result: AnalysisResult::default(),
        }
    }

    pub async fn assemble(
        mut self,
        outcome: &AnalysisOutcome,
        pv: Option<&PvMaps>,
        tau: f64,
    ) -> Result<AnalysisResult> {
        match outcome {
            AnalysisOutcome::ModelBased(fit) => self.model_based(fit, pv).await?,
            AnalysisOutcome::ModelFree(fit) => self.model_free(fit, tau).await?,
        }
        info!(outputs = ?self.result.names(), "results written");
        Ok(self.result)
    }

    async fn model_based(&mut self, fit: &ModelBasedFit, pv: Option<&PvMaps>) -> Result<()> {
        let (perfusion_name, gm_mask) = match pv {
            Some(maps) => ("perfusion_gm", Some(&maps.gm_mask)),
            None => ("perfusion", None),
        };
        self.calibrated(perfusion_name, &fit.mean("ftiss"), PERFUSION_UNITS, gm_mask)
            .await?;
        self.copied("perfusion_raw", &fit.mean("ftiss")).await?;
        self.copied("arrival", &fit.mean("delttiss")).await?;
        self.calibrated("aCBV", &fit.mean("fblood"), 1.0, None).await?;
        if fit.features.infer_tau {
            self.copied("bolus_duration", &fit.mean("tautiss")).await?;
        }

        if let Some(maps) = pv {
            self.calibrated("perfusion_wm", &fit.mean("fwm"), PERFUSION_UNITS, Some(&maps.wm_mask))
                .await?;
            self.copied("perfusion_wm_raw", &fit.mean("fwm")).await?;
            self.copied("arrival_wm", &fit.mean("deltwm")).await?;
        }
        Ok(())
    }

    async fn model_free(&mut self, fit: &ModelFreeFit, tau: f64) -> Result<()> {
        self.calibrated("perfusion", &fit.magnitude, model_free_multiplier(tau), None)
            .await?;
        self.copied("aCBV", &fit.acbv).await
    }

    /// Divide by M0, multiply, optionally mask.
    async fn calibrated(
        &mut self,
        name: &str,
        source: &VolumeRef,
        multiplier: f64,
        mask: Option<&VolumeRef>,
    ) -> Result<()> {
        let mut ops = self.scaling.ops(multiplier);
        if let Some(mask) = mask {
            ops.push("-mas".to_string());
            ops.push(mask.arg());
        }
        let dest = self.ws.output(name);
        self.toolkit.maths(Stage::Output, source, &ops, &dest).await?;
        self.push(name, dest);
        Ok(())
    }

    async fn copied(&mut self, name: &str, source: &VolumeRef) -> Result<()> {
        let dest = self.ws.output(name);
        self.toolkit.copy(Stage::Output, source, &dest).await?;
        self.push(name, dest);
        Ok(())
    }

    fn push(&mut self, name: &str, volume: VolumeRef) {
        self.result.volumes.push(ResultVolume {
            name: name.to_string(),
            volume,
        });
    }
}
