//! Estimation strategies.
//!
//! Exactly one strategy runs per pipeline. Each produces the raw fitted
//! volumes that [`crate::output`] later calibrates and names.

pub mod model_based;
pub mod model_free;

pub use model_based::{ModelBasedFit, PriorSlots};
pub use model_free::ModelFreeFit;

use crate::calibrate::CalibrationResult;
use crate::config::{AnalysisStrategy, PipelineConfig};
use crate::error::Result;
use crate::model_spec::ModelSpec;
use crate::pvcorr::PvMaps;
use crate::reshape::PreparedData;
use crate::toolkit::Toolkit;
use crate::workspace::Workspace;

/// Raw result of whichever strategy ran.
#[derive(Debug, Clone, PartialEq)]
pub enum AnalysisOutcome {
    ModelBased(ModelBasedFit),
    ModelFree(ModelFreeFit),
}

impl AnalysisOutcome {
    /// Model specifications submitted to the fitting engine, labelled.
    pub fn specs(&self) -> Vec<(&'static str, &ModelSpec)> {
        match self {
            AnalysisOutcome::ModelBased(fit) => vec![("basil", &fit.spec)],
            AnalysisOutcome::ModelFree(fit) => vec![("aif", &fit.aif_spec)],
        }
    }
}

pub async fn run(
    toolkit: &Toolkit,
    ws: &Workspace,
    config: &PipelineConfig,
    data: &PreparedData,
    calib: &CalibrationResult,
    pv: Option<&PvMaps>,
) -> Result<AnalysisOutcome> {
    match config.strategy {
        AnalysisStrategy::ModelBased => model_based::run(toolkit, ws, config, data, calib, pv)
            .await
            .map(AnalysisOutcome::ModelBased),
        AnalysisStrategy::ModelFree => model_free::run(toolkit, ws, config, data, calib)
            .await
            .map(AnalysisOutcome::ModelFree),
    }
}
