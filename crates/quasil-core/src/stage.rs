//! Pipeline stage identities.

use serde::{Deserialize, Serialize};

/// Stages of a quantification run, in execution order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Canonical reshaping and tag/control differencing.
    Reshape,

    /// Brain mask derivation or adoption.
    Mask,

    /// Magnetization reference and tissue T1.
    Calibration,

    /// Grey/white matter fraction maps and masks.
    PartialVolume,

    /// Kinetic model fit.
    ModelBased,

    /// AIF fit and deconvolution.
    ModelFree,

    /// Scaling, masking and naming of result volumes.
    Output,

    /// Perfusion statistics within regions of interest.
    RegionStats,
}

impl Stage {
    /// Get the stage name as a string.
    pub fn name(&self) -> &'static str {
        match self {
            Stage::Reshape => "reshape",
            Stage::Mask => "mask",
            Stage::Calibration => "calibration",
            Stage::PartialVolume => "partial_volume",
            Stage::ModelBased => "model_based",
            Stage::ModelFree => "model_free",
            Stage::Output => "output",
            Stage::RegionStats => "region_stats",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
