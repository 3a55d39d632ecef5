//! quasil - QUASAR ASL quantification pipeline
//!
//! Turns a raw QUASAR arterial spin labelling acquisition into perfusion,
//! arrival time and arterial blood volume maps by driving external imaging
//! tools:
//! - Resolves command-line options into an immutable run configuration
//! - Reshapes, calibrates and optionally partial-volume corrects the data
//! - Runs either the model-based Bayesian fit or model-free deconvolution
//! - Writes calibrated result volumes and a provenance manifest

pub mod analysis;
pub mod calibrate;
pub mod config;
pub mod error;
pub mod fakes;
pub mod manifest;
pub mod model_spec;
pub mod obs;
pub mod output;
pub mod pipeline;
pub mod pvcorr;
pub mod region_stats;
pub mod reshape;
pub mod runner;
pub mod stage;
pub mod telemetry;
pub mod toolkit;
pub mod volume;
pub mod workspace;

// Re-export key types
pub use analysis::{AnalysisOutcome, PriorSlots};
pub use calibrate::{CalibrationResult, Scaling};
pub use config::{
    AcquisitionLayout, AnalysisStrategy, CalibrationMode, ConfigResolver, Dispersion, PipelineConfig,
    PvCorrection, RawOptions,
};
pub use error::{QuasilError, Result};
pub use model_spec::{ModelSpec, ModelSpecBuilder, PriorKind};
pub use output::AnalysisResult;
pub use pipeline::{PipelineResult, QuasilPipeline};
pub use pvcorr::{PvMaps, TissueFractions};
pub use runner::{ProcessToolRunner, ToolInvocation, ToolOutcome, ToolRunner};
pub use stage::Stage;
pub use telemetry::init_tracing;
pub use toolkit::{Toolkit, ToolkitConfig};
pub use volume::VolumeRef;
pub use workspace::{Workspace, WorkspaceOptions};
