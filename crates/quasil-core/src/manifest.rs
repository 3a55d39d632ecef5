//! Run manifest persistence.
//!
//! A [`RunManifest`] records what a completed run did: the resolved
//! configuration, every external tool call, the published volumes and a
//! SHA-256 digest of each model specification handed to the fitting engine.
//! It is written to `<output>/quasil_manifest.json`.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::{AnalysisStrategy, PipelineConfig};
use crate::error::Result;
use crate::model_spec::ModelSpec;
use crate::output::ResultVolume;
use crate::toolkit::InvocationRecord;

/// File name inside the output directory.
pub const MANIFEST_FILE: &str = "quasil_manifest.json";

/// Digest of one submitted model specification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpecDigest {
    /// Which fit it configured (`satrecov`, `basil`, `aif`).
    pub label: String,
    /// SHA-256 hex digest of the rendered text.
    pub sha256: String,
    /// Number of inferred parameters.
    pub param_count: usize,
    /// Spatial prior string.
    pub spatial_priors: String,
}

impl SpecDigest {
    pub fn of(label: &str, spec: &ModelSpec) -> Self {
        Self {
            label: label.to_string(),
            sha256: digest_text(&spec.to_text()),
            param_count: spec.params().len(),
            spatial_priors: spec.spatial_priors(),
        }
    }
}

/// SHA-256 hex digest of a text.
pub fn digest_text(text: &str) -> String {
    hex::encode(Sha256::digest(text.as_bytes()))
}

/// Provenance record of a completed run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunManifest {
    pub run_id: String,
    pub tool_version: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub strategy: AnalysisStrategy,
    pub config: PipelineConfig,
    pub output_dir: PathBuf,
    pub invocations: Vec<InvocationRecord>,
    pub outputs: Vec<ResultVolume>,
    pub model_specs: Vec<SpecDigest>,
}

/// Write the manifest into `output_dir`, returning its path.
pub fn write_manifest(manifest: &RunManifest, output_dir: &Path) -> Result<PathBuf> {
    let path = output_dir.join(MANIFEST_FILE);
    let json = serde_json::to_vec_pretty(manifest)?;
    std::fs::write(&path, json)?;
    Ok(path)
}

/// Read a manifest back from `output_dir`.
pub fn read_manifest(output_dir: &Path) -> Result<RunManifest> {
    let json = std::fs::read(output_dir.join(MANIFEST_FILE))?;
    Ok(serde_json::from_slice(&json)?)
}
