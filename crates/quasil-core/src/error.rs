//! Error taxonomy for the quantification pipeline.

use std::path::PathBuf;

use crate::stage::Stage;

/// Errors produced while resolving options or running the pipeline.
#[derive(Debug, thiserror::Error)]
pub enum QuasilError {
    #[error("invalid option --{field}='{value}': {reason}")]
    Config {
        field: &'static str,
        value: String,
        reason: String,
    },

    #[error("input dataset not found: {}", .0.display())]
    MissingInput(PathBuf),

    #[error("could not allocate an output directory from {} after {attempts} attempts", base.display())]
    WorkspaceExhausted { base: PathBuf, attempts: usize },

    #[error("{stage} stage: failed to launch {program}: {source}")]
    ToolSpawn {
        stage: Stage,
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{stage} stage: {program} exited with code {exit_code}: {stderr}")]
    ToolFailed {
        stage: Stage,
        program: String,
        exit_code: i32,
        stderr: String,
    },

    #[error("{stage} stage: expected artifact missing: {}", path.display())]
    MissingArtifact { stage: Stage, path: PathBuf },

    #[error("image prior slots {actual} do not match the expected layout {expected}")]
    PriorSlotMismatch { expected: String, actual: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl QuasilError {
    /// Build a configuration error for a named option.
    pub fn config(field: &'static str, value: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Config {
            field,
            value: value.into(),
            reason: reason.into(),
        }
    }

    /// The stage an external tool failure belongs to, if any.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            Self::ToolSpawn { stage, .. }
            | Self::ToolFailed { stage, .. }
            | Self::MissingArtifact { stage, .. } => Some(*stage),
            _ => None,
        }
    }
}

/// Result type for pipeline operations.
pub type Result<T> = std::result::Result<T, QuasilError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_display() {
        let err = QuasilError::config("tis", "0.1,abc", "not a number");
        let msg = err.to_string();
        assert!(msg.contains("--tis"));
        assert!(msg.contains("0.1,abc"));
        assert!(msg.contains("not a number"));
        assert!(err.stage().is_none());
    }

    #[test]
    fn test_tool_failure_names_stage() {
        let err = QuasilError::ToolFailed {
            stage: Stage::Calibration,
            program: "fabber_asl".to_string(),
            exit_code: 3,
            stderr: "bad options".to_string(),
        };
        assert!(err.to_string().starts_with("calibration stage"));
        assert_eq!(err.stage(), Some(Stage::Calibration));
    }

    #[test]
    fn test_workspace_exhausted_display() {
        let err = QuasilError::WorkspaceExhausted {
            base: PathBuf::from("/data/out"),
            attempts: 20,
        };
        assert!(err.to_string().contains("/data/out"));
        assert!(err.to_string().contains("20"));
    }
}
