//! External tool execution.

use std::process::Stdio;
use std::time::Instant;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;

use crate::error::{QuasilError, Result};
use crate::stage::Stage;

/// A single external tool call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ToolInvocation {
    /// Stage on whose behalf the tool runs.
    pub stage: Stage,

    /// Executable name or path.
    pub program: String,

    /// Arguments, in order.
    pub args: Vec<String>,
}

impl ToolInvocation {
    pub fn new(stage: Stage, program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            stage,
            program: program.into(),
            args,
        }
    }

    /// Executable name without any directory prefix.
    pub fn tool_name(&self) -> &str {
        self.program
            .rsplit(|c: char| c == '/' || c == '\\')
            .next()
            .unwrap_or(&self.program)
    }
}

/// Result of a tool execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolOutcome {
    /// Exit code (0 = success).
    pub exit_code: i32,

    /// Captured stdout.
    pub stdout: String,

    /// Captured stderr.
    pub stderr: String,

    /// Duration in milliseconds.
    pub duration_ms: u64,

    /// Whether execution succeeded.
    pub success: bool,
}

impl ToolOutcome {
    /// Whether this call passed (exit code 0).
    pub fn passed(&self) -> bool {
        self.success && self.exit_code == 0
    }
}

/// Executes external tools. Calls block until the tool exits; there is no
/// timeout and no retry.
#[async_trait]
pub trait ToolRunner: Send + Sync {
    /// Run the tool and report how it exited. An `Err` means the tool could
    /// not be started at all.
    async fn run(&self, invocation: &ToolInvocation) -> Result<ToolOutcome>;
}

/// Runs tools as child processes.
#[derive(Debug, Default)]
pub struct ProcessToolRunner;

#[async_trait]
impl ToolRunner for ProcessToolRunner {
    async fn run(&self, invocation: &ToolInvocation) -> Result<ToolOutcome> {
        let start = Instant::now();

        let child = Command::new(&invocation.program)
            .args(&invocation.args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| QuasilError::ToolSpawn {
                stage: invocation.stage,
                program: invocation.program.clone(),
                source,
            })?;

        let output = child.wait_with_output().await?;

        let duration_ms = start.elapsed().as_millis() as u64;
        let exit_code = output.status.code().unwrap_or(-1);

        Ok(ToolOutcome {
            exit_code,
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            duration_ms,
            success: output.status.success(),
        })
    }
}
