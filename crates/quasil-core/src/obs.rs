//! Structured observability hooks for the run lifecycle.
//!
//! This module provides:
//! - A run-scoped tracing span, [`run_span`], to instrument a run with
//! - Emission functions for stage boundaries, tool calls and workspace events
//!
//! Events are emitted at `info!` level (tool calls at `debug!`), filtered by
//! `RUST_LOG`.

use std::path::Path;

use tracing::{debug, info, warn, Span};

use crate::stage::Stage;

/// Run-scoped span; every event emitted inside it carries the run id.
///
/// # Example
///
/// ```ignore
/// async { /* stages */ }.instrument(run_span("3f0c...")).await
/// ```
pub fn run_span(run_id: &str) -> Span {
    tracing::info_span!("quasil.run", run_id = %run_id)
}

pub fn emit_run_started(run_id: &str, input: &Path, strategy: &str) {
    info!(
        event = "run.started",
        run_id = %run_id,
        input = %input.display(),
        strategy = %strategy,
    );
}

pub fn emit_run_finished(run_id: &str, duration_ms: u64, outputs: usize) {
    info!(
        event = "run.finished",
        run_id = %run_id,
        duration_ms = duration_ms,
        outputs = outputs,
    );
}

pub fn emit_run_failed(run_id: &str, error: &dyn std::fmt::Display) {
    warn!(event = "run.failed", run_id = %run_id, error = %error);
}

pub fn emit_stage_started(stage: Stage) {
    info!(event = "stage.started", stage = %stage);
}

pub fn emit_stage_finished(stage: Stage, duration_ms: u64) {
    info!(event = "stage.finished", stage = %stage, duration_ms = duration_ms);
}

pub fn emit_tool_started(stage: Stage, tool: &str) {
    debug!(event = "tool.started", stage = %stage, tool = %tool);
}

/// Non-zero exits are logged at warn level.
pub fn emit_tool_finished(stage: Stage, tool: &str, exit_code: i32, duration_ms: u64) {
    if exit_code == 0 {
        debug!(
            event = "tool.finished",
            stage = %stage,
            tool = %tool,
            duration_ms = duration_ms,
        );
    } else {
        warn!(
            event = "tool.failed",
            stage = %stage,
            tool = %tool,
            exit_code = exit_code,
            duration_ms = duration_ms,
        );
    }
}

pub fn emit_workspace_allocated(output_dir: &Path, scratch_dir: &Path) {
    info!(
        event = "workspace.allocated",
        output_dir = %output_dir.display(),
        scratch_dir = %scratch_dir.display(),
    );
}

pub fn emit_workspace_released(scratch_dir: &Path, retained_at: Option<&Path>) {
    match retained_at {
        Some(dest) => info!(
            event = "workspace.retained",
            scratch_dir = %scratch_dir.display(),
            retained_at = %dest.display(),
        ),
        None => debug!(event = "workspace.removed", scratch_dir = %scratch_dir.display()),
    }
}
