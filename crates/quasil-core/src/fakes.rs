//! In-memory fake of the external toolkit (testing only)
//!
//! `RecordingToolRunner` satisfies the [`ToolRunner`] contract without any
//! imaging software installed: it records every invocation, fabricates the
//! files each tool would have written, and can be told to fail or to stay
//! silent for a named tool.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::Result;
use crate::runner::{ToolInvocation, ToolOutcome, ToolRunner};
use crate::stage::Stage;

/// Scalar M0 written by the fake external calibration.
pub const FAKE_CALIBRATION_M0: f64 = 1500.0;

/// Output of the fake statistics tool: voxels, volume, mean, std, then the
/// 50th, 25th and 75th percentiles.
pub const FAKE_STATS_LINE: &str = "250 2000.000000 45.200000 12.100000 44.000000 38.000000 52.500000 \n";

/// Parameter maps fabricated for every fitting engine run.
const FABBER_OUTPUTS: [&str; 12] = [
    "mean_ftiss",
    "mean_delttiss",
    "mean_tautiss",
    "mean_fblood",
    "mean_deltblood",
    "mean_fwm",
    "mean_deltwm",
    "mean_T1t",
    "mean_T1b",
    "mean_g",
    "mean_M0t",
    "modelfit",
];

/// Options file handed to the fitting engine, captured at call time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedOptions {
    pub stage: Stage,
    pub text: String,
}

/// Fake `ToolRunner` that records calls and fabricates outputs.
#[derive(Debug, Default)]
pub struct RecordingToolRunner {
    calls: Mutex<Vec<ToolInvocation>>,
    options: Mutex<Vec<CapturedOptions>>,
    failing: HashSet<String>,
    silent: HashSet<String>,
}

impl RecordingToolRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `tool` exit with status 1.
    pub fn failing(mut self, tool: &str) -> Self {
        self.failing.insert(tool.to_string());
        self
    }

    /// Make `tool` succeed without writing anything.
    pub fn silent(mut self, tool: &str) -> Self {
        self.silent.insert(tool.to_string());
        self
    }

    /// All invocations so far.
    pub fn calls(&self) -> Vec<ToolInvocation> {
        self.calls.lock().unwrap().clone()
    }

    /// Invocations of one tool.
    pub fn calls_to(&self, tool: &str) -> Vec<ToolInvocation> {
        self.calls()
            .into_iter()
            .filter(|c| c.tool_name() == tool)
            .collect()
    }

    /// Options files given to the fitting engine, in call order.
    pub fn captured_options(&self) -> Vec<CapturedOptions> {
        self.options.lock().unwrap().clone()
    }

    fn fabricate(&self, call: &ToolInvocation) -> std::io::Result<String> {
        let args = &call.args;
        match call.tool_name() {
            "fslmaths" | "imcp" => {
                if let Some(out) = args.last() {
                    touch_volume(out)?;
                }
            }
            "fslmerge" | "fslroi" => {
                if let Some(out) = args.get(1) {
                    touch_volume(out)?;
                }
            }
            "bet" => {
                if let Some(out) = args.get(1) {
                    touch_volume(out)?;
                    if args.iter().any(|a| a == "-m") {
                        touch_volume(&format!("{out}_mask"))?;
                    }
                }
            }
            "asl_file" => fabricate_asl_file(args)?,
            "fabber_asl" => {
                if let Some(dir) = value_of(args, "--output=") {
                    std::fs::create_dir_all(dir)?;
                    for name in FABBER_OUTPUTS {
                        touch_volume(&format!("{dir}/{name}"))?;
                    }
                }
                if let Some(path) = args
                    .iter()
                    .position(|a| a == "-@")
                    .and_then(|i| args.get(i + 1))
                {
                    let text = std::fs::read_to_string(path)?;
                    self.options.lock().unwrap().push(CapturedOptions {
                        stage: call.stage,
                        text,
                    });
                }
            }
            "asl_calib" => {
                if let Some(dir) = flag_value(args, "-o") {
                    std::fs::create_dir_all(dir)?;
                    std::fs::write(format!("{dir}/M0.txt"), format!("{FAKE_CALIBRATION_M0}\n"))?;
                    touch_volume(&format!("{dir}/T1t"))?;
                }
            }
            "flirt" => {
                if let Some(mat) = flag_value(args, "-omat") {
                    std::fs::write(mat, "1 0 0 0\n0 1 0 0\n0 0 1 0\n0 0 0 1\n")?;
                }
                if let Some(out) = flag_value(args, "-out") {
                    touch_volume(out)?;
                }
            }
            "convert_xfm" => {
                if let Some(mat) = flag_value(args, "-omat") {
                    std::fs::write(mat, "1 0 0 0\n0 1 0 0\n0 0 1 0\n0 0 0 1\n")?;
                }
            }
            "applywarp" => {
                if let Some(out) = value_of(args, "--out=") {
                    touch_volume(out)?;
                }
            }
            "fast" => {
                if let Some(base) = flag_value(args, "-o") {
                    for class in 0..3 {
                        touch_volume(&format!("{base}_pve_{class}"))?;
                    }
                }
            }
            "asl_mfree" => {
                if let Some(out) = value_of(args, "--out=") {
                    touch_volume(&format!("{out}_mag"))?;
                }
            }
            "fslstats" => return Ok(FAKE_STATS_LINE.to_string()),
            _ => {}
        }
        Ok(String::new())
    }
}

#[async_trait]
impl ToolRunner for RecordingToolRunner {
    async fn run(&self, invocation: &ToolInvocation) -> Result<ToolOutcome> {
        self.calls.lock().unwrap().push(invocation.clone());
        let tool = invocation.tool_name();

        if self.failing.contains(tool) {
            return Ok(ToolOutcome {
                exit_code: 1,
                stdout: String::new(),
                stderr: format!("{tool}: simulated failure"),
                duration_ms: 0,
                success: false,
            });
        }

        let stdout = if self.silent.contains(tool) {
            String::new()
        } else {
            self.fabricate(invocation)?
        };

        Ok(ToolOutcome {
            exit_code: 0,
            stdout,
            stderr: String::new(),
            duration_ms: 0,
            success: true,
        })
    }
}

fn fabricate_asl_file(args: &[String]) -> std::io::Result<()> {
    let ntis: usize = value_of(args, "--ntis=")
        .and_then(|n| n.parse().ok())
        .unwrap_or(1);

    if let Some(prefix) = value_of(args, "--split=") {
        for i in 0..ntis {
            touch_volume(&format!("{prefix}{i:03}"))?;
        }
    }
    if let Some(mean) = value_of(args, "--mean=") {
        touch_volume(mean)?;
    }
    if let Some(out) = value_of(args, "--out=") {
        if args.iter().any(|a| a == "--spairs") {
            touch_volume(&format!("{out}_odd"))?;
            touch_volume(&format!("{out}_even"))?;
        } else {
            touch_volume(out)?;
        }
    }
    Ok(())
}

fn value_of<'a>(args: &'a [String], prefix: &str) -> Option<&'a str> {
    args.iter().find_map(|a| a.strip_prefix(prefix))
}

fn flag_value<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .map(String::as_str)
}

fn touch_volume(base: &str) -> std::io::Result<()> {
    let path = PathBuf::from(format!("{base}.nii.gz"));
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&path, b"")
}

/// Create an empty volume file at `<base>.nii.gz`, for test inputs.
pub fn touch_input_volume(base: &Path) -> std::io::Result<()> {
    touch_volume(&base.to_string_lossy())
}
