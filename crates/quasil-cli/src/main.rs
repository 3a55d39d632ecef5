//! QUASIL - QUASAR ASL quantification
//!
//! The `quasil` command turns a raw QUASAR acquisition into perfusion,
//! arrival time and arterial blood volume maps.
//!
//! ## Modes
//!
//! - default: Bayesian fit of the QUASAR kinetic model
//! - `--mfree`: model-free deconvolution
//! - `--pvcorr [--fslanat <dir>]`: partial volume correction (model fit only)
//! - `--ccmds "<args>"`: external calibration

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::error::ErrorKind;
use clap::{CommandFactory, Parser};
use quasil_core::{
    init_tracing, ConfigResolver, ProcessToolRunner, QuasilPipeline, RawOptions, ToolkitConfig,
    WorkspaceOptions,
};
use tracing::{info, Level};

#[derive(Parser, Debug)]
#[command(name = "quasil")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Perfusion quantification of QUASAR arterial spin labelling data", long_about = None)]
struct Cli {
    /// Raw ASL acquisition
    #[arg(short = 'i', long = "input", required = true)]
    input: Option<PathBuf>,

    /// Output directory (a '+' is appended while the name is taken)
    #[arg(short = 'o', long = "output")]
    output: Option<PathBuf>,

    /// Brain mask; derived by brain extraction when omitted
    #[arg(short = 'm', long = "mask")]
    mask: Option<PathBuf>,

    /// Arterial blood T1 (s) [1.6]
    #[arg(long)]
    t1b: Option<String>,

    /// Tissue T1 (s) [1.3]
    #[arg(long)]
    t1: Option<String>,

    /// White matter T1 (s) [1.1]
    #[arg(long)]
    t1wm: Option<String>,

    /// TI increment per slice (s) [0.035]
    #[arg(long)]
    slicedt: Option<String>,

    /// Readout flip angle (degrees) [35]
    #[arg(long)]
    fa: Option<String>,

    /// Low flip angle of the final phase (degrees) [11.7]
    #[arg(long)]
    lfa: Option<String>,

    /// Inversion efficiency [0.91]
    #[arg(long)]
    alpha: Option<String>,

    /// Comma-separated inversion times (s)
    #[arg(long)]
    tis: Option<String>,

    /// Bolus duration (s) [0.64]
    #[arg(long)]
    tau: Option<String>,

    /// Raw data layout: q (TI/repeat/phase) or f (TI/phase)
    #[arg(long)]
    iform: Option<String>,

    /// Apply a gamma dispersion kernel
    #[arg(long)]
    disp: bool,

    /// Infer the bolus duration
    #[arg(long)]
    infertau: bool,

    /// Model-free analysis by deconvolution
    #[arg(long)]
    mfree: bool,

    /// Correct the M0 edge artefact
    #[arg(long)]
    corrcal: bool,

    /// Partial volume correction
    #[arg(long)]
    pvcorr: bool,

    /// fsl_anat output directory for partial volume correction
    #[arg(long)]
    fslanat: Option<PathBuf>,

    /// Arguments for the external calibration routine
    #[arg(long, allow_hyphen_values = true)]
    ccmds: Option<String>,

    /// Write perfusion statistics per tissue region
    #[arg(long = "regionstats")]
    region_stats: bool,

    /// Keep the scratch directory next to the working directory
    #[arg(long)]
    debug: bool,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long)]
    json: bool,
}

impl Cli {
    fn raw_options(&self) -> RawOptions {
        RawOptions {
            input: self.input.clone(),
            output: self.output.clone(),
            mask: self.mask.clone(),
            t1b: self.t1b.clone(),
            t1: self.t1.clone(),
            t1wm: self.t1wm.clone(),
            slicedt: self.slicedt.clone(),
            fa: self.fa.clone(),
            lfa: self.lfa.clone(),
            alpha: self.alpha.clone(),
            tis: self.tis.clone(),
            tau: self.tau.clone(),
            iform: self.iform.clone(),
            disp: self.disp,
            infertau: self.infertau,
            mfree: self.mfree,
            corrcal: self.corrcal,
            pvcorr: self.pvcorr,
            fslanat: self.fslanat.clone(),
            ccmds: self.ccmds.clone(),
            region_stats: self.region_stats,
            debug: self.debug,
        }
    }
}

/// Help and version exit cleanly; any other parse failure prints the
/// error and usage on stdout and exits with status 1.
fn exit_on_parse_error(err: clap::Error) -> ! {
    match err.kind() {
        ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => {
            print!("{err}");
            std::process::exit(0)
        }
        _ => {
            println!("{}", err.render());
            println!("{}", Cli::command().render_help());
            std::process::exit(1)
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::try_parse().unwrap_or_else(|e| exit_on_parse_error(e));

    // Setup logging
    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    init_tracing(cli.json, level);

    let invocation_dir = std::env::current_dir().context("Failed to determine working directory")?;
    let config = ConfigResolver::resolve(&cli.raw_options(), &invocation_dir).context("Invalid options")?;

    let pipeline = QuasilPipeline::new(
        Arc::new(ProcessToolRunner),
        ToolkitConfig::from_env(),
        WorkspaceOptions::new(&invocation_dir),
    );
    let result = pipeline.run(&config).await.context("Quantification failed")?;

    info!(run_id = %result.run_id, duration_ms = result.duration_ms, "run complete");
    println!("Output directory: {}", result.output_dir.display());
    for name in result.outputs.names() {
        println!("  {name}");
    }
    if let Some(table) = &result.region_table {
        println!("Region statistics: {}", table.display());
    }
    if let Some(scratch) = &result.retained_scratch {
        println!("Intermediate files kept in {}", scratch.display());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use quasil_core::{AnalysisStrategy, CalibrationMode, Dispersion, PvCorrection, QuasilError};
    use std::path::Path;

    fn parse(args: &[&str]) -> Result<Cli, clap::Error> {
        Cli::try_parse_from(std::iter::once("quasil").chain(args.iter().copied()))
    }

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_missing_input_is_usage_error() {
        let err = parse(&["-o", "out"]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MissingRequiredArgument);
    }

    #[test]
    fn test_unknown_flag_is_usage_error() {
        let err = parse(&["-i", "asl", "--fixt1"]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnknownArgument);
    }

    #[test]
    fn test_help_and_version_are_not_failures() {
        assert_eq!(parse(&["--help"]).unwrap_err().kind(), ErrorKind::DisplayHelp);
        assert_eq!(parse(&["--version"]).unwrap_err().kind(), ErrorKind::DisplayVersion);
    }

    #[test]
    fn test_flags_map_to_config() {
        let cli = parse(&[
            "-i",
            "asl.nii.gz",
            "--tis",
            "0.1,0.4,0.7",
            "--disp",
            "--pvcorr",
            "--fslanat",
            "struc.anat",
            "--ccmds",
            "--mode longtr --tr 4.0",
            "--regionstats",
        ])
        .unwrap();
        let config = ConfigResolver::resolve(&cli.raw_options(), Path::new("/work")).unwrap();

        assert_eq!(config.layout.ntis(), 3);
        assert_eq!(config.strategy, AnalysisStrategy::ModelBased);
        assert_eq!(config.features.dispersion, Dispersion::Gamma);
        assert_eq!(
            config.pv_correction,
            PvCorrection::Structural {
                fslanat: PathBuf::from("/work/struc.anat")
            }
        );
        assert!(matches!(config.calibration, CalibrationMode::External { ref args } if args.len() == 4));
        assert!(config.region_stats);
    }

    #[test]
    fn test_model_free_with_pv_correction_is_rejected() {
        let cli = parse(&["-i", "asl", "--mfree", "--pvcorr"]).unwrap();
        let err = ConfigResolver::resolve(&cli.raw_options(), Path::new("/work")).unwrap_err();
        assert!(matches!(err, QuasilError::Config { field: "pvcorr", .. }));
    }

    #[test]
    fn test_numeric_options_stay_textual_until_resolution() {
        let cli = parse(&["-i", "asl", "--t1b", "abc"]).unwrap();
        assert!(ConfigResolver::resolve(&cli.raw_options(), Path::new("/")).is_err());
    }
}
