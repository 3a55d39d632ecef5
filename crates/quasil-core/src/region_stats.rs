//! Perfusion statistics within tissue regions.
//!
//! Statistics come from the toolkit's statistics command, one call per
//! region. The table is tab-separated but keeps a `.csv` name, which
//! spreadsheet software opens directly.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{QuasilError, Result};
use crate::output::AnalysisResult;
use crate::pvcorr::{TissueFractions, PV_THRESHOLD};
use crate::stage::Stage;
use crate::toolkit::Toolkit;
use crate::volume::VolumeRef;
use crate::workspace::Workspace;

/// Regions with fewer voxels than this report no statistics.
pub const MIN_NVOXELS: u64 = 10;

/// File written into the output directory.
pub const REGION_TABLE: &str = "region_analysis.csv";

/// Tissue fraction defining a region after partial volume correction.
pub const PVE_THRESHOLD_PVC: f64 = PV_THRESHOLD;

/// Without correction a region keeps only voxels that are mostly one tissue.
pub const PVE_THRESHOLD_NOPVC: f64 = 0.8;

/// Options handed to the statistics command, in output order: voxel count
/// and volume, mean, standard deviation, then the 50th, 25th and 75th
/// percentiles.
const STATS_OPTIONS: [&str; 9] = ["-V", "-m", "-s", "-p", "50", "-p", "25", "-p", "75"];

/// Summary statistics of one region.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionStats {
    pub name: String,
    pub nvoxels: u64,
    pub mean: Option<f64>,
    pub std: Option<f64>,
    pub median: Option<f64>,
    /// Interquartile range.
    pub iqr: Option<f64>,
}

impl RegionStats {
    /// Parse `<voxels> <volume> <mean> <std> <p50> <p25> <p75>`.
    pub fn parse(name: &str, line: &str) -> Option<Self> {
        let fields: Vec<&str> = line.split_whitespace().collect();
        let [nvoxels, _volume, mean, std, median, p25, p75] = fields.as_slice() else {
            return None;
        };
        let nvoxels: u64 = nvoxels.parse().ok()?;
        let values = [mean, std, median, p25, p75]
            .iter()
            .map(|v| v.parse::<f64>().ok())
            .collect::<Option<Vec<f64>>>()?;

        let enough = nvoxels >= MIN_NVOXELS;
        let keep = |v: f64| enough.then_some(v);
        Some(Self {
            name: name.to_string(),
            nvoxels,
            mean: keep(values[0]),
            std: keep(values[1]),
            median: keep(values[2]),
            iqr: keep(values[4] - values[3]),
        })
    }

    fn row(&self) -> String {
        let cell = |v: Option<f64>| v.map(|x| format!("{x:.6}")).unwrap_or_default();
        format!(
            "{}\t{}\t{}\t{}\t{}\t{}",
            self.name,
            self.nvoxels,
            cell(self.mean),
            cell(self.std),
            cell(self.median),
            cell(self.iqr)
        )
    }
}

/// Render the tab-separated table.
pub fn render_table(rows: &[RegionStats]) -> String {
    let mut out = String::from("name\tNvoxels\tMean\tStd\tMedian\tIQR\n");
    for row in rows {
        out.push_str(&row.row());
        out.push('\n');
    }
    out
}

/// Compute statistics for every available region and write the table.
///
/// Grey and white matter regions are cut from `tissue` at
/// [`PVE_THRESHOLD_PVC`] when corrected maps were published and at
/// [`PVE_THRESHOLD_NOPVC`] otherwise.
pub async fn analyse(
    toolkit: &Toolkit,
    ws: &Workspace,
    mask: &VolumeRef,
    results: &AnalysisResult,
    tissue: Option<&TissueFractions>,
) -> Result<PathBuf> {
    let stage = Stage::RegionStats;
    let pvc = results.get("perfusion_gm").is_some();

    let mut regions: Vec<(&str, VolumeRef, &str)> = Vec::new();
    let whole = if pvc { "perfusion_gm" } else { "perfusion" };
    regions.push(("brain", mask.clone(), whole));
    if let Some(fractions) = tissue {
        let (threshold, gm_source, wm_source) = if pvc {
            (PVE_THRESHOLD_PVC, "perfusion_gm", "perfusion_wm")
        } else {
            (PVE_THRESHOLD_NOPVC, "perfusion", "perfusion")
        };
        let gm = tissue_roi(toolkit, &fractions.gm, threshold, &ws.scratch("roi_gm")).await?;
        let wm = tissue_roi(toolkit, &fractions.wm, threshold, &ws.scratch("roi_wm")).await?;
        regions.push(("GM", gm, gm_source));
        regions.push(("WM", wm, wm_source));
    }

    let mut rows = Vec::with_capacity(regions.len());
    for (name, roi, source) in regions {
        let Some(perfusion) = results.get(source) else {
            warn!(region = name, source, "no perfusion map for region; skipping");
            continue;
        };
        let line = toolkit.stats(stage, perfusion, &roi, &STATS_OPTIONS).await?;
        let stats = RegionStats::parse(name, &line).ok_or_else(|| QuasilError::MissingArtifact {
            stage,
            path: perfusion.base().to_path_buf(),
        })?;
        info!(region = name, nvoxels = stats.nvoxels, mean = ?stats.mean, "region statistics");
        rows.push(stats);
    }

    let path = ws.output_dir().join(REGION_TABLE);
    std::fs::write(&path, render_table(&rows))?;
    Ok(path)
}

async fn tissue_roi(toolkit: &Toolkit, fraction: &VolumeRef, threshold: f64, roi: &VolumeRef) -> Result<VolumeRef> {
    let ops = ["-thr".to_string(), threshold.to_string(), "-bin".to_string()];
    toolkit.maths(Stage::RegionStats, fraction, &ops, roi).await?;
    Ok(roi.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::{RecordingToolRunner, FAKE_STATS_LINE};
    use crate::output::ResultVolume;
    use crate::toolkit::ToolkitConfig;
    use crate::workspace::WorkspaceOptions;
    use std::sync::Arc;

    fn workspace(dir: &std::path::Path) -> Workspace {
        let options = WorkspaceOptions::new(dir).with_scratch_root(dir.join("tmp"));
        Workspace::allocate(&dir.join("out"), &options).unwrap()
    }

    fn results(ws: &Workspace, names: &[&str]) -> AnalysisResult {
        AnalysisResult {
            volumes: names
                .iter()
                .map(|n| ResultVolume {
                    name: n.to_string(),
                    volume: ws.output(n),
                })
                .collect(),
        }
    }

    fn region_names(text: &str) -> Vec<&str> {
        text.lines().skip(1).map(|l| l.split('\t').next().unwrap()).collect()
    }

    #[test]
    fn test_parse_stats_line() {
        let stats = RegionStats::parse("brain", FAKE_STATS_LINE).unwrap();
        assert_eq!(stats.nvoxels, 250);
        assert_eq!(stats.mean, Some(45.2));
        assert_eq!(stats.median, Some(44.0));
        assert_eq!(stats.iqr, Some(14.5));
    }

    #[test]
    fn test_iqr_column_follows_median() {
        let stats = RegionStats::parse("GM", "40 320.0 60.0 5.0 59.0 55.25 63.75").unwrap();
        let table = render_table(&[stats]);
        let mut lines = table.lines();
        assert_eq!(lines.next(), Some("name\tNvoxels\tMean\tStd\tMedian\tIQR"));
        assert_eq!(
            lines.next(),
            Some("GM\t40\t60.000000\t5.000000\t59.000000\t8.500000")
        );
        assert!(table.ends_with('\n'));
    }

    #[test]
    fn test_small_region_reports_empty_values() {
        let stats = RegionStats::parse("tiny", "9 72.0 50.0 1.0 50.0 49.0 51.0").unwrap();
        assert_eq!(stats.nvoxels, 9);
        assert!(stats.mean.is_none());
        assert!(stats.iqr.is_none());
        assert_eq!(render_table(&[stats]).lines().nth(1), Some("tiny\t9\t\t\t\t"));
    }

    #[test]
    fn test_malformed_line_rejected() {
        assert!(RegionStats::parse("x", "").is_none());
        assert!(RegionStats::parse("x", "12 nan").is_none());
        assert!(RegionStats::parse("x", "a b c d e f g").is_none());
        // median only, no quartiles
        assert!(RegionStats::parse("x", "250 2000.0 45.2 12.1 44.0").is_none());
    }

    #[tokio::test]
    async fn test_statistics_request_quartiles() {
        let dir = tempfile::tempdir().unwrap();
        let ws = workspace(dir.path());
        let runner = Arc::new(RecordingToolRunner::new());
        let toolkit = Toolkit::new(runner.clone(), ToolkitConfig::default());

        analyse(&toolkit, &ws, &ws.scratch("mask"), &results(&ws, &["perfusion"]), None)
            .await
            .unwrap();

        let call = &runner.calls_to("fslstats")[0];
        assert_eq!(call.args[3..], ["-V", "-m", "-s", "-p", "50", "-p", "25", "-p", "75"]);
    }

    #[tokio::test]
    async fn test_table_with_pv_regions() {
        let dir = tempfile::tempdir().unwrap();
        let ws = workspace(dir.path());
        let runner = Arc::new(RecordingToolRunner::new());
        let toolkit = Toolkit::new(runner.clone(), ToolkitConfig::default());
        let tissue = TissueFractions {
            gm: ws.scratch("pvgm_lowres"),
            wm: ws.scratch("pvwm_lowres"),
        };

        let path = analyse(
            &toolkit,
            &ws,
            &ws.scratch("mask"),
            &results(&ws, &["perfusion_gm", "perfusion_wm"]),
            Some(&tissue),
        )
        .await
        .unwrap();

        let text = std::fs::read_to_string(path).unwrap();
        assert_eq!(region_names(&text), vec!["brain", "GM", "WM"]);
        let maths = runner.calls_to("fslmaths");
        assert_eq!(
            maths[0].args,
            vec![
                ws.scratch("pvgm_lowres").arg(),
                "-thr".into(),
                "0.1".into(),
                "-bin".into(),
                ws.scratch("roi_gm").arg()
            ]
        );
        let calls = runner.calls_to("fslstats");
        assert_eq!(calls[0].args[0], ws.output("perfusion_gm").arg());
        assert_eq!(calls[2].args[0], ws.output("perfusion_wm").arg());
        assert_eq!(calls[2].args[2], ws.scratch("roi_wm").arg());
    }

    #[tokio::test]
    async fn test_uncorrected_regions_use_strict_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let ws = workspace(dir.path());
        let runner = Arc::new(RecordingToolRunner::new());
        let toolkit = Toolkit::new(runner.clone(), ToolkitConfig::default());
        let tissue = TissueFractions {
            gm: ws.scratch("pvgm_resampled"),
            wm: ws.scratch("pvwm_resampled"),
        };

        let path = analyse(
            &toolkit,
            &ws,
            &ws.scratch("mask"),
            &results(&ws, &["perfusion", "arrival"]),
            Some(&tissue),
        )
        .await
        .unwrap();

        let text = std::fs::read_to_string(path).unwrap();
        assert_eq!(region_names(&text), vec!["brain", "GM", "WM"]);
        let maths = runner.calls_to("fslmaths");
        assert_eq!(maths.len(), 2);
        assert_eq!(maths[0].args[0], ws.scratch("pvgm_resampled").arg());
        assert_eq!(maths[1].args[0], ws.scratch("pvwm_resampled").arg());
        for call in &maths {
            assert_eq!(call.args[1..4], ["-thr", "0.8", "-bin"]);
        }
        for call in runner.calls_to("fslstats") {
            assert_eq!(call.args[0], ws.output("perfusion").arg());
        }
        let rois: Vec<String> = runner.calls_to("fslstats").iter().map(|c| c.args[2].clone()).collect();
        assert_eq!(
            rois,
            vec![ws.scratch("mask").arg(), ws.scratch("roi_gm").arg(), ws.scratch("roi_wm").arg()]
        );
    }
}
