//! Canonical data layout, differencing and masking.
//!
//! Whatever the raw layout, this stage leaves three series in the scratch
//! directory: the canonical tag/control dataset (TI outer, phase inner), the
//! tag-minus-control differences with the low flip angle phase removed, and
//! the control images alone. It also settles the brain mask.

use tracing::info;

use crate::config::{AcquisitionLayout, PipelineConfig, RawFormat};
use crate::error::Result;
use crate::stage::Stage;
use crate::toolkit::Toolkit;
use crate::volume::VolumeRef;
use crate::workspace::Workspace;

/// Data prepared for calibration and analysis.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedData {
    /// Canonical tag/control pairs, TI outer and phase inner.
    pub asldata: VolumeRef,

    /// Differences for the analysed phases: `ntis * (nphases - 1)` volumes.
    pub diff: VolumeRef,

    /// Control images for every TI and phase.
    pub control: VolumeRef,

    /// Brain mask in the scratch directory.
    pub mask: VolumeRef,
}

/// Name `asl_file --split` gives to the `index`-th block.
pub fn split_name(prefix: &VolumeRef, index: usize) -> VolumeRef {
    prefix.with_suffix(&format!("{index:03}"))
}

/// `(start, len)` of the difference volumes kept for each TI: every phase
/// except the last.
pub fn retained_ranges(layout: &AcquisitionLayout) -> Vec<(usize, usize)> {
    (0..layout.ntis())
        .map(|ti| (ti * layout.nphases(), layout.analysed_phases()))
        .collect()
}

/// Run the whole stage.
pub async fn prepare(toolkit: &Toolkit, ws: &Workspace, config: &PipelineConfig) -> Result<PreparedData> {
    let input = VolumeRef::new(&config.input);
    let layout = &config.layout;

    let asldata = match layout.format() {
        RawFormat::Nested => canonicalize_nested(toolkit, ws, &input, layout).await?,
        RawFormat::Flat => {
            let asldata = ws.scratch("asldata");
            toolkit.copy(Stage::Reshape, &input, &asldata).await?;
            asldata
        }
    };

    let diff = difference(toolkit, ws, &asldata, layout).await?;
    let control = control_series(toolkit, ws, &asldata, layout).await?;
    let mask = resolve_mask(toolkit, ws, config, &asldata).await?;

    Ok(PreparedData {
        asldata,
        diff,
        control,
        mask,
    })
}

/// Reorder nested (TI / repeat / phase) data into the flat layout, averaging
/// repeats within each TI.
pub async fn canonicalize_nested(
    toolkit: &Toolkit,
    ws: &Workspace,
    input: &VolumeRef,
    layout: &AcquisitionLayout,
) -> Result<VolumeRef> {
    let stage = Stage::Reshape;
    let ntis = layout.ntis();
    let nphases = layout.nphases();
    info!(ntis, nphases, "reshaping nested acquisition");

    // One block per TI.
    let ti_prefix = ws.scratch("ti_");
    toolkit
        .asl_file(
            stage,
            vec![
                format!("--data={}", input.arg()),
                format!("--ntis={ntis}"),
                "--ibf=tis".to_string(),
                "--iaf=tc".to_string(),
                format!("--split={}", ti_prefix.arg()),
            ],
        )
        .await?;

    // Within each TI, one block per phase with repeats along time.
    for ti in 0..ntis {
        let ti_vol = split_name(&ti_prefix, ti);
        toolkit.expect_volume(stage, &ti_vol)?;
        toolkit
            .asl_file(
                stage,
                vec![
                    format!("--data={}", ti_vol.arg()),
                    format!("--ntis={nphases}"),
                    "--ibf=rpt".to_string(),
                    "--iaf=tc".to_string(),
                    format!("--split={}", ti_vol.with_suffix("_ph").arg()),
                ],
            )
            .await?;
    }

    // Per phase: gather every TI, then average repeats within each TI.
    let mut phase_means = Vec::with_capacity(nphases);
    for phase in 0..nphases {
        let per_ti: Vec<VolumeRef> = (0..ntis)
            .map(|ti| split_name(&split_name(&ti_prefix, ti).with_suffix("_ph"), phase))
            .collect();
        let phase_vol = ws.scratch(&format!("phase_{phase:03}"));
        toolkit.merge(stage, &phase_vol, &per_ti).await?;

        let mean = phase_vol.with_suffix("_mean");
        toolkit
            .asl_file(
                stage,
                vec![
                    format!("--data={}", phase_vol.arg()),
                    format!("--ntis={ntis}"),
                    "--ibf=tis".to_string(),
                    "--iaf=tc".to_string(),
                    format!("--mean={}", mean.arg()),
                ],
            )
            .await?;
        toolkit.expect_volume(stage, &mean)?;
        phase_means.push(mean);
    }

    // Phase-major blocks; re-block so TI is outermost.
    let by_phase = ws.scratch("asldata_by_phase");
    toolkit.merge(stage, &by_phase, &phase_means).await?;

    let asldata = ws.scratch("asldata");
    toolkit
        .asl_file(
            stage,
            vec![
                format!("--data={}", by_phase.arg()),
                format!("--ntis={nphases}"),
                "--ibf=tis".to_string(),
                "--iaf=tc".to_string(),
                "--obf=rpt".to_string(),
                format!("--out={}", asldata.arg()),
            ],
        )
        .await?;
    toolkit.expect_volume(stage, &asldata)?;
    Ok(asldata)
}

/// Tag-minus-control differences with the low flip angle phase dropped.
async fn difference(
    toolkit: &Toolkit,
    ws: &Workspace,
    asldata: &VolumeRef,
    layout: &AcquisitionLayout,
) -> Result<VolumeRef> {
    let stage = Stage::Reshape;

    let full = ws.scratch("asldiff_all");
    toolkit
        .asl_file(
            stage,
            vec![
                format!("--data={}", asldata.arg()),
                format!("--ntis={}", layout.canonical_pairs()),
                "--ibf=tis".to_string(),
                "--iaf=tc".to_string(),
                "--diff".to_string(),
                format!("--out={}", full.arg()),
            ],
        )
        .await?;
    toolkit.expect_volume(stage, &full)?;

    let mut kept = Vec::with_capacity(layout.ntis());
    for (ti, (start, len)) in retained_ranges(layout).into_iter().enumerate() {
        let part = ws.scratch(&format!("asldiff_ti{ti:03}"));
        toolkit.roi(stage, &full, &part, start, len).await?;
        kept.push(part);
    }

    let diff = ws.scratch("asldiff");
    toolkit.merge(stage, &diff, &kept).await?;
    Ok(diff)
}

async fn control_series(
    toolkit: &Toolkit,
    ws: &Workspace,
    asldata: &VolumeRef,
    layout: &AcquisitionLayout,
) -> Result<VolumeRef> {
    let pairs = ws.scratch("aslpairs");
    toolkit
        .asl_file(
            Stage::Reshape,
            vec![
                format!("--data={}", asldata.arg()),
                format!("--ntis={}", layout.canonical_pairs()),
                "--ibf=tis".to_string(),
                "--iaf=tc".to_string(),
                "--spairs".to_string(),
                format!("--out={}", pairs.arg()),
            ],
        )
        .await?;

    // Second image of each tag/control pair.
    let control = pairs.with_suffix("_even");
    toolkit.expect_volume(Stage::Reshape, &control)?;
    Ok(control)
}

/// Adopt the supplied mask or derive one by brain extraction of the mean
/// image. Either way the mask is also copied to the output directory.
async fn resolve_mask(
    toolkit: &Toolkit,
    ws: &Workspace,
    config: &PipelineConfig,
    asldata: &VolumeRef,
) -> Result<VolumeRef> {
    let stage = Stage::Mask;
    let mask = ws.scratch("mask");

    match &config.mask {
        Some(supplied) => {
            info!(mask = %supplied.display(), "using supplied mask");
            toolkit.copy(stage, &VolumeRef::new(supplied), &mask).await?;
        }
        None => {
            let mean = ws.scratch("meanasl");
            toolkit
                .maths(stage, asldata, &["-Tmean".to_string()], &mean)
                .await?;
            let brain = ws.scratch("meanasl_brain");
            if let Some(brain_mask) = toolkit.bet(stage, &mean, &brain, true).await? {
                toolkit.copy(stage, &brain_mask, &mask).await?;
            }
        }
    }
    toolkit.expect_volume(stage, &mask)?;

    toolkit.copy(stage, &mask, &ws.output("mask")).await?;
    Ok(mask)
}
