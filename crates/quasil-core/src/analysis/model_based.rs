//! Bayesian fit of the multi-compartment QUASAR kinetic model.
//!
//! The fitting engine numbers inferred parameters in the order the model
//! declares them, and optional sub-models insert parameters in the middle of
//! that order. The image prior for tissue T1, for instance, sits in slot 5
//! with neither bolus duration inference nor partial volume correction, and
//! in slot 9 with both. [`quasar_spec`] numbers slots as it declares
//! parameters; [`PriorSlots::lookup`] states the same numbering as a table,
//! and [`check_slots`] refuses to submit a specification where the two
//! disagree.

use std::fmt;
use std::path::PathBuf;

use tracing::info;

use crate::calibrate::CalibrationResult;
use crate::config::{ModelFeatures, PipelineConfig};
use crate::error::{QuasilError, Result};
use crate::model_spec::{ModelSpec, ModelSpecBuilder, PriorKind};
use crate::pvcorr::PvMaps;
use crate::reshape::PreparedData;
use crate::stage::Stage;
use crate::toolkit::Toolkit;
use crate::volume::VolumeRef;
use crate::workspace::Workspace;

/// Slots carrying image priors, plus the total number of inferred
/// parameters, for one combination of model switches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PriorSlots {
    pub t1t: Option<usize>,
    pub t1wm: Option<usize>,
    pub g: usize,
    pub pvgm: Option<usize>,
    pub pvwm: Option<usize>,
    pub param_count: usize,
}

impl PriorSlots {
    /// Slot layout for `(t1_fixed, pv_correction, infer_tau)`.
    pub fn lookup(t1_fixed: bool, pv_correction: bool, infer_tau: bool) -> Self {
        let (t1t, t1wm, g, pvgm, pvwm, param_count) = match (t1_fixed, pv_correction, infer_tau) {
            (false, false, false) => (Some(5), None, 6, None, None, 6),
            (false, false, true) => (Some(6), None, 7, None, None, 7),
            (false, true, false) => (Some(7), Some(8), 9, Some(10), Some(11), 11),
            (false, true, true) => (Some(9), Some(10), 11, Some(12), Some(13), 13),
            (true, false, false) => (None, None, 5, None, None, 5),
            (true, false, true) => (None, None, 6, None, None, 6),
            (true, true, false) => (None, None, 7, Some(8), Some(9), 9),
            (true, true, true) => (None, None, 9, Some(10), Some(11), 11),
        };
        Self {
            t1t,
            t1wm,
            g,
            pvgm,
            pvwm,
            param_count,
        }
    }

    /// `(parameter, slot)` for every prior-bearing parameter present.
    pub fn entries(&self) -> Vec<(&'static str, usize)> {
        [
            ("T1t", self.t1t),
            ("T1wm", self.t1wm),
            ("g", Some(self.g)),
            ("pvgm", self.pvgm),
            ("pvwm", self.pvwm),
        ]
        .into_iter()
        .filter_map(|(name, slot)| slot.map(|s| (name, s)))
        .collect()
    }
}

impl fmt::Display for PriorSlots {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, slot) in self.entries() {
            write!(f, "{name}:{slot} ")?;
        }
        write!(f, "of {}", self.param_count)
    }
}

/// Raw output of the model-based fit.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelBasedFit {
    pub spec: ModelSpec,
    pub fit_dir: PathBuf,
    pub features: ModelFeatures,
    pub pv_correction: bool,
}

impl ModelBasedFit {
    /// `mean_<param>` map in the fit directory.
    pub fn mean(&self, param: &str) -> VolumeRef {
        VolumeRef::in_dir(&self.fit_dir, &format!("mean_{param}"))
    }

    /// Parameter maps the output stage reads.
    pub fn required_maps(&self) -> Vec<VolumeRef> {
        let mut params = vec!["ftiss", "delttiss", "fblood"];
        if self.features.infer_tau {
            params.push("tautiss");
        }
        if self.pv_correction {
            params.extend(["fwm", "deltwm"]);
        }
        params.into_iter().map(|p| self.mean(p)).collect()
    }
}

/// Image prior volumes available to the model.
#[derive(Debug, Clone)]
pub struct PriorImages<'a> {
    pub t1t: &'a VolumeRef,
    pub g: Option<&'a VolumeRef>,
    pub t1wm: Option<&'a VolumeRef>,
    pub pv: Option<&'a PvMaps>,
}

/// Build the QUASAR model specification.
pub fn quasar_spec(config: &PipelineConfig, priors: &PriorImages<'_>) -> ModelSpec {
    let timing = &config.timing;
    let features = config.features;
    let infer_t1 = !features.t1_fixed;
    let pv = priors.pv;
    let tau = features.infer_tau;

    let mut builder = ModelSpecBuilder::new()
        .setting("method", "spatialvb")
        .setting("noise", "white")
        .setting("model", "quasar")
        .flag("inferart")
        .flag("artdir");
    if infer_t1 {
        builder = builder.flag("infert1");
    }
    builder = builder
        .flag("usecalib")
        .tis(config.layout.tis())
        .setting("t1b", timing.t1b)
        .setting("t1", timing.t1t);
    if pv.is_some() {
        builder = builder
            .setting("t1wm", timing.t1wm)
            .flag("incpve")
            .flag("incwm")
            .flag("inferwm");
    }
    builder = builder
        .setting("tau", timing.tau)
        .setting("slicedt", timing.slicedt)
        .setting("fa", timing.fa)
        .setting("disp", features.dispersion.directive_value());
    if tau {
        builder = builder.flag("infertau");
    }
    builder = builder
        .setting("repeats", 1)
        .setting("phases", config.layout.analysed_phases());

    // Parameter order as the model declares it.
    builder = builder
        .infer("ftiss", PriorKind::Markov)
        .infer("delttiss", PriorKind::NonSpatial)
        .infer_if(tau, "tautiss", PriorKind::NonSpatial);
    if pv.is_some() {
        builder = builder
            .infer("fwm", PriorKind::Markov)
            .infer("deltwm", PriorKind::NonSpatial)
            .infer_if(tau, "tauwm", PriorKind::NonSpatial);
    }
    builder = builder
        .infer("fblood", PriorKind::Ard)
        .infer("deltblood", PriorKind::NonSpatial);
    if infer_t1 {
        builder = builder.infer("T1t", PriorKind::Image(priors.t1t.clone()));
        if pv.is_some() {
            builder = builder.infer("T1wm", image_or_flat(priors.t1wm));
        }
    }
    builder = builder.infer("g", image_or_flat(priors.g));
    if let Some(maps) = pv {
        builder = builder
            .infer("pvgm", PriorKind::Image(maps.pvgm.clone()))
            .infer("pvwm", PriorKind::Image(maps.pvwm.clone()));
    }
    builder.build()
}

fn image_or_flat(volume: Option<&VolumeRef>) -> PriorKind {
    match volume {
        Some(v) => PriorKind::Image(v.clone()),
        None => PriorKind::NonSpatial,
    }
}

/// Fail unless `spec` numbers its prior-bearing parameters exactly as
/// `expected` does and every image prior sits on its parameter's slot.
pub fn check_slots(spec: &ModelSpec, expected: &PriorSlots) -> Result<()> {
    let mismatch = || QuasilError::PriorSlotMismatch {
        expected: expected.to_string(),
        actual: describe(spec),
    };

    if spec.params().len() != expected.param_count
        || spec.spatial_priors().chars().count() != expected.param_count
    {
        return Err(mismatch());
    }
    for (name, slot) in expected.entries() {
        if spec.slot_of(name) != Some(slot) {
            return Err(mismatch());
        }
    }
    let expected_entries = expected.entries();
    for prior in spec.image_priors() {
        if !expected_entries.contains(&(prior.param.as_str(), prior.slot)) {
            return Err(mismatch());
        }
    }
    Ok(())
}

fn describe(spec: &ModelSpec) -> String {
    let mut out: String = spec
        .params()
        .iter()
        .map(|p| format!("{}:{} ", p.name, p.slot))
        .collect();
    out.push_str(&format!("of {}", spec.params().len()));
    out
}

pub async fn run(
    toolkit: &Toolkit,
    ws: &Workspace,
    config: &PipelineConfig,
    data: &PreparedData,
    calib: &CalibrationResult,
    pv: Option<&PvMaps>,
) -> Result<ModelBasedFit> {
    let stage = Stage::ModelBased;
    let features = config.features;

    let t1wm_prior = match pv {
        Some(_) => {
            let prior = ws.scratch("T1wm_prior");
            toolkit
                .maths(
                    stage,
                    &data.mask,
                    &[
                        "-bin".to_string(),
                        "-mul".to_string(),
                        config.timing.t1wm.to_string(),
                    ],
                    &prior,
                )
                .await?;
            Some(prior)
        }
        None => None,
    };

    let spec = quasar_spec(
        config,
        &PriorImages {
            t1t: &calib.t1t,
            g: calib.g.as_ref(),
            t1wm: t1wm_prior.as_ref(),
            pv,
        },
    );
    let expected = PriorSlots::lookup(features.t1_fixed, pv.is_some(), features.infer_tau);
    check_slots(&spec, &expected)?;
    info!(slots = %expected, priors = %spec.spatial_priors(), "model specification ready");

    let options = ws.scratch_dir().join("basil_options.txt");
    spec.write_to(&options)?;
    let fit_dir = ws.scratch_dir().join("basil");
    toolkit.fabber(stage, &data.diff, &data.mask, &fit_dir, &options).await?;

    let fit = ModelBasedFit {
        spec,
        fit_dir,
        features,
        pv_correction: pv.is_some(),
    };
    for map in fit.required_maps() {
        toolkit.expect_volume(stage, &map)?;
    }
    Ok(fit)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigResolver, RawOptions};
    use std::collections::HashSet;
    use std::path::Path;

    const TRIPLES: [(bool, bool, bool); 8] = [
        (false, false, false),
        (false, false, true),
        (false, true, false),
        (false, true, true),
        (true, false, false),
        (true, false, true),
        (true, true, false),
        (true, true, true),
    ];

    fn maps() -> PvMaps {
        PvMaps {
            pvgm: VolumeRef::new("/s/pvgm_lowres"),
            pvwm: VolumeRef::new("/s/pvwm_lowres"),
            gm_mask: VolumeRef::new("/s/gm_mask"),
            wm_mask: VolumeRef::new("/s/wm_mask"),
        }
    }

    fn spec_for(t1_fixed: bool, pv: bool, infer_tau: bool) -> ModelSpec {
        let raw = RawOptions {
            input: Some("asl".into()),
            infertau: infer_tau,
            ..Default::default()
        };
        let mut config = ConfigResolver::resolve(&raw, Path::new("/w")).unwrap();
        config.features.t1_fixed = t1_fixed;
        let t1t = VolumeRef::new("/s/T1t");
        let g = VolumeRef::new("/s/g");
        let t1wm = VolumeRef::new("/s/T1wm_prior");
        let pv_maps = maps();
        quasar_spec(
            &config,
            &PriorImages {
                t1t: &t1t,
                g: Some(&g),
                t1wm: Some(&t1wm),
                pv: pv.then_some(&pv_maps),
            },
        )
    }

    #[test]
    fn test_builder_agrees_with_lookup_for_all_switches() {
        for (t1_fixed, pv, tau) in TRIPLES {
            let spec = spec_for(t1_fixed, pv, tau);
            let expected = PriorSlots::lookup(t1_fixed, pv, tau);
            check_slots(&spec, &expected)
                .unwrap_or_else(|e| panic!("({t1_fixed}, {pv}, {tau}): {e}"));
            assert_eq!(spec.spatial_priors().len(), expected.param_count);
        }
    }

    #[test]
    fn test_lookup_is_deterministic_and_distinct() {
        let mut seen = HashSet::new();
        for (t1_fixed, pv, tau) in TRIPLES {
            let a = PriorSlots::lookup(t1_fixed, pv, tau);
            assert_eq!(a, PriorSlots::lookup(t1_fixed, pv, tau));
            assert!(seen.insert(a.entries()), "duplicate layout for ({t1_fixed}, {pv}, {tau})");

            // slots strictly increase and stay within the parameter count
            let slots: Vec<usize> = a.entries().iter().map(|(_, s)| *s).collect();
            assert!(slots.windows(2).all(|w| w[0] < w[1]));
            assert!(slots.iter().all(|s| *s >= 1 && *s <= a.param_count));
        }
    }

    #[test]
    fn test_default_layout_text() {
        let spec = spec_for(false, false, false);
        let text = spec.to_text();
        assert!(text.contains("--param-spatial-priors=MNANII\n"));
        assert!(text.contains("--image-prior5=/s/T1t\n"));
        assert!(text.contains("--image-prior6=/s/g\n"));
        assert!(text.contains("--disp=none\n"));
        assert!(text.contains("--infert1\n"));
        assert!(!text.contains("--infertau"));
        assert!(!text.contains("--t1wm"));
    }

    #[test]
    fn test_full_layout_text() {
        let spec = spec_for(false, true, true);
        assert_eq!(spec.spatial_priors(), "MNNMNNANIIIII");
        let text = spec.to_text();
        for line in [
            "--image-prior9=/s/T1t",
            "--image-prior10=/s/T1wm_prior",
            "--image-prior11=/s/g",
            "--image-prior12=/s/pvgm_lowres",
            "--image-prior13=/s/pvwm_lowres",
            "--infertau",
            "--incwm",
        ] {
            assert!(text.lines().any(|l| l == line), "missing {line}");
        }
    }

    #[test]
    fn test_shifted_slot_is_rejected() {
        let spec = spec_for(false, true, false);
        let wrong = PriorSlots::lookup(false, true, true);
        let err = check_slots(&spec, &wrong).unwrap_err();
        assert!(matches!(err, QuasilError::PriorSlotMismatch { .. }));

        // same count, different positions
        let spec = spec_for(true, false, true);
        let mut wrong = PriorSlots::lookup(true, false, true);
        wrong.g = 5;
        assert!(check_slots(&spec, &wrong).is_err());
    }

    #[test]
    fn test_flat_g_prior_without_internal_calibration() {
        let raw = RawOptions {
            input: Some("asl".into()),
            ..Default::default()
        };
        let config = ConfigResolver::resolve(&raw, Path::new("/w")).unwrap();
        let t1t = VolumeRef::new("/s/T1t");
        let spec = quasar_spec(
            &config,
            &PriorImages {
                t1t: &t1t,
                g: None,
                t1wm: None,
                pv: None,
            },
        );
        assert_eq!(spec.spatial_priors(), "MNANIN");
        assert_eq!(spec.slot_of("g"), Some(6));
        check_slots(&spec, &PriorSlots::lookup(false, false, false)).unwrap();
    }
}
