//! Model specifications for the Bayesian fitting engine.
//!
//! The engine reads its configuration as one directive per line
//! (`--key=value` or a bare `--flag`). Parameters it infers are numbered from
//! 1 in the order the model declares them; per-voxel priors are attached by
//! that number (`--image-prior<N>=<volume>`) and the prior type of every
//! parameter is given positionally in `--param-spatial-priors`.
//!
//! [`ModelSpecBuilder`] assigns those numbers as parameters are declared, so
//! the slot of an image prior always agrees with the position of the
//! parameter it belongs to and with its character in the prior string.

use std::fmt::Display;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::volume::VolumeRef;

/// Prior placed on an inferred parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PriorKind {
    /// Spatial Markov random field prior.
    Markov,
    /// Non-spatial prior.
    NonSpatial,
    /// Automatic relevance determination.
    Ard,
    /// Per-voxel prior taken from a volume.
    Image(VolumeRef),
}

impl PriorKind {
    /// Character used in the spatial prior string.
    pub fn code(&self) -> char {
        match self {
            PriorKind::Markov => 'M',
            PriorKind::NonSpatial => 'N',
            PriorKind::Ard => 'A',
            PriorKind::Image(_) => 'I',
        }
    }
}

/// One line of a model specification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Directive {
    Flag(String),
    Setting { key: String, value: String },
}

impl Directive {
    pub fn render(&self) -> String {
        match self {
            Directive::Flag(name) => format!("--{name}"),
            Directive::Setting { key, value } => format!("--{key}={value}"),
        }
    }
}

/// A parameter the model infers, with its 1-based slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InferredParam {
    pub name: String,
    pub slot: usize,
    pub prior: char,
}

/// An image prior bound to a slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImagePrior {
    pub slot: usize,
    pub param: String,
    pub volume: VolumeRef,
}

/// An ordered, immutable model specification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSpec {
    directives: Vec<Directive>,
    params: Vec<InferredParam>,
    image_priors: Vec<ImagePrior>,
}

impl ModelSpec {
    pub fn directives(&self) -> &[Directive] {
        &self.directives
    }

    /// Inferred parameters in slot order.
    pub fn params(&self) -> &[InferredParam] {
        &self.params
    }

    pub fn image_priors(&self) -> &[ImagePrior] {
        &self.image_priors
    }

    /// Slot of a named parameter.
    pub fn slot_of(&self, name: &str) -> Option<usize> {
        self.params.iter().find(|p| p.name == name).map(|p| p.slot)
    }

    /// One prior character per inferred parameter, in slot order.
    pub fn spatial_priors(&self) -> String {
        self.params.iter().map(|p| p.prior).collect()
    }

    /// Whether the spec carries a bare flag.
    pub fn has_flag(&self, name: &str) -> bool {
        self.directives
            .iter()
            .any(|d| matches!(d, Directive::Flag(f) if f == name))
    }

    /// Value of a `--key=value` directive.
    pub fn setting(&self, key: &str) -> Option<&str> {
        self.directives.iter().find_map(|d| match d {
            Directive::Setting { key: k, value } if k == key => Some(value.as_str()),
            _ => None,
        })
    }

    /// Render the text handed to the fitting engine.
    pub fn to_text(&self) -> String {
        let mut lines: Vec<String> = self.directives.iter().map(Directive::render).collect();
        if !self.params.is_empty() {
            lines.push(format!("--param-spatial-priors={}", self.spatial_priors()));
        }
        for prior in &self.image_priors {
            lines.push(format!("--image-prior{}={}", prior.slot, prior.volume.arg()));
        }
        let mut text = lines.join("\n");
        text.push('\n');
        text
    }

    /// Write the rendered text to `path`, returning it.
    pub fn write_to(&self, path: &Path) -> Result<String> {
        let text = self.to_text();
        std::fs::write(path, &text)?;
        Ok(text)
    }
}

/// Builds a [`ModelSpec`], numbering inferred parameters as they are declared.
#[derive(Debug)]
pub struct ModelSpecBuilder {
    directives: Vec<Directive>,
    params: Vec<InferredParam>,
    image_priors: Vec<ImagePrior>,
    next_slot: usize,
}

impl Default for ModelSpecBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ModelSpecBuilder {
    pub fn new() -> Self {
        Self {
            directives: Vec::new(),
            params: Vec::new(),
            image_priors: Vec::new(),
            next_slot: 1,
        }
    }

    /// Append a bare `--flag`.
    pub fn flag(mut self, name: &str) -> Self {
        self.directives.push(Directive::Flag(name.to_string()));
        self
    }

    /// Append `--key=value`.
    pub fn setting(mut self, key: &str, value: impl Display) -> Self {
        self.directives.push(Directive::Setting {
            key: key.to_string(),
            value: value.to_string(),
        });
        self
    }

    /// Append `--ti1=..`, `--ti2=..`, one per TI.
    pub fn tis(mut self, tis: &[f64]) -> Self {
        for (i, ti) in tis.iter().enumerate() {
            self = self.setting(&format!("ti{}", i + 1), ti);
        }
        self
    }

    /// Declare the next inferred parameter. Its slot is the next free one.
    pub fn infer(mut self, name: &str, prior: PriorKind) -> Self {
        let slot = self.next_slot;
        self.next_slot += 1;

        self.params.push(InferredParam {
            name: name.to_string(),
            slot,
            prior: prior.code(),
        });
        if let PriorKind::Image(volume) = prior {
            self.image_priors.push(ImagePrior {
                slot,
                param: name.to_string(),
                volume,
            });
        }
        self
    }

    /// Declare a parameter only when `condition` holds.
    pub fn infer_if(self, condition: bool, name: &str, prior: PriorKind) -> Self {
        if condition {
            self.infer(name, prior)
        } else {
            self
        }
    }

    pub fn build(self) -> ModelSpec {
        ModelSpec {
            directives: self.directives,
            params: self.params,
            image_priors: self.image_priors,
        }
    }
}
