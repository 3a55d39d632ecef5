//! Handles to volumetric datasets on disk.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// File suffixes the image toolkit may attach to a volume base name.
const VOLUME_SUFFIXES: [&str; 3] = [".nii.gz", ".nii", ".hdr"];

/// An extension-less reference to a volume understood by the image toolkit.
///
/// The pipeline never reads voxel data; it only names volumes and checks
/// that tools produced them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VolumeRef(PathBuf);

impl VolumeRef {
    /// Reference a volume, stripping any known image suffix.
    pub fn new(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        let text = path.to_string_lossy();
        for suffix in VOLUME_SUFFIXES {
            if let Some(stem) = text.strip_suffix(suffix) {
                return Self(PathBuf::from(stem));
            }
        }
        Self(path.to_path_buf())
    }

    /// Reference `name` inside `dir`.
    pub fn in_dir(dir: &Path, name: &str) -> Self {
        Self(dir.join(name))
    }

    pub fn base(&self) -> &Path {
        &self.0
    }

    /// The final path component, without suffix.
    pub fn name(&self) -> String {
        self.0
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// Sibling volume named `<name><suffix>`.
    pub fn with_suffix(&self, suffix: &str) -> Self {
        let mut name = self.0.as_os_str().to_owned();
        name.push(suffix);
        Self(PathBuf::from(name))
    }

    /// Whether a file for this volume exists under any known suffix.
    pub fn exists(&self) -> bool {
        self.resolve().is_some()
    }

    /// The concrete file backing this volume, if present.
    pub fn resolve(&self) -> Option<PathBuf> {
        if self.0.is_file() {
            return Some(self.0.clone());
        }
        VOLUME_SUFFIXES
            .iter()
            .map(|suffix| self.with_suffix(suffix).0)
            .find(|candidate| candidate.is_file())
    }

    /// Argument form passed to external tools.
    pub fn arg(&self) -> String {
        self.0.to_string_lossy().into_owned()
    }
}

impl std::fmt::Display for VolumeRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.display())
    }
}
