//! Output and scratch directory management.
//!
//! A [`Workspace`] owns two directories: the permanent, user-visible output
//! directory and an ephemeral scratch directory for intermediate volumes.
//! The scratch directory is released exactly once, either explicitly through
//! [`Workspace::release`] or when the workspace is dropped on an early
//! return, so aborted runs clean up the same way finished ones do.

use std::ffi::OsString;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tracing::warn;
use uuid::Uuid;

use crate::error::{QuasilError, Result};
use crate::obs;
use crate::volume::VolumeRef;

/// Output directory names tried before giving up: the base name plus up to
/// 19 appended suffixes.
pub const MAX_OUTPUT_CANDIDATES: usize = 20;

/// Appended to the output base name on each collision.
pub const COLLISION_SUFFIX: &str = "+";

const SCRATCH_PREFIX: &str = "quasil_";
const MAX_SCRATCH_ATTEMPTS: usize = 8;

/// Where and how a workspace is laid out.
#[derive(Debug, Clone)]
pub struct WorkspaceOptions {
    /// Directory under which the scratch directory is created.
    pub scratch_root: PathBuf,

    /// Directory the run was started from; debug scratch is moved here.
    pub invocation_dir: PathBuf,

    /// Keep the scratch directory instead of deleting it.
    pub debug: bool,
}

impl WorkspaceOptions {
    /// Scratch under the system temp directory, deleted on release.
    pub fn new(invocation_dir: impl Into<PathBuf>) -> Self {
        Self {
            scratch_root: std::env::temp_dir(),
            invocation_dir: invocation_dir.into(),
            debug: false,
        }
    }

    pub fn with_scratch_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.scratch_root = root.into();
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }
}

/// Output and scratch directories of one run.
#[derive(Debug)]
pub struct Workspace {
    output_dir: PathBuf,
    scratch_dir: PathBuf,
    invocation_dir: PathBuf,
    debug: bool,
    released: bool,
}

impl Workspace {
    /// Create a fresh output directory derived from `base` and a uniquely
    /// named scratch directory.
    pub fn allocate(base: &Path, options: &WorkspaceOptions) -> Result<Self> {
        let output_dir = allocate_output_dir(base)?;
        let scratch_dir = match create_scratch_dir(&options.scratch_root) {
            Ok(dir) => dir,
            Err(e) => {
                // nothing has been written to it yet
                if let Err(cleanup) = fs::remove_dir(&output_dir) {
                    warn!(output_dir = %output_dir.display(), error = %cleanup, "failed to remove output directory");
                }
                return Err(e);
            }
        };
        obs::emit_workspace_allocated(&output_dir, &scratch_dir);

        Ok(Self {
            output_dir,
            scratch_dir,
            invocation_dir: options.invocation_dir.clone(),
            debug: options.debug,
            released: false,
        })
    }

    /// Absolute path of the output directory.
    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn scratch_dir(&self) -> &Path {
        &self.scratch_dir
    }

    pub fn invocation_dir(&self) -> &Path {
        &self.invocation_dir
    }

    /// A volume in the scratch directory.
    pub fn scratch(&self, name: &str) -> VolumeRef {
        VolumeRef::in_dir(&self.scratch_dir, name)
    }

    /// A volume in the output directory.
    pub fn output(&self, name: &str) -> VolumeRef {
        VolumeRef::in_dir(&self.output_dir, name)
    }

    /// Delete the scratch directory, or in debug mode move it next to the
    /// invocation directory. Failures are logged, never raised. Returns the
    /// retained location in debug mode.
    ///
    /// Only the first call has any effect.
    pub fn release(&mut self) -> Option<PathBuf> {
        if self.released {
            return None;
        }
        self.released = true;

        if !self.debug {
            if let Err(e) = fs::remove_dir_all(&self.scratch_dir) {
                warn!(scratch_dir = %self.scratch_dir.display(), error = %e, "failed to remove scratch directory");
            }
            obs::emit_workspace_released(&self.scratch_dir, None);
            return None;
        }

        let Some(name) = self.scratch_dir.file_name() else {
            return None;
        };
        let dest = self.invocation_dir.join(name);
        match relocate(&self.scratch_dir, &dest) {
            Ok(()) => {
                obs::emit_workspace_released(&self.scratch_dir, Some(&dest));
                Some(dest)
            }
            Err(e) => {
                warn!(
                    scratch_dir = %self.scratch_dir.display(),
                    dest = %dest.display(),
                    error = %e,
                    "failed to relocate scratch directory; left in place"
                );
                Some(self.scratch_dir.clone())
            }
        }
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        self.release();
    }
}

/// Create the first free directory among `base`, `base+`, `base++`, ...
/// and return its absolute path. Only existing directories count as taken; a
/// file squatting on a candidate name is an I/O error.
pub fn allocate_output_dir(base: &Path) -> Result<PathBuf> {
    // Normalising drops any trailing separator so suffixes attach to the name.
    let base: PathBuf = base.components().collect();
    if let Some(parent) = base.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }

    let mut candidate: OsString = base.clone().into_os_string();
    for _ in 0..MAX_OUTPUT_CANDIDATES {
        let path = PathBuf::from(&candidate);
        if !path.is_dir() {
            match fs::create_dir(&path) {
                Ok(()) => return Ok(fs::canonicalize(&path)?),
                // lost a race to another run
                Err(e) if e.kind() == ErrorKind::AlreadyExists && path.is_dir() => {}
                Err(e) => return Err(e.into()),
            }
        }
        candidate.push(COLLISION_SUFFIX);
    }

    Err(QuasilError::WorkspaceExhausted {
        base,
        attempts: MAX_OUTPUT_CANDIDATES,
    })
}

fn create_scratch_dir(root: &Path) -> Result<PathBuf> {
    fs::create_dir_all(root)?;
    let mut last_err = None;
    for _ in 0..MAX_SCRATCH_ATTEMPTS {
        let path = root.join(format!("{SCRATCH_PREFIX}{}", Uuid::new_v4().simple()));
        match fs::create_dir(&path) {
            Ok(()) => return Ok(fs::canonicalize(&path)?),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => last_err = Some(e),
            Err(e) => return Err(e.into()),
        }
    }
    Err(last_err
        .unwrap_or_else(|| std::io::Error::new(ErrorKind::AlreadyExists, "scratch directory collision"))
        .into())
}

/// Move a directory, falling back to copy-and-delete across filesystems.
fn relocate(from: &Path, to: &Path) -> std::io::Result<()> {
    if to.exists() {
        return Err(std::io::Error::new(
            ErrorKind::AlreadyExists,
            format!("{} already exists", to.display()),
        ));
    }
    if fs::rename(from, to).is_ok() {
        return Ok(());
    }
    copy_dir_all(from, to)?;
    fs::remove_dir_all(from)
}

fn copy_dir_all(from: &Path, to: &Path) -> std::io::Result<()> {
    fs::create_dir_all(to)?;
    for entry in fs::read_dir(from)? {
        let entry = entry?;
        let target = to.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir_all(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}
