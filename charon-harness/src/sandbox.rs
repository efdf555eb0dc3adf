//! Per-scenario sandbox directories.

use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{HarnessError, HarnessResult};
use crate::logging::sanitize_component;

static SANDBOX_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// An exclusively owned directory tree for one scenario.
///
/// The tree is removed on [`Sandbox::destroy`] or drop unless
/// [`Sandbox::keep`] was called.
#[derive(Debug)]
pub struct Sandbox {
    root: PathBuf,
    keep: bool,
}

impl Sandbox {
    /// Create a fresh root under `base` named after `scenario`.
    ///
    /// The directory name combines the sanitized scenario name, the process
    /// id and a process-wide sequence number.
    pub fn create(base: &Path, scenario: &str) -> HarnessResult<Self> {
        let sequence = SANDBOX_SEQUENCE.fetch_add(1, Ordering::Relaxed);
        let name = format!(
            "{}_{}_{sequence}",
            sanitize_component(scenario),
            std::process::id()
        );
        Self::create_at(base.join(name))
    }

    /// Create an empty root at exactly `root`, removing any stale tree there.
    pub fn create_at(root: impl Into<PathBuf>) -> HarnessResult<Self> {
        let root = root.into();
        destroy_root(&root)?;
        std::fs::create_dir_all(&root)
            .map_err(|e| HarnessError::fixture_io("create sandbox", &root, e))?;
        tracing::debug!(root = %root.display(), "sandbox created");
        Ok(Self { root, keep: false })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Absolute path of `relative` inside the root.
    ///
    /// Absolute paths, `..` and prefix components are rejected.
    pub fn resolve(&self, relative: impl AsRef<Path>) -> HarnessResult<PathBuf> {
        resolve_under(&self.root, relative.as_ref())
    }

    /// Leave the tree on disk when the sandbox is dropped.
    pub fn keep(&mut self) {
        self.keep = true;
    }

    /// Remove the tree now. A missing tree counts as success.
    pub fn destroy(&mut self) -> HarnessResult<()> {
        destroy_root(&self.root)
    }
}

impl Drop for Sandbox {
    fn drop(&mut self) {
        if !self.keep
            && let Err(error) = destroy_root(&self.root)
        {
            tracing::warn!(root = %self.root.display(), %error, "failed to remove sandbox");
        }
    }
}

/// Join `relative` onto `root`, refusing anything that could leave it.
pub(crate) fn resolve_under(root: &Path, relative: &Path) -> HarnessResult<PathBuf> {
    let mut resolved = root.to_path_buf();
    for component in relative.components() {
        match component {
            Component::Normal(part) => resolved.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(HarnessError::PathEscape(relative.display().to_string()));
            }
        }
    }
    Ok(resolved)
}

/// Recursively remove `root`, treating "not found" as success.
pub fn destroy_root(root: &Path) -> HarnessResult<()> {
    match std::fs::remove_dir_all(root) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(HarnessError::fixture_io("remove sandbox", root, e)),
    }
}
