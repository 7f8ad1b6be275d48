use std::fs;
use std::path::{Path, PathBuf};

use clean_path::Clean;

use crate::error::{Error, Result};

/// Bounded filesystem region. Resolving a name through the sandbox either
/// yields a path under the root or fails; no filesystem access happens for
/// rejected paths.
#[derive(Debug, Clone)]
pub struct PathSandbox {
    root: PathBuf,
}

impl PathSandbox {
    /// Create the root directory if needed and pin it, canonicalized, for
    /// the lifetime of the sandbox.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root: PathBuf = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self {
            root: root.canonicalize()?,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve `name` under `subdir` (or the root when `subdir` is empty).
    ///
    /// The candidate path is normalized lexically; `..` components and
    /// absolute names that would land outside the base are rejected.
    pub fn resolve(&self, name: &str, subdir: &str) -> Result<PathBuf> {
        let base = if subdir.is_empty() {
            self.root.clone()
        } else {
            self.root.join(subdir)
        };

        let target = base.join(name).clean();
        if target == base || !target.starts_with(&base) {
            return Err(Error::Sandbox(name.to_string()));
        }

        Ok(target)
    }
}
