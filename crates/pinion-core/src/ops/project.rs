//! Project file layout.

use std::path::{Path, PathBuf};

use tokio::fs;

use super::OpError;
use pinion_schema::Manifest;

/// Manifest file name at a project root.
pub const MANIFEST_FILE: &str = "Pinfile";
/// Lock artifact file name at a project root.
pub const LOCK_FILE: &str = "Pinfile.lock";

/// A project directory holding a manifest and (once locked) a lock
/// artifact.
#[derive(Debug, Clone)]
pub struct Project {
    root: PathBuf,
}

impl Project {
    /// A project rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The project root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the manifest file.
    pub fn manifest_path(&self) -> PathBuf {
        self.root.join(MANIFEST_FILE)
    }

    /// Path of the lock artifact.
    pub fn lock_path(&self) -> PathBuf {
        self.root.join(LOCK_FILE)
    }

    /// Load and validate the project manifest.
    ///
    /// # Errors
    ///
    /// Returns [`OpError::Io`] if the file cannot be read and
    /// [`OpError::Manifest`] if its contents fail validation.
    pub async fn load_manifest(&self) -> Result<Manifest, OpError> {
        let text = fs::read_to_string(self.manifest_path()).await?;
        Ok(Manifest::from_toml(&text)?)
    }
}
