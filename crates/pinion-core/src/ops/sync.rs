//! The sync operation.

use std::path::PathBuf;

use tokio::fs;
use tracing::{debug, warn};

use super::{OpError, Project};
use crate::sync::{self, EnvironmentSnapshot, ExecuteOptions, Installer, SyncReport};
use pinion_schema::{Category, LockArtifact, MarkerEnvironment};

/// Caller-tunable sync inputs.
#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// Lock sections to converge.
    pub categories: Vec<Category>,
    /// Install into this directory instead of the default site.
    pub target: Option<PathBuf>,
    /// Replace every fetch URL with this base for the run. Does not
    /// touch the lock artifact.
    pub mirror: Option<String>,
    /// Target attributes for re-evaluating stored markers.
    pub environment: MarkerEnvironment,
    /// Plan execution tuning.
    pub execute: ExecuteOptions,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            categories: vec![Category::Default],
            target: None,
            mirror: None,
            environment: MarkerEnvironment::linux_cpython("3.11"),
            execute: ExecuteOptions::default(),
        }
    }
}

/// Converge an environment toward a project's lock artifact.
///
/// The lock artifact is the only input to what gets installed; the
/// manifest is consulted solely for an advisory staleness warning, and a
/// missing or changed manifest never re-resolves anything. A missing lock
/// artifact is [`OpError::LockNotFound`]. The lock file is never written.
///
/// # Errors
///
/// Returns [`OpError`] when the lock artifact is absent or fails to
/// decode, or when plan execution reports a partial result.
pub async fn sync_project(
    project: &Project,
    snapshot: &EnvironmentSnapshot,
    installer: &dyn Installer,
    opts: &SyncOptions,
) -> Result<SyncReport, OpError> {
    let path = project.lock_path();
    let bytes = match fs::read(&path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(OpError::LockNotFound { path });
        }
        Err(e) => return Err(e.into()),
    };
    let artifact = LockArtifact::decode(&bytes)?;

    if let Ok(manifest) = project.load_manifest().await {
        if manifest.fingerprint() != artifact.meta.hash {
            warn!(
                path = %path.display(),
                "lock artifact is out of date with the manifest; syncing the locked state anyway"
            );
        }
    }

    let plan = sync::plan(
        &artifact,
        snapshot,
        &opts.categories,
        opts.target.as_ref(),
        &opts.environment,
        opts.mirror.as_deref(),
    );
    if plan.is_empty() {
        debug!("environment already matches the lock artifact");
        return Ok(SyncReport::default());
    }
    debug!(actions = plan.len(), "executing sync plan");

    Ok(sync::execute(&plan, installer, &opts.execute).await?)
}
