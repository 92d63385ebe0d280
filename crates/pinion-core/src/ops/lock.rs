//! The lock operation.

use tokio::fs;
use tracing::debug;

use super::{OpError, Project};
use crate::provider::MetadataProvider;
use crate::resolver::{ResolveOptions, resolve};
use pinion_schema::{Category, LockArtifact};

/// Resolve a project's manifest and write its lock artifact.
///
/// Both categories are resolved against the same source registry. With a
/// `mirror` override every source URL is replaced for this run and the
/// mirrored registry is what gets recorded in the artifact's `_meta`
/// block, so a later sync fetches from the same place the resolution
/// consulted. The artifact is written to a temporary file and renamed, so
/// readers never observe a partially written lock.
///
/// # Errors
///
/// Returns [`OpError`] if the manifest fails to load, either category
/// fails to resolve, or the artifact cannot be written.
pub async fn lock_project(
    project: &Project,
    provider: &dyn MetadataProvider,
    mirror: Option<&str>,
    opts: &ResolveOptions,
) -> Result<LockArtifact, OpError> {
    let manifest = project.load_manifest().await?;
    let registry = match mirror {
        Some(url) => manifest.sources.with_mirror(url),
        None => manifest.sources.clone(),
    };

    let default = resolve(&manifest, &registry, provider, Category::Default, opts).await?;
    let develop = resolve(&manifest, &registry, provider, Category::Develop, opts).await?;

    let artifact = LockArtifact::from_graphs(
        manifest.fingerprint(),
        manifest.requires_python.clone(),
        registry.iter().cloned().collect(),
        &default,
        &develop,
    );

    let path = project.lock_path();
    let temp_path = path.with_extension("lock.tmp");
    fs::write(&temp_path, artifact.encode()?).await?;
    fs::rename(&temp_path, &path).await?;

    debug!(
        default = artifact.default.len(),
        develop = artifact.develop.len(),
        path = %path.display(),
        "lock artifact written"
    );
    Ok(artifact)
}
