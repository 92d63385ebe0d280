//! The sync engine.
//!
//! Sync converges an environment toward a lock artifact: it diffs the
//! locked pin set against an [`EnvironmentSnapshot`], plans the minimal
//! set of installs, and executes the plan through an injected
//! [`Installer`] capability. Sync never resolves, never writes the lock,
//! and never uninstalls packages absent from the lock (the environment is
//! augmented and repaired, not made exclusive). Re-running sync after a
//! partial failure is the documented recovery path.

use async_trait::async_trait;
use futures::StreamExt;
use pinion_schema::{
    ArtifactDigest, Category, LockArtifact, MarkerEnvironment, PackageName, Version,
};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Where an install lands.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum InstallLocation {
    /// The environment-managed default site.
    Default,
    /// An externally supplied target directory override.
    Target(PathBuf),
}

impl std::fmt::Display for InstallLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Default => write!(f, "default site"),
            Self::Target(path) => write!(f, "{}", path.display()),
        }
    }
}

/// The installed package set of one environment.
///
/// Read by the engine before planning and again to verify convergence;
/// mutated only by the installer capability.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvironmentSnapshot {
    installed: BTreeMap<(PackageName, InstallLocation), Version>,
}

impl EnvironmentSnapshot {
    /// An empty environment.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an installed package. Called by installer implementations.
    pub fn record(&mut self, name: PackageName, version: Version, location: InstallLocation) {
        self.installed.insert((name, location), version);
    }

    /// The installed version of a package at one location.
    pub fn installed_version(
        &self,
        name: &PackageName,
        location: &InstallLocation,
    ) -> Option<&Version> {
        self.installed.get(&(name.clone(), location.clone()))
    }

    /// All records, in deterministic order.
    pub fn iter(
        &self,
    ) -> impl Iterator<Item = (&(PackageName, InstallLocation), &Version)> {
        self.installed.iter()
    }

    /// Number of installed records.
    pub fn len(&self) -> usize {
        self.installed.len()
    }

    /// Whether nothing is installed.
    pub fn is_empty(&self) -> bool {
        self.installed.is_empty()
    }
}

/// One planned install.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallAction {
    /// Package to install.
    pub name: PackageName,
    /// Exact locked version.
    pub version: Version,
    /// Digest set the fetched artifact must hash into.
    pub digests: BTreeSet<ArtifactDigest>,
    /// Name of the lock source the pin came from.
    pub index: String,
    /// Base URL to fetch from: the lock source's URL, or the mirror
    /// override when one is in force for this run.
    pub index_url: String,
    /// Where the install goes.
    pub location: InstallLocation,
    /// Which lock section requested it.
    pub category: Category,
    /// The version being replaced, when the package is present at the
    /// comparison location at a different version.
    pub replaces: Option<Version>,
}

/// The minimal set of actions that converges an environment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncPlan {
    /// Planned installs, ordered by category then name.
    pub actions: Vec<InstallAction>,
}

impl SyncPlan {
    /// Whether the environment already matches the lock.
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Number of planned installs.
    pub fn len(&self) -> usize {
        self.actions.len()
    }
}

/// Compute the action plan for one lock against one environment.
///
/// A package is planned if it is absent at the comparison location or
/// present at a different version; an exact match needs no action, so an
/// unchanged lock and environment produce an empty plan. Packages
/// installed but absent from the lock are left untouched. With a target
/// override the comparison is scoped to that location only and every
/// planned install is directed there.
///
/// Node markers stored in the lock are re-evaluated against
/// `environment`, so a lock produced for one target can be synced onto
/// another. A `mirror` override replaces every fetch URL uniformly,
/// leaving source identity untouched.
pub fn plan(
    lock: &LockArtifact,
    snapshot: &EnvironmentSnapshot,
    categories: &[Category],
    target: Option<&PathBuf>,
    environment: &MarkerEnvironment,
    mirror: Option<&str>,
) -> SyncPlan {
    let location = target.map_or(InstallLocation::Default, |t| {
        InstallLocation::Target(t.clone())
    });

    let mut actions = Vec::new();
    for category in categories {
        for (name, package) in lock.section(*category) {
            if let Some(marker_text) = &package.markers {
                // Decode rejects unparseable stored markers; a hand-built
                // artifact reaching here with one is never installed on
                // a condition we cannot read.
                match pinion_schema::MarkerExpr::parse(marker_text) {
                    Ok(marker) => {
                        if !marker.evaluate(environment) {
                            tracing::debug!(package = %name, marker = %marker_text,
                                "locked package inactive for target environment");
                            continue;
                        }
                    }
                    Err(error) => {
                        tracing::warn!(package = %name, marker = %marker_text, %error,
                            "unparseable stored marker, skipping package");
                        continue;
                    }
                }
            }

            let installed = snapshot.installed_version(name, &location);
            if installed == Some(&package.version) {
                continue;
            }
            let index_url = mirror.map_or_else(
                || {
                    lock.meta
                        .sources
                        .iter()
                        .find(|s| s.name == package.index)
                        .map_or_else(String::new, |s| s.url.clone())
                },
                ToString::to_string,
            );
            actions.push(InstallAction {
                name: name.clone(),
                version: package.version.clone(),
                digests: package.digests.clone(),
                index: package.index.clone(),
                index_url,
                location: location.clone(),
                category: *category,
                replaces: installed.cloned(),
            });
        }
    }

    SyncPlan { actions }
}

/// Why one install entry failed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InstallFailure {
    /// The fetched artifact's content hash is not a member of the
    /// recorded digest set. Never ignored.
    #[error("hash mismatch: {actual} is not among {expected} recorded digests", expected = recorded.len())]
    HashMismatch {
        /// Digest of what was actually fetched.
        actual: ArtifactDigest,
        /// The digests the lock permits.
        recorded: BTreeSet<ArtifactDigest>,
    },
    /// The artifact could not be fetched.
    #[error("artifact unavailable: {0}")]
    Unavailable(String),
    /// Filesystem-level failure while materializing the install.
    #[error("io error: {0}")]
    Io(String),
    /// The install call returned success but the environment record does
    /// not reflect the pinned version afterwards.
    #[error("install reported success but is not reflected in the environment")]
    Unverified {
        /// What the environment records instead, if anything.
        found: Option<Version>,
    },
    /// The sync run was cancelled before this entry completed.
    #[error("cancelled")]
    Cancelled,
}

/// One install handed to the installer capability.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallRequest {
    /// Package to install.
    pub name: PackageName,
    /// Exact version to install.
    pub version: Version,
    /// Digest set for verification; the installer must refuse content
    /// hashing outside it.
    pub digests: BTreeSet<ArtifactDigest>,
    /// Name of the source to fetch from.
    pub index: String,
    /// Effective base URL to fetch from (mirror-substituted when a
    /// mirror override is in force).
    pub index_url: String,
    /// Destination.
    pub location: InstallLocation,
}

/// External install capability.
///
/// Implementations own artifact fetch/verify mechanics and are the only
/// party that mutates the environment's authoritative record; writes to
/// it must be serialized.
#[async_trait]
pub trait Installer: Send + Sync {
    /// Install exactly one locked package, verifying its content hash
    /// against the recorded digest set.
    async fn install(&self, request: &InstallRequest) -> Result<(), InstallFailure>;

    /// The version the environment record currently holds for a package
    /// at a location. Read after execution to confirm convergence.
    async fn installed(&self, name: &PackageName, location: &InstallLocation) -> Option<Version>;
}

/// Per-entry detail inside a [`SyncError::Partial`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedInstall {
    /// The action that failed.
    pub action: InstallAction,
    /// Why.
    pub failure: InstallFailure,
}

/// Outcome of a fully converged execution.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Every action that ran, in name order.
    pub installed: Vec<InstallAction>,
}

/// Error produced by plan execution.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Some planned entries failed or were cancelled; the environment
    /// holds whatever subset converged. Re-running sync is the recovery
    /// path. Never reported as success.
    #[error("{} of {} planned installs failed", failed.len(), installed.len() + failed.len())]
    Partial {
        /// Entries that converged.
        installed: Vec<InstallAction>,
        /// Entries that did not, with per-entry detail.
        failed: Vec<FailedInstall>,
    },
}

/// Caller-tunable execution inputs.
#[derive(Debug, Clone)]
pub struct ExecuteOptions {
    /// Cap on concurrent install operations.
    pub concurrency: usize,
    /// Cooperative cancellation; in-flight entries abort as failed.
    pub cancel: CancellationToken,
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self {
            concurrency: 4,
            cancel: CancellationToken::new(),
        }
    }
}

/// Execute a plan through the installer capability.
///
/// Entries run with bounded parallelism; a package is converged only once
/// its install call returns success AND a re-read of the environment
/// record shows the pinned version at the planned location. There is no
/// rollback: entries that succeeded stay installed even when later
/// entries fail.
///
/// # Errors
///
/// Returns [`SyncError::Partial`] when any entry fails or the run is
/// cancelled mid-flight, enumerating succeeded and failed entries.
pub async fn execute(
    plan: &SyncPlan,
    installer: &dyn Installer,
    opts: &ExecuteOptions,
) -> Result<SyncReport, SyncError> {
    let cancel = &opts.cancel;
    let outcomes: Vec<(InstallAction, Result<(), InstallFailure>)> =
        futures::stream::iter(plan.actions.iter().cloned().map(|action| async move {
            if cancel.is_cancelled() {
                return (action, Err(InstallFailure::Cancelled));
            }
            let request = InstallRequest {
                name: action.name.clone(),
                version: action.version.clone(),
                digests: action.digests.clone(),
                index: action.index.clone(),
                index_url: action.index_url.clone(),
                location: action.location.clone(),
            };
            let result = tokio::select! {
                result = installer.install(&request) => result,
                () = cancel.cancelled() => Err(InstallFailure::Cancelled),
            };
            (action, result)
        }))
        .buffer_unordered(opts.concurrency.max(1))
        .collect()
        .await;

    let mut installed = Vec::new();
    let mut failed = Vec::new();
    for (action, result) in outcomes {
        match result {
            Ok(()) => {
                let found = installer.installed(&action.name, &action.location).await;
                if found.as_ref() == Some(&action.version) {
                    installed.push(action);
                } else {
                    tracing::warn!(package = %action.name, version = %action.version,
                        "install reported success but is not reflected in the environment");
                    failed.push(FailedInstall {
                        action,
                        failure: InstallFailure::Unverified { found },
                    });
                }
            }
            Err(failure) => {
                tracing::warn!(package = %action.name, version = %action.version,
                    error = %failure, "install entry failed");
                failed.push(FailedInstall { action, failure });
            }
        }
    }
    // Unordered completion; reports are deterministic regardless
    installed.sort_by(|a, b| a.name.cmp(&b.name));
    failed.sort_by(|a, b| a.action.name.cmp(&b.action.name));

    if failed.is_empty() {
        Ok(SyncReport { installed })
    } else {
        Err(SyncError::Partial { installed, failed })
    }
}

/// Deterministic in-memory installer for tests.
///
/// Simulates fetching artifact content (the bytes `{name}-{version}`,
/// matching what [`crate::provider::InMemoryProvider`] hashes), verifies
/// the digest against the request, and records successful installs into
/// a shared snapshot. Fetch URLs are logged so tests can assert where a
/// mirror override actually directed traffic. Packages can be marked
/// corrupted to exercise the hash-mismatch path.
#[derive(Debug, Default)]
pub struct InMemoryInstaller {
    snapshot: std::sync::Arc<tokio::sync::Mutex<EnvironmentSnapshot>>,
    /// Packages whose simulated content will not hash into the lock.
    corrupted: BTreeSet<PackageName>,
    fetched_urls: std::sync::Mutex<BTreeSet<String>>,
}

impl InMemoryInstaller {
    /// An installer recording into `snapshot`.
    pub fn new(snapshot: std::sync::Arc<tokio::sync::Mutex<EnvironmentSnapshot>>) -> Self {
        Self {
            snapshot,
            corrupted: BTreeSet::new(),
            fetched_urls: std::sync::Mutex::new(BTreeSet::new()),
        }
    }

    /// Mark a package as serving tampered content.
    pub fn corrupt(&mut self, name: &str) -> &mut Self {
        self.corrupted.insert(PackageName::new(name));
        self
    }

    /// Base URLs install requests named, sorted.
    pub fn fetched_urls(&self) -> Vec<String> {
        self.fetched_urls
            .lock()
            .expect("url log lock")
            .iter()
            .cloned()
            .collect()
    }
}

#[async_trait]
impl Installer for InMemoryInstaller {
    async fn install(&self, request: &InstallRequest) -> Result<(), InstallFailure> {
        self.fetched_urls
            .lock()
            .expect("url log lock")
            .insert(request.index_url.clone());
        let content = if self.corrupted.contains(&request.name) {
            format!("tampered-{}", request.name)
        } else {
            format!("{}-{}", request.name, request.version)
        };
        let actual = ArtifactDigest::of_bytes(content.as_bytes());
        if !request.digests.contains(&actual) {
            return Err(InstallFailure::HashMismatch {
                actual,
                recorded: request.digests.clone(),
            });
        }
        self.snapshot.lock().await.record(
            request.name.clone(),
            request.version.clone(),
            request.location.clone(),
        );
        Ok(())
    }

    async fn installed(&self, name: &PackageName, location: &InstallLocation) -> Option<Version> {
        self.snapshot
            .lock()
            .await
            .installed_version(name, location)
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pinion_schema::lock::{LockMeta, LockRequires, LockedPackage};
    use pinion_schema::Source;
    use std::sync::Arc;
    use tokio::sync::Mutex;

    fn digest_of(name: &str, version: &str) -> ArtifactDigest {
        ArtifactDigest::of_bytes(format!("{name}-{version}").as_bytes())
    }

    fn locked(name: &str, version: &str) -> (PackageName, LockedPackage) {
        (
            PackageName::new(name),
            LockedPackage {
                version: Version::parse(version).unwrap(),
                digests: BTreeSet::from([digest_of(name, version)]),
                index: "pypi".to_string(),
                markers: None,
                extras: Vec::new(),
                dependencies: BTreeMap::new(),
            },
        )
    }

    fn lock_with(default: Vec<(PackageName, LockedPackage)>) -> LockArtifact {
        LockArtifact {
            meta: LockMeta {
                hash: ArtifactDigest::of_bytes(b"manifest"),
                lock_version: pinion_schema::LOCK_VERSION,
                requires: LockRequires::default(),
                sources: vec![Source {
                    name: "pypi".to_string(),
                    url: "https://pypi.org/simple".to_string(),
                    verify_ssl: true,
                }],
            },
            default: default.into_iter().collect(),
            develop: BTreeMap::new(),
        }
    }

    fn env() -> MarkerEnvironment {
        MarkerEnvironment::linux_cpython("3.11")
    }

    #[test]
    fn test_plan_installs_missing_packages() {
        let lock = lock_with(vec![locked("six", "1.12.0"), locked("idna", "3.4")]);
        let plan = plan(
            &lock,
            &EnvironmentSnapshot::new(),
            &[Category::Default],
            None,
            &env(),
            None,
        );
        assert_eq!(plan.len(), 2);
        assert!(plan.actions.iter().all(|a| a.replaces.is_none()));
    }

    #[test]
    fn test_plan_is_idempotent_when_converged() {
        let lock = lock_with(vec![locked("six", "1.12.0")]);
        let mut snapshot = EnvironmentSnapshot::new();
        snapshot.record(
            PackageName::new("six"),
            Version::parse("1.12.0").unwrap(),
            InstallLocation::Default,
        );

        let plan = plan(&lock, &snapshot, &[Category::Default], None, &env(), None);
        assert!(plan.is_empty());
    }

    #[test]
    fn test_plan_replaces_version_drift() {
        let lock = lock_with(vec![locked("six", "1.16.0")]);
        let mut snapshot = EnvironmentSnapshot::new();
        snapshot.record(
            PackageName::new("six"),
            Version::parse("1.12.0").unwrap(),
            InstallLocation::Default,
        );

        let plan = plan(&lock, &snapshot, &[Category::Default], None, &env(), None);
        assert_eq!(plan.len(), 1);
        assert_eq!(
            plan.actions[0].replaces,
            Some(Version::parse("1.12.0").unwrap())
        );
    }

    #[test]
    fn test_plan_never_prunes_extraneous_packages() {
        let lock = lock_with(vec![locked("six", "1.12.0")]);
        let mut snapshot = EnvironmentSnapshot::new();
        snapshot.record(
            PackageName::new("six"),
            Version::parse("1.12.0").unwrap(),
            InstallLocation::Default,
        );
        snapshot.record(
            PackageName::new("leftover"),
            Version::parse("0.1").unwrap(),
            InstallLocation::Default,
        );

        // The extraneous package produces no action of any kind
        let plan = plan(&lock, &snapshot, &[Category::Default], None, &env(), None);
        assert!(plan.is_empty());
    }

    #[test]
    fn test_plan_target_override_scopes_comparison() {
        let lock = lock_with(vec![locked("six", "1.12.0")]);
        let mut snapshot = EnvironmentSnapshot::new();
        // Installed in the default site, but not in the target
        snapshot.record(
            PackageName::new("six"),
            Version::parse("1.12.0").unwrap(),
            InstallLocation::Default,
        );

        let target = PathBuf::from("target_dir");
        let plan = plan(
            &lock,
            &snapshot,
            &[Category::Default],
            Some(&target),
            &env(),
            None,
        );
        assert_eq!(plan.len(), 1);
        assert_eq!(plan.actions[0].location, InstallLocation::Target(target));
    }

    #[test]
    fn test_plan_skips_inactive_markers() {
        let (name, mut package) = locked("pywin32", "306");
        package.markers = Some("sys_platform == 'win32'".to_string());
        let lock = lock_with(vec![(name, package)]);

        let plan = plan(
            &lock,
            &EnvironmentSnapshot::new(),
            &[Category::Default],
            None,
            &env(),
            None,
        );
        assert!(plan.is_empty());
    }

    #[test]
    fn test_plan_never_installs_on_unreadable_marker() {
        let (name, mut package) = locked("pywin32", "306");
        package.markers = Some("sys_platform ==".to_string());
        let lock = lock_with(vec![(name, package)]);

        // Decode rejects such an artifact outright; a hand-built one
        // must still never install on a condition we cannot read
        assert!(LockArtifact::decode(&lock.encode().unwrap()).is_err());

        let plan = plan(
            &lock,
            &EnvironmentSnapshot::new(),
            &[Category::Default],
            None,
            &env(),
            None,
        );
        assert!(plan.is_empty());
    }

    #[tokio::test]
    async fn test_execute_converges_environment() {
        let lock = lock_with(vec![locked("six", "1.12.0"), locked("idna", "3.4")]);
        let snapshot = Arc::new(Mutex::new(EnvironmentSnapshot::new()));
        let installer = InMemoryInstaller::new(Arc::clone(&snapshot));

        let actions = plan(
            &lock,
            &*snapshot.lock().await,
            &[Category::Default],
            None,
            &env(),
            None,
        );
        let report = execute(&actions, &installer, &ExecuteOptions::default())
            .await
            .unwrap();
        assert_eq!(report.installed.len(), 2);

        // Converged: a fresh plan against the updated snapshot is empty
        let after = plan(
            &lock,
            &*snapshot.lock().await,
            &[Category::Default],
            None,
            &env(),
            None,
        );
        assert!(after.is_empty());
    }

    #[tokio::test]
    async fn test_hash_mismatch_reported_as_partial() {
        let lock = lock_with(vec![locked("six", "1.12.0"), locked("idna", "3.4")]);
        let snapshot = Arc::new(Mutex::new(EnvironmentSnapshot::new()));
        let mut installer = InMemoryInstaller::new(Arc::clone(&snapshot));
        installer.corrupt("idna");

        let actions = plan(
            &lock,
            &*snapshot.lock().await,
            &[Category::Default],
            None,
            &env(),
            None,
        );
        let err = execute(&actions, &installer, &ExecuteOptions::default())
            .await
            .unwrap_err();

        let SyncError::Partial { installed, failed } = err;
        assert_eq!(installed.len(), 1);
        assert_eq!(installed[0].name, PackageName::new("six"));
        assert_eq!(failed.len(), 1);
        assert!(matches!(failed[0].failure, InstallFailure::HashMismatch { .. }));

        // No rollback: the successful entry stays installed
        assert_eq!(snapshot.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn test_unrecorded_install_fails_verification() {
        // Acknowledges every install without touching the environment
        struct AckOnlyInstaller {
            snapshot: Arc<Mutex<EnvironmentSnapshot>>,
        }

        #[async_trait]
        impl Installer for AckOnlyInstaller {
            async fn install(&self, _request: &InstallRequest) -> Result<(), InstallFailure> {
                Ok(())
            }

            async fn installed(
                &self,
                name: &PackageName,
                location: &InstallLocation,
            ) -> Option<Version> {
                self.snapshot
                    .lock()
                    .await
                    .installed_version(name, location)
                    .cloned()
            }
        }

        let lock = lock_with(vec![locked("six", "1.12.0")]);
        let snapshot = Arc::new(Mutex::new(EnvironmentSnapshot::new()));
        let installer = AckOnlyInstaller {
            snapshot: Arc::clone(&snapshot),
        };

        let actions = plan(
            &lock,
            &*snapshot.lock().await,
            &[Category::Default],
            None,
            &env(),
            None,
        );
        let err = execute(&actions, &installer, &ExecuteOptions::default())
            .await
            .unwrap_err();
        let SyncError::Partial { installed, failed } = err;
        assert!(installed.is_empty());
        assert!(matches!(
            failed[0].failure,
            InstallFailure::Unverified { found: None }
        ));
    }

    #[tokio::test]
    async fn test_cancelled_execution_is_partial() {
        let lock = lock_with(vec![locked("six", "1.12.0")]);
        let snapshot = Arc::new(Mutex::new(EnvironmentSnapshot::new()));
        let installer = InMemoryInstaller::new(Arc::clone(&snapshot));

        let actions = plan(
            &lock,
            &*snapshot.lock().await,
            &[Category::Default],
            None,
            &env(),
            None,
        );
        let opts = ExecuteOptions::default();
        opts.cancel.cancel();
        let err = execute(&actions, &installer, &opts).await.unwrap_err();
        let SyncError::Partial { installed, failed } = err;
        assert!(installed.is_empty());
        assert!(matches!(failed[0].failure, InstallFailure::Cancelled));
    }

    #[tokio::test]
    async fn test_target_and_default_coexist() {
        let lock = lock_with(vec![locked("six", "1.12.0")]);
        let snapshot = Arc::new(Mutex::new(EnvironmentSnapshot::new()));
        snapshot.lock().await.record(
            PackageName::new("six"),
            Version::parse("1.0.0").unwrap(),
            InstallLocation::Default,
        );
        let installer = InMemoryInstaller::new(Arc::clone(&snapshot));

        let target = PathBuf::from("target_dir");
        let actions = plan(
            &lock,
            &*snapshot.lock().await,
            &[Category::Default],
            Some(&target),
            &env(),
            None,
        );
        execute(&actions, &installer, &ExecuteOptions::default())
            .await
            .unwrap();

        let snap = snapshot.lock().await;
        // Pinned fresh in the target, untouched in the default site
        assert_eq!(
            snap.installed_version(&PackageName::new("six"), &InstallLocation::Target(target)),
            Some(&Version::parse("1.12.0").unwrap())
        );
        assert_eq!(
            snap.installed_version(&PackageName::new("six"), &InstallLocation::Default),
            Some(&Version::parse("1.0.0").unwrap())
        );
    }
}
