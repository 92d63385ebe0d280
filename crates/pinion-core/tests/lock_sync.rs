//! End-to-end lock and sync flows over a project directory.

use std::sync::Arc;

use tempfile::TempDir;
use tokio::sync::Mutex;

use pinion_core::ops::{OpError, Project, SyncOptions, lock_project, sync_project};
use pinion_core::provider::{Dependency, InMemoryProvider};
use pinion_core::resolver::ResolveOptions;
use pinion_core::sync::{EnvironmentSnapshot, InMemoryInstaller, InstallLocation, SyncError};
use pinion_schema::{Category, PackageName, SpecifierSet, Version};

const MANIFEST: &str = r#"
[[source]]
name = "pypi"
url = "https://pypi.org/simple"
verify_ssl = true

[packages]
requests = ">=2.0"

[dev-packages]
pytest = "*"
"#;

/// Test context holding a project directory, an index fake, and a shared
/// environment the installer records into.
struct TestContext {
    _temp_dir: TempDir,
    project: Project,
    provider: InMemoryProvider,
    snapshot: Arc<Mutex<EnvironmentSnapshot>>,
}

impl TestContext {
    async fn new() -> Self {
        // Run with RUST_LOG=pinion_core=debug to see engine traces.
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init()
            .ok();

        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let project = Project::new(temp_dir.path());
        tokio::fs::write(project.manifest_path(), MANIFEST)
            .await
            .expect("failed to write manifest");

        let mut provider = InMemoryProvider::new();
        provider.add_release(
            "requests",
            "2.31.0",
            vec![Dependency::new(
                "idna",
                SpecifierSet::parse(">=2.5").unwrap(),
            )],
        );
        provider.add_release("idna", "2.10", vec![]);
        provider.add_release("idna", "3.4", vec![]);
        provider.add_release("pytest", "7.4.0", vec![]);

        Self {
            _temp_dir: temp_dir,
            project,
            provider,
            snapshot: Arc::new(Mutex::new(EnvironmentSnapshot::new())),
        }
    }

    fn installer(&self) -> InMemoryInstaller {
        InMemoryInstaller::new(Arc::clone(&self.snapshot))
    }

    async fn installed(&self, name: &str, location: &InstallLocation) -> Option<Version> {
        self.snapshot
            .lock()
            .await
            .installed_version(&PackageName::new(name), location)
            .cloned()
    }

    async fn lock_bytes(&self) -> Vec<u8> {
        tokio::fs::read(self.project.lock_path())
            .await
            .expect("lock artifact exists")
    }
}

fn both_categories() -> SyncOptions {
    SyncOptions {
        categories: vec![Category::Default, Category::Develop],
        ..SyncOptions::default()
    }
}

#[tokio::test]
async fn test_lock_then_sync_converges_both_categories() {
    let ctx = TestContext::new().await;
    lock_project(&ctx.project, &ctx.provider, None, &ResolveOptions::default())
        .await
        .unwrap();

    let report = sync_project(
        &ctx.project,
        &EnvironmentSnapshot::new(),
        &ctx.installer(),
        &both_categories(),
    )
    .await
    .unwrap();

    assert_eq!(report.installed.len(), 3);
    let site = InstallLocation::Default;
    assert_eq!(
        ctx.installed("requests", &site).await,
        Some(Version::parse("2.31.0").unwrap())
    );
    assert_eq!(
        ctx.installed("idna", &site).await,
        Some(Version::parse("3.4").unwrap())
    );
    assert_eq!(
        ctx.installed("pytest", &site).await,
        Some(Version::parse("7.4.0").unwrap())
    );
}

#[tokio::test]
async fn test_lock_is_deterministic_across_runs() {
    let a = TestContext::new().await;
    let b = TestContext::new().await;
    let opts = ResolveOptions::default();

    lock_project(&a.project, &a.provider, None, &opts)
        .await
        .unwrap();
    lock_project(&b.project, &b.provider, None, &opts)
        .await
        .unwrap();

    assert_eq!(a.lock_bytes().await, b.lock_bytes().await);
}

#[tokio::test]
async fn test_mirror_lock_matches_public_lock_and_hides_public_url() {
    let public = TestContext::new().await;
    let mirrored = TestContext::new().await;
    let opts = ResolveOptions::default();
    let mirror = "https://mirror.example/simple";

    let public_lock = lock_project(&public.project, &public.provider, None, &opts)
        .await
        .unwrap();
    let mirror_lock = lock_project(&mirrored.project, &mirrored.provider, Some(mirror), &opts)
        .await
        .unwrap();

    // Same pins either way; only the recorded URLs differ.
    for category in [Category::Default, Category::Develop] {
        let public_pins: Vec<_> = public_lock
            .section(category)
            .iter()
            .map(|(name, package)| (name.clone(), package.version.clone()))
            .collect();
        let mirror_pins: Vec<_> = mirror_lock
            .section(category)
            .iter()
            .map(|(name, package)| (name.clone(), package.version.clone()))
            .collect();
        assert_eq!(public_pins, mirror_pins);
    }
    assert!(mirror_lock.meta.sources.iter().all(|s| s.url == mirror));

    // The mirrored run never touched the public index.
    assert_eq!(mirrored.provider.queried_urls(), vec![mirror.to_string()]);

    // And syncing the mirrored lock fetches from the mirror.
    let installer = mirrored.installer();
    sync_project(
        &mirrored.project,
        &EnvironmentSnapshot::new(),
        &installer,
        &both_categories(),
    )
    .await
    .unwrap();
    assert_eq!(installer.fetched_urls(), vec![mirror.to_string()]);
}

#[tokio::test]
async fn test_sync_never_rewrites_the_lock() {
    let ctx = TestContext::new().await;
    lock_project(&ctx.project, &ctx.provider, None, &ResolveOptions::default())
        .await
        .unwrap();
    let before = ctx.lock_bytes().await;

    // The manifest drifts; sync must apply the stored state untouched.
    tokio::fs::write(
        ctx.project.manifest_path(),
        "[packages]\nrequests = \">=2.0\"\nidna = \"<3\"\n",
    )
    .await
    .unwrap();

    let report = sync_project(
        &ctx.project,
        &EnvironmentSnapshot::new(),
        &ctx.installer(),
        &both_categories(),
    )
    .await
    .unwrap();

    assert_eq!(report.installed.len(), 3);
    assert_eq!(ctx.lock_bytes().await, before);
    // The pinned idna, not the drifted manifest's, is what landed.
    assert_eq!(
        ctx.installed("idna", &InstallLocation::Default).await,
        Some(Version::parse("3.4").unwrap())
    );
}

#[tokio::test]
async fn test_second_sync_is_empty() {
    let ctx = TestContext::new().await;
    lock_project(&ctx.project, &ctx.provider, None, &ResolveOptions::default())
        .await
        .unwrap();

    sync_project(
        &ctx.project,
        &EnvironmentSnapshot::new(),
        &ctx.installer(),
        &both_categories(),
    )
    .await
    .unwrap();

    let converged = ctx.snapshot.lock().await.clone();
    let second = ctx.installer();
    let report = sync_project(&ctx.project, &converged, &second, &both_categories())
        .await
        .unwrap();

    assert!(report.installed.is_empty());
    assert!(second.fetched_urls().is_empty());
}

#[tokio::test]
async fn test_sync_without_lock_is_hard_error() {
    let ctx = TestContext::new().await;
    let installer = ctx.installer();

    let err = sync_project(
        &ctx.project,
        &EnvironmentSnapshot::new(),
        &installer,
        &both_categories(),
    )
    .await
    .unwrap_err();

    assert!(matches!(err, OpError::LockNotFound { .. }));
    assert!(ctx.snapshot.lock().await.is_empty());
    assert!(installer.fetched_urls().is_empty());
}

#[tokio::test]
async fn test_target_installs_are_isolated_from_default_site() {
    let ctx = TestContext::new().await;
    lock_project(&ctx.project, &ctx.provider, None, &ResolveOptions::default())
        .await
        .unwrap();

    let target_dir = ctx.project.root().join("vendored");
    let opts = SyncOptions {
        target: Some(target_dir.clone()),
        ..both_categories()
    };
    sync_project(&ctx.project, &EnvironmentSnapshot::new(), &ctx.installer(), &opts)
        .await
        .unwrap();

    let target = InstallLocation::Target(target_dir);
    assert!(ctx.installed("requests", &target).await.is_some());
    assert!(ctx.installed("requests", &InstallLocation::Default).await.is_none());

    // A later default-site sync still sees an empty site and installs
    // there too; records coexist.
    let current = ctx.snapshot.lock().await.clone();
    sync_project(&ctx.project, &current, &ctx.installer(), &both_categories())
        .await
        .unwrap();
    assert!(ctx.installed("requests", &InstallLocation::Default).await.is_some());
    assert!(ctx.installed("requests", &target).await.is_some());
}

#[tokio::test]
async fn test_hash_mismatch_fails_that_entry_only() {
    let ctx = TestContext::new().await;
    lock_project(&ctx.project, &ctx.provider, None, &ResolveOptions::default())
        .await
        .unwrap();

    let mut installer = ctx.installer();
    installer.corrupt("idna");

    let err = sync_project(
        &ctx.project,
        &EnvironmentSnapshot::new(),
        &installer,
        &both_categories(),
    )
    .await
    .unwrap_err();

    match err {
        OpError::Sync(SyncError::Partial { installed, failed }) => {
            assert_eq!(failed.len(), 1);
            assert_eq!(failed[0].action.name, PackageName::new("idna"));
            assert_eq!(installed.len(), 2);
        }
        other => panic!("expected partial sync, got {other:?}"),
    }

    // Converged entries stay; the corrupted one never landed.
    let site = InstallLocation::Default;
    assert!(ctx.installed("requests", &site).await.is_some());
    assert!(ctx.installed("idna", &site).await.is_none());

    // Re-running with a healthy artifact is the recovery path.
    let current = ctx.snapshot.lock().await.clone();
    sync_project(&ctx.project, &current, &ctx.installer(), &both_categories())
        .await
        .unwrap();
    assert!(ctx.installed("idna", &site).await.is_some());
}
