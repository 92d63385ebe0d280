//! The metadata capability boundary.
//!
//! Resolution never talks to an index directly; it goes through
//! [`MetadataProvider`], an injected trait. Production code uses the
//! HTTP-backed provider in [`crate::index`]; tests use
//! [`InMemoryProvider`], a deterministic fake.

use async_trait::async_trait;
use pinion_schema::{ArtifactDigest, MarkerExpr, PackageName, Source, SpecifierSet, Version};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;
use thiserror::Error;

/// Error produced by a metadata provider.
#[derive(Error, Debug, Clone)]
pub enum ProviderError {
    /// The package does not exist on the queried source.
    #[error("package '{0}' not found on source")]
    NotFound(PackageName),
    /// Transient retrieval failure; eligible for bounded retry at the
    /// capability boundary, never inside the solver.
    #[error("index unavailable: {0}")]
    Unavailable(String),
    /// The index answered with something we cannot interpret.
    #[error("malformed index response: {0}")]
    Malformed(String),
}

/// One dependency declaration attached to a release.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dependency {
    /// Normalized target package name.
    pub name: PackageName,
    /// Declared version constraint.
    pub specifier: SpecifierSet,
    /// Marker gating the declaration; extras-conditioned dependencies
    /// carry an `extra == '...'` comparison here.
    pub marker: Option<MarkerExpr>,
    /// Extras the declaration activates on its target.
    pub extras: Vec<String>,
}

impl Dependency {
    /// An unconditional dependency.
    pub fn new(name: impl Into<PackageName>, specifier: SpecifierSet) -> Self {
        Self {
            name: name.into(),
            specifier,
            marker: None,
            extras: Vec::new(),
        }
    }

    /// Parse a requirement line as indexes publish them:
    /// `name[extra1,extra2]>=1.0,<2.0 ; python_version >= '3.8'`.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::Malformed`] when the name, extras,
    /// specifier, or marker portion cannot be parsed.
    pub fn parse_line(line: &str) -> Result<Self, ProviderError> {
        let malformed = |why: &str| ProviderError::Malformed(format!("'{line}': {why}"));

        let (requirement, marker_text) = match line.split_once(';') {
            Some((req, marker)) => (req.trim(), Some(marker.trim())),
            None => (line.trim(), None),
        };
        if requirement.is_empty() {
            return Err(malformed("empty requirement"));
        }

        let name_end = requirement
            .find(|c: char| !(c.is_alphanumeric() || matches!(c, '-' | '_' | '.')))
            .unwrap_or(requirement.len());
        let (name_part, mut rest) = requirement.split_at(name_end);
        if name_part.is_empty() {
            return Err(malformed("missing package name"));
        }

        let mut extras = Vec::new();
        rest = rest.trim_start();
        if let Some(after) = rest.strip_prefix('[') {
            let close = after.find(']').ok_or_else(|| malformed("unterminated extras"))?;
            extras = after[..close]
                .split(',')
                .map(|e| e.trim().to_string())
                .filter(|e| !e.is_empty())
                .collect();
            extras.sort();
            rest = after[close + 1..].trim_start();
        }

        let specifier = SpecifierSet::parse(rest)
            .map_err(|e| malformed(&e.to_string()))?;
        let marker = marker_text
            .map(MarkerExpr::parse)
            .transpose()
            .map_err(|e| malformed(&e.to_string()))?;

        Ok(Self {
            name: PackageName::new(name_part),
            specifier,
            marker,
            extras,
        })
    }
}

/// Capability interface over package indexes.
///
/// All methods are read-only and side-effect-free, so callers may issue
/// them concurrently for independent packages; the resolver still
/// consumes results in its own fixed order.
#[async_trait]
pub trait MetadataProvider: Send + Sync {
    /// Available versions of `name` on `source`, unordered.
    async fn versions(
        &self,
        source: &Source,
        name: &PackageName,
    ) -> Result<Vec<Version>, ProviderError>;

    /// Dependency declarations of one release, including
    /// extras-conditioned entries (gated by `extra == '...'` markers).
    async fn dependencies(
        &self,
        source: &Source,
        name: &PackageName,
        version: &Version,
    ) -> Result<Vec<Dependency>, ProviderError>;

    /// Content digests of every distributable artifact form of one
    /// release. An empty result fails the resolution of that node.
    async fn digests(
        &self,
        source: &Source,
        name: &PackageName,
        version: &Version,
    ) -> Result<Vec<ArtifactDigest>, ProviderError>;
}

/// Release metadata held by [`InMemoryProvider`].
#[derive(Debug, Clone, Default)]
struct Release {
    dependencies: Vec<Dependency>,
    digests: Vec<ArtifactDigest>,
}

/// Deterministic in-memory provider for tests.
///
/// Serves identical content for every source URL (mirror content parity)
/// while recording which URLs were queried, so tests can assert that a
/// mirror override actually redirected traffic. Packages can be scoped
/// to a subset of source names to exercise source-order tie-breaking, and
/// individual releases can be scoped too, so different sources carry
/// divergent version sets.
#[derive(Debug, Default)]
pub struct InMemoryProvider {
    packages: BTreeMap<PackageName, BTreeMap<Version, Release>>,
    /// Package -> source names it is visible on; absent means all.
    visibility: BTreeMap<PackageName, BTreeSet<String>>,
    /// Release -> source names it is offered on; absent means all.
    release_visibility: BTreeMap<(PackageName, Version), BTreeSet<String>>,
    queried_urls: Mutex<BTreeSet<String>>,
}

impl InMemoryProvider {
    /// An empty provider.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a release with dependencies and a synthesized digest.
    pub fn add_release(
        &mut self,
        name: &str,
        version: &str,
        dependencies: Vec<Dependency>,
    ) -> &mut Self {
        let digest = ArtifactDigest::of_bytes(format!("{name}-{version}").as_bytes());
        self.add_release_with_digests(name, version, dependencies, vec![digest])
    }

    /// Add a release with explicit digests (possibly none).
    pub fn add_release_with_digests(
        &mut self,
        name: &str,
        version: &str,
        dependencies: Vec<Dependency>,
        digests: Vec<ArtifactDigest>,
    ) -> &mut Self {
        let version = Version::parse(version).expect("test version parses");
        self.packages
            .entry(PackageName::new(name))
            .or_default()
            .insert(
                version,
                Release {
                    dependencies,
                    digests,
                },
            );
        self
    }

    /// Restrict a package to the named sources only.
    pub fn restrict_to_sources(&mut self, name: &str, sources: &[&str]) -> &mut Self {
        self.visibility.insert(
            PackageName::new(name),
            sources.iter().map(|s| (*s).to_string()).collect(),
        );
        self
    }

    /// Restrict one release to the named sources only.
    pub fn restrict_version_to_sources(
        &mut self,
        name: &str,
        version: &str,
        sources: &[&str],
    ) -> &mut Self {
        let version = Version::parse(version).expect("test version parses");
        self.release_visibility.insert(
            (PackageName::new(name), version),
            sources.iter().map(|s| (*s).to_string()).collect(),
        );
        self
    }

    fn release_visible(&self, name: &PackageName, version: &Version, source: &str) -> bool {
        self.release_visibility
            .get(&(name.clone(), version.clone()))
            .is_none_or(|visible| visible.contains(source))
    }

    /// URLs this provider has been queried on, sorted.
    pub fn queried_urls(&self) -> Vec<String> {
        self.queried_urls
            .lock()
            .expect("url log lock")
            .iter()
            .cloned()
            .collect()
    }

    fn lookup(
        &self,
        source: &Source,
        name: &PackageName,
    ) -> Result<&BTreeMap<Version, Release>, ProviderError> {
        self.queried_urls
            .lock()
            .expect("url log lock")
            .insert(source.url.clone());
        if let Some(visible_on) = self.visibility.get(name) {
            if !visible_on.contains(&source.name) {
                return Err(ProviderError::NotFound(name.clone()));
            }
        }
        self.packages
            .get(name)
            .ok_or_else(|| ProviderError::NotFound(name.clone()))
    }
}

#[async_trait]
impl MetadataProvider for InMemoryProvider {
    async fn versions(
        &self,
        source: &Source,
        name: &PackageName,
    ) -> Result<Vec<Version>, ProviderError> {
        Ok(self
            .lookup(source, name)?
            .keys()
            .filter(|v| self.release_visible(name, v, &source.name))
            .cloned()
            .collect())
    }

    async fn dependencies(
        &self,
        source: &Source,
        name: &PackageName,
        version: &Version,
    ) -> Result<Vec<Dependency>, ProviderError> {
        let releases = self.lookup(source, name)?;
        releases
            .get(version)
            .filter(|_| self.release_visible(name, version, &source.name))
            .map(|r| r.dependencies.clone())
            .ok_or_else(|| ProviderError::NotFound(name.clone()))
    }

    async fn digests(
        &self,
        source: &Source,
        name: &PackageName,
        version: &Version,
    ) -> Result<Vec<ArtifactDigest>, ProviderError> {
        let releases = self.lookup(source, name)?;
        releases
            .get(version)
            .filter(|_| self.release_visible(name, version, &source.name))
            .map(|r| r.digests.clone())
            .ok_or_else(|| ProviderError::NotFound(name.clone()))
    }
}
