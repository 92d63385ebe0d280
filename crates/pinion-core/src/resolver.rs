//! The constraint solver.
//!
//! Turns one category of abstract manifest requirements into a fully
//! pinned [`ResolvedGraph`]. The search is an explicit worklist plus
//! per-decision state snapshots: selecting a candidate version records a
//! restore point, and an unsatisfiable constraint merge discards the most
//! recent decision with untried candidates and resumes from its snapshot.
//! The solver itself is sequential and deterministic; only metadata
//! retrieval fans out (read-only, consumed in fixed order), so resolving
//! the same manifest against the same provider twice yields byte-identical
//! graphs.

use crate::provider::{Dependency, MetadataProvider, ProviderError};
use futures::StreamExt;
use pinion_schema::graph::GraphError;
use pinion_schema::marker::MarkerKey;
use pinion_schema::{
    ArtifactDigest, Category, Manifest, MarkerEnvironment, MarkerExpr, PackageName, ResolvedEdge,
    ResolvedGraph, ResolvedNode, Source, SourceRegistry, SpecifierSet, Version,
};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// How many digest retrievals run in flight at once.
const DIGEST_CONCURRENCY: usize = 8;

/// One link in a conflict diagnosis: who required what.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictCause {
    /// The package the constraint applies to.
    pub name: PackageName,
    /// The requirement that introduced the constraint; `None` for a
    /// manifest-declared root.
    pub required_by: Option<PackageName>,
    /// The constraint itself.
    pub specifier: SpecifierSet,
}

impl std::fmt::Display for ConflictCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.required_by {
            Some(parent) => write!(f, "{} {} (required by {parent})", self.name, self.specifier),
            None => write!(f, "{} {} (from manifest)", self.name, self.specifier),
        }
    }
}

/// Error produced by resolution.
#[derive(Error, Debug)]
pub enum ResolveError {
    /// The constraint set is unsatisfiable; the chain lists the
    /// requirements that produced the contradiction.
    #[error("unable to resolve '{name}': conflicting requirements:\n{}",
        chain.iter().map(|c| format!("  {c}")).collect::<Vec<_>>().join("\n"))]
    Conflict {
        /// The package the search exhausted candidates for.
        name: PackageName,
        /// Provenance of every constraint on it.
        chain: Vec<ConflictCause>,
    },
    /// A chosen release exposes no artifact digests; the lock format's
    /// integrity guarantee depends on hash presence.
    #[error("no artifact hashes available for '{name}' {version}")]
    HashUnavailable {
        /// The offending package.
        name: PackageName,
        /// Its chosen version.
        version: Version,
    },
    /// Terminal metadata retrieval failure (retries exhausted at the
    /// capability boundary).
    #[error("metadata unavailable: {0}")]
    Metadata(#[from] ProviderError),
    /// Caller-initiated abort.
    #[error("resolution cancelled")]
    Cancelled,
    /// The assembled graph failed structural validation.
    #[error(transparent)]
    Graph(#[from] GraphError),
}

/// Caller-tunable resolution inputs.
#[derive(Debug, Clone)]
pub struct ResolveOptions {
    /// Target interpreter/platform attributes for marker evaluation.
    pub environment: MarkerEnvironment,
    /// Cooperative cancellation; checked at every solver step.
    pub cancel: CancellationToken,
}

impl Default for ResolveOptions {
    fn default() -> Self {
        Self {
            environment: MarkerEnvironment::linux_cpython("3.11"),
            cancel: CancellationToken::new(),
        }
    }
}

/// Accumulated constraint state for one package.
#[derive(Debug, Clone, Default)]
struct Constraint {
    specifier: SpecifierSet,
    /// Every requirement that contributed to the constraint, for
    /// conflict diagnosis.
    provenance: Vec<(Option<PackageName>, SpecifierSet)>,
    /// Extras activated across all requirers, sorted.
    extras: BTreeSet<String>,
    /// Explicit index pin from the manifest, if any.
    source_pin: Option<String>,
    /// Marker from the manifest requirement, preserved on the node.
    root_marker: Option<MarkerExpr>,
}

/// A tentative selection for one package.
#[derive(Debug, Clone)]
struct Chosen {
    version: Version,
    source: String,
    /// Active dependency edges of the selected release.
    edges: Vec<ResolvedEdge>,
}

/// One selectable release: a version together with the source offering it.
#[derive(Debug, Clone)]
struct Candidate {
    version: Version,
    source: String,
}

/// A restore point: the solver state as it was before one candidate was
/// selected, plus the candidates not yet tried.
#[derive(Debug)]
struct Decision {
    name: PackageName,
    remaining: Vec<Candidate>,
    table: BTreeMap<PackageName, Constraint>,
    chosen: BTreeMap<PackageName, Chosen>,
    frontier: BTreeSet<PackageName>,
}

/// Cached, immutable index facts. Lives outside the snapshots: metadata
/// never changes within one resolution, so backtracking keeps it.
#[derive(Debug, Default)]
struct MetadataCache {
    versions: HashMap<(String, PackageName), Result<Vec<Version>, ProviderError>>,
    dependencies: HashMap<(String, PackageName, Version), Vec<Dependency>>,
}

/// Resolve one category of a manifest into a pinned graph.
///
/// # Errors
///
/// Returns [`ResolveError`] on an unsatisfiable constraint set, a release
/// with no retrievable hashes, terminal metadata failure, or cancellation.
pub async fn resolve(
    manifest: &Manifest,
    registry: &SourceRegistry,
    provider: &dyn MetadataProvider,
    category: Category,
    opts: &ResolveOptions,
) -> Result<ResolvedGraph, ResolveError> {
    let mut solver = Solver {
        registry,
        provider,
        env: &opts.environment,
        cancel: &opts.cancel,
        cache: MetadataCache::default(),
        table: BTreeMap::new(),
        chosen: BTreeMap::new(),
        frontier: BTreeSet::new(),
        trail: Vec::new(),
    };

    let mut roots = Vec::new();
    for requirement in manifest.requirements(category) {
        // Marker-gated requirements inactive on this target are dropped
        // up front; active ones keep their marker text on the node.
        if let Some(marker) = &requirement.marker {
            if !marker.evaluate(&opts.environment) {
                tracing::debug!(package = %requirement.name, marker = %marker,
                    "requirement inactive for target environment");
                continue;
            }
        }
        roots.push(requirement.name.clone());
        let constraint = solver.table.entry(requirement.name.clone()).or_default();
        constraint.specifier = constraint.specifier.intersect(&requirement.specifier);
        constraint
            .provenance
            .push((None, requirement.specifier.clone()));
        constraint.extras.extend(requirement.extras.iter().cloned());
        constraint.source_pin.clone_from(&requirement.source);
        constraint.root_marker.clone_from(&requirement.marker);
        solver.frontier.insert(requirement.name.clone());
    }

    solver.run().await?;

    let graph = solver.assemble(provider, &opts.cancel).await?;
    graph.validate(&roots)?;
    Ok(graph)
}

struct Solver<'a> {
    registry: &'a SourceRegistry,
    provider: &'a dyn MetadataProvider,
    env: &'a MarkerEnvironment,
    cancel: &'a CancellationToken,
    cache: MetadataCache,
    table: BTreeMap<PackageName, Constraint>,
    chosen: BTreeMap<PackageName, Chosen>,
    /// Packages with constraints but no verified selection yet. Ordered,
    /// so the next package to process is always deterministic.
    frontier: BTreeSet<PackageName>,
    trail: Vec<Decision>,
}

impl Solver<'_> {
    async fn run(&mut self) -> Result<(), ResolveError> {
        loop {
            if self.cancel.is_cancelled() {
                return Err(ResolveError::Cancelled);
            }

            self.prefetch_frontier().await?;

            let Some(name) = self.frontier.iter().next().cloned() else {
                return Ok(());
            };
            self.frontier.remove(&name);

            // Re-reached package: the merged constraint may have grown
            // since selection. A still-satisfied pin stands; otherwise
            // the selection is contradicted and we backtrack.
            if let Some(existing) = self.chosen.get(&name) {
                let constraint = &self.table[&name].specifier;
                if constraint.matches(&existing.version) {
                    continue;
                }
                tracing::debug!(package = %name, version = %existing.version,
                    "pinned version contradicted by merged constraint, backtracking");
                let retry = self.backtrack(&name)?;
                self.select(&retry.0, retry.1, retry.2).await?;
                continue;
            }

            let mut candidates = self.candidates(&name).await?;
            if candidates.is_empty() {
                let retry = self.backtrack(&name)?;
                self.select(&retry.0, retry.1, retry.2).await?;
                continue;
            }

            let chosen = candidates.remove(0);
            self.select(&name, chosen, candidates).await?;
        }
    }

    /// Issue version queries for every frontier package concurrently.
    /// Results land in the cache; the solver consumes them in its own
    /// fixed order, so arrival order never affects the outcome.
    async fn prefetch_frontier(&mut self) -> Result<(), ResolveError> {
        let mut wanted = Vec::new();
        for name in &self.frontier {
            if self.chosen.contains_key(name) {
                continue;
            }
            for source in self.sources_for(name) {
                let key = (source.name.clone(), name.clone());
                if !self.cache.versions.contains_key(&key) {
                    wanted.push((key, source.clone()));
                }
            }
        }
        if wanted.is_empty() {
            return Ok(());
        }

        let provider = self.provider;
        let fetched: Vec<_> = futures::stream::iter(wanted.into_iter().map(
            |((source_name, name), source)| async move {
                let result = provider.versions(&source, &name).await;
                ((source_name, name), result)
            },
        ))
        .buffer_unordered(DIGEST_CONCURRENCY)
        .collect()
        .await;

        if self.cancel.is_cancelled() {
            return Err(ResolveError::Cancelled);
        }
        for (key, result) in fetched {
            self.cache.versions.insert(key, result);
        }
        Ok(())
    }

    /// The sources a package's metadata may come from: its explicit pin
    /// alone when one is declared, otherwise every registry source in
    /// order.
    fn sources_for(&self, name: &PackageName) -> Vec<&Source> {
        if let Some(pin) = self.table.get(name).and_then(|c| c.source_pin.as_deref()) {
            if let Some(source) = self.registry.find(pin) {
                return vec![source];
            }
        }
        self.registry.iter().collect()
    }

    /// Candidate releases for a package, merged across every consulted
    /// source and filtered by the accumulated constraint, highest version
    /// first. A version offered by several sources collapses onto the
    /// earliest source in registry order (spellings like 1.2 and 1.2.0
    /// compare equal and collapse too), so a compatible release on a
    /// later source is reachable even when earlier sources only carry
    /// incompatible ones.
    async fn candidates(&mut self, name: &PackageName) -> Result<Vec<Candidate>, ResolveError> {
        let sources: Vec<Source> = self.sources_for(name).into_iter().cloned().collect();
        let constraint = self.table[name].specifier.clone();

        let mut merged: Vec<Candidate> = Vec::new();
        for source in sources {
            let key = (source.name.clone(), name.clone());
            if !self.cache.versions.contains_key(&key) {
                let result = self.provider.versions(&source, name).await;
                self.cache.versions.insert(key.clone(), result);
            }
            match &self.cache.versions[&key] {
                Ok(versions) => {
                    for version in versions {
                        if !constraint.matches(version) {
                            continue;
                        }
                        if version.is_prerelease() && !constraint.allows_prerelease() {
                            continue;
                        }
                        if merged
                            .iter()
                            .any(|c| c.version.cmp(version) == Ordering::Equal)
                        {
                            continue;
                        }
                        merged.push(Candidate {
                            version: version.clone(),
                            source: source.name.clone(),
                        });
                    }
                }
                // A source not knowing the package is not an error;
                // zero candidates overall is a dead end for the caller.
                Err(ProviderError::NotFound(_)) => {}
                Err(e) => return Err(ResolveError::Metadata(e.clone())),
            }
        }
        merged.sort_by(|a, b| b.version.cmp(&a.version));
        Ok(merged)
    }

    /// Tentatively select `version` for `name`: record a restore point,
    /// expand the release's dependencies, and merge their constraints.
    async fn select(
        &mut self,
        name: &PackageName,
        candidate: Candidate,
        remaining: Vec<Candidate>,
    ) -> Result<(), ResolveError> {
        self.trail.push(Decision {
            name: name.clone(),
            remaining,
            table: self.table.clone(),
            chosen: self.chosen.clone(),
            frontier: self.frontier.clone(),
        });

        let Candidate { version, source } = candidate;
        tracing::debug!(package = %name, version = %version, source = %source,
            "selecting candidate");

        let dependencies = self.dependencies_of(name, &version, &source).await?;
        let extras = self.table[name].extras.clone();

        let mut edges = Vec::new();
        for dependency in dependencies {
            if !self.dependency_active(&dependency, &extras) {
                continue;
            }
            edges.push(ResolvedEdge {
                target: dependency.name.clone(),
                specifier: dependency.specifier.clone(),
                marker: dependency.marker.clone(),
            });

            let constraint = self.table.entry(dependency.name.clone()).or_default();
            constraint.specifier = constraint.specifier.intersect(&dependency.specifier);
            constraint
                .provenance
                .push((Some(name.clone()), dependency.specifier.clone()));
            constraint.extras.extend(dependency.extras.iter().cloned());
            // Frontier re-insertion covers both fresh packages and chosen
            // ones whose constraint just grew; the run loop re-verifies.
            self.frontier.insert(dependency.name.clone());
        }

        self.chosen.insert(
            name.clone(),
            Chosen {
                version,
                source,
                edges,
            },
        );
        Ok(())
    }

    async fn dependencies_of(
        &mut self,
        name: &PackageName,
        version: &Version,
        source_name: &str,
    ) -> Result<Vec<Dependency>, ResolveError> {
        let key = (source_name.to_string(), name.clone(), version.clone());
        if let Some(cached) = self.cache.dependencies.get(&key) {
            return Ok(cached.clone());
        }
        let source = self
            .registry
            .find(source_name)
            .cloned()
            .unwrap_or_else(|| self.registry.default_source().clone());
        let dependencies = self.provider.dependencies(&source, name, version).await?;
        self.cache.dependencies.insert(key, dependencies.clone());
        Ok(dependencies)
    }

    /// Whether a dependency declaration applies: unconditionally, under
    /// the base environment, or under any activated extra.
    fn dependency_active(&self, dependency: &Dependency, extras: &BTreeSet<String>) -> bool {
        let Some(marker) = &dependency.marker else {
            return true;
        };
        if marker.evaluate(self.env) {
            return true;
        }
        extras.iter().any(|extra| {
            let mut env = self.env.clone();
            env.set(MarkerKey::Extra, extra.clone());
            marker.evaluate(&env)
        })
    }

    /// Discard decisions until one has an untried candidate, restore its
    /// snapshot, and hand back the next candidate to select. An empty
    /// trail means the search is exhausted and the conflict (with the
    /// provenance chain captured at the failure point) propagates.
    fn backtrack(
        &mut self,
        failed: &PackageName,
    ) -> Result<(PackageName, Candidate, Vec<Candidate>), ResolveError> {
        let chain = self.conflict_chain(failed);

        while let Some(mut decision) = self.trail.pop() {
            if decision.remaining.is_empty() {
                tracing::debug!(package = %decision.name, "candidates exhausted, unwinding");
                continue;
            }

            // The frame holds the state as it was before this package was
            // selected; restoring it undoes every later decision too.
            self.table = decision.table;
            self.chosen = decision.chosen;
            self.frontier = decision.frontier;

            let candidate = decision.remaining.remove(0);
            tracing::debug!(package = %decision.name, version = %candidate.version,
                source = %candidate.source, "retrying next candidate");
            return Ok((decision.name, candidate, decision.remaining));
        }

        Err(ResolveError::Conflict {
            name: failed.clone(),
            chain,
        })
    }

    fn conflict_chain(&self, failed: &PackageName) -> Vec<ConflictCause> {
        self.table.get(failed).map_or_else(Vec::new, |constraint| {
            constraint
                .provenance
                .iter()
                .map(|(required_by, specifier)| ConflictCause {
                    name: failed.clone(),
                    required_by: required_by.clone(),
                    specifier: specifier.clone(),
                })
                .collect()
        })
    }

    /// Fetch digests for every chosen package (bounded parallel fan-out)
    /// and assemble the final graph in deterministic name order.
    async fn assemble(
        &self,
        provider: &dyn MetadataProvider,
        cancel: &CancellationToken,
    ) -> Result<ResolvedGraph, ResolveError> {
        let fetches = self.chosen.iter().map(|(name, chosen)| {
            let source = self
                .registry
                .find(&chosen.source)
                .cloned()
                .unwrap_or_else(|| self.registry.default_source().clone());
            let name = name.clone();
            let version = chosen.version.clone();
            async move {
                let digests = provider.digests(&source, &name, &version).await;
                (name, version, digests)
            }
        });

        let collected: Vec<(PackageName, Version, Result<Vec<ArtifactDigest>, ProviderError>)> =
            tokio::select! {
                results = futures::stream::iter(fetches)
                    .buffer_unordered(DIGEST_CONCURRENCY)
                    .collect::<Vec<_>>() => results,
                () = cancel.cancelled() => return Err(ResolveError::Cancelled),
            };

        let mut digest_map: BTreeMap<PackageName, BTreeSet<ArtifactDigest>> = BTreeMap::new();
        for (name, version, result) in collected {
            let digests = result?;
            if digests.is_empty() {
                return Err(ResolveError::HashUnavailable { name, version });
            }
            digest_map.insert(name, digests.into_iter().collect());
        }

        let mut graph = ResolvedGraph::default();
        for (name, chosen) in &self.chosen {
            let constraint = &self.table[name];
            graph.nodes.insert(
                name.clone(),
                ResolvedNode {
                    name: name.clone(),
                    version: chosen.version.clone(),
                    digests: digest_map.remove(name).unwrap_or_default(),
                    source: chosen.source.clone(),
                    marker: constraint.root_marker.clone(),
                    extras: constraint.extras.iter().cloned().collect(),
                },
            );
            if !chosen.edges.is_empty() {
                graph.edges.insert(name.clone(), chosen.edges.clone());
            }
        }
        Ok(graph)
    }
}
