//! The lock artifact and its codec.
//!
//! A lock artifact is the frozen, fully pinned, hash-verified output of
//! resolution: a `_meta` block (schema version, manifest fingerprint,
//! interpreter requirement, sources) plus the default and development
//! graphs. It is machine-written JSON with fully stable key order, so
//! identical graphs encode byte-identically.
//!
//! Decoding validates structure and integrity but never compares the
//! embedded fingerprint against a live manifest; staleness is an advisory
//! concern for the caller. Sync consumes a decoded lock as an immutable
//! source of truth.

use crate::graph::{ResolvedEdge, ResolvedGraph, ResolvedNode};
use crate::hash::ArtifactDigest;
use crate::manifest::Category;
use crate::marker::MarkerExpr;
use crate::name::PackageName;
use crate::source::Source;
use crate::specifier::SpecifierSet;
use crate::version::Version;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

/// Error produced while decoding or validating a lock artifact.
#[derive(Error, Debug)]
pub enum LockError {
    /// The bytes are not the JSON shape we expect.
    #[error("corrupt lock artifact: {0}")]
    Corrupt(#[from] serde_json::Error),
    /// The artifact was written by a schema we do not know.
    #[error("unknown lock version {0} (this build understands {current})", current = crate::LOCK_VERSION)]
    UnknownVersion(u32),
    /// A locked package carries no digests.
    #[error("corrupt lock artifact: '{name}' {version} has no digests")]
    MissingDigests {
        /// The offending package.
        name: PackageName,
        /// Its locked version.
        version: Version,
    },
    /// A dependency edge targets a package missing from its section.
    #[error("corrupt lock artifact: '{from}' depends on '{to}' which is not in the {section} section")]
    DanglingEdge {
        /// Source of the edge.
        from: PackageName,
        /// Missing target.
        to: PackageName,
        /// Which section the edge lives in.
        section: Category,
    },
    /// A locked version violates the specifier on an edge pointing at it.
    #[error("corrupt lock artifact: '{to}' locked at {version} does not satisfy '{specifier}' from '{from}'")]
    EdgeUnsatisfied {
        /// Source of the edge.
        from: PackageName,
        /// Target of the edge.
        to: PackageName,
        /// The locked version.
        version: Version,
        /// The violated constraint.
        specifier: SpecifierSet,
    },
    /// A stored marker string no longer parses.
    #[error("corrupt lock artifact: bad marker on '{name}': {source}")]
    BadMarker {
        /// The offending package.
        name: PackageName,
        /// Parse failure detail.
        source: crate::marker::MarkerError,
    },
}

/// The `_meta` block of a lock artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockMeta {
    /// Fingerprint of the manifest this lock was produced from.
    pub hash: ArtifactDigest,
    /// Lock schema version.
    #[serde(rename = "lock-version")]
    pub lock_version: u32,
    /// Interpreter requirement carried over from the manifest.
    pub requires: LockRequires,
    /// The sources the resolution consulted, in order.
    pub sources: Vec<Source>,
}

/// Interpreter requirement inside `_meta`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LockRequires {
    /// `python_version` constraint, if the manifest declared one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub python_version: Option<String>,
}

/// One dependency edge as persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockedDependency {
    /// The specifier the edge was declared with.
    pub specifier: SpecifierSet,
    /// Marker gating the edge, verbatim.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub markers: Option<String>,
}

/// One pinned package as persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockedPackage {
    /// The exact locked version.
    pub version: Version,
    /// Ordered digest set, one per artifact form.
    pub digests: BTreeSet<ArtifactDigest>,
    /// Name of the source the pin came from.
    pub index: String,
    /// Marker under which the package applies, verbatim.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub markers: Option<String>,
    /// Extras activated on this package.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extras: Vec<String>,
    /// Outgoing dependency edges.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub dependencies: BTreeMap<PackageName, LockedDependency>,
}

/// A decoded lock artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockArtifact {
    /// Metadata block.
    #[serde(rename = "_meta")]
    pub meta: LockMeta,
    /// The runtime graph.
    pub default: BTreeMap<PackageName, LockedPackage>,
    /// The development graph.
    pub develop: BTreeMap<PackageName, LockedPackage>,
}

impl LockArtifact {
    /// Assemble a lock artifact from resolved graphs.
    pub fn from_graphs(
        fingerprint: ArtifactDigest,
        python_version: Option<String>,
        sources: Vec<Source>,
        default: &ResolvedGraph,
        develop: &ResolvedGraph,
    ) -> Self {
        Self {
            meta: LockMeta {
                hash: fingerprint,
                lock_version: crate::LOCK_VERSION,
                requires: LockRequires { python_version },
                sources,
            },
            default: section_from_graph(default),
            develop: section_from_graph(develop),
        }
    }

    /// Encode to the persisted byte form.
    ///
    /// Key order is fully stable (`BTreeMap` sections, fixed field order),
    /// so encoding the same artifact twice is byte-identical.
    ///
    /// # Errors
    ///
    /// Serialization of a well-formed artifact does not fail in practice;
    /// any error is surfaced as [`LockError::Corrupt`].
    pub fn encode(&self) -> Result<Vec<u8>, LockError> {
        let mut bytes = serde_json::to_vec_pretty(self)?;
        bytes.push(b'\n');
        Ok(bytes)
    }

    /// Decode and validate a persisted lock artifact.
    ///
    /// Validates: known schema version, at least one digest per package,
    /// all dependency edges land inside their own section, every locked
    /// version satisfies the specifiers on edges pointing at it, and every
    /// stored marker parses. The embedded fingerprint is NOT compared
    /// against any manifest.
    ///
    /// # Errors
    ///
    /// Returns [`LockError`] describing the first violation found.
    pub fn decode(bytes: &[u8]) -> Result<Self, LockError> {
        let artifact: Self = serde_json::from_slice(bytes)?;

        if artifact.meta.lock_version != crate::LOCK_VERSION {
            return Err(LockError::UnknownVersion(artifact.meta.lock_version));
        }

        for (category, section) in [
            (Category::Default, &artifact.default),
            (Category::Develop, &artifact.develop),
        ] {
            validate_section(section, category)?;
        }

        Ok(artifact)
    }

    /// The persisted section for one category.
    pub fn section(&self, category: Category) -> &BTreeMap<PackageName, LockedPackage> {
        match category {
            Category::Default => &self.default,
            Category::Develop => &self.develop,
        }
    }

    /// Rebuild the resolved graph for one category.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::BadMarker`] if a stored marker fails to parse.
    pub fn graph(&self, category: Category) -> Result<ResolvedGraph, LockError> {
        let mut graph = ResolvedGraph::default();
        for (name, package) in self.section(category) {
            let marker = parse_marker(name, package.markers.as_deref())?;
            graph.nodes.insert(
                name.clone(),
                ResolvedNode {
                    name: name.clone(),
                    version: package.version.clone(),
                    digests: package.digests.clone(),
                    source: package.index.clone(),
                    marker,
                    extras: package.extras.clone(),
                },
            );
            let mut edges = Vec::new();
            for (target, dependency) in &package.dependencies {
                let marker = parse_marker(name, dependency.markers.as_deref())?;
                edges.push(ResolvedEdge {
                    target: target.clone(),
                    specifier: dependency.specifier.clone(),
                    marker,
                });
            }
            if !edges.is_empty() {
                graph.edges.insert(name.clone(), edges);
            }
        }
        Ok(graph)
    }
}

fn parse_marker(
    name: &PackageName,
    text: Option<&str>,
) -> Result<Option<MarkerExpr>, LockError> {
    text.map(MarkerExpr::parse)
        .transpose()
        .map_err(|source| LockError::BadMarker {
            name: name.clone(),
            source,
        })
}

fn section_from_graph(graph: &ResolvedGraph) -> BTreeMap<PackageName, LockedPackage> {
    let mut section = BTreeMap::new();
    for (name, node) in &graph.nodes {
        let dependencies = graph
            .edges
            .get(name)
            .map(|edges| {
                edges
                    .iter()
                    .map(|e| {
                        (
                            e.target.clone(),
                            LockedDependency {
                                specifier: e.specifier.clone(),
                                markers: e.marker.as_ref().map(ToString::to_string),
                            },
                        )
                    })
                    .collect()
            })
            .unwrap_or_default();
        section.insert(
            name.clone(),
            LockedPackage {
                version: node.version.clone(),
                digests: node.digests.clone(),
                index: node.source.clone(),
                markers: node.marker.as_ref().map(ToString::to_string),
                extras: node.extras.clone(),
                dependencies,
            },
        );
    }
    section
}

fn validate_section(
    section: &BTreeMap<PackageName, LockedPackage>,
    category: Category,
) -> Result<(), LockError> {
    for (name, package) in section {
        if package.digests.is_empty() {
            return Err(LockError::MissingDigests {
                name: name.clone(),
                version: package.version.clone(),
            });
        }
        // Markers are stored verbatim; a string that no longer parses is
        // corrupt integrity data, not an inactive condition.
        parse_marker(name, package.markers.as_deref())?;
        for (target, dependency) in &package.dependencies {
            parse_marker(name, dependency.markers.as_deref())?;
            let Some(locked) = section.get(target) else {
                return Err(LockError::DanglingEdge {
                    from: name.clone(),
                    to: target.clone(),
                    section: category,
                });
            };
            if !dependency.specifier.matches(&locked.version) {
                return Err(LockError::EdgeUnsatisfied {
                    from: name.clone(),
                    to: target.clone(),
                    version: locked.version.clone(),
                    specifier: dependency.specifier.clone(),
                });
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn digest(fill: char) -> ArtifactDigest {
        ArtifactDigest::new(fill.to_string().repeat(64)).unwrap()
    }

    fn sample() -> LockArtifact {
        let mut default = BTreeMap::new();
        default.insert(
            PackageName::new("requests"),
            LockedPackage {
                version: Version::parse("2.31.0").unwrap(),
                digests: BTreeSet::from([digest('a'), digest('b')]),
                index: "pypi".to_string(),
                markers: None,
                extras: vec!["socks".to_string()],
                dependencies: BTreeMap::from([(
                    PackageName::new("idna"),
                    LockedDependency {
                        specifier: SpecifierSet::parse(">=2.5, <4").unwrap(),
                        markers: None,
                    },
                )]),
            },
        );
        default.insert(
            PackageName::new("idna"),
            LockedPackage {
                version: Version::parse("3.4").unwrap(),
                digests: BTreeSet::from([digest('c')]),
                index: "pypi".to_string(),
                markers: None,
                extras: Vec::new(),
                dependencies: BTreeMap::new(),
            },
        );
        LockArtifact {
            meta: LockMeta {
                hash: digest('0'),
                lock_version: crate::LOCK_VERSION,
                requires: LockRequires {
                    python_version: Some("3.11".to_string()),
                },
                sources: vec![Source {
                    name: "pypi".to_string(),
                    url: "https://pypi.org/simple".to_string(),
                    verify_ssl: true,
                }],
            },
            default,
            develop: BTreeMap::new(),
        }
    }

    #[test]
    fn test_encode_decode_round_trip() {
        let artifact = sample();
        let bytes = artifact.encode().unwrap();
        let decoded = LockArtifact::decode(&bytes).unwrap();
        assert_eq!(decoded, artifact);
    }

    #[test]
    fn test_encode_is_deterministic() {
        let artifact = sample();
        assert_eq!(artifact.encode().unwrap(), artifact.encode().unwrap());
    }

    #[test]
    fn test_unknown_lock_version_rejected() {
        let mut artifact = sample();
        artifact.meta.lock_version = 99;
        let bytes = artifact.encode().unwrap();
        let err = LockArtifact::decode(&bytes).unwrap_err();
        assert!(matches!(err, LockError::UnknownVersion(99)));
    }

    #[test]
    fn test_empty_digests_rejected() {
        let mut artifact = sample();
        artifact
            .default
            .get_mut(&PackageName::new("idna"))
            .unwrap()
            .digests
            .clear();
        let bytes = artifact.encode().unwrap();
        let err = LockArtifact::decode(&bytes).unwrap_err();
        assert!(matches!(err, LockError::MissingDigests { .. }));
    }

    #[test]
    fn test_dangling_dependency_rejected() {
        let mut artifact = sample();
        artifact.default.remove(&PackageName::new("idna"));
        let bytes = artifact.encode().unwrap();
        let err = LockArtifact::decode(&bytes).unwrap_err();
        assert!(matches!(err, LockError::DanglingEdge { .. }));
    }

    #[test]
    fn test_unsatisfied_edge_rejected() {
        let mut artifact = sample();
        artifact
            .default
            .get_mut(&PackageName::new("idna"))
            .unwrap()
            .version = Version::parse("5.0").unwrap();
        let bytes = artifact.encode().unwrap();
        let err = LockArtifact::decode(&bytes).unwrap_err();
        assert!(matches!(err, LockError::EdgeUnsatisfied { .. }));
    }

    #[test]
    fn test_bad_node_marker_rejected() {
        let mut artifact = sample();
        artifact
            .default
            .get_mut(&PackageName::new("idna"))
            .unwrap()
            .markers = Some("sys_platform ==".to_string());
        let bytes = artifact.encode().unwrap();
        let err = LockArtifact::decode(&bytes).unwrap_err();
        assert!(matches!(
            err,
            LockError::BadMarker { name, .. } if name == PackageName::new("idna")
        ));
    }

    #[test]
    fn test_bad_edge_marker_rejected() {
        let mut artifact = sample();
        artifact
            .default
            .get_mut(&PackageName::new("requests"))
            .unwrap()
            .dependencies
            .get_mut(&PackageName::new("idna"))
            .unwrap()
            .markers = Some("not a marker".to_string());
        let bytes = artifact.encode().unwrap();
        let err = LockArtifact::decode(&bytes).unwrap_err();
        assert!(matches!(err, LockError::BadMarker { .. }));
    }

    #[test]
    fn test_sections_validated_independently() {
        // A develop edge may not reach into the default section
        let mut artifact = sample();
        artifact.develop.insert(
            PackageName::new("pytest"),
            LockedPackage {
                version: Version::parse("8.0.0").unwrap(),
                digests: BTreeSet::from([digest('d')]),
                index: "pypi".to_string(),
                markers: None,
                extras: Vec::new(),
                dependencies: BTreeMap::from([(
                    PackageName::new("idna"),
                    LockedDependency {
                        specifier: SpecifierSet::any(),
                        markers: None,
                    },
                )]),
            },
        );
        let bytes = artifact.encode().unwrap();
        let err = LockArtifact::decode(&bytes).unwrap_err();
        assert!(matches!(
            err,
            LockError::DanglingEdge {
                section: Category::Develop,
                ..
            }
        ));
    }

    #[test]
    fn test_graph_round_trip() {
        let artifact = sample();
        let graph = artifact.graph(Category::Default).unwrap();
        assert_eq!(graph.len(), 2);
        let rebuilt = section_from_graph(&graph);
        assert_eq!(rebuilt, artifact.default);
    }
}
