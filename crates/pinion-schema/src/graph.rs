//! The resolved dependency graph.
//!
//! Output of resolution for one category: exact pins with digests, plus
//! "requires" edges that preserve the specifier and marker they were
//! declared under. Cycles are permitted (extras produce them in real
//! ecosystems); orphan pins are not.

use crate::hash::ArtifactDigest;
use crate::marker::MarkerExpr;
use crate::name::PackageName;
use crate::specifier::SpecifierSet;
use crate::version::Version;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use thiserror::Error;

/// Error produced by [`ResolvedGraph::validate`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    /// An edge points at a package with no node.
    #[error("edge from '{from}' targets '{to}' which is not pinned")]
    DanglingEdge {
        /// Source of the edge.
        from: PackageName,
        /// Missing target.
        to: PackageName,
    },
    /// A pinned version does not satisfy the specifier that produced an edge.
    #[error("'{to}' pinned at {version} does not satisfy '{specifier}' required by '{from}'")]
    EdgeUnsatisfied {
        /// Source of the edge.
        from: PackageName,
        /// Target of the edge.
        to: PackageName,
        /// The pinned version.
        version: Version,
        /// The violated constraint.
        specifier: SpecifierSet,
    },
    /// A node is unreachable from every manifest-declared root.
    #[error("'{0}' is pinned but not reachable from any declared requirement")]
    OrphanPin(PackageName),
    /// A node carries no digests.
    #[error("'{name}' {version} has no artifact digests")]
    MissingDigests {
        /// The offending package.
        name: PackageName,
        /// Its pinned version.
        version: Version,
    },
}

/// One fully pinned package.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedNode {
    /// Normalized package name.
    pub name: PackageName,
    /// The chosen exact version.
    pub version: Version,
    /// Sorted digest set, one per distributable artifact form.
    pub digests: BTreeSet<ArtifactDigest>,
    /// Name of the source this node's metadata came from.
    pub source: String,
    /// Marker under which the node is active; `None` means always.
    pub marker: Option<MarkerExpr>,
    /// Extras activated on this package, sorted.
    pub extras: Vec<String>,
}

/// A "requires" edge, preserving its declared constraint and marker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedEdge {
    /// Target package.
    pub target: PackageName,
    /// The specifier the dependency was declared with.
    pub specifier: SpecifierSet,
    /// Marker inherited from the dependency declaration, verbatim.
    pub marker: Option<MarkerExpr>,
}

/// Directed graph over resolved nodes for one category.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ResolvedGraph {
    /// Pinned nodes keyed by normalized name (at most one per name).
    pub nodes: BTreeMap<PackageName, ResolvedNode>,
    /// Outgoing edges per node.
    pub edges: BTreeMap<PackageName, Vec<ResolvedEdge>>,
}

impl ResolvedGraph {
    /// Number of pinned packages.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the graph pins nothing.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Look up one pin.
    pub fn get(&self, name: &PackageName) -> Option<&ResolvedNode> {
        self.nodes.get(name)
    }

    /// Validate structural invariants against the declared roots:
    /// every node has digests, every edge's target exists and its pinned
    /// version satisfies the edge specifier, and every node is reachable
    /// from at least one root. Cycles are fine.
    ///
    /// # Errors
    ///
    /// Returns the first [`GraphError`] encountered.
    pub fn validate(&self, roots: &[PackageName]) -> Result<(), GraphError> {
        for node in self.nodes.values() {
            if node.digests.is_empty() {
                return Err(GraphError::MissingDigests {
                    name: node.name.clone(),
                    version: node.version.clone(),
                });
            }
        }

        for (from, edges) in &self.edges {
            for edge in edges {
                let Some(target) = self.nodes.get(&edge.target) else {
                    return Err(GraphError::DanglingEdge {
                        from: from.clone(),
                        to: edge.target.clone(),
                    });
                };
                if !edge.specifier.matches(&target.version) {
                    return Err(GraphError::EdgeUnsatisfied {
                        from: from.clone(),
                        to: edge.target.clone(),
                        version: target.version.clone(),
                        specifier: edge.specifier.clone(),
                    });
                }
            }
        }

        // Breadth-first reachability from the roots; cycles terminate
        // because visited nodes are never re-queued.
        let mut reachable: BTreeSet<PackageName> = BTreeSet::new();
        let mut queue: VecDeque<PackageName> = roots
            .iter()
            .filter(|r| self.nodes.contains_key(*r))
            .cloned()
            .collect();
        while let Some(name) = queue.pop_front() {
            if !reachable.insert(name.clone()) {
                continue;
            }
            if let Some(edges) = self.edges.get(&name) {
                for edge in edges {
                    if !reachable.contains(&edge.target) {
                        queue.push_back(edge.target.clone());
                    }
                }
            }
        }

        for name in self.nodes.keys() {
            if !reachable.contains(name) {
                return Err(GraphError::OrphanPin(name.clone()));
            }
        }

        Ok(())
    }
}
