//! Shared types and wire formats for Pinion.
//!
//! This crate holds the pure data model: normalized package names,
//! versions and specifiers, environment markers, artifact digests,
//! package sources, the project manifest, the resolved dependency graph,
//! and the lock artifact codec. Nothing here performs network I/O;
//! resolution and sync live in `pinion-core`.

pub mod graph;
pub mod hash;
pub mod lock;
pub mod manifest;
pub mod marker;
pub mod name;
pub mod source;
pub mod specifier;
pub mod version;

// Re-exports
pub use graph::{ResolvedEdge, ResolvedGraph, ResolvedNode};
pub use hash::ArtifactDigest;
pub use lock::{LockArtifact, LockError, LockMeta, LockedPackage};
pub use manifest::{Category, Manifest, ManifestError, Requirement};
pub use marker::{MarkerEnvironment, MarkerExpr};
pub use name::PackageName;
pub use source::{Source, SourceRegistry};
pub use specifier::{Specifier, SpecifierSet};
pub use version::Version;

/// Schema version written into every lock artifact's `lock_version` field.
///
/// Decoding rejects artifacts written with a version we do not know.
pub const LOCK_VERSION: u32 = 1;
