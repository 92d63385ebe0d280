//! Resolution, locking, and environment synchronization.
//!
//! [`resolver`] turns manifest requirements into a pinned dependency
//! graph via an injected [`provider::MetadataProvider`]; [`sync`] plans
//! and applies the installs needed to make an environment match a lock
//! artifact; [`ops`] ties both together as file-level project
//! operations.

pub mod index;
pub mod ops;
pub mod provider;
pub mod resolver;
pub mod sync;

pub use index::HttpProvider;
pub use ops::{OpError, Project, SyncOptions, lock_project, sync_project};
pub use provider::{Dependency, InMemoryProvider, MetadataProvider, ProviderError};
pub use resolver::{ResolveError, ResolveOptions, resolve};
pub use sync::{
    EnvironmentSnapshot, ExecuteOptions, InMemoryInstaller, InstallAction, InstallLocation,
    InstallRequest, Installer, SyncError, SyncPlan, SyncReport,
};
