//! Errors surfaced by project operations.

use std::path::PathBuf;
use thiserror::Error;

use crate::resolver::ResolveError;
use crate::sync::SyncError;
use pinion_schema::lock::LockError;
use pinion_schema::manifest::ManifestError;

/// Error produced by a project operation.
#[derive(Error, Debug)]
pub enum OpError {
    /// The manifest failed to read or validate.
    #[error("manifest error: {0}")]
    Manifest(#[from] ManifestError),

    /// The lock artifact failed to decode or validate.
    #[error("lock error: {0}")]
    Lock(#[from] LockError),

    /// Resolution failed.
    #[error(transparent)]
    Resolve(#[from] ResolveError),

    /// Plan execution failed or was cancelled mid-flight.
    #[error(transparent)]
    Sync(#[from] SyncError),

    /// Sync was requested but no lock artifact exists. Syncing never
    /// resolves, so this is a hard error, not a trigger to lock.
    #[error("no lock artifact at {}; run lock first", path.display())]
    LockNotFound {
        /// Where the lock artifact was expected.
        path: PathBuf,
    },

    /// Filesystem failure reading or writing project files.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
