//! File-level project operations.
//!
//! The lock operation reads the manifest, resolves both categories, and
//! atomically writes the lock artifact. The sync operation reads the lock
//! artifact and converges an environment toward it; it never resolves and
//! never touches the lock. Everything below this layer works on in-memory
//! values; this is where paths and file IO live.

mod error;
mod lock;
mod project;
mod sync;

pub use error::OpError;
pub use lock::lock_project;
pub use project::Project;
pub use sync::{SyncOptions, sync_project};
