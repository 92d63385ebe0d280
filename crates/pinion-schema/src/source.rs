//! Package sources and the ordered source registry.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error produced when building a [`SourceRegistry`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SourceError {
    /// Two sources share a name.
    #[error("duplicate source name '{0}'")]
    DuplicateName(String),
    /// The registry has no sources at all.
    #[error("no sources configured")]
    Empty,
}

/// One package index a project may resolve against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Source {
    /// Unique key referencing this source from requirements and locks.
    pub name: String,
    /// Base URL of the index.
    pub url: String,
    /// Whether TLS certificates are verified when talking to this index.
    #[serde(default = "default_verify", rename = "verify_ssl")]
    pub verify_ssl: bool,
}

fn default_verify() -> bool {
    true
}

/// Ordered, name-unique collection of sources.
///
/// Order matters: the resolver consults sources in registry order and the
/// first source is the default for requirements that do not name one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceRegistry {
    sources: Vec<Source>,
}

impl SourceRegistry {
    /// Build a registry from an ordered list of sources.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::Empty`] for an empty list and
    /// [`SourceError::DuplicateName`] when two sources share a name.
    pub fn new(sources: Vec<Source>) -> Result<Self, SourceError> {
        if sources.is_empty() {
            return Err(SourceError::Empty);
        }
        let mut seen = std::collections::HashSet::new();
        for source in &sources {
            if !seen.insert(source.name.clone()) {
                return Err(SourceError::DuplicateName(source.name.clone()));
            }
        }
        Ok(Self { sources })
    }

    /// Sources in configured order.
    pub fn iter(&self) -> std::slice::Iter<'_, Source> {
        self.sources.iter()
    }

    /// The default source (first in order).
    pub fn default_source(&self) -> &Source {
        &self.sources[0]
    }

    /// Look up a source by name.
    pub fn find(&self, name: &str) -> Option<&Source> {
        self.sources.iter().find(|s| s.name == name)
    }

    /// Apply a mirror override: every source's URL is replaced uniformly
    /// while names and order are preserved, so a mirrored resolution
    /// considers "the same source" a prior un-mirrored one did.
    pub fn with_mirror(&self, mirror_url: &str) -> Self {
        let sources = self
            .sources
            .iter()
            .map(|s| Source {
                name: s.name.clone(),
                url: mirror_url.to_string(),
                verify_ssl: s.verify_ssl,
            })
            .collect();
        Self { sources }
    }
}

impl<'a> IntoIterator for &'a SourceRegistry {
    type Item = &'a Source;
    type IntoIter = std::slice::Iter<'a, Source>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}
