//! Normalized package identity.

use serde::{Deserialize, Serialize};
use std::borrow::Borrow;

/// A normalized package name.
///
/// Package indexes treat `Foo_Bar`, `foo.bar`, and `foo-bar` as the same
/// project, so every map in the system keys on the normalized form:
/// lowercase, with runs of `-`, `_`, and `.` collapsed to a single `-`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PackageName(String);

impl PackageName {
    /// Create a new package name, normalizing the input.
    pub fn new(name: &str) -> Self {
        let mut out = String::with_capacity(name.len());
        let mut last_sep = false;
        for c in name.trim().chars() {
            if matches!(c, '-' | '_' | '.') {
                if !last_sep {
                    out.push('-');
                    last_sep = true;
                }
            } else {
                for lc in c.to_lowercase() {
                    out.push(lc);
                }
                last_sep = false;
            }
        }
        Self(out)
    }

    /// Return the normalized name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PackageName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::ops::Deref for PackageName {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl AsRef<str> for PackageName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl PartialEq<str> for PackageName {
    fn eq(&self, other: &str) -> bool {
        self.0 == Self::new(other).0
    }
}

impl PartialEq<&str> for PackageName {
    fn eq(&self, other: &&str) -> bool {
        self.0 == Self::new(other).0
    }
}

impl Borrow<str> for PackageName {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<&str> for PackageName {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for PackageName {
    fn from(s: String) -> Self {
        Self::new(&s)
    }
}
