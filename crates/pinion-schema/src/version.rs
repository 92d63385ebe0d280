//! Package versions.
//!
//! Versions follow the Python packaging scheme rather than strict semver:
//! any number of dotted release segments, an optional pre-release tag
//! (`a`, `b`, or `rc` plus a number), and an optional `.postN` suffix.
//! Comparison pads missing release segments with zeros, orders
//! pre-releases before their final release, and post-releases after.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::str::FromStr;
use thiserror::Error;

/// Error produced when a version string cannot be parsed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid version '{0}'")]
pub struct VersionError(pub String);

/// Pre-release phase of a version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum PreTag {
    /// Alpha (`a`).
    Alpha,
    /// Beta (`b`).
    Beta,
    /// Release candidate (`rc`).
    Rc,
}

impl PreTag {
    fn as_str(self) -> &'static str {
        match self {
            Self::Alpha => "a",
            Self::Beta => "b",
            Self::Rc => "rc",
        }
    }
}

/// An exact package version.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Version {
    /// Dotted numeric release segments, e.g. `[1, 12, 0]`.
    release: Vec<u64>,
    /// Pre-release tag and number, e.g. `rc2`.
    pre: Option<(PreTag, u64)>,
    /// Post-release number (`.postN`).
    post: Option<u64>,
}

impl Version {
    /// Parse a version string.
    ///
    /// # Errors
    ///
    /// Returns [`VersionError`] if the string is empty, has non-numeric
    /// release segments, or carries an unrecognized suffix.
    pub fn parse(s: &str) -> Result<Self, VersionError> {
        let input = s.trim();
        if input.is_empty() {
            return Err(VersionError(s.to_string()));
        }

        let mut release = Vec::new();
        let mut pre = None;
        let mut post = None;

        for (i, segment) in input.split('.').enumerate() {
            if let Some(rest) = segment.strip_prefix("post") {
                // `.postN` must come after at least one release segment
                if i == 0 || post.is_some() {
                    return Err(VersionError(s.to_string()));
                }
                post = Some(rest.parse().map_err(|_| VersionError(s.to_string()))?);
                continue;
            }

            if pre.is_some() || post.is_some() {
                // Release segments cannot follow a tag
                return Err(VersionError(s.to_string()));
            }

            match segment.parse::<u64>() {
                Ok(n) => release.push(n),
                Err(_) => {
                    // Final segment may carry an attached pre-release tag,
                    // e.g. "0a1" or "3rc2".
                    let (num, tag) = split_pre_segment(segment).ok_or_else(|| {
                        VersionError(s.to_string())
                    })?;
                    release.push(num);
                    pre = Some(tag);
                }
            }
        }

        if release.is_empty() {
            return Err(VersionError(s.to_string()));
        }

        Ok(Self { release, pre, post })
    }

    /// The numeric release segments.
    pub fn release(&self) -> &[u64] {
        &self.release
    }

    /// Whether this is a pre-release (alpha, beta, or release candidate).
    pub fn is_prerelease(&self) -> bool {
        self.pre.is_some()
    }

    /// Release segment at `idx`, treating missing segments as zero.
    fn segment(&self, idx: usize) -> u64 {
        self.release.get(idx).copied().unwrap_or(0)
    }

    /// Compare only the first `n` release segments against `other`.
    ///
    /// Used for wildcard matching (`==1.2.*` compares two segments).
    pub fn release_prefix_eq(&self, other: &Version, n: usize) -> bool {
        (0..n).all(|i| self.segment(i) == other.segment(i))
    }
}

fn split_pre_segment(segment: &str) -> Option<(u64, (PreTag, u64))> {
    for (marker, tag) in [("rc", PreTag::Rc), ("a", PreTag::Alpha), ("b", PreTag::Beta)] {
        if let Some(pos) = segment.find(marker) {
            let (num_part, rest) = segment.split_at(pos);
            let tag_num = rest[marker.len()..].parse().ok()?;
            let num = num_part.parse().ok()?;
            return Some((num, (tag, tag_num)));
        }
    }
    None
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        let len = self.release.len().max(other.release.len());
        for i in 0..len {
            match self.segment(i).cmp(&other.segment(i)) {
                Ordering::Equal => {}
                ord => return ord,
            }
        }

        // Same release: pre-release < final < post-release
        let pre_rank = |v: &Self| match v.pre {
            Some(tag) => (0u8, Some(tag)),
            None => (1, None),
        };
        match pre_rank(self).cmp(&pre_rank(other)) {
            Ordering::Equal => {}
            ord => return ord,
        }

        self.post.unwrap_or(0).cmp(&other.post.unwrap_or(0))
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let release: Vec<String> = self.release.iter().map(ToString::to_string).collect();
        write!(f, "{}", release.join("."))?;
        if let Some((tag, n)) = self.pre {
            write!(f, "{}{n}", tag.as_str())?;
        }
        if let Some(n) = self.post {
            write!(f, ".post{n}")?;
        }
        Ok(())
    }
}

impl FromStr for Version {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for Version {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Version {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}
