//! Version specifiers and specifier sets.
//!
//! A specifier is one comparison operator plus a version (`>=1.0`,
//! `==1.2.*`, `~=2.1`); a specifier set is a comma-separated conjunction
//! of them. The wildcard set `*` matches any version. Intersection of two
//! sets is their conjunction, so constraint merging in the resolver is
//! concatenation followed by a satisfiability probe over real candidates.

use crate::version::{Version, VersionError};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::str::FromStr;
use thiserror::Error;

/// Error produced when a specifier string cannot be parsed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SpecifierError {
    /// The comparison operator is missing or unknown.
    #[error("invalid specifier '{0}': unrecognized operator")]
    BadOperator(String),
    /// The version portion failed to parse.
    #[error("invalid specifier '{0}': {1}")]
    BadVersion(String, VersionError),
    /// `~=` requires at least two release segments.
    #[error("invalid specifier '{0}': compatible release needs two segments")]
    ShortCompatible(String),
    /// Wildcards are only valid with `==` and `!=`.
    #[error("invalid specifier '{0}': wildcard requires == or !=")]
    BadWildcard(String),
}

/// Comparison operator of a single specifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    /// `==` (optionally with a trailing `.*` wildcard).
    Eq,
    /// `!=` (optionally with a trailing `.*` wildcard).
    Ne,
    /// `>=`
    Ge,
    /// `<=`
    Le,
    /// `>`
    Gt,
    /// `<`
    Lt,
    /// `~=` compatible release.
    Compatible,
}

impl Op {
    fn as_str(self) -> &'static str {
        match self {
            Self::Eq => "==",
            Self::Ne => "!=",
            Self::Ge => ">=",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Lt => "<",
            Self::Compatible => "~=",
        }
    }
}

/// A single version constraint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Specifier {
    op: Op,
    version: Version,
    /// Set when the version carried a trailing `.*`; wildcard comparisons
    /// only consider the written release segments.
    wildcard: bool,
}

impl Specifier {
    /// Parse a single specifier such as `>=1.0` or `==1.2.*`.
    ///
    /// # Errors
    ///
    /// Returns [`SpecifierError`] for an unknown operator, a malformed
    /// version, a wildcard on a non-equality operator, or a `~=` with
    /// fewer than two release segments.
    pub fn parse(s: &str) -> Result<Self, SpecifierError> {
        let input = s.trim();
        let (op, rest) = if let Some(r) = input.strip_prefix("==") {
            (Op::Eq, r)
        } else if let Some(r) = input.strip_prefix("!=") {
            (Op::Ne, r)
        } else if let Some(r) = input.strip_prefix(">=") {
            (Op::Ge, r)
        } else if let Some(r) = input.strip_prefix("<=") {
            (Op::Le, r)
        } else if let Some(r) = input.strip_prefix("~=") {
            (Op::Compatible, r)
        } else if let Some(r) = input.strip_prefix('>') {
            (Op::Gt, r)
        } else if let Some(r) = input.strip_prefix('<') {
            (Op::Lt, r)
        } else {
            return Err(SpecifierError::BadOperator(s.to_string()));
        };

        let rest = rest.trim();
        let (version_str, wildcard) = match rest.strip_suffix(".*") {
            Some(prefix) => (prefix, true),
            None => (rest, false),
        };

        if wildcard && !matches!(op, Op::Eq | Op::Ne) {
            return Err(SpecifierError::BadWildcard(s.to_string()));
        }

        let version = Version::parse(version_str)
            .map_err(|e| SpecifierError::BadVersion(s.to_string(), e))?;

        if op == Op::Compatible && version.release().len() < 2 {
            return Err(SpecifierError::ShortCompatible(s.to_string()));
        }

        Ok(Self { op, version, wildcard })
    }

    /// Whether `candidate` satisfies this constraint.
    pub fn matches(&self, candidate: &Version) -> bool {
        let written = self.version.release().len();
        match self.op {
            Op::Eq if self.wildcard => candidate.release_prefix_eq(&self.version, written),
            Op::Ne if self.wildcard => !candidate.release_prefix_eq(&self.version, written),
            Op::Eq => candidate.cmp(&self.version) == Ordering::Equal,
            Op::Ne => candidate.cmp(&self.version) != Ordering::Equal,
            Op::Ge => *candidate >= self.version,
            Op::Le => *candidate <= self.version,
            Op::Gt => *candidate > self.version,
            Op::Lt => *candidate < self.version,
            // ~=X.Y.Z means >=X.Y.Z with the leading segments fixed
            Op::Compatible => {
                *candidate >= self.version
                    && candidate.release_prefix_eq(&self.version, written - 1)
            }
        }
    }

    /// Whether this specifier names a pre-release version.
    pub fn references_prerelease(&self) -> bool {
        self.version.is_prerelease()
    }
}

impl std::fmt::Display for Specifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}", self.op.as_str(), self.version)?;
        if self.wildcard {
            write!(f, ".*")?;
        }
        Ok(())
    }
}

/// A conjunction of specifiers; the empty set matches any version (`*`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct SpecifierSet(Vec<Specifier>);

impl SpecifierSet {
    /// The wildcard set matching every version.
    pub fn any() -> Self {
        Self(Vec::new())
    }

    /// Parse a comma-separated specifier set. `*` and the empty string
    /// parse to the wildcard set.
    ///
    /// # Errors
    ///
    /// Returns [`SpecifierError`] if any component fails to parse.
    pub fn parse(s: &str) -> Result<Self, SpecifierError> {
        let input = s.trim();
        if input.is_empty() || input == "*" {
            return Ok(Self::any());
        }
        let specs = input
            .split(',')
            .map(Specifier::parse)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self(specs))
    }

    /// Whether this is the wildcard set.
    pub fn is_any(&self) -> bool {
        self.0.is_empty()
    }

    /// Whether `candidate` satisfies every specifier in the set.
    pub fn matches(&self, candidate: &Version) -> bool {
        self.0.iter().all(|s| s.matches(candidate))
    }

    /// Whether the set names a pre-release anywhere.
    ///
    /// Candidate selection excludes pre-releases unless the constraint
    /// explicitly asks for one.
    pub fn allows_prerelease(&self) -> bool {
        self.0.iter().any(Specifier::references_prerelease)
    }

    /// Intersect with another set.
    ///
    /// The conjunction of two conjunctions is their concatenation;
    /// duplicate specifiers are dropped. Unsatisfiability is discovered
    /// against real candidate lists, not symbolically.
    pub fn intersect(&self, other: &SpecifierSet) -> SpecifierSet {
        let mut merged = self.0.clone();
        for spec in &other.0 {
            if !merged.contains(spec) {
                merged.push(spec.clone());
            }
        }
        SpecifierSet(merged)
    }
}

impl std::fmt::Display for SpecifierSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.0.is_empty() {
            return write!(f, "*");
        }
        let parts: Vec<String> = self.0.iter().map(ToString::to_string).collect();
        write!(f, "{}", parts.join(", "))
    }
}

impl FromStr for SpecifierSet {
    type Err = SpecifierError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for SpecifierSet {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for SpecifierSet {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(s: &str) -> Version {
        Version::parse(s).unwrap()
    }

    #[test]
    fn test_basic_operators() {
        let spec = Specifier::parse("==1.12.0").unwrap();
        assert!(spec.matches(&v("1.12.0")));
        assert!(spec.matches(&v("1.12")));
        assert!(!spec.matches(&v("1.12.1")));

        let spec = Specifier::parse(">=2.0").unwrap();
        assert!(spec.matches(&v("2.0")));
        assert!(spec.matches(&v("3.1")));
        assert!(!spec.matches(&v("1.9.9")));
    }

    #[test]
    fn test_wildcard() {
        let spec = Specifier::parse("==1.2.*").unwrap();
        assert!(spec.matches(&v("1.2.0")));
        assert!(spec.matches(&v("1.2.9")));
        assert!(!spec.matches(&v("1.3.0")));

        assert!(Specifier::parse(">=1.2.*").is_err());
    }

    #[test]
    fn test_compatible_release() {
        let spec = Specifier::parse("~=1.4.2").unwrap();
        assert!(spec.matches(&v("1.4.2")));
        assert!(spec.matches(&v("1.4.9")));
        assert!(!spec.matches(&v("1.5.0")));
        assert!(!spec.matches(&v("1.4.1")));

        let spec = Specifier::parse("~=2.2").unwrap();
        assert!(spec.matches(&v("2.9")));
        assert!(!spec.matches(&v("3.0")));

        assert!(Specifier::parse("~=2").is_err());
    }

    #[test]
    fn test_set_parse_and_display() {
        let set = SpecifierSet::parse(">=1.0, <2.0").unwrap();
        assert!(set.matches(&v("1.5")));
        assert!(!set.matches(&v("2.0")));
        assert_eq!(set.to_string(), ">=1.0, <2.0");

        assert!(SpecifierSet::parse("*").unwrap().is_any());
        assert_eq!(SpecifierSet::any().to_string(), "*");
    }

    #[test]
    fn test_intersection_is_conjunction() {
        let a = SpecifierSet::parse(">=1.0").unwrap();
        let b = SpecifierSet::parse("<2.0").unwrap();
        let both = a.intersect(&b);
        assert!(both.matches(&v("1.5")));
        assert!(!both.matches(&v("0.9")));
        assert!(!both.matches(&v("2.1")));

        // Duplicates collapse so repeated merges stay small
        let again = both.intersect(&a);
        assert_eq!(again, both);
    }

    #[test]
    fn test_prerelease_gate() {
        assert!(!SpecifierSet::parse(">=1.0").unwrap().allows_prerelease());
        assert!(SpecifierSet::parse("==2.0.0rc1").unwrap().allows_prerelease());
    }
}
