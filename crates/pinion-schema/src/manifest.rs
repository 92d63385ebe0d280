//! The project manifest.
//!
//! A manifest declares abstract requirements: a `[[source]]` array of
//! package indexes, `[packages]` and `[dev-packages]` requirement tables,
//! and an interpreter constraint under `[requires]`. Entries are either a
//! bare specifier string (`"*"`, `"==1.12.0"`) or an inline table carrying
//! extras, markers, an explicit index, or a local path.

use crate::marker::MarkerExpr;
use crate::name::PackageName;
use crate::source::{Source, SourceError, SourceRegistry};
use crate::specifier::SpecifierSet;
use serde::Deserialize;
use std::collections::BTreeMap;
use thiserror::Error;

/// Error produced while parsing or validating a manifest.
#[derive(Error, Debug)]
pub enum ManifestError {
    /// The TOML itself failed to parse.
    #[error("manifest is not valid TOML: {0}")]
    Toml(#[from] toml::de::Error),
    /// Two entries in one category normalize to the same package name.
    #[error("duplicate package '{name}' in {category} section")]
    DuplicatePackage {
        /// The normalized colliding name.
        name: PackageName,
        /// Which section the collision occurred in.
        category: Category,
    },
    /// A version specifier failed to parse.
    #[error("package '{name}': {source}")]
    BadSpecifier {
        /// The offending package.
        name: PackageName,
        /// Parse failure detail.
        source: crate::specifier::SpecifierError,
    },
    /// A marker expression failed to parse.
    #[error("package '{name}': {source}")]
    BadMarker {
        /// The offending package.
        name: PackageName,
        /// Parse failure detail.
        source: crate::marker::MarkerError,
    },
    /// A requirement references a source name not in `[[source]]`.
    #[error("package '{name}' references unknown source '{index}'")]
    UnknownSource {
        /// The offending package.
        name: PackageName,
        /// The unknown source name.
        index: String,
    },
    /// The `[[source]]` array is invalid.
    #[error(transparent)]
    Source(#[from] SourceError),
}

/// Requirement category: the default graph or the development graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Category {
    /// `[packages]`: runtime requirements.
    Default,
    /// `[dev-packages]`: development-only requirements.
    Develop,
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Default => write!(f, "packages"),
            Self::Develop => write!(f, "dev-packages"),
        }
    }
}

/// One abstract requirement from the manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Requirement {
    /// Normalized package name.
    pub name: PackageName,
    /// Version constraint; wildcard means "any".
    pub specifier: SpecifierSet,
    /// Extras to activate, sorted for determinism.
    pub extras: Vec<String>,
    /// Environment marker gating this requirement.
    pub marker: Option<MarkerExpr>,
    /// Explicit source name, when pinned to one index.
    pub source: Option<String>,
    /// Local path instead of an index artifact.
    pub path: Option<String>,
    /// Whether a path requirement is installed editable.
    pub editable: bool,
}

impl Requirement {
    /// A plain requirement with only a name and specifier.
    pub fn new(name: impl Into<PackageName>, specifier: SpecifierSet) -> Self {
        Self {
            name: name.into(),
            specifier,
            extras: Vec::new(),
            marker: None,
            source: None,
            path: None,
            editable: false,
        }
    }

    /// Canonical single-line form used for fingerprinting.
    fn canonical(&self) -> String {
        let mut out = format!("{} {}", self.name, self.specifier);
        if !self.extras.is_empty() {
            out.push_str(&format!(" extras=[{}]", self.extras.join(",")));
        }
        if let Some(marker) = &self.marker {
            out.push_str(&format!(" ; {marker}"));
        }
        if let Some(source) = &self.source {
            out.push_str(&format!(" index={source}"));
        }
        if let Some(path) = &self.path {
            out.push_str(&format!(" path={path}"));
            if self.editable {
                out.push_str(" editable");
            }
        }
        out
    }
}

/// A parsed, validated project manifest.
#[derive(Debug, Clone)]
pub struct Manifest {
    /// Configured package indexes, in order.
    pub sources: SourceRegistry,
    /// Interpreter constraint (`python_version`), if declared.
    pub requires_python: Option<String>,
    /// Runtime requirements.
    pub packages: Vec<Requirement>,
    /// Development requirements.
    pub dev_packages: Vec<Requirement>,
}

// Raw shapes as written in the TOML, before validation.

#[derive(Debug, Deserialize)]
struct RawManifest {
    #[serde(default, rename = "source")]
    sources: Vec<Source>,
    #[serde(default)]
    requires: RawRequires,
    #[serde(default)]
    packages: BTreeMap<String, RawEntry>,
    #[serde(default, rename = "dev-packages")]
    dev_packages: BTreeMap<String, RawEntry>,
}

#[derive(Debug, Default, Deserialize)]
struct RawRequires {
    python_version: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawEntry {
    Specifier(String),
    Table {
        #[serde(default)]
        version: Option<String>,
        #[serde(default)]
        extras: Vec<String>,
        #[serde(default)]
        markers: Option<String>,
        #[serde(default)]
        index: Option<String>,
        #[serde(default)]
        path: Option<String>,
        #[serde(default)]
        editable: bool,
    },
}

/// The default public index assumed when a manifest declares no sources.
fn implicit_default_source() -> Source {
    Source {
        name: "pypi".to_string(),
        url: "https://pypi.org/simple".to_string(),
        verify_ssl: true,
    }
}

impl Manifest {
    /// Parse and validate a manifest from TOML text.
    ///
    /// # Errors
    ///
    /// Returns [`ManifestError`] for TOML syntax errors, duplicate
    /// normalized names within one category, unparseable specifiers or
    /// markers, or references to undeclared sources.
    pub fn from_toml(text: &str) -> Result<Self, ManifestError> {
        let raw: RawManifest = toml::from_str(text)?;

        let sources = if raw.sources.is_empty() {
            SourceRegistry::new(vec![implicit_default_source()])?
        } else {
            SourceRegistry::new(raw.sources)?
        };

        let packages = parse_section(raw.packages, Category::Default, &sources)?;
        let dev_packages = parse_section(raw.dev_packages, Category::Develop, &sources)?;

        Ok(Self {
            sources,
            requires_python: raw.requires.python_version,
            packages,
            dev_packages,
        })
    }

    /// Requirements for one category.
    pub fn requirements(&self, category: Category) -> &[Requirement] {
        match category {
            Category::Default => &self.packages,
            Category::Develop => &self.dev_packages,
        }
    }

    /// Content hash of the normalized manifest.
    ///
    /// Stable under cosmetic reordering (requirements are sorted by
    /// normalized name per category) but changes on any semantic edit.
    /// Persisted into the lock artifact for staleness detection.
    pub fn fingerprint(&self) -> crate::hash::ArtifactDigest {
        let mut canon = String::new();
        for source in &self.sources {
            canon.push_str(&format!(
                "source {} {} verify={}\n",
                source.name, source.url, source.verify_ssl
            ));
        }
        if let Some(python) = &self.requires_python {
            canon.push_str(&format!("requires python_version={python}\n"));
        }
        for (label, reqs) in [("default", &self.packages), ("develop", &self.dev_packages)] {
            let mut lines: Vec<String> = reqs.iter().map(Requirement::canonical).collect();
            lines.sort();
            for line in lines {
                canon.push_str(&format!("{label} {line}\n"));
            }
        }
        crate::hash::ArtifactDigest::of_bytes(canon.as_bytes())
    }
}

fn parse_section(
    raw: BTreeMap<String, RawEntry>,
    category: Category,
    sources: &SourceRegistry,
) -> Result<Vec<Requirement>, ManifestError> {
    let mut seen = std::collections::BTreeSet::new();
    let mut requirements = Vec::new();

    for (raw_name, entry) in raw {
        let name = PackageName::new(&raw_name);
        if !seen.insert(name.clone()) {
            return Err(ManifestError::DuplicatePackage { name, category });
        }

        let requirement = match entry {
            RawEntry::Specifier(spec) => {
                let specifier = SpecifierSet::parse(&spec).map_err(|source| {
                    ManifestError::BadSpecifier {
                        name: name.clone(),
                        source,
                    }
                })?;
                Requirement::new(name, specifier)
            }
            RawEntry::Table {
                version,
                mut extras,
                markers,
                index,
                path,
                editable,
            } => {
                let specifier = match version {
                    Some(spec) => SpecifierSet::parse(&spec).map_err(|source| {
                        ManifestError::BadSpecifier {
                            name: name.clone(),
                            source,
                        }
                    })?,
                    None => SpecifierSet::any(),
                };
                let marker = markers
                    .as_deref()
                    .map(MarkerExpr::parse)
                    .transpose()
                    .map_err(|source| ManifestError::BadMarker {
                        name: name.clone(),
                        source,
                    })?;
                if let Some(index_name) = &index {
                    if sources.find(index_name).is_none() {
                        return Err(ManifestError::UnknownSource {
                            name,
                            index: index_name.clone(),
                        });
                    }
                }
                extras.sort();
                extras.dedup();
                Requirement {
                    name,
                    specifier,
                    extras,
                    marker,
                    source: index,
                    path,
                    editable,
                }
            }
        };
        requirements.push(requirement);
    }

    Ok(requirements)
}
