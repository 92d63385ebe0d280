//! Artifact digests.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Error produced when a digest string fails validation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid sha256 digest '{0}': expected 64 hex characters")]
pub struct DigestError(pub String);

/// A validated SHA-256 digest of one distributable artifact form.
///
/// This newtype ensures every digest in the system is validated at
/// construction/deserialization time, preventing invalid hex strings from
/// propagating into lock artifacts. Accepts input with or without a
/// `sha256:` prefix; stores and renders the prefixed lowercase form.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct ArtifactDigest(String);

impl ArtifactDigest {
    /// Create a digest, validating the hex portion.
    ///
    /// # Errors
    ///
    /// Returns [`DigestError`] if the hex portion is not exactly 64 ASCII
    /// hex characters.
    pub fn new(s: impl Into<String>) -> Result<Self, DigestError> {
        let s = s.into();
        let hex_part = s.strip_prefix("sha256:").unwrap_or(&s);
        if hex_part.len() != 64 || !hex_part.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(DigestError(s.clone()));
        }
        Ok(Self(format!("sha256:{}", hex_part.to_lowercase())))
    }

    /// Digest of a byte buffer.
    pub fn of_bytes(bytes: &[u8]) -> Self {
        let digest = Sha256::digest(bytes);
        Self(format!("sha256:{}", hex::encode(digest)))
    }

    /// The prefixed lowercase form, e.g. `sha256:ab12…`.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The bare 64-character hex portion.
    pub fn hex(&self) -> &str {
        &self.0["sha256:".len()..]
    }
}

impl std::fmt::Display for ArtifactDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for ArtifactDigest {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl<'de> Deserialize<'de> for ArtifactDigest {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::new(s).map_err(serde::de::Error::custom)
    }
}
