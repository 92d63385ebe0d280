//! HTTP-backed metadata provider.
//!
//! Speaks the JSON release endpoint exposed by package indexes:
//! `GET {source.url}/{name}/json` returns a document listing every
//! release with its dependency declarations and artifact digests.
//! Transient failures are retried with bounded backoff here, at the
//! capability boundary; the resolver never retries.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::provider::{Dependency, MetadataProvider, ProviderError};
use pinion_schema::{ArtifactDigest, PackageName, Source, Version};

const USER_AGENT: &str = concat!("pinion/", env!("CARGO_PKG_VERSION"));

const RETRY_ATTEMPTS: u32 = 3;
const RETRY_BASE_DELAY: Duration = Duration::from_millis(250);

/// One release as the index publishes it.
#[derive(Debug, Clone, Default, Deserialize)]
struct ReleaseEntry {
    /// Requirement lines, e.g. `idna>=2.5 ; python_version >= '3'`.
    #[serde(default)]
    dependencies: Vec<String>,
    /// Prefixed sha256 digests, one per artifact form.
    #[serde(default)]
    digests: Vec<String>,
}

/// The per-package document served at `{source.url}/{name}/json`.
#[derive(Debug, Clone, Default, Deserialize)]
struct ReleaseDocument {
    #[serde(default)]
    releases: BTreeMap<String, ReleaseEntry>,
}

/// [`MetadataProvider`] backed by HTTP indexes.
///
/// Documents are cached per `(source url, package)` for the lifetime of
/// the provider, so resolving a package queries its index once even
/// though the resolver asks for versions, dependencies, and digests
/// separately.
pub struct HttpProvider {
    client: Client,
    /// Used for sources with `verify_ssl = false`.
    insecure: Client,
    cache: Mutex<HashMap<(String, PackageName), Arc<ReleaseDocument>>>,
}

impl HttpProvider {
    /// Build a provider with default timeouts.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::Unavailable`] if the TLS backend cannot
    /// be initialized.
    pub fn new() -> Result<Self, ProviderError> {
        let build = |accept_invalid: bool| {
            Client::builder()
                .user_agent(USER_AGENT)
                .timeout(Duration::from_secs(30))
                .danger_accept_invalid_certs(accept_invalid)
                .build()
                .map_err(|e| ProviderError::Unavailable(e.to_string()))
        };
        Ok(Self {
            client: build(false)?,
            insecure: build(true)?,
            cache: Mutex::new(HashMap::new()),
        })
    }

    fn client_for(&self, source: &Source) -> &Client {
        if source.verify_ssl {
            &self.client
        } else {
            &self.insecure
        }
    }

    async fn document(
        &self,
        source: &Source,
        name: &PackageName,
    ) -> Result<Arc<ReleaseDocument>, ProviderError> {
        let key = (source.url.clone(), name.clone());
        if let Some(doc) = self.cache.lock().expect("document cache lock").get(&key) {
            return Ok(Arc::clone(doc));
        }

        let url = format!("{}/{}/json", source.url.trim_end_matches('/'), name);
        let doc = Arc::new(self.fetch(source, name, &url).await?);
        self.cache
            .lock()
            .expect("document cache lock")
            .insert(key, Arc::clone(&doc));
        Ok(doc)
    }

    async fn fetch(
        &self,
        source: &Source,
        name: &PackageName,
        url: &str,
    ) -> Result<ReleaseDocument, ProviderError> {
        let client = self.client_for(source);
        let mut delay = RETRY_BASE_DELAY;
        let mut last_failure = String::new();

        for attempt in 1..=RETRY_ATTEMPTS {
            match client.get(url).send().await {
                Ok(response) => {
                    let status = response.status();
                    if status == StatusCode::NOT_FOUND {
                        debug!(package = %name, source = %source.name, "not found on index");
                        return Err(ProviderError::NotFound(name.clone()));
                    }
                    if status.is_success() {
                        return response
                            .json::<ReleaseDocument>()
                            .await
                            .map_err(|e| ProviderError::Malformed(e.to_string()));
                    }
                    if !(status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS) {
                        return Err(ProviderError::Unavailable(format!("{url}: HTTP {status}")));
                    }
                    last_failure = format!("HTTP {status}");
                }
                Err(e) => last_failure = e.to_string(),
            }

            if attempt < RETRY_ATTEMPTS {
                warn!(%url, attempt, error = %last_failure, "index request failed, retrying");
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
        }

        Err(ProviderError::Unavailable(format!(
            "{url}: {last_failure}"
        )))
    }
}

#[async_trait]
impl MetadataProvider for HttpProvider {
    async fn versions(
        &self,
        source: &Source,
        name: &PackageName,
    ) -> Result<Vec<Version>, ProviderError> {
        let doc = self.document(source, name).await?;
        // Indexes carry legacy version strings outside the supported
        // grammar; those releases are simply not candidates.
        Ok(doc
            .releases
            .keys()
            .filter_map(|v| Version::parse(v).ok())
            .collect())
    }

    async fn dependencies(
        &self,
        source: &Source,
        name: &PackageName,
        version: &Version,
    ) -> Result<Vec<Dependency>, ProviderError> {
        let doc = self.document(source, name).await?;
        let entry = find_release(&doc, version).ok_or_else(|| ProviderError::NotFound(name.clone()))?;
        entry
            .dependencies
            .iter()
            .map(|line| Dependency::parse_line(line))
            .collect()
    }

    async fn digests(
        &self,
        source: &Source,
        name: &PackageName,
        version: &Version,
    ) -> Result<Vec<ArtifactDigest>, ProviderError> {
        let doc = self.document(source, name).await?;
        let entry = find_release(&doc, version).ok_or_else(|| ProviderError::NotFound(name.clone()))?;
        entry
            .digests
            .iter()
            .map(|d| ArtifactDigest::new(d.clone()).map_err(|e| ProviderError::Malformed(e.to_string())))
            .collect()
    }
}

/// Look a release up by parsed version rather than raw string, so
/// `1.0` and `1.0.0` name the same release.
fn find_release<'a>(doc: &'a ReleaseDocument, version: &Version) -> Option<&'a ReleaseEntry> {
    doc.releases
        .iter()
        .find(|(v, _)| Version::parse(v).is_ok_and(|parsed| parsed == *version))
        .map(|(_, entry)| entry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pinion_schema::SpecifierSet;

    fn source_for(server: &mockito::ServerGuard) -> Source {
        Source {
            name: "pypi".to_string(),
            url: server.url(),
            verify_ssl: true,
        }
    }

    fn requests_doc() -> String {
        serde_json::json!({
            "releases": {
                "2.31.0": {
                    "dependencies": [
                        "idna>=2.5,<4",
                        "charset-normalizer>=2,<4 ; python_version >= '3.7'",
                    ],
                    "digests": [format!("sha256:{}", "a".repeat(64))],
                },
                "2.30.0": {
                    "dependencies": [],
                    "digests": [format!("sha256:{}", "b".repeat(64))],
                },
                "not-a-version": {},
            }
        })
        .to_string()
    }

    #[tokio::test]
    async fn test_fetches_versions_and_skips_unparseable() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/requests/json")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(requests_doc())
            .create_async()
            .await;

        let provider = HttpProvider::new().unwrap();
        let versions = provider
            .versions(&source_for(&server), &PackageName::new("requests"))
            .await
            .unwrap();

        assert_eq!(versions.len(), 2);
        assert!(versions.contains(&Version::parse("2.31.0").unwrap()));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_parses_dependency_lines() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/requests/json")
            .with_status(200)
            .with_body(requests_doc())
            .create_async()
            .await;

        let provider = HttpProvider::new().unwrap();
        let deps = provider
            .dependencies(
                &source_for(&server),
                &PackageName::new("requests"),
                &Version::parse("2.31.0").unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(deps.len(), 2);
        assert_eq!(deps[0].name, PackageName::new("idna"));
        assert_eq!(deps[0].specifier, SpecifierSet::parse(">=2.5,<4").unwrap());
        assert!(deps[0].marker.is_none());
        assert!(deps[1].marker.is_some());
    }

    #[tokio::test]
    async fn test_caches_document_across_calls() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/requests/json")
            .with_status(200)
            .with_body(requests_doc())
            .expect(1)
            .create_async()
            .await;

        let provider = HttpProvider::new().unwrap();
        let source = source_for(&server);
        let name = PackageName::new("requests");
        let version = Version::parse("2.31.0").unwrap();

        provider.versions(&source, &name).await.unwrap();
        provider.dependencies(&source, &name, &version).await.unwrap();
        let digests = provider.digests(&source, &name, &version).await.unwrap();

        assert_eq!(digests.len(), 1);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_missing_package_is_not_found() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/ghost/json")
            .with_status(404)
            .create_async()
            .await;

        let provider = HttpProvider::new().unwrap();
        let err = provider
            .versions(&source_for(&server), &PackageName::new("ghost"))
            .await
            .unwrap_err();

        assert!(matches!(err, ProviderError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_server_errors_are_retried_then_unavailable() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/flaky/json")
            .with_status(503)
            .expect(3)
            .create_async()
            .await;

        let provider = HttpProvider::new().unwrap();
        let err = provider
            .versions(&source_for(&server), &PackageName::new("flaky"))
            .await
            .unwrap_err();

        assert!(matches!(err, ProviderError::Unavailable(_)));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_bad_json_is_malformed() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/broken/json")
            .with_status(200)
            .with_body("][not json")
            .create_async()
            .await;

        let provider = HttpProvider::new().unwrap();
        let err = provider
            .versions(&source_for(&server), &PackageName::new("broken"))
            .await
            .unwrap_err();

        assert!(matches!(err, ProviderError::Malformed(_)));
    }
}
