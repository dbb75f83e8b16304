//! HTTP implementation of the upstream index client.

use async_trait::async_trait;
use reqwest::header::ACCEPT;
use reqwest_middleware::ClientWithMiddleware;
use reqwest_retry::{policies::ExponentialBackoff, RetryTransientMiddleware};
use url::Url;

use crate::types::{ArtifactDescriptor, PackageFilesResponse, PackageListResponse};

/// Errors talking to the upstream index. `NotFound` maps to a 404 at the
/// HTTP boundary; every other variant maps to a 500.
#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("upstream request failed: {0}")]
    Request(#[from] reqwest_middleware::Error),

    #[error("upstream returned malformed JSON: {0}")]
    Decode(#[from] reqwest::Error),

    #[error("package not found upstream: {0}")]
    NotFound(String),

    #[error("upstream returned status {status} for {url}")]
    Status { status: u16, url: String },
}

/// The interface route handlers (and the download coordinator, wrapping
/// this client) consume. Two methods: nothing else about the transport or
/// wire format leaks past this trait.
#[async_trait]
pub trait UpstreamIndexClient: Send + Sync {
    /// Returns every package name the upstream index currently lists.
    async fn get_package_list(&self) -> Result<Vec<String>, UpstreamError>;

    /// Returns the file listing for a single (already-normalized) package
    /// name.
    async fn get_package_files(&self, name: &str) -> Result<Vec<ArtifactDescriptor>, UpstreamError>;
}

/// Talks to a PEP 503 / PEP 691 compliant "simple" index over HTTP,
/// requesting the PEP 691 JSON representation.
pub struct HttpUpstreamIndexClient {
    client: ClientWithMiddleware,
    base_url: Url,
}

impl HttpUpstreamIndexClient {
    /// `base_url` is the upstream index root (e.g. `https://pypi.org/simple/`).
    pub fn new(base_url: Url) -> Self {
        let inner = reqwest::Client::builder()
            .build()
            .expect("failed to build reqwest client");
        let client = reqwest_middleware::ClientBuilder::new(inner)
            .with(RetryTransientMiddleware::new_with_policy(
                ExponentialBackoff::builder().build_with_max_retries(3),
            ))
            .build();
        Self { client, base_url }
    }

    /// Constructs a client over an already-configured middleware stack
    /// (used by tests that don't want retry/backoff delaying failures).
    pub fn with_client(base_url: Url, client: ClientWithMiddleware) -> Self {
        Self { client, base_url }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: Url) -> Result<T, UpstreamError> {
        let response = self
            .client
            .get(url.clone())
            .header(ACCEPT, "application/vnd.pypi.simple.v1+json")
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(UpstreamError::NotFound(url.to_string()));
        }
        if !response.status().is_success() {
            return Err(UpstreamError::Status {
                status: response.status().as_u16(),
                url: url.to_string(),
            });
        }

        Ok(response.json::<T>().await?)
    }
}

#[async_trait]
impl UpstreamIndexClient for HttpUpstreamIndexClient {
    async fn get_package_list(&self) -> Result<Vec<String>, UpstreamError> {
        let response: PackageListResponse = self.get_json(self.base_url.clone()).await?;
        Ok(response.projects.into_iter().map(|p| p.name).collect())
    }

    async fn get_package_files(&self, name: &str) -> Result<Vec<ArtifactDescriptor>, UpstreamError> {
        let url = self
            .base_url
            .join(&format!("{name}/"))
            .map_err(|err| UpstreamError::Status {
                status: 0,
                url: err.to_string(),
            })?;
        let response: PackageFilesResponse = self.get_json(url).await?;
        Ok(response.files.into_iter().map(ArtifactDescriptor::from).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{routing::get, Json, Router};

    async fn spawn_mock_index() -> Url {
        let app = Router::new()
            .route(
                "/",
                get(|| async {
                    Json(PackageListResponse {
                        meta: Default::default(),
                        projects: vec![crate::types::ProjectRef {
                            name: "pyspark".to_string(),
                        }],
                    })
                }),
            )
            .route(
                "/pyspark/",
                get(|| async {
                    Json(PackageFilesResponse {
                        meta: Default::default(),
                        name: "pyspark".to_string(),
                        files: vec![crate::types::FileEntry {
                            filename: "pyspark-3.4.0.tar.gz".to_string(),
                            url: "http://up/files/pyspark-3.4.0.tar.gz".to_string(),
                            hashes: Default::default(),
                            requires_python: None,
                            yanked: false,
                            yanked_reason: None,
                        }],
                    })
                }),
            );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Url::parse(&format!("http://{addr}/")).unwrap()
    }

    #[tokio::test]
    async fn get_package_list_returns_project_names() {
        let base = spawn_mock_index().await;
        let client = HttpUpstreamIndexClient::new(base);
        let names = client.get_package_list().await.unwrap();
        assert_eq!(names, vec!["pyspark".to_string()]);
    }

    #[tokio::test]
    async fn get_package_files_returns_descriptors() {
        let base = spawn_mock_index().await;
        let client = HttpUpstreamIndexClient::new(base);
        let files = client.get_package_files("pyspark").await.unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].name, "pyspark-3.4.0.tar.gz");
        assert_eq!(files[0].url, "http://up/files/pyspark-3.4.0.tar.gz");
    }

    #[tokio::test]
    async fn unknown_package_is_not_found() {
        let base = spawn_mock_index().await;
        let client = HttpUpstreamIndexClient::new(base);
        let err = client.get_package_files("does-not-exist").await.unwrap_err();
        assert!(matches!(err, UpstreamError::NotFound(_)));
    }
}
