//! Download coordinator: collapses concurrent requests for the same
//! not-yet-cached file into a single upstream fetch.

use std::{sync::Arc, time::Duration};

use dashmap::{mapref::entry::Entry, DashMap};
use proxy_cache::index::{IndexKey, IndexMetadataCache};
use proxy_singleflight::{SingleFlight, SingleFlightError};
use proxy_store::{bufpool::BufferPool, ContentStore, StreamingContentStore};
use proxy_upstream::{ArtifactDescriptor, UpstreamError, UpstreamIndexClient};
use reqwest_middleware::ClientWithMiddleware;
use tokio::io::AsyncWrite;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::{
    downloader::{download_and_stream, DownloadError},
    latch::{Cancelled, DownloadLatch},
    timeout::timeout_for_size,
};

/// Per-request cancellation context threaded through a download call.
#[derive(Clone, Default)]
pub struct DownloadContext {
    pub cancellation: CancellationToken,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct DownloadKey {
    pkg: String,
    file: String,
}

struct DownloadState {
    latch: DownloadLatch<Result<(), String>>,
}

/// Outcome of [`DownloadCoordinator::coordinate`].
#[derive(Debug)]
pub enum CoordinateOutcome {
    /// Bytes were written to the caller's writer; `size` bytes total.
    Served { size: u64 },
    /// The caller should redirect the client to fetch the file directly
    /// from upstream.
    Redirect(Url),
}

#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error("package or file not found: {0}")]
    NotFound(String),

    #[error("cancelled while waiting for an in-progress download")]
    Cancelled,

    #[error(transparent)]
    Upstream(#[from] UpstreamError),

    #[error(transparent)]
    Download(#[from] DownloadError),

    #[error(transparent)]
    Store(#[from] proxy_store::ContentStoreError),

    #[error("upstream advertised an unparsable url: {0}")]
    BadUrl(String),
}

impl From<Cancelled> for CoordinatorError {
    fn from(_: Cancelled) -> Self {
        CoordinatorError::Cancelled
    }
}

/// Coalesces concurrent downloads of the same package file.
pub struct DownloadCoordinator {
    store: Arc<dyn StreamingContentStore>,
    upstream: Arc<dyn UpstreamIndexClient>,
    descriptor_cache: Arc<IndexMetadataCache<Vec<ArtifactDescriptor>>>,
    descriptor_singleflight: SingleFlight<String, Arc<Vec<ArtifactDescriptor>>>,
    http_client: ClientWithMiddleware,
    buffers: Arc<BufferPool>,
    default_timeout: Duration,
    linger: Duration,
    statuses: Arc<DashMap<DownloadKey, Arc<DownloadState>>>,
}

impl DownloadCoordinator {
    pub fn new(
        store: Arc<dyn StreamingContentStore>,
        upstream: Arc<dyn UpstreamIndexClient>,
        descriptor_cache: Arc<IndexMetadataCache<Vec<ArtifactDescriptor>>>,
        http_client: ClientWithMiddleware,
        buffers: Arc<BufferPool>,
        default_timeout: Duration,
        linger: Duration,
    ) -> Self {
        Self {
            store,
            upstream,
            descriptor_cache,
            descriptor_singleflight: SingleFlight::new(),
            http_client,
            buffers,
            default_timeout,
            linger,
            statuses: Arc::new(DashMap::new()),
        }
    }

    fn store_key(pkg: &str, file: &str) -> String {
        format!("packages/{pkg}/{file}")
    }

    async fn try_serve_from_store(
        &self,
        key: &str,
        writer: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<Option<u64>, CoordinatorError> {
        if !self.store.exists(key).await? {
            return Ok(None);
        }
        let info = self.store.streaming_get(key, writer).await?;
        Ok(Some(info.size))
    }

    /// Fetches (or serves from D) the upstream file listing for `pkg` and
    /// picks the descriptor whose filename matches `file`.
    async fn resolve_descriptor(
        &self,
        pkg: &str,
        file: &str,
    ) -> Result<ArtifactDescriptor, CoordinatorError> {
        let index_key = IndexKey::Package(pkg.to_string());
        let files = if let Some(cached) = self.descriptor_cache.get(&index_key) {
            cached
        } else {
            let upstream = self.upstream.clone();
            let pkg_owned = pkg.to_string();
            let fetched = self
                .descriptor_singleflight
                .do_call(pkg.to_string(), move || {
                    let upstream = upstream.clone();
                    let pkg_owned = pkg_owned.clone();
                    async move { upstream.get_package_files(&pkg_owned).await.map(Arc::new) }
                })
                .await
                .map_err(|err| match err {
                    SingleFlightError::Call(e) => CoordinatorError::from(e),
                    SingleFlightError::CoalescedCallFailed => {
                        CoordinatorError::NotFound(pkg.to_string())
                    }
                })?;
            self.descriptor_cache.set(index_key, fetched.clone());
            fetched
        };

        files
            .iter()
            .find(|d| d.name == file)
            .cloned()
            .ok_or_else(|| CoordinatorError::NotFound(format!("{pkg}/{file}")))
    }

    async fn redirect_or_not_found(
        &self,
        pkg: &str,
        file: &str,
    ) -> Result<CoordinateOutcome, CoordinatorError> {
        let descriptor = self.resolve_descriptor(pkg, file).await?;
        let url = Url::parse(&descriptor.url).map_err(|e| CoordinatorError::BadUrl(e.to_string()))?;
        Ok(CoordinateOutcome::Redirect(url))
    }

    /// Runs the leader's download and returns its outcome, having already
    /// published the final status to `state.latch`.
    async fn run_leader(
        &self,
        pkg: &str,
        file: &str,
        key: &str,
        writer: &mut (dyn AsyncWrite + Send + Unpin),
        state: &Arc<DownloadState>,
    ) -> Result<CoordinateOutcome, CoordinatorError> {
        let descriptor = match self.resolve_descriptor(pkg, file).await {
            Ok(d) => d,
            Err(err) => {
                state.latch.set(Err(err.to_string()));
                return Err(err);
            }
        };

        let url = match Url::parse(&descriptor.url) {
            Ok(u) => u,
            Err(e) => {
                let err = CoordinatorError::BadUrl(e.to_string());
                state.latch.set(Err(err.to_string()));
                return Err(err);
            }
        };

        let timeout = timeout_for_size(descriptor.size, self.default_timeout);

        let result = download_and_stream(
            &self.http_client,
            &self.buffers,
            &url,
            self.store.clone() as Arc<dyn ContentStore>,
            key,
            writer,
            timeout,
        )
        .await;

        match result {
            Ok(outcome) => {
                state.latch.set(Ok(()));
                Ok(CoordinateOutcome::Served { size: outcome.size })
            }
            Err(err) => {
                state.latch.set(Err(err.to_string()));
                Err(err.into())
            }
        }
    }

    fn schedule_linger_removal(&self, key: DownloadKey) {
        let statuses = self.statuses.clone();
        let linger = self.linger;
        tokio::spawn(async move {
            tokio::time::sleep(linger).await;
            statuses.remove(&key);
        });
    }

    /// Serves `packages/<pkg>/<file>`, coalescing concurrent misses into a
    /// single upstream fetch.
    pub async fn coordinate(
        &self,
        ctx: &DownloadContext,
        pkg: &str,
        file: &str,
        writer: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<CoordinateOutcome, CoordinatorError> {
        let key = Self::store_key(pkg, file);

        if let Some(size) = self.try_serve_from_store(&key, writer).await? {
            return Ok(CoordinateOutcome::Served { size });
        }

        let download_key = DownloadKey {
            pkg: pkg.to_string(),
            file: file.to_string(),
        };

        let (state, is_leader) = match self.statuses.entry(download_key.clone()) {
            Entry::Vacant(v) => {
                let state = Arc::new(DownloadState {
                    latch: DownloadLatch::new(),
                });
                v.insert(state.clone());
                (state, true)
            }
            Entry::Occupied(o) => (o.get().clone(), false),
        };

        if is_leader {
            let result = self.run_leader(pkg, file, &key, writer, &state).await;
            self.schedule_linger_removal(download_key);
            return result;
        }

        match state.latch.wait(&ctx.cancellation).await {
            Ok(Ok(())) => {
                if let Some(size) = self.try_serve_from_store(&key, writer).await? {
                    Ok(CoordinateOutcome::Served { size })
                } else {
                    self.redirect_or_not_found(pkg, file).await
                }
            }
            Ok(Err(_leader_failure)) => self.redirect_or_not_found(pkg, file).await,
            Err(cancelled) => Err(cancelled.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{routing::get, Json, Router};
    use proxy_store::local::LocalContentStore;
    use proxy_upstream::{FileEntry, HttpUpstreamIndexClient, PackageFilesResponse};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    async fn spawn_index_and_file(
        hit_count: Arc<AtomicUsize>,
        body: &'static [u8],
    ) -> (Url, Url) {
        let file_app = Router::new().route(
            "/files/pkg-1.0.tar.gz",
            get(move || {
                let hit_count = hit_count.clone();
                async move {
                    hit_count.fetch_add(1, Ordering::SeqCst);
                    body
                }
            }),
        );
        let file_listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let file_addr = file_listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(file_listener, file_app).await.unwrap();
        });
        let file_url = Url::parse(&format!("http://{file_addr}/files/pkg-1.0.tar.gz")).unwrap();

        let file_url_for_index = file_url.clone();
        let index_app = Router::new().route(
            "/pkg/",
            get(move || {
                let file_url = file_url_for_index.clone();
                async move {
                    Json(PackageFilesResponse {
                        meta: Default::default(),
                        name: "pkg".to_string(),
                        files: vec![FileEntry {
                            filename: "pkg-1.0.tar.gz".to_string(),
                            url: file_url.to_string(),
                            hashes: Default::default(),
                            requires_python: None,
                            yanked: false,
                            yanked_reason: None,
                        }],
                    })
                }
            }),
        );
        let index_listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let index_addr = index_listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(index_listener, index_app).await.unwrap();
        });
        let index_url = Url::parse(&format!("http://{index_addr}/")).unwrap();

        (index_url, file_url)
    }

    async fn make_coordinator(index_url: Url) -> (DownloadCoordinator, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn StreamingContentStore> = Arc::new(
            LocalContentStore::open(dir.path().to_path_buf(), 0, None, Duration::from_secs(3600))
                .await
                .unwrap(),
        );
        let upstream: Arc<dyn UpstreamIndexClient> = Arc::new(HttpUpstreamIndexClient::new(index_url));
        let descriptor_cache = Arc::new(IndexMetadataCache::new(Duration::from_secs(60)));
        let http_client = reqwest_middleware::ClientBuilder::new(reqwest::Client::new()).build();
        let coordinator = DownloadCoordinator::new(
            store,
            upstream,
            descriptor_cache,
            http_client,
            Arc::new(BufferPool::default()),
            Duration::from_secs(30),
            Duration::from_millis(50),
        );
        (coordinator, dir)
    }

    #[tokio::test]
    async fn concurrent_requests_for_the_same_file_result_in_one_upstream_fetch() {
        static BODY: &[u8] = b"a small package archive, repeated, a small package archive";
        let hit_count = Arc::new(AtomicUsize::new(0));
        let (index_url, _file_url) = spawn_index_and_file(hit_count.clone(), BODY).await;
        let (coordinator, _dir) = make_coordinator(index_url).await;
        let coordinator = Arc::new(coordinator);

        let mut handles = Vec::new();
        for _ in 0..10 {
            let coordinator = coordinator.clone();
            handles.push(tokio::spawn(async move {
                let ctx = DownloadContext::default();
                let mut out = Vec::new();
                let outcome = coordinator
                    .coordinate(&ctx, "pkg", "pkg-1.0.tar.gz", &mut out)
                    .await
                    .unwrap();
                (outcome, out)
            }));
        }

        for handle in handles {
            let (outcome, out) = handle.await.unwrap();
            match outcome {
                CoordinateOutcome::Served { size } => assert_eq!(size, BODY.len() as u64),
                CoordinateOutcome::Redirect(_) => {
                    assert!(out.is_empty());
                }
            }
        }

        assert_eq!(hit_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn second_request_is_served_zero_copy_from_the_store() {
        static BODY: &[u8] = b"first download populates the store for the second request";
        let hit_count = Arc::new(AtomicUsize::new(0));
        let (index_url, _file_url) = spawn_index_and_file(hit_count.clone(), BODY).await;
        let (coordinator, _dir) = make_coordinator(index_url).await;

        let ctx = DownloadContext::default();
        let mut first = Vec::new();
        coordinator
            .coordinate(&ctx, "pkg", "pkg-1.0.tar.gz", &mut first)
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;

        let mut second = Vec::new();
        let outcome = coordinator
            .coordinate(&ctx, "pkg", "pkg-1.0.tar.gz", &mut second)
            .await
            .unwrap();

        assert!(matches!(outcome, CoordinateOutcome::Served { .. }));
        assert_eq!(second, BODY);
        assert_eq!(hit_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unknown_file_is_not_found() {
        let hit_count = Arc::new(AtomicUsize::new(0));
        let (index_url, _file_url) = spawn_index_and_file(hit_count, b"unused").await;
        let (coordinator, _dir) = make_coordinator(index_url).await;

        let ctx = DownloadContext::default();
        let mut out = Vec::new();
        let err = coordinator
            .coordinate(&ctx, "pkg", "does-not-exist.tar.gz", &mut out)
            .await
            .unwrap_err();

        assert!(matches!(err, CoordinatorError::NotFound(_)));
    }
}
