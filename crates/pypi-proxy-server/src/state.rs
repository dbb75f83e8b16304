//! Shared server state: the wired-together content store, caches, and
//! download coordinator consumed by every route handler.

use std::sync::Arc;

use opendal::{
    services::{S3Config, S3},
    Operator,
};
use proxy_cache::{index::IndexMetadataCache, response::ResponseCache};
use proxy_config::Config;
use proxy_download::DownloadCoordinator;
use proxy_singleflight::SingleFlight;
use proxy_store::{local::LocalContentStore, lru::LruController, object_store::ObjectStoreContentStore, StreamingContentStore};
use proxy_upstream::{ArtifactDescriptor, HttpUpstreamIndexClient, UpstreamIndexClient};
use reqwest_retry::{policies::ExponentialBackoff, RetryTransientMiddleware};

/// Parses an `s3://bucket/prefix` URI into an `opendal` S3 backend. The
/// bucket's endpoint/region/credentials are expected to come from the
/// environment, matching how `rattler_index::index_s3` lets the AWS SDK's
/// usual environment-variable resolution apply.
fn build_s3_operator(uri: &str) -> anyhow::Result<Operator> {
    let url = url::Url::parse(uri)?;
    let bucket = url
        .host_str()
        .ok_or_else(|| anyhow::anyhow!("no bucket in object store URI: {uri}"))?
        .to_string();

    let mut config = S3Config::default();
    config.bucket = bucket;
    config.root = Some(url.path().to_string());
    let builder: S3 = config.into_builder();
    Ok(Operator::new(builder)?.finish())
}

/// Everything route handlers need, built once at startup and shared behind
/// an `Arc` clone per request (axum's `State` extractor).
pub struct AppState {
    pub store: Arc<dyn StreamingContentStore>,
    pub lru: Option<LruController>,
    pub upstream: Arc<dyn UpstreamIndexClient>,
    pub package_list_cache: Arc<IndexMetadataCache<Vec<String>>>,
    pub package_list_singleflight: SingleFlight<(), Arc<Vec<String>>>,
    pub package_files_cache: Arc<IndexMetadataCache<Vec<ArtifactDescriptor>>>,
    pub package_files_singleflight: SingleFlight<String, Arc<Vec<ArtifactDescriptor>>>,
    pub response_cache: Arc<ResponseCache>,
    pub coordinator: Arc<DownloadCoordinator>,
    pub config: Config,
}

impl AppState {
    pub async fn build(config: Config) -> anyhow::Result<Self> {
        let (store, lru): (Arc<dyn StreamingContentStore>, Option<LruController>) =
            if let Some(uri) = &config.object_store_uri {
                let op = build_s3_operator(uri)?;
                (Arc::new(ObjectStoreContentStore::new(op)), None)
            } else {
                // No age-based eviction: the only configured budget is a
                // byte limit, so objects are evicted by LRU pressure only.
                let local = LocalContentStore::open(
                    config.cache_dir.clone(),
                    config.cache_max_size,
                    None,
                    config.eviction_period,
                )
                .await?;
                let lru = local.lru_controller().clone();
                (Arc::new(local), Some(lru))
            };

        let inner_client = reqwest::Client::builder().build()?;
        let http_client = reqwest_middleware::ClientBuilder::new(inner_client)
            .with(RetryTransientMiddleware::new_with_policy(
                ExponentialBackoff::builder().build_with_max_retries(3),
            ))
            .build();

        let upstream: Arc<dyn UpstreamIndexClient> = Arc::new(HttpUpstreamIndexClient::with_client(
            config.upstream_index_url.clone(),
            http_client.clone(),
        ));

        let package_files_cache = Arc::new(IndexMetadataCache::new(config.index_ttl));
        let response_cache = Arc::new(ResponseCache::new(config.response_cache_max_bytes, config.index_ttl));

        let coordinator = Arc::new(DownloadCoordinator::new(
            store.clone(),
            upstream.clone(),
            package_files_cache.clone(),
            http_client,
            Arc::new(proxy_store::bufpool::BufferPool::default()),
            config.default_download_timeout,
            config.coordinator_linger,
        ));

        Ok(Self {
            store,
            lru,
            upstream,
            package_list_cache: Arc::new(IndexMetadataCache::new(config.index_ttl)),
            package_list_singleflight: SingleFlight::new(),
            package_files_cache,
            package_files_singleflight: SingleFlight::new(),
            response_cache,
            coordinator,
            config,
        })
    }
}
