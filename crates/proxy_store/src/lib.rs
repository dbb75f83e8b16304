//! Persistent content store for distribution files.
//!
//! Two backends satisfy the same [`ContentStore`] contract: [`local`] (a
//! local filesystem directory with LRU+TTL eviction, see [`lru`]) and
//! [`object_store`] (any `opendal`-backed object store). Callers that need
//! zero-copy serving or direct streaming probe for the optional
//! [`StreamingContentStore`] extension rather than downcasting to a
//! concrete type.

pub mod bufpool;
pub mod local;
pub mod lru;
pub mod object_store;

use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use url::Url;

/// Errors a [`ContentStore`] implementation can return.
#[derive(Debug, thiserror::Error)]
pub enum ContentStoreError {
    /// The requested key does not exist in the store.
    #[error("key not found: {0}")]
    NotFound(String),

    /// An I/O fault while reading, writing, or listing.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The object-store backend reported a fault.
    #[error("object store error: {0}")]
    Backend(#[from] opendal::Error),

    /// The operation is not supported by this backend (e.g. `file_path` on
    /// an object-store backend).
    #[error("operation not supported by this backend: {0}")]
    Unsupported(String),
}

/// Metadata describing a stored object.
#[derive(Debug, Clone)]
pub struct ObjectInfo {
    /// The key the object is stored under.
    pub key: String,
    /// Size in bytes.
    pub size: u64,
    /// MIME content type, as supplied at `put` time.
    pub content_type: String,
    /// Last-modified timestamp.
    pub last_modified: SystemTime,
    /// Opaque entity tag. For the local backend this is derived from the
    /// integrity digest computed during `put`; for the object-store backend
    /// it is whatever the backend reports.
    pub etag: String,
}

/// A boxed, owned, send-able async reader. Used as the stream type returned
/// by `get`/`get_range` so callers don't need to know the concrete backend.
pub type BoxAsyncRead = Box<dyn AsyncRead + Send + Unpin>;

/// Stable blob storage keyed by an opaque slash-delimited path
/// (`packages/<pkg>/<file>`).
///
/// `delete` of a missing key is not an error (idempotent). Missing keys
/// otherwise surface as [`ContentStoreError::NotFound`].
#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Returns whether `key` exists in the store.
    async fn exists(&self, key: &str) -> Result<bool, ContentStoreError>;

    /// Returns metadata for `key` without reading its bytes.
    async fn stat(&self, key: &str) -> Result<ObjectInfo, ContentStoreError>;

    /// Opens `key` for reading in full.
    async fn get(&self, key: &str) -> Result<(BoxAsyncRead, ObjectInfo), ContentStoreError>;

    /// Opens a byte range `[offset, offset+length)` of `key` for reading.
    async fn get_range(
        &self,
        key: &str,
        offset: u64,
        length: u64,
    ) -> Result<(BoxAsyncRead, ObjectInfo), ContentStoreError>;

    /// Writes `reader` to `key`. `size_hint` may be `None` when the caller
    /// doesn't know the length up front (e.g. chunked upstream transfer).
    /// Readers never observe a partially-written object.
    async fn put(
        &self,
        key: &str,
        reader: BoxAsyncRead,
        size_hint: Option<u64>,
        content_type: &str,
    ) -> Result<ObjectInfo, ContentStoreError>;

    /// Deletes `key`. Deleting a missing key succeeds.
    async fn delete(&self, key: &str) -> Result<(), ContentStoreError>;

    /// Lists objects whose key starts with `prefix`, recursively, in key
    /// order, starting strictly after `start_after` when given, capped at
    /// `max` results.
    async fn list(
        &self,
        prefix: &str,
        max: usize,
        start_after: Option<&str>,
    ) -> Result<Vec<ObjectInfo>, ContentStoreError>;

    /// Returns a URL a client can use to fetch `key` directly, valid for
    /// approximately `ttl`.
    async fn presigned_url(&self, key: &str, ttl: Duration) -> Result<Url, ContentStoreError>;

    /// Releases any resources held by the store (connection pools, etc).
    async fn close(&self) -> Result<(), ContentStoreError>;
}

/// Optional streaming extension. Local backends stream bytes straight from
/// the filesystem without ever buffering a whole object in memory;
/// object-store backends implement the same interface with `file_path`
/// returning `None` and `supports_zero_copy` returning false.
#[async_trait]
pub trait StreamingContentStore: ContentStore {
    /// Streams `key` directly into `writer` without buffering the whole
    /// object in memory.
    async fn streaming_get(
        &self,
        key: &str,
        writer: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<ObjectInfo, ContentStoreError>;

    /// Streams `reader` into `key` without buffering the whole object in
    /// memory.
    async fn streaming_put(
        &self,
        key: &str,
        reader: BoxAsyncRead,
        size_hint: Option<u64>,
        content_type: &str,
    ) -> Result<ObjectInfo, ContentStoreError>;

    /// Returns the absolute filesystem path for `key`, if this backend
    /// exposes one. Only meaningful when [`Self::supports_zero_copy`] is
    /// true.
    fn file_path(&self, key: &str) -> Option<std::path::PathBuf>;

    /// Whether this backend exposes a local file path for `key`, so a
    /// caller can stream directly from disk instead of going through this
    /// store's own read path.
    fn supports_zero_copy(&self) -> bool;
}
