//! Object-store-backed [`ContentStore`], for any backend `opendal` supports
//! (S3-compatible object storage is the one enabled by the workspace's
//! `opendal` feature set).
//!
//! Concurrent `exists`/`stat`/`list` calls for the same key are coalesced
//! through [`proxy_singleflight::SingleFlight`] so a burst of simultaneous
//! requests for the same package index entry results in one round trip to
//! the backend rather than one per request.

use std::time::Duration;

use async_trait::async_trait;
use futures::TryStreamExt;
use opendal::Operator;
use proxy_singleflight::{SingleFlight, SingleFlightError};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use crate::{bufpool::BufferPool, BoxAsyncRead, ContentStore, ContentStoreError, ObjectInfo, StreamingContentStore};

/// Above this size, `put`/`streaming_put` use `opendal`'s multipart writer
/// instead of a single buffered write.
const MULTIPART_THRESHOLD: u64 = 8 * 1024 * 1024;

fn map_opendal_err(err: opendal::Error, key: &str) -> ContentStoreError {
    if err.kind() == opendal::ErrorKind::NotFound {
        ContentStoreError::NotFound(key.to_string())
    } else {
        ContentStoreError::Backend(err)
    }
}

fn to_object_info(key: &str, meta: &opendal::Metadata) -> ObjectInfo {
    ObjectInfo {
        key: key.to_string(),
        size: meta.content_length(),
        content_type: meta
            .content_type()
            .unwrap_or("application/octet-stream")
            .to_string(),
        last_modified: meta
            .last_modified()
            .map(|dt| std::time::UNIX_EPOCH + Duration::from_secs(dt.timestamp().max(0) as u64))
            .unwrap_or_else(std::time::SystemTime::now),
        etag: meta.etag().unwrap_or_default().to_string(),
    }
}

/// Content store backed by an `opendal::Operator`.
pub struct ObjectStoreContentStore {
    op: Operator,
    stat_coalescer: SingleFlight<String, ObjectInfo>,
    list_coalescer: SingleFlight<String, Vec<ObjectInfo>>,
    buffers: BufferPool,
}

impl ObjectStoreContentStore {
    /// Wraps an already-configured `opendal::Operator`.
    pub fn new(op: Operator) -> Self {
        Self {
            op,
            stat_coalescer: SingleFlight::new(),
            list_coalescer: SingleFlight::new(),
            buffers: BufferPool::default(),
        }
    }
}

#[async_trait]
impl ContentStore for ObjectStoreContentStore {
    async fn exists(&self, key: &str) -> Result<bool, ContentStoreError> {
        match self.stat(key).await {
            Ok(_) => Ok(true),
            Err(ContentStoreError::NotFound(_)) => Ok(false),
            Err(err) => Err(err),
        }
    }

    async fn stat(&self, key: &str) -> Result<ObjectInfo, ContentStoreError> {
        let op = self.op.clone();
        let key_owned = key.to_string();
        self.stat_coalescer
            .do_call(key.to_string(), move || {
                let op = op.clone();
                let key = key_owned.clone();
                async move {
                    let meta = op.stat(&key).await.map_err(|err| map_opendal_err(err, &key))?;
                    Ok::<_, ContentStoreError>(to_object_info(&key, &meta))
                }
            })
            .await
            .map_err(|err| match err {
                SingleFlightError::Call(e) => e,
                SingleFlightError::CoalescedCallFailed => {
                    ContentStoreError::Backend(opendal::Error::new(
                        opendal::ErrorKind::Unexpected,
                        "coalesced stat call failed",
                    ))
                }
            })
    }

    async fn get(&self, key: &str) -> Result<(BoxAsyncRead, ObjectInfo), ContentStoreError> {
        let info = self.stat(key).await?;
        let reader = self
            .op
            .reader(key)
            .await
            .map_err(|err| map_opendal_err(err, key))?
            .into_futures_async_read(0..info.size)
            .await
            .map_err(|err| map_opendal_err(err, key))?;
        Ok((Box::new(tokio_util::compat::FuturesAsyncReadCompatExt::compat(reader)) as BoxAsyncRead, info))
    }

    async fn get_range(
        &self,
        key: &str,
        offset: u64,
        length: u64,
    ) -> Result<(BoxAsyncRead, ObjectInfo), ContentStoreError> {
        let info = self.stat(key).await?;
        let reader = self
            .op
            .reader(key)
            .await
            .map_err(|err| map_opendal_err(err, key))?
            .into_futures_async_read(offset..offset + length)
            .await
            .map_err(|err| map_opendal_err(err, key))?;
        Ok((Box::new(tokio_util::compat::FuturesAsyncReadCompatExt::compat(reader)) as BoxAsyncRead, info))
    }

    async fn put(
        &self,
        key: &str,
        reader: BoxAsyncRead,
        size_hint: Option<u64>,
        content_type: &str,
    ) -> Result<ObjectInfo, ContentStoreError> {
        self.streaming_put(key, reader, size_hint, content_type).await
    }

    async fn delete(&self, key: &str) -> Result<(), ContentStoreError> {
        match self.op.delete(key).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == opendal::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(ContentStoreError::Backend(err)),
        }
    }

    async fn list(
        &self,
        prefix: &str,
        max: usize,
        start_after: Option<&str>,
    ) -> Result<Vec<ObjectInfo>, ContentStoreError> {
        let coalesce_key = format!("{prefix}\0{max}\0{}", start_after.unwrap_or(""));
        let op = self.op.clone();
        let prefix_owned = prefix.to_string();
        let start_after_owned = start_after.map(str::to_owned);
        self.list_coalescer
            .do_call(coalesce_key, move || {
                let op = op.clone();
                let prefix = prefix_owned.clone();
                let start_after = start_after_owned.clone();
                async move {
                    let mut lister = op
                        .lister_with(&prefix)
                        .recursive(true)
                        .await
                        .map_err(ContentStoreError::Backend)?;
                    let mut out = Vec::new();
                    while let Some(entry) = lister
                        .try_next()
                        .await
                        .map_err(ContentStoreError::Backend)?
                    {
                        if entry.metadata().is_dir() {
                            continue;
                        }
                        let key = entry.path().to_string();
                        if let Some(after) = &start_after {
                            if key.as_str() <= after.as_str() {
                                continue;
                            }
                        }
                        out.push(to_object_info(&key, entry.metadata()));
                    }
                    out.sort_by(|a, b| a.key.cmp(&b.key));
                    out.truncate(max);
                    Ok::<_, ContentStoreError>(out)
                }
            })
            .await
            .map_err(|err| match err {
                SingleFlightError::Call(e) => e,
                SingleFlightError::CoalescedCallFailed => {
                    ContentStoreError::Backend(opendal::Error::new(
                        opendal::ErrorKind::Unexpected,
                        "coalesced list call failed",
                    ))
                }
            })
    }

    async fn presigned_url(&self, key: &str, ttl: Duration) -> Result<url::Url, ContentStoreError> {
        let request = self
            .op
            .presign_read(key, ttl)
            .await
            .map_err(|err| map_opendal_err(err, key))?;
        url::Url::parse(request.uri().to_string().as_str())
            .map_err(|err| ContentStoreError::Unsupported(err.to_string()))
    }

    async fn close(&self) -> Result<(), ContentStoreError> {
        Ok(())
    }
}

#[async_trait]
impl StreamingContentStore for ObjectStoreContentStore {
    async fn streaming_get(
        &self,
        key: &str,
        writer: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<ObjectInfo, ContentStoreError> {
        let (mut reader, info) = self.get(key).await?;
        let mut buf = self.buffers.acquire();
        loop {
            let n = tokio::io::AsyncReadExt::read(&mut reader, &mut buf).await?;
            if n == 0 {
                break;
            }
            writer.write_all(&buf[..n]).await?;
        }
        Ok(info)
    }

    async fn streaming_put(
        &self,
        key: &str,
        mut reader: BoxAsyncRead,
        size_hint: Option<u64>,
        content_type: &str,
    ) -> Result<ObjectInfo, ContentStoreError> {
        let mut writer = self
            .op
            .writer_with(key)
            .content_type(content_type)
            .concurrent(if size_hint.unwrap_or(u64::MAX) > MULTIPART_THRESHOLD { 4 } else { 1 })
            .await
            .map_err(ContentStoreError::Backend)?;

        let mut total: u64 = 0;
        loop {
            let mut buf = self.buffers.acquire();
            let n = read_some(&mut reader, &mut buf).await?;
            if n == 0 {
                break;
            }
            total += n as u64;
            writer
                .write(bytes::Bytes::copy_from_slice(&buf[..n]))
                .await
                .map_err(ContentStoreError::Backend)?;
        }
        writer.close().await.map_err(ContentStoreError::Backend)?;

        Ok(ObjectInfo {
            key: key.to_string(),
            size: total,
            content_type: content_type.to_string(),
            last_modified: std::time::SystemTime::now(),
            etag: String::new(),
        })
    }

    fn file_path(&self, _key: &str) -> Option<std::path::PathBuf> {
        None
    }

    fn supports_zero_copy(&self) -> bool {
        false
    }
}

async fn read_some(reader: &mut BoxAsyncRead, buf: &mut [u8]) -> Result<usize, ContentStoreError> {
    use tokio::io::AsyncReadExt;
    Ok(reader.read(buf).await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use opendal::services::Memory;

    fn memory_store() -> ObjectStoreContentStore {
        let op = Operator::new(Memory::default()).unwrap().finish();
        ObjectStoreContentStore::new(op)
    }

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let store = memory_store();
        let reader: BoxAsyncRead = Box::new(std::io::Cursor::new(b"hello".to_vec()));
        store.put("pkg/a-1.0.tar.gz", reader, Some(5), "application/gzip").await.unwrap();

        let (mut read, info) = store.get("pkg/a-1.0.tar.gz").await.unwrap();
        let mut buf = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut read, &mut buf).await.unwrap();
        assert_eq!(buf, b"hello");
        assert_eq!(info.size, 5);
    }

    #[tokio::test]
    async fn delete_of_missing_key_is_not_an_error() {
        let store = memory_store();
        store.delete("nope").await.unwrap();
    }

    #[tokio::test]
    async fn list_respects_prefix_and_start_after() {
        let store = memory_store();
        for key in ["pkg/a", "pkg/b", "pkg/c"] {
            let reader: BoxAsyncRead = Box::new(std::io::Cursor::new(b"x".to_vec()));
            store.put(key, reader, Some(1), "text/plain").await.unwrap();
        }
        let all = store.list("pkg", 10, None).await.unwrap();
        assert_eq!(all.len(), 3);
        let after_a = store.list("pkg", 10, Some("pkg/a")).await.unwrap();
        let keys: Vec<_> = after_a.iter().map(|o| o.key.clone()).collect();
        assert_eq!(keys, vec!["pkg/b", "pkg/c"]);
    }

    #[test]
    fn does_not_support_zero_copy() {
        let store = memory_store();
        assert!(!store.supports_zero_copy());
        assert!(store.file_path("anything").is_none());
    }
}
