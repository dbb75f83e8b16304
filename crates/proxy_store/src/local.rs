//! Local filesystem [`ContentStore`] backend with LRU+TTL eviction.
//!
//! Objects are stored at `base_dir/<key>`, where `key` is the caller-supplied
//! slash-delimited path: this store is key-addressed, not content-addressed,
//! since the key space is caller-defined package paths, not content digests.
//! The write path writes to a temp file in a sibling `.tmp` directory,
//! hashing while writing, then an atomic rename into place so readers never
//! observe a partial file. A `put` to an existing key is expected to
//! overwrite it, so the rename uses `persist`, not `persist_noclobber`.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, SystemTime},
};

use async_trait::async_trait;
use fs_err::tokio as fs;
use rattler_digest::{HashingWriter, Sha256, Sha256Hash};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWrite, AsyncWriteExt};

use crate::{
    bufpool::BufferPool, lru::LruController, BoxAsyncRead, ContentStore, ContentStoreError,
    ObjectInfo, StreamingContentStore,
};

fn temp_dir(root: &Path) -> PathBuf {
    root.join(".tmp")
}

fn hash_to_etag(hash: &Sha256Hash) -> String {
    format!("{hash:x}")
}

/// A local-filesystem content store rooted at `base_dir`.
pub struct LocalContentStore {
    base_dir: PathBuf,
    lru: LruController,
    buffers: Arc<BufferPool>,
    eviction_worker: tokio::task::JoinHandle<()>,
}

impl Drop for LocalContentStore {
    fn drop(&mut self) {
        self.eviction_worker.abort();
    }
}

impl LocalContentStore {
    /// Opens (and, if necessary, creates) a local content store, rebuilding
    /// LRU state from an on-disk scan and starting the eviction worker.
    pub async fn open(
        base_dir: PathBuf,
        max_size: u64,
        ttl: Option<Duration>,
        eviction_period: Duration,
    ) -> std::io::Result<Self> {
        fs::create_dir_all(&base_dir).await?;
        let lru = LruController::rebuild(base_dir.clone(), max_size, ttl).await;
        let eviction_worker = lru.spawn_eviction_worker(eviction_period);
        Ok(Self {
            base_dir,
            lru,
            buffers: Arc::new(BufferPool::default()),
            eviction_worker,
        })
    }

    /// Returns a handle to the LRU controller, for reporting usage stats
    /// (e.g. on a `/health` endpoint) outside the `ContentStore` trait.
    pub fn lru_controller(&self) -> &LruController {
        &self.lru
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.base_dir.join(key)
    }

    fn relative_key(&self, path: &Path) -> Option<String> {
        path.strip_prefix(&self.base_dir)
            .ok()
            .map(|rel| rel.to_string_lossy().replace(std::path::MAIN_SEPARATOR, "/"))
    }

    async fn stat_at(&self, key: &str, path: &Path) -> Result<ObjectInfo, ContentStoreError> {
        let metadata = fs::metadata(path)
            .await
            .map_err(|err| map_not_found(err, key))?;
        let etag = fs::read_to_string(content_type_sidecar(path))
            .await
            .ok()
            .and_then(|s| s.lines().next().map(str::to_owned))
            .unwrap_or_default();
        let content_type = fs::read_to_string(content_type_sidecar(path))
            .await
            .ok()
            .and_then(|s| s.lines().nth(1).map(str::to_owned))
            .unwrap_or_else(|| "application/octet-stream".to_string());
        Ok(ObjectInfo {
            key: key.to_string(),
            size: metadata.len(),
            content_type,
            last_modified: metadata.modified().unwrap_or(SystemTime::now()),
            etag,
        })
    }
}

fn content_type_sidecar(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_owned();
    os.push(".meta");
    PathBuf::from(os)
}

fn map_not_found(err: std::io::Error, key: &str) -> ContentStoreError {
    if err.kind() == std::io::ErrorKind::NotFound {
        ContentStoreError::NotFound(key.to_string())
    } else {
        ContentStoreError::Io(err)
    }
}

async fn atomic_write(
    base_dir: &Path,
    key: &str,
    mut reader: BoxAsyncRead,
    content_type: &str,
) -> Result<(PathBuf, ObjectInfo, Sha256Hash), ContentStoreError> {
    let final_path = base_dir.join(key);
    let parent = final_path
        .parent()
        .expect("key always has a parent under base_dir")
        .to_path_buf();
    fs::create_dir_all(&parent).await?;

    let tmp_dir = temp_dir(base_dir);
    fs::create_dir_all(&tmp_dir).await?;

    let builder = tempfile::Builder::new();
    let temp_file = builder.tempfile_in(&tmp_dir)?;
    let (std_file, temp_path) = temp_file.into_parts();
    let async_file = tokio::fs::File::from_std(std_file);
    let mut writer = HashingWriter::<_, Sha256>::new(async_file);

    let written = tokio::io::copy(&mut reader, &mut writer).await?;
    writer.flush().await?;
    let (file, hash) = writer.finalize();
    drop(file);

    match temp_path.persist(&final_path) {
        Ok(()) => {}
        Err(err) => return Err(ContentStoreError::Io(err.error)),
    }

    fs::write(
        content_type_sidecar(&final_path),
        format!("{}\n{}", hash_to_etag(&hash), content_type),
    )
    .await?;

    let info = ObjectInfo {
        key: key.to_string(),
        size: written,
        content_type: content_type.to_string(),
        last_modified: SystemTime::now(),
        etag: hash_to_etag(&hash),
    };
    Ok((final_path, info, hash))
}

#[async_trait]
impl ContentStore for LocalContentStore {
    async fn exists(&self, key: &str) -> Result<bool, ContentStoreError> {
        Ok(fs::metadata(self.path_for(key)).await.is_ok())
    }

    async fn stat(&self, key: &str) -> Result<ObjectInfo, ContentStoreError> {
        let path = self.path_for(key);
        self.stat_at(key, &path).await
    }

    async fn get(&self, key: &str) -> Result<(BoxAsyncRead, ObjectInfo), ContentStoreError> {
        let path = self.path_for(key);
        let info = self.stat_at(key, &path).await?;
        self.lru.record_access(key, info.size, path.clone());
        let file = fs::File::open(&path)
            .await
            .map_err(|err| map_not_found(err, key))?;
        Ok((Box::new(file) as BoxAsyncRead, info))
    }

    async fn get_range(
        &self,
        key: &str,
        offset: u64,
        length: u64,
    ) -> Result<(BoxAsyncRead, ObjectInfo), ContentStoreError> {
        let path = self.path_for(key);
        let info = self.stat_at(key, &path).await?;
        self.lru.record_access(key, info.size, path.clone());
        let mut file = fs::File::open(&path)
            .await
            .map_err(|err| map_not_found(err, key))?;
        file.seek(std::io::SeekFrom::Start(offset)).await?;
        let limited = AsyncReadExt::take(file, length);
        Ok((Box::new(limited) as BoxAsyncRead, info))
    }

    async fn put(
        &self,
        key: &str,
        reader: BoxAsyncRead,
        _size_hint: Option<u64>,
        content_type: &str,
    ) -> Result<ObjectInfo, ContentStoreError> {
        let (path, info, _hash) = atomic_write(&self.base_dir, key, reader, content_type).await?;
        self.lru.record_access(key, info.size, path);
        Ok(info)
    }

    async fn delete(&self, key: &str) -> Result<(), ContentStoreError> {
        let path = self.path_for(key);
        match fs::remove_file(&path).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(ContentStoreError::Io(err)),
        }
        let _ = fs::remove_file(content_type_sidecar(&path)).await;
        self.lru.record_delete(key);
        Ok(())
    }

    async fn list(
        &self,
        prefix: &str,
        max: usize,
        start_after: Option<&str>,
    ) -> Result<Vec<ObjectInfo>, ContentStoreError> {
        let root = self.path_for(prefix);
        let mut out = Vec::new();
        let mut stack = vec![root];
        let mut found: Vec<(String, PathBuf)> = Vec::new();
        while let Some(dir) = stack.pop() {
            let mut read_dir = match fs::read_dir(&dir).await {
                Ok(rd) => rd,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                Err(err) => return Err(ContentStoreError::Io(err)),
            };
            while let Some(entry) = read_dir.next_entry().await.map_err(ContentStoreError::Io)? {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) == Some("meta") {
                    continue;
                }
                let file_type = entry.file_type().await.map_err(ContentStoreError::Io)?;
                if file_type.is_dir() {
                    stack.push(path);
                } else if file_type.is_file() {
                    if let Some(key) = self.relative_key(&path) {
                        found.push((key, path));
                    }
                }
            }
        }
        found.sort_by(|a, b| a.0.cmp(&b.0));
        for (key, path) in found {
            if let Some(after) = start_after {
                if key.as_str() <= after {
                    continue;
                }
            }
            if out.len() >= max {
                break;
            }
            out.push(self.stat_at(&key, &path).await?);
        }
        Ok(out)
    }

    async fn presigned_url(
        &self,
        key: &str,
        _ttl: Duration,
    ) -> Result<url::Url, ContentStoreError> {
        let path = self.path_for(key);
        url::Url::from_file_path(&path)
            .map_err(|()| ContentStoreError::Unsupported(format!("cannot form file:// URL for {key}")))
    }

    async fn close(&self) -> Result<(), ContentStoreError> {
        Ok(())
    }
}

#[async_trait]
impl StreamingContentStore for LocalContentStore {
    async fn streaming_get(
        &self,
        key: &str,
        writer: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<ObjectInfo, ContentStoreError> {
        let path = self.path_for(key);
        let info = self.stat_at(key, &path).await?;
        self.lru.record_access(key, info.size, path.clone());

        let mut file = fs::File::open(&path)
            .await
            .map_err(|err| map_not_found(err, key))?;
        let mut buf = self.buffers.acquire();
        loop {
            let n = file.read(&mut buf).await?;
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
        reader: BoxAsyncRead,
        size_hint: Option<u64>,
        content_type: &str,
    ) -> Result<ObjectInfo, ContentStoreError> {
        self.put(key, reader, size_hint, content_type).await
    }

    fn file_path(&self, key: &str) -> Option<PathBuf> {
        Some(self.path_for(key))
    }

    fn supports_zero_copy(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    async fn store(dir: &Path) -> LocalContentStore {
        LocalContentStore::open(dir.to_path_buf(), 0, None, Duration::from_secs(3600))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn put_then_get_round_trips_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path()).await;
        let reader: BoxAsyncRead = Box::new(std::io::Cursor::new(b"hello world".to_vec()));
        store
            .put("pkg/file-1.0.tar.gz", reader, Some(11), "application/gzip")
            .await
            .unwrap();

        let (mut read, info) = store.get("pkg/file-1.0.tar.gz").await.unwrap();
        let mut buf = Vec::new();
        read.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"hello world");
        assert_eq!(info.size, 11);
        assert_eq!(info.content_type, "application/gzip");
    }

    #[tokio::test]
    async fn get_range_returns_only_requested_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path()).await;
        let reader: BoxAsyncRead = Box::new(std::io::Cursor::new(b"0123456789".to_vec()));
        store.put("f", reader, Some(10), "text/plain").await.unwrap();

        let (mut read, _info) = store.get_range("f", 3, 4).await.unwrap();
        let mut buf = Vec::new();
        read.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"3456");
    }

    #[tokio::test]
    async fn delete_of_missing_key_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path()).await;
        store.delete("nope").await.unwrap();
    }

    #[tokio::test]
    async fn list_returns_keys_in_sorted_order_after_start_after() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path()).await;
        for key in ["pkg/a-1.tar.gz", "pkg/c-1.tar.gz", "pkg/b-1.tar.gz"] {
            let reader: BoxAsyncRead = Box::new(std::io::Cursor::new(b"x".to_vec()));
            store.put(key, reader, Some(1), "text/plain").await.unwrap();
        }

        let all = store.list("pkg", 10, None).await.unwrap();
        let keys: Vec<_> = all.iter().map(|o| o.key.clone()).collect();
        assert_eq!(keys, vec!["pkg/a-1.tar.gz", "pkg/b-1.tar.gz", "pkg/c-1.tar.gz"]);

        let after_a = store.list("pkg", 10, Some("pkg/a-1.tar.gz")).await.unwrap();
        let keys: Vec<_> = after_a.iter().map(|o| o.key.clone()).collect();
        assert_eq!(keys, vec!["pkg/b-1.tar.gz", "pkg/c-1.tar.gz"]);
    }

    #[tokio::test]
    async fn streaming_get_writes_all_bytes_via_buffered_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path()).await;
        let reader: BoxAsyncRead = Box::new(std::io::Cursor::new(vec![7u8; 200_000]));
        store.put("big", reader, Some(200_000), "application/octet-stream").await.unwrap();

        let mut out = Vec::new();
        let info = store.streaming_get("big", &mut out).await.unwrap();
        assert_eq!(info.size, 200_000);
        assert_eq!(out.len(), 200_000);
    }

    #[tokio::test]
    async fn presigned_url_is_a_file_url() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path()).await;
        let reader: BoxAsyncRead = Box::new(std::io::Cursor::new(b"x".to_vec()));
        store.put("f", reader, Some(1), "text/plain").await.unwrap();
        let url = store.presigned_url("f", Duration::from_secs(60)).await.unwrap();
        assert_eq!(url.scheme(), "file");
    }
}
