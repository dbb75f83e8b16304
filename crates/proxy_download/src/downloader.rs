//! Streaming downloader: fetches an upstream URL, tees the response body
//! to the client and to the content store simultaneously, and computes an
//! integrity digest over the bytes delivered to the client.

use std::{sync::Arc, time::Duration};

use proxy_store::{bufpool::BufferPool, BoxAsyncRead, ContentStore};
use rattler_digest::{HashingWriter, Sha256};
use reqwest_middleware::ClientWithMiddleware;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::io::StreamReader;
use url::Url;

/// Outcome of a completed (or partially completed) download.
#[derive(Debug, Clone)]
pub struct DownloadOutcome {
    pub size: u64,
    pub content_type: String,
    /// Quoted hex digest, e.g. `"<sha256 hex>"`.
    pub etag: String,
    /// Set when the client received every byte but the content-store
    /// insert failed. The call is not considered a failure in this case.
    pub storage_error: Option<String>,
}

/// Errors that abort the whole download (the client did not receive a
/// complete, correct body).
#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error("upstream request failed: {0}")]
    Request(#[from] reqwest_middleware::Error),

    #[error("upstream returned status {status}")]
    Upstream { status: u16 },

    #[error("error reading upstream response body: {0}")]
    Read(std::io::Error),

    #[error("error writing to client: {0}")]
    ClientWrite(std::io::Error),
}

fn content_type_from_headers(headers: &reqwest::header::HeaderMap) -> String {
    headers
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/octet-stream")
        .to_string()
}

/// Fetches `url`, writing every byte to `writer` (the client response) and,
/// concurrently, to `store` under `store_key`. `timeout` bounds the whole
/// request (computed by H, applied as the request deadline).
pub async fn download_and_stream(
    client: &ClientWithMiddleware,
    buffers: &BufferPool,
    url: &Url,
    store: Arc<dyn ContentStore>,
    store_key: &str,
    writer: &mut (dyn AsyncWrite + Send + Unpin),
    timeout: Duration,
) -> Result<DownloadOutcome, DownloadError> {
    let response = client.get(url.clone()).timeout(timeout).send().await?;

    if !response.status().is_success() {
        return Err(DownloadError::Upstream {
            status: response.status().as_u16(),
        });
    }

    let content_type = content_type_from_headers(response.headers());
    let content_length = response.content_length().map(|v| v as i64).unwrap_or(-1);

    let (pipe_writer, pipe_reader) = tokio::io::duplex(64 * 1024);
    let store_key_owned = store_key.to_string();
    let content_type_for_storage = content_type.clone();
    let storage_task = tokio::spawn(async move {
        let reader: BoxAsyncRead = Box::new(pipe_reader);
        store
            .put(
                &store_key_owned,
                reader,
                if content_length >= 0 {
                    Some(content_length as u64)
                } else {
                    None
                },
                &content_type_for_storage,
            )
            .await
    });

    let mut body = StreamReader::new(
        response
            .bytes_stream()
            .map_err(|err| std::io::Error::other(err)),
    );
    let mut digest_writer = HashingWriter::<_, Sha256>::new(tokio::io::sink());
    let mut pipe_writer = pipe_writer;
    let mut total: u64 = 0;

    let copy_result = copy_fan_out(
        &mut body,
        writer,
        &mut pipe_writer,
        &mut digest_writer,
        buffers,
        &mut total,
    )
    .await;

    // Close the pipe on every exit path so the storage task observes EOF
    // promptly, whether or not the client copy succeeded.
    drop(pipe_writer);

    let storage_result = storage_task.await;
    copy_result?;

    let (_, hash) = digest_writer.finalize();
    let etag = format!("\"{hash:x}\"");

    let storage_error = match storage_result {
        Ok(Ok(_info)) => None,
        Ok(Err(err)) => Some(err.to_string()),
        Err(join_err) => Some(join_err.to_string()),
    };

    Ok(DownloadOutcome {
        size: total,
        content_type,
        etag,
        storage_error,
    })
}

/// Copies `body` to `client_writer`, `pipe_writer`, and `digest_writer`
/// using a pooled 64 KiB buffer. Aborts on the first write error to any
/// sink that must not silently lose bytes (the client writer); a pipe
/// write failure is tolerated here since its fate is reported separately
/// as `storage_error` via the awaited storage task.
async fn copy_fan_out(
    body: &mut (dyn AsyncRead + Send + Unpin),
    client_writer: &mut (dyn AsyncWrite + Send + Unpin),
    pipe_writer: &mut (dyn AsyncWrite + Send + Unpin),
    digest_writer: &mut HashingWriter<tokio::io::Sink, Sha256>,
    buffers: &BufferPool,
    total: &mut u64,
) -> Result<(), DownloadError> {
    loop {
        let mut buf = buffers.acquire();
        let n = body.read(&mut buf).await.map_err(DownloadError::Read)?;
        if n == 0 {
            break;
        }
        client_writer
            .write_all(&buf[..n])
            .await
            .map_err(DownloadError::ClientWrite)?;
        let _ = pipe_writer.write_all(&buf[..n]).await;
        digest_writer
            .write_all(&buf[..n])
            .await
            .expect("writing to an in-memory sink cannot fail");
        *total += n as u64;
    }
    Ok(())
}

use futures::TryStreamExt;

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{routing::get, Router};
    use proxy_store::local::LocalContentStore;

    async fn spawn_file_server(body: &'static [u8]) -> Url {
        let app = Router::new().route(
            "/files/pyspark-3.4.0.tar.gz",
            get(move || async move { body }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Url::parse(&format!("http://{addr}/files/pyspark-3.4.0.tar.gz")).unwrap()
    }

    #[tokio::test]
    async fn streams_to_client_and_store_simultaneously() {
        static BODY: &[u8] = b"pretend this is a wheel file, repeated a bit pretend this is a wheel file";
        let url = spawn_file_server(BODY).await;

        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn ContentStore> = Arc::new(
            LocalContentStore::open(dir.path().to_path_buf(), 0, None, Duration::from_secs(3600))
                .await
                .unwrap(),
        );

        let client = reqwest_middleware::ClientBuilder::new(reqwest::Client::new()).build();
        let buffers = BufferPool::default();
        let mut out = Vec::new();

        let outcome = download_and_stream(
            &client,
            &buffers,
            &url,
            store.clone(),
            "packages/pyspark/pyspark-3.4.0.tar.gz",
            &mut out,
            Duration::from_secs(30),
        )
        .await
        .unwrap();

        assert_eq!(out, BODY);
        assert_eq!(outcome.size, BODY.len() as u64);
        assert!(outcome.storage_error.is_none());

        let (mut stored, info) = store.get("packages/pyspark/pyspark-3.4.0.tar.gz").await.unwrap();
        let mut stored_bytes = Vec::new();
        stored.read_to_end(&mut stored_bytes).await.unwrap();
        assert_eq!(stored_bytes, BODY);
        assert_eq!(info.size, BODY.len() as u64);
    }

    #[tokio::test]
    async fn non_200_status_is_an_error() {
        let app = Router::new().route("/missing", get(|| async { (axum::http::StatusCode::NOT_FOUND, "") }));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        let url = Url::parse(&format!("http://{addr}/missing")).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn ContentStore> = Arc::new(
            LocalContentStore::open(dir.path().to_path_buf(), 0, None, Duration::from_secs(3600))
                .await
                .unwrap(),
        );
        let client = reqwest_middleware::ClientBuilder::new(reqwest::Client::new()).build();
        let buffers = BufferPool::default();
        let mut out = Vec::new();

        let err = download_and_stream(
            &client,
            &buffers,
            &url,
            store,
            "packages/x/missing",
            &mut out,
            Duration::from_secs(30),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, DownloadError::Upstream { status: 404 }));
    }
}
