//! HTTP route handlers.

use std::{collections::HashMap, sync::Arc};

use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Redirect, Response},
    Json,
};
use bytes::Bytes;
use futures::StreamExt;
use proxy_cache::index::IndexKey;
use proxy_download::{CoordinateOutcome, CoordinatorError, DownloadContext};
use proxy_store::ContentStore;
use proxy_upstream::UpstreamError;
use tokio::io::AsyncReadExt;
use tokio_util::io::ReaderStream;

use crate::{
    normalize::normalize_package_name,
    render::{
        render_package_files_html, render_package_files_json, render_package_list_html,
        render_package_list_json, wants_json,
    },
    state::AppState,
};

fn base_url(config: &proxy_config::Config) -> String {
    format!("http://{}", config.listen)
}

fn upstream_error_status(err: &UpstreamError) -> StatusCode {
    if matches!(err, UpstreamError::NotFound(_)) {
        StatusCode::NOT_FOUND
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    }
}

/// `GET /simple/` or `/index/`.
pub async fn get_package_list(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    let json = wants_json(&headers, query.get("format").map(String::as_str));
    let fingerprint = if json { "json:package-list" } else { "html:package-list" };

    if let Some(cached) = state.response_cache.get(fingerprint) {
        return response_for(json, cached.into_bytes());
    }

    let names = match state.package_list_cache.get(&IndexKey::PackageList) {
        Some(names) => names,
        None => {
            let upstream = state.upstream.clone();
            match state
                .package_list_singleflight
                .do_call((), move || {
                    let upstream = upstream.clone();
                    async move { upstream.get_package_list().await.map(std::sync::Arc::new) }
                })
                .await
            {
                Ok(names) => {
                    state.package_list_cache.set(IndexKey::PackageList, names.clone());
                    names
                }
                Err(proxy_singleflight::SingleFlightError::Call(err)) => {
                    return upstream_error_status(&err).into_response();
                }
                Err(proxy_singleflight::SingleFlightError::CoalescedCallFailed) => {
                    return StatusCode::INTERNAL_SERVER_ERROR.into_response();
                }
            }
        }
    };

    let body = if json {
        render_package_list_json(&names)
    } else {
        render_package_list_html(&names)
    };
    state.response_cache.set(fingerprint.to_string(), Bytes::from(body.clone().into_bytes()));
    response_for(json, Bytes::from(body.into_bytes()))
}

fn response_for(json: bool, bytes: Bytes) -> Response {
    let content_type = if json {
        "application/vnd.pypi.simple.v1+json"
    } else {
        "text/html; charset=utf-8"
    };
    ([(header::CONTENT_TYPE, content_type)], bytes).into_response()
}

/// `GET /simple/<pkg>/` or `/index/<pkg>`.
pub async fn get_package_files(
    State(state): State<Arc<AppState>>,
    Path(pkg): Path<String>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    let pkg = normalize_package_name(&pkg);
    let json = wants_json(&headers, query.get("format").map(String::as_str));
    let fingerprint = format!("{}:package:{pkg}", if json { "json" } else { "html" });

    if let Some(cached) = state.response_cache.get(&fingerprint) {
        return response_for(json, cached.into_bytes());
    }

    let files = match state.package_files_cache.get(&IndexKey::Package(pkg.clone())) {
        Some(files) => files,
        None => {
            let upstream = state.upstream.clone();
            let pkg_owned = pkg.clone();
            match state
                .package_files_singleflight
                .do_call(pkg.clone(), move || {
                    let upstream = upstream.clone();
                    let pkg_owned = pkg_owned.clone();
                    async move { upstream.get_package_files(&pkg_owned).await.map(std::sync::Arc::new) }
                })
                .await
            {
                Ok(files) => {
                    state
                        .package_files_cache
                        .set(IndexKey::Package(pkg.clone()), files.clone());
                    files
                }
                Err(proxy_singleflight::SingleFlightError::Call(err)) => {
                    return upstream_error_status(&err).into_response();
                }
                Err(proxy_singleflight::SingleFlightError::CoalescedCallFailed) => {
                    return StatusCode::INTERNAL_SERVER_ERROR.into_response();
                }
            }
        }
    };

    let base = base_url(&state.config);
    let body = if json {
        render_package_files_json(&pkg, &files, &base)
    } else {
        render_package_files_html(&pkg, &files)
    };
    state.response_cache.set(fingerprint, Bytes::from(body.clone().into_bytes()));
    response_for(json, Bytes::from(body.into_bytes()))
}

/// `GET /simple/<pkg>/<file>` or `/index/<pkg>/<file>`.
pub async fn get_package_file(
    State(state): State<Arc<AppState>>,
    Path((pkg, file)): Path<(String, String)>,
) -> Response {
    let pkg = normalize_package_name(&pkg);
    let key = format!("packages/{pkg}/{file}");

    if state.store.exists(&key).await.unwrap_or(false) {
        let (writer, reader) = tokio::io::duplex(64 * 1024);
        let mut writer = writer;
        let store = state.store.clone();
        let key_owned = key.clone();
        tokio::spawn(async move {
            let _ = store.streaming_get(&key_owned, &mut writer).await;
        });
        let stream = ReaderStream::new(reader);
        return Response::builder()
            .header(header::CONTENT_TYPE, "application/octet-stream")
            .body(Body::from_stream(stream))
            .expect("building a streaming response cannot fail");
    }

    let (writer, reader) = tokio::io::duplex(64 * 1024);
    let coordinator = state.coordinator.clone();
    let pkg_owned = pkg.clone();
    let file_owned = file.clone();
    let handle = tokio::spawn(async move {
        let ctx = DownloadContext::default();
        let mut writer = writer;
        coordinator
            .coordinate(&ctx, &pkg_owned, &file_owned, &mut writer)
            .await
    });

    // `coordinate` only writes to `writer` on the leader path once bytes are
    // actually available; redirects, not-found, and error outcomes resolve
    // without writing anything. Probe the pipe before committing to either
    // branch so we never block on `handle` while it's still trying to push
    // more than the pipe's buffer through an undrained `reader`.
    let mut reader = reader;
    let mut probe = [0u8; 8192];
    match reader.read(&mut probe).await {
        Ok(0) => match handle.await {
            Ok(Ok(CoordinateOutcome::Served { .. })) => {
                let stream = ReaderStream::new(reader);
                Response::builder()
                    .header(header::CONTENT_TYPE, "application/octet-stream")
                    .body(Body::from_stream(stream))
                    .expect("building a streaming response cannot fail")
            }
            Ok(Ok(CoordinateOutcome::Redirect(url))) => Redirect::temporary(url.as_str()).into_response(),
            Ok(Err(CoordinatorError::NotFound(_))) => StatusCode::NOT_FOUND.into_response(),
            Ok(Err(CoordinatorError::Cancelled)) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
            Ok(Err(_)) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
            Err(_join_err) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
        },
        Ok(n) => {
            // Real bytes are already flowing: commit to a streaming response.
            // `handle` keeps running in the background and is never awaited
            // here; the body stream drains the pipe as the task writes to it.
            let prefix = Bytes::copy_from_slice(&probe[..n]);
            let prefix_stream = futures::stream::once(async move { Ok::<_, std::io::Error>(prefix) });
            let stream = prefix_stream.chain(ReaderStream::new(reader));
            Response::builder()
                .header(header::CONTENT_TYPE, "application/octet-stream")
                .body(Body::from_stream(stream))
                .expect("building a streaming response cannot fail")
        }
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

/// `DELETE /cache/list`.
pub async fn delete_cache_list(State(state): State<Arc<AppState>>) -> StatusCode {
    state.package_list_cache.invalidate_list();
    state.response_cache.invalidate("json:package-list");
    state.response_cache.invalidate("html:package-list");
    StatusCode::NO_CONTENT
}

/// `DELETE /cache/<pkg>`.
pub async fn delete_cache_package(State(state): State<Arc<AppState>>, Path(pkg): Path<String>) -> StatusCode {
    let pkg = normalize_package_name(&pkg);
    state.package_files_cache.invalidate_package(&pkg);
    state.response_cache.invalidate(&format!("json:package:{pkg}"));
    state.response_cache.invalidate(&format!("html:package:{pkg}"));
    StatusCode::NO_CONTENT
}

/// `GET /health`.
pub async fn health(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let response_cache_stats = state.response_cache.stats();
    let lru_stats = state.lru.as_ref().map(|lru| lru.stats());

    Json(serde_json::json!({
        "upstream_index_url": state.config.upstream_index_url.as_str(),
        "cache_dir": state.config.cache_dir,
        "cache_max_size": state.config.cache_max_size,
        "index_ttl_secs": state.config.index_ttl.as_secs(),
        "default_download_timeout_secs": state.config.default_download_timeout.as_secs(),
        "coordinator_linger_secs": state.config.coordinator_linger.as_secs(),
        "response_cache": response_cache_stats,
        "lru": lru_stats,
    }))
}
