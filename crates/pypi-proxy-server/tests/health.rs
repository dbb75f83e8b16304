use std::sync::Arc;

use axum::{http::StatusCode, routing::get, Router};
use pypi_proxy_server::{router, state::AppState};

/// A minimal upstream index that 404s everything, so tests never depend on
/// reaching the real PyPI over the network.
async fn spawn_mock_upstream() -> url::Url {
    let app = Router::new()
        .route("/simple/{*rest}", get(|| async { StatusCode::NOT_FOUND }))
        .route("/simple/", get(|| async { StatusCode::NOT_FOUND }));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    url::Url::parse(&format!("http://{addr}/simple/")).unwrap()
}

async fn spawn_server() -> (url::Url, url::Url) {
    let upstream = spawn_mock_upstream().await;
    let config = proxy_config::Config::parse_from([
        "pypi-proxy-server",
        "--listen",
        "127.0.0.1:0",
        "--upstream-index-url",
        upstream.as_str(),
    ]);
    let dir = tempfile::tempdir().unwrap();
    let mut config = config;
    config.cache_dir = dir.path().to_path_buf();

    let state = Arc::new(AppState::build(config).await.unwrap());
    let app = router(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    // Keep the tempdir alive for the lifetime of the server task by leaking
    // it; the test process tears the directory down on exit.
    std::mem::forget(dir);

    (url::Url::parse(&format!("http://{addr}/")).unwrap(), upstream)
}

#[tokio::test]
async fn health_reports_configuration_knobs() {
    let (base, upstream) = spawn_server().await;
    let response = reqwest::get(base.join("health").unwrap()).await.unwrap();
    assert!(response.status().is_success());
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["upstream_index_url"], upstream.as_str());
    assert!(body["response_cache"]["max_size"].is_u64());
}

#[tokio::test]
async fn non_delete_method_on_cache_list_is_not_allowed() {
    let (base, _upstream) = spawn_server().await;
    let client = reqwest::Client::new();
    let response = client.get(base.join("cache/list").unwrap()).send().await.unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::METHOD_NOT_ALLOWED);
}

#[tokio::test]
async fn unknown_package_file_is_not_found() {
    // The mock upstream 404s everything, so a package/file pair that can't
    // resolve should surface as a client-visible 404 rather than hanging.
    let (base, _upstream) = spawn_server().await;
    let response = reqwest::get(base.join("simple/does-not-exist-pkg/does-not-exist.tar.gz").unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);
}
