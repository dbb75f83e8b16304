//! Caching reverse-proxy PyPI "simple" index server.

pub mod normalize;
pub mod render;
pub mod routes;
pub mod state;

use std::sync::Arc;

use axum::{
    routing::{delete, get},
    Router,
};

use state::AppState;

/// Builds the full route table over `state`. Extracted from `main` so
/// integration tests can exercise the real router without a subprocess.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/simple/", get(routes::get_package_list))
        .route("/index/", get(routes::get_package_list))
        .route("/simple/{pkg}/", get(routes::get_package_files))
        .route("/index/{pkg}", get(routes::get_package_files))
        .route("/simple/{pkg}/{file}", get(routes::get_package_file))
        .route("/index/{pkg}/{file}", get(routes::get_package_file))
        .route("/cache/list", delete(routes::delete_cache_list))
        .route("/cache/{pkg}", delete(routes::delete_cache_package))
        .route("/health", get(routes::health))
        .with_state(state)
}
