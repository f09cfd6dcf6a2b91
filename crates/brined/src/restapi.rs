//! REST API: the metrics endpoint plus placeholder root handlers and the
//! optional static directory.

use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use tokio::sync::RwLock;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

const METRICS_CONTENT_TYPE: &str = "text/plain;version=0.0.4;charset=utf-8";

/// Shared state: the most recently published metrics buffer.
pub struct ApiState {
    pub metrics_buf: Arc<RwLock<Option<String>>>,
}

/// Build the router. `static_dir` mounts a file service under the given
/// prefix when configured.
pub fn router(state: Arc<ApiState>, static_dir: Option<(String, PathBuf)>) -> Router {
    let mut router = Router::new()
        .route("/", get(index).post(index_post))
        .route("/metrics", get(metrics));
    if let Some((prefix, dir)) = static_dir {
        router = router.nest_service(&prefix, ServeDir::new(dir));
    }
    router
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn index() -> Json<serde_json::Value> {
    Json(serde_json::json!({"return": "GET placeholder"}))
}

async fn index_post() -> Json<serde_json::Value> {
    Json(serde_json::json!({"return": "POST placeholder"}))
}

/// Serve the last published buffer; 500 until the first publish arrives.
async fn metrics(State(state): State<Arc<ApiState>>) -> Response {
    let buf = state.metrics_buf.read().await;
    match buf.as_ref() {
        Some(body) => (
            [
                (header::CONTENT_TYPE, METRICS_CONTENT_TYPE),
                (header::CACHE_CONTROL, "no-cache"),
            ],
            body.clone(),
        )
            .into_response(),
        None => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "No metrics connection available",
        )
            .into_response(),
    }
}
