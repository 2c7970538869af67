use std::sync::Arc;

use axum::extract::State;
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router as AxumRouter};
use bytes::Bytes;
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::forwarder::Forwarder;

#[derive(Clone)]
struct AppState {
    forwarder: Arc<Forwarder>,
}

/// Build the full axum application: the reserved health probe plus a
/// catch-all fallback that forwards every other method/path upstream.
pub fn build_app(forwarder: Arc<Forwarder>) -> AxumRouter {
    let state = AppState { forwarder };

    AxumRouter::new()
        .route("/health", get(health))
        .fallback(forward)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, Json(json!({ "status": "ok" })))
}

async fn forward(
    State(state): State<AppState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    state.forwarder.forward(method, uri, headers, body).await
}
