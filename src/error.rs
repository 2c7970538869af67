//! The error taxonomy surfaced to the CLI (SPEC_FULL §7).
//!
//! Every variant maps to exactly one HTTP status. `StreamTimeout`/`StreamError`
//! never materialize as a `Result::Err` on the happy path — by the time a
//! streaming response can fail mid-body the status/headers are already
//! committed to the wire, so those two are represented as synthetic SSE
//! frames (see [`crate::forwarder`]) rather than thrown here. They remain in
//! this enum so the taxonomy is whole in one place and so tests can assert
//! against it directly.
//!
//! Upstream error-status passthrough (status >= 400 with a body the CLI
//! should see verbatim) is not a variant here: the forwarder returns those
//! responses directly, because it needs to forward the upstream's full
//! header set, not just a content-type.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
    #[error("no healthy provider available")]
    NoProvider,

    #[error("upstream request timed out")]
    UpstreamTimeout,

    #[error("upstream request failed: {0}")]
    UpstreamError(String),
}

impl IntoResponse for ForwardError {
    fn into_response(self) -> Response {
        match self {
            ForwardError::NoProvider => (
                StatusCode::SERVICE_UNAVAILABLE,
                axum::Json(json!({ "error": { "message": "no healthy provider available" } })),
            )
                .into_response(),
            ForwardError::UpstreamTimeout => (
                StatusCode::GATEWAY_TIMEOUT,
                axum::Json(json!({ "error": { "message": "Upstream timeout" } })),
            )
                .into_response(),
            ForwardError::UpstreamError(msg) => (
                StatusCode::BAD_GATEWAY,
                axum::Json(json!({ "error": { "message": msg } })),
            )
                .into_response(),
        }
    }
}
