//! Health, readiness and metrics endpoints.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use prometheus::{Encoder, TextEncoder};
use serde_json::json;
use std::sync::atomic::Ordering;

use crate::AppState;

/// `GET /health` — liveness plus a per-provider health snapshot.
pub async fn health(State(state): State<AppState>) -> Response {
    let providers = state.router.registry().health();
    Json(json!({
        "status": "ok",
        "providers": providers,
    }))
    .into_response()
}

/// `GET /ready` — false while a configuration reload is in progress.
pub async fn ready(State(state): State<AppState>) -> Response {
    if state.ready.load(Ordering::Acquire) {
        Json(json!({ "ready": true })).into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(json!({ "ready": false }))).into_response()
    }
}

/// `GET /metrics` — Prometheus exposition format.
pub async fn metrics() -> Response {
    let encoder = TextEncoder::new();
    let families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&families, &mut buffer) {
        tracing::error!(error = %e, "Failed to encode metrics");
        return (StatusCode::INTERNAL_SERVER_ERROR, "encoding error").into_response();
    }
    (
        [(axum::http::header::CONTENT_TYPE, encoder.format_type().to_string())],
        buffer,
    )
        .into_response()
}
