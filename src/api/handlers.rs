//! OpenAI-compatible endpoint handlers.
//!
//! Handlers resolve the caller identity (connection extension in mTLS
//! mode, API key headers otherwise), validate the request shape, and hand
//! off to the router. Streamed responses are passed through chunk by
//! chunk; the audit guard rides inside the response stream so the entry is
//! written when the stream ends, or as `cancelled` if the client drops it.

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderMap};
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use futures::StreamExt;

use crate::api::models::{
    forwarded_payload, ChatCompletionRequest, CompletionRequest, ModelList,
};
use crate::core::error::{AppError, Result};
use crate::security::identity::CallerIdentity;
use crate::services::router::{AuditGuard, RequestContext, RouteOutcome};
use crate::services::upstream::UsageTokens;
use crate::AppState;

/// Resolve the caller: the TLS accept loop injects a verified identity as
/// an extension; without one, fall back to API key authentication.
fn resolve_identity(
    state: &AppState,
    identity: Option<Extension<CallerIdentity>>,
    headers: &HeaderMap,
) -> Result<CallerIdentity> {
    match identity {
        Some(Extension(identity)) => Ok(identity),
        None => state.directory.authenticate(headers),
    }
}

/// `POST /v1/chat/completions`
pub async fn chat_completions(
    State(state): State<AppState>,
    identity: Option<Extension<CallerIdentity>>,
    headers: HeaderMap,
    Json(request): Json<ChatCompletionRequest>,
) -> Result<Response> {
    let caller = resolve_identity(&state, identity, &headers)?;

    if request.model.is_empty() {
        return Err(AppError::Validation("model must not be empty".to_string()));
    }
    if request.messages.is_empty() {
        return Err(AppError::Validation(
            "messages must not be empty".to_string(),
        ));
    }

    let streaming = request.stream.unwrap_or(false);
    let ctx = RequestContext::new(caller, request.model.clone());
    let payload = forwarded_payload(&request);

    dispatch(
        &state,
        ctx,
        request.provider.as_deref(),
        "chat/completions",
        payload,
        streaming,
    )
    .await
}

/// `POST /v1/completions`
pub async fn completions(
    State(state): State<AppState>,
    identity: Option<Extension<CallerIdentity>>,
    headers: HeaderMap,
    Json(request): Json<CompletionRequest>,
) -> Result<Response> {
    let caller = resolve_identity(&state, identity, &headers)?;

    if request.model.is_empty() {
        return Err(AppError::Validation("model must not be empty".to_string()));
    }

    let streaming = request.stream.unwrap_or(false);
    let ctx = RequestContext::new(caller, request.model.clone());
    let payload = forwarded_payload(&request);

    dispatch(
        &state,
        ctx,
        request.provider.as_deref(),
        "completions",
        payload,
        streaming,
    )
    .await
}

/// `GET /v1/models`
pub async fn list_models(
    State(state): State<AppState>,
    identity: Option<Extension<CallerIdentity>>,
    headers: HeaderMap,
) -> Result<Response> {
    resolve_identity(&state, identity, &headers)?;
    let models = state.router.registry().served_models();
    Ok(Json(ModelList::from_model_names(models)).into_response())
}

async fn dispatch(
    state: &AppState,
    ctx: RequestContext,
    explicit_provider: Option<&str>,
    path: &str,
    payload: serde_json::Value,
    streaming: bool,
) -> Result<Response> {
    let correlation_id = ctx.correlation_id.clone();
    let outcome = state
        .router
        .route(ctx, explicit_provider, path, &payload, streaming)
        .await?;

    match outcome {
        RouteOutcome::Completed { provider_id, body } => {
            tracing::info!(
                correlation_id = %correlation_id,
                provider = %provider_id,
                "Request completed"
            );
            Ok(Json(body).into_response())
        }
        RouteOutcome::Streaming {
            provider_id,
            response,
            guard,
        } => {
            tracing::info!(
                correlation_id = %correlation_id,
                provider = %provider_id,
                "Streaming response started"
            );
            Ok(sse_passthrough(response, guard))
        }
    }
}

/// Forward an upstream SSE stream to the client unchanged.
///
/// The audit guard lives inside the stream: a clean end records success
/// with whatever usage the final chunks reported, an upstream error
/// records `upstream_error`, and the client dropping the response body
/// drops the armed guard, recording `cancelled`.
fn sse_passthrough(response: reqwest::Response, guard: AuditGuard) -> Response {
    let provider_id = guard_provider(&response);
    let stream = async_stream::stream! {
        let mut scanner = SseUsageScanner::default();
        let mut upstream = response.bytes_stream();
        let mut failed = false;

        while let Some(chunk) = upstream.next().await {
            match chunk {
                Ok(bytes) => {
                    scanner.feed(&bytes);
                    yield Ok::<_, axum::BoxError>(bytes);
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Upstream stream interrupted");
                    failed = true;
                    break;
                }
            }
        }

        if failed {
            guard.finish_error(&AppError::Upstream {
                provider: provider_id,
                status: 502,
                message: "upstream stream interrupted".to_string(),
            });
        } else {
            guard.finish_success(scanner.usage());
        }
    };

    Response::builder()
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::from_stream(stream))
        .unwrap_or_else(|_| AppError::Internal("failed to build stream response".into()).into_response())
}

fn guard_provider(response: &reqwest::Response) -> String {
    // Best-effort label for a mid-stream failure
    response
        .url()
        .host_str()
        .unwrap_or("upstream")
        .to_string()
}

/// Incremental scanner pulling token usage out of SSE `data:` lines.
///
/// OpenAI-compatible upstreams report usage in the final chunk (when
/// requested via `stream_options`); the scanner keeps the latest usage
/// object it sees.
#[derive(Default)]
struct SseUsageScanner {
    tail: String,
    usage: UsageTokens,
}

impl SseUsageScanner {
    fn feed(&mut self, chunk: &[u8]) {
        self.tail.push_str(&String::from_utf8_lossy(chunk));

        // Process complete lines, keep the unterminated remainder
        while let Some(pos) = self.tail.find('\n') {
            let line: String = self.tail.drain(..=pos).collect();
            self.scan_line(line.trim());
        }
        // Cap the remainder so a pathological line cannot grow unbounded
        if self.tail.len() > 64 * 1024 {
            self.tail.clear();
        }
    }

    fn scan_line(&mut self, line: &str) {
        let Some(data) = line.strip_prefix("data:") else {
            return;
        };
        let Ok(value) = serde_json::from_str::<serde_json::Value>(data.trim()) else {
            return;
        };
        let usage = crate::services::upstream::extract_usage(&value);
        if usage != UsageTokens::default() {
            self.usage = usage;
        }
    }

    fn usage(&self) -> UsageTokens {
        self.usage
    }
}
