//! Request routing pipeline.
//!
//! For each request: resolve the candidate chain (requested provider or
//! model owner, then its failover list), and per candidate run admission
//! control, the circuit breaker and the retry loop around the upstream
//! call. Limiter and breaker rejections move to the next candidate without
//! consuming retry attempts; the first success short-circuits. Every
//! terminal outcome, including client disconnect, produces exactly one
//! audit entry.

use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

use crate::core::audit::{estimate_cost, AuditLogEntry, AuditLogger, AuditOutcome};
use crate::core::breaker::CircuitBreaker;
use crate::core::config::PricingConfig;
use crate::core::error::{AppError, Result};
use crate::core::metrics;
use crate::security::identity::CallerIdentity;
use crate::services::registry::{publish_circuit_gauge, ProviderEntry, ProviderRegistry};
use crate::services::upstream::{self, UsageTokens};

/// Per-request state threaded through the pipeline.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub correlation_id: String,
    pub caller: CallerIdentity,
    pub model: String,
    pub started: Instant,
}

impl RequestContext {
    pub fn new(caller: CallerIdentity, model: String) -> Self {
        Self {
            correlation_id: Uuid::new_v4().to_string(),
            caller,
            model,
            started: Instant::now(),
        }
    }
}

/// Result of a successful route.
#[derive(Debug)]
pub enum RouteOutcome {
    /// Non-streaming: decoded body, audit entry already emitted
    Completed { provider_id: String, body: Value },
    /// Streaming: undecoded response; the handler finishes the guard when
    /// the stream ends (dropping it unfinished audits `cancelled`)
    Streaming {
        provider_id: String,
        response: reqwest::Response,
        guard: AuditGuard,
    },
}

/// Emits the single audit entry for a request.
///
/// Armed on creation; a terminal outcome disarms it. Dropping an armed
/// guard records outcome `cancelled`, which is how abandoned streams and
/// disconnected clients stay visible in the audit trail.
#[derive(Debug)]
pub struct AuditGuard {
    audit: AuditLogger,
    correlation_id: String,
    caller: String,
    model: String,
    provider: String,
    pricing: Option<PricingConfig>,
    started: Instant,
    armed: bool,
}

impl AuditGuard {
    fn new(audit: AuditLogger, ctx: &RequestContext) -> Self {
        Self {
            audit,
            correlation_id: ctx.correlation_id.clone(),
            caller: ctx.caller.name.clone(),
            model: ctx.model.clone(),
            provider: String::new(),
            pricing: None,
            started: ctx.started,
            armed: true,
        }
    }

    fn set_provider(&mut self, entry: &ProviderEntry) {
        self.provider = entry.config.id.clone();
        self.pricing = entry.config.pricing.clone();
    }

    fn emit(&mut self, outcome: AuditOutcome, usage: UsageTokens, error: Option<String>) {
        if !self.armed {
            return;
        }
        self.armed = false;

        let duration_ms = self.started.elapsed().as_millis() as u64;
        let provider_label = if self.provider.is_empty() {
            "none"
        } else {
            &self.provider
        };
        if let Some(m) = metrics::try_get_metrics() {
            m.request_count
                .with_label_values(&[provider_label, outcome_label(outcome)])
                .inc();
            m.request_duration
                .with_label_values(&[provider_label])
                .observe(self.started.elapsed().as_secs_f64());
        }

        self.audit.record(AuditLogEntry {
            timestamp: chrono::Utc::now(),
            correlation_id: self.correlation_id.clone(),
            caller: self.caller.clone(),
            provider: provider_label.to_string(),
            model: self.model.clone(),
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
            estimated_cost_usd: estimate_cost(
                self.pricing.as_ref(),
                usage.prompt_tokens,
                usage.completion_tokens,
            ),
            duration_ms,
            outcome,
            error,
        });
    }

    /// Record a successful completion with the upstream-reported usage.
    pub fn finish_success(mut self, usage: UsageTokens) {
        self.emit(AuditOutcome::Success, usage, None);
    }

    /// Record a terminal failure.
    pub fn finish_error(mut self, error: &AppError) {
        self.emit(
            outcome_for_error(error),
            UsageTokens::default(),
            Some(error.to_string()),
        );
    }
}

impl Drop for AuditGuard {
    fn drop(&mut self) {
        // Request abandoned before a terminal outcome
        self.emit(AuditOutcome::Cancelled, UsageTokens::default(), None);
    }
}

fn outcome_label(outcome: AuditOutcome) -> &'static str {
    match outcome {
        AuditOutcome::Success => "success",
        AuditOutcome::RateLimited => "rate_limited",
        AuditOutcome::CircuitOpen => "circuit_open",
        AuditOutcome::UpstreamError => "upstream_error",
        AuditOutcome::Timeout => "timeout",
        AuditOutcome::Cancelled => "cancelled",
    }
}

fn outcome_for_error(error: &AppError) -> AuditOutcome {
    match error {
        AppError::RateLimitExceeded { .. } => AuditOutcome::RateLimited,
        AppError::CircuitOpen { .. } => AuditOutcome::CircuitOpen,
        AppError::Timeout { .. } => AuditOutcome::Timeout,
        AppError::ClientDisconnect => AuditOutcome::Cancelled,
        _ => AuditOutcome::UpstreamError,
    }
}

/// Resolves a breaker permit exactly once. Dropping it unresolved (the
/// attempt future was cancelled) releases the half-open trial slot without
/// counting toward provider health.
struct BreakerPermit<'a> {
    breaker: &'a CircuitBreaker,
    provider: &'a str,
    resolved: bool,
}

impl<'a> BreakerPermit<'a> {
    fn acquire(breaker: &'a CircuitBreaker, provider: &'a str) -> Option<Self> {
        if breaker.try_acquire() {
            publish_circuit_gauge(provider, breaker.state());
            Some(Self {
                breaker,
                provider,
                resolved: false,
            })
        } else {
            None
        }
    }

    fn success(mut self) {
        self.resolved = true;
        self.breaker.on_success();
        publish_circuit_gauge(self.provider, self.breaker.state());
    }

    fn failure(mut self) {
        self.resolved = true;
        self.breaker.on_failure();
        publish_circuit_gauge(self.provider, self.breaker.state());
    }

    fn abandon(mut self) {
        self.resolved = true;
        self.breaker.on_abandoned();
    }
}

impl Drop for BreakerPermit<'_> {
    fn drop(&mut self) {
        if !self.resolved {
            self.breaker.on_abandoned();
        }
    }
}

/// The routing engine shared by all handlers.
pub struct RequestRouter {
    registry: Arc<ProviderRegistry>,
    client: reqwest::Client,
    audit: AuditLogger,
}

impl RequestRouter {
    pub fn new(registry: Arc<ProviderRegistry>, client: reqwest::Client, audit: AuditLogger) -> Self {
        Self {
            registry,
            client,
            audit,
        }
    }

    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    /// Route one request through the resilience pipeline.
    ///
    /// `explicit_provider` pins a provider id; otherwise the first provider
    /// serving the requested model is primary. Failover candidates come
    /// from the primary's configured chain.
    pub async fn route(
        &self,
        ctx: RequestContext,
        explicit_provider: Option<&str>,
        path: &str,
        payload: &Value,
        streaming: bool,
    ) -> Result<RouteOutcome> {
        let mut guard = AuditGuard::new(self.audit.clone(), &ctx);

        let result = self
            .route_inner(&ctx, explicit_provider, path, payload, streaming, &mut guard)
            .await;

        match result {
            Ok(RoutedCall::Json { provider_id, body }) => {
                guard.finish_success(upstream::extract_usage(&body));
                Ok(RouteOutcome::Completed { provider_id, body })
            }
            Ok(RoutedCall::Stream {
                provider_id,
                response,
            }) => Ok(RouteOutcome::Streaming {
                provider_id,
                response,
                guard,
            }),
            Err(e) => {
                guard.finish_error(&e);
                Err(e)
            }
        }
    }

    async fn route_inner(
        &self,
        ctx: &RequestContext,
        explicit_provider: Option<&str>,
        path: &str,
        payload: &Value,
        streaming: bool,
        guard: &mut AuditGuard,
    ) -> Result<RoutedCall> {
        // Caller-level admission runs before any provider is considered
        self.registry.check_caller_limit(&ctx.caller.name)?;

        let candidates = self.resolve_candidates(explicit_provider, &ctx.model)?;
        let mut rejections: Vec<(String, AppError)> = Vec::new();

        for entry in candidates {
            let provider_id = entry.config.id.clone();
            guard.set_provider(&entry);

            if let Err(retry_after_secs) = entry.try_admit() {
                tracing::debug!(
                    correlation_id = %ctx.correlation_id,
                    provider = %provider_id,
                    retry_after_secs,
                    "Provider rate limit exhausted, trying next candidate"
                );
                if let Some(m) = metrics::try_get_metrics() {
                    m.rate_limit_rejections
                        .with_label_values(&["provider", &provider_id])
                        .inc();
                }
                rejections.push((provider_id, AppError::RateLimitExceeded { retry_after_secs }));
                continue;
            }

            match self.call_with_retry(ctx, &entry, path, payload, streaming).await {
                Ok(call) => return Ok(call),
                Err(e) if e.is_transient() || matches!(e, AppError::CircuitOpen { .. }) => {
                    tracing::warn!(
                        correlation_id = %ctx.correlation_id,
                        provider = %provider_id,
                        error = %e,
                        "Provider unavailable, trying next candidate"
                    );
                    rejections.push((provider_id, e));
                }
                // Permanent errors are the caller's to see; no failover
                Err(e) => return Err(e),
            }
        }

        // A single candidate surfaces its specific rejection; chains
        // aggregate every candidate's reason
        if rejections.len() == 1 {
            return Err(rejections.remove(0).1);
        }
        Err(AppError::AllProvidersUnavailable {
            reasons: rejections
                .into_iter()
                .map(|(provider, e)| (provider, e.to_string()))
                .collect(),
        })
    }

    /// Retry loop for one provider. Each attempt takes its own breaker
    /// permit; a mid-sequence open aborts the remaining attempts.
    async fn call_with_retry(
        &self,
        ctx: &RequestContext,
        entry: &Arc<ProviderEntry>,
        path: &str,
        payload: &Value,
        streaming: bool,
    ) -> Result<RoutedCall> {
        let provider_id = &entry.config.id;
        let mut last_error = AppError::CircuitOpen {
            provider: provider_id.clone(),
        };

        for attempt in 0..entry.retry.max_attempts() {
            if attempt > 0 {
                let delay = entry.retry.delay_for(attempt - 1);
                tracing::debug!(
                    correlation_id = %ctx.correlation_id,
                    provider = %provider_id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Retrying after backoff"
                );
                tokio::time::sleep(delay).await;
                if let Some(m) = metrics::try_get_metrics() {
                    m.retries.with_label_values(&[provider_id]).inc();
                }
            }

            let Some(permit) = BreakerPermit::acquire(&entry.breaker, provider_id) else {
                if attempt == 0 {
                    return Err(AppError::CircuitOpen {
                        provider: provider_id.clone(),
                    });
                }
                // Opened mid-sequence by concurrent failures
                return Err(last_error);
            };

            let attempt_started = Instant::now();
            match upstream::execute(&self.client, entry, path, payload).await {
                Ok(response) => {
                    permit.success();
                    if let Some(m) = metrics::try_get_metrics() {
                        m.provider_latency
                            .with_label_values(&[provider_id])
                            .observe(attempt_started.elapsed().as_secs_f64());
                    }
                    if streaming {
                        return Ok(RoutedCall::Stream {
                            provider_id: provider_id.clone(),
                            response,
                        });
                    }
                    let body: Value = response.json().await.map_err(|e| {
                        entry.breaker.on_failure();
                        AppError::Upstream {
                            provider: provider_id.clone(),
                            status: 502,
                            message: format!("invalid upstream response body: {}", e),
                        }
                    })?;
                    return Ok(RoutedCall::Json {
                        provider_id: provider_id.clone(),
                        body,
                    });
                }
                Err(e) if e.counts_as_breaker_failure() => {
                    permit.failure();
                    if !e.is_transient() {
                        return Err(e);
                    }
                    last_error = e;
                }
                Err(e) => {
                    // Permanent upstream error (4xx); healthy provider
                    permit.abandon();
                    return Err(e);
                }
            }
        }

        Err(last_error)
    }

    fn resolve_candidates(
        &self,
        explicit_provider: Option<&str>,
        model: &str,
    ) -> Result<Vec<Arc<ProviderEntry>>> {
        let primary = match explicit_provider {
            Some(id) => self
                .registry
                .get(id)
                .ok_or_else(|| AppError::UnknownProvider(id.to_string()))?,
            None => self.registry.find_by_model(model).ok_or_else(|| {
                AppError::Validation(format!("no configured provider serves model '{}'", model))
            })?,
        };

        let mut candidates = vec![primary.clone()];
        let mut seen = std::collections::HashSet::new();
        seen.insert(primary.config.id.clone());

        for target in &primary.config.failover {
            if !seen.insert(target.clone()) {
                continue;
            }
            match self.registry.get(target) {
                Some(entry) => candidates.push(entry),
                None => {
                    tracing::warn!(
                        provider = %primary.config.id,
                        target = %target,
                        "Failover target not in registry, skipping"
                    );
                }
            }
        }

        Ok(candidates)
    }
}

enum RoutedCall {
    Json { provider_id: String, body: Value },
    Stream {
        provider_id: String,
        response: reqwest::Response,
    },
}
