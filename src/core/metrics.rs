//! Prometheus metrics for monitoring the request router.
//!
//! This module provides a centralized metrics registry tracking requests,
//! admission-control rejections, circuit-breaker state, retries and the
//! audit queue.

use prometheus::{
    register_gauge_vec, register_histogram_vec, register_int_counter,
    register_int_counter_vec, GaugeVec, HistogramVec, IntCounter, IntCounterVec,
};
use std::sync::OnceLock;

/// Container for all application metrics.
pub struct Metrics {
    /// Total number of routed requests by provider and terminal outcome
    pub request_count: IntCounterVec,

    /// End-to-end request duration histogram in seconds
    pub request_duration: HistogramVec,

    /// Rate-limit rejections by scope ("provider" or "caller")
    pub rate_limit_rejections: IntCounterVec,

    /// Circuit-breaker state per provider (0=closed, 1=open, 2=half-open)
    pub circuit_state: GaugeVec,

    /// Retry attempts by provider (excludes the first attempt)
    pub retries: IntCounterVec,

    /// Audit entries dropped because the queue was full
    pub audit_overruns: IntCounter,

    /// Upstream call latency histogram in seconds per provider
    pub provider_latency: HistogramVec,
}

static METRICS: OnceLock<Metrics> = OnceLock::new();

/// Initialize the metrics registry.
///
/// This should be called once at application startup. Subsequent calls will
/// return the same instance.
pub fn init_metrics() -> &'static Metrics {
    METRICS.get_or_init(|| {
        let request_count = register_int_counter_vec!(
            "llm_router_requests_total",
            "Total number of routed requests",
            &["provider", "outcome"]
        )
        .expect("Failed to register request_count metric");

        let request_duration = register_histogram_vec!(
            "llm_router_request_duration_seconds",
            "End-to-end request duration in seconds",
            &["provider"],
            vec![0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0, 120.0]
        )
        .expect("Failed to register request_duration metric");

        let rate_limit_rejections = register_int_counter_vec!(
            "llm_router_rate_limit_rejections_total",
            "Requests rejected by admission control",
            &["scope", "key"]
        )
        .expect("Failed to register rate_limit_rejections metric");

        let circuit_state = register_gauge_vec!(
            "llm_router_circuit_state",
            "Circuit-breaker state per provider (0=closed, 1=open, 2=half-open)",
            &["provider"]
        )
        .expect("Failed to register circuit_state metric");

        let retries = register_int_counter_vec!(
            "llm_router_retries_total",
            "Retry attempts per provider",
            &["provider"]
        )
        .expect("Failed to register retries metric");

        let audit_overruns = register_int_counter!(
            "llm_router_audit_overruns_total",
            "Audit entries dropped because the queue was full"
        )
        .expect("Failed to register audit_overruns metric");

        let provider_latency = register_histogram_vec!(
            "llm_router_provider_latency_seconds",
            "Upstream call latency in seconds",
            &["provider"],
            vec![0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0]
        )
        .expect("Failed to register provider_latency metric");

        Metrics {
            request_count,
            request_duration,
            rate_limit_rejections,
            circuit_state,
            retries,
            audit_overruns,
            provider_latency,
        }
    })
}

/// Get the global metrics instance if it has been initialized.
pub fn try_get_metrics() -> Option<&'static Metrics> {
    METRICS.get()
}
