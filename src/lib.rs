//! LLM Request Router - a resilient multi-provider proxy for LLM APIs
//!
//! This library provides an OpenAI-compatible routing proxy with:
//!
//! - **Provider Failover**: Ordered failover chains across configured providers
//! - **Admission Control**: Lazy-refill token buckets per provider and per caller
//! - **Circuit Breaking**: Per-provider breakers with a single half-open trial
//! - **Bounded Retry**: Exponential backoff with jitter for transient failures
//! - **Mutual TLS**: Caller identity from verified client certificates
//! - **Audit Trail**: One JSONL entry per request via a bounded queue
//! - **Metrics & Monitoring**: Prometheus metrics for observability
//!
//! # Architecture
//!
//! - [`core`]: configuration, errors, metrics and the resilience primitives
//! - [`security`]: TLS termination and caller identity
//! - [`services`]: provider registry, routing pipeline, upstream calls
//! - [`api`]: HTTP handlers and wire models
//!
//! # Configuration
//!
//! A YAML file (path from `CONFIG_PATH`, default `config.yaml`) declares
//! providers, callers, TLS material and the audit sink; see
//! `config.example.yaml`. Secrets are referenced by environment-variable
//! name and resolved at startup. `HOST`/`PORT` override the server block;
//! `ADMIN_KEY` gates the reload endpoint.

pub mod api;
pub mod core;
pub mod security;
pub mod services;

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

pub use core::config::AppConfig;
pub use core::error::{AppError, Result};
pub use security::identity::{CallerDirectory, CallerIdentity};
pub use services::registry::ProviderRegistry;
pub use services::router::RequestRouter;

/// Shared application state for all handlers.
#[derive(Clone)]
pub struct AppState {
    pub router: Arc<RequestRouter>,
    pub directory: Arc<CallerDirectory>,
    /// False while a configuration reload is swapping the registry
    pub ready: Arc<AtomicBool>,
    /// Path the admin reload endpoint re-reads
    pub config_path: String,
}
