//! LLM Request Router - main entry point
//!
//! Loads configuration, builds the provider registry and routing pipeline,
//! then serves either plain HTTP or mutual TLS depending on configuration.

use anyhow::{Context, Result};
use llm_router::{
    api,
    core::{audit::AuditLogger, metrics::init_metrics},
    security, AppConfig, AppState, CallerDirectory, ProviderRegistry, RequestRouter,
};
use std::net::SocketAddr;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (before reading any environment variables)
    dotenvy::dotenv().ok();

    init_tracing();
    init_metrics();

    let config_path =
        std::env::var("CONFIG_PATH").unwrap_or_else(|_| "config.yaml".to_string());
    let config = AppConfig::load(&config_path)
        .with_context(|| format!("Failed to load configuration from {}", config_path))?;

    let registry = Arc::new(ProviderRegistry::build(&config)?);
    tracing::info!(
        providers = ?registry.provider_ids(),
        "Provider registry initialized"
    );

    let audit = AuditLogger::spawn(&config.audit);
    let http_client = build_http_client()?;
    let router = Arc::new(RequestRouter::new(registry, http_client, audit));
    let directory = Arc::new(CallerDirectory::from_config(&config.callers));

    let state = AppState {
        router,
        directory: directory.clone(),
        ready: Arc::new(AtomicBool::new(true)),
        config_path,
    };

    let app = api::router(state);

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .with_context(|| {
            format!(
                "Invalid listen address {}:{}",
                config.server.host, config.server.port
            )
        })?;

    tracing::info!("OpenAI API: /v1/chat/completions, /v1/completions, /v1/models");
    tracing::info!("Health: /health, /ready  Metrics: /metrics");
    tracing::info!("Admin API: POST /admin/providers/reload");

    match &config.tls {
        Some(tls_config) => {
            let server_config = security::tls::build_server_config(tls_config)?;
            security::server::serve_tls(
                app,
                addr,
                server_config,
                directory,
                config.server.max_connections,
            )
            .await
        }
        None => {
            tracing::warn!("TLS disabled; callers authenticate by API key only");
            tracing::info!("Starting LLM request router on http://{}", addr);
            let listener = tokio::net::TcpListener::bind(addr).await?;
            axum::serve(listener, app).await?;
            Ok(())
        }
    }
}

/// Initialize tracing with noise suppression for HTTP internals.
///
/// The hyper/h2/reqwest filters are always appended so a broad `RUST_LOG`
/// setting does not let their chunk-level trace logs through.
fn init_tracing() {
    let base_filter =
        std::env::var("RUST_LOG").unwrap_or_else(|_| "info,llm_router=debug".to_string());
    let filter_str = format!(
        "{},hyper=warn,hyper::proto=warn,h2=warn,reqwest=warn,rustls=warn",
        base_filter
    );
    let filter = tracing_subscriber::EnvFilter::new(filter_str);

    let no_color = std::env::var("NO_COLOR").is_ok();
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_ansi(!no_color))
        .init();
}

/// Outbound HTTP client shared by all providers. Per-request deadlines are
/// applied in the router, so only the connect phase is bounded here.
fn build_http_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .use_rustls_tls()
        .connect_timeout(std::time::Duration::from_secs(10))
        .pool_idle_timeout(std::time::Duration::from_secs(90))
        .build()
        .context("Failed to build HTTP client")
}
