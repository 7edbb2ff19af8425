//! Configuration management for the LLM request router.
//!
//! This module handles loading and parsing configuration from YAML files,
//! with support for environment variable expansion. Provider credentials are
//! referenced by environment-variable name and resolved at registry build
//! time; the configuration file never contains secret values.

use anyhow::{bail, Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

/// Main application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// List of upstream provider configurations
    pub providers: Vec<ProviderConfig>,

    /// Known callers with optional per-caller rate limits
    #[serde(default)]
    pub callers: Vec<CallerConfig>,

    /// Server configuration (host, port, connection limit)
    #[serde(default)]
    pub server: ServerConfig,

    /// Inbound TLS / mutual-TLS configuration; plain HTTP when absent
    #[serde(default)]
    pub tls: Option<TlsConfig>,

    /// Audit log configuration
    #[serde(default)]
    pub audit: AuditConfig,
}

/// Configuration for a single upstream provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Stable identifier used in routing, metrics and the audit log
    pub id: String,

    /// Human-readable name; defaults to the id
    #[serde(default)]
    pub display_name: Option<String>,

    /// Wire protocol spoken by this provider
    #[serde(default)]
    pub kind: ProviderKind,

    /// Base URL for the provider's API
    pub base_url: String,

    /// Name of the environment variable holding the API key.
    /// Local providers may omit this.
    #[serde(default)]
    pub api_key_env: Option<String>,

    /// Model served when the request does not pin one
    pub default_model: String,

    /// Additional model names this provider serves
    #[serde(default)]
    pub models: Vec<String>,

    /// Upstream call deadline in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Admission control for calls to this provider
    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// Retry policy for transient failures
    #[serde(default)]
    pub retry: RetryConfig,

    /// Failure-isolation thresholds
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,

    /// Ordered list of provider ids to try when this one is unavailable
    #[serde(default)]
    pub failover: Vec<String>,

    /// Cost-per-token pricing for audit cost estimates
    #[serde(default)]
    pub pricing: Option<PricingConfig>,

    /// Whether this provider participates in routing
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl ProviderConfig {
    /// Display name, falling back to the id.
    pub fn display_name(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.id)
    }

    /// Resolve the provider credential from the configured environment
    /// variable. Returns `Ok(None)` when no credential is configured.
    pub fn resolve_api_key(&self) -> Result<Option<String>> {
        match &self.api_key_env {
            None => Ok(None),
            Some(var) => {
                let key = std::env::var(var).with_context(|| {
                    format!(
                        "provider '{}': environment variable '{}' is not set",
                        self.id, var
                    )
                })?;
                Ok(Some(key))
            }
        }
    }

    /// Whether this provider serves the given model name.
    pub fn serves_model(&self, model: &str) -> bool {
        self.default_model == model || self.models.iter().any(|m| m == model)
    }
}

/// Upstream wire protocol. A closed set resolved at registry build time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// OpenAI-compatible chat/completions API, Bearer auth
    #[default]
    OpenAi,
    /// Anthropic messages API, x-api-key auth
    Anthropic,
    /// Local OpenAI-compatible inference endpoint, no auth
    Local,
}

/// A caller known to the router. The `name` matches either the client
/// certificate subject CN (mTLS) or is associated with a hashed API key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallerConfig {
    /// Caller identity as it appears in rate-limit keys and the audit log
    pub name: String,

    /// Environment variable holding this caller's API key (non-mTLS mode)
    #[serde(default)]
    pub api_key_env: Option<String>,

    /// Optional per-caller admission control, independent of provider buckets
    #[serde(default)]
    pub rate_limit: Option<RateLimitConfig>,

    /// Whether this caller may use the router
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

/// Token-bucket parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Long-run average admission rate
    pub requests_per_minute: u32,

    /// Bucket capacity; allows temporary spikes up to this size
    #[serde(default = "default_burst")]
    pub burst_size: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: 60,
            burst_size: default_burst(),
        }
    }
}

/// Retry policy parameters for transient upstream failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts including the first call
    pub max_attempts: u32,

    /// Delay before the first retry, in milliseconds
    pub base_delay_ms: u64,

    /// Ceiling on any single delay, in milliseconds
    pub max_delay_ms: u64,

    /// Exponential growth factor between attempts
    pub multiplier: f64,

    /// Jitter fraction in [0, 1); each delay is scaled by (1 ± jitter)
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 200,
            max_delay_ms: 5_000,
            multiplier: 2.0,
            jitter: 0.2,
        }
    }
}

/// Circuit-breaker thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before the circuit opens
    pub failure_threshold: u32,

    /// Seconds the circuit stays open before permitting a trial call
    pub cooldown_secs: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown_secs: 30,
        }
    }
}

/// Provider pricing used for audit-log cost estimates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricingConfig {
    /// USD per one million prompt tokens
    pub input_cost_per_1m: f64,

    /// USD per one million completion tokens
    pub output_cost_per_1m: f64,
}

/// Server-specific configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host to bind to
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to bind to
    #[serde(default = "default_port")]
    pub port: u16,

    /// Maximum concurrent inbound connections (TLS mode)
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_connections: default_max_connections(),
        }
    }
}

/// Inbound TLS material, referenced by filesystem path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    /// Server certificate chain (PEM)
    pub cert_path: PathBuf,

    /// Server private key (PEM, PKCS#8)
    pub key_path: PathBuf,

    /// CA bundle used to validate client certificates (mutual TLS)
    pub client_ca_path: PathBuf,
}

/// Audit log configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    /// Directory receiving the rotated JSONL files
    #[serde(default = "default_audit_dir")]
    pub dir: PathBuf,

    /// Bounded queue size between the request path and the writer task
    #[serde(default = "default_audit_queue")]
    pub queue_size: usize,

    /// Days of rotated files to retain
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            dir: default_audit_dir(),
            queue_size: default_audit_queue(),
            retention_days: default_retention_days(),
        }
    }
}

fn default_enabled() -> bool {
    true
}

fn default_burst() -> u32 {
    10
}

fn default_timeout_secs() -> u64 {
    60
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    18000
}

fn default_max_connections() -> usize {
    1024
}

fn default_audit_dir() -> PathBuf {
    PathBuf::from("./logs/audit")
}

fn default_audit_queue() -> usize {
    1000
}

fn default_retention_days() -> u32 {
    30
}

impl AppConfig {
    /// Load configuration from a YAML file.
    ///
    /// Environment variables referenced as `${VAR}` or `${VAR:-default}` are
    /// expanded before parsing; `HOST` and `PORT` override the server block.
    pub fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path))?;

        let expanded = expand_env_vars(&content);

        let mut config: AppConfig = serde_yaml::from_str(&expanded)
            .with_context(|| format!("Failed to parse config file: {}", path))?;

        if let Ok(host) = std::env::var("HOST") {
            config.server.host = host;
        }
        if let Ok(port_str) = std::env::var("PORT") {
            if let Ok(port) = port_str.parse::<u16>() {
                config.server.port = port;
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Structural validation, run once after parsing.
    pub fn validate(&self) -> Result<()> {
        if self.providers.is_empty() {
            bail!("configuration must declare at least one provider");
        }

        let mut seen = std::collections::HashSet::new();
        for provider in &self.providers {
            if provider.id.is_empty() {
                bail!("provider id must not be empty");
            }
            if !seen.insert(provider.id.as_str()) {
                bail!("duplicate provider id '{}'", provider.id);
            }
            if provider.rate_limit.requests_per_minute == 0 {
                bail!("provider '{}': requests_per_minute must be > 0", provider.id);
            }
            if provider.rate_limit.burst_size == 0 {
                bail!("provider '{}': burst_size must be > 0", provider.id);
            }
            if provider.retry.max_attempts == 0 {
                bail!("provider '{}': max_attempts must be > 0", provider.id);
            }
            if provider.retry.multiplier < 1.0 {
                bail!("provider '{}': retry multiplier must be >= 1.0", provider.id);
            }
            if !(0.0..1.0).contains(&provider.retry.jitter) {
                bail!("provider '{}': retry jitter must be in [0, 1)", provider.id);
            }
            if provider.circuit_breaker.failure_threshold == 0 {
                bail!("provider '{}': failure_threshold must be > 0", provider.id);
            }
        }

        for provider in &self.providers {
            for target in &provider.failover {
                if !seen.contains(target.as_str()) {
                    bail!(
                        "provider '{}': failover target '{}' is not configured",
                        provider.id,
                        target
                    );
                }
                if target == &provider.id {
                    bail!("provider '{}': failover target references itself", provider.id);
                }
            }
        }

        let mut caller_names = std::collections::HashSet::new();
        for caller in &self.callers {
            if !caller_names.insert(caller.name.as_str()) {
                bail!("duplicate caller name '{}'", caller.name);
            }
            if let Some(rl) = &caller.rate_limit {
                if rl.requests_per_minute == 0 || rl.burst_size == 0 {
                    bail!("caller '{}': rate limit values must be > 0", caller.name);
                }
            }
        }

        Ok(())
    }
}

/// Expand environment variables in configuration content.
///
/// Supports patterns: ${VAR}, ${VAR:-default}, ${VAR:default}
fn expand_env_vars(content: &str) -> String {
    let re = Regex::new(r#"\$\{([^}:]+)(?::?-?([^}]*))?\}"#).unwrap();

    re.replace_all(content, |caps: &regex::Captures| {
        let var_name = &caps[1];
        let default_value = caps.get(2).map(|m| m.as_str()).unwrap_or("");
        std::env::var(var_name).unwrap_or_else(|_| default_value.to_string())
    })
    .to_string()
}
