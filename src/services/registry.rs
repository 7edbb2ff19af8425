//! Provider registry with lock-free snapshot reads and hot reload.
//!
//! Each provider entry bundles its configuration with the runtime state the
//! router needs: the resolved API key, a circuit breaker, a token bucket and
//! a retry policy. The active set is published through an `ArcSwap` so the
//! request path reads a consistent snapshot without locking; reload swaps
//! the whole snapshot atomically. In-flight requests keep the entries they
//! resolved and finish against the old snapshot.

use arc_swap::ArcSwap;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::core::breaker::{CircuitBreaker, CircuitState};
use crate::core::config::{AppConfig, ProviderConfig};
use crate::core::metrics;
use crate::core::rate_limit::{KeyedLimiter, TokenBucket};
use crate::core::retry::RetryPolicy;

/// A provider with its resilience state. Shared between the registry and
/// any in-flight requests that resolved it.
pub struct ProviderEntry {
    pub config: ProviderConfig,
    /// Credential resolved from the environment at build time
    pub api_key: Option<String>,
    pub breaker: CircuitBreaker,
    pub bucket: Mutex<TokenBucket>,
    pub retry: RetryPolicy,
}

impl ProviderEntry {
    fn build(config: ProviderConfig) -> anyhow::Result<Arc<Self>> {
        let api_key = config.resolve_api_key()?;
        let breaker = CircuitBreaker::new(&config.circuit_breaker);
        let bucket = Mutex::new(TokenBucket::from_config(&config.rate_limit, Instant::now()));
        let retry = RetryPolicy::from_config(&config.retry);
        Ok(Arc::new(Self {
            config,
            api_key,
            breaker,
            bucket,
            retry,
        }))
    }

    /// Try to take one admission token from this provider's bucket.
    pub fn try_admit(&self) -> Result<(), f64> {
        self.bucket
            .lock()
            .expect("provider bucket mutex poisoned")
            .try_acquire()
    }
}

struct RegistrySnapshot {
    entries: HashMap<String, Arc<ProviderEntry>>,
    /// Configuration order, used for default selection and health listing
    order: Vec<String>,
}

/// Health view of one provider, exposed on the health endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderHealthView {
    pub id: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub available_tokens: f64,
}

/// The active provider set plus per-caller admission control.
pub struct ProviderRegistry {
    snapshot: ArcSwap<RegistrySnapshot>,
    caller_limits: KeyedLimiter,
}

impl ProviderRegistry {
    /// Build the registry from configuration, resolving credentials.
    ///
    /// Disabled providers are excluded from routing entirely.
    pub fn build(config: &AppConfig) -> anyhow::Result<Self> {
        let registry = Self {
            snapshot: ArcSwap::from_pointee(RegistrySnapshot {
                entries: HashMap::new(),
                order: Vec::new(),
            }),
            caller_limits: KeyedLimiter::new(),
        };
        registry.install(config, false)?;
        Ok(registry)
    }

    fn install(&self, config: &AppConfig, carry_state: bool) -> anyhow::Result<()> {
        let previous = self.snapshot.load();
        let mut entries = HashMap::new();
        let mut order = Vec::new();

        for provider_config in &config.providers {
            if !provider_config.enabled {
                tracing::info!(provider = %provider_config.id, "Provider disabled, skipping");
                continue;
            }
            let id = provider_config.id.clone();

            // Keep runtime state (breaker, bucket) across reloads when the
            // provider's configuration is unchanged
            let entry = if carry_state {
                match previous.entries.get(&id) {
                    Some(existing) if config_unchanged(&existing.config, provider_config) => {
                        existing.clone()
                    }
                    _ => ProviderEntry::build(provider_config.clone())?,
                }
            } else {
                ProviderEntry::build(provider_config.clone())?
            };

            publish_circuit_gauge(&id, entry.breaker.state());
            order.push(id.clone());
            entries.insert(id, entry);
        }

        if entries.is_empty() {
            anyhow::bail!("no enabled providers configured");
        }

        self.caller_limits.sync(
            config
                .callers
                .iter()
                .filter(|c| c.enabled)
                .filter_map(|c| c.rate_limit.as_ref().map(|rl| (c.name.as_str(), rl))),
        );

        self.snapshot.store(Arc::new(RegistrySnapshot { entries, order }));
        tracing::info!(provider_count = order_len(&self.snapshot), "Provider registry updated");
        Ok(())
    }

    /// Atomically replace the provider set from a new configuration.
    pub fn reload(&self, config: &AppConfig) -> anyhow::Result<()> {
        self.install(config, true)
    }

    /// Look up a provider by id.
    pub fn get(&self, id: &str) -> Option<Arc<ProviderEntry>> {
        self.snapshot.load().entries.get(id).cloned()
    }

    /// First enabled provider in configuration order.
    pub fn default_provider(&self) -> Option<Arc<ProviderEntry>> {
        let snapshot = self.snapshot.load();
        snapshot
            .order
            .first()
            .and_then(|id| snapshot.entries.get(id).cloned())
    }

    /// First enabled provider serving the given model, in configuration
    /// order.
    pub fn find_by_model(&self, model: &str) -> Option<Arc<ProviderEntry>> {
        let snapshot = self.snapshot.load();
        snapshot
            .order
            .iter()
            .filter_map(|id| snapshot.entries.get(id))
            .find(|entry| entry.config.serves_model(model))
            .cloned()
    }

    /// All enabled provider ids in configuration order.
    pub fn provider_ids(&self) -> Vec<String> {
        self.snapshot.load().order.clone()
    }

    /// All model names served, deduplicated, for the models endpoint.
    pub fn served_models(&self) -> Vec<String> {
        let snapshot = self.snapshot.load();
        let mut models = Vec::new();
        for id in &snapshot.order {
            let Some(entry) = snapshot.entries.get(id) else {
                continue;
            };
            for model in std::iter::once(&entry.config.default_model).chain(&entry.config.models) {
                if !models.contains(model) {
                    models.push(model.clone());
                }
            }
        }
        models
    }

    /// Per-provider health snapshot.
    pub fn health(&self) -> Vec<ProviderHealthView> {
        let snapshot = self.snapshot.load();
        snapshot
            .order
            .iter()
            .filter_map(|id| snapshot.entries.get(id))
            .map(|entry| {
                let health = entry.breaker.snapshot();
                let tokens = entry
                    .bucket
                    .lock()
                    .expect("provider bucket mutex poisoned")
                    .tokens();
                ProviderHealthView {
                    id: entry.config.id.clone(),
                    state: health.state,
                    consecutive_failures: health.consecutive_failures,
                    available_tokens: tokens,
                }
            })
            .collect()
    }

    /// Check the per-caller rate limit, if one is configured for this
    /// caller.
    pub fn check_caller_limit(&self, caller: &str) -> crate::core::error::Result<()> {
        self.caller_limits.check(caller).map_err(|e| {
            if let Some(m) = metrics::try_get_metrics() {
                m.rate_limit_rejections
                    .with_label_values(&["caller", caller])
                    .inc();
            }
            e
        })
    }
}

/// Update the circuit-state gauge for a provider.
pub fn publish_circuit_gauge(provider: &str, state: CircuitState) {
    if let Some(m) = metrics::try_get_metrics() {
        m.circuit_state
            .with_label_values(&[provider])
            .set(state.as_gauge());
    }
}

fn config_unchanged(a: &ProviderConfig, b: &ProviderConfig) -> bool {
    // Structural comparison through the serde model
    serde_json::to_value(a).ok() == serde_json::to_value(b).ok()
}

fn order_len(snapshot: &ArcSwap<RegistrySnapshot>) -> usize {
    snapshot.load().order.len()
}
