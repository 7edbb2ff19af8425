//! Administrative endpoints.
//!
//! Reload is gated by an admin key taken from the `ADMIN_KEY` environment
//! variable; with no key configured the endpoint is disabled. The readiness
//! flag goes false for the duration of the swap so load balancers can hold
//! traffic, and comes back regardless of the reload result since a failed
//! reload leaves the previous provider snapshot serving.

use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use std::sync::atomic::Ordering;

use crate::core::config::AppConfig;
use crate::core::error::{AppError, Result};
use crate::security::identity::hash_key;
use crate::AppState;

fn verify_admin_key(headers: &HeaderMap) -> Result<()> {
    let configured = match std::env::var("ADMIN_KEY") {
        Ok(key) if !key.is_empty() => key,
        _ => {
            tracing::warn!("Admin endpoint called but ADMIN_KEY is not configured");
            return Err(AppError::Authentication);
        }
    };
    let provided = headers
        .get("x-admin-key")
        .and_then(|v| v.to_str().ok())
        .ok_or(AppError::Authentication)?;

    // Compare digests rather than plaintext
    if hash_key(provided) != hash_key(&configured) {
        return Err(AppError::Authentication);
    }
    Ok(())
}

/// `POST /admin/providers/reload` — re-read the configuration file and
/// atomically swap the provider registry.
pub async fn reload_providers(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response> {
    verify_admin_key(&headers)?;

    tracing::info!(config_path = %state.config_path, "Reloading provider configuration");
    state.ready.store(false, Ordering::Release);

    let result = AppConfig::load(&state.config_path)
        .and_then(|config| state.router.registry().reload(&config));

    state.ready.store(true, Ordering::Release);

    match result {
        Ok(()) => {
            let providers = state.router.registry().provider_ids();
            tracing::info!(provider_count = providers.len(), "Provider registry reloaded");
            Ok(Json(json!({
                "status": "reloaded",
                "providers": providers,
            }))
            .into_response())
        }
        Err(e) => {
            tracing::error!(error = %e, "Reload failed, previous configuration still active");
            Err(AppError::Config(e))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_verify_admin_key_disabled_without_env() {
        std::env::remove_var("ADMIN_KEY");
        let mut headers = HeaderMap::new();
        headers.insert("x-admin-key", HeaderValue::from_static("anything"));
        assert!(verify_admin_key(&headers).is_err());
    }

    #[test]
    #[serial]
    fn test_verify_admin_key_matches() {
        std::env::set_var("ADMIN_KEY", "super-secret");

        let mut headers = HeaderMap::new();
        headers.insert("x-admin-key", HeaderValue::from_static("super-secret"));
        assert!(verify_admin_key(&headers).is_ok());

        headers.insert("x-admin-key", HeaderValue::from_static("wrong"));
        assert!(verify_admin_key(&headers).is_err());

        assert!(verify_admin_key(&HeaderMap::new()).is_err());

        std::env::remove_var("ADMIN_KEY");
    }
}
