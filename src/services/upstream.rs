//! Outbound provider calls.
//!
//! All configured provider kinds speak the OpenAI-compatible wire format;
//! the kind decides the credential header (Anthropic's compatibility
//! endpoint wants `x-api-key` plus a version header, local endpoints take
//! no credential). One attempt = one deadline-wrapped POST; classification
//! of the result into transient/permanent errors happens here so the
//! router's retry loop stays free of transport details.

use reqwest::StatusCode;
use serde_json::Value;
use std::time::Duration;

use crate::core::config::ProviderKind;
use crate::core::error::{AppError, Result};
use crate::services::registry::ProviderEntry;

const ANTHROPIC_VERSION: &str = "2023-06-01";
const MAX_ERROR_MESSAGE_LEN: usize = 500;

/// Token usage reported by the upstream, zero when absent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UsageTokens {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

/// Join a provider base URL with an endpoint path.
pub fn endpoint_url(base_url: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base_url.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

/// Build one outbound request with the provider's credential attached.
fn build_request(
    client: &reqwest::Client,
    entry: &ProviderEntry,
    path: &str,
    payload: &Value,
) -> reqwest::RequestBuilder {
    let url = endpoint_url(&entry.config.base_url, path);
    let mut request = client.post(&url);

    match (entry.config.kind, entry.api_key.as_deref()) {
        (ProviderKind::OpenAi, Some(key)) => {
            request = request.header("Authorization", format!("Bearer {}", key));
        }
        (ProviderKind::Anthropic, Some(key)) => {
            request = request
                .header("x-api-key", key)
                .header("anthropic-version", ANTHROPIC_VERSION);
        }
        // Local endpoints and providers without a configured credential
        _ => {}
    }

    request.json(payload)
}

/// Execute one attempt against a provider.
///
/// Applies the provider's deadline and maps transport and status failures
/// onto the error taxonomy. A successful (2xx) response is returned
/// unconsumed so the caller chooses between JSON decoding and SSE
/// passthrough.
pub async fn execute(
    client: &reqwest::Client,
    entry: &ProviderEntry,
    path: &str,
    payload: &Value,
) -> Result<reqwest::Response> {
    let provider = entry.config.id.clone();
    let deadline = Duration::from_secs(entry.config.timeout_secs.max(1));

    let outcome = tokio::time::timeout(deadline, build_request(client, entry, path, payload).send())
        .await
        .map_err(|_| AppError::Timeout {
            provider: provider.clone(),
        })?;

    let response = outcome.map_err(|e| classify_transport_error(&provider, &e))?;
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let raw = response.text().await.unwrap_or_default();
    Err(AppError::Upstream {
        provider,
        status: status.as_u16(),
        message: extract_error_message(&raw, status),
    })
}

fn classify_transport_error(provider: &str, error: &reqwest::Error) -> AppError {
    if error.is_timeout() {
        AppError::Timeout {
            provider: provider.to_string(),
        }
    } else if error.is_connect() || error.is_request() {
        AppError::Connect {
            provider: provider.to_string(),
        }
    } else {
        AppError::Internal(format!("upstream transport error: {}", error))
    }
}

/// Pull a human-readable message out of an upstream error body, truncated
/// and with the provider's own wording preferred over the raw text.
fn extract_error_message(raw: &str, status: StatusCode) -> String {
    let message = serde_json::from_str::<Value>(raw)
        .ok()
        .and_then(|body| {
            body.get("error")
                .and_then(|e| e.get("message"))
                .and_then(|m| m.as_str())
                .map(|s| s.to_string())
        })
        .unwrap_or_else(|| raw.trim().to_string());

    if message.is_empty() {
        return format!("upstream returned status {}", status.as_u16());
    }
    truncate(&message, MAX_ERROR_MESSAGE_LEN)
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &s[..end])
}

/// Extract token usage from a response body. Accepts both the OpenAI
/// (`prompt_tokens`/`completion_tokens`) and Anthropic
/// (`input_tokens`/`output_tokens`) field names.
pub fn extract_usage(body: &Value) -> UsageTokens {
    let Some(usage) = body.get("usage") else {
        return UsageTokens::default();
    };
    let read = |primary: &str, fallback: &str| -> u32 {
        usage
            .get(primary)
            .or_else(|| usage.get(fallback))
            .and_then(|v| v.as_u64())
            .unwrap_or(0) as u32
    };
    UsageTokens {
        prompt_tokens: read("prompt_tokens", "input_tokens"),
        completion_tokens: read("completion_tokens", "output_tokens"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::{
        CircuitBreakerConfig, ProviderConfig, RateLimitConfig, RetryConfig,
    };
    use serde_json::json;

    fn entry(kind: ProviderKind, api_key: Option<&str>) -> ProviderEntry {
        let config = ProviderConfig {
            id: "p".to_string(),
            display_name: None,
            kind,
            base_url: "http://upstream.test/v1/".to_string(),
            api_key_env: None,
            default_model: "m".to_string(),
            models: vec![],
            timeout_secs: 30,
            rate_limit: RateLimitConfig::default(),
            retry: RetryConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            failover: vec![],
            pricing: None,
            enabled: true,
        };
        ProviderEntry {
            breaker: crate::core::breaker::CircuitBreaker::new(&config.circuit_breaker),
            bucket: std::sync::Mutex::new(crate::core::rate_limit::TokenBucket::from_config(
                &config.rate_limit,
                std::time::Instant::now(),
            )),
            retry: crate::core::retry::RetryPolicy::from_config(&config.retry),
            api_key: api_key.map(|s| s.to_string()),
            config,
        }
    }

    #[test]
    fn test_endpoint_url_joins_cleanly() {
        assert_eq!(
            endpoint_url("http://a.test/v1/", "/chat/completions"),
            "http://a.test/v1/chat/completions"
        );
        assert_eq!(
            endpoint_url("http://a.test/v1", "chat/completions"),
            "http://a.test/v1/chat/completions"
        );
    }

    #[test]
    fn test_openai_auth_header() {
        let client = reqwest::Client::new();
        let e = entry(ProviderKind::OpenAi, Some("sk-test"));
        let request = build_request(&client, &e, "chat/completions", &json!({}))
            .build()
            .unwrap();
        assert_eq!(
            request.headers().get("authorization").unwrap(),
            "Bearer sk-test"
        );
    }

    #[test]
    fn test_anthropic_auth_headers() {
        let client = reqwest::Client::new();
        let e = entry(ProviderKind::Anthropic, Some("sk-ant"));
        let request = build_request(&client, &e, "chat/completions", &json!({}))
            .build()
            .unwrap();
        assert_eq!(request.headers().get("x-api-key").unwrap(), "sk-ant");
        assert_eq!(
            request.headers().get("anthropic-version").unwrap(),
            ANTHROPIC_VERSION
        );
        assert!(request.headers().get("authorization").is_none());
    }

    #[test]
    fn test_local_kind_sends_no_credential() {
        let client = reqwest::Client::new();
        let e = entry(ProviderKind::Local, None);
        let request = build_request(&client, &e, "chat/completions", &json!({}))
            .build()
            .unwrap();
        assert!(request.headers().get("authorization").is_none());
        assert!(request.headers().get("x-api-key").is_none());
    }

    #[test]
    fn test_extract_error_message_prefers_structured() {
        let raw = r#"{"error":{"message":"model overloaded","type":"server_error"}}"#;
        assert_eq!(
            extract_error_message(raw, StatusCode::SERVICE_UNAVAILABLE),
            "model overloaded"
        );
    }

    #[test]
    fn test_extract_error_message_falls_back_to_text() {
        assert_eq!(
            extract_error_message("plain failure", StatusCode::BAD_GATEWAY),
            "plain failure"
        );
        assert_eq!(
            extract_error_message("", StatusCode::BAD_GATEWAY),
            "upstream returned status 502"
        );
    }

    #[test]
    fn test_extract_error_message_truncates() {
        let long = "x".repeat(1000);
        let message = extract_error_message(&long, StatusCode::BAD_GATEWAY);
        assert!(message.len() <= MAX_ERROR_MESSAGE_LEN + 3);
        assert!(message.ends_with("..."));
    }

    #[test]
    fn test_extract_usage_openai_fields() {
        let body = json!({"usage": {"prompt_tokens": 12, "completion_tokens": 34}});
        assert_eq!(
            extract_usage(&body),
            UsageTokens {
                prompt_tokens: 12,
                completion_tokens: 34
            }
        );
    }

    #[test]
    fn test_extract_usage_anthropic_fields() {
        let body = json!({"usage": {"input_tokens": 5, "output_tokens": 7}});
        assert_eq!(
            extract_usage(&body),
            UsageTokens {
                prompt_tokens: 5,
                completion_tokens: 7
            }
        );
    }

    #[test]
    fn test_extract_usage_missing() {
        assert_eq!(extract_usage(&json!({})), UsageTokens::default());
    }
}
