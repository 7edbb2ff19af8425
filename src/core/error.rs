//! Error types and handling for the LLM request router.
//!
//! This module provides a unified error type [`AppError`] covering every
//! terminal outcome of the request pipeline, with consistent HTTP response
//! conversion. Upstream credential values and internal topology details are
//! never included in caller-facing messages.

use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Main error type for the application.
///
/// All errors in the request path should be converted to this type so retry
/// classification and response mapping stay in one place.
#[derive(Error, Debug)]
pub enum AppError {
    /// Configuration-related errors (file not found, parse errors, etc.)
    #[error("Configuration error: {0}")]
    Config(#[from] anyhow::Error),

    /// Missing, invalid or expired client credentials (certificate or key)
    #[error("Authentication failed")]
    Authentication,

    /// Local admission control rejected the request
    #[error("Rate limit exceeded")]
    RateLimitExceeded {
        /// Estimated seconds until a token becomes available
        retry_after_secs: f64,
    },

    /// The provider's circuit breaker is open; no upstream call was made
    #[error("Circuit open for provider {provider}")]
    CircuitOpen { provider: String },

    /// The upstream call did not complete within the provider's deadline
    #[error("Timeout calling provider {provider}")]
    Timeout { provider: String },

    /// The upstream provider returned an error response
    #[error("Upstream error from {provider}: {status}")]
    Upstream {
        provider: String,
        status: u16,
        message: String,
    },

    /// Connection-level failure before an HTTP status was received
    #[error("Connection error to provider {provider}")]
    Connect { provider: String },

    /// The request named a provider that is not configured
    #[error("Unknown provider: {0}")]
    UnknownProvider(String),

    /// Client provided invalid data
    #[error("Validation error: {0}")]
    Validation(String),

    /// Every candidate in the failover chain was rejected or failed
    #[error("All providers unavailable")]
    AllProvidersUnavailable {
        /// Per-candidate rejection reason, in the order candidates were tried
        reasons: Vec<(String, String)>,
    },

    /// Client disconnected before the request completed
    #[error("Client closed request")]
    ClientDisconnect,

    /// Generic internal server errors with custom message
    #[error("Internal server error: {0}")]
    Internal(String),
}

impl AppError {
    /// Whether this error may succeed on a retry of the same provider.
    ///
    /// Timeouts, 5xx responses and connection failures are transient; auth,
    /// validation and local admission rejections are not.
    pub fn is_transient(&self) -> bool {
        match self {
            AppError::Timeout { .. } | AppError::Connect { .. } => true,
            AppError::Upstream { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// Whether this error should count against the provider's circuit breaker.
    ///
    /// Only failures that indicate provider health problems are counted.
    /// Local rejections (rate limit, open circuit) and caller mistakes do not
    /// affect breaker state.
    pub fn counts_as_breaker_failure(&self) -> bool {
        self.is_transient()
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message, retry_after) = match self {
            AppError::Config(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string(), None),
            AppError::Authentication => (
                StatusCode::UNAUTHORIZED,
                "Authentication failed".to_string(),
                None,
            ),
            AppError::RateLimitExceeded { retry_after_secs } => (
                StatusCode::TOO_MANY_REQUESTS,
                "Rate limit exceeded".to_string(),
                Some(retry_after_secs),
            ),
            AppError::CircuitOpen { .. } => (
                StatusCode::SERVICE_UNAVAILABLE,
                "Provider temporarily unavailable".to_string(),
                None,
            ),
            AppError::Timeout { .. } => (
                StatusCode::GATEWAY_TIMEOUT,
                "Upstream request timed out".to_string(),
                None,
            ),
            AppError::Upstream {
                status, message, ..
            } => (
                StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY),
                message,
                None,
            ),
            AppError::Connect { .. } => (
                StatusCode::BAD_GATEWAY,
                "Upstream connection failed".to_string(),
                None,
            ),
            AppError::UnknownProvider(name) => (
                StatusCode::BAD_REQUEST,
                format!("Unknown provider: {}", name),
                None,
            ),
            AppError::Validation(msg) => (StatusCode::BAD_REQUEST, msg, None),
            AppError::AllProvidersUnavailable { reasons } => {
                let detail = reasons
                    .iter()
                    .map(|(p, r)| format!("{}: {}", p, r))
                    .collect::<Vec<_>>()
                    .join("; ");
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    format!("All providers unavailable ({})", detail),
                    None,
                )
            }
            AppError::ClientDisconnect => {
                // HTTP 408 per RFC 7231, more compatible than nginx's 499
                tracing::info!("Client disconnected before request completed");
                (
                    StatusCode::REQUEST_TIMEOUT,
                    "Client closed request".to_string(),
                    None,
                )
            }
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg, None),
        };

        let retryable = matches!(
            status,
            StatusCode::TOO_MANY_REQUESTS
                | StatusCode::SERVICE_UNAVAILABLE
                | StatusCode::GATEWAY_TIMEOUT
                | StatusCode::BAD_GATEWAY
        );

        let body = Json(json!({
            "error": {
                "message": error_message,
                "type": if retryable { "retryable_error" } else { "invalid_request_error" },
                "code": status.as_u16()
            }
        }));

        let mut response = (status, body).into_response();
        if let Some(secs) = retry_after {
            // Round up so callers never retry too early
            if let Ok(value) = header::HeaderValue::from_str(&format!("{}", secs.ceil() as u64)) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

/// Convenience type alias for Results using [`AppError`].
pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = AppError::Authentication;
        assert_eq!(err.to_string(), "Authentication failed");

        let err = AppError::Internal("test error".to_string());
        assert_eq!(err.to_string(), "Internal server error: test error");

        let err = AppError::UnknownProvider("nope".to_string());
        assert_eq!(err.to_string(), "Unknown provider: nope");
    }

    #[test]
    fn test_transient_classification() {
        assert!(AppError::Timeout {
            provider: "p".into()
        }
        .is_transient());
        assert!(AppError::Connect {
            provider: "p".into()
        }
        .is_transient());
        assert!(AppError::Upstream {
            provider: "p".into(),
            status: 503,
            message: "oops".into()
        }
        .is_transient());

        assert!(!AppError::Upstream {
            provider: "p".into(),
            status: 401,
            message: "bad key".into()
        }
        .is_transient());
        assert!(!AppError::Authentication.is_transient());
        assert!(!AppError::Validation("bad".into()).is_transient());
        assert!(!AppError::RateLimitExceeded {
            retry_after_secs: 1.0
        }
        .is_transient());
        assert!(!AppError::CircuitOpen {
            provider: "p".into()
        }
        .is_transient());
    }

    #[test]
    fn test_breaker_accounting_matches_transience() {
        assert!(AppError::Timeout {
            provider: "p".into()
        }
        .counts_as_breaker_failure());
        assert!(!AppError::RateLimitExceeded {
            retry_after_secs: 0.5
        }
        .counts_as_breaker_failure());
    }

    #[test]
    fn test_authentication_response() {
        let response = AppError::Authentication.into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn test_rate_limit_response_has_retry_after() {
        let response = AppError::RateLimitExceeded {
            retry_after_secs: 2.3,
        }
        .into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        // 2.3 rounds up to 3
        assert_eq!(response.headers().get(header::RETRY_AFTER).unwrap(), "3");
    }

    #[test]
    fn test_circuit_open_response() {
        let response = AppError::CircuitOpen {
            provider: "openai".into(),
        }
        .into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn test_timeout_response() {
        let response = AppError::Timeout {
            provider: "openai".into(),
        }
        .into_response();
        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
    }

    #[test]
    fn test_upstream_status_passthrough() {
        let response = AppError::Upstream {
            provider: "openai".into(),
            status: 429,
            message: "upstream throttled".into(),
        }
        .into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[test]
    fn test_all_providers_unavailable_aggregates_reasons() {
        let err = AppError::AllProvidersUnavailable {
            reasons: vec![
                ("a".to_string(), "rate limited".to_string()),
                ("b".to_string(), "circuit open".to_string()),
            ],
        };
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn test_client_disconnect_response() {
        let response = AppError::ClientDisconnect.into_response();
        assert_eq!(response.status(), StatusCode::REQUEST_TIMEOUT);
    }
}
