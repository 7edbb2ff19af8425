//! Failover and resilience behavior against mock upstreams.

use llm_router::core::audit::{AuditLogger, AuditOutcome};
use llm_router::core::config::{
    AppConfig, AuditConfig, CircuitBreakerConfig, ProviderConfig, ProviderKind, RateLimitConfig,
    RetryConfig, ServerConfig,
};
use llm_router::security::identity::CallerIdentity;
use llm_router::services::router::{RequestContext, RequestRouter, RouteOutcome};
use llm_router::{AppError, ProviderRegistry};
use serde_json::json;
use std::sync::Arc;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn provider(id: &str, base_url: &str, failover: Vec<&str>) -> ProviderConfig {
    ProviderConfig {
        id: id.to_string(),
        display_name: None,
        kind: ProviderKind::OpenAi,
        base_url: base_url.to_string(),
        api_key_env: None,
        default_model: format!("{}-model", id),
        models: vec!["shared-model".to_string()],
        timeout_secs: 5,
        rate_limit: RateLimitConfig {
            requests_per_minute: 6000,
            burst_size: 100,
        },
        retry: RetryConfig {
            max_attempts: 2,
            base_delay_ms: 1,
            max_delay_ms: 10,
            multiplier: 2.0,
            jitter: 0.0,
        },
        circuit_breaker: CircuitBreakerConfig {
            failure_threshold: 5,
            cooldown_secs: 30,
        },
        failover: failover.into_iter().map(|s| s.to_string()).collect(),
        pricing: None,
        enabled: true,
    }
}

fn build_router(providers: Vec<ProviderConfig>) -> (RequestRouter, AuditLogger) {
    let config = AppConfig {
        providers,
        callers: vec![],
        server: ServerConfig::default(),
        tls: None,
        audit: AuditConfig::default(),
    };
    let registry = Arc::new(ProviderRegistry::build(&config).unwrap());
    let audit = AuditLogger::detached(100);
    (
        RequestRouter::new(registry, reqwest::Client::new(), audit.clone()),
        audit,
    )
}

fn ctx(model: &str) -> RequestContext {
    RequestContext::new(CallerIdentity::anonymous(), model.to_string())
}

fn success_body() -> serde_json::Value {
    json!({
        "id": "chatcmpl-1",
        "object": "chat.completion",
        "choices": [{"index": 0, "message": {"role": "assistant", "content": "hello"}}],
        "usage": {"prompt_tokens": 10, "completion_tokens": 5}
    })
}

#[tokio::test]
async fn failover_to_backup_when_primary_errors() {
    let primary = MockServer::start().await;
    let backup = MockServer::start().await;

    // Primary fails every attempt; the retry budget is consumed there
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(500).set_body_json(json!({
            "error": {"message": "internal error"}
        })))
        .expect(2)
        .mount(&primary)
        .await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(success_body()))
        .expect(1)
        .mount(&backup)
        .await;

    let (router, audit) = build_router(vec![
        provider("primary", &primary.uri(), vec!["backup"]),
        provider("backup", &backup.uri(), vec![]),
    ]);

    let outcome = router
        .route(
            ctx("shared-model"),
            Some("primary"),
            "chat/completions",
            &json!({"model": "shared-model"}),
            false,
        )
        .await
        .unwrap();

    match outcome {
        RouteOutcome::Completed { provider_id, body } => {
            assert_eq!(provider_id, "backup");
            assert_eq!(body["id"], "chatcmpl-1");
        }
        _ => panic!("expected completed outcome"),
    }

    let entries = audit.drain();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].outcome, AuditOutcome::Success);
    assert_eq!(entries[0].provider, "backup");
    assert_eq!(entries[0].prompt_tokens, 10);
    assert_eq!(entries[0].completion_tokens, 5);
}

#[tokio::test]
async fn rate_limited_primary_fails_over_to_backup() {
    let primary = MockServer::start().await;
    let backup = MockServer::start().await;

    // The primary's bucket is drained below; it must never see a request
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(success_body()))
        .expect(0)
        .mount(&primary)
        .await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(success_body()))
        .expect(1)
        .mount(&backup)
        .await;

    let mut a = provider("primary", &primary.uri(), vec!["backup"]);
    a.rate_limit = RateLimitConfig {
        requests_per_minute: 60,
        burst_size: 1,
    };
    let (router, audit) = build_router(vec![a, provider("backup", &backup.uri(), vec![])]);

    // Drain the primary's only token without touching the network
    router
        .registry()
        .get("primary")
        .unwrap()
        .try_admit()
        .unwrap();

    let outcome = router
        .route(
            ctx("shared-model"),
            Some("primary"),
            "chat/completions",
            &json!({"model": "shared-model"}),
            false,
        )
        .await
        .unwrap();

    match outcome {
        RouteOutcome::Completed { provider_id, body } => {
            assert_eq!(provider_id, "backup");
            assert_eq!(body["id"], "chatcmpl-1");
        }
        _ => panic!("expected completed outcome"),
    }

    let entries = audit.drain();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].outcome, AuditOutcome::Success);
    assert_eq!(entries[0].provider, "backup");
}

#[tokio::test]
async fn retry_succeeds_after_transient_failure() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(success_body()))
        .expect(1)
        .mount(&server)
        .await;

    let (router, audit) = build_router(vec![provider("only", &server.uri(), vec![])]);

    let outcome = router
        .route(
            ctx("only-model"),
            None,
            "chat/completions",
            &json!({"model": "only-model"}),
            false,
        )
        .await
        .unwrap();

    assert!(matches!(outcome, RouteOutcome::Completed { ref provider_id, .. } if provider_id == "only"));
    let entries = audit.drain();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].outcome, AuditOutcome::Success);
}

#[tokio::test]
async fn permanent_error_is_not_retried_or_failed_over() {
    let primary = MockServer::start().await;
    let backup = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "error": {"message": "invalid request"}
        })))
        .expect(1)
        .mount(&primary)
        .await;

    // Backup must never be touched for a caller error
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(success_body()))
        .expect(0)
        .mount(&backup)
        .await;

    let (router, audit) = build_router(vec![
        provider("primary", &primary.uri(), vec!["backup"]),
        provider("backup", &backup.uri(), vec![]),
    ]);

    let err = router
        .route(
            ctx("shared-model"),
            Some("primary"),
            "chat/completions",
            &json!({"model": "shared-model"}),
            false,
        )
        .await
        .unwrap_err();

    match err {
        AppError::Upstream { status, message, .. } => {
            assert_eq!(status, 400);
            assert_eq!(message, "invalid request");
        }
        other => panic!("expected upstream error, got {}", other),
    }

    let entries = audit.drain();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].outcome, AuditOutcome::UpstreamError);
}

#[tokio::test]
async fn circuit_opens_and_rejects_without_network() {
    let server = MockServer::start().await;

    // Threshold 2, one attempt per request: two failing requests open the
    // circuit, the third is rejected without reaching the upstream
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(500))
        .expect(2)
        .mount(&server)
        .await;

    let mut p = provider("only", &server.uri(), vec![]);
    p.retry.max_attempts = 1;
    p.circuit_breaker.failure_threshold = 2;
    let (router, audit) = build_router(vec![p]);

    for _ in 0..2 {
        let err = router
            .route(
                ctx("only-model"),
                Some("only"),
                "chat/completions",
                &json!({}),
                false,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Upstream { .. }));
    }

    let err = router
        .route(
            ctx("only-model"),
            Some("only"),
            "chat/completions",
            &json!({}),
            false,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::CircuitOpen { .. }));

    let entries = audit.drain();
    assert_eq!(entries.len(), 3);
    assert_eq!(entries[2].outcome, AuditOutcome::CircuitOpen);
}

#[tokio::test]
async fn all_candidates_unavailable_reports_each_reason() {
    let primary = MockServer::start().await;
    let backup = MockServer::start().await;

    for server in [&primary, &backup] {
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(500))
            .mount(server)
            .await;
    }

    let mut a = provider("primary", &primary.uri(), vec!["backup"]);
    a.retry.max_attempts = 1;
    let mut b = provider("backup", &backup.uri(), vec![]);
    b.retry.max_attempts = 1;
    let (router, _audit) = build_router(vec![a, b]);

    let err = router
        .route(
            ctx("shared-model"),
            Some("primary"),
            "chat/completions",
            &json!({}),
            false,
        )
        .await
        .unwrap_err();

    match err {
        AppError::AllProvidersUnavailable { reasons } => {
            assert_eq!(reasons.len(), 2);
            assert_eq!(reasons[0].0, "primary");
            assert_eq!(reasons[1].0, "backup");
        }
        other => panic!("expected all-providers-unavailable, got {}", other),
    }
}

#[tokio::test]
async fn each_request_audits_a_distinct_correlation_id() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(success_body()))
        .mount(&server)
        .await;

    let (router, audit) = build_router(vec![provider("only", &server.uri(), vec![])]);

    for _ in 0..3 {
        router
            .route(ctx("only-model"), None, "chat/completions", &json!({}), false)
            .await
            .unwrap();
    }

    let entries = audit.drain();
    assert_eq!(entries.len(), 3);
    let mut ids: Vec<&str> = entries.iter().map(|e| e.correlation_id.as_str()).collect();
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 3);
}
