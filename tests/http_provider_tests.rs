//! HTTP provider and relay tests against an in-process server

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::{Json, Router};
use serde_json::{Value, json};

use failover_relay::Error;
use failover_relay::clock::{Clock, ManualClock};
use failover_relay::config::{Config, ProviderConfig};
use failover_relay::dispatch::DispatchRequest;
use failover_relay::failover::AttemptOutcome;
use failover_relay::provider::{GenerationRequest, HttpProvider, Provider, ProviderId};
use failover_relay::relay::Relay;

async fn echo(headers: HeaderMap, Json(body): Json<Value>) -> Json<Value> {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };
    Json(json!({
        "echo": body,
        "request_id": header("x-request-id"),
        "api_key": header("x-api-key"),
    }))
}

async fn fail() -> (StatusCode, &'static str) {
    (StatusCode::SERVICE_UNAVAILABLE, "overloaded")
}

async fn text() -> &'static str {
    "plain text"
}

async fn slow() -> &'static str {
    tokio::time::sleep(Duration::from_secs(2)).await;
    "late"
}

async fn spawn_server() -> SocketAddr {
    let app = Router::new()
        .route("/ok", post(echo))
        .route("/fail", post(fail))
        .route("/text", post(text))
        .route("/slow", post(slow));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

fn provider_config(addr: SocketAddr, path: &str) -> ProviderConfig {
    ProviderConfig {
        endpoint: format!("http://{addr}{path}"),
        timeout: Duration::from_millis(500),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_success_returns_json_body() {
    let addr = spawn_server().await;
    let mut config = provider_config(addr, "/ok");
    config.headers = HashMap::from([("X-Api-Key".to_string(), "secret".to_string())]);
    let provider = HttpProvider::new(ProviderId::from("local"), &config).unwrap();

    let mut request = GenerationRequest::new(json!({ "prompt": "hi" }));
    request.id = "req-42".to_string();

    let response = provider.generate(&request).await.unwrap();

    assert_eq!(response.status, 200);
    assert_eq!(response.body["echo"]["prompt"], "hi");
    assert_eq!(response.body["request_id"], "req-42");
    assert_eq!(response.body["api_key"], "secret");
}

#[tokio::test]
async fn test_error_status_is_provider_failure() {
    let addr = spawn_server().await;
    let provider = HttpProvider::new(ProviderId::from("local"), &provider_config(addr, "/fail")).unwrap();

    let err = provider
        .generate(&GenerationRequest::new(json!({})))
        .await
        .unwrap_err();

    match err {
        Error::Provider {
            provider,
            status,
            message,
        } => {
            assert_eq!(provider, ProviderId::from("local"));
            assert_eq!(status, Some(503));
            assert_eq!(message, "overloaded");
        }
        other => panic!("expected provider error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_non_json_body_passes_through() {
    let addr = spawn_server().await;
    let provider = HttpProvider::new(ProviderId::from("local"), &provider_config(addr, "/text")).unwrap();

    let response = provider.generate(&GenerationRequest::new(json!({}))).await.unwrap();

    assert_eq!(response.body, Value::String("plain text".to_string()));
}

#[tokio::test]
async fn test_timeout_is_provider_failure() {
    let addr = spawn_server().await;
    let provider = HttpProvider::new(ProviderId::from("local"), &provider_config(addr, "/slow")).unwrap();

    let err = provider
        .generate(&GenerationRequest::new(json!({})))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Provider { status: None, ref message, .. } if message.contains("timed out")));
}

#[test]
fn test_empty_endpoint_is_config_error() {
    let result = HttpProvider::new(ProviderId::from("local"), &ProviderConfig::default());
    assert!(matches!(result, Err(Error::Config(_))));
}

fn relay_config(addr: SocketAddr) -> Config {
    let mut config = Config::default();
    config
        .providers
        .insert(ProviderId::from("primary"), provider_config(addr, "/fail"));
    config
        .providers
        .insert(ProviderId::from("secondary"), provider_config(addr, "/ok"));
    config.failover.providers = vec![ProviderId::from("primary"), ProviderId::from("secondary")];
    config.circuit_breaker.failure_threshold = 2;
    config.dispatch.concurrency = 1;
    config
}

#[tokio::test]
async fn test_relay_fails_over_between_http_providers() {
    let addr = spawn_server().await;
    let relay = Relay::from_config(relay_config(addr)).unwrap();

    let result = relay
        .dispatch(&GenerationRequest::new(json!({ "prompt": "hi" })))
        .await
        .unwrap();

    assert_eq!(result.provider, ProviderId::from("secondary"));
    assert_eq!(result.response.body["echo"]["prompt"], "hi");
    assert!(matches!(
        result.attempts[0].outcome,
        AttemptOutcome::Failed { ref message } if message.contains("503")
    ));
}

#[tokio::test]
async fn test_relay_batch_trips_primary_breaker() {
    let addr = spawn_server().await;
    let relay = Relay::from_config(relay_config(addr)).unwrap();

    let requests = (0..5)
        .map(|i| DispatchRequest::new(GenerationRequest::new(json!({ "n": i }))))
        .collect();
    let report = relay.run_batch(requests).await;

    assert_eq!(report.succeeded, 5);
    assert_eq!(report.served_by_fallback, 5);
    assert_eq!(report.attempts.failed, 2);
    assert_eq!(report.attempts.circuit_open, 3);

    let status = relay.provider_status();
    let primary = status
        .iter()
        .find(|s| s.provider == ProviderId::from("primary"))
        .unwrap();
    assert_eq!(primary.circuit.times_opened, 1);
    assert_eq!(primary.health.failure_count, 2);
}

#[tokio::test]
async fn test_http_latency_is_measured_on_relay_clock() {
    let addr = spawn_server().await;
    let mut config = Config::default();
    config
        .providers
        .insert(ProviderId::from("local"), provider_config(addr, "/ok"));
    let clock = Arc::new(ManualClock::new());
    let relay = Relay::with_clock(config, Arc::clone(&clock) as Arc<dyn Clock>).unwrap();

    let result = relay
        .dispatch(&GenerationRequest::new(json!({ "prompt": "hi" })))
        .await
        .unwrap();

    // The manual clock never moved, so no wall time leaks into the figures
    assert_eq!(result.elapsed, Duration::ZERO);
    assert_eq!(result.attempts[0].elapsed, Duration::ZERO);
    let health = relay.failsafe().health_tracker.metrics(&ProviderId::from("local"));
    assert_eq!(health.success_count, 1);
    assert_eq!(health.latency_p50_ms, Some(0));
}
