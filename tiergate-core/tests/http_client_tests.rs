//! Tests for the reqwest transport against a mock HTTP server

mod common;

use common::{native_message, native_stream_body, openai_completion, provider};
use futures::StreamExt;
use std::time::Duration;
use tiergate_core::config::{ProviderConfig, WireFormat};
use tiergate_core::http::{HttpClient, UpstreamRequest, UpstreamTransport};
use tiergate_core::protocol::{MessagesRequest, UnifiedMessage};
use tiergate_core::providers::{to_provider_request, ConvertOptions, GatewayError};
use uuid::Uuid;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn provider_at(server: &MockServer, format: WireFormat) -> ProviderConfig {
    let mut config = provider("up", 1, format);
    config.base_url = server.uri();
    config.timeout_secs = 2;
    config
}

fn upstream(config: &ProviderConfig, stream: bool) -> UpstreamRequest {
    let request = MessagesRequest::new("claude-3-5-haiku", vec![UnifiedMessage::user("Hi")], 64);
    let options = ConvertOptions {
        stream,
        max_tokens_limit: None,
    };
    let body = to_provider_request(&request, config.wire_format, "up-small", &options).unwrap();
    UpstreamRequest::build(config, &body, Uuid::new_v4(), stream).unwrap()
}

#[tokio::test]
async fn test_native_call_carries_credentials() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .and(header("x-api-key", "sk-up"))
        .and(header("anthropic-version", "2023-06-01"))
        .and(body_partial_json(serde_json::json!({"model": "up-small", "max_tokens": 64})))
        .respond_with(ResponseTemplate::new(200).set_body_json(native_message("hi")))
        .expect(1)
        .mount(&server)
        .await;

    let client = HttpClient::new().unwrap();
    let config = provider_at(&server, WireFormat::Native);
    let request = upstream(&config, false);
    let request_id = request.request_id.to_string();

    let body = client.send(request).await.unwrap();
    let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(value["content"][0]["text"], "hi");

    let received = server.received_requests().await.unwrap();
    assert_eq!(
        received[0].headers.get("x-request-id").unwrap().to_str().unwrap(),
        request_id
    );
}

#[tokio::test]
async fn test_openai_call_uses_bearer_auth() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(header("authorization", "Bearer sk-up"))
        .respond_with(ResponseTemplate::new(200).set_body_json(openai_completion("hi")))
        .expect(1)
        .mount(&server)
        .await;

    let client = HttpClient::new().unwrap();
    let config = provider_at(&server, WireFormat::Openai);
    client.send(upstream(&config, false)).await.unwrap();
}

#[tokio::test]
async fn test_rate_limit_maps_retry_after() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(429)
                .insert_header("retry-after", "2")
                .set_body_json(serde_json::json!({
                    "type": "error",
                    "error": {"type": "rate_limit_error", "message": "Slow down"}
                })),
        )
        .mount(&server)
        .await;

    let client = HttpClient::new().unwrap();
    let config = provider_at(&server, WireFormat::Native);
    let err = client.send(upstream(&config, false)).await.unwrap_err();

    match err {
        GatewayError::Upstream {
            status,
            message,
            retry_after,
        } => {
            assert_eq!(status, 429);
            assert!(message.contains("Slow down"));
            assert_eq!(retry_after, Some(Duration::from_secs(2)));
        }
        other => panic!("unexpected error: {:?}", other),
    }
}

#[tokio::test]
async fn test_slow_upstream_times_out() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(native_message("late"))
                .set_delay(Duration::from_secs(5)),
        )
        .mount(&server)
        .await;

    let client = HttpClient::new().unwrap();
    let config = provider_at(&server, WireFormat::Native);
    let err = client.send(upstream(&config, false)).await.unwrap_err();
    assert!(matches!(err, GatewayError::UpstreamTimeout(_)), "got {:?}", err);
    assert!(err.is_retryable());
}

#[tokio::test]
async fn test_unreachable_upstream_is_network_error() {
    let mut config = provider("up", 1, WireFormat::Native);
    config.base_url = "http://127.0.0.1:9".to_string();

    let client = HttpClient::new().unwrap();
    let err = client.send(upstream(&config, false)).await.unwrap_err();
    assert!(matches!(err, GatewayError::Network(_)), "got {:?}", err);
}

#[tokio::test]
async fn test_stream_body_arrives_intact() {
    let server = MockServer::start().await;
    let body = native_stream_body("streamed");
    Mock::given(method("POST"))
        .and(header("accept", "text/event-stream"))
        .and(body_partial_json(serde_json::json!({"stream": true})))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/event-stream")
                .set_body_string(body.clone()),
        )
        .mount(&server)
        .await;

    let client = HttpClient::new().unwrap();
    let config = provider_at(&server, WireFormat::Native);
    let mut stream = client.open_stream(upstream(&config, true)).await.unwrap();

    let mut received = Vec::new();
    while let Some(chunk) = stream.next().await {
        received.extend_from_slice(&chunk.unwrap());
    }
    assert_eq!(String::from_utf8(received).unwrap(), body);
}

#[tokio::test]
async fn test_stream_open_rejected_by_status() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503).set_body_string("upstream overloaded"))
        .mount(&server)
        .await;

    let client = HttpClient::new().unwrap();
    let config = provider_at(&server, WireFormat::Openai);
    let err = client.open_stream(upstream(&config, true)).await.err().unwrap();

    match err {
        GatewayError::Upstream { status, message, .. } => {
            assert_eq!(status, 503);
            assert!(message.contains("upstream overloaded"));
        }
        other => panic!("unexpected error: {:?}", other),
    }
}
