//! Shared fixtures for router tests

#![allow(dead_code)]

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, Response};
use axum::Router;
use bytes::Bytes;
use futures::StreamExt;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tiergate_core::cache::MultiLevelCache;
use tiergate_core::config::GatewayConfig;
use tiergate_core::http::{ByteStream, UpstreamRequest, UpstreamTransport};
use tiergate_core::providers::{GatewayError, GatewayResult};
use tiergate_core::sink::TracingSink;
use tiergate_core::Gateway;
use tiergate_server::{router, AppState};
use tower::ServiceExt;

/// Canned upstream behaviour per provider
#[derive(Debug, Clone)]
pub enum Upstream {
    Message(String),
    Stream(String),
    Down,
}

#[derive(Default)]
pub struct CannedTransport {
    replies: Mutex<HashMap<String, Upstream>>,
    calls: Mutex<Vec<String>>,
}

impl CannedTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set(&self, provider: &str, reply: Upstream) {
        self.replies
            .lock()
            .unwrap()
            .insert(provider.to_string(), reply);
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    fn reply_for(&self, request: &UpstreamRequest) -> Upstream {
        self.calls.lock().unwrap().push(request.provider.clone());
        self.replies
            .lock()
            .unwrap()
            .get(&request.provider)
            .cloned()
            .unwrap_or(Upstream::Down)
    }
}

#[async_trait]
impl UpstreamTransport for CannedTransport {
    async fn send(&self, request: UpstreamRequest) -> GatewayResult<Bytes> {
        match self.reply_for(&request) {
            Upstream::Message(text) => Ok(Bytes::from(native_message(&text).to_string())),
            _ => Err(GatewayError::Network("connection refused".to_string())),
        }
    }

    async fn open_stream(&self, request: UpstreamRequest) -> GatewayResult<ByteStream> {
        match self.reply_for(&request) {
            Upstream::Stream(text) => {
                let body = Bytes::from(native_stream_body(&text));
                Ok(futures::stream::iter(vec![Ok(body)]).boxed())
            }
            _ => Err(GatewayError::Network("connection refused".to_string())),
        }
    }
}

pub fn provider_json(name: &str, priority: u32) -> Value {
    json!({
        "name": name,
        "priority": priority,
        "base_url": format!("https://{}.example.com", name),
        "api_key": format!("sk-{}", name),
        "max_retries": 0,
        "models": {
            "big": [format!("{}-large", name)],
            "middle": [format!("{}-medium", name)],
            "small": [format!("{}-small", name)]
        }
    })
}

pub fn config_json(providers: &[&str], api_keys: &[(&str, &str)]) -> Value {
    let keys: HashMap<&str, &str> = api_keys.iter().copied().collect();
    json!({
        "retry": {"initial_delay_ms": 1, "max_delay_ms": 5, "jitter_factor": 0.0},
        "server": {"api_keys": keys},
        "providers": providers
            .iter()
            .enumerate()
            .map(|(i, name)| provider_json(name, i as u32 + 1))
            .collect::<Vec<_>>()
    })
}

pub fn app(transport: Arc<CannedTransport>, config: Value) -> (Router, Arc<Gateway>) {
    let config: GatewayConfig = serde_json::from_value(config).unwrap();
    let gateway = Arc::new(
        Gateway::with_parts(
            config,
            transport,
            MultiLevelCache::disabled(),
            Arc::new(TracingSink),
        )
        .unwrap(),
    );
    (router(AppState::new(Arc::clone(&gateway))), gateway)
}

pub fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

pub async fn send(app: &Router, request: Request<Body>) -> Response<Body> {
    app.clone().oneshot(request).await.unwrap()
}

pub async fn body_bytes(response: Response<Body>) -> Bytes {
    axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap()
}

pub async fn body_json(response: Response<Body>) -> Value {
    serde_json::from_slice(&body_bytes(response).await).unwrap()
}

pub fn native_message(text: &str) -> Value {
    json!({
        "id": "msg_upstream",
        "type": "message",
        "role": "assistant",
        "model": "upstream-model",
        "content": [{"type": "text", "text": text}],
        "stop_reason": "end_turn",
        "stop_sequence": null,
        "usage": {"input_tokens": 10, "output_tokens": 3}
    })
}

pub fn native_stream_body(text: &str) -> String {
    let events = [
        ("message_start", json!({"type": "message_start", "message": {
            "id": "msg_up", "type": "message", "role": "assistant", "model": "up",
            "content": [], "stop_reason": null, "stop_sequence": null,
            "usage": {"input_tokens": 7, "output_tokens": 1}
        }})),
        ("content_block_start", json!({"type": "content_block_start", "index": 0, "content_block": {"type": "text", "text": ""}})),
        ("content_block_delta", json!({"type": "content_block_delta", "index": 0, "delta": {"type": "text_delta", "text": text}})),
        ("content_block_stop", json!({"type": "content_block_stop", "index": 0})),
        ("message_delta", json!({"type": "message_delta", "delta": {"stop_reason": "end_turn", "stop_sequence": null}, "usage": {"output_tokens": 4}})),
        ("message_stop", json!({"type": "message_stop"})),
    ];
    events
        .iter()
        .map(|(event, data)| format!("event: {}\ndata: {}\n\n", event, data))
        .collect()
}
