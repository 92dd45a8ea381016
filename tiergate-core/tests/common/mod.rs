//! Shared fixtures for integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tiergate_core::config::{
    CategoryModels, GatewayConfig, ProviderConfig, SecretString, WireFormat,
};
use tiergate_core::http::{ByteStream, UpstreamRequest, UpstreamTransport};
use tiergate_core::providers::{GatewayError, GatewayResult};

/// Scripted upstream reply
#[derive(Debug, Clone)]
pub enum MockReply {
    Body(Value),
    Fail(GatewayError),
    Stream(Vec<Result<Bytes, GatewayError>>),
    /// Stream that yields the given chunks and then never ends
    HangingStream(Vec<Bytes>),
    Delay(Duration, Box<MockReply>),
}

/// Call observed by the mock transport
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub provider: String,
    pub url: String,
    pub body: Value,
    pub stream: bool,
    pub headers: Vec<(String, String)>,
}

/// In-memory transport keyed by provider name
#[derive(Default)]
pub struct MockTransport {
    scripts: Mutex<HashMap<String, VecDeque<MockReply>>>,
    defaults: Mutex<HashMap<String, MockReply>>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Replies consumed in order before the default applies
    pub fn script(&self, provider: &str, replies: Vec<MockReply>) {
        self.scripts
            .lock()
            .unwrap()
            .entry(provider.to_string())
            .or_default()
            .extend(replies);
    }

    pub fn always(&self, provider: &str, reply: MockReply) {
        self.defaults
            .lock()
            .unwrap()
            .insert(provider.to_string(), reply);
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_to(&self, provider: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.provider == provider)
            .count()
    }

    fn next_reply(&self, request: &UpstreamRequest) -> MockReply {
        self.calls.lock().unwrap().push(RecordedCall {
            provider: request.provider.clone(),
            url: request.url.clone(),
            body: serde_json::from_slice(&request.body).unwrap_or(Value::Null),
            stream: request.stream,
            headers: request.headers.clone(),
        });

        if let Some(reply) = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&request.provider)
            .and_then(|queue| queue.pop_front())
        {
            return reply;
        }
        self.defaults
            .lock()
            .unwrap()
            .get(&request.provider)
            .cloned()
            .unwrap_or_else(|| {
                MockReply::Fail(GatewayError::Network(format!(
                    "no reply scripted for {}",
                    request.provider
                )))
            })
    }
}

async fn resolve(mut reply: MockReply) -> MockReply {
    while let MockReply::Delay(delay, inner) = reply {
        tokio::time::sleep(delay).await;
        reply = *inner;
    }
    reply
}

#[async_trait]
impl UpstreamTransport for MockTransport {
    async fn send(&self, request: UpstreamRequest) -> GatewayResult<Bytes> {
        match resolve(self.next_reply(&request)).await {
            MockReply::Body(value) => Ok(Bytes::from(value.to_string())),
            MockReply::Fail(e) => Err(e),
            other => panic!("stream reply scripted for non-stream call: {:?}", other),
        }
    }

    async fn open_stream(&self, request: UpstreamRequest) -> GatewayResult<ByteStream> {
        match resolve(self.next_reply(&request)).await {
            MockReply::Stream(chunks) => Ok(futures::stream::iter(chunks).boxed()),
            MockReply::HangingStream(chunks) => Ok(futures::stream::iter(chunks.into_iter().map(Ok))
                .chain(futures::stream::pending())
                .boxed()),
            MockReply::Fail(e) => Err(e),
            other => panic!("body reply scripted for stream call: {:?}", other),
        }
    }
}

/// Route gateway logs to the test harness; later calls are no-ops
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new("tiergate_core=debug"))
        .with_test_writer()
        .try_init();
}

pub fn provider(name: &str, priority: u32, format: WireFormat) -> ProviderConfig {
    ProviderConfig {
        name: name.to_string(),
        enabled: true,
        priority,
        base_url: format!("https://{}.example.com", name),
        api_key: SecretString::new(format!("sk-{}", name)),
        wire_format: format,
        timeout_secs: 30,
        max_retries: Some(0),
        headers: HashMap::new(),
        models: CategoryModels {
            big: vec![format!("{}-large", name)],
            middle: vec![format!("{}-medium", name)],
            small: vec![format!("{}-small", name)],
        },
        max_tokens_limit: None,
    }
}

pub fn config(providers: Vec<ProviderConfig>) -> GatewayConfig {
    let mut config: GatewayConfig = serde_json::from_value(json!({
        "providers": [],
        "retry": {"initial_delay_ms": 10, "max_delay_ms": 100, "jitter_factor": 0.0},
        "cache": {"enabled": true}
    }))
    .unwrap();
    config.providers = providers;
    config
}

pub fn timeout() -> GatewayError {
    GatewayError::UpstreamTimeout(Duration::from_secs(30))
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

pub fn openai_completion(text: &str) -> Value {
    json!({
        "id": "chatcmpl-1",
        "object": "chat.completion",
        "model": "upstream-model",
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": text},
            "finish_reason": "stop"
        }],
        "usage": {"prompt_tokens": 10, "completion_tokens": 3, "total_tokens": 13}
    })
}

/// A complete native SSE body with one text block
pub fn native_stream_body(text: &str) -> String {
    let mut body = String::new();
    let mut push = |event: &str, data: Value| {
        body.push_str(&format!("event: {}\ndata: {}\n\n", event, data));
    };
    push(
        "message_start",
        json!({"type": "message_start", "message": {
            "id": "msg_up", "type": "message", "role": "assistant", "model": "up",
            "content": [], "stop_reason": null, "stop_sequence": null,
            "usage": {"input_tokens": 7, "output_tokens": 1}
        }}),
    );
    push(
        "content_block_start",
        json!({"type": "content_block_start", "index": 0, "content_block": {"type": "text", "text": ""}}),
    );
    push(
        "content_block_delta",
        json!({"type": "content_block_delta", "index": 0, "delta": {"type": "text_delta", "text": text}}),
    );
    push("content_block_stop", json!({"type": "content_block_stop", "index": 0}));
    push(
        "message_delta",
        json!({"type": "message_delta", "delta": {"stop_reason": "end_turn", "stop_sequence": null}, "usage": {"output_tokens": 4}}),
    );
    push("message_stop", json!({"type": "message_stop"}));
    body
}

/// A complete OpenAI-compatible SSE body with reasoning, text and a tool call
pub fn openai_stream_body() -> String {
    let chunks = [
        json!({"id": "c", "choices": [{"index": 0, "delta": {"role": "assistant", "reasoning_content": "think"}}]}),
        json!({"id": "c", "choices": [{"index": 0, "delta": {"content": "Hello"}}]}),
        json!({"id": "c", "choices": [{"index": 0, "delta": {"content": " world"}}]}),
        json!({"id": "c", "choices": [{"index": 0, "delta": {"tool_calls": [{"index": 0, "id": "call_1", "function": {"name": "lookup", "arguments": "{\"q\":"}}]}}]}),
        json!({"id": "c", "choices": [{"index": 0, "delta": {"tool_calls": [{"index": 0, "function": {"arguments": "\"rust\"}"}}]}}]}),
        json!({"id": "c", "choices": [{"index": 0, "delta": {}, "finish_reason": "tool_calls"}]}),
        json!({"id": "c", "choices": [], "usage": {"prompt_tokens": 9, "completion_tokens": 12, "total_tokens": 21}}),
    ];
    let mut body: String = chunks
        .iter()
        .map(|chunk| format!("data: {}\n\n", chunk))
        .collect();
    body.push_str("data: [DONE]\n\n");
    body
}
