//! Upstream HTTP transport
//!
//! This module implements the wire layer between the gateway and providers:
//! - Endpoint and header construction per wire format
//! - Connection pooling via a shared client
//! - Error mapping and retry hints
//! - Request ID propagation

pub mod client;
pub mod error;

pub use client::HttpClient;

use crate::config::{ProviderConfig, WireFormat};
use crate::providers::anthropic::ANTHROPIC_VERSION;
use crate::providers::{GatewayError, GatewayResult, ProviderRequestBody};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use std::time::Duration;
use uuid::Uuid;

/// Byte stream of an upstream response body
pub type ByteStream = BoxStream<'static, GatewayResult<Bytes>>;

/// Kind of upstream call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    /// Native messages endpoint
    Messages,
    /// OpenAI-compatible chat completions
    ChatCompletions,
}

impl CallKind {
    pub fn for_format(format: WireFormat) -> Self {
        match format {
            WireFormat::Native => CallKind::Messages,
            WireFormat::Openai => CallKind::ChatCompletions,
        }
    }

    /// Path appended to the provider base URL
    pub fn endpoint(&self) -> &'static str {
        match self {
            CallKind::Messages => "/v1/messages",
            CallKind::ChatCompletions => "/chat/completions",
        }
    }
}

/// Fully prepared upstream call
#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    pub provider: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
    pub timeout: Duration,
    pub request_id: Uuid,
    pub stream: bool,
}

impl UpstreamRequest {
    /// Prepare a call to `provider` carrying `body`
    pub fn build(
        provider: &ProviderConfig,
        body: &ProviderRequestBody,
        request_id: Uuid,
        stream: bool,
    ) -> GatewayResult<Self> {
        let call_kind = CallKind::for_format(provider.wire_format);
        let url = format!(
            "{}{}",
            provider.base_url.trim_end_matches('/'),
            call_kind.endpoint()
        );

        let mut headers = vec![("content-type".to_string(), "application/json".to_string())];
        let secret = provider.api_key.expose_secret();
        match provider.wire_format {
            WireFormat::Native => {
                headers.push(("x-api-key".to_string(), secret.to_string()));
                headers.push(("anthropic-version".to_string(), ANTHROPIC_VERSION.to_string()));
            }
            WireFormat::Openai => {
                headers.push(("authorization".to_string(), format!("Bearer {}", secret)));
            }
        }
        if stream {
            headers.push(("accept".to_string(), "text/event-stream".to_string()));
        }
        headers.push(("x-request-id".to_string(), request_id.to_string()));

        let mut custom: Vec<_> = provider.headers.iter().collect();
        custom.sort();
        for (name, value) in custom {
            headers.push((name.to_ascii_lowercase(), value.clone()));
        }

        let body = serde_json::to_vec(body)
            .map(Bytes::from)
            .map_err(|e| GatewayError::Conversion(format!("failed to encode request: {}", e)))?;

        Ok(Self {
            provider: provider.name.clone(),
            url,
            headers,
            body,
            timeout: provider.timeout(),
            request_id,
            stream,
        })
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .rev()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// Transport used by the router to reach providers
#[async_trait]
pub trait UpstreamTransport: Send + Sync {
    /// Send a request and return the full response body
    async fn send(&self, request: UpstreamRequest) -> GatewayResult<Bytes>;

    /// Send a request and return the response body as it arrives
    async fn open_stream(&self, request: UpstreamRequest) -> GatewayResult<ByteStream>;
}
