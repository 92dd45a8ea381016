//! HTTP client implementation using reqwest

use super::error::{map_http_error, map_transport_error};
use super::{ByteStream, UpstreamRequest, UpstreamTransport};
use crate::providers::{GatewayError, GatewayResult};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use reqwest::{Client, ClientBuilder, Response};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Maximum non-streamed response size
const MAX_RESPONSE_SIZE: usize = 16 * 1024 * 1024;

const USER_AGENT: &str = concat!("tiergate/", env!("CARGO_PKG_VERSION"));

/// Shared HTTP client with connection pooling
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: Client,
    max_response_size: usize,
}

impl HttpClient {
    pub fn new() -> GatewayResult<Self> {
        Self::with_config(Duration::from_secs(10), 32)
    }

    pub fn with_config(connect_timeout: Duration, max_idle_per_host: usize) -> GatewayResult<Self> {
        let client = ClientBuilder::new()
            .pool_max_idle_per_host(max_idle_per_host)
            .pool_idle_timeout(Duration::from_secs(90))
            .connect_timeout(connect_timeout)
            .user_agent(USER_AGENT)
            .gzip(true)
            .build()
            .map_err(|e| GatewayError::Network(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            max_response_size: MAX_RESPONSE_SIZE,
        })
    }

    fn request_builder(&self, request: &UpstreamRequest) -> reqwest::RequestBuilder {
        let mut builder = self.client.post(&request.url).body(request.body.clone());
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        builder
    }

    async fn reject_failure(request: &UpstreamRequest, response: Response) -> GatewayError {
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await.unwrap_or_default();
        warn!(
            "Upstream '{}' returned {} [request_id: {}]",
            request.provider, status, request.request_id
        );
        map_http_error(status, &headers, &body, request.request_id)
    }

    fn check_content_length(&self, response: &Response) -> GatewayResult<()> {
        match response.content_length() {
            Some(length) if length as usize > self.max_response_size => {
                Err(GatewayError::MalformedResponse(format!(
                    "response size {} exceeds maximum {}",
                    length, self.max_response_size
                )))
            }
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl UpstreamTransport for HttpClient {
    async fn send(&self, request: UpstreamRequest) -> GatewayResult<Bytes> {
        debug!(
            "POST {} for '{}' [request_id: {}]",
            request.url, request.provider, request.request_id
        );

        let response = self
            .request_builder(&request)
            .timeout(request.timeout)
            .send()
            .await
            .map_err(|e| map_transport_error(&e, request.timeout))?;

        if !response.status().is_success() {
            return Err(Self::reject_failure(&request, response).await);
        }
        self.check_content_length(&response)?;

        let body = response
            .bytes()
            .await
            .map_err(|e| map_transport_error(&e, request.timeout))?;
        if body.len() > self.max_response_size {
            return Err(GatewayError::MalformedResponse(format!(
                "response size {} exceeds maximum {}",
                body.len(),
                self.max_response_size
            )));
        }

        info!(
            "Upstream '{}' answered with {} bytes [request_id: {}]",
            request.provider,
            body.len(),
            request.request_id
        );
        Ok(body)
    }

    async fn open_stream(&self, request: UpstreamRequest) -> GatewayResult<ByteStream> {
        debug!(
            "POST {} (stream) for '{}' [request_id: {}]",
            request.url, request.provider, request.request_id
        );

        // The deadline covers only the response head; chunk pacing is
        // bounded by the streaming proxy.
        let timeout = request.timeout;
        let response = tokio::time::timeout(timeout, self.request_builder(&request).send())
            .await
            .map_err(|_| GatewayError::UpstreamTimeout(timeout))?
            .map_err(|e| map_transport_error(&e, timeout))?;

        if !response.status().is_success() {
            return Err(Self::reject_failure(&request, response).await);
        }

        info!(
            "Upstream '{}' stream opened [request_id: {}]",
            request.provider, request.request_id
        );
        Ok(response
            .bytes_stream()
            .map(move |chunk| chunk.map_err(|e| map_transport_error(&e, timeout)))
            .boxed())
    }
}
