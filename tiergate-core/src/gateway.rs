//! Gateway facade
//!
//! Wires the configuration handle, circuit registry, cache, router,
//! streaming proxy and health checker together and exposes the operations
//! the HTTP surface needs.

use crate::cache::{CacheError, CacheStats, MultiLevelCache};
use crate::circuit::{CircuitRegistry, CircuitSnapshot};
use crate::config::{ConfigError, ConfigHandle, FallbackStrategy, GatewayConfig, WireFormat};
use crate::context::{Identity, RequestContext};
use crate::health::{HealthChecker, HealthRecord};
use crate::http::{HttpClient, UpstreamTransport};
use crate::protocol::{CountTokensRequest, CountTokensResponse, MessagesRequest, MessagesResponse, ModelCategory};
use crate::providers::{tokens, GatewayError, GatewayResult, ProviderRouter, RetryExecutor};
use crate::sink::{TracingSink, UsageRecord, UsageSink};
use crate::streaming::{ProxyStream, StreamingProxy};
use serde::Serialize;
use std::sync::Arc;
use std::time::UNIX_EPOCH;
use thiserror::Error;
use tracing::info;

/// Failures while assembling a gateway
#[derive(Debug, Error)]
pub enum InitError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Cache initialisation failed: {0}")]
    Cache(#[from] CacheError),

    #[error("Transport initialisation failed: {0}")]
    Transport(#[from] GatewayError),
}

/// Provider summary for the admin surface
#[derive(Debug, Clone, Serialize)]
pub struct ProviderStatus {
    pub name: String,
    pub enabled: bool,
    pub priority: u32,
    pub wire_format: WireFormat,
    pub categories: Vec<ModelCategory>,
}

/// Read-only view returned by the admin status endpoint
#[derive(Debug, Clone, Serialize)]
pub struct GatewayStatus {
    pub config_version: u64,
    /// Unix timestamp in milliseconds
    pub config_loaded_at: u64,
    pub fallback_strategy: FallbackStrategy,
    pub providers: Vec<ProviderStatus>,
    pub circuits: Vec<CircuitSnapshot>,
    pub health: Vec<HealthRecord>,
    pub cache: CacheStats,
}

/// The assembled gateway
pub struct Gateway {
    config: ConfigHandle,
    circuits: Arc<CircuitRegistry>,
    cache: MultiLevelCache,
    router: ProviderRouter,
    streaming: StreamingProxy,
    health: HealthChecker,
    sink: Arc<dyn UsageSink>,
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("config_version", &self.config.version())
            .field("router", &self.router)
            .finish()
    }
}

impl Gateway {
    /// Gateway with the reqwest transport, log sink and configured cache
    pub fn from_config(config: GatewayConfig) -> Result<Self, InitError> {
        let cache = MultiLevelCache::from_settings(&config.cache)?;
        let transport: Arc<dyn UpstreamTransport> = Arc::new(HttpClient::new()?);
        Self::with_parts(config, transport, cache, Arc::new(TracingSink))
    }

    pub fn with_parts(
        config: GatewayConfig,
        transport: Arc<dyn UpstreamTransport>,
        cache: MultiLevelCache,
        sink: Arc<dyn UsageSink>,
    ) -> Result<Self, InitError> {
        let config = ConfigHandle::new(config)?;
        let snapshot = config.load();

        let circuits = Arc::new(CircuitRegistry::new(snapshot.config.circuit_breaker));
        circuits.register(snapshot.providers.iter().map(|p| p.name.as_str()));

        let router = ProviderRouter::new(transport, RetryExecutor::new(Arc::clone(&circuits)), cache.clone());
        let streaming = StreamingProxy::new(router.clone(), Arc::clone(&sink));
        let health = HealthChecker::new(router.clone(), cache.clone());

        info!(
            "Gateway ready with {} provider(s), config v{}",
            snapshot.providers.len(),
            snapshot.version
        );

        Ok(Self {
            config,
            circuits,
            cache,
            router,
            streaming,
            health,
            sink,
        })
    }

    pub fn config(&self) -> &ConfigHandle {
        &self.config
    }

    pub fn circuits(&self) -> &Arc<CircuitRegistry> {
        &self.circuits
    }

    pub fn cache(&self) -> &MultiLevelCache {
        &self.cache
    }

    pub fn router(&self) -> &ProviderRouter {
        &self.router
    }

    /// Pin the live configuration for a new request
    pub fn context(&self, identity: Identity) -> RequestContext {
        RequestContext::new(self.config.load(), identity)
    }

    /// Serve a non-streamed request
    pub async fn messages(&self, ctx: &RequestContext, request: &MessagesRequest) -> GatewayResult<MessagesResponse> {
        let category = self.router.resolve(ctx, &request.model)?;
        let record = UsageRecord::begin(ctx, &request.model, category, false);

        match self.router.route(ctx, request).await {
            Ok(routed) => {
                self.sink.record(
                    record
                        .served_by(&routed.provider, &routed.model)
                        .complete(ctx, &routed.response.usage, routed.response.stop_reason),
                );
                Ok(routed.response)
            }
            Err(e) => {
                self.sink.record(record.failed(ctx, e.to_string()));
                Err(e)
            }
        }
    }

    /// Open a client stream
    pub async fn stream(&self, ctx: RequestContext, request: MessagesRequest) -> GatewayResult<ProxyStream> {
        let category = self.router.resolve(&ctx, &request.model)?;
        let record = UsageRecord::begin(&ctx, &request.model, category, true);

        match self.streaming.open(ctx.clone(), request).await {
            Ok(stream) => Ok(stream),
            Err(e) => {
                self.sink.record(record.failed(&ctx, e.to_string()));
                Err(e)
            }
        }
    }

    /// Local token estimate; never contacts a provider
    pub fn count_tokens(&self, request: &CountTokensRequest) -> CountTokensResponse {
        CountTokensResponse {
            input_tokens: tokens::estimate_count_request(request),
        }
    }

    pub async fn health_check(&self, ctx: &RequestContext, force: bool) -> Vec<HealthRecord> {
        self.health.check(ctx, force).await
    }

    /// Validate and publish a new configuration; returns the new version
    pub fn reload(&self, config: GatewayConfig) -> Result<u64, ConfigError> {
        let snapshot = self.config.replace(config)?;
        self.circuits.apply_settings(snapshot.config.circuit_breaker);
        self.circuits
            .register(snapshot.providers.iter().map(|p| p.name.as_str()));
        let names: Vec<&str> = snapshot.providers.iter().map(|p| p.name.as_str()).collect();
        self.health.retain_providers(&names);
        Ok(snapshot.version)
    }

    pub fn reset_circuit(&self, provider: &str) -> bool {
        self.circuits.reset(provider)
    }

    pub async fn status(&self) -> GatewayStatus {
        let snapshot = self.config.load();
        let providers = snapshot
            .providers
            .iter()
            .map(|p| ProviderStatus {
                name: p.name.clone(),
                enabled: p.enabled,
                priority: p.priority,
                wire_format: p.wire_format,
                categories: p.categories(),
            })
            .collect();

        GatewayStatus {
            config_version: snapshot.version,
            config_loaded_at: snapshot
                .loaded_at
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or_default(),
            fallback_strategy: snapshot.config.fallback_strategy,
            providers,
            circuits: self.circuits.snapshot(),
            health: self.health.records(),
            cache: self.cache.stats().await,
        }
    }
}
