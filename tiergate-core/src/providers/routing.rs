//! Candidate selection and fallback across providers
//!
//! The router turns a requested category into an ordered list of
//! (provider, model) candidates taken from the request's pinned configuration
//! snapshot, then walks that list through the retry executor until one
//! candidate succeeds.

use super::convert::{from_provider_response, to_provider_request, ConvertOptions, ResponseContext};
use super::error::{CandidateFailure, GatewayError, GatewayResult};
use super::retry::{AttemptOptions, RetryExecutor, RetryOutcome, RetryPolicy};
use crate::cache::MultiLevelCache;
use crate::config::{FallbackStrategy, ProviderConfig, WireFormat};
use crate::context::RequestContext;
use crate::health::{self, HealthRecord};
use crate::http::{ByteStream, UpstreamRequest, UpstreamTransport};
use crate::protocol::{resolve_category, MessagesRequest, MessagesResponse, ModelCategory};
use rand::seq::SliceRandom;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// One (provider, concrete model) pair eligible for a category
#[derive(Debug, Clone)]
pub struct Candidate {
    pub provider: Arc<ProviderConfig>,
    pub model: String,
    pub category: ModelCategory,
}

impl Candidate {
    pub fn provider_name(&self) -> &str {
        &self.provider.name
    }

    pub fn wire_format(&self) -> WireFormat {
        self.provider.wire_format
    }

    fn failure(&self, error: &GatewayError) -> CandidateFailure {
        CandidateFailure::new(&self.provider.name, &self.model, error)
    }
}

impl fmt::Display for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.provider.name, self.model)
    }
}

/// Ordered candidates plus the ones skipped up front
#[derive(Debug, Clone, Default)]
pub struct CandidatePlan {
    pub candidates: Vec<Candidate>,
    /// Candidates left out because their circuit denies calls
    pub skipped: Vec<CandidateFailure>,
}

/// Successful non-streamed dispatch
#[derive(Debug, Clone)]
pub struct RoutedResponse {
    pub response: MessagesResponse,
    pub provider: String,
    pub model: String,
    pub category: ModelCategory,
    /// Upstream attempts across every candidate tried
    pub attempts: u32,
    /// Terminal failures of the candidates tried before the winner
    pub failures: Vec<CandidateFailure>,
}

impl RoutedResponse {
    pub fn used_fallback(&self) -> bool {
        !self.failures.is_empty()
    }
}

/// An opened upstream stream for one candidate
pub struct RoutedStream {
    pub candidate: Candidate,
    pub body: ByteStream,
    pub attempts: u32,
}

impl fmt::Debug for RoutedStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoutedStream")
            .field("candidate", &self.candidate)
            .field("attempts", &self.attempts)
            .finish()
    }
}

/// Routes requests across the providers of a configuration snapshot
#[derive(Clone)]
pub struct ProviderRouter {
    transport: Arc<dyn UpstreamTransport>,
    executor: RetryExecutor,
    cache: MultiLevelCache,
}

impl fmt::Debug for ProviderRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderRouter")
            .field("executor", &self.executor)
            .field("cache", &self.cache)
            .finish()
    }
}

impl ProviderRouter {
    pub fn new(transport: Arc<dyn UpstreamTransport>, executor: RetryExecutor, cache: MultiLevelCache) -> Self {
        Self {
            transport,
            executor,
            cache,
        }
    }

    pub fn executor(&self) -> &RetryExecutor {
        &self.executor
    }

    /// Category for the request's model name under the pinned aliases
    pub fn resolve(&self, ctx: &RequestContext, model: &str) -> GatewayResult<ModelCategory> {
        resolve_category(model, &ctx.snapshot.config.model_aliases)
            .ok_or_else(|| GatewayError::UnknownModel(model.to_string()))
    }

    /// Build the ordered candidate list for a category
    pub async fn plan(&self, ctx: &RequestContext, category: ModelCategory) -> CandidatePlan {
        let mut providers: Vec<Arc<ProviderConfig>> = ctx
            .snapshot
            .enabled_providers()
            .filter(|p| p.offers(category))
            .cloned()
            .collect();

        match ctx.snapshot.config.fallback_strategy {
            // stable: ties keep configuration order
            FallbackStrategy::Priority => providers.sort_by_key(|p| p.priority),
            FallbackStrategy::Random => {
                providers.shuffle(&mut rand::thread_rng());
                self.demote_unhealthy(&mut providers, category).await;
            }
        }

        let circuits = self.executor.circuits();
        let mut plan = CandidatePlan::default();
        for provider in providers {
            let allowed = circuits.peek_allowed(&provider.name);
            for model in provider.models_for(category) {
                if allowed {
                    plan.candidates.push(Candidate {
                        provider: Arc::clone(&provider),
                        model: model.clone(),
                        category,
                    });
                } else {
                    plan.skipped.push(CandidateFailure::new(
                        &provider.name,
                        model,
                        &GatewayError::ProviderUnavailable {
                            provider: provider.name.clone(),
                        },
                    ));
                }
            }
        }

        debug!(
            "Planned {} candidate(s) for {} [request_id: {}]: {:?}",
            plan.candidates.len(),
            category,
            ctx.request_id,
            plan.candidates.iter().map(|c| c.to_string()).collect::<Vec<_>>()
        );
        plan
    }

    /// Move providers last seen unhealthy behind the rest, keeping order
    async fn demote_unhealthy(&self, providers: &mut Vec<Arc<ProviderConfig>>, category: ModelCategory) {
        let mut healthy = Vec::with_capacity(providers.len());
        let mut unhealthy = Vec::new();
        for provider in providers.drain(..) {
            let record: Option<HealthRecord> = self
                .cache
                .get_json(&health::cache_key(&provider.name, category))
                .await;
            match record {
                Some(record) if !record.healthy => unhealthy.push(provider),
                _ => healthy.push(provider),
            }
        }
        healthy.extend(unhealthy);
        *providers = healthy;
    }

    fn policy_for(&self, ctx: &RequestContext, candidate: &Candidate) -> RetryPolicy {
        let retry = &ctx.snapshot.config.retry;
        RetryPolicy::from_settings(retry).with_max_retries(candidate.provider.max_retries_or(retry.max_retries))
    }

    fn upstream_request(
        ctx: &RequestContext,
        candidate: &Candidate,
        request: &MessagesRequest,
        stream: bool,
    ) -> GatewayResult<UpstreamRequest> {
        let options = ConvertOptions {
            stream,
            max_tokens_limit: candidate.provider.max_tokens_limit,
        };
        let body = to_provider_request(request, candidate.wire_format(), &candidate.model, &options)?;
        UpstreamRequest::build(&candidate.provider, &body, ctx.request_id, stream)
    }

    /// Run one candidate through the retry executor
    pub async fn execute_candidate(
        &self,
        ctx: &RequestContext,
        candidate: &Candidate,
        request: &MessagesRequest,
        policy: &RetryPolicy,
        options: &AttemptOptions,
    ) -> RetryOutcome<MessagesResponse> {
        let upstream = match Self::upstream_request(ctx, candidate, request, false) {
            Ok(upstream) => upstream,
            Err(e) => {
                return RetryOutcome {
                    result: Err(e),
                    attempts: 0,
                    total_delay: Default::default(),
                }
            }
        };
        let response_ctx = ResponseContext::for_request(request);
        let response_ctx = &response_ctx;
        let upstream = &upstream;
        let check_output = policy.retry_on_zero_output && !options.probe;

        self.executor
            .execute(candidate.provider_name(), policy, options, move |attempt| {
                let upstream = upstream.clone();
                async move {
                    debug!(
                        "Attempt {} on {} [request_id: {}]",
                        attempt, candidate, upstream.request_id
                    );
                    let body = self.transport.send(upstream).await?;
                    let response = from_provider_response(candidate.wire_format(), &body, response_ctx)?;
                    if check_output && response.usage.output_tokens == 0 {
                        return Err(GatewayError::ZeroOutputTokens {
                            provider: candidate.provider.name.clone(),
                            model: candidate.model.clone(),
                        });
                    }
                    Ok(response)
                }
            })
            .await
    }

    /// Dispatch a non-streamed request, falling back across candidates
    pub async fn route(&self, ctx: &RequestContext, request: &MessagesRequest) -> GatewayResult<RoutedResponse> {
        let category = self.resolve(ctx, &request.model)?;
        let plan = self.plan(ctx, category).await;
        let mut failures = plan.skipped;
        let mut attempts = 0;

        for candidate in &plan.candidates {
            let policy = self.policy_for(ctx, candidate);
            let options = AttemptOptions::default().with_timeout(candidate.provider.timeout());
            let outcome = self.execute_candidate(ctx, candidate, request, &policy, &options).await;
            attempts += outcome.attempts;

            match outcome.result {
                Ok(response) => {
                    info!(
                        "Served {} by {} after {} attempt(s) [request_id: {}]",
                        request.model, candidate, attempts, ctx.request_id
                    );
                    return Ok(RoutedResponse {
                        response,
                        provider: candidate.provider.name.clone(),
                        model: candidate.model.clone(),
                        category,
                        attempts,
                        failures,
                    });
                }
                Err(e) if e.aborts_routing() => return Err(e),
                Err(e) => {
                    warn!(
                        "Candidate {} failed, falling back [request_id: {}]: {}",
                        candidate, ctx.request_id, e
                    );
                    failures.push(candidate.failure(&e));
                }
            }
        }

        Err(GatewayError::ExhaustedCandidates(failures))
    }

    /// Open an upstream stream for one candidate, retrying connection failures
    pub async fn open_stream(
        &self,
        ctx: &RequestContext,
        candidate: &Candidate,
        request: &MessagesRequest,
    ) -> GatewayResult<RoutedStream> {
        let upstream = Self::upstream_request(ctx, candidate, request, true)?;
        let policy = self.policy_for(ctx, candidate);
        // connect-level deadline is enforced by the transport
        let options = AttemptOptions::default();

        let transport = &self.transport;
        let upstream = &upstream;
        let outcome = self
            .executor
            .execute(candidate.provider_name(), &policy, &options, move |_| {
                transport.open_stream(upstream.clone())
            })
            .await;

        outcome.result.map(|body| RoutedStream {
            candidate: candidate.clone(),
            body,
            attempts: outcome.attempts,
        })
    }

    /// Count a failure observed after a stream was opened
    pub fn record_stream_failure(&self, candidate: &Candidate, error: &GatewayError) {
        if error.trips_circuit() {
            self.executor.circuits().record_failure(candidate.provider_name());
        }
    }
}
