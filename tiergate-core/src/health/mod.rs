//! On-demand provider health probing
//!
//! Probes run only when asked for. Each enabled provider is probed once per
//! category it offers, through the same candidate path as real traffic but
//! with retries disabled and in probe mode: a healthy probe clears the
//! provider's failure streak without closing an open circuit, an unhealthy
//! one is only recorded.

use crate::cache::MultiLevelCache;
use crate::context::RequestContext;
use crate::protocol::{MessagesRequest, ModelCategory, UnifiedMessage};
use crate::providers::{AttemptOptions, Candidate, ProviderRouter, RetryPolicy};
use dashmap::DashMap;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Cache key of a provider/category health record
pub fn cache_key(provider: &str, category: ModelCategory) -> String {
    format!("health:{}:{}", provider, category)
}

/// Outcome of one probe
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthRecord {
    pub provider: String,
    pub category: ModelCategory,
    pub model: String,
    pub healthy: bool,
    pub latency_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Unix timestamp in milliseconds
    pub checked_at: u64,
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Latest probe results, also mirrored into the cache
#[derive(Debug, Clone)]
pub struct HealthChecker {
    router: ProviderRouter,
    cache: MultiLevelCache,
    records: Arc<DashMap<(String, ModelCategory), HealthRecord>>,
}

impl HealthChecker {
    pub fn new(router: ProviderRouter, cache: MultiLevelCache) -> Self {
        Self {
            router,
            cache,
            records: Arc::new(DashMap::new()),
        }
    }

    /// Probe every enabled provider/category pair
    ///
    /// Unless `force` is set, records still fresh in the cache are returned
    /// without contacting the provider.
    pub async fn check(&self, ctx: &RequestContext, force: bool) -> Vec<HealthRecord> {
        let targets: Vec<Candidate> = ctx
            .snapshot
            .enabled_providers()
            .flat_map(|provider| {
                provider.categories().into_iter().filter_map(move |category| {
                    provider.models_for(category).first().map(|model| Candidate {
                        provider: Arc::clone(provider),
                        model: model.clone(),
                        category,
                    })
                })
            })
            .collect();

        info!(
            "Health check over {} provider/category pair(s), force={} [request_id: {}]",
            targets.len(),
            force,
            ctx.request_id
        );

        let mut records: Vec<HealthRecord> =
            join_all(targets.iter().map(|candidate| self.check_one(ctx, candidate, force))).await;
        records.sort_by(|a, b| (&a.provider, a.category).cmp(&(&b.provider, b.category)));
        records
    }

    async fn check_one(&self, ctx: &RequestContext, candidate: &Candidate, force: bool) -> HealthRecord {
        let key = cache_key(candidate.provider_name(), candidate.category);
        if !force {
            if let Some(record) = self.cache.get_json::<HealthRecord>(&key).await {
                debug!("Using cached health for {}", candidate);
                return record;
            }
        }

        let record = self.probe(ctx, candidate).await;
        let ttl = Duration::from_secs(ctx.snapshot.config.health.ttl_secs);
        self.cache.set_json(&key, &record, Some(ttl)).await;
        self.records.insert(
            (record.provider.clone(), record.category),
            record.clone(),
        );
        record
    }

    async fn probe(&self, ctx: &RequestContext, candidate: &Candidate) -> HealthRecord {
        let settings = &ctx.snapshot.config.health;
        let request = MessagesRequest::new(
            candidate.category.as_str(),
            vec![UnifiedMessage::user(settings.probe_prompt.clone())],
            settings.probe_max_tokens,
        );
        let options = AttemptOptions::probe().with_timeout(candidate.provider.timeout());

        let started = Instant::now();
        let outcome = self
            .router
            .execute_candidate(ctx, candidate, &request, &RetryPolicy::no_retry(), &options)
            .await;
        let latency_ms = started.elapsed().as_millis() as u64;

        let error = match outcome.result {
            Ok(_) => None,
            Err(e) => {
                warn!("Health probe of {} failed: {}", candidate, e);
                Some(e.to_string())
            }
        };

        HealthRecord {
            provider: candidate.provider.name.clone(),
            category: candidate.category,
            model: candidate.model.clone(),
            healthy: error.is_none(),
            latency_ms,
            error,
            checked_at: unix_millis(),
        }
    }

    /// Latest record per provider/category, sorted
    pub fn records(&self) -> Vec<HealthRecord> {
        let mut records: Vec<HealthRecord> = self.records.iter().map(|r| r.value().clone()).collect();
        records.sort_by(|a, b| (&a.provider, a.category).cmp(&(&b.provider, b.category)));
        records
    }

    /// Drop records of providers absent from the current configuration
    pub fn retain_providers(&self, names: &[&str]) {
        self.records.retain(|(provider, _), _| names.contains(&provider.as_str()));
    }
}
