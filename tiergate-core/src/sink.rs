//! Usage records and the append-only sink collaborator
//!
//! Sinks are fire-and-forget: recording never blocks and never fails the
//! request that produced the record.

use crate::context::{Identity, RequestContext};
use crate::protocol::{ModelCategory, StopReason, Usage};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

/// How the request ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum UsageOutcome {
    Success,
    Failed { reason: String },
}

/// One served (or failed) request
#[derive(Debug, Clone, Serialize)]
pub struct UsageRecord {
    pub request_id: Uuid,
    pub identity: Identity,
    pub client_model: String,
    pub category: ModelCategory,
    /// Provider and model that served the request, if any did
    pub provider: Option<String>,
    pub model: Option<String>,
    pub streamed: bool,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub stop_reason: Option<StopReason>,
    pub latency_ms: u64,
    pub outcome: UsageOutcome,
}

impl UsageRecord {
    /// Record for a request that has not been served yet
    pub fn begin(ctx: &RequestContext, client_model: &str, category: ModelCategory, streamed: bool) -> Self {
        Self {
            request_id: ctx.request_id,
            identity: ctx.identity.clone(),
            client_model: client_model.to_string(),
            category,
            provider: None,
            model: None,
            streamed,
            input_tokens: 0,
            output_tokens: 0,
            stop_reason: None,
            latency_ms: 0,
            outcome: UsageOutcome::Success,
        }
    }

    pub fn served_by(mut self, provider: &str, model: &str) -> Self {
        self.provider = Some(provider.to_string());
        self.model = Some(model.to_string());
        self
    }

    /// Fill in the final counters; latency is measured from request start
    pub fn complete(mut self, ctx: &RequestContext, usage: &Usage, stop_reason: Option<StopReason>) -> Self {
        self.input_tokens = usage.input_tokens;
        self.output_tokens = usage.output_tokens;
        self.stop_reason = stop_reason;
        self.latency_ms = ctx.started.elapsed().as_millis() as u64;
        self
    }

    pub fn failed(mut self, ctx: &RequestContext, reason: impl Into<String>) -> Self {
        self.latency_ms = ctx.started.elapsed().as_millis() as u64;
        self.outcome = UsageOutcome::Failed {
            reason: reason.into(),
        };
        self
    }
}

/// Append-only consumer of usage records
pub trait UsageSink: Send + Sync {
    fn record(&self, record: UsageRecord);
}

/// Writes records to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl UsageSink for TracingSink {
    fn record(&self, record: UsageRecord) {
        info!(
            target: "tiergate::usage",
            request_id = %record.request_id,
            identity = %record.identity,
            model = %record.client_model,
            category = %record.category,
            provider = record.provider.as_deref().unwrap_or("-"),
            upstream_model = record.model.as_deref().unwrap_or("-"),
            streamed = record.streamed,
            input_tokens = record.input_tokens,
            output_tokens = record.output_tokens,
            latency_ms = record.latency_ms,
            outcome = ?record.outcome,
            "usage"
        );
    }
}

/// Forwards records to a bounded channel, dropping them when it is full
#[derive(Debug, Clone)]
pub struct ChannelSink {
    sender: mpsc::Sender<UsageRecord>,
    dropped: Arc<AtomicU64>,
}

impl ChannelSink {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<UsageRecord>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (
            Self {
                sender,
                dropped: Arc::new(AtomicU64::new(0)),
            },
            receiver,
        )
    }

    /// Records discarded because the consumer fell behind or went away
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl UsageSink for ChannelSink {
    fn record(&self, record: UsageRecord) {
        if let Err(e) = self.sender.try_send(record) {
            let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            warn!("Usage record dropped ({} so far): {}", dropped, e);
        }
    }
}
