//! Client-facing stream orchestration
//!
//! A stream is opened in two phases. While no content block has reached the
//! client the proxy may still fall back to the next candidate, so events are
//! held back until the first `content_block_start`. Once that event is
//! released the stream is committed to its provider: later upstream failures
//! end the stream with an `error` event instead of falling back.

use crate::context::RequestContext;
use crate::protocol::{MessagesRequest, ModelCategory, StreamEvent};
use crate::providers::{
    abort_stream, finish_stream, translate_chunk, Candidate, CandidateFailure, ConverterState,
    GatewayError, GatewayResult, ProviderRouter, ResponseContext, RoutedStream,
};
use crate::sink::{UsageRecord, UsageSink};
use crate::http::ByteStream;
use futures::{Stream, StreamExt};
use std::collections::VecDeque;
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, warn};

/// Events buffered between the pump task and the client
const CHANNEL_CAPACITY: usize = 64;

/// Opens client streams with pre-delivery fallback
#[derive(Clone)]
pub struct StreamingProxy {
    router: ProviderRouter,
    sink: Arc<dyn UsageSink>,
}

impl fmt::Debug for StreamingProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamingProxy")
            .field("router", &self.router)
            .finish()
    }
}

/// One upstream stream being translated
struct Session {
    candidate: Candidate,
    body: ByteStream,
    state: ConverterState,
    chunk_timeout: Duration,
}

impl Session {
    fn new(routed: RoutedStream, response_ctx: &ResponseContext) -> Self {
        let chunk_timeout = routed.candidate.provider.timeout();
        Self {
            candidate: routed.candidate,
            body: routed.body,
            state: ConverterState::new(response_ctx),
            chunk_timeout,
        }
    }

    /// Read until the first content block starts or the stream ends
    async fn prime(&mut self, zero_output_is_failure: bool) -> GatewayResult<Vec<StreamEvent>> {
        let format = self.candidate.wire_format();
        let mut buffered = Vec::new();

        loop {
            match tokio::time::timeout(self.chunk_timeout, self.body.next()).await {
                Err(_) => return Err(GatewayError::UpstreamTimeout(self.chunk_timeout)),
                Ok(Some(Err(e))) => return Err(e),
                Ok(Some(Ok(chunk))) => buffered.extend(translate_chunk(format, &chunk, &mut self.state)),
                Ok(None) => buffered.extend(finish_stream(format, &mut self.state)),
            }

            if self.state.blocks_started() > 0 {
                return Ok(buffered);
            }
            if self.state.is_finished() {
                if let Some(message) = self.state.failure() {
                    return Err(GatewayError::MalformedResponse(format!(
                        "stream failed before any output: {}",
                        message
                    )));
                }
                if zero_output_is_failure {
                    return Err(GatewayError::ZeroOutputTokens {
                        provider: self.candidate.provider.name.clone(),
                        model: self.candidate.model.clone(),
                    });
                }
                return Ok(buffered);
            }
        }
    }
}

/// Client-facing event stream
///
/// Dropping it cancels the upstream read.
pub struct ProxyStream {
    pending: VecDeque<StreamEvent>,
    receiver: Option<mpsc::Receiver<StreamEvent>>,
    provider: String,
    model: String,
    _cancel: DropGuard,
}

impl ProxyStream {
    pub fn provider(&self) -> &str {
        &self.provider
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

impl fmt::Debug for ProxyStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyStream")
            .field("provider", &self.provider)
            .field("model", &self.model)
            .field("pending", &self.pending.len())
            .finish()
    }
}

impl Stream for ProxyStream {
    type Item = StreamEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if let Some(event) = this.pending.pop_front() {
            return Poll::Ready(Some(event));
        }
        match this.receiver.as_mut() {
            Some(receiver) => receiver.poll_recv(cx),
            None => Poll::Ready(None),
        }
    }
}

impl StreamingProxy {
    pub fn new(router: ProviderRouter, sink: Arc<dyn UsageSink>) -> Self {
        Self { router, sink }
    }

    /// Open a client stream, falling back across candidates until one
    /// delivers its first content block
    pub async fn open(&self, ctx: RequestContext, request: MessagesRequest) -> GatewayResult<ProxyStream> {
        let category = self.router.resolve(&ctx, &request.model)?;
        let plan = self.router.plan(&ctx, category).await;
        let mut failures = plan.skipped;
        let response_ctx = ResponseContext::for_request(&request);
        let zero_output_is_failure = ctx.snapshot.config.retry.retry_on_zero_output;

        for candidate in plan.candidates {
            let routed = match self.router.open_stream(&ctx, &candidate, &request).await {
                Ok(routed) => routed,
                Err(e) if e.aborts_routing() => return Err(e),
                Err(e) => {
                    warn!(
                        "Could not open stream on {} [request_id: {}]: {}",
                        candidate, ctx.request_id, e
                    );
                    failures.push(CandidateFailure::new(&candidate.provider.name, &candidate.model, &e));
                    continue;
                }
            };

            let mut session = Session::new(routed, &response_ctx);
            match session.prime(zero_output_is_failure).await {
                Ok(buffered) => {
                    info!(
                        "Streaming {} from {} [request_id: {}]",
                        request.model, candidate, ctx.request_id
                    );
                    return Ok(self.commit(ctx, &request.model, category, session, buffered));
                }
                Err(e) => {
                    warn!(
                        "Stream on {} failed before delivery, falling back [request_id: {}]: {}",
                        candidate, ctx.request_id, e
                    );
                    self.router.record_stream_failure(&candidate, &e);
                    failures.push(CandidateFailure::new(&candidate.provider.name, &candidate.model, &e));
                }
            }
        }

        Err(GatewayError::ExhaustedCandidates(failures))
    }

    fn commit(
        &self,
        ctx: RequestContext,
        client_model: &str,
        category: ModelCategory,
        session: Session,
        buffered: Vec<StreamEvent>,
    ) -> ProxyStream {
        let cancel = CancellationToken::new();
        let record = UsageRecord::begin(&ctx, client_model, category, true)
            .served_by(session.candidate.provider_name(), &session.candidate.model);
        let provider = session.candidate.provider.name.clone();
        let model = session.candidate.model.clone();

        let receiver = if session.state.is_finished() {
            self.sink.record(record.complete(
                &ctx,
                &session.state.final_usage(),
                session.state.stop_reason(),
            ));
            None
        } else {
            let (sender, receiver) = mpsc::channel(CHANNEL_CAPACITY);
            let pump = Pump {
                session,
                sender,
                cancel: cancel.clone(),
                heartbeat: Duration::from_secs(ctx.snapshot.config.server.heartbeat_interval_secs),
                router: self.router.clone(),
                sink: Arc::clone(&self.sink),
                record,
                ctx,
            };
            tokio::spawn(pump.run());
            Some(receiver)
        };

        ProxyStream {
            pending: buffered.into(),
            receiver,
            provider,
            model,
            _cancel: cancel.drop_guard(),
        }
    }
}

/// Background task forwarding a committed stream
struct Pump {
    session: Session,
    sender: mpsc::Sender<StreamEvent>,
    cancel: CancellationToken,
    heartbeat: Duration,
    router: ProviderRouter,
    sink: Arc<dyn UsageSink>,
    record: UsageRecord,
    ctx: RequestContext,
}

impl Pump {
    async fn run(mut self) {
        let format = self.session.candidate.wire_format();
        let chunk_timeout = self.session.chunk_timeout;
        let heartbeat = tokio::time::sleep(self.heartbeat);
        tokio::pin!(heartbeat);
        let mut deadline = Instant::now() + chunk_timeout;
        let mut upstream_error: Option<GatewayError> = None;

        while !self.session.state.is_finished() {
            let events = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    self.client_gone();
                    return;
                }
                _ = &mut heartbeat => vec![StreamEvent::Ping],
                next = tokio::time::timeout_at(deadline, self.session.body.next()) => match next {
                    Err(_) => {
                        let error = GatewayError::UpstreamTimeout(chunk_timeout);
                        let events = abort_stream(&mut self.session.state, &error.to_string());
                        upstream_error = Some(error);
                        events
                    }
                    Ok(Some(Ok(chunk))) => {
                        deadline = Instant::now() + chunk_timeout;
                        translate_chunk(format, &chunk, &mut self.session.state)
                    }
                    Ok(Some(Err(error))) => {
                        let events = abort_stream(&mut self.session.state, &error.to_string());
                        upstream_error = Some(error);
                        events
                    }
                    Ok(None) => finish_stream(format, &mut self.session.state),
                },
            };

            if events.is_empty() {
                continue;
            }
            for event in events {
                if self.sender.send(event).await.is_err() {
                    self.client_gone();
                    return;
                }
            }
            heartbeat.as_mut().reset(Instant::now() + self.heartbeat);
        }

        let state = &self.session.state;
        let record = match state.failure() {
            Some(message) => {
                let error = upstream_error
                    .unwrap_or_else(|| GatewayError::MalformedResponse(message.to_string()));
                warn!(
                    "Stream from {} ended in error after delivery [request_id: {}]: {}",
                    self.session.candidate, self.ctx.request_id, error
                );
                self.router.record_stream_failure(&self.session.candidate, &error);
                self.record.failed(&self.ctx, message)
            }
            None => self.record.complete(&self.ctx, &state.final_usage(), state.stop_reason()),
        };
        self.sink.record(record);
    }

    fn client_gone(self) {
        debug!(
            "Client left stream from {}, cancelling upstream [request_id: {}]",
            self.session.candidate, self.ctx.request_id
        );
        self.sink.record(self.record.failed(&self.ctx, "client disconnected"));
    }
}
