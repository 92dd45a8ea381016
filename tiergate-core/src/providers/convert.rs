//! Protocol conversion facade
//!
//! Request and response bodies are converted by pure functions. Streams are
//! converted chunk by chunk through [`translate_chunk`], which is a pure
//! function of `(ConverterState, chunk)`; all buffering lives in the state.

use super::error::{GatewayError, GatewayResult};
use super::openai::types::OpenAIRequest;
use super::sse::{SseEvent, SseParser};
use super::{anthropic, openai, tokens};
use crate::config::WireFormat;
use crate::protocol::{
    BlockDelta, ContentBlock, DeltaUsage, MessageDeltaBody, MessagesRequest, MessagesResponse,
    StopReason, StreamEvent, Usage,
};
use bytes::Bytes;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Upper bound on a JSON payload held back while waiting for its remainder
pub const MAX_PENDING_JSON: usize = 1024 * 1024;

/// Per-call conversion options
#[derive(Debug, Clone, Default)]
pub struct ConvertOptions {
    /// Ask the provider for a streamed response
    pub stream: bool,
    /// Provider ceiling on output tokens
    pub max_tokens_limit: Option<u32>,
}

/// Outbound body in the provider's wire format
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum ProviderRequestBody {
    Native(MessagesRequest),
    Openai(OpenAIRequest),
}

/// Context needed to present a provider response to the client
#[derive(Debug, Clone)]
pub struct ResponseContext {
    /// Model name the client asked for; echoed back in responses
    pub client_model: String,
    /// Estimated input tokens, used when the provider omits usage
    pub input_estimate: u32,
}

impl ResponseContext {
    pub fn for_request(request: &MessagesRequest) -> Self {
        Self {
            client_model: request.model.clone(),
            input_estimate: tokens::estimate_request(request),
        }
    }
}

/// Build the outbound request body for a provider
pub fn to_provider_request(
    request: &MessagesRequest,
    format: WireFormat,
    model_id: &str,
    options: &ConvertOptions,
) -> GatewayResult<ProviderRequestBody> {
    if request.messages.is_empty() {
        return Err(GatewayError::Conversion(
            "messages: at least one message is required".to_string(),
        ));
    }
    if request.max_tokens == 0 {
        return Err(GatewayError::Conversion(
            "max_tokens: must be greater than 0".to_string(),
        ));
    }

    match format {
        WireFormat::Native => Ok(ProviderRequestBody::Native(anthropic::to_native_request(
            request, model_id, options,
        ))),
        WireFormat::Openai => Ok(ProviderRequestBody::Openai(
            openai::converter::to_openai_request(request, model_id, options)?,
        )),
    }
}

/// Decode a provider response body into the client-facing response
pub fn from_provider_response(
    format: WireFormat,
    body: &[u8],
    ctx: &ResponseContext,
) -> GatewayResult<MessagesResponse> {
    let value: Value = serde_json::from_slice(body)
        .map_err(|e| GatewayError::MalformedResponse(format!("invalid JSON body: {}", e)))?;

    let decoded = match format {
        WireFormat::Native => anthropic::from_native_response(value)?,
        WireFormat::Openai => openai::converter::from_openai_response(value)?,
    };

    let mut response = decoded.response;
    response.model = ctx.client_model.clone();
    if decoded.usage_missing {
        response.usage.input_tokens = ctx.input_estimate;
        response.usage.output_tokens = tokens::estimate_response(&response);
    }
    Ok(response)
}

/// Provider response before client-facing fixups
#[derive(Debug)]
pub(crate) struct DecodedResponse {
    pub response: MessagesResponse,
    pub usage_missing: bool,
}

/// Kind of the currently open content block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BlockKind {
    Text,
    Thinking,
    ToolUse,
    Other,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct OpenBlock {
    pub index: usize,
    pub kind: BlockKind,
    /// Upstream identifier of the block (tool call index or native block index)
    pub key: Option<usize>,
}

/// Incrementally assembled tool call
#[derive(Debug, Clone, Default)]
pub(crate) struct ToolSlot {
    pub id: Option<String>,
    pub name: Option<String>,
    /// Argument text accumulated until the turn's tool calls are emitted
    pub pending_args: String,
    pub block_index: Option<usize>,
}

/// Explicit state threaded through successive [`translate_chunk`] calls
#[derive(Debug, Clone)]
pub struct ConverterState {
    pub(crate) client_model: String,
    pub(crate) message_id: Option<String>,
    pub(crate) started: bool,
    pub(crate) finished: bool,
    pub(crate) open_block: Option<OpenBlock>,
    pub(crate) next_index: usize,
    pub(crate) blocks_started: usize,
    pub(crate) tool_slots: BTreeMap<usize, ToolSlot>,
    pub(crate) stop_reason: Option<StopReason>,
    pub(crate) stop_sequence: Option<String>,
    pub(crate) usage: Option<Usage>,
    pub(crate) input_estimate: u32,
    pub(crate) output_chars: usize,
    pub(crate) pending_json: String,
    pub(crate) failure: Option<String>,
    sse: SseParser,
}

impl ConverterState {
    pub fn new(ctx: &ResponseContext) -> Self {
        Self {
            client_model: ctx.client_model.clone(),
            message_id: None,
            started: false,
            finished: false,
            open_block: None,
            next_index: 0,
            blocks_started: 0,
            tool_slots: BTreeMap::new(),
            stop_reason: None,
            stop_sequence: None,
            usage: None,
            input_estimate: ctx.input_estimate,
            output_chars: 0,
            pending_json: String::new(),
            failure: None,
            sse: SseParser::new(),
        }
    }

    /// `message_start` has been emitted
    pub fn is_started(&self) -> bool {
        self.started
    }

    /// A terminal event has been emitted
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Number of content blocks opened so far
    pub fn blocks_started(&self) -> usize {
        self.blocks_started
    }

    /// Terminal error message, when the stream ended in an `error` event
    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    pub fn stop_reason(&self) -> Option<StopReason> {
        self.stop_reason
    }

    /// Usage as it will be reported in the closing `message_delta`
    pub fn final_usage(&self) -> Usage {
        match &self.usage {
            Some(usage) => usage.clone(),
            None => Usage::new(
                self.input_estimate,
                self.output_chars.div_ceil(tokens::CHARS_PER_TOKEN) as u32,
            ),
        }
    }

    pub(crate) fn message_id(&mut self) -> String {
        self.message_id
            .get_or_insert_with(|| format!("msg_{}", uuid::Uuid::new_v4().simple()))
            .clone()
    }

    /// Emit `message_start` (and the customary ping) once
    pub(crate) fn ensure_started(&mut self, events: &mut Vec<StreamEvent>) {
        if self.started {
            return;
        }
        let mut message = MessagesResponse::new(self.message_id(), self.client_model.clone(), Vec::new());
        message.usage = Usage::new(self.input_estimate, 0);
        self.started = true;
        events.push(StreamEvent::MessageStart { message });
        events.push(StreamEvent::Ping);
    }

    /// Open a new block, closing whichever block is open
    pub(crate) fn open_block(
        &mut self,
        kind: BlockKind,
        content_block: ContentBlock,
        key: Option<usize>,
        events: &mut Vec<StreamEvent>,
    ) -> usize {
        self.close_block(events);
        let index = self.next_index;
        self.next_index += 1;
        self.blocks_started += 1;
        self.open_block = Some(OpenBlock { index, kind, key });
        events.push(StreamEvent::ContentBlockStart {
            index,
            content_block,
        });
        index
    }

    pub(crate) fn close_block(&mut self, events: &mut Vec<StreamEvent>) {
        if let Some(open) = self.open_block.take() {
            events.push(StreamEvent::ContentBlockStop { index: open.index });
        }
    }

    pub(crate) fn delta(&mut self, delta: BlockDelta, events: &mut Vec<StreamEvent>) {
        let Some(open) = self.open_block else {
            return;
        };
        self.output_chars += match &delta {
            BlockDelta::TextDelta { text } => text.chars().count(),
            BlockDelta::ThinkingDelta { thinking } => thinking.chars().count(),
            BlockDelta::InputJsonDelta { partial_json } => partial_json.chars().count(),
            BlockDelta::SignatureDelta { .. } => 0,
        };
        events.push(StreamEvent::ContentBlockDelta {
            index: open.index,
            delta,
        });
    }

    /// Close the open block and emit `message_delta` + `message_stop`
    pub(crate) fn finalize(&mut self, events: &mut Vec<StreamEvent>) {
        if self.finished {
            return;
        }
        self.ensure_started(events);
        self.close_block(events);
        let usage = self.final_usage();
        events.push(StreamEvent::MessageDelta {
            delta: MessageDeltaBody {
                stop_reason: Some(self.stop_reason.unwrap_or(StopReason::EndTurn)),
                stop_sequence: self.stop_sequence.clone(),
            },
            usage: DeltaUsage {
                input_tokens: Some(usage.input_tokens),
                output_tokens: usage.output_tokens,
            },
        });
        events.push(StreamEvent::MessageStop);
        self.finished = true;
    }

    /// Terminate with an `error` event, keeping the event sequence well formed
    pub(crate) fn fail(&mut self, message: impl Into<String>, events: &mut Vec<StreamEvent>) {
        self.fail_with("api_error", message, events);
    }

    pub(crate) fn fail_with(
        &mut self,
        kind: &str,
        message: impl Into<String>,
        events: &mut Vec<StreamEvent>,
    ) {
        if self.finished {
            return;
        }
        let message = message.into();
        self.ensure_started(events);
        self.close_block(events);
        events.push(StreamEvent::error(kind, message.clone()));
        self.failure = Some(message);
        self.finished = true;
    }

    /// Parse a data payload, holding back fragments until they complete
    pub(crate) fn take_json(&mut self, data: &str) -> Option<Value> {
        let candidate = if self.pending_json.is_empty() {
            data.to_string()
        } else {
            format!("{}{}", self.pending_json, data)
        };

        match serde_json::from_str::<Value>(&candidate) {
            Ok(value) => {
                self.pending_json.clear();
                Some(value)
            }
            Err(e) if e.is_eof() => {
                if candidate.len() > MAX_PENDING_JSON {
                    warn!("Dropping oversized partial stream payload ({} bytes)", candidate.len());
                    self.pending_json.clear();
                } else {
                    debug!("Buffering partial stream payload ({} bytes)", candidate.len());
                    self.pending_json = candidate;
                }
                None
            }
            Err(e) => {
                if !self.pending_json.is_empty() {
                    self.pending_json.clear();
                    if let Ok(value) = serde_json::from_str::<Value>(data) {
                        return Some(value);
                    }
                }
                warn!("Skipping malformed stream payload: {}", e);
                None
            }
        }
    }
}

/// Translate one raw upstream chunk into client-facing events
pub fn translate_chunk(
    format: WireFormat,
    chunk: &Bytes,
    state: &mut ConverterState,
) -> Vec<StreamEvent> {
    let sse_events = state.sse.push_bytes(chunk);
    dispatch_events(format, sse_events, state)
}

/// The upstream body ended; flush buffers and close the stream
pub fn finish_stream(format: WireFormat, state: &mut ConverterState) -> Vec<StreamEvent> {
    let trailing = state.sse.finish();
    let mut events = dispatch_events(format, trailing, state);

    if !state.finished {
        if state.stop_reason.is_some() {
            state.finalize(&mut events);
        } else {
            state.fail("upstream stream ended before completion", &mut events);
        }
    }
    events
}

/// Terminate a stream that failed for reasons outside the body
pub fn abort_stream(state: &mut ConverterState, message: &str) -> Vec<StreamEvent> {
    let mut events = Vec::new();
    state.fail(message, &mut events);
    events
}

fn dispatch_events(
    format: WireFormat,
    sse_events: Vec<SseEvent>,
    state: &mut ConverterState,
) -> Vec<StreamEvent> {
    let mut events = Vec::new();
    for sse_event in sse_events {
        if state.finished {
            break;
        }
        match format {
            WireFormat::Native => anthropic::translate_native_event(&sse_event, state, &mut events),
            WireFormat::Openai => {
                openai::streaming::translate_openai_event(&sse_event, state, &mut events)
            }
        }
    }
    events
}
