//! Native (messages protocol) providers
//!
//! Bodies pass through with the concrete model substituted. Streams are
//! re-emitted event by event so the client always sees a well formed
//! sequence even when the upstream misbehaves.

use super::convert::{BlockKind, ConvertOptions, ConverterState, DecodedResponse};
use super::error::{GatewayError, GatewayResult};
use super::sse::SseEvent;
use crate::protocol::{ContentBlock, MessagesRequest, MessagesResponse, StreamEvent, Usage};
use serde_json::Value;
use tracing::debug;

/// Messages API version sent to native providers
pub const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Build the native request: the client body with the concrete model
pub fn to_native_request(
    request: &MessagesRequest,
    model_id: &str,
    options: &ConvertOptions,
) -> MessagesRequest {
    let mut outbound = request.clone();
    outbound.model = model_id.to_string();
    outbound.max_tokens = match options.max_tokens_limit {
        Some(limit) => request.max_tokens.min(limit),
        None => request.max_tokens,
    };
    outbound.stream = options.stream.then_some(true);
    outbound
}

pub(crate) fn from_native_response(value: Value) -> GatewayResult<DecodedResponse> {
    if value.get("type").and_then(Value::as_str) == Some("error") {
        let message = value
            .pointer("/error/message")
            .and_then(Value::as_str)
            .unwrap_or("provider returned an error body");
        return Err(GatewayError::MalformedResponse(message.to_string()));
    }

    let usage_missing = value.get("usage").is_none();
    let response: MessagesResponse = serde_json::from_value(value)
        .map_err(|e| GatewayError::MalformedResponse(format!("unexpected message shape: {}", e)))?;

    Ok(DecodedResponse {
        response,
        usage_missing,
    })
}

fn block_kind(block: &ContentBlock) -> BlockKind {
    match block {
        ContentBlock::Text { .. } => BlockKind::Text,
        ContentBlock::Thinking { .. } | ContentBlock::RedactedThinking { .. } => BlockKind::Thinking,
        ContentBlock::ToolUse { .. } => BlockKind::ToolUse,
        _ => BlockKind::Other,
    }
}

/// Re-emit one native stream event, tracking state
pub(crate) fn translate_native_event(
    sse_event: &SseEvent,
    state: &mut ConverterState,
    events: &mut Vec<StreamEvent>,
) {
    if sse_event.data.is_empty() {
        return;
    }
    let Some(value) = state.take_json(&sse_event.data) else {
        return;
    };

    let event: StreamEvent = match serde_json::from_value(value) {
        Ok(event) => event,
        Err(e) => {
            debug!("Ignoring unrecognised native stream event: {}", e);
            return;
        }
    };

    match event {
        StreamEvent::MessageStart { mut message } => {
            if state.started {
                return;
            }
            state.message_id = Some(message.id.clone());
            state.usage = Some(Usage {
                output_tokens: 0,
                ..message.usage.clone()
            });
            message.model = state.client_model.clone();
            message.content.clear();
            state.started = true;
            events.push(StreamEvent::MessageStart { message });
        }
        StreamEvent::ContentBlockStart {
            index,
            content_block,
        } => {
            state.ensure_started(events);
            let kind = block_kind(&content_block);
            state.open_block(kind, content_block, Some(index), events);
        }
        StreamEvent::ContentBlockDelta { index, delta } => {
            if state.open_block.is_some_and(|open| open.key == Some(index)) {
                state.delta(delta, events);
            } else {
                debug!("Dropping delta for block {} which is not open", index);
            }
        }
        StreamEvent::ContentBlockStop { index } => {
            if state.open_block.is_some_and(|open| open.key == Some(index)) {
                state.close_block(events);
            }
        }
        StreamEvent::MessageDelta { delta, usage } => {
            state.stop_reason = delta.stop_reason.or(state.stop_reason);
            state.stop_sequence = delta.stop_sequence.or(state.stop_sequence.take());
            let input_estimate = state.input_estimate;
            let recorded = state.usage.get_or_insert_with(|| Usage::new(input_estimate, 0));
            recorded.output_tokens = usage.output_tokens;
            if let Some(input) = usage.input_tokens {
                recorded.input_tokens = input;
            }
        }
        StreamEvent::MessageStop => state.finalize(events),
        StreamEvent::Ping => {
            if state.started {
                events.push(StreamEvent::Ping);
            }
        }
        StreamEvent::Error { error } => state.fail_with(&error.kind, error.message, events),
    }
}
