//! Streaming translation of OpenAI chat completion chunks
//!
//! Reasoning deltas become a thinking block and content deltas a text block,
//! both streamed as they arrive. Tool calls are collected per call index,
//! since parallel calls may interleave their argument fragments, and each is
//! emitted as its own tool_use block once the turn finishes.

use super::converter::{map_finish_reason, usage_from_openai};
use super::types::{OpenAIStreamChunk, OpenAIToolCallDelta};
use crate::protocol::{BlockDelta, ContentBlock, StreamEvent};
use crate::providers::convert::{BlockKind, ConverterState};
use crate::providers::sse::SseEvent;
use serde_json::{json, Value};
use tracing::{debug, warn};

const DONE_SENTINEL: &str = "[DONE]";

/// Translate one OpenAI SSE event
pub(crate) fn translate_openai_event(
    sse_event: &SseEvent,
    state: &mut ConverterState,
    events: &mut Vec<StreamEvent>,
) {
    let data = sse_event.data.trim();
    if data.is_empty() {
        return;
    }

    if data == DONE_SENTINEL {
        flush_tool_calls(state, events);
        state.finalize(events);
        return;
    }

    let Some(value) = state.take_json(data) else {
        return;
    };

    if let Some(error) = value.get("error") {
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("upstream stream error")
            .to_string();
        state.fail(message, events);
        return;
    }

    let chunk: OpenAIStreamChunk = match serde_json::from_value(value) {
        Ok(chunk) => chunk,
        Err(e) => {
            debug!("Ignoring unrecognised chat completion chunk: {}", e);
            return;
        }
    };

    if state.message_id.is_none() && !chunk.id.is_empty() {
        state.message_id = Some(format!("msg_{}", chunk.id));
    }
    state.ensure_started(events);

    for choice in chunk.choices.into_iter().filter(|c| c.index == 0) {
        let delta = choice.delta;

        if let Some(reasoning) = delta.reasoning_content.filter(|r| !r.is_empty()) {
            ensure_block(state, BlockKind::Thinking, events);
            state.delta(BlockDelta::ThinkingDelta { thinking: reasoning }, events);
        }

        if let Some(text) = delta.content.filter(|t| !t.is_empty()) {
            ensure_block(state, BlockKind::Text, events);
            state.delta(BlockDelta::TextDelta { text }, events);
        }

        for call in delta.tool_calls.unwrap_or_default() {
            apply_tool_call_delta(state, call);
        }

        if let Some(reason) = choice.finish_reason {
            flush_tool_calls(state, events);
            state.stop_reason = Some(map_finish_reason(&reason));
        }
    }

    if let Some(usage) = &chunk.usage {
        state.usage = Some(usage_from_openai(usage));
    }
}

/// Keep the open text or thinking block, or switch to a fresh one
fn ensure_block(state: &mut ConverterState, kind: BlockKind, events: &mut Vec<StreamEvent>) {
    if state.open_block.is_some_and(|open| open.kind == kind) {
        return;
    }
    let block = match kind {
        BlockKind::Thinking => ContentBlock::Thinking {
            thinking: String::new(),
            signature: None,
        },
        _ => ContentBlock::text(""),
    };
    state.open_block(kind, block, None, events);
}

fn apply_tool_call_delta(state: &mut ConverterState, call: OpenAIToolCallDelta) {
    let key = call.index;
    let (name, arguments) = match call.function {
        Some(function) => (function.name, function.arguments),
        None => (None, None),
    };

    let slot = state.tool_slots.entry(key).or_default();
    if slot.block_index.is_some() {
        warn!("Dropping delta for tool call {} after the turn's tool calls were emitted", key);
        return;
    }
    if slot.id.is_none() {
        slot.id = call.id.filter(|id| !id.is_empty());
    }
    if slot.name.is_none() {
        slot.name = name.filter(|n| !n.is_empty());
    }
    if let Some(arguments) = arguments {
        slot.pending_args.push_str(&arguments);
    }
}

/// Emit every collected tool call as its own tool_use block, in call order
fn flush_tool_calls(state: &mut ConverterState, events: &mut Vec<StreamEvent>) {
    let keys: Vec<usize> = state
        .tool_slots
        .iter()
        .filter(|(_, slot)| slot.block_index.is_none())
        .filter(|(_, slot)| slot.id.is_some() || slot.name.is_some() || !slot.pending_args.is_empty())
        .map(|(key, _)| *key)
        .collect();

    for key in keys {
        let Some(slot) = state.tool_slots.get_mut(&key) else {
            continue;
        };
        let id = slot
            .id
            .get_or_insert_with(|| format!("toolu_{}", uuid::Uuid::new_v4().simple()))
            .clone();
        let name = match slot.name.clone() {
            Some(name) => name,
            None => {
                warn!("Tool call {} ({}) ended without a function name", key, id);
                String::new()
            }
        };
        let arguments = std::mem::take(&mut slot.pending_args);

        let block = ContentBlock::tool_use(id, name, json!({}));
        let index = state.open_block(BlockKind::ToolUse, block, Some(key), events);
        if let Some(slot) = state.tool_slots.get_mut(&key) {
            slot.block_index = Some(index);
        }
        if !arguments.is_empty() {
            state.delta(BlockDelta::InputJsonDelta { partial_json: arguments }, events);
        }
    }
}
