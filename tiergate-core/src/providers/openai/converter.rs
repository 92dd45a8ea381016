//! Conversion between the messages protocol and OpenAI chat completions

use super::types::*;
use crate::protocol::{
    ContentBlock, ImageSource, MessagesRequest, MessagesResponse, Role, StopReason,
    ToolChoice, ToolDefinition, UnifiedMessage, Usage,
};
use crate::providers::convert::{ConvertOptions, DecodedResponse};
use crate::providers::error::{GatewayError, GatewayResult};
use serde_json::{json, Value};

/// Convert a messages request to OpenAI format
pub fn to_openai_request(
    request: &MessagesRequest,
    model_id: &str,
    options: &ConvertOptions,
) -> GatewayResult<OpenAIRequest> {
    let mut messages = Vec::with_capacity(request.messages.len() + 1);

    if let Some(system) = &request.system {
        let text = system.to_text();
        if !text.is_empty() {
            messages.push(OpenAIMessage::new("system", Some(OpenAIContent::Text(text))));
        }
    }

    for (i, message) in request.messages.iter().enumerate() {
        match message.role {
            Role::User => push_user_message(message, i, &mut messages)?,
            Role::Assistant => push_assistant_message(message, i, &mut messages)?,
        }
    }

    let max_tokens = match options.max_tokens_limit {
        Some(limit) => request.max_tokens.min(limit),
        None => request.max_tokens,
    };

    Ok(OpenAIRequest {
        model: model_id.to_string(),
        messages,
        temperature: request.temperature,
        max_tokens: Some(max_tokens),
        top_p: request.top_p,
        stop: request.stop_sequences.clone().filter(|s| !s.is_empty()),
        stream: options.stream.then_some(true),
        stream_options: options.stream.then_some(OpenAIStreamOptions {
            include_usage: Some(true),
        }),
        user: request
            .metadata
            .as_ref()
            .and_then(|m| m.get("user_id"))
            .and_then(Value::as_str)
            .map(str::to_string),
        tools: request
            .tools
            .as_ref()
            .filter(|tools| !tools.is_empty())
            .map(|tools| tools.iter().map(to_openai_tool).collect()),
        tool_choice: request.tool_choice.as_ref().map(to_openai_tool_choice),
    })
}

/// User turn: parts are flushed whenever a tool result interrupts them, so
/// tool messages keep their original position
fn push_user_message(
    message: &UnifiedMessage,
    position: usize,
    out: &mut Vec<OpenAIMessage>,
) -> GatewayResult<()> {
    let mut parts: Vec<OpenAIContentPart> = Vec::new();

    for block in message.blocks() {
        match block {
            ContentBlock::Text { text } => parts.push(OpenAIContentPart::Text { text }),
            ContentBlock::Image { source } => parts.push(OpenAIContentPart::ImageUrl {
                image_url: OpenAIImageUrl {
                    url: image_url(&source),
                    detail: None,
                },
            }),
            ContentBlock::ToolResult {
                tool_use_id,
                content,
                is_error,
            } => {
                flush_user_parts(&mut parts, out);
                let text = content.map(|c| c.to_text()).unwrap_or_default();
                let text = if is_error == Some(true) {
                    format!("Error: {}", text)
                } else {
                    text
                };
                let mut tool = OpenAIMessage::new("tool", Some(OpenAIContent::Text(text)));
                tool.tool_call_id = Some(tool_use_id);
                out.push(tool);
            }
            ContentBlock::ToolUse { .. } => {
                return Err(GatewayError::Conversion(format!(
                    "messages[{}]: tool_use blocks are only valid in assistant messages",
                    position
                )));
            }
            ContentBlock::Thinking { .. } | ContentBlock::RedactedThinking { .. } => {}
        }
    }

    flush_user_parts(&mut parts, out);
    Ok(())
}

fn flush_user_parts(parts: &mut Vec<OpenAIContentPart>, out: &mut Vec<OpenAIMessage>) {
    if parts.is_empty() {
        return;
    }
    let content = match parts.as_slice() {
        [OpenAIContentPart::Text { text }] => OpenAIContent::Text(text.clone()),
        _ => OpenAIContent::Parts(std::mem::take(parts)),
    };
    parts.clear();
    out.push(OpenAIMessage::new("user", Some(content)));
}

/// Assistant turn: text and tool calls that follow a tool call start a new
/// assistant message, which keeps interleaved ordering intact
fn push_assistant_message(
    message: &UnifiedMessage,
    position: usize,
    out: &mut Vec<OpenAIMessage>,
) -> GatewayResult<()> {
    let mut current = AssistantTurn::default();

    for block in message.blocks() {
        match block {
            ContentBlock::Text { text } => {
                if !current.tool_calls.is_empty() {
                    current.flush(out);
                }
                current.text.push_str(&text);
            }
            ContentBlock::Thinking { thinking, .. } => {
                if !current.tool_calls.is_empty() || !current.text.is_empty() {
                    current.flush(out);
                }
                current.reasoning.push_str(&thinking);
            }
            ContentBlock::RedactedThinking { .. } => {}
            ContentBlock::ToolUse { id, name, input } => {
                current.tool_calls.push(OpenAIToolCall {
                    id,
                    tool_type: "function".to_string(),
                    function: OpenAIFunctionCall {
                        name,
                        arguments: tool_arguments(&input),
                    },
                });
            }
            ContentBlock::ToolResult { .. } | ContentBlock::Image { .. } => {
                return Err(GatewayError::Conversion(format!(
                    "messages[{}]: assistant messages may only carry text, thinking and tool_use",
                    position
                )));
            }
        }
    }

    current.flush(out);
    Ok(())
}

#[derive(Default)]
struct AssistantTurn {
    text: String,
    reasoning: String,
    tool_calls: Vec<OpenAIToolCall>,
}

impl AssistantTurn {
    fn flush(&mut self, out: &mut Vec<OpenAIMessage>) {
        if self.text.is_empty() && self.reasoning.is_empty() && self.tool_calls.is_empty() {
            return;
        }
        let mut message = OpenAIMessage::new(
            "assistant",
            (!self.text.is_empty()).then(|| OpenAIContent::Text(std::mem::take(&mut self.text))),
        );
        if !self.reasoning.is_empty() {
            message.reasoning_content = Some(std::mem::take(&mut self.reasoning));
        }
        if !self.tool_calls.is_empty() {
            message.tool_calls = Some(std::mem::take(&mut self.tool_calls));
        }
        self.text.clear();
        out.push(message);
    }
}

/// Tool inputs travel as JSON text; a string input is already the raw text
fn tool_arguments(input: &Value) -> String {
    match input {
        Value::String(raw) => raw.clone(),
        other => other.to_string(),
    }
}

fn image_url(source: &ImageSource) -> String {
    match source {
        ImageSource::Url { url } => url.clone(),
        ImageSource::Base64 { media_type, data } => format!("data:{};base64,{}", media_type, data),
    }
}

fn to_openai_tool(tool: &ToolDefinition) -> OpenAITool {
    OpenAITool {
        tool_type: "function".to_string(),
        function: OpenAIFunction {
            name: tool.name.clone(),
            description: tool.description.clone(),
            parameters: Some(tool.input_schema.clone()),
        },
    }
}

fn to_openai_tool_choice(choice: &ToolChoice) -> Value {
    match choice {
        ToolChoice::Auto => json!("auto"),
        ToolChoice::Any => json!("required"),
        ToolChoice::None => json!("none"),
        ToolChoice::Tool { name } => json!({
            "type": "function",
            "function": {"name": name}
        }),
    }
}

/// Map an OpenAI `finish_reason` to a stop reason
pub fn map_finish_reason(reason: &str) -> StopReason {
    match reason {
        "length" => StopReason::MaxTokens,
        "tool_calls" | "function_call" => StopReason::ToolUse,
        _ => StopReason::EndTurn,
    }
}

/// Parse tool arguments; text that is not a JSON object is kept verbatim
pub fn parse_tool_arguments(arguments: &str) -> Value {
    if arguments.trim().is_empty() {
        return json!({});
    }
    match serde_json::from_str::<Value>(arguments) {
        Ok(value @ Value::Object(_)) => value,
        _ => Value::String(arguments.to_string()),
    }
}

pub(crate) fn usage_from_openai(usage: &OpenAIUsage) -> Usage {
    Usage {
        input_tokens: usage.prompt_tokens,
        output_tokens: usage.completion_tokens,
        cache_creation_input_tokens: None,
        cache_read_input_tokens: usage
            .prompt_tokens_details
            .as_ref()
            .and_then(|d| d.cached_tokens),
    }
}

/// Convert an OpenAI response to the messages protocol
pub(crate) fn from_openai_response(value: Value) -> GatewayResult<DecodedResponse> {
    if let Some(message) = value.pointer("/error/message").and_then(Value::as_str) {
        return Err(GatewayError::MalformedResponse(message.to_string()));
    }

    let response: OpenAIResponse = serde_json::from_value(value).map_err(|e| {
        GatewayError::MalformedResponse(format!("unexpected chat completion shape: {}", e))
    })?;

    let Some(choice) = response.choices.into_iter().next() else {
        return Err(GatewayError::MalformedResponse(
            "chat completion has no choices".to_string(),
        ));
    };

    let content = blocks_from_openai_message(choice.message);
    let has_tool_calls = content
        .iter()
        .any(|block| matches!(block, ContentBlock::ToolUse { .. }));

    let id = if response.id.is_empty() {
        format!("msg_{}", uuid::Uuid::new_v4().simple())
    } else {
        format!("msg_{}", response.id)
    };

    let mut message = MessagesResponse::new(id, response.model, content);
    message.stop_reason = Some(match choice.finish_reason.as_deref() {
        Some(reason) => {
            let mapped = map_finish_reason(reason);
            if has_tool_calls && mapped == StopReason::EndTurn {
                StopReason::ToolUse
            } else {
                mapped
            }
        }
        None if has_tool_calls => StopReason::ToolUse,
        None => StopReason::EndTurn,
    });

    let usage_missing = response.usage.is_none();
    if let Some(usage) = &response.usage {
        message.usage = usage_from_openai(usage);
    }

    Ok(DecodedResponse {
        response: message,
        usage_missing,
    })
}

/// Blocks of one assistant message: reasoning, text, then tool calls
pub fn blocks_from_openai_message(message: OpenAIMessage) -> Vec<ContentBlock> {
    let mut blocks = Vec::new();

    if let Some(reasoning) = message.reasoning_content.filter(|r| !r.is_empty()) {
        blocks.push(ContentBlock::thinking(reasoning));
    }

    if let Some(text) = message.content.map(|c| c.text()).filter(|t| !t.is_empty()) {
        blocks.push(ContentBlock::text(text));
    }

    for call in message.tool_calls.unwrap_or_default() {
        blocks.push(ContentBlock::tool_use(
            call.id,
            call.function.name,
            parse_tool_arguments(&call.function.arguments),
        ));
    }

    blocks
}
