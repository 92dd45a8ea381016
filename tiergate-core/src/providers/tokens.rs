//! Deterministic token estimation
//!
//! Used when a provider omits usage counters and by the local count endpoint.
//! The rule is one token per four characters, rounded up, over every
//! text-bearing field, plus a flat charge per image.

use crate::protocol::{
    ContentBlock, CountTokensRequest, MessagesRequest, MessagesResponse, SystemPrompt,
    ToolDefinition, UnifiedMessage,
};

/// Characters per estimated token
pub const CHARS_PER_TOKEN: usize = 4;

/// Flat estimate for one image block
pub const IMAGE_TOKENS: u32 = 256;

/// Tokens for a run of text
pub fn estimate_text(text: &str) -> u32 {
    let chars = text.chars().count();
    chars.div_ceil(CHARS_PER_TOKEN) as u32
}

/// Tokens for one content block
pub fn estimate_block(block: &ContentBlock) -> u32 {
    match block {
        ContentBlock::Text { text } => estimate_text(text),
        ContentBlock::Image { .. } => IMAGE_TOKENS,
        ContentBlock::ToolUse { name, input, .. } => {
            estimate_text(name) + estimate_text(&input.to_string())
        }
        ContentBlock::ToolResult { content, .. } => content
            .as_ref()
            .map(|c| match c {
                crate::protocol::ToolResultContent::Text(text) => estimate_text(text),
                crate::protocol::ToolResultContent::Blocks(blocks) => {
                    blocks.iter().map(estimate_block).sum()
                }
            })
            .unwrap_or(0),
        ContentBlock::Thinking { thinking, .. } => estimate_text(thinking),
        ContentBlock::RedactedThinking { .. } => 0,
    }
}

pub fn estimate_blocks(blocks: &[ContentBlock]) -> u32 {
    blocks.iter().map(estimate_block).sum()
}

pub fn estimate_messages(messages: &[UnifiedMessage]) -> u32 {
    messages.iter().map(|m| estimate_blocks(&m.blocks())).sum()
}

fn estimate_system(system: Option<&SystemPrompt>) -> u32 {
    system.map(|s| estimate_text(&s.to_text())).unwrap_or(0)
}

fn estimate_tools(tools: Option<&Vec<ToolDefinition>>) -> u32 {
    tools
        .map(|tools| {
            tools
                .iter()
                .map(|tool| {
                    estimate_text(&tool.name)
                        + tool.description.as_deref().map(estimate_text).unwrap_or(0)
                        + estimate_text(&tool.input_schema.to_string())
                })
                .sum()
        })
        .unwrap_or(0)
}

/// Input tokens of a full request
pub fn estimate_request(request: &MessagesRequest) -> u32 {
    estimate_messages(&request.messages)
        + estimate_system(request.system.as_ref())
        + estimate_tools(request.tools.as_ref())
}

/// Input tokens of a count request
pub fn estimate_count_request(request: &CountTokensRequest) -> u32 {
    estimate_messages(&request.messages)
        + estimate_system(request.system.as_ref())
        + estimate_tools(request.tools.as_ref())
}

/// Output tokens of a completed response
pub fn estimate_response(response: &MessagesResponse) -> u32 {
    estimate_blocks(&response.content)
}
