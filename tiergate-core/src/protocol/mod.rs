//! Protocol module for the messages wire contract
//!
//! This module defines the unified message model used by every conversion:
//! - Request/response bodies of the messages API
//! - The closed union of stream events
//! - Model categories and alias resolution

pub mod category;
pub mod events;
pub mod types;

pub use category::{resolve_category, ModelCategory};
pub use events::{BlockDelta, DeltaUsage, MessageDeltaBody, StreamError, StreamEvent};
pub use types::{
    ContentBlock, CountTokensRequest, CountTokensResponse, ImageSource, MessageContent,
    MessagesRequest, MessagesResponse, Role, StopReason, SystemPrompt, ThinkingConfig, ToolChoice,
    ToolDefinition, ToolResultContent, UnifiedMessage, Usage,
};
