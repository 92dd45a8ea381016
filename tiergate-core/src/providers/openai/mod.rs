//! OpenAI-compatible providers
//!
//! This module translates between the messages protocol and the OpenAI chat
//! completions format, for bodies and for live streams.

pub mod converter;
pub mod streaming;
pub mod types;

pub use converter::{map_finish_reason, parse_tool_arguments, to_openai_request};
pub use types::{OpenAIRequest, OpenAIResponse, OpenAIStreamChunk};
