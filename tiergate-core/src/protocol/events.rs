//! Stream events of the messages protocol
//!
//! A logical streamed response is exactly one `message_start`, any number of
//! block start/delta/stop triples, an optional `message_delta`, and exactly
//! one terminal event (`message_stop`, or `error` when the stream failed).

use super::types::{ContentBlock, MessagesResponse, StopReason};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Incremental change to an open content block
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BlockDelta {
    TextDelta { text: String },
    InputJsonDelta { partial_json: String },
    ThinkingDelta { thinking: String },
    SignatureDelta { signature: String },
}

/// Top-level message fields that change at the end of a stream
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageDeltaBody {
    #[serde(default)]
    pub stop_reason: Option<StopReason>,

    #[serde(default)]
    pub stop_sequence: Option<String>,
}

/// Cumulative usage reported by `message_delta`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeltaUsage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_tokens: Option<u32>,

    pub output_tokens: u32,
}

/// Error payload of a terminal `error` event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamError {
    #[serde(rename = "type")]
    pub kind: String,

    pub message: String,
}

/// A single server-sent event of the messages protocol
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// Stream start: message envelope with empty content
    MessageStart { message: MessagesResponse },

    /// Block start
    ContentBlockStart {
        index: usize,
        content_block: ContentBlock,
    },

    /// Block delta
    ContentBlockDelta { index: usize, delta: BlockDelta },

    /// Block stop
    ContentBlockStop { index: usize },

    /// Message metadata delta (stop reason, usage)
    MessageDelta {
        delta: MessageDeltaBody,
        usage: DeltaUsage,
    },

    /// Stream end
    MessageStop,

    /// Heartbeat
    Ping,

    /// Terminal error
    Error { error: StreamError },
}

impl StreamEvent {
    /// Create a terminal error event
    pub fn error(kind: impl Into<String>, message: impl Into<String>) -> Self {
        StreamEvent::Error {
            error: StreamError {
                kind: kind.into(),
                message: message.into(),
            },
        }
    }

    /// SSE event name
    pub fn event_name(&self) -> &'static str {
        match self {
            StreamEvent::MessageStart { .. } => "message_start",
            StreamEvent::ContentBlockStart { .. } => "content_block_start",
            StreamEvent::ContentBlockDelta { .. } => "content_block_delta",
            StreamEvent::ContentBlockStop { .. } => "content_block_stop",
            StreamEvent::MessageDelta { .. } => "message_delta",
            StreamEvent::MessageStop => "message_stop",
            StreamEvent::Ping => "ping",
            StreamEvent::Error { .. } => "error",
        }
    }

    /// Whether this event ends the logical response
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::MessageStop | StreamEvent::Error { .. })
    }

    /// JSON payload of the `data:` line
    pub fn to_json(&self) -> String {
        // Every variant is a plain data tree; serialization cannot fail.
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }

    /// Full SSE frame: `event: <name>\ndata: <json>\n\n`
    pub fn to_sse_frame(&self) -> Bytes {
        let payload = self.to_json();
        let name = self.event_name();
        let mut frame = Vec::with_capacity(payload.len() + name.len() + 16);
        frame.extend_from_slice(b"event: ");
        frame.extend_from_slice(name.as_bytes());
        frame.extend_from_slice(b"\ndata: ");
        frame.extend_from_slice(payload.as_bytes());
        frame.extend_from_slice(b"\n\n");
        Bytes::from(frame)
    }
}
