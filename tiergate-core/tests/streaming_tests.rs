//! Tests for client stream orchestration
//!
//! Covers fallback before the first content block, failures after delivery,
//! client disconnects and heartbeats.

mod common;

use bytes::Bytes;
use common::{config, native_stream_body, provider, MockReply, MockTransport};
use futures::StreamExt;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tiergate_core::cache::MultiLevelCache;
use tiergate_core::config::{GatewayConfig, WireFormat};
use tiergate_core::context::Identity;
use tiergate_core::protocol::{BlockDelta, MessagesRequest, StreamEvent, UnifiedMessage};
use tiergate_core::providers::GatewayError;
use tiergate_core::sink::{ChannelSink, UsageOutcome, UsageRecord};
use tiergate_core::Gateway;
use tokio::sync::mpsc;

fn request() -> MessagesRequest {
    MessagesRequest::new("claude-3-5-sonnet", vec![UnifiedMessage::user("Hello")], 256).with_streaming()
}

fn two_providers() -> GatewayConfig {
    config(vec![
        provider("p1", 1, WireFormat::Native),
        provider("p2", 2, WireFormat::Native),
    ])
}

fn gateway(transport: Arc<MockTransport>, config: GatewayConfig) -> (Gateway, mpsc::Receiver<UsageRecord>) {
    common::init_tracing();
    let (sink, records) = ChannelSink::new(16);
    let cache = MultiLevelCache::with_backing(&config.cache, None);
    let gateway = Gateway::with_parts(config, transport, cache, Arc::new(sink)).unwrap();
    (gateway, records)
}

fn frame(event: &str, data: serde_json::Value) -> String {
    format!("event: {}\ndata: {}\n\n", event, data)
}

fn message_start() -> String {
    frame(
        "message_start",
        json!({"type": "message_start", "message": {
            "id": "msg_up", "type": "message", "role": "assistant", "model": "up",
            "content": [], "stop_reason": null, "stop_sequence": null,
            "usage": {"input_tokens": 7, "output_tokens": 1}
        }}),
    )
}

/// message_start plus an opened text block with one delta
fn opening_chunk() -> Bytes {
    let mut body = message_start();
    body.push_str(&frame(
        "content_block_start",
        json!({"type": "content_block_start", "index": 0, "content_block": {"type": "text", "text": ""}}),
    ));
    body.push_str(&frame(
        "content_block_delta",
        json!({"type": "content_block_delta", "index": 0, "delta": {"type": "text_delta", "text": "partial"}}),
    ));
    Bytes::from(body)
}

fn text_of(events: &[StreamEvent]) -> String {
    events
        .iter()
        .filter_map(|e| match e {
            StreamEvent::ContentBlockDelta {
                delta: BlockDelta::TextDelta { text },
                ..
            } => Some(text.as_str()),
            _ => None,
        })
        .collect()
}

async fn next_record(records: &mut mpsc::Receiver<UsageRecord>) -> UsageRecord {
    tokio::time::timeout(Duration::from_secs(5), records.recv())
        .await
        .expect("usage record in time")
        .expect("sink open")
}

#[tokio::test]
async fn test_falls_back_when_stream_fails_before_first_block() {
    let transport = MockTransport::new();
    let mut failing = message_start();
    failing.push_str(&frame(
        "error",
        json!({"type": "error", "error": {"type": "overloaded_error", "message": "Overloaded"}}),
    ));
    transport.always("p1", MockReply::Stream(vec![Ok(Bytes::from(failing))]));
    transport.always(
        "p2",
        MockReply::Stream(vec![Ok(Bytes::from(native_stream_body("Hello from p2")))]),
    );

    let (gateway, mut records) = gateway(transport.clone(), two_providers());
    let ctx = gateway.context(Identity::new("team-a"));

    let stream = gateway.stream(ctx, request()).await.unwrap();
    assert_eq!(stream.provider(), "p2");
    let events: Vec<StreamEvent> = stream.collect().await;

    assert!(matches!(events.first(), Some(StreamEvent::MessageStart { .. })));
    assert_eq!(events.last(), Some(&StreamEvent::MessageStop));
    assert_eq!(text_of(&events), "Hello from p2");
    assert!(!events.iter().any(|e| matches!(e, StreamEvent::Error { .. })));

    assert_eq!(gateway.circuits().snapshot_of("p1").unwrap().total_failures, 1);

    let record = next_record(&mut records).await;
    assert_eq!(record.provider.as_deref(), Some("p2"));
    assert_eq!(record.identity.as_str(), "team-a");
    assert_eq!(record.output_tokens, 4);
    assert_eq!(record.outcome, UsageOutcome::Success);
}

#[tokio::test]
async fn test_zero_output_stream_falls_back() {
    let transport = MockTransport::new();
    let mut empty = message_start();
    empty.push_str(&frame(
        "message_delta",
        json!({"type": "message_delta", "delta": {"stop_reason": "end_turn", "stop_sequence": null}, "usage": {"output_tokens": 0}}),
    ));
    empty.push_str(&frame("message_stop", json!({"type": "message_stop"})));
    transport.always("p1", MockReply::Stream(vec![Ok(Bytes::from(empty))]));
    transport.always(
        "p2",
        MockReply::Stream(vec![Ok(Bytes::from(native_stream_body("fallback")))]),
    );

    let (gateway, _records) = gateway(transport.clone(), two_providers());
    let ctx = gateway.context(Identity::anonymous());

    let stream = gateway.stream(ctx, request()).await.unwrap();
    assert_eq!(stream.provider(), "p2");
    let events: Vec<StreamEvent> = stream.collect().await;
    assert_eq!(text_of(&events), "fallback");
}

#[tokio::test]
async fn test_failure_after_delivery_ends_with_error_event() {
    let transport = MockTransport::new();
    transport.always(
        "p1",
        MockReply::Stream(vec![
            Ok(opening_chunk()),
            Err(GatewayError::Network("connection reset".to_string())),
        ]),
    );
    transport.always(
        "p2",
        MockReply::Stream(vec![Ok(Bytes::from(native_stream_body("unused")))]),
    );

    let (gateway, mut records) = gateway(transport.clone(), two_providers());
    let ctx = gateway.context(Identity::anonymous());

    let stream = gateway.stream(ctx, request()).await.unwrap();
    assert_eq!(stream.provider(), "p1");
    let events: Vec<StreamEvent> = stream.collect().await;

    assert_eq!(text_of(&events), "partial");
    match events.last() {
        Some(StreamEvent::Error { error }) => assert!(error.message.contains("connection reset")),
        other => panic!("expected a terminal error, got {:?}", other),
    }
    // The open block is closed before the error
    assert_eq!(
        events[events.len() - 2],
        StreamEvent::ContentBlockStop { index: 0 }
    );
    assert_eq!(transport.calls_to("p2"), 0);

    let record = next_record(&mut records).await;
    assert!(matches!(record.outcome, UsageOutcome::Failed { .. }));
    assert_eq!(gateway.circuits().snapshot_of("p1").unwrap().total_failures, 1);
}

#[tokio::test]
async fn test_client_drop_cancels_upstream() {
    let transport = MockTransport::new();
    transport.always("p1", MockReply::HangingStream(vec![opening_chunk()]));

    let (gateway, mut records) = gateway(
        transport.clone(),
        config(vec![provider("p1", 1, WireFormat::Native)]),
    );
    let ctx = gateway.context(Identity::anonymous());

    let mut stream = gateway.stream(ctx, request()).await.unwrap();
    assert!(matches!(stream.next().await, Some(StreamEvent::MessageStart { .. })));
    drop(stream);

    let record = next_record(&mut records).await;
    assert_eq!(
        record.outcome,
        UsageOutcome::Failed {
            reason: "client disconnected".to_string()
        }
    );
    // A client leaving says nothing about the provider
    assert_eq!(gateway.circuits().snapshot_of("p1").unwrap().total_failures, 0);
}

#[tokio::test(start_paused = true)]
async fn test_idle_stream_sends_heartbeats_until_chunk_timeout() {
    let transport = MockTransport::new();
    transport.always("p1", MockReply::HangingStream(vec![opening_chunk()]));

    let mut config = config(vec![provider("p1", 1, WireFormat::Native)]);
    config.server.heartbeat_interval_secs = 5;
    let (gateway, _records) = gateway(transport.clone(), config);
    let ctx = gateway.context(Identity::anonymous());

    let stream = gateway.stream(ctx, request()).await.unwrap();
    let events: Vec<StreamEvent> = stream.collect().await;

    let pings = events.iter().filter(|e| **e == StreamEvent::Ping).count();
    // Provider timeout is 30s; a ping every 5s of silence before it
    assert!(pings >= 5, "expected heartbeats, got {}", pings);
    match events.last() {
        Some(StreamEvent::Error { error }) => assert!(error.message.contains("timed out")),
        other => panic!("expected a timeout error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_all_candidates_failing_to_open() {
    let transport = MockTransport::new();
    transport.always("p1", MockReply::Fail(GatewayError::Network("refused".to_string())));
    transport.always("p2", MockReply::Fail(GatewayError::Network("refused".to_string())));

    let (gateway, mut records) = gateway(transport.clone(), two_providers());
    let ctx = gateway.context(Identity::anonymous());

    let err = gateway.stream(ctx, request()).await.unwrap_err();
    match err {
        GatewayError::ExhaustedCandidates(failures) => assert_eq!(failures.len(), 2),
        other => panic!("unexpected error: {:?}", other),
    }

    let record = next_record(&mut records).await;
    assert!(record.streamed);
    assert!(matches!(record.outcome, UsageOutcome::Failed { .. }));
}
