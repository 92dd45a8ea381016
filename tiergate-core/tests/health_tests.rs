//! Tests for on-demand health probing

mod common;

use common::{config, native_message, provider, MockReply, MockTransport};
use std::sync::Arc;
use tiergate_core::cache::MultiLevelCache;
use tiergate_core::circuit::CircuitStatus;
use tiergate_core::config::{FallbackStrategy, GatewayConfig, WireFormat};
use tiergate_core::context::Identity;
use tiergate_core::protocol::ModelCategory;
use tiergate_core::providers::GatewayError;
use tiergate_core::sink::TracingSink;
use tiergate_core::Gateway;

fn gateway(transport: Arc<MockTransport>, config: GatewayConfig) -> Gateway {
    let cache = MultiLevelCache::with_backing(&config.cache, None);
    Gateway::with_parts(config, transport, cache, Arc::new(TracingSink)).unwrap()
}

#[tokio::test]
async fn test_cached_results_unless_forced() {
    let transport = MockTransport::new();
    transport.always("p1", MockReply::Body(native_message("pong")));

    let gateway = gateway(transport.clone(), config(vec![provider("p1", 1, WireFormat::Native)]));
    let ctx = gateway.context(Identity::anonymous());

    let first = gateway.health_check(&ctx, false).await;
    assert_eq!(first.len(), 3);
    assert!(first.iter().all(|r| r.healthy));
    assert_eq!(
        first.iter().map(|r| r.category).collect::<Vec<_>>(),
        vec![ModelCategory::Big, ModelCategory::Middle, ModelCategory::Small]
    );
    assert_eq!(transport.calls_to("p1"), 3);

    let cached = gateway.health_check(&ctx, false).await;
    assert_eq!(cached, first);
    assert_eq!(transport.calls_to("p1"), 3);

    gateway.health_check(&ctx, true).await;
    assert_eq!(transport.calls_to("p1"), 6);

    // Probes ask for the first configured model with the probe budget
    let call = &transport.calls()[0];
    assert_eq!(call.body["max_tokens"], 8);
}

#[tokio::test]
async fn test_healthy_check_clears_streak_but_keeps_circuit_open() {
    let transport = MockTransport::new();
    transport.always("p1", MockReply::Body(native_message("pong")));

    let gateway = gateway(transport.clone(), config(vec![provider("p1", 1, WireFormat::Native)]));
    for _ in 0..5 {
        gateway.circuits().record_failure("p1");
    }
    assert_eq!(gateway.circuits().status("p1"), CircuitStatus::Open);

    let ctx = gateway.context(Identity::anonymous());
    let records = gateway.health_check(&ctx, true).await;

    assert!(records.iter().all(|r| r.healthy));
    let snapshot = gateway.circuits().snapshot_of("p1").unwrap();
    assert_eq!(snapshot.status, CircuitStatus::Open);
    assert_eq!(snapshot.consecutive_failures, 0);
    assert_eq!(snapshot.total_successes, 3);
}

#[tokio::test]
async fn test_failed_probe_does_not_trip_circuit() {
    let transport = MockTransport::new();
    transport.always("p1", MockReply::Fail(GatewayError::Network("refused".to_string())));

    let mut config = config(vec![provider("p1", 1, WireFormat::Native)]);
    config.circuit_breaker.failure_threshold = 1;
    let gateway = gateway(transport.clone(), config);
    let ctx = gateway.context(Identity::anonymous());

    let records = gateway.health_check(&ctx, true).await;
    assert!(records.iter().all(|r| !r.healthy));
    assert!(records[0].error.as_deref().unwrap().contains("refused"));

    let circuit = gateway.circuits().snapshot_of("p1").unwrap();
    assert_eq!(circuit.status, CircuitStatus::Closed);
    assert_eq!(circuit.total_failures, 0);

    let status = gateway.status().await;
    assert_eq!(status.health.len(), 3);
}

#[tokio::test]
async fn test_random_strategy_tries_unhealthy_providers_last() {
    let transport = MockTransport::new();
    transport.always("sick", MockReply::Fail(GatewayError::Network("refused".to_string())));
    for name in ["a", "b", "c"] {
        transport.always(name, MockReply::Body(native_message("pong")));
    }

    let mut config = config(vec![
        provider("sick", 1, WireFormat::Native),
        provider("a", 1, WireFormat::Native),
        provider("b", 1, WireFormat::Native),
        provider("c", 1, WireFormat::Native),
    ]);
    config.fallback_strategy = FallbackStrategy::Random;
    let gateway = gateway(transport.clone(), config);
    let ctx = gateway.context(Identity::anonymous());

    gateway.health_check(&ctx, true).await;

    for _ in 0..20 {
        let plan = gateway.router().plan(&ctx, ModelCategory::Middle).await;
        assert_eq!(plan.candidates.len(), 4);
        assert_eq!(plan.candidates[3].provider_name(), "sick");
    }
}

#[tokio::test]
async fn test_reload_drops_records_of_removed_providers() {
    let transport = MockTransport::new();
    transport.always("p1", MockReply::Body(native_message("pong")));
    transport.always("p2", MockReply::Body(native_message("pong")));

    let gateway = gateway(
        transport.clone(),
        config(vec![
            provider("p1", 1, WireFormat::Native),
            provider("p2", 2, WireFormat::Native),
        ]),
    );
    let ctx = gateway.context(Identity::anonymous());
    gateway.health_check(&ctx, true).await;
    assert_eq!(gateway.status().await.health.len(), 6);

    gateway
        .reload(config(vec![provider("p2", 1, WireFormat::Native)]))
        .unwrap();

    let status = gateway.status().await;
    assert_eq!(status.config_version, 2);
    assert!(status.health.iter().all(|r| r.provider == "p2"));
    assert_eq!(status.providers.len(), 1);
}
