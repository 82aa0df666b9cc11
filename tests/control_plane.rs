mod common;

use chrono::Duration as ChronoDuration;
use pandora_core::clock::Clock;
use pandora_core::config::ControlPlaneConfig;
use pandora_core::credentials::{pem_to_der, AgentCredential};
use pandora_core::events::{AgentMode, DETECTION_QUEUE};
use pandora_core::ingest::EventBatch;
use pandora_core::registry::RegistrationRequest;
use pandora_core::resilience::CancelToken;
use pandora_core::response::FirewallAdapter;
use pandora_core::storage::{ColdStore, LogQuery};
use pandora_core::Error;
use serde_json::json;

#[tokio::test]
async fn test_external_threat_is_blocked_end_to_end() {
    let h = common::start(ControlPlaneConfig::default()).await;
    let reg = h
        .plane
        .registry
        .register(RegistrationRequest::new(AgentMode::External, "edge-fw-1", "203.0.113.7"))
        .unwrap();
    assert!(reg.agent_id.starts_with("agent-ext-"));
    assert!(reg.client_key.is_some());
    let chain = vec![pem_to_der(reg.client_certificate_pem().unwrap()).unwrap()];

    let event = json!({
        "event_type": "threat_event",
        "timestamp": h.clock.now().to_rfc3339(),
        "threat_type": "ddos",
        "threat_level": 8,
        "source_ip": "192.168.1.100",
        "action": "detected"
    });
    let receipt = h
        .plane
        .gateway
        .submit_event(AgentCredential::Mtls(&chain), &reg.agent_id, &event)
        .await
        .unwrap();
    assert_eq!(receipt.routing_key, "threat.detected");
    assert!(!receipt.clamped);
    assert_eq!(h.broker.published_with_key("threat.detected").len(), 1);

    common::wait_until(|| h.plane.rules.response_log().len() == 1).await;
    let response = &h.plane.rules.response_log()[0];
    assert_eq!(response.rule_id.as_deref(), Some("RULE-003"));
    assert_eq!(response.event_id, receipt.event_id);
    assert!(response.success, "{:?}", response.errors);

    let blocked = h.firewall.get_block_list().await.unwrap();
    assert!(blocked.contains(&"192.168.1.100".parse().unwrap()));
    assert_eq!(h.broker.queue_depth(DETECTION_QUEUE), 0);

    h.plane.shutdown().await;
}

#[tokio::test]
async fn test_internal_batch_reaches_cold_storage() {
    let mut config = ControlPlaneConfig::default();
    config.tiering.hot_age_secs = 60;
    let h = common::start(config).await;
    let reg = h
        .plane
        .registry
        .register(RegistrationRequest::new(AgentMode::Internal, "db-7", "10.1.0.7"))
        .unwrap();
    assert!(reg.agent_id.starts_with("agent-int-"));
    let key = reg.api_key().unwrap().to_string();

    let now = h.clock.now().to_rfc3339();
    let batch = EventBatch {
        agent_id: reg.agent_id.clone(),
        events: vec![
            json!({"event_type": "system_event", "timestamp": now, "kind": "healthy", "message": "disk ok"}),
            json!({"event_type": "system_event", "timestamp": now}),
            json!({"event_type": "network_event", "timestamp": now, "kind": "blocked",
                   "destination_port": 5432, "message": "replica port closed"}),
        ],
    };
    let response = h
        .plane
        .gateway
        .submit_batch(AgentCredential::ApiKey(&key), &batch, &CancelToken::new())
        .await
        .unwrap();
    assert_eq!(response.received_count, 3);
    assert_eq!(response.saved_count, 2);
    assert_eq!(response.failed_count, 1);
    assert_eq!(response.errors[0].index, 1);
    assert_eq!(h.broker.published().len(), 2);

    common::wait_until(|| h.plane.hot.stats().map(|s| s.entries == 2).unwrap_or(false)).await;

    h.clock.advance(ChronoDuration::seconds(120));
    let report = h
        .plane
        .tiering
        .run_hot_to_cold(&CancelToken::new())
        .await
        .unwrap();
    assert_eq!(report.promoted, 2);
    assert_eq!(report.inserted, 2);

    let rows = h
        .plane
        .cold
        .query(&LogQuery::for_agent(&reg.agent_id))
        .unwrap();
    assert_eq!(rows.len(), 2);
    assert!(rows.iter().all(|row| row.is_intact()));
    assert_eq!(h.plane.hot.stats().unwrap().entries, 0);

    h.plane.shutdown().await;
}

#[tokio::test]
async fn test_deregistered_agent_is_refused() {
    let h = common::start(ControlPlaneConfig::default()).await;
    let reg = h
        .plane
        .registry
        .register(RegistrationRequest::new(AgentMode::Internal, "db-8", "10.1.0.8"))
        .unwrap();
    let key = reg.api_key().unwrap().to_string();
    h.plane.registry.deregister(&reg.agent_id).unwrap();

    let event = json!({
        "event_type": "system_event",
        "timestamp": h.clock.now().to_rfc3339(),
        "kind": "healthy"
    });
    let err = h
        .plane
        .gateway
        .submit_event(AgentCredential::ApiKey(&key), &reg.agent_id, &event)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Revoked(_)), "{:?}", err);
    assert!(h.broker.published().is_empty());

    h.plane.shutdown().await;
}
