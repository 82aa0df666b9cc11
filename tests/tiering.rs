mod common;

use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use pandora_core::broker::MemoryBroker;
use pandora_core::clock::{Clock, ManualClock};
use pandora_core::config::ControlPlaneConfig;
use pandora_core::events::{
    AgentMode, EventEnvelope, EventPayload, EventType, SystemDetails, SystemKind,
};
use pandora_core::resilience::CancelToken;
use pandora_core::response::{InMemoryFirewall, RecordingEffectors};
use pandora_core::storage::{
    ColdStore, InMemoryArchive, InMemoryHotStore, LogQuery, RetentionPolicy,
};
use pandora_core::{Collaborators, ControlPlane};

fn system_event(agent: &str, ts: DateTime<Utc>, n: usize) -> EventEnvelope {
    let mut event = EventEnvelope::new(
        agent,
        AgentMode::Internal,
        ts,
        EventType::SystemEvent,
        "info",
        &format!("service check {} passed", n),
        EventPayload::System(SystemDetails {
            kind: SystemKind::Healthy,
            component: Some("nginx".into()),
        }),
    );
    event.id = format!("evt-{}-{}", agent, n);
    event
}

#[tokio::test]
async fn test_promotion_is_complete_intact_and_idempotent() {
    let h = common::start(ControlPlaneConfig::default()).await;
    let two_hours_ago = h.clock.now() - ChronoDuration::hours(2);
    for n in 0..1000 {
        h.plane
            .hot
            .append(&system_event("agent-int-0000000000aa", two_hours_ago, n))
            .unwrap();
    }
    let cancel = CancelToken::new();

    let report = h.plane.tiering.run_hot_to_cold(&cancel).await.unwrap();
    assert_eq!(report.promoted, 1000);
    assert_eq!(report.inserted, 1000);
    assert_eq!(h.plane.hot.stats().unwrap().entries, 0);

    let rows = h
        .plane
        .cold
        .query(&LogQuery {
            agent_id: Some("agent-int-0000000000aa".into()),
            limit: Some(1000),
            ..LogQuery::default()
        })
        .unwrap();
    assert_eq!(rows.len(), 1000);
    assert!(rows.iter().all(|row| row.is_intact()));
    assert!(h.plane.tiering.run_integrity_check(&cancel).await.unwrap().is_clean());

    let again = h.plane.tiering.run_hot_to_cold(&cancel).await.unwrap();
    assert_eq!(again.promoted, 0);
    assert_eq!(again.inserted, 0);
    assert_eq!(h.plane.cold.stats().unwrap().total, 1000);

    h.plane.shutdown().await;
}

#[tokio::test]
async fn test_idle_stream_is_promoted_before_it_expires() {
    let h = common::start(ControlPlaneConfig::default()).await;
    h.plane
        .hot
        .append(&system_event("agent-int-0000000000cc", h.clock.now(), 0))
        .unwrap();
    let cancel = CancelToken::new();

    // The agent goes quiet; only the periodic task keeps running.
    let mut promoted = 0;
    for _ in 0..24 {
        h.clock.advance(ChronoDuration::seconds(300));
        promoted += h.plane.tiering.run_hot_to_cold(&cancel).await.unwrap().promoted;
    }
    assert_eq!(promoted, 1);
    let rows = h
        .plane
        .cold
        .query(&LogQuery::for_agent("agent-int-0000000000cc"))
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].source_id, "evt-agent-int-0000000000cc-0");

    h.plane.shutdown().await;
}

#[tokio::test]
async fn test_agents_reusing_envelope_ids_both_reach_cold() {
    let h = common::start(ControlPlaneConfig::default()).await;
    let two_hours_ago = h.clock.now() - ChronoDuration::hours(2);
    for agent in ["agent-int-0000000000d1", "agent-int-0000000000d2"] {
        let mut event = system_event(agent, two_hours_ago, 1);
        event.id = "1".into();
        h.plane.hot.append(&event).unwrap();
    }

    let report = h.plane.tiering.run_hot_to_cold(&CancelToken::new()).await.unwrap();
    assert_eq!(report.promoted, 2);
    assert_eq!(report.inserted, 2);
    assert_eq!(h.plane.cold.stats().unwrap().total, 2);
    assert_eq!(h.plane.hot.stats().unwrap().entries, 0);

    h.plane.shutdown().await;
}

#[tokio::test]
async fn test_expired_rows_are_archived_then_swept_once() {
    let clock = ManualClock::shared(Utc::now());
    let firewall = Arc::new(InMemoryFirewall::new(clock.clone()));
    let recorder = Arc::new(RecordingEffectors::new());
    let archive = Arc::new(InMemoryArchive::new());
    let plane = ControlPlane::start(
        ControlPlaneConfig::default(),
        Collaborators::new(
            Arc::new(MemoryBroker::new()),
            common::effectors(firewall, recorder),
        )
        .with_clock(clock.clone())
        .with_hot_store(Arc::new(InMemoryHotStore::new(1_000, 7_200, clock.clone())))
        .with_archive(archive.clone()),
    )
    .await
    .unwrap();
    plane
        .cold
        .upsert_retention_policy(&RetentionPolicy::new(
            "system_event",
            AgentMode::Internal,
            7,
            "internal-ops",
            true,
            true,
        ))
        .unwrap();
    let events: Vec<_> = (0..25)
        .map(|n| system_event("agent-int-0000000000bb", clock.now(), n))
        .collect();
    plane.cold.insert_batch(&events).unwrap();
    let cancel = CancelToken::new();

    clock.advance(ChronoDuration::days(8));
    let archived = plane.tiering.run_cold_to_archive(&cancel).await.unwrap();
    assert_eq!(archived.archived, 25);
    assert_eq!(archive.row_count(), 25);

    let first = plane.tiering.run_retention_sweep(&cancel).await.unwrap();
    assert_eq!(first.deleted, 25);
    let second = plane.tiering.run_retention_sweep(&cancel).await.unwrap();
    assert_eq!(second.deleted, 0);
    assert_eq!(plane.cold.stats().unwrap().total, 0);

    plane.shutdown().await;
}
