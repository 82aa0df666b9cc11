#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use pandora_core::broker::MemoryBroker;
use pandora_core::clock::ManualClock;
use pandora_core::config::ControlPlaneConfig;
use pandora_core::events::{AgentMode, EventEnvelope, ThreatAction, ThreatDetails};
use pandora_core::response::{Effectors, InMemoryFirewall, RecordingEffectors};
use pandora_core::{Collaborators, ControlPlane};
use serde_json::Map;

pub struct Harness {
    pub clock: Arc<ManualClock>,
    pub broker: Arc<MemoryBroker>,
    pub firewall: Arc<InMemoryFirewall>,
    pub recorder: Arc<RecordingEffectors>,
    pub plane: ControlPlane,
}

pub fn effectors(firewall: Arc<InMemoryFirewall>, recorder: Arc<RecordingEffectors>) -> Effectors {
    Effectors::new(
        firewall,
        recorder.clone(),
        recorder.clone(),
        recorder.clone(),
        recorder,
    )
}

pub async fn start(config: ControlPlaneConfig) -> Harness {
    pandora_core::init_logger();
    let clock = ManualClock::shared(Utc::now());
    let broker = Arc::new(MemoryBroker::new());
    let firewall = Arc::new(InMemoryFirewall::new(clock.clone()));
    let recorder = Arc::new(RecordingEffectors::new());
    let plane = ControlPlane::start(
        config,
        Collaborators::new(broker.clone(), effectors(firewall.clone(), recorder.clone()))
            .with_clock(clock.clone()),
    )
    .await
    .expect("control plane starts");
    Harness {
        clock,
        broker,
        firewall,
        recorder,
        plane,
    }
}

pub async fn wait_until<F: Fn() -> bool>(check: F) {
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

pub fn threat(threat_type: &str, level: u8, source_ip: &str, at: DateTime<Utc>) -> EventEnvelope {
    EventEnvelope::new_threat(
        "agent-ext-0123456789ab",
        AgentMode::External,
        at,
        ThreatDetails {
            threat_type: threat_type.to_string(),
            threat_level: level,
            source_ip: source_ip.to_string(),
            target_ip: None,
            target_port: None,
            action: ThreatAction::Detected,
            evidence: Map::new(),
        },
    )
}
