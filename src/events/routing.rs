//! Routing decisions.
//!
//! Maps each accepted event onto a `<family>.<subtype>` routing key and
//! describes the exchange topology the broker declares.

use std::fmt;

use crate::logging::structured::LogContext;

use super::envelope::{
    DeviceKind, EventEnvelope, EventPayload, EventType, NetworkKind, SystemKind, ThreatAction,
};

pub const DEFAULT_EXCHANGE: &str = "pandora.events";

/// Queue consumed by the rule engine, alongside the storage queues.
pub const DETECTION_QUEUE: &str = "threat_detection";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventFamily {
    Threat,
    Network,
    System,
    Device,
}

impl EventFamily {
    pub const ALL: [EventFamily; 4] = [
        EventFamily::Threat,
        EventFamily::Network,
        EventFamily::System,
        EventFamily::Device,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventFamily::Threat => "threat",
            EventFamily::Network => "network",
            EventFamily::System => "system",
            EventFamily::Device => "device",
        }
    }

    /// Durable storage queue for the family.
    pub fn queue(&self) -> &'static str {
        match self {
            EventFamily::Threat => "threat_events",
            EventFamily::Network => "network_events",
            EventFamily::System => "system_events",
            EventFamily::Device => "device_events",
        }
    }

    pub fn binding(&self) -> String {
        format!("{}.#", self.as_str())
    }
}

impl EventType {
    pub fn family(&self) -> EventFamily {
        match self {
            EventType::ThreatEvent | EventType::SecurityAlert => EventFamily::Threat,
            EventType::NetworkEvent => EventFamily::Network,
            EventType::DeviceEvent => EventFamily::Device,
            EventType::SystemEvent | EventType::WindowsEventLog | EventType::ComplianceScan => {
                EventFamily::System
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingKey {
    pub family: EventFamily,
    pub subtype: String,
}

impl fmt::Display for RoutingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.family.as_str(), self.subtype)
    }
}

/// Determine the routing key for an accepted event.
///
/// # Decision Tree
/// 1. Threat payloads route on their action (logged events are "analyzed")
/// 2. Network, system and device payloads route on their kind
/// 3. Windows logs and compliance scans ride the system family
pub fn determine_routing(event: &EventEnvelope, ctx: &LogContext) -> RoutingKey {
    let family = event.event_type.family();
    let subtype = match &event.payload {
        EventPayload::Threat(threat) => match threat.action {
            ThreatAction::Detected | ThreatAction::Alerted => "detected",
            ThreatAction::Blocked => "blocked",
            ThreatAction::Logged => "analyzed",
        },
        EventPayload::Network(network) => match network.kind {
            NetworkKind::Attack => "attack",
            NetworkKind::Scan => "scan",
            NetworkKind::Anomaly => "anomaly",
            NetworkKind::Blocked => "blocked",
        },
        EventPayload::System(system) => match system.kind {
            SystemKind::Started => "started",
            SystemKind::Stopped => "stopped",
            SystemKind::Error => "error",
            SystemKind::Healthy => "healthy",
        },
        EventPayload::Device(device) => match device.kind {
            DeviceKind::Connected => "connected",
            DeviceKind::Disconnected => "disconnected",
            DeviceKind::Data => "data",
            DeviceKind::Error => "error",
        },
        EventPayload::WindowsLog(_) => "windows_log",
        EventPayload::ComplianceScan(_) => "compliance_scan",
    };

    let key = RoutingKey {
        family,
        subtype: subtype.to_string(),
    };
    log::debug!("{} ROUTING_DECISION routing_key={}", ctx, key);
    key
}

pub fn dead_letter_queue(queue: &str) -> String {
    format!("{}.dlq", queue)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    pub name: String,
    pub bindings: Vec<String>,
    pub dead_letter: Option<String>,
    pub durable: bool,
}

impl QueueSpec {
    pub fn durable(name: &str, binding: &str) -> Self {
        Self {
            name: name.to_string(),
            bindings: vec![binding.to_string()],
            dead_letter: Some(dead_letter_queue(name)),
            durable: true,
        }
    }
}

/// Exchange plus bound queues, declared on every (re)connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    pub exchange: String,
    pub queues: Vec<QueueSpec>,
}

impl Topology {
    /// Family storage queues plus the detection queue.
    pub fn standard(exchange: &str) -> Self {
        let mut queues: Vec<QueueSpec> = EventFamily::ALL
            .iter()
            .map(|family| QueueSpec::durable(family.queue(), &family.binding()))
            .collect();
        queues.push(QueueSpec::durable(
            DETECTION_QUEUE,
            &EventFamily::Threat.binding(),
        ));
        Self {
            exchange: exchange.to_string(),
            queues,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::envelope::{
        AgentMode, NetworkDetails, Severity, ThreatDetails, WindowsLogDetails,
    };
    use chrono::Utc;
    use serde_json::Map;

    fn envelope(event_type: EventType, payload: EventPayload) -> EventEnvelope {
        let now = Utc::now();
        EventEnvelope {
            id: "evt_1".into(),
            timestamp: now,
            agent_id: "agent-int-000000000001".into(),
            agent_mode: AgentMode::Internal,
            event_type,
            severity: Severity::Low,
            source: "test".into(),
            level: "info".into(),
            message: String::new(),
            payload,
            metadata: Map::new(),
            pii: Vec::new(),
            pii_risk: None,
            received_at: now,
        }
    }

    #[test]
    fn test_threat_routing() {
        let ctx = LogContext::default();
        let mut threat = ThreatDetails {
            threat_type: "ddos".into(),
            threat_level: 8,
            source_ip: "192.168.1.100".into(),
            target_ip: None,
            target_port: None,
            action: ThreatAction::Detected,
            evidence: Map::new(),
        };
        let event = envelope(EventType::ThreatEvent, EventPayload::Threat(threat.clone()));
        assert_eq!(determine_routing(&event, &ctx).to_string(), "threat.detected");

        threat.action = ThreatAction::Logged;
        let event = envelope(EventType::SecurityAlert, EventPayload::Threat(threat));
        assert_eq!(determine_routing(&event, &ctx).to_string(), "threat.analyzed");
    }

    #[test]
    fn test_network_routing() {
        let event = EventEnvelope::new_network(
            "agent-int-0123456789ab",
            AgentMode::Internal,
            Utc::now(),
            NetworkDetails {
                kind: NetworkKind::Scan,
                source_ip: Some("10.0.0.9".into()),
                destination_ip: None,
                destination_port: Some(22),
                protocol: Some("tcp".into()),
                bytes: None,
            },
            "sweep on 22/tcp",
        );
        assert_eq!(
            determine_routing(&event, &LogContext::default()).to_string(),
            "network.scan"
        );
    }

    #[test]
    fn test_windows_log_routes_to_system_family() {
        let event = envelope(
            EventType::WindowsEventLog,
            EventPayload::WindowsLog(WindowsLogDetails::default()),
        );
        let key = determine_routing(&event, &LogContext::default());
        assert_eq!(key.family, EventFamily::System);
        assert_eq!(key.to_string(), "system.windows_log");
    }

    #[test]
    fn test_standard_topology() {
        let topology = Topology::standard(DEFAULT_EXCHANGE);
        let names: Vec<&str> = topology.queues.iter().map(|q| q.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "threat_events",
                "network_events",
                "system_events",
                "device_events",
                "threat_detection"
            ]
        );
        assert!(topology.queues.iter().all(|q| q.durable));
        assert_eq!(
            topology.queues[0].dead_letter.as_deref(),
            Some("threat_events.dlq")
        );
    }
}
