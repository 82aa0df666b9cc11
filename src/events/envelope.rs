//! Event envelope and typed payloads.
//!
//! Agents send open-ended JSON; once accepted by the gateway every event is
//! an [`EventEnvelope`] with one closed [`EventPayload`] variant. Free-form
//! data survives only in `metadata`.

use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::compliance::pii::{PiiOccurrence, RiskLevel};

/// Agent id used for events the control plane emits about itself.
pub const CONTROL_PLANE_AGENT_ID: &str = "control-plane";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentMode {
    External,
    Internal,
}

impl AgentMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentMode::External => "external",
            AgentMode::Internal => "internal",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "external" => Some(AgentMode::External),
            "internal" => Some(AgentMode::Internal),
            _ => None,
        }
    }
}

impl fmt::Display for AgentMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    WindowsEventLog,
    NetworkEvent,
    ThreatEvent,
    SystemEvent,
    DeviceEvent,
    SecurityAlert,
    ComplianceScan,
}

impl EventType {
    pub const ALL: [EventType; 7] = [
        EventType::WindowsEventLog,
        EventType::NetworkEvent,
        EventType::ThreatEvent,
        EventType::SystemEvent,
        EventType::DeviceEvent,
        EventType::SecurityAlert,
        EventType::ComplianceScan,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::WindowsEventLog => "windows_event_log",
            EventType::NetworkEvent => "network_event",
            EventType::ThreatEvent => "threat_event",
            EventType::SystemEvent => "system_event",
            EventType::DeviceEvent => "device_event",
            EventType::SecurityAlert => "security_alert",
            EventType::ComplianceScan => "compliance_scan",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|t| t.as_str() == value)
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// ≥9 critical, ≥7 high, ≥4 medium, else low.
    pub fn from_threat_level(level: u8) -> Self {
        match level {
            9..=u8::MAX => Severity::Critical,
            7..=8 => Severity::High,
            4..=6 => Severity::Medium,
            _ => Severity::Low,
        }
    }

    /// Severity implied by a log level string.
    pub fn from_level(level: &str) -> Self {
        match level.to_ascii_lowercase().as_str() {
            "critical" | "fatal" => Severity::Critical,
            "error" => Severity::High,
            "warning" | "warn" => Severity::Medium,
            _ => Severity::Low,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "low" => Some(Severity::Low),
            "medium" => Some(Severity::Medium),
            "high" => Some(Severity::High),
            "critical" => Some(Severity::Critical),
            _ => None,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreatAction {
    Detected,
    Blocked,
    Logged,
    Alerted,
}

impl ThreatAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ThreatAction::Detected => "detected",
            ThreatAction::Blocked => "blocked",
            ThreatAction::Logged => "logged",
            ThreatAction::Alerted => "alerted",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "detected" => Some(ThreatAction::Detected),
            "blocked" => Some(ThreatAction::Blocked),
            "logged" => Some(ThreatAction::Logged),
            "alerted" => Some(ThreatAction::Alerted),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreatDetails {
    pub threat_type: String,
    pub threat_level: u8,
    pub source_ip: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_port: Option<u16>,
    pub action: ThreatAction,
    #[serde(default)]
    pub evidence: Map<String, Value>,
}

impl ThreatDetails {
    pub fn severity(&self) -> Severity {
        Severity::from_threat_level(self.threat_level)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkKind {
    Attack,
    Scan,
    Anomaly,
    Blocked,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkDetails {
    pub kind: NetworkKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination_ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bytes: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SystemKind {
    Started,
    Stopped,
    Error,
    Healthy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemDetails {
    pub kind: SystemKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub component: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    Connected,
    Disconnected,
    Data,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceDetails {
    pub kind: DeviceKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_type: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WindowsLogDetails {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub computer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ComplianceScanDetails {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub framework: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub passed: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed: Option<u32>,
}

/// Closed set of event families, each with its typed payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "family", rename_all = "snake_case")]
pub enum EventPayload {
    Threat(ThreatDetails),
    Network(NetworkDetails),
    System(SystemDetails),
    Device(DeviceDetails),
    WindowsLog(WindowsLogDetails),
    ComplianceScan(ComplianceScanDetails),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub agent_id: String,
    pub agent_mode: AgentMode,
    pub event_type: EventType,
    pub severity: Severity,
    pub source: String,
    pub level: String,
    pub message: String,
    pub payload: EventPayload,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pii: Vec<PiiOccurrence>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pii_risk: Option<RiskLevel>,
    pub received_at: DateTime<Utc>,
}

impl EventEnvelope {
    /// Envelope for an agent event; severity is taken from the payload for
    /// threats and from `level` otherwise.
    pub fn new(
        agent_id: &str,
        agent_mode: AgentMode,
        timestamp: DateTime<Utc>,
        event_type: EventType,
        level: &str,
        message: &str,
        payload: EventPayload,
    ) -> Self {
        let severity = match &payload {
            EventPayload::Threat(details) => details.severity(),
            _ => Severity::from_level(level),
        };
        Self {
            id: next_event_id(timestamp),
            timestamp,
            agent_id: agent_id.to_string(),
            agent_mode,
            event_type,
            severity,
            source: agent_id.to_string(),
            level: level.to_string(),
            message: message.to_string(),
            payload,
            metadata: Map::new(),
            pii: Vec::new(),
            pii_risk: None,
            received_at: timestamp,
        }
    }

    pub fn new_threat(
        agent_id: &str,
        agent_mode: AgentMode,
        timestamp: DateTime<Utc>,
        details: ThreatDetails,
    ) -> Self {
        let message = format!(
            "{} threat from {} (level {})",
            details.threat_type, details.source_ip, details.threat_level
        );
        Self::new(
            agent_id,
            agent_mode,
            timestamp,
            EventType::ThreatEvent,
            "warning",
            &message,
            EventPayload::Threat(details),
        )
    }

    pub fn new_network(
        agent_id: &str,
        agent_mode: AgentMode,
        timestamp: DateTime<Utc>,
        details: NetworkDetails,
        message: &str,
    ) -> Self {
        Self::new(
            agent_id,
            agent_mode,
            timestamp,
            EventType::NetworkEvent,
            "info",
            message,
            EventPayload::Network(details),
        )
    }

    pub fn new_system(
        agent_id: &str,
        agent_mode: AgentMode,
        timestamp: DateTime<Utc>,
        details: SystemDetails,
        level: &str,
        message: &str,
    ) -> Self {
        Self::new(
            agent_id,
            agent_mode,
            timestamp,
            EventType::SystemEvent,
            level,
            message,
            EventPayload::System(details),
        )
    }

    pub fn new_device(
        agent_id: &str,
        agent_mode: AgentMode,
        timestamp: DateTime<Utc>,
        details: DeviceDetails,
        message: &str,
    ) -> Self {
        Self::new(
            agent_id,
            agent_mode,
            timestamp,
            EventType::DeviceEvent,
            "info",
            message,
            EventPayload::Device(details),
        )
    }

    pub fn threat(&self) -> Option<&ThreatDetails> {
        match &self.payload {
            EventPayload::Threat(details) => Some(details),
            _ => None,
        }
    }

    /// Windows event id and computer name, stored as dedicated cold columns.
    pub fn windows_fields(&self) -> (Option<i64>, Option<String>) {
        match &self.payload {
            EventPayload::WindowsLog(details) => (details.event_id, details.computer.clone()),
            _ => (None, None),
        }
    }

    /// Event raised by the control plane itself.
    pub fn control_plane(
        now: DateTime<Utc>,
        event_type: EventType,
        severity: Severity,
        message: &str,
        payload: EventPayload,
    ) -> Self {
        Self {
            id: next_event_id(now),
            timestamp: now,
            agent_id: CONTROL_PLANE_AGENT_ID.to_string(),
            agent_mode: AgentMode::Internal,
            event_type,
            severity,
            source: "pandora-control-plane".to_string(),
            level: match severity {
                Severity::Critical | Severity::High => "error".to_string(),
                Severity::Medium => "warning".to_string(),
                Severity::Low => "info".to_string(),
            },
            message: message.to_string(),
            payload,
            metadata: Map::new(),
            pii: Vec::new(),
            pii_risk: None,
            received_at: now,
        }
    }

    pub fn system_error(now: DateTime<Utc>, component: &str, message: &str) -> Self {
        Self::control_plane(
            now,
            EventType::SystemEvent,
            Severity::High,
            message,
            EventPayload::System(SystemDetails {
                kind: SystemKind::Error,
                component: Some(component.to_string()),
            }),
        )
    }

    pub fn device_disconnected(
        now: DateTime<Utc>,
        agent_id: &str,
        agent_mode: AgentMode,
        hostname: &str,
    ) -> Self {
        let mut event = Self::control_plane(
            now,
            EventType::DeviceEvent,
            Severity::Medium,
            &format!("agent {} missed its heartbeat window", agent_id),
            EventPayload::Device(DeviceDetails {
                kind: DeviceKind::Disconnected,
                device_id: Some(agent_id.to_string()),
                device_type: Some("agent".to_string()),
            }),
        );
        event.agent_id = agent_id.to_string();
        event.agent_mode = agent_mode;
        event
            .metadata
            .insert("hostname".to_string(), Value::String(hostname.to_string()));
        event
    }
}

static LAST_EVENT_NANOS: AtomicI64 = AtomicI64::new(0);

/// `evt_<nanos>`, strictly increasing within the process.
pub fn next_event_id(now: DateTime<Utc>) -> String {
    let wanted = now.timestamp_nanos_opt().unwrap_or_default();
    let mut current = LAST_EVENT_NANOS.load(Ordering::Relaxed);
    loop {
        let next = wanted.max(current + 1);
        match LAST_EVENT_NANOS.compare_exchange_weak(
            current,
            next,
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => return format!("evt_{}", next),
            Err(actual) => current = actual,
        }
    }
}
