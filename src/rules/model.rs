//! Response rules, their conditions and actions.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::events::{EventEnvelope, Severity};
use crate::extraction::{resolve_json_path, value_to_float, value_to_string};

/// Comparison applied by a [`Condition`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    #[serde(alias = "eq")]
    Equals,
    #[serde(alias = "ne")]
    NotEquals,
    Contains,
    #[serde(alias = "gt")]
    GreaterThan,
    #[serde(alias = "ge")]
    GreaterOrEqual,
    #[serde(alias = "lt")]
    LessThan,
    #[serde(alias = "le")]
    LessOrEqual,
    In,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    /// Dot path into the event view, e.g. `threat_level` or `evidence.pps`.
    pub field: String,
    pub operator: Operator,
    pub value: Value,
}

impl Condition {
    pub fn new(field: &str, operator: Operator, value: Value) -> Self {
        Self {
            field: field.to_string(),
            operator,
            value,
        }
    }

    /// A missing field never matches, except under `not_equals`.
    pub fn evaluate(&self, view: &Value) -> bool {
        let Some(actual) = resolve_json_path(view, &self.field) else {
            return self.operator == Operator::NotEquals;
        };
        match self.operator {
            Operator::Equals => loosely_equal(actual, &self.value),
            Operator::NotEquals => !loosely_equal(actual, &self.value),
            Operator::Contains => match actual {
                Value::Array(items) => items.iter().any(|item| loosely_equal(item, &self.value)),
                _ => value_to_string(actual).contains(&value_to_string(&self.value)),
            },
            Operator::GreaterThan => compare(actual, &self.value).map_or(false, |o| o.is_gt()),
            Operator::GreaterOrEqual => compare(actual, &self.value).map_or(false, |o| o.is_ge()),
            Operator::LessThan => compare(actual, &self.value).map_or(false, |o| o.is_lt()),
            Operator::LessOrEqual => compare(actual, &self.value).map_or(false, |o| o.is_le()),
            Operator::In => match &self.value {
                Value::Array(options) => options.iter().any(|o| loosely_equal(actual, o)),
                _ => false,
            },
        }
    }
}

fn loosely_equal(a: &Value, b: &Value) -> bool {
    match (value_to_float(a), value_to_float(b)) {
        (Some(x), Some(y)) if a.is_number() || b.is_number() => x == y,
        _ => a == b || value_to_string(a) == value_to_string(b),
    }
}

fn compare(a: &Value, b: &Value) -> Option<std::cmp::Ordering> {
    match (value_to_float(a), value_to_float(b)) {
        (Some(x), Some(y)) => x.partial_cmp(&y),
        _ => match (a, b) {
            (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
            _ => None,
        },
    }
}

/// What an action does. Unrecognised names become [`ActionKind::Custom`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ActionKind {
    BlockIp,
    UnblockIp,
    BlockPort,
    IsolateHost,
    KillProcess,
    QuarantineFile,
    UpdateFirewall,
    CollectForensics,
    NotifySoc,
    CreateIncident,
    Custom(String),
}

impl ActionKind {
    pub fn as_str(&self) -> &str {
        match self {
            ActionKind::BlockIp => "block_ip",
            ActionKind::UnblockIp => "unblock_ip",
            ActionKind::BlockPort => "block_port",
            ActionKind::IsolateHost => "isolate_host",
            ActionKind::KillProcess => "kill_process",
            ActionKind::QuarantineFile => "quarantine_file",
            ActionKind::UpdateFirewall => "update_firewall",
            ActionKind::CollectForensics => "collect_forensics",
            ActionKind::NotifySoc => "notify_soc",
            ActionKind::CreateIncident => "create_incident",
            ActionKind::Custom(name) => name,
        }
    }

    pub fn parse(name: &str) -> Self {
        match name {
            "block_ip" => ActionKind::BlockIp,
            "unblock_ip" => ActionKind::UnblockIp,
            "block_port" => ActionKind::BlockPort,
            "isolate_host" => ActionKind::IsolateHost,
            "kill_process" => ActionKind::KillProcess,
            "quarantine_file" => ActionKind::QuarantineFile,
            "update_firewall" => ActionKind::UpdateFirewall,
            "collect_forensics" => ActionKind::CollectForensics,
            "notify_soc" => ActionKind::NotifySoc,
            "create_incident" => ActionKind::CreateIncident,
            other => ActionKind::Custom(other.to_string()),
        }
    }
}

impl From<String> for ActionKind {
    fn from(name: String) -> Self {
        ActionKind::parse(&name)
    }
}

impl From<ActionKind> for String {
    fn from(kind: ActionKind) -> Self {
        kind.as_str().to_string()
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    pub kind: ActionKind,
    #[serde(default)]
    pub params: Map<String, Value>,
    /// Bound on a single attempt. Unset means the caller's cancellation only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Attempts permitted, including the first.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_count: Option<u32>,
}

impl Action {
    pub fn new(kind: ActionKind) -> Self {
        Self {
            kind,
            params: Map::new(),
            timeout_ms: None,
            retry_count: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn with_retries(mut self, retry_count: u32) -> Self {
        self.retry_count = Some(retry_count);
        self
    }

    pub fn with_param(mut self, key: &str, value: Value) -> Self {
        self.params.insert(key.to_string(), value);
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub id: String,
    pub name: String,
    /// Empty matches any threat type.
    #[serde(default)]
    pub threat_type: String,
    /// Unset matches any severity.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<Severity>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    pub actions: Vec<Action>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "enabled_default")]
    pub enabled: bool,
}

fn enabled_default() -> bool {
    true
}

impl Rule {
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(Error::InvalidArgument("rule id must not be empty".into()));
        }
        if self.actions.is_empty() {
            return Err(Error::InvalidArgument(format!(
                "rule {} has no actions",
                self.id
            )));
        }
        Ok(())
    }

    /// Type and severity filters against a threat event.
    pub fn applies_to(&self, event: &EventEnvelope) -> bool {
        let Some(threat) = event.threat() else {
            return false;
        };
        (self.threat_type.is_empty() || self.threat_type == threat.threat_type)
            && self.severity.map_or(true, |s| s == event.severity)
    }

    pub fn conditions_hold(&self, view: &Value) -> bool {
        self.conditions.iter().all(|c| c.evaluate(view))
    }
}

/// The rule set loaded at start-up.
pub fn default_rules() -> Vec<Rule> {
    let action = |kind: ActionKind, secs: u64| Action::new(kind).with_timeout(Duration::from_secs(secs));
    vec![
        Rule {
            id: "RULE-001".to_string(),
            name: "Critical Malware Response".to_string(),
            threat_type: "malware".to_string(),
            severity: Some(Severity::Critical),
            conditions: Vec::new(),
            actions: vec![
                action(ActionKind::IsolateHost, 30),
                action(ActionKind::NotifySoc, 10),
                action(ActionKind::CreateIncident, 20),
                action(ActionKind::CollectForensics, 60),
            ],
            priority: 100,
            enabled: true,
        },
        Rule {
            id: "RULE-002".to_string(),
            name: "Critical Intrusion Response".to_string(),
            threat_type: "intrusion".to_string(),
            severity: Some(Severity::Critical),
            conditions: Vec::new(),
            actions: vec![
                action(ActionKind::BlockIp, 15),
                action(ActionKind::NotifySoc, 10),
                action(ActionKind::CreateIncident, 20),
                action(ActionKind::UpdateFirewall, 30),
            ],
            priority: 100,
            enabled: true,
        },
        Rule {
            id: "RULE-003".to_string(),
            name: "DDoS Mitigation".to_string(),
            threat_type: "ddos".to_string(),
            severity: Some(Severity::High),
            conditions: Vec::new(),
            actions: vec![
                action(ActionKind::BlockIp, 15),
                action(ActionKind::UpdateFirewall, 30),
                action(ActionKind::NotifySoc, 10),
            ],
            priority: 90,
            enabled: true,
        },
    ]
}
