//! Effector seams.
//!
//! Effectors are the external systems that enact a response. Each returns
//! `anyhow::Result`; the executor folds failures into the crate error so
//! retry and the breakers can act on them.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::events::EventEnvelope;
use crate::rules::Action;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockAction {
    Drop,
    Reject,
}

impl BlockAction {
    pub fn target(&self) -> &'static str {
        match self {
            BlockAction::Drop => "DROP",
            BlockAction::Reject => "REJECT",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

/// One entry of an `update_firewall` rule set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FirewallRule {
    BlockIp {
        ip: IpAddr,
        #[serde(default = "default_block_action")]
        action: BlockAction,
    },
    BlockPort {
        port: u16,
        #[serde(default = "default_protocol")]
        protocol: Protocol,
    },
}

fn default_block_action() -> BlockAction {
    BlockAction::Drop
}

fn default_protocol() -> Protocol {
    Protocol::Tcp
}

#[async_trait]
pub trait FirewallAdapter: Send + Sync {
    async fn block_ip(&self, ip: IpAddr, duration: Duration, action: BlockAction)
        -> anyhow::Result<()>;

    async fn unblock_ip(&self, ip: IpAddr, reason: &str) -> anyhow::Result<()>;

    async fn block_port(&self, port: u16, protocol: Protocol, duration: Duration)
        -> anyhow::Result<()>;

    async fn update_firewall(&self, rules: &[FirewallRule]) -> anyhow::Result<()>;

    async fn list_rules(&self) -> anyhow::Result<Vec<String>>;

    async fn get_block_list(&self) -> anyhow::Result<Vec<IpAddr>>;
}

#[async_trait]
pub trait HostAdapter: Send + Sync {
    async fn isolate_host(&self, host: &str) -> anyhow::Result<()>;
}

#[async_trait]
pub trait EndpointAdapter: Send + Sync {
    async fn kill_process(&self, selector: &Map<String, Value>) -> anyhow::Result<()>;

    async fn quarantine_file(&self, path: &str) -> anyhow::Result<()>;

    async fn collect_forensics(&self, context: &Map<String, Value>) -> anyhow::Result<()>;
}

#[async_trait]
pub trait NotificationAdapter: Send + Sync {
    async fn send_notification(
        &self,
        channel: &str,
        message: &str,
        meta: &Map<String, Value>,
    ) -> anyhow::Result<()>;
}

#[async_trait]
pub trait TicketingAdapter: Send + Sync {
    /// Returns the incident id.
    async fn create_incident(&self, payload: &Value) -> anyhow::Result<String>;
}

/// Handler for an extension action kind.
#[async_trait]
pub trait CustomEffector: Send + Sync {
    async fn execute(&self, action: &Action, event: &EventEnvelope) -> anyhow::Result<()>;
}

/// The effectors an executor dispatches to.
#[derive(Clone)]
pub struct Effectors {
    pub firewall: Arc<dyn FirewallAdapter>,
    pub host: Arc<dyn HostAdapter>,
    pub endpoint: Arc<dyn EndpointAdapter>,
    pub notifier: Arc<dyn NotificationAdapter>,
    pub ticketing: Arc<dyn TicketingAdapter>,
    custom: HashMap<String, Arc<dyn CustomEffector>>,
}

impl Effectors {
    pub fn new(
        firewall: Arc<dyn FirewallAdapter>,
        host: Arc<dyn HostAdapter>,
        endpoint: Arc<dyn EndpointAdapter>,
        notifier: Arc<dyn NotificationAdapter>,
        ticketing: Arc<dyn TicketingAdapter>,
    ) -> Self {
        Self {
            firewall,
            host,
            endpoint,
            notifier,
            ticketing,
            custom: HashMap::new(),
        }
    }

    pub fn with_custom(mut self, kind: &str, effector: Arc<dyn CustomEffector>) -> Self {
        self.custom.insert(kind.to_string(), effector);
        self
    }

    pub fn custom(&self, kind: &str) -> Option<&Arc<dyn CustomEffector>> {
        self.custom.get(kind)
    }
}

impl std::fmt::Debug for Effectors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut custom: Vec<&String> = self.custom.keys().collect();
        custom.sort();
        f.debug_struct("Effectors")
            .field("custom", &custom)
            .finish_non_exhaustive()
    }
}

/// Parse `30s`, `15m`, `24h`, `7d` or a bare number of seconds.
pub fn parse_duration(value: &str) -> Option<Duration> {
    let value = value.trim();
    let (digits, unit) = match value.char_indices().last()? {
        (idx, c) if c.is_ascii_alphabetic() => (&value[..idx], c),
        _ => (value, 's'),
    };
    let amount: u64 = digits.trim().parse().ok()?;
    let secs = match unit {
        's' => amount,
        'm' => amount.checked_mul(60)?,
        'h' => amount.checked_mul(3_600)?,
        'd' => amount.checked_mul(86_400)?,
        _ => return None,
    };
    Some(Duration::from_secs(secs))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("24h"), Some(Duration::from_secs(86_400)));
        assert_eq!(parse_duration("15m"), Some(Duration::from_secs(900)));
        assert_eq!(parse_duration("30s"), Some(Duration::from_secs(30)));
        assert_eq!(parse_duration("2d"), Some(Duration::from_secs(172_800)));
        assert_eq!(parse_duration("3600"), Some(Duration::from_secs(3_600)));
        assert_eq!(parse_duration("h"), None);
        assert_eq!(parse_duration("5w"), None);
        assert_eq!(parse_duration(""), None);
    }

    #[test]
    fn test_firewall_rule_parses() {
        let rules: Vec<FirewallRule> = serde_json::from_str(
            r#"[{"type":"block_ip","ip":"10.0.0.9"},{"type":"block_port","port":23,"protocol":"udp"}]"#,
        )
        .unwrap();
        assert_eq!(
            rules[0],
            FirewallRule::BlockIp {
                ip: "10.0.0.9".parse().unwrap(),
                action: BlockAction::Drop
            }
        );
        assert_eq!(
            rules[1],
            FirewallRule::BlockPort {
                port: 23,
                protocol: Protocol::Udp
            }
        );
    }
}
