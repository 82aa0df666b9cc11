//! Agent records and the registration/heartbeat wire shapes.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::credentials::IssuedCredential;
use crate::events::AgentMode;

use super::config::AgentConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Active,
    Inactive,
    Offline,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Active => "active",
            AgentStatus::Inactive => "inactive",
            AgentStatus::Offline => "offline",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Agent {
    pub agent_id: String,
    pub mode: AgentMode,
    pub hostname: String,
    pub address: String,
    pub capabilities: Vec<String>,
    pub metadata: Map<String, Value>,
    pub status: AgentStatus,
    pub registered_at: DateTime<Utc>,
    /// Server time of the last heartbeat (registration counts as one).
    pub last_heartbeat: DateTime<Utc>,
    /// Timestamp the agent itself reported in its last heartbeat.
    pub reported_at: Option<DateTime<Utc>>,
    pub last_metrics: Map<String, Value>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub config: Arc<AgentConfig>,
}

impl Agent {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegistrationRequest {
    #[serde(default)]
    pub agent_id: Option<String>,
    pub mode: AgentMode,
    pub hostname: String,
    pub ip_address: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl RegistrationRequest {
    pub fn new(mode: AgentMode, hostname: &str, ip_address: &str) -> Self {
        Self {
            agent_id: None,
            mode,
            hostname: hostname.to_string(),
            ip_address: ip_address.to_string(),
            capabilities: Vec::new(),
            metadata: Map::new(),
        }
    }

    pub fn with_capabilities(mut self, capabilities: &[&str]) -> Self {
        self.capabilities = capabilities.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn with_agent_id(mut self, agent_id: &str) -> Self {
        self.agent_id = Some(agent_id.to_string());
        self
    }
}

/// Everything the enrolling agent needs. Carries secrets, so it is not
/// `Debug`-printed in full.
#[derive(Clone)]
pub struct Registration {
    pub agent_id: String,
    pub mode: AgentMode,
    pub credential: IssuedCredential,
    /// Client private key for external agents. Only ever returned here.
    pub client_key: Option<String>,
    pub config: Arc<AgentConfig>,
    pub heartbeat_interval_secs: u64,
}

impl Registration {
    pub fn api_key(&self) -> Option<&str> {
        match &self.credential {
            IssuedCredential::ApiKey { api_key } => Some(api_key),
            IssuedCredential::Mtls { .. } => None,
        }
    }

    pub fn client_certificate_pem(&self) -> Option<&str> {
        match &self.credential {
            IssuedCredential::Mtls {
                certificate_pem, ..
            } => Some(certificate_pem),
            IssuedCredential::ApiKey { .. } => None,
        }
    }
}

impl std::fmt::Debug for Registration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registration")
            .field("agent_id", &self.agent_id)
            .field("mode", &self.mode)
            .field("credential", &self.credential)
            .field("heartbeat_interval_secs", &self.heartbeat_interval_secs)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Heartbeat {
    pub agent_id: String,
    pub status: AgentStatus,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metrics: Map<String, Value>,
}

/// Filter for [`AgentRegistry::list`](super::AgentRegistry::list).
#[derive(Debug, Clone, Copy, Default)]
pub struct AgentFilter {
    pub mode: Option<AgentMode>,
    pub status: Option<AgentStatus>,
    pub include_deleted: bool,
}

impl AgentFilter {
    pub fn mode(mode: AgentMode) -> Self {
        Self {
            mode: Some(mode),
            ..Self::default()
        }
    }

    pub fn matches(&self, agent: &Agent) -> bool {
        (self.include_deleted || !agent.is_deleted())
            && self.mode.map_or(true, |mode| agent.mode == mode)
            && self.status.map_or(true, |status| agent.status == status)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RegistryStatistics {
    pub total: usize,
    pub external: usize,
    pub internal: usize,
    pub active: usize,
    pub inactive: usize,
    pub offline: usize,
    pub deleted: usize,
}

/// Identity established by [`AgentRegistry::authenticate`](super::AgentRegistry::authenticate).
#[derive(Debug, Clone)]
pub struct AuthenticatedAgent {
    pub agent_id: String,
    pub mode: AgentMode,
    pub config: Arc<AgentConfig>,
}

/// `agent-ext-<12 hex>` or `agent-int-<12 hex>`.
pub fn generate_agent_id(mode: AgentMode) -> String {
    let prefix = match mode {
        AgentMode::External => "ext",
        AgentMode::Internal => "int",
    };
    let mut bytes = [0u8; 6];
    OsRng.fill_bytes(&mut bytes);
    format!("agent-{}-{}", prefix, hex::encode(bytes))
}

pub fn is_valid_agent_id(agent_id: &str) -> bool {
    !agent_id.is_empty()
        && agent_id.len() <= 64
        && agent_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
}
