//! Authoritative in-memory state of the agent fleet.
//!
//! The agent map sits behind one reader-writer lock; each record has its own
//! mutex so heartbeats only contend per agent. Deregistered agents stay in
//! the map as tombstones, which is what keeps their ids from being reused.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::{Mutex, RwLock};

use crate::clock::Clock;
use crate::config::RegistryConfig;
use crate::credentials::{AgentCredential, CredentialStore, IssuedCredential};
use crate::error::{Error, Result};
use crate::events::AgentMode;
use crate::logging::structured::LogContext;
use crate::{log_debug, log_info, log_warn};

use super::agent::{
    generate_agent_id, is_valid_agent_id, Agent, AgentFilter, AgentStatus, AuthenticatedAgent,
    Heartbeat, Registration, RegistrationRequest, RegistryStatistics,
};
use super::config::AgentConfig;

pub struct AgentRegistry {
    agents: RwLock<HashMap<String, Arc<Mutex<Agent>>>>,
    credentials: Arc<CredentialStore>,
    config: RegistryConfig,
    clock: Arc<dyn Clock>,
}

impl AgentRegistry {
    pub fn new(
        config: RegistryConfig,
        credentials: Arc<CredentialStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            agents: RwLock::new(HashMap::new()),
            credentials,
            config,
            clock,
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    pub fn credentials(&self) -> &Arc<CredentialStore> {
        &self.credentials
    }

    fn endpoint(&self, mode: AgentMode) -> &str {
        match mode {
            AgentMode::External => &self.config.external_endpoint,
            AgentMode::Internal => &self.config.internal_endpoint,
        }
    }

    pub fn register(&self, request: RegistrationRequest) -> Result<Registration> {
        if request.hostname.trim().is_empty() {
            return Err(Error::InvalidArgument("hostname is required".into()));
        }
        let now = self.clock.now();
        let config = Arc::new(AgentConfig::for_mode(request.mode, self.endpoint(request.mode)));

        let agent_id = {
            let mut agents = self.agents.write();
            let agent_id = match &request.agent_id {
                Some(id) => {
                    if !is_valid_agent_id(id) {
                        return Err(Error::InvalidArgument(format!("invalid agent id: {}", id)));
                    }
                    if agents.contains_key(id) {
                        return Err(Error::Conflict(format!("agent {} already exists", id)));
                    }
                    id.clone()
                }
                None => loop {
                    let candidate = generate_agent_id(request.mode);
                    if !agents.contains_key(&candidate) {
                        break candidate;
                    }
                },
            };
            let agent = Agent {
                agent_id: agent_id.clone(),
                mode: request.mode,
                hostname: request.hostname.clone(),
                address: request.ip_address.clone(),
                capabilities: request.capabilities.clone(),
                metadata: request.metadata.clone(),
                status: AgentStatus::Active,
                registered_at: now,
                last_heartbeat: now,
                reported_at: None,
                last_metrics: Default::default(),
                deleted_at: None,
                config: config.clone(),
            };
            agents.insert(agent_id.clone(), Arc::new(Mutex::new(agent)));
            agent_id
        };

        let credential = match self.credentials.issue(&agent_id, request.mode) {
            Ok(credential) => credential,
            Err(err) => {
                self.agents.write().remove(&agent_id);
                return Err(err);
            }
        };
        let client_key = match &credential {
            IssuedCredential::Mtls { .. } => self.credentials.take_private_key(&agent_id),
            IssuedCredential::ApiKey { .. } => None,
        };

        log_info!(
            LogContext::for_agent(&agent_id),
            "AGENT_REGISTERED",
            mode = request.mode.as_str(),
            hostname = request.hostname,
            address = request.ip_address
        );
        Ok(Registration {
            agent_id,
            mode: request.mode,
            credential,
            client_key,
            config,
            heartbeat_interval_secs: self.config.heartbeat_interval_secs,
        })
    }

    fn record(&self, agent_id: &str) -> Result<Arc<Mutex<Agent>>> {
        self.agents
            .read()
            .get(agent_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("agent {}", agent_id)))
    }

    pub fn heartbeat(&self, heartbeat: &Heartbeat) -> Result<()> {
        let record = self.record(&heartbeat.agent_id)?;
        let now = self.clock.now();
        let mut agent = record.lock();
        if agent.is_deleted() {
            return Err(Error::NotFound(format!("agent {}", heartbeat.agent_id)));
        }
        let was_offline = agent.status == AgentStatus::Offline;
        agent.last_heartbeat = now;
        agent.reported_at = Some(heartbeat.timestamp);
        agent.status = heartbeat.status;
        agent.last_metrics = heartbeat.metrics.clone();
        drop(agent);

        let ctx = LogContext::for_agent(&heartbeat.agent_id);
        if was_offline {
            log_info!(ctx, "AGENT_BACK_ONLINE", status = heartbeat.status.as_str());
        } else {
            log_debug!(ctx, "AGENT_HEARTBEAT", status = heartbeat.status.as_str());
        }
        Ok(())
    }

    /// Snapshot of a live agent.
    pub fn get(&self, agent_id: &str) -> Result<Agent> {
        let agent = self.record(agent_id)?.lock().clone();
        if agent.is_deleted() {
            return Err(Error::NotFound(format!("agent {}", agent_id)));
        }
        Ok(agent)
    }

    pub fn list(&self, filter: AgentFilter) -> Vec<Agent> {
        let mut agents: Vec<Agent> = self
            .agents
            .read()
            .values()
            .map(|record| record.lock().clone())
            .filter(|agent| filter.matches(agent))
            .collect();
        agents.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        agents
    }

    /// Soft delete: revokes every credential and keeps a tombstone.
    pub fn deregister(&self, agent_id: &str) -> Result<()> {
        let record = self.record(agent_id)?;
        {
            let mut agent = record.lock();
            if agent.is_deleted() {
                return Err(Error::NotFound(format!("agent {}", agent_id)));
            }
            agent.deleted_at = Some(self.clock.now());
            agent.status = AgentStatus::Inactive;
        }
        let revoked = self.credentials.revoke_all(agent_id);
        log_info!(
            LogContext::for_agent(agent_id),
            "AGENT_DEREGISTERED",
            credentials_revoked = revoked
        );
        Ok(())
    }

    /// Swap in a new config snapshot. Events already accepted keep the
    /// snapshot they were processed with.
    pub fn update_config(&self, agent_id: &str, config: AgentConfig) -> Result<Arc<AgentConfig>> {
        config.validate()?;
        let record = self.record(agent_id)?;
        let mut agent = record.lock();
        if agent.is_deleted() {
            return Err(Error::NotFound(format!("agent {}", agent_id)));
        }
        if config.mode != agent.mode {
            return Err(Error::InvalidArgument(format!(
                "cannot switch agent {} from {} to {}",
                agent_id, agent.mode, config.mode
            )));
        }
        let snapshot = Arc::new(config);
        agent.config = snapshot.clone();
        drop(agent);
        log_info!(LogContext::for_agent(agent_id), "AGENT_CONFIG_UPDATED");
        Ok(snapshot)
    }

    pub fn rotate_credentials(&self, agent_id: &str) -> Result<Registration> {
        let agent = self.get(agent_id)?;
        let credential = self.credentials.rotate(agent_id, agent.mode)?;
        let client_key = match &credential {
            IssuedCredential::Mtls { .. } => self.credentials.take_private_key(agent_id),
            IssuedCredential::ApiKey { .. } => None,
        };
        Ok(Registration {
            agent_id: agent.agent_id,
            mode: agent.mode,
            credential,
            client_key,
            config: agent.config,
            heartbeat_interval_secs: self.config.heartbeat_interval_secs,
        })
    }

    /// Verify a presented credential and resolve it to a live agent.
    pub fn authenticate(&self, credential: AgentCredential<'_>) -> Result<AuthenticatedAgent> {
        let verified = self.credentials.verify(credential)?;
        let record = self
            .record(&verified.agent_id)
            .map_err(|_| Error::Unauthenticated("credential does not belong to an agent".into()))?;
        let agent = record.lock();
        if agent.is_deleted() {
            return Err(Error::Revoked(format!("agent {} is deregistered", agent.agent_id)));
        }
        let expected = match credential {
            AgentCredential::Mtls(_) => AgentMode::External,
            AgentCredential::ApiKey(_) => AgentMode::Internal,
        };
        if agent.mode != expected {
            return Err(Error::Unauthenticated(format!(
                "{} agents cannot use this credential type",
                agent.mode
            )));
        }
        Ok(AuthenticatedAgent {
            agent_id: agent.agent_id.clone(),
            mode: agent.mode,
            config: agent.config.clone(),
        })
    }

    /// Mark agents offline whose last heartbeat is older than the offline
    /// timeout. Returns the agents that transitioned on this call.
    pub fn sweep_offline(&self) -> Vec<Agent> {
        let now = self.clock.now();
        let timeout = Duration::seconds(self.config.offline_timeout_secs);
        let records: Vec<Arc<Mutex<Agent>>> = self.agents.read().values().cloned().collect();

        let mut transitioned = Vec::new();
        for record in records {
            let mut agent = record.lock();
            if agent.is_deleted() || agent.status == AgentStatus::Offline {
                continue;
            }
            if is_stale(agent.last_heartbeat, now, timeout) {
                agent.status = AgentStatus::Offline;
                log_warn!(
                    LogContext::for_agent(&agent.agent_id),
                    "AGENT_OFFLINE",
                    last_heartbeat = agent.last_heartbeat.to_rfc3339(),
                    silent_secs = (now - agent.last_heartbeat).num_seconds()
                );
                transitioned.push(agent.clone());
            }
        }
        transitioned
    }

    pub fn statistics(&self) -> RegistryStatistics {
        let mut stats = RegistryStatistics::default();
        for record in self.agents.read().values() {
            let agent = record.lock();
            if agent.is_deleted() {
                stats.deleted += 1;
                continue;
            }
            stats.total += 1;
            match agent.mode {
                AgentMode::External => stats.external += 1,
                AgentMode::Internal => stats.internal += 1,
            }
            match agent.status {
                AgentStatus::Active => stats.active += 1,
                AgentStatus::Inactive => stats.inactive += 1,
                AgentStatus::Offline => stats.offline += 1,
            }
        }
        stats
    }
}

/// Strictly older than the timeout; a heartbeat exactly at the boundary is
/// still live.
fn is_stale(last_heartbeat: DateTime<Utc>, now: DateTime<Utc>, timeout: Duration) -> bool {
    now - last_heartbeat > timeout
}
