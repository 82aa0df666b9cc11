//! Batch context management.
//!
//! Correlates every log line of one ingest request with the agent and a
//! short batch id.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::events::AgentMode;
use crate::logging::structured::LogContext;
use crate::registry::{AgentConfig, AuthenticatedAgent};

/// Context for one authenticated request.
#[derive(Debug, Clone)]
pub struct BatchContext {
    pub batch_id: String,
    pub agent_id: String,
    pub agent_mode: AgentMode,
    pub received_at: DateTime<Utc>,
    /// Config snapshot taken at authentication; later updates do not apply.
    pub config: Arc<AgentConfig>,
}

impl BatchContext {
    pub fn new(agent: &AuthenticatedAgent, received_at: DateTime<Utc>) -> Self {
        Self {
            batch_id: format!("batch-{}", &Uuid::new_v4().simple().to_string()[..8]),
            agent_id: agent.agent_id.clone(),
            agent_mode: agent.mode,
            received_at,
            config: agent.config.clone(),
        }
    }

    pub fn log_context(&self) -> LogContext {
        LogContext {
            agent_id: Some(self.agent_id.clone()),
            request_id: Some(self.batch_id.clone()),
            ..LogContext::default()
        }
    }

    /// Context for a single event within the batch.
    pub fn event_context(&self, event_id: &str) -> LogContext {
        self.log_context().with_event(event_id)
    }
}
