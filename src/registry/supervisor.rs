//! Heartbeat supervision.
//!
//! Runs at twice the heartbeat interval, marks silent agents offline and
//! announces each transition as a `device.disconnected` event.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::broker::EventPublisher;
use crate::clock::Clock;
use crate::error::Result;
use crate::events::EventEnvelope;
use crate::logging::structured::LogContext;
use crate::resilience::CancelToken;
use crate::scheduler::{PeriodicTask, TaskJob};
use crate::{log_info, log_warn};

use super::fleet::AgentRegistry;

pub const SUPERVISOR_TASK: &str = "heartbeat_supervisor";

pub struct HeartbeatSupervisor {
    registry: Arc<AgentRegistry>,
    publisher: Arc<dyn EventPublisher>,
    clock: Arc<dyn Clock>,
}

impl HeartbeatSupervisor {
    pub fn new(
        registry: Arc<AgentRegistry>,
        publisher: Arc<dyn EventPublisher>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            registry,
            publisher,
            clock,
        }
    }

    /// One supervision pass. Returns how many agents went offline.
    pub async fn sweep(&self) -> usize {
        let offline = self.registry.sweep_offline();
        for agent in &offline {
            let event = EventEnvelope::device_disconnected(
                self.clock.now(),
                &agent.agent_id,
                agent.mode,
                &agent.hostname,
            );
            // A lost announcement does not undo the transition.
            if let Err(err) = self.publisher.publish_event(&event).await {
                log_warn!(
                    LogContext::for_agent(&agent.agent_id),
                    "DISCONNECT_EVENT_NOT_PUBLISHED",
                    error = err.to_string()
                );
            }
        }
        if !offline.is_empty() {
            log_info!(
                LogContext::for_task(SUPERVISOR_TASK),
                "SUPERVISION_SWEEP_COMPLETE",
                offline = offline.len()
            );
        }
        offline.len()
    }

    pub fn period(&self) -> Duration {
        Duration::from_secs(self.registry.config().heartbeat_interval_secs * 2)
    }

    pub fn spawn(self: Arc<Self>, cancel: CancelToken) -> PeriodicTask {
        let period = self.period();
        let clock = self.clock.clone();
        PeriodicTask::spawn(SUPERVISOR_TASK, period, self, clock, cancel)
    }
}

#[async_trait]
impl TaskJob for HeartbeatSupervisor {
    async fn run(&self, _cancel: &CancelToken) -> Result<()> {
        self.sweep().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{BrokerAdapter, MemoryBroker};
    use crate::clock::ManualClock;
    use crate::config::{BrokerConfig, CredentialConfig, RegistryConfig};
    use crate::credentials::CredentialStore;
    use crate::events::AgentMode;
    use crate::registry::RegistrationRequest;
    use chrono::Utc;

    #[tokio::test]
    async fn test_sweep_publishes_device_disconnected() {
        let clock = ManualClock::shared(Utc::now());
        let credentials =
            Arc::new(CredentialStore::new(CredentialConfig::default(), clock.clone()).unwrap());
        let registry = Arc::new(AgentRegistry::new(
            RegistryConfig::default(),
            credentials,
            clock.clone(),
        ));
        let reg = registry
            .register(RegistrationRequest::new(AgentMode::External, "host-1", "10.0.0.5"))
            .unwrap();

        let broker = Arc::new(MemoryBroker::new());
        let adapter = BrokerAdapter::new(broker.clone(), BrokerConfig::default());
        adapter.connect().await.unwrap();

        let supervisor = HeartbeatSupervisor::new(registry, Arc::new(adapter.clone()), clock.clone());
        assert_eq!(supervisor.period(), Duration::from_secs(60));
        assert_eq!(supervisor.sweep().await, 0);

        clock.advance(chrono::Duration::seconds(61));
        assert_eq!(supervisor.sweep().await, 1);

        let published = broker.published_with_key("device.disconnected");
        assert_eq!(published.len(), 1);
        assert_eq!(
            published[0].headers.get("agent_id").map(String::as_str),
            Some(reg.agent_id.as_str())
        );
        adapter.close().await;
    }
}
