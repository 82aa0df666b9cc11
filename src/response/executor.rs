//! Response executor.
//!
//! Turns rule actions into effector calls. Each call runs under the
//! resilience fabric: a per-attempt timeout, bounded retry and a circuit
//! breaker per `(kind, target)`.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Map, Value};

use crate::clock::Clock;
use crate::config::ResponseConfig;
use crate::error::{Error, Result};
use crate::events::EventEnvelope;
use crate::logging::structured::LogContext;
use crate::resilience::{retry_when, BreakerRegistry, CancelToken};
use crate::rules::{Action, ActionKind};
use crate::{log_debug, log_info, log_warn};

use super::effectors::{
    parse_duration, BlockAction, CustomEffector, Effectors, FirewallRule, Protocol,
};

pub const SOC_CHANNEL: &str = "soc-alerts";
pub const DEFAULT_BLOCK_DURATION: Duration = Duration::from_secs(24 * 3_600);

/// Outcome of running one rule's actions against one event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResponseResult {
    pub event_id: String,
    pub rule_id: Option<String>,
    /// Kinds of the actions that succeeded, in execution order.
    pub executed: Vec<String>,
    pub errors: Vec<String>,
    pub duration: Duration,
    pub success: bool,
    pub timestamp: DateTime<Utc>,
}

impl ResponseResult {
    pub fn succeeded(&self) -> usize {
        self.executed.len()
    }

    pub fn failed(&self) -> usize {
        self.errors.len()
    }
}

/// An action with its parameters resolved against the event.
enum Invocation {
    BlockIp {
        ip: IpAddr,
        duration: Duration,
        action: BlockAction,
    },
    UnblockIp {
        ip: IpAddr,
        reason: String,
    },
    BlockPort {
        port: u16,
        protocol: Protocol,
        duration: Duration,
    },
    IsolateHost {
        host: String,
    },
    KillProcess {
        selector: Map<String, Value>,
    },
    QuarantineFile {
        path: String,
    },
    UpdateFirewall {
        rules: Vec<FirewallRule>,
    },
    CollectForensics {
        context: Map<String, Value>,
    },
    Notify {
        channel: String,
        message: String,
        meta: Map<String, Value>,
    },
    CreateIncident {
        payload: Value,
    },
    Custom(Arc<dyn CustomEffector>),
}

impl Invocation {
    /// Breaker target: the thing the effector acts on.
    fn target(&self) -> String {
        match self {
            Invocation::BlockIp { ip, .. } | Invocation::UnblockIp { ip, .. } => ip.to_string(),
            Invocation::BlockPort { port, protocol, .. } => {
                format!("{}/{}", port, protocol.as_str())
            }
            Invocation::IsolateHost { host } => host.clone(),
            Invocation::QuarantineFile { path } => path.clone(),
            Invocation::Notify { channel, .. } => channel.clone(),
            Invocation::UpdateFirewall { .. } => "firewall".to_string(),
            Invocation::KillProcess { .. } | Invocation::CollectForensics { .. } => {
                "endpoint".to_string()
            }
            Invocation::CreateIncident { .. } => "ticketing".to_string(),
            Invocation::Custom(_) => "custom".to_string(),
        }
    }
}

fn invalid(kind: &ActionKind, message: impl std::fmt::Display) -> Error {
    Error::InvalidArgument(format!("{}: {}", kind, message))
}

fn param_str<'a>(action: &'a Action, key: &str) -> Option<&'a str> {
    action.params.get(key).and_then(Value::as_str)
}

fn event_source(event: &EventEnvelope) -> String {
    event
        .threat()
        .map(|threat| threat.source_ip.clone())
        .unwrap_or_else(|| event.agent_id.clone())
}

fn ip_param(action: &Action, event: &EventEnvelope) -> Result<IpAddr> {
    let raw = match param_str(action, "ip") {
        Some(ip) => ip.to_string(),
        None => event
            .threat()
            .map(|threat| threat.source_ip.clone())
            .ok_or_else(|| invalid(&action.kind, "no ip parameter and no threat source"))?,
    };
    raw.parse()
        .map_err(|_| invalid(&action.kind, format!("{} is not an IP address", raw)))
}

fn duration_param(action: &Action) -> Result<Duration> {
    match action.params.get("duration") {
        None => Ok(DEFAULT_BLOCK_DURATION),
        Some(Value::Number(secs)) => secs
            .as_u64()
            .map(Duration::from_secs)
            .ok_or_else(|| invalid(&action.kind, "duration must be positive")),
        Some(Value::String(text)) => parse_duration(text)
            .ok_or_else(|| invalid(&action.kind, format!("bad duration {}", text))),
        Some(_) => Err(invalid(&action.kind, "duration must be a string or seconds")),
    }
}

fn typed_param<T: serde::de::DeserializeOwned>(action: &Action, key: &str) -> Result<Option<T>> {
    action
        .params
        .get(key)
        .map(|value| serde_json::from_value(value.clone()))
        .transpose()
        .map_err(|err| invalid(&action.kind, format!("bad {}: {}", key, err)))
}

pub struct ResponseExecutor {
    effectors: Effectors,
    breakers: Arc<BreakerRegistry>,
    config: ResponseConfig,
    clock: Arc<dyn Clock>,
}

impl ResponseExecutor {
    pub fn new(effectors: Effectors, config: ResponseConfig, clock: Arc<dyn Clock>) -> Self {
        let breakers = Arc::new(BreakerRegistry::new(config.breaker.clone(), clock.clone()));
        Self {
            effectors,
            breakers,
            config,
            clock,
        }
    }

    pub fn breakers(&self) -> &Arc<BreakerRegistry> {
        &self.breakers
    }

    pub fn is_dry_run(&self) -> bool {
        self.config.dry_run
    }

    /// Run `actions` in order. A failed action is recorded and the rest
    /// still run.
    pub async fn execute(
        &self,
        rule_id: Option<&str>,
        actions: &[Action],
        event: &EventEnvelope,
        cancel: &CancelToken,
    ) -> ResponseResult {
        let started = Instant::now();
        let ctx = LogContext::for_agent(&event.agent_id).with_event(&event.id);
        let mut executed = Vec::new();
        let mut errors = Vec::new();

        for action in actions {
            match self.execute_action(action, event, cancel).await {
                Ok(()) => executed.push(action.kind.to_string()),
                Err(err) => {
                    log_warn!(
                        ctx,
                        "ACTION_FAILED",
                        kind = action.kind.as_str(),
                        error = err.to_string()
                    );
                    errors.push(format!("{} failed: {}", action.kind, err));
                }
            }
        }

        ResponseResult {
            event_id: event.id.clone(),
            rule_id: rule_id.map(str::to_string),
            success: errors.is_empty(),
            executed,
            errors,
            duration: started.elapsed(),
            timestamp: self.clock.now(),
        }
    }

    /// Run a single action under timeout, retry and its breaker.
    pub async fn execute_action(
        &self,
        action: &Action,
        event: &EventEnvelope,
        cancel: &CancelToken,
    ) -> Result<()> {
        let ctx = LogContext::for_agent(&event.agent_id).with_event(&event.id);
        let invocation = self.resolve(action, event)?;

        if self.config.dry_run {
            log_info!(
                ctx,
                "ACTION_DRY_RUN",
                kind = action.kind.as_str(),
                target = invocation.target()
            );
            return Ok(());
        }

        let key = BreakerRegistry::key(action.kind.as_str(), &invocation.target());
        let breaker = self.breakers.get(&key);
        let attempts = action
            .retry_count
            .unwrap_or(self.config.default_retry_count)
            .max(1);
        let retry_config = self.config.retry.with_attempts(attempts);
        let timeout = action.timeout();

        let started = Instant::now();
        retry_when(
            &retry_config,
            cancel,
            &ctx,
            |err| !matches!(err, Error::OpenCircuit(_)),
            |attempt| {
                let breaker = breaker.clone();
                let invocation = &invocation;
                let ctx = &ctx;
                async move {
                    log_debug!(ctx, "ACTION_ATTEMPT", kind = action.kind.as_str(), attempt = attempt);
                    breaker
                        .call(|| self.attempt(invocation, action, event, timeout, cancel))
                        .await
                }
            },
        )
        .await?;

        log_info!(
            ctx,
            "ACTION_EXECUTED",
            kind = action.kind.as_str(),
            target = invocation.target(),
            duration_ms = started.elapsed().as_millis()
        );
        Ok(())
    }

    async fn attempt(
        &self,
        invocation: &Invocation,
        action: &Action,
        event: &EventEnvelope,
        timeout: Option<Duration>,
        cancel: &CancelToken,
    ) -> Result<()> {
        let call = self.invoke(invocation, action, event);
        let outcome = match timeout {
            Some(limit) => tokio::select! {
                result = tokio::time::timeout(limit, call) => {
                    result.map_err(|_| Error::Timeout(limit))?
                }
                _ = cancel.cancelled() => return Err(Error::Cancelled),
            },
            None => tokio::select! {
                result = call => result,
                _ = cancel.cancelled() => return Err(Error::Cancelled),
            },
        };
        outcome.map_err(|err| Error::Transient(format!("{}: {:#}", action.kind, err)))
    }

    async fn invoke(
        &self,
        invocation: &Invocation,
        action: &Action,
        event: &EventEnvelope,
    ) -> anyhow::Result<()> {
        let fx = &self.effectors;
        match invocation {
            Invocation::BlockIp {
                ip,
                duration,
                action,
            } => fx.firewall.block_ip(*ip, *duration, *action).await,
            Invocation::UnblockIp { ip, reason } => fx.firewall.unblock_ip(*ip, reason).await,
            Invocation::BlockPort {
                port,
                protocol,
                duration,
            } => fx.firewall.block_port(*port, *protocol, *duration).await,
            Invocation::UpdateFirewall { rules } => fx.firewall.update_firewall(rules).await,
            Invocation::IsolateHost { host } => fx.host.isolate_host(host).await,
            Invocation::KillProcess { selector } => fx.endpoint.kill_process(selector).await,
            Invocation::QuarantineFile { path } => fx.endpoint.quarantine_file(path).await,
            Invocation::CollectForensics { context } => {
                fx.endpoint.collect_forensics(context).await
            }
            Invocation::Notify {
                channel,
                message,
                meta,
            } => fx.notifier.send_notification(channel, message, meta).await,
            Invocation::CreateIncident { payload } => {
                let incident_id = fx.ticketing.create_incident(payload).await?;
                log_info!(
                    LogContext::for_agent(&event.agent_id).with_event(&event.id),
                    "INCIDENT_CREATED",
                    incident_id = incident_id
                );
                Ok(())
            }
            Invocation::Custom(effector) => effector.execute(action, event).await,
        }
    }

    /// Resolve parameters. Failures here are terminal and never retried.
    fn resolve(&self, action: &Action, event: &EventEnvelope) -> Result<Invocation> {
        let kind = &action.kind;
        Ok(match kind {
            ActionKind::BlockIp => Invocation::BlockIp {
                ip: ip_param(action, event)?,
                duration: duration_param(action)?,
                action: typed_param(action, "action")?.unwrap_or(BlockAction::Drop),
            },
            ActionKind::UnblockIp => Invocation::UnblockIp {
                ip: ip_param(action, event)?,
                reason: param_str(action, "reason")
                    .unwrap_or("automated response")
                    .to_string(),
            },
            ActionKind::BlockPort => Invocation::BlockPort {
                port: typed_param(action, "port")?
                    .ok_or_else(|| invalid(kind, "missing port"))?,
                protocol: typed_param(action, "protocol")?.unwrap_or(Protocol::Tcp),
                duration: duration_param(action)?,
            },
            ActionKind::IsolateHost => Invocation::IsolateHost {
                host: param_str(action, "host")
                    .map(str::to_string)
                    .unwrap_or_else(|| event_source(event)),
            },
            ActionKind::KillProcess => {
                if action.params.is_empty() {
                    return Err(invalid(kind, "missing process selector"));
                }
                Invocation::KillProcess {
                    selector: action.params.clone(),
                }
            }
            ActionKind::QuarantineFile => Invocation::QuarantineFile {
                path: param_str(action, "path")
                    .ok_or_else(|| invalid(kind, "missing path"))?
                    .to_string(),
            },
            ActionKind::UpdateFirewall => {
                let rules = match typed_param::<Vec<FirewallRule>>(action, "rules")? {
                    Some(rules) => rules,
                    None => vec![FirewallRule::BlockIp {
                        ip: ip_param(action, event)?,
                        action: BlockAction::Drop,
                    }],
                };
                Invocation::UpdateFirewall { rules }
            }
            ActionKind::CollectForensics => {
                let mut context = action.params.clone();
                context.insert("event_id".into(), Value::String(event.id.clone()));
                context.insert("source".into(), Value::String(event_source(event)));
                context.insert("timestamp".into(), Value::String(event.timestamp.to_rfc3339()));
                Invocation::CollectForensics { context }
            }
            ActionKind::NotifySoc => {
                let threat_type = event
                    .threat()
                    .map(|threat| threat.threat_type.as_str())
                    .unwrap_or(event.event_type.as_str());
                let message = format!(
                    "Critical Threat Detected: {}\nSeverity: {}\nSource: {}\nDescription: {}",
                    threat_type,
                    event.severity,
                    event_source(event),
                    event.message
                );
                let mut meta = Map::new();
                meta.insert("event_id".into(), Value::String(event.id.clone()));
                meta.insert("timestamp".into(), Value::String(event.timestamp.to_rfc3339()));
                Invocation::Notify {
                    channel: param_str(action, "channel").unwrap_or(SOC_CHANNEL).to_string(),
                    message,
                    meta,
                }
            }
            ActionKind::CreateIncident => {
                let threat_type = event
                    .threat()
                    .map(|threat| threat.threat_type.as_str())
                    .unwrap_or(event.event_type.as_str());
                Invocation::CreateIncident {
                    payload: json!({
                        "title": format!("Security Incident: {}", threat_type),
                        "description": event.message,
                        "severity": event.severity,
                        "source": event_source(event),
                        "timestamp": event.timestamp.to_rfc3339(),
                        "metadata": event.metadata,
                    }),
                }
            }
            ActionKind::Custom(name) => match self.effectors.custom(name) {
                Some(effector) => Invocation::Custom(effector.clone()),
                None => return Err(Error::InvalidAction(name.clone())),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::events::{AgentMode, ThreatAction, ThreatDetails};
    use crate::resilience::{BreakerConfig, CircuitState, RetryConfig};
    use crate::response::{FirewallAdapter, InMemoryFirewall, RecordingEffectors};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Harness {
        clock: Arc<ManualClock>,
        firewall: Arc<InMemoryFirewall>,
        recorder: Arc<RecordingEffectors>,
        executor: ResponseExecutor,
    }

    fn config(dry_run: bool) -> ResponseConfig {
        ResponseConfig {
            dry_run,
            default_retry_count: 1,
            breaker: BreakerConfig {
                max_failures: 5,
                timeout_secs: 60,
                half_open_max_calls: 1,
            },
            retry: RetryConfig {
                max_attempts: 1,
                initial_interval_ms: 1,
                max_interval_ms: 2,
                multiplier: 2.0,
                max_jitter_ms: 0,
            },
            ..ResponseConfig::default()
        }
    }

    fn harness_with(config: ResponseConfig, effectors: impl FnOnce(Effectors) -> Effectors) -> Harness {
        let clock = ManualClock::shared(Utc::now());
        let firewall = Arc::new(InMemoryFirewall::new(clock.clone()));
        let recorder = Arc::new(RecordingEffectors::new());
        let base = Effectors::new(
            firewall.clone(),
            recorder.clone(),
            recorder.clone(),
            recorder.clone(),
            recorder.clone(),
        );
        let executor = ResponseExecutor::new(effectors(base), config, clock.clone());
        Harness {
            clock,
            firewall,
            recorder,
            executor,
        }
    }

    fn harness(dry_run: bool) -> Harness {
        harness_with(config(dry_run), |fx| fx)
    }

    fn ddos(now: DateTime<Utc>) -> EventEnvelope {
        EventEnvelope::new_threat(
            "agent-ext-0123456789ab",
            AgentMode::External,
            now,
            ThreatDetails {
                threat_type: "ddos".into(),
                threat_level: 8,
                source_ip: "192.168.1.100".into(),
                target_ip: None,
                target_port: None,
                action: ThreatAction::Detected,
                evidence: Map::new(),
            },
        )
    }

    #[tokio::test]
    async fn test_block_update_notify_succeed() {
        let h = harness(false);
        let event = ddos(h.clock.now());
        let actions = vec![
            Action::new(ActionKind::BlockIp).with_timeout(Duration::from_secs(15)),
            Action::new(ActionKind::UpdateFirewall),
            Action::new(ActionKind::NotifySoc),
        ];
        let result = h
            .executor
            .execute(Some("RULE-003"), &actions, &event, &CancelToken::new())
            .await;
        assert!(result.success, "{:?}", result.errors);
        assert_eq!(result.executed, ["block_ip", "update_firewall", "notify_soc"]);

        let blocked = h.firewall.get_block_list().await.unwrap();
        assert_eq!(blocked, vec!["192.168.1.100".parse::<IpAddr>().unwrap()]);

        let notes = h.recorder.calls_for("send_notification");
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].target, SOC_CHANNEL);
        assert!(notes[0].detail["message"].as_str().unwrap().contains("ddos"));
    }

    #[tokio::test]
    async fn test_block_duration_defaults_to_a_day() {
        let h = harness(false);
        let event = ddos(h.clock.now());
        h.executor
            .execute_action(&Action::new(ActionKind::BlockIp), &event, &CancelToken::new())
            .await
            .unwrap();
        h.clock.advance(chrono::Duration::hours(23));
        assert_eq!(h.firewall.get_block_list().await.unwrap().len(), 1);
        h.clock.advance(chrono::Duration::hours(2));
        assert!(h.firewall.get_block_list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_dry_run_has_no_side_effects() {
        let h = harness(true);
        let event = ddos(h.clock.now());
        let result = h
            .executor
            .execute(None, &[Action::new(ActionKind::BlockIp)], &event, &CancelToken::new())
            .await;
        assert!(result.success);
        assert_eq!(h.firewall.call_count(), 0);
    }

    #[tokio::test]
    async fn test_unknown_action_is_invalid_and_others_continue() {
        let h = harness(false);
        let event = ddos(h.clock.now());
        let actions = vec![
            Action::new(ActionKind::Custom("summon_dragons".into())),
            Action::new(ActionKind::CreateIncident),
        ];
        let err = h
            .executor
            .execute_action(&actions[0], &event, &CancelToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidAction(_)));

        let result = h.executor.execute(None, &actions, &event, &CancelToken::new()).await;
        assert!(!result.success);
        assert_eq!(result.executed, ["create_incident"]);
        assert_eq!(result.failed(), 1);
        assert_eq!(h.recorder.calls_for("create_incident").len(), 1);
    }

    #[tokio::test]
    async fn test_custom_effector_dispatch() {
        struct Pager(AtomicU32);
        #[async_trait]
        impl CustomEffector for Pager {
            async fn execute(&self, _action: &Action, _event: &EventEnvelope) -> anyhow::Result<()> {
                self.0.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }
        let pager = Arc::new(Pager(AtomicU32::new(0)));
        let h = harness_with(config(false), |fx| fx.with_custom("page_oncall", pager.clone()));
        let event = ddos(h.clock.now());
        h.executor
            .execute_action(
                &Action::new(ActionKind::Custom("page_oncall".into())),
                &event,
                &CancelToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(pager.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_bad_parameters_are_not_retried() {
        let h = harness(false);
        let event = ddos(h.clock.now());
        let action = Action::new(ActionKind::BlockIp)
            .with_param("ip", json!("not-an-ip"))
            .with_retries(3);
        assert!(matches!(
            h.executor.execute_action(&action, &event, &CancelToken::new()).await,
            Err(Error::InvalidArgument(_))
        ));
        assert_eq!(h.firewall.call_count(), 0);
    }

    #[tokio::test]
    async fn test_retries_up_to_retry_count() {
        let h = harness(false);
        h.recorder.set_failing(true);
        let event = ddos(h.clock.now());
        let action = Action::new(ActionKind::IsolateHost).with_retries(3);
        let err = h
            .executor
            .execute_action(&action, &event, &CancelToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Permanent { attempts: 3, .. }));
    }

    #[tokio::test]
    async fn test_timeout_bounds_one_attempt() {
        struct Stuck;
        #[async_trait]
        impl CustomEffector for Stuck {
            async fn execute(&self, _action: &Action, _event: &EventEnvelope) -> anyhow::Result<()> {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(())
            }
        }
        let h = harness_with(config(false), |fx| fx.with_custom("slow", Arc::new(Stuck)));
        let event = ddos(h.clock.now());
        let action = Action::new(ActionKind::Custom("slow".into()))
            .with_timeout(Duration::from_millis(20));
        let err = h
            .executor
            .execute_action(&action, &event, &CancelToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Permanent { ref last, .. } if matches!(**last, Error::Timeout(_))));
    }

    #[tokio::test]
    async fn test_breaker_opens_after_five_failures() {
        let h = harness(false);
        let event = ddos(h.clock.now());
        let action = Action::new(ActionKind::BlockIp);
        let cancel = CancelToken::new();

        h.firewall.set_failing(true);
        for _ in 0..5 {
            assert!(h.executor.execute_action(&action, &event, &cancel).await.is_err());
        }
        assert_eq!(h.firewall.call_count(), 5);
        let key = BreakerRegistry::key("block_ip", "192.168.1.100");
        assert_eq!(h.executor.breakers().get(&key).state(), CircuitState::Open);

        let sixth = h.executor.execute_action(&action, &event, &cancel).await;
        assert!(matches!(sixth, Err(Error::OpenCircuit(_))));
        assert_eq!(h.firewall.call_count(), 5);

        // Other targets have their own breaker.
        let other = action.clone().with_param("ip", json!("10.9.9.9"));
        h.firewall.set_failing(false);
        assert!(h.executor.execute_action(&other, &event, &cancel).await.is_ok());

        h.clock.advance(chrono::Duration::seconds(60));
        assert!(h.executor.execute_action(&action, &event, &cancel).await.is_ok());
        for _ in 0..100 {
            h.executor.execute_action(&action, &event, &cancel).await.unwrap();
        }
        assert_eq!(h.executor.breakers().get(&key).state(), CircuitState::Closed);
    }
}
