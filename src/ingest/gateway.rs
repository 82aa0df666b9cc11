//! Authenticated event intake.
//!
//! Coordinates the per-event path shared by batch and streaming delivery:
//! 1. Authentication (mTLS or API key, resolved through the registry)
//! 2. Backpressure (per-agent in-flight cap)
//! 3. Schema validation
//! 4. Timestamp skew clamp / reject
//! 5. PII detection on message and metadata, then redaction
//! 6. Publish to the broker under `<family>.<subtype>`

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::broker::EventPublisher;
use crate::clock::Clock;
use crate::compliance::anonymizer::{AnonymizationMethod, Anonymizer};
use crate::compliance::pii::{self, occurrence, PiiMatch};
use crate::config::IngestConfig;
use crate::credentials::AgentCredential;
use crate::error::{Error, Result};
use crate::events::{determine_routing, EventEnvelope};
use crate::logging::structured::LogContext;
use crate::registry::AgentRegistry;
use crate::resilience::CancelToken;
use crate::{log_debug, log_info, log_warn};

use super::backpressure::InFlightLimiter;
use super::context::BatchContext;
use super::validation::{check_skew, parse_envelope, SkewOutcome};

#[derive(Debug, Clone, Deserialize)]
pub struct EventBatch {
    pub agent_id: String,
    pub events: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventFailure {
    /// Position in the submitted batch.
    pub index: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
    pub kind: String,
    pub reason: String,
    /// The agent should keep the event buffered and resend it.
    pub retryable: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchResponse {
    pub received_count: usize,
    pub saved_count: usize,
    pub failed_count: usize,
    pub errors: Vec<EventFailure>,
}

impl BatchResponse {
    pub fn has_retryable_failures(&self) -> bool {
        self.errors.iter().any(|e| e.retryable)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventReceipt {
    pub event_id: String,
    pub routing_key: String,
    pub clamped: bool,
}

pub struct IngestGateway {
    registry: Arc<AgentRegistry>,
    publisher: Arc<dyn EventPublisher>,
    anonymizer: Arc<Anonymizer>,
    config: IngestConfig,
    clock: Arc<dyn Clock>,
    limiter: InFlightLimiter,
}

impl IngestGateway {
    pub fn new(
        registry: Arc<AgentRegistry>,
        publisher: Arc<dyn EventPublisher>,
        anonymizer: Arc<Anonymizer>,
        config: IngestConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let limiter = InFlightLimiter::new(Duration::from_secs(config.retry_after_secs));
        Self {
            registry,
            publisher,
            anonymizer,
            config,
            clock,
            limiter,
        }
    }

    pub fn in_flight(&self, agent_id: &str) -> usize {
        self.limiter.in_flight(agent_id)
    }

    fn authenticate(&self, credential: AgentCredential<'_>, agent_id: &str) -> Result<BatchContext> {
        let agent = self.registry.authenticate(credential)?;
        if agent.agent_id != agent_id {
            return Err(Error::Unauthorized(format!(
                "credential belongs to {}, not {}",
                agent.agent_id, agent_id
            )));
        }
        Ok(BatchContext::new(&agent, self.clock.now()))
    }

    fn in_flight_cap(&self, batch: &BatchContext) -> usize {
        batch.config.in_flight_cap(
            self.config.assumed_event_bytes,
            self.config.min_in_flight,
            self.config.max_in_flight,
        )
    }

    /// Accept a batch. Request-level failures (authentication, batch size,
    /// backpressure) are returned as errors; per-event failures are reported
    /// in the response.
    pub async fn submit_batch(
        &self,
        credential: AgentCredential<'_>,
        batch: &EventBatch,
        cancel: &CancelToken,
    ) -> Result<BatchResponse> {
        let ctx = self.authenticate(credential, &batch.agent_id)?;
        let log_ctx = ctx.log_context();

        if batch.events.len() > self.config.max_batch_size {
            log_warn!(
                log_ctx,
                "BATCH_TOO_LARGE",
                size = batch.events.len(),
                limit = self.config.max_batch_size
            );
            return Err(Error::InvalidArgument(format!(
                "batch of {} events exceeds limit {}",
                batch.events.len(),
                self.config.max_batch_size
            )));
        }

        let _permit = self
            .limiter
            .try_acquire(&ctx.agent_id, batch.events.len(), self.in_flight_cap(&ctx))
            .map_err(|err| {
                log_warn!(log_ctx, "BACKPRESSURE", in_flight = self.in_flight(&ctx.agent_id));
                err
            })?;

        let mut response = BatchResponse {
            received_count: batch.events.len(),
            ..BatchResponse::default()
        };

        for (index, raw) in batch.events.iter().enumerate() {
            if cancel.is_cancelled() {
                response.errors.push(EventFailure {
                    index,
                    event_id: None,
                    kind: Error::Cancelled.kind().to_string(),
                    reason: "request cancelled".to_string(),
                    retryable: true,
                });
                continue;
            }
            match self.process_event(&ctx, raw).await {
                Ok(_) => response.saved_count += 1,
                Err((event_id, err)) => {
                    response.errors.push(EventFailure {
                        index,
                        event_id,
                        kind: err.kind().to_string(),
                        reason: err.to_string(),
                        retryable: err.is_retryable(),
                    });
                }
            }
        }
        response.failed_count = response.errors.len();

        log_info!(
            log_ctx,
            "BATCH_COMPLETE",
            received = response.received_count,
            saved = response.saved_count,
            failed = response.failed_count
        );
        Ok(response)
    }

    /// Accept a single streamed event. Any failure is returned as an error
    /// so the agent can react to its status code.
    pub async fn submit_event(
        &self,
        credential: AgentCredential<'_>,
        agent_id: &str,
        raw: &Value,
    ) -> Result<EventReceipt> {
        let ctx = self.authenticate(credential, agent_id)?;
        let _permit = self
            .limiter
            .try_acquire(&ctx.agent_id, 1, self.in_flight_cap(&ctx))?;
        self.process_event(&ctx, raw).await.map_err(|(_, err)| err)
    }

    async fn process_event(
        &self,
        batch: &BatchContext,
        raw: &Value,
    ) -> std::result::Result<EventReceipt, (Option<String>, Error)> {
        let mut event = parse_envelope(raw, batch).map_err(|err| {
            log_warn!(batch.log_context(), "EVENT_REJECTED", reason = err.to_string());
            (None, err)
        })?;
        let ctx = batch.event_context(&event.id);
        let event_id = event.id.clone();

        let outcome = check_skew(
            &mut event,
            self.clock.now(),
            self.config.clamp_skew_secs,
            self.config.max_skew_secs,
        )
        .map_err(|err| {
            log_warn!(ctx, "EVENT_SKEW_REJECTED", reason = err.to_string());
            (Some(event_id.clone()), err)
        })?;
        if let SkewOutcome::Clamped { skew_secs } = outcome {
            log_info!(ctx, "TIMESTAMP_CLAMPED", skew_secs = skew_secs);
        }

        let method = if batch.config.encrypt_at_rest {
            Some(AnonymizationMethod::Pseudonymize)
        } else {
            self.config.redaction_policy.method()
        };
        self.redact(&mut event, method, &ctx)
            .map_err(|err| (Some(event_id.clone()), err))?;

        let routing_key = determine_routing(&event, &ctx).to_string();
        let confirm = self
            .publisher
            .publish_event(&event)
            .await
            .map_err(|err| {
                log_warn!(ctx, "EVENT_PUBLISH_FAILED", error = err.to_string());
                (Some(event_id.clone()), err)
            })?;
        if !confirm.is_routed() {
            log_warn!(ctx, "EVENT_UNROUTED", routing_key = routing_key);
            return Err((
                Some(event_id),
                Error::FailedPrecondition(format!("no queue bound for {}", routing_key)),
            ));
        }

        log_debug!(ctx, "EVENT_ACCEPTED", routing_key = routing_key);
        Ok(EventReceipt {
            event_id,
            routing_key,
            clamped: matches!(outcome, SkewOutcome::Clamped { .. }),
        })
    }

    /// Scan the message and metadata strings, record occurrences and apply
    /// `method` to every span.
    fn redact(
        &self,
        event: &mut EventEnvelope,
        method: Option<AnonymizationMethod>,
        ctx: &LogContext,
    ) -> Result<()> {
        let mut found: Vec<PiiMatch> = Vec::new();

        let detection = pii::detect(&event.message);
        if detection.has_pii() {
            let salt = self.anonymizer.salt();
            for m in &detection.matches {
                event.pii.push(occurrence("message", m, method.is_some(), salt));
            }
            if let Some(method) = method {
                event.message = self.anonymizer.anonymize(&event.message, method)?.text;
            }
            found.extend(detection.matches);
        }

        for (key, value) in event.metadata.iter_mut() {
            let path = format!("metadata.{}", key);
            self.redact_value(value, &path, method, &mut event.pii, &mut found)?;
        }

        if !found.is_empty() {
            let risk = pii::risk_level(&found);
            event.pii_risk = Some(risk);
            log_info!(
                ctx,
                "PII_DETECTED",
                matches = found.len(),
                risk = risk.as_str(),
                redaction = method.map(|m| format!("{:?}", m)).unwrap_or_else(|| "none".into())
            );
        }
        Ok(())
    }

    fn redact_value(
        &self,
        value: &mut Value,
        path: &str,
        method: Option<AnonymizationMethod>,
        occurrences: &mut Vec<pii::PiiOccurrence>,
        found: &mut Vec<PiiMatch>,
    ) -> Result<()> {
        match value {
            Value::String(text) => {
                let detection = pii::detect(text);
                if !detection.has_pii() {
                    return Ok(());
                }
                let salt = self.anonymizer.salt();
                for m in &detection.matches {
                    occurrences.push(occurrence(path, m, method.is_some(), salt));
                }
                if let Some(method) = method {
                    *text = self.anonymizer.anonymize(text, method)?.text;
                }
                found.extend(detection.matches);
            }
            Value::Array(items) => {
                for (i, item) in items.iter_mut().enumerate() {
                    self.redact_value(item, &format!("{}.{}", path, i), method, occurrences, found)?;
                }
            }
            Value::Object(map) => {
                for (key, item) in map.iter_mut() {
                    self.redact_value(item, &format!("{}.{}", path, key), method, occurrences, found)?;
                }
            }
            _ => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{BrokerAdapter, MemoryBroker};
    use crate::clock::ManualClock;
    use crate::compliance::anonymizer::RedactionPolicy;
    use crate::compliance::pii::RiskLevel;
    use crate::config::{BrokerConfig, CredentialConfig, RegistryConfig};
    use crate::credentials::CredentialStore;
    use crate::events::AgentMode;
    use crate::registry::{Registration, RegistrationRequest};
    use chrono::{Duration as ChronoDuration, Utc};
    use serde_json::json;

    struct Harness {
        clock: Arc<ManualClock>,
        broker: Arc<MemoryBroker>,
        adapter: BrokerAdapter,
        registry: Arc<AgentRegistry>,
        gateway: IngestGateway,
    }

    async fn harness(config: IngestConfig) -> Harness {
        let clock = ManualClock::shared(Utc::now());
        let credentials =
            Arc::new(CredentialStore::new(CredentialConfig::default(), clock.clone()).unwrap());
        let registry = Arc::new(AgentRegistry::new(
            RegistryConfig::default(),
            credentials,
            clock.clone(),
        ));
        let broker = Arc::new(MemoryBroker::new());
        let adapter = BrokerAdapter::new(broker.clone(), BrokerConfig::default());
        adapter.connect().await.unwrap();
        let gateway = IngestGateway::new(
            registry.clone(),
            Arc::new(adapter.clone()),
            Arc::new(Anonymizer::ephemeral("test-salt")),
            config,
            clock.clone(),
        );
        Harness {
            clock,
            broker,
            adapter,
            registry,
            gateway,
        }
    }

    fn internal(h: &Harness) -> (Registration, String) {
        let reg = h
            .registry
            .register(RegistrationRequest::new(AgentMode::Internal, "db-1", "10.1.0.2"))
            .unwrap();
        let key = reg.api_key().unwrap().to_string();
        (reg, key)
    }

    fn system_event(h: &Harness, message: &str) -> Value {
        json!({
            "event_type": "system_event",
            "timestamp": h.clock.now().to_rfc3339(),
            "kind": "healthy",
            "message": message
        })
    }

    #[tokio::test]
    async fn test_batch_counts_and_publish() {
        let h = harness(IngestConfig::default()).await;
        let (reg, key) = internal(&h);
        let batch = EventBatch {
            agent_id: reg.agent_id.clone(),
            events: vec![
                system_event(&h, "ok 1"),
                json!({"event_type": "bogus", "timestamp": h.clock.now().to_rfc3339()}),
                system_event(&h, "ok 2"),
            ],
        };
        let response = h
            .gateway
            .submit_batch(AgentCredential::ApiKey(&key), &batch, &CancelToken::new())
            .await
            .unwrap();
        assert_eq!(response.received_count, 3);
        assert_eq!(response.saved_count, 2);
        assert_eq!(response.failed_count, 1);
        assert_eq!(response.errors[0].index, 1);
        assert_eq!(response.errors[0].kind, "invalid_argument");
        assert!(!response.has_retryable_failures());
        assert_eq!(h.broker.published_with_key("system.healthy").len(), 2);
        assert_eq!(h.gateway.in_flight(&reg.agent_id), 0);
        h.adapter.close().await;
    }

    #[tokio::test]
    async fn test_batch_size_boundary() {
        let h = harness(IngestConfig::default()).await;
        let (reg, key) = internal(&h);
        let event = system_event(&h, "tick");

        let ok = EventBatch {
            agent_id: reg.agent_id.clone(),
            events: vec![event.clone(); 1000],
        };
        let response = h
            .gateway
            .submit_batch(AgentCredential::ApiKey(&key), &ok, &CancelToken::new())
            .await
            .unwrap();
        assert_eq!(response.saved_count, 1000);

        let too_many = EventBatch {
            agent_id: reg.agent_id.clone(),
            events: vec![event; 1001],
        };
        let err = h
            .gateway
            .submit_batch(AgentCredential::ApiKey(&key), &too_many, &CancelToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
        h.adapter.close().await;
    }

    #[tokio::test]
    async fn test_bad_credential_and_foreign_batch() {
        let h = harness(IngestConfig::default()).await;
        let (reg, key) = internal(&h);
        let batch = EventBatch {
            agent_id: reg.agent_id.clone(),
            events: vec![],
        };
        let err = h
            .gateway
            .submit_batch(AgentCredential::ApiKey("deadbeef"), &batch, &CancelToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 401);

        let foreign = EventBatch {
            agent_id: "agent-int-someone-else".into(),
            events: vec![],
        };
        let err = h
            .gateway
            .submit_batch(AgentCredential::ApiKey(&key), &foreign, &CancelToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Unauthorized(_)));
        h.adapter.close().await;
    }

    #[tokio::test]
    async fn test_backpressure_returns_retry_after() {
        let config = IngestConfig {
            max_in_flight: 4,
            min_in_flight: 1,
            ..IngestConfig::default()
        };
        let h = harness(config).await;
        let (reg, key) = internal(&h);
        let batch = EventBatch {
            agent_id: reg.agent_id.clone(),
            events: vec![system_event(&h, "x"); 5],
        };
        let err = h
            .gateway
            .submit_batch(AgentCredential::ApiKey(&key), &batch, &CancelToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 429);
        assert_eq!(err.retry_after(), Some(Duration::from_secs(5)));
        h.adapter.close().await;
    }

    #[tokio::test]
    async fn test_broker_outage_is_retryable() {
        let h = harness(IngestConfig::default()).await;
        let (reg, key) = internal(&h);
        h.broker.set_available(false);
        h.broker.drop_connection();

        let err = h
            .gateway
            .submit_event(AgentCredential::ApiKey(&key), &reg.agent_id, &system_event(&h, "x"))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(err.status_code(), 503);
        h.adapter.close().await;
    }

    #[tokio::test]
    async fn test_pii_masked_for_internal_agents() {
        let h = harness(IngestConfig::default()).await;
        let (reg, key) = internal(&h);
        let mut raw = system_event(&h, "login by john.doe@example.com");
        raw["metadata"] = json!({"card": "4111-1111-1111-1111", "nested": {"ip": "10.20.30.40"}});

        h.gateway
            .submit_event(AgentCredential::ApiKey(&key), &reg.agent_id, &raw)
            .await
            .unwrap();
        let published = h.broker.peek("system_events");
        let event: EventEnvelope = serde_json::from_slice(&published[0].body).unwrap();
        assert_eq!(event.message, "login by j***@e*****.com");
        assert_eq!(event.metadata["card"], json!("**** **** **** 1111"));
        assert_eq!(event.metadata["nested"]["ip"], json!("10.20.*.*"));
        assert_eq!(event.pii_risk, Some(RiskLevel::Critical));
        assert_eq!(event.pii.len(), 3);
        assert!(event.pii.iter().all(|o| o.redacted));
        assert!(event.pii.iter().any(|o| o.field == "metadata.nested.ip"));
        h.adapter.close().await;
    }

    #[tokio::test]
    async fn test_encrypt_at_rest_pseudonymises() {
        let h = harness(IngestConfig {
            redaction_policy: RedactionPolicy::None,
            ..IngestConfig::default()
        })
        .await;
        let (reg, key) = internal(&h);
        let mut config = (*h.registry.get(&reg.agent_id).unwrap().config).clone();
        config.encrypt_at_rest = true;
        h.registry.update_config(&reg.agent_id, config).unwrap();

        h.gateway
            .submit_event(
                AgentCredential::ApiKey(&key),
                &reg.agent_id,
                &system_event(&h, "user alice@example.com"),
            )
            .await
            .unwrap();
        let published = h.broker.peek("system_events");
        let event: EventEnvelope = serde_json::from_slice(&published[0].body).unwrap();
        assert!(event.message.starts_with("user TOKEN_"));
        h.adapter.close().await;
    }

    #[tokio::test]
    async fn test_skew_clamped_and_rejected() {
        let h = harness(IngestConfig::default()).await;
        let (reg, key) = internal(&h);
        let now = h.clock.now();

        let mut raw = system_event(&h, "late");
        raw["timestamp"] = json!((now - ChronoDuration::seconds(300)).to_rfc3339());
        let receipt = h
            .gateway
            .submit_event(AgentCredential::ApiKey(&key), &reg.agent_id, &raw)
            .await
            .unwrap();
        assert!(receipt.clamped);

        raw["timestamp"] = json!((now - ChronoDuration::seconds(3601)).to_rfc3339());
        let err = h
            .gateway
            .submit_event(AgentCredential::ApiKey(&key), &reg.agent_id, &raw)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
        h.adapter.close().await;
    }
}
