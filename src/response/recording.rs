//! Recording effectors for hosts, endpoints, notifications and tickets.
//!
//! Used in place of real integrations in tests and dry deployments; every
//! call is kept so callers can assert on what a response did.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use anyhow::bail;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{Map, Value};

use super::effectors::{EndpointAdapter, HostAdapter, NotificationAdapter, TicketingAdapter};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EffectorCall {
    pub operation: String,
    pub target: String,
    pub detail: Value,
}

#[derive(Default)]
pub struct RecordingEffectors {
    calls: Mutex<Vec<EffectorCall>>,
    failing: AtomicBool,
    incidents: AtomicU64,
}

impl RecordingEffectors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<EffectorCall> {
        self.calls.lock().clone()
    }

    pub fn calls_for(&self, operation: &str) -> Vec<EffectorCall> {
        self.calls
            .lock()
            .iter()
            .filter(|call| call.operation == operation)
            .cloned()
            .collect()
    }

    fn record(&self, operation: &str, target: &str, detail: Value) -> anyhow::Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            bail!("{} unavailable", operation);
        }
        self.calls.lock().push(EffectorCall {
            operation: operation.to_string(),
            target: target.to_string(),
            detail,
        });
        Ok(())
    }
}

#[async_trait]
impl HostAdapter for RecordingEffectors {
    async fn isolate_host(&self, host: &str) -> anyhow::Result<()> {
        self.record("isolate_host", host, Value::Null)
    }
}

#[async_trait]
impl EndpointAdapter for RecordingEffectors {
    async fn kill_process(&self, selector: &Map<String, Value>) -> anyhow::Result<()> {
        let target = selector
            .get("pid")
            .or_else(|| selector.get("name"))
            .map(|v| v.to_string())
            .unwrap_or_default();
        self.record("kill_process", &target, Value::Object(selector.clone()))
    }

    async fn quarantine_file(&self, path: &str) -> anyhow::Result<()> {
        self.record("quarantine_file", path, Value::Null)
    }

    async fn collect_forensics(&self, context: &Map<String, Value>) -> anyhow::Result<()> {
        let target = context
            .get("event_id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        self.record("collect_forensics", &target, Value::Object(context.clone()))
    }
}

#[async_trait]
impl NotificationAdapter for RecordingEffectors {
    async fn send_notification(
        &self,
        channel: &str,
        message: &str,
        meta: &Map<String, Value>,
    ) -> anyhow::Result<()> {
        let mut detail = meta.clone();
        detail.insert("message".to_string(), Value::String(message.to_string()));
        self.record("send_notification", channel, Value::Object(detail))
    }
}

#[async_trait]
impl TicketingAdapter for RecordingEffectors {
    async fn create_incident(&self, payload: &Value) -> anyhow::Result<String> {
        let id = format!("INC-{:06}", self.incidents.fetch_add(1, Ordering::SeqCst) + 1);
        self.record("create_incident", &id, payload.clone())?;
        Ok(id)
    }
}
