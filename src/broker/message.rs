//! Messages crossing the broker seam.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::Result;
use crate::events::{EventEnvelope, Severity};

pub const CONTENT_TYPE_JSON: &str = "application/json";

#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub routing_key: String,
    pub body: Vec<u8>,
    pub headers: BTreeMap<String, String>,
    pub priority: u8,
    pub persistent: bool,
    pub content_type: String,
    pub timestamp: DateTime<Utc>,
}

impl OutboundMessage {
    pub fn json(routing_key: &str, body: Vec<u8>, timestamp: DateTime<Utc>) -> Self {
        Self {
            routing_key: routing_key.to_string(),
            body,
            headers: BTreeMap::new(),
            priority: 0,
            persistent: true,
            content_type: CONTENT_TYPE_JSON.to_string(),
            timestamp,
        }
    }

    pub fn with_header(mut self, key: &str, value: &str) -> Self {
        self.headers.insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }
}

/// Message priority for an event's severity.
pub fn priority_for(severity: Severity) -> u8 {
    match severity {
        Severity::Critical => 9,
        Severity::High => 7,
        Severity::Medium => 5,
        Severity::Low => 1,
    }
}

/// A message handed to a consumer, pending ack or nack.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub tag: u64,
    pub queue: String,
    pub routing_key: String,
    pub body: Vec<u8>,
    pub headers: BTreeMap<String, String>,
    pub redelivered: bool,
    /// Times this message has been handed out, this delivery included.
    pub delivery_count: u32,
}

impl Delivery {
    pub fn decode_event(&self) -> Result<EventEnvelope> {
        Ok(serde_json::from_slice(&self.body)?)
    }
}

/// Broker acknowledgement of a publish.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PublishConfirm {
    pub sequence: u64,
    pub routed_queues: Vec<String>,
}

impl PublishConfirm {
    pub fn is_routed(&self) -> bool {
        !self.routed_queues.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connected,
    Reconnecting,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BrokerHealth {
    pub state: ConnectionState,
    pub transport_open: bool,
    pub published: u64,
    pub publish_failures: u64,
    pub reconnects: u64,
    pub subscriptions: usize,
}

impl BrokerHealth {
    pub fn is_healthy(&self) -> bool {
        self.state == ConnectionState::Connected && self.transport_open
    }
}
