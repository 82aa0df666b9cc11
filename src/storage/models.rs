//! Storage models.
//!
//! These models represent rows of the cold tier and the retention policy
//! table, plus the hot-tier stream entries.

use std::fmt;

use chrono::{DateTime, Datelike, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::events::{AgentMode, EventEnvelope, EventType};
use crate::hashing::compute_hash_parts;

/// Retention applied when no policy row matches.
pub const DEFAULT_RETENTION_DAYS: i64 = 90;

/// Canonical timestamp text used in hashes and stored columns.
pub fn canonical_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

/// SHA-256 over timestamp, agent id, event type and message.
pub fn integrity_hash(
    timestamp: &DateTime<Utc>,
    agent_id: &str,
    event_type: &str,
    message: &str,
) -> String {
    compute_hash_parts(&[&canonical_timestamp(timestamp), agent_id, event_type, message])
}

/// Monthly partition holding `ts`, e.g. `event_logs_2026_01`.
pub fn partition_name(ts: &DateTime<Utc>) -> String {
    format!("event_logs_{:04}_{:02}", ts.year(), ts.month())
}

/// Represents a row of `event_logs`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredLog {
    pub id: i64,
    pub source_id: String,
    pub timestamp: DateTime<Utc>,
    pub agent_id: String,
    pub agent_mode: String,
    pub event_type: String,
    pub source: String,
    pub event_id: Option<i64>,
    pub level: String,
    pub computer: Option<String>,
    pub message: String,
    pub raw_data: Value,
    pub retention_until: DateTime<Utc>,
    pub archived: bool,
    pub integrity_hash: String,
    pub partition: String,
}

impl StoredLog {
    pub fn recompute_hash(&self) -> String {
        integrity_hash(&self.timestamp, &self.agent_id, &self.event_type, &self.message)
    }

    pub fn is_intact(&self) -> bool {
        self.recompute_hash() == self.integrity_hash
    }
}

/// Filter for cold-tier queries. Results are newest first.
#[derive(Debug, Clone, Default)]
pub struct LogQuery {
    pub agent_id: Option<String>,
    pub event_type: Option<String>,
    pub level: Option<String>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub message_contains: Option<String>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl LogQuery {
    pub const DEFAULT_LIMIT: usize = 100;

    pub fn for_agent(agent_id: &str) -> Self {
        Self {
            agent_id: Some(agent_id.to_string()),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ColdStoreStats {
    pub total: u64,
    pub archived: u64,
    pub active: u64,
    pub partitions: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    pub event_type: String,
    pub agent_mode: String,
    pub retention_days: i64,
    pub legal_hold: bool,
    pub regulation: String,
    pub auto_delete: bool,
    pub archive_required: bool,
}

impl RetentionPolicy {
    pub fn new(
        event_type: &str,
        agent_mode: AgentMode,
        retention_days: i64,
        regulation: &str,
        auto_delete: bool,
        archive_required: bool,
    ) -> Self {
        Self {
            event_type: event_type.to_string(),
            agent_mode: agent_mode.as_str().to_string(),
            retention_days,
            legal_hold: false,
            regulation: regulation.to_string(),
            auto_delete,
            archive_required,
        }
    }

    /// Policies seeded into a fresh store.
    pub fn seeded() -> Vec<RetentionPolicy> {
        vec![
            RetentionPolicy::new(
                EventType::WindowsEventLog.as_str(),
                AgentMode::External,
                90,
                "PCI-DSS",
                true,
                true,
            ),
            RetentionPolicy::new(
                EventType::SecurityAlert.as_str(),
                AgentMode::External,
                365,
                "GDPR",
                true,
                true,
            ),
            RetentionPolicy::new("access_log", AgentMode::Internal, 180, "SOX", true, false),
            RetentionPolicy::new(
                EventType::ComplianceScan.as_str(),
                AgentMode::External,
                2555,
                "HIPAA",
                false,
                true,
            ),
        ]
    }

    /// Rows past retention may be deleted by the sweep.
    pub fn allows_deletion(&self) -> bool {
        self.auto_delete && !self.legal_hold
    }

    /// Rows past retention may be copied to the archive.
    pub fn allows_archive(&self) -> bool {
        !self.legal_hold || self.archive_required
    }
}

/// Hot-tier stream entry id: milliseconds plus a sequence within the
/// millisecond, ordered like Redis stream ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StreamId {
    pub millis: i64,
    pub seq: u64,
}

impl StreamId {
    pub fn parse(value: &str) -> Option<Self> {
        let (millis, seq) = value.split_once('-')?;
        Some(Self {
            millis: millis.parse().ok()?,
            seq: seq.parse().ok()?,
        })
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.millis, self.seq)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StreamEntry {
    pub key: String,
    pub id: StreamId,
    pub event: EventEnvelope,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HotStoreStats {
    pub streams: usize,
    pub entries: usize,
    pub groups: usize,
}

/// Stream key for an agent's events on the event's UTC day.
pub fn stream_key(agent_id: &str, ts: &DateTime<Utc>) -> String {
    format!("logs:agent:{}:{}", agent_id, ts.format("%Y-%m-%d"))
}
