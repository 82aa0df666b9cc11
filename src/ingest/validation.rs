//! Envelope schema validation.
//!
//! Turns one raw agent document into a typed [`EventEnvelope`], or says
//! exactly why it cannot. Payload fields sit at the top level of the
//! document next to the envelope fields.

use chrono::{DateTime, Duration, Utc};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::events::{
    next_event_id, ComplianceScanDetails, DeviceDetails, EventEnvelope, EventPayload, EventType,
    NetworkDetails, Severity, SystemDetails, ThreatDetails, WindowsLogDetails,
};
use crate::extraction::{str_field, value_to_int};

use super::context::BatchContext;

pub const MAX_MESSAGE_LEN: usize = 64 * 1024;

/// Timestamp adjustment applied by [`check_skew`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkewOutcome {
    Accepted,
    Clamped { skew_secs: i64 },
}

fn invalid(message: impl Into<String>) -> Error {
    Error::InvalidArgument(message.into())
}

fn payload_of<T: DeserializeOwned>(raw: &Value, event_type: EventType) -> Result<T> {
    serde_json::from_value(raw.clone())
        .map_err(|err| invalid(format!("invalid {} payload: {}", event_type, err)))
}

/// Validate a raw document sent by the batch's agent.
pub fn parse_envelope(raw: &Value, batch: &BatchContext) -> Result<EventEnvelope> {
    let obj = raw
        .as_object()
        .ok_or_else(|| invalid("event must be a JSON object"))?;

    let event_type_str =
        str_field(obj, "event_type").ok_or_else(|| invalid("missing event_type"))?;
    let event_type = EventType::parse(event_type_str)
        .ok_or_else(|| invalid(format!("unknown event_type: {}", event_type_str)))?;

    if let Some(agent_id) = str_field(obj, "agent_id") {
        if agent_id != batch.agent_id {
            return Err(Error::Unauthorized(format!(
                "event claims agent {} but was sent by {}",
                agent_id, batch.agent_id
            )));
        }
    }

    let timestamp = match obj.get("timestamp") {
        Some(Value::String(ts)) => DateTime::parse_from_rfc3339(ts)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|err| invalid(format!("timestamp is not RFC-3339: {}", err)))?,
        Some(_) => return Err(invalid("timestamp must be an RFC-3339 string")),
        None => return Err(invalid("missing timestamp")),
    };

    let payload = match event_type {
        EventType::ThreatEvent | EventType::SecurityAlert => {
            let details: ThreatDetails = payload_of(raw, event_type)?;
            if !(1..=10).contains(&details.threat_level) {
                return Err(invalid(format!(
                    "threat_level {} outside 1..=10",
                    details.threat_level
                )));
            }
            if details.source_ip.parse::<std::net::IpAddr>().is_err() {
                return Err(invalid(format!("source_ip {} is not an IP", details.source_ip)));
            }
            EventPayload::Threat(details)
        }
        EventType::NetworkEvent => {
            EventPayload::Network(payload_of::<NetworkDetails>(raw, event_type)?)
        }
        EventType::SystemEvent => {
            EventPayload::System(payload_of::<SystemDetails>(raw, event_type)?)
        }
        EventType::DeviceEvent => {
            EventPayload::Device(payload_of::<DeviceDetails>(raw, event_type)?)
        }
        EventType::WindowsEventLog => {
            let mut normalized = raw.clone();
            // Agents send the Windows event id as either a number or a string.
            if let Some(id) = obj
                .get("event_id")
                .filter(|v| v.is_string())
                .and_then(value_to_int)
            {
                normalized["event_id"] = Value::from(id);
            }
            EventPayload::WindowsLog(payload_of::<WindowsLogDetails>(&normalized, event_type)?)
        }
        EventType::ComplianceScan => {
            EventPayload::ComplianceScan(payload_of::<ComplianceScanDetails>(raw, event_type)?)
        }
    };

    let level = str_field(obj, "level").unwrap_or("info").to_ascii_lowercase();
    let message = str_field(obj, "message").unwrap_or_default();
    if message.len() > MAX_MESSAGE_LEN {
        return Err(invalid(format!(
            "message is {} bytes, limit {}",
            message.len(),
            MAX_MESSAGE_LEN
        )));
    }

    let metadata = match obj.get("metadata") {
        Some(Value::Object(map)) => map.clone(),
        Some(Value::Null) | None => Map::new(),
        Some(_) => return Err(invalid("metadata must be an object")),
    };

    let mut envelope = EventEnvelope::new(
        &batch.agent_id,
        batch.agent_mode,
        timestamp,
        event_type,
        &level,
        message,
        payload,
    );
    if let Some(id) = str_field(obj, "id").filter(|id| !id.is_empty()) {
        envelope.id = id.to_string();
    } else {
        envelope.id = next_event_id(batch.received_at);
    }
    if let Some(source) = str_field(obj, "source").filter(|s| !s.is_empty()) {
        envelope.source = source.to_string();
    }
    if envelope.threat().is_none() {
        if let Some(severity) = str_field(obj, "severity") {
            envelope.severity = Severity::parse(severity)
                .ok_or_else(|| invalid(format!("unknown severity: {}", severity)))?;
        }
    }
    if envelope.message.is_empty() {
        envelope.message = default_message(&envelope);
    }
    envelope.metadata = metadata;
    envelope.received_at = batch.received_at;
    Ok(envelope)
}

fn default_message(event: &EventEnvelope) -> String {
    match &event.payload {
        EventPayload::Threat(details) => format!(
            "{} threat from {} (level {})",
            details.threat_type, details.source_ip, details.threat_level
        ),
        _ => format!("{} from {}", event.event_type, event.agent_id),
    }
}

/// Clamp small clock skew to server time; reject large skew.
///
/// Skew of `clamp_secs` or more is clamped; skew beyond `max_secs` is
/// rejected.
pub fn check_skew(
    event: &mut EventEnvelope,
    now: DateTime<Utc>,
    clamp_secs: i64,
    max_secs: i64,
) -> Result<SkewOutcome> {
    let skew = (event.timestamp - now).abs();
    if skew > Duration::seconds(max_secs) {
        return Err(invalid(format!(
            "timestamp skew {}s exceeds {}s",
            skew.num_seconds(),
            max_secs
        )));
    }
    if skew >= Duration::seconds(clamp_secs) {
        event.timestamp = now;
        return Ok(SkewOutcome::Clamped {
            skew_secs: skew.num_seconds(),
        });
    }
    Ok(SkewOutcome::Accepted)
}
