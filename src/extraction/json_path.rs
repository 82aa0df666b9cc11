//! JSON path resolution.
//!
//! Resolves dot-notation paths like "evidence.packets_per_second" against
//! raw agent documents and against the flattened view of an accepted event
//! that rule conditions are evaluated over.

use serde_json::{Map, Value};

use crate::events::{EventEnvelope, EventPayload};

/// Resolve a dot-notation path to a value in JSON.
///
/// # Examples
/// ```
/// use pandora_core::extraction::resolve_json_path;
/// use serde_json::json;
///
/// let data = json!({"evidence": {"packets_per_second": 12000}});
/// let value = resolve_json_path(&data, "evidence.packets_per_second");
/// assert_eq!(value, Some(&json!(12000)));
/// ```
pub fn resolve_json_path<'a>(data: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return Some(data);
    }

    let mut current = data;
    for part in path.split('.') {
        match current {
            Value::Object(obj) => {
                current = obj.get(part)?;
            }
            Value::Array(arr) => {
                let index: usize = part.parse().ok()?;
                current = arr.get(index)?;
            }
            _ => return None,
        }
    }
    Some(current)
}

/// Flattened view of an event for condition evaluation.
///
/// Envelope fields sit at the top level next to the payload's own fields
/// (`threat_level`, `source_ip`, `kind`...). `evidence` and `metadata`
/// stay nested.
pub fn event_view(event: &EventEnvelope) -> Value {
    let mut view = Map::new();
    view.insert("id".into(), Value::String(event.id.clone()));
    view.insert("timestamp".into(), Value::String(event.timestamp.to_rfc3339()));
    view.insert("agent_id".into(), Value::String(event.agent_id.clone()));
    view.insert("agent_mode".into(), Value::String(event.agent_mode.as_str().into()));
    view.insert("event_type".into(), Value::String(event.event_type.as_str().into()));
    view.insert("severity".into(), Value::String(event.severity.as_str().into()));
    view.insert("source".into(), Value::String(event.source.clone()));
    view.insert("level".into(), Value::String(event.level.clone()));
    view.insert("message".into(), Value::String(event.message.clone()));

    let payload = match &event.payload {
        EventPayload::Threat(details) => serde_json::to_value(details),
        EventPayload::Network(details) => serde_json::to_value(details),
        EventPayload::System(details) => serde_json::to_value(details),
        EventPayload::Device(details) => serde_json::to_value(details),
        EventPayload::WindowsLog(details) => serde_json::to_value(details),
        EventPayload::ComplianceScan(details) => serde_json::to_value(details),
    };
    if let Ok(Value::Object(fields)) = payload {
        for (key, value) in fields {
            view.entry(key).or_insert(value);
        }
    }
    view.insert("metadata".into(), Value::Object(event.metadata.clone()));
    Value::Object(view)
}

/// String field of a JSON object, if present and a string.
pub fn str_field<'a>(obj: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    obj.get(key).and_then(Value::as_str)
}

/// Convert a JSON value to a string representation for database storage.
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Null => String::new(),
        _ => value.to_string(), // Arrays and objects as JSON strings
    }
}

/// Convert a JSON value to a float if possible.
pub fn value_to_float(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

/// Convert a JSON value to an integer if possible.
pub fn value_to_int(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{AgentMode, ThreatAction, ThreatDetails};
    use chrono::Utc;
    use serde_json::json;

    #[test]
    fn test_nested_path() {
        let data = json!({
            "evidence": {
                "packets_per_second": 12000,
                "window": "10s"
            }
        });
        assert_eq!(
            resolve_json_path(&data, "evidence.packets_per_second"),
            Some(&json!(12000))
        );
    }

    #[test]
    fn test_array_index() {
        let data = json!({
            "events": [
                {"event_type": "threat_event"},
                {"event_type": "network_event"}
            ]
        });
        assert_eq!(
            resolve_json_path(&data, "events.1.event_type"),
            Some(&json!("network_event"))
        );
    }

    #[test]
    fn test_missing_path() {
        let data = json!({"name": "test"});
        assert_eq!(resolve_json_path(&data, "missing"), None);
        assert_eq!(resolve_json_path(&data, "name.nested"), None);
        assert_eq!(resolve_json_path(&data, ""), Some(&data));
    }

    #[test]
    fn test_event_view_flattens_payload() {
        let mut evidence = Map::new();
        evidence.insert("packets_per_second".into(), json!(12000));
        let mut event = EventEnvelope::new_threat(
            "agent-ext-0123456789ab",
            AgentMode::External,
            Utc::now(),
            ThreatDetails {
                threat_type: "ddos".into(),
                threat_level: 8,
                source_ip: "192.168.1.100".into(),
                target_ip: None,
                target_port: Some(443),
                action: ThreatAction::Detected,
                evidence,
            },
        );
        event.metadata.insert("site".into(), json!("dc-2"));

        let view = event_view(&event);
        assert_eq!(resolve_json_path(&view, "threat_level"), Some(&json!(8)));
        assert_eq!(resolve_json_path(&view, "severity"), Some(&json!("high")));
        assert_eq!(
            resolve_json_path(&view, "evidence.packets_per_second"),
            Some(&json!(12000))
        );
        assert_eq!(resolve_json_path(&view, "metadata.site"), Some(&json!("dc-2")));
        assert_eq!(resolve_json_path(&view, "action"), Some(&json!("detected")));
    }

    #[test]
    fn test_value_conversions() {
        assert_eq!(value_to_float(&json!(1.5)), Some(1.5));
        assert_eq!(value_to_float(&json!("2.5")), Some(2.5));
        assert_eq!(value_to_int(&json!(42)), Some(42));
        assert_eq!(value_to_int(&json!("17")), Some(17));
        assert_eq!(value_to_string(&json!(null)), "");
    }
}
