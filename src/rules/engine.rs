//! Rule engine.
//!
//! Picks at most one rule per threat event and hands its actions to the
//! response executor. The rule set is an immutable snapshot swapped under
//! a write lock; evaluations keep the snapshot they started with.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::error::{Error, Result};
use crate::events::EventEnvelope;
use crate::extraction::event_view;
use crate::logging::structured::LogContext;
use crate::resilience::CancelToken;
use crate::response::{ResponseExecutor, ResponseResult};
use crate::{log_debug, log_info, log_warn};

use super::model::{default_rules, Rule};

/// Highest-priority enabled rule whose filters and conditions all hold.
/// Ties go to the lowest id.
pub fn select_rule<'a>(rules: &'a [Rule], event: &EventEnvelope) -> Option<&'a Rule> {
    if event.threat().is_none() {
        return None;
    }
    let view = event_view(event);
    rules
        .iter()
        .filter(|rule| rule.enabled && rule.applies_to(event) && rule.conditions_hold(&view))
        .max_by(|a, b| a.priority.cmp(&b.priority).then_with(|| b.id.cmp(&a.id)))
}

fn check_unique(rules: &[Rule]) -> Result<()> {
    let mut seen = HashSet::new();
    for rule in rules {
        rule.validate()?;
        if !seen.insert(rule.id.as_str()) {
            return Err(Error::Conflict(format!("duplicate rule id {}", rule.id)));
        }
    }
    Ok(())
}

pub struct RuleEngine {
    rules: RwLock<Arc<Vec<Rule>>>,
    executor: Arc<ResponseExecutor>,
    response_log: Mutex<VecDeque<ResponseResult>>,
    log_capacity: usize,
}

impl RuleEngine {
    pub fn new(rules: Vec<Rule>, executor: Arc<ResponseExecutor>, log_capacity: usize) -> Result<Self> {
        check_unique(&rules)?;
        log_info!(LogContext::for_task("rule_engine"), "RULES_LOADED", count = rules.len());
        Ok(Self {
            rules: RwLock::new(Arc::new(rules)),
            executor,
            response_log: Mutex::new(VecDeque::new()),
            log_capacity: log_capacity.max(1),
        })
    }

    pub fn with_default_rules(executor: Arc<ResponseExecutor>, log_capacity: usize) -> Result<Self> {
        Self::new(default_rules(), executor, log_capacity)
    }

    /// Current rule set.
    pub fn rules(&self) -> Arc<Vec<Rule>> {
        self.rules.read().clone()
    }

    pub fn select(&self, event: &EventEnvelope) -> Option<Rule> {
        let snapshot = self.rules();
        select_rule(&snapshot, event).cloned()
    }

    /// Evaluate one event and run the winning rule's actions.
    ///
    /// Returns `None` when the event is not a threat or no rule matches.
    pub async fn process(&self, event: &EventEnvelope, cancel: &CancelToken) -> Option<ResponseResult> {
        let ctx = LogContext::for_agent(&event.agent_id).with_event(&event.id);
        let snapshot = self.rules();
        let Some(rule) = select_rule(&snapshot, event) else {
            log_debug!(ctx, "NO_RULE_MATCHED");
            return None;
        };
        log_info!(ctx, "RULE_SELECTED", rule_id = rule.id, priority = rule.priority);

        let result = self
            .executor
            .execute(Some(&rule.id), &rule.actions, event, cancel)
            .await;
        if result.success {
            log_info!(
                ctx,
                "RESPONSE_COMPLETE",
                rule_id = rule.id,
                executed = result.executed,
                duration_ms = result.duration.as_millis()
            );
        } else {
            log_warn!(
                ctx,
                "RESPONSE_PARTIAL",
                rule_id = rule.id,
                executed = result.executed,
                errors = result.errors
            );
        }
        self.record(result.clone());
        Some(result)
    }

    fn record(&self, result: ResponseResult) {
        let mut log = self.response_log.lock();
        if log.len() >= self.log_capacity {
            log.pop_front();
        }
        log.push_back(result);
    }

    /// Retained responses, oldest first.
    pub fn response_log(&self) -> Vec<ResponseResult> {
        self.response_log.lock().iter().cloned().collect()
    }

    pub fn add_rule(&self, rule: Rule) -> Result<()> {
        rule.validate()?;
        let mut guard = self.rules.write();
        if guard.iter().any(|existing| existing.id == rule.id) {
            return Err(Error::Conflict(format!("rule {} already exists", rule.id)));
        }
        let mut next = guard.as_ref().clone();
        log_info!(LogContext::for_task("rule_engine"), "RULE_ADDED", rule_id = rule.id);
        next.push(rule);
        *guard = Arc::new(next);
        Ok(())
    }

    pub fn remove_rule(&self, rule_id: &str) -> Result<Rule> {
        let mut guard = self.rules.write();
        let position = guard
            .iter()
            .position(|rule| rule.id == rule_id)
            .ok_or_else(|| Error::NotFound(format!("rule {}", rule_id)))?;
        let mut next = guard.as_ref().clone();
        let removed = next.remove(position);
        *guard = Arc::new(next);
        log_info!(LogContext::for_task("rule_engine"), "RULE_REMOVED", rule_id = rule_id);
        Ok(removed)
    }

    pub fn set_enabled(&self, rule_id: &str, enabled: bool) -> Result<()> {
        let mut guard = self.rules.write();
        let mut next = guard.as_ref().clone();
        let rule = next
            .iter_mut()
            .find(|rule| rule.id == rule_id)
            .ok_or_else(|| Error::NotFound(format!("rule {}", rule_id)))?;
        rule.enabled = enabled;
        *guard = Arc::new(next);
        log_info!(
            LogContext::for_task("rule_engine"),
            "RULE_TOGGLED",
            rule_id = rule_id,
            enabled = enabled
        );
        Ok(())
    }

    /// Replace the whole rule set.
    pub fn reload(&self, rules: Vec<Rule>) -> Result<()> {
        check_unique(&rules)?;
        let count = rules.len();
        let next = Arc::new(rules);
        *self.rules.write() = next;
        log_info!(LogContext::for_task("rule_engine"), "RULES_RELOADED", count = count);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::ResponseConfig;
    use crate::events::{AgentMode, EventPayload, EventType, Severity, SystemDetails, SystemKind};
    use crate::events::{ThreatAction, ThreatDetails};
    use crate::response::{Effectors, FirewallAdapter, InMemoryFirewall, RecordingEffectors};
    use crate::rules::{Action, ActionKind, Condition, Operator};
    use chrono::Utc;
    use proptest::prelude::*;
    use serde_json::{json, Map};

    fn threat(threat_type: &str, level: u8) -> EventEnvelope {
        EventEnvelope::new_threat(
            "agent-ext-0123456789ab",
            AgentMode::External,
            Utc::now(),
            ThreatDetails {
                threat_type: threat_type.into(),
                threat_level: level,
                source_ip: "192.168.1.100".into(),
                target_ip: None,
                target_port: None,
                action: ThreatAction::Detected,
                evidence: Map::new(),
            },
        )
    }

    fn rule(id: &str, threat_type: &str, priority: i32) -> Rule {
        Rule {
            id: id.into(),
            name: id.into(),
            threat_type: threat_type.into(),
            severity: None,
            conditions: Vec::new(),
            actions: vec![Action::new(ActionKind::NotifySoc)],
            priority,
            enabled: true,
        }
    }

    fn engine(rules: Vec<Rule>) -> (RuleEngine, Arc<InMemoryFirewall>) {
        let clock = ManualClock::shared(Utc::now());
        let firewall = Arc::new(InMemoryFirewall::new(clock.clone()));
        let recorder = Arc::new(RecordingEffectors::new());
        let effectors = Effectors::new(
            firewall.clone(),
            recorder.clone(),
            recorder.clone(),
            recorder.clone(),
            recorder,
        );
        let executor = Arc::new(ResponseExecutor::new(
            effectors,
            ResponseConfig::default(),
            clock,
        ));
        (RuleEngine::new(rules, executor, 2).unwrap(), firewall)
    }

    #[test]
    fn test_ddos_selects_mitigation_rule() {
        let rules = default_rules();
        let selected = select_rule(&rules, &threat("ddos", 8)).unwrap();
        assert_eq!(selected.id, "RULE-003");
        // Level 5 is medium severity; RULE-003 wants high.
        assert!(select_rule(&rules, &threat("ddos", 5)).is_none());
        assert_eq!(select_rule(&rules, &threat("malware", 9)).unwrap().id, "RULE-001");
    }

    #[test]
    fn test_priority_then_lowest_id() {
        let rules = vec![rule("R-9", "", 10), rule("R-2", "scan", 50), rule("R-1", "", 50)];
        assert_eq!(select_rule(&rules, &threat("scan", 3)).unwrap().id, "R-1");
        assert_eq!(select_rule(&rules, &threat("other", 3)).unwrap().id, "R-1");
    }

    #[test]
    fn test_conditions_and_disabled_rules() {
        let mut strict = rule("R-1", "ddos", 100);
        strict.conditions = vec![Condition::new(
            "evidence.pps",
            Operator::GreaterThan,
            json!(10_000),
        )];
        let mut disabled = rule("R-0", "ddos", 200);
        disabled.enabled = false;
        let fallback = rule("R-2", "ddos", 1);
        let rules = vec![strict, disabled, fallback];

        let mut event = threat("ddos", 8);
        assert_eq!(select_rule(&rules, &event).unwrap().id, "R-2");
        if let EventPayload::Threat(details) = &mut event.payload {
            details.evidence.insert("pps".into(), json!(12_000));
        }
        assert_eq!(select_rule(&rules, &event).unwrap().id, "R-1");
    }

    #[test]
    fn test_non_threat_events_never_match() {
        let rules = vec![rule("R-1", "", 1)];
        let event = EventEnvelope::new(
            "agent-int-0123456789ab",
            AgentMode::Internal,
            Utc::now(),
            EventType::SystemEvent,
            "error",
            "disk full",
            EventPayload::System(SystemDetails {
                kind: SystemKind::Error,
                component: None,
            }),
        );
        assert!(select_rule(&rules, &event).is_none());
    }

    #[tokio::test]
    async fn test_process_records_bounded_response_log() {
        let (engine, firewall) = engine(default_rules());
        let cancel = CancelToken::new();
        for _ in 0..3 {
            let result = engine.process(&threat("ddos", 8), &cancel).await.unwrap();
            assert!(result.success, "{:?}", result.errors);
            assert_eq!(result.rule_id.as_deref(), Some("RULE-003"));
        }
        assert!(engine.process(&threat("phishing", 2), &cancel).await.is_none());
        assert_eq!(engine.response_log().len(), 2);
        assert_eq!(firewall.get_block_list().await.unwrap().len(), 1);
    }

    #[test]
    fn test_rule_set_mutations() {
        let (engine, _) = engine(default_rules());
        let before = engine.rules();

        assert!(matches!(
            engine.add_rule(rule("RULE-001", "", 1)),
            Err(Error::Conflict(_))
        ));
        engine.add_rule(rule("RULE-010", "scan", 5)).unwrap();
        engine.set_enabled("RULE-003", false).unwrap();
        assert!(engine.select(&threat("ddos", 8)).is_none());
        assert_eq!(engine.remove_rule("RULE-010").unwrap().id, "RULE-010");
        assert!(matches!(engine.remove_rule("RULE-010"), Err(Error::NotFound(_))));

        // Snapshots taken earlier are unaffected.
        assert_eq!(before.len(), 3);
        assert!(before.iter().all(|r| r.enabled));

        assert!(matches!(
            engine.reload(vec![rule("A", "", 1), rule("A", "", 2)]),
            Err(Error::Conflict(_))
        ));
        engine.reload(vec![rule("A", "", 1)]).unwrap();
        assert_eq!(engine.rules().len(), 1);
    }

    fn arb_rule() -> impl Strategy<Value = Rule> {
        (
            0u8..6,
            prop::sample::select(vec!["", "ddos", "scan"]),
            prop::option::of(prop::sample::select(vec![
                Severity::Low,
                Severity::Medium,
                Severity::High,
                Severity::Critical,
            ])),
            0i32..4,
            any::<bool>(),
            prop::option::of(0u8..12),
        )
            .prop_map(|(id, threat_type, severity, priority, enabled, min_level)| Rule {
                id: format!("R-{}", id),
                name: String::new(),
                threat_type: threat_type.to_string(),
                severity,
                conditions: min_level
                    .map(|level| {
                        vec![Condition::new("threat_level", Operator::GreaterOrEqual, json!(level))]
                    })
                    .unwrap_or_default(),
                actions: vec![Action::new(ActionKind::NotifySoc)],
                priority,
                enabled,
            })
    }

    proptest! {
        #[test]
        fn test_selection_is_argmax(
            rules in prop::collection::vec(arb_rule(), 0..8),
            threat_type in prop::sample::select(vec!["ddos", "scan", "malware"]),
            level in 1u8..=10,
        ) {
            let event = threat(threat_type, level);
            let eligible: Vec<&Rule> = rules
                .iter()
                .filter(|r| {
                    r.enabled
                        && (r.threat_type.is_empty() || r.threat_type == threat_type)
                        && r.severity.map_or(true, |s| s == Severity::from_threat_level(level))
                        && r.conditions.iter().all(|c| c.value.as_u64().map_or(true, |min| level as u64 >= min))
                })
                .collect();
            let best_priority = eligible.iter().map(|r| r.priority).max();
            let expected = best_priority.and_then(|p| {
                eligible.iter().filter(|r| r.priority == p).map(|r| r.id.clone()).min()
            });
            let selected = select_rule(&rules, &event).map(|r| r.id.clone());
            prop_assert_eq!(selected, expected);
        }
    }
}
