//! GDPR erasure and portability.
//!
//! Deletion requests move `pending -> approved -> completed`, or
//! `pending -> rejected`. Every operation, successful or not, leaves an
//! entry in the audit log carrying the caller's justification.

use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::clock::Clock;
use crate::config::ComplianceConfig;
use crate::error::{Error, Result};
use crate::hashing::compute_hash;
use crate::logging::structured::LogContext;
use crate::storage::{ColdStore, StoredLog, SubjectKey};
use crate::{log_info, log_warn};

use super::audit::{AuditLog, AuditRecord};
use super::pii::occurrence_hash;

const RESOURCE_REQUEST: &str = "gdpr_deletion_request";
const RESOURCE_SUBJECT: &str = "data_subject";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeletionStatus {
    Pending,
    Approved,
    Rejected,
    Completed,
}

impl DeletionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeletionStatus::Pending => "pending",
            DeletionStatus::Approved => "approved",
            DeletionStatus::Rejected => "rejected",
            DeletionStatus::Completed => "completed",
        }
    }
}

impl fmt::Display for DeletionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GdprDeletionRequest {
    pub request_id: String,
    pub subject_identifier: String,
    pub requested_by: String,
    pub requested_at: DateTime<Utc>,
    pub status: DeletionStatus,
    pub approved_by: Option<String>,
    pub approved_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub deleted_count: usize,
    pub affected_tables: Vec<String>,
    pub verification_hash: Option<String>,
    pub notes: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeletionResult {
    pub request_id: String,
    pub deleted_count: usize,
    pub affected_tables: Vec<String>,
    pub verification_hash: String,
    pub completed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeletionVerification {
    pub request_id: String,
    pub status: DeletionStatus,
    pub deleted_count: usize,
    pub remaining_count: usize,
    pub verified: bool,
    pub verified_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DataExport {
    pub subject_id: String,
    pub record_count: usize,
    pub data: Vec<StoredLog>,
    pub exported_at: DateTime<Utc>,
    pub format: String,
    pub regulation: String,
}

/// Who is asking, and why. Copied into every audit entry.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AccessContext {
    pub user_id: String,
    pub justification: String,
    pub ip_address: Option<IpAddr>,
    pub user_agent: Option<String>,
    pub session_id: Option<String>,
}

impl AccessContext {
    pub fn new(user_id: &str, justification: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            justification: justification.to_string(),
            ..Self::default()
        }
    }
}

/// Verification hash over `(request_id, deleted_count, timestamp)`.
pub fn verification_hash(request_id: &str, deleted_count: usize, at: DateTime<Utc>) -> String {
    compute_hash(&format!("{}:{}:{}", request_id, deleted_count, at.to_rfc3339()))
}

pub struct GdprService {
    cold: Arc<dyn ColdStore>,
    audit: Arc<AuditLog>,
    clock: Arc<dyn Clock>,
    config: ComplianceConfig,
    requests: RwLock<BTreeMap<String, GdprDeletionRequest>>,
}

impl GdprService {
    pub fn new(
        cold: Arc<dyn ColdStore>,
        audit: Arc<AuditLog>,
        config: ComplianceConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            cold,
            audit,
            clock,
            config,
            requests: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn audit_log(&self) -> &Arc<AuditLog> {
        &self.audit
    }

    fn audit<T>(
        &self,
        access: &AccessContext,
        action: &str,
        resource_type: &str,
        resource_id: &str,
        approved_by: Option<&str>,
        outcome: &Result<T>,
        record_count: impl Fn(&T) -> u64,
    ) -> Result<()> {
        let (success, error, record_count) = match outcome {
            Ok(value) => (true, None, record_count(value)),
            Err(err) => (false, Some(err.to_string()), 0),
        };
        self.audit
            .append(AuditRecord {
                user_id: access.user_id.clone(),
                action: action.to_string(),
                resource_type: resource_type.to_string(),
                resource_id: Some(resource_id.to_string()),
                query_text: None,
                record_count,
                ip_address: access.ip_address,
                user_agent: access.user_agent.clone(),
                justification: access.justification.clone(),
                approved_by: approved_by.map(str::to_string),
                session_id: access.session_id.clone(),
                success,
                error,
            })
            .map(|_| ())
    }

    /// Refuse a call without justification. The refusal is audited too.
    fn require_justification(
        &self,
        access: &AccessContext,
        action: &str,
        resource_type: &str,
        resource_id: &str,
    ) -> Result<()> {
        if !access.justification.trim().is_empty() {
            return Ok(());
        }
        let refused: Result<()> = Err(Error::InvalidArgument("justification is required".into()));
        self.audit(access, action, resource_type, resource_id, None, &refused, |_| 0)?;
        log_warn!(
            LogContext::for_task("gdpr"),
            "GDPR_CALL_UNJUSTIFIED",
            action = action,
            user = access.user_id
        );
        refused
    }

    /// Rows redacted at ingest only carry the identifier's occurrence hash.
    fn subject_key(&self, subject_identifier: &str) -> SubjectKey {
        SubjectKey::new(subject_identifier)
            .with_occurrence_hash(occurrence_hash(&self.config.salt, subject_identifier))
    }

    pub fn create_request(
        &self,
        subject_identifier: &str,
        requested_by: &str,
        notes: &str,
        access: &AccessContext,
    ) -> Result<GdprDeletionRequest> {
        let request_id = uuid::Uuid::new_v4().to_string();
        self.require_justification(access, "create", RESOURCE_REQUEST, &request_id)?;
        let outcome = if subject_identifier.trim().is_empty() {
            Err(Error::InvalidArgument("subject identifier must not be empty".into()))
        } else {
            let request = GdprDeletionRequest {
                request_id: request_id.clone(),
                subject_identifier: subject_identifier.to_string(),
                requested_by: requested_by.to_string(),
                requested_at: self.clock.now(),
                status: DeletionStatus::Pending,
                approved_by: None,
                approved_at: None,
                completed_at: None,
                deleted_count: 0,
                affected_tables: Vec::new(),
                verification_hash: None,
                notes: notes.to_string(),
            };
            self.requests.write().insert(request_id.clone(), request.clone());
            Ok(request)
        };
        self.audit(access, "create", RESOURCE_REQUEST, &request_id, None, &outcome, |_| 0)?;
        if outcome.is_ok() {
            log_info!(LogContext::for_request(&request_id), "GDPR_REQUEST_CREATED");
        }
        outcome
    }

    /// Apply `change` to a request that must be in `expected` state.
    fn transition<F>(&self, request_id: &str, expected: DeletionStatus, change: F) -> Result<GdprDeletionRequest>
    where
        F: FnOnce(&mut GdprDeletionRequest),
    {
        let mut requests = self.requests.write();
        let request = requests
            .get_mut(request_id)
            .ok_or_else(|| Error::NotFound(format!("deletion request {}", request_id)))?;
        if request.status != expected {
            return Err(Error::FailedPrecondition(format!(
                "request {} is {}, expected {}",
                request_id, request.status, expected
            )));
        }
        change(request);
        Ok(request.clone())
    }

    pub fn approve(&self, request_id: &str, approver: &str, access: &AccessContext) -> Result<GdprDeletionRequest> {
        self.require_justification(access, "approve", RESOURCE_REQUEST, request_id)?;
        let now = self.clock.now();
        let outcome = self.transition(request_id, DeletionStatus::Pending, |request| {
            request.status = DeletionStatus::Approved;
            request.approved_by = Some(approver.to_string());
            request.approved_at = Some(now);
        });
        self.audit(access, "approve", RESOURCE_REQUEST, request_id, Some(approver), &outcome, |_| 0)?;
        if outcome.is_ok() {
            log_info!(LogContext::for_request(request_id), "GDPR_REQUEST_APPROVED", approver = approver);
        }
        outcome
    }

    pub fn reject(&self, request_id: &str, reviewer: &str, reason: &str, access: &AccessContext) -> Result<GdprDeletionRequest> {
        self.require_justification(access, "reject", RESOURCE_REQUEST, request_id)?;
        let outcome = self.transition(request_id, DeletionStatus::Pending, |request| {
            request.status = DeletionStatus::Rejected;
            if !reason.is_empty() {
                if !request.notes.is_empty() {
                    request.notes.push('\n');
                }
                request.notes.push_str(reason);
            }
        });
        self.audit(access, "reject", RESOURCE_REQUEST, request_id, Some(reviewer), &outcome, |_| 0)?;
        if outcome.is_ok() {
            log_info!(LogContext::for_request(request_id), "GDPR_REQUEST_REJECTED", reviewer = reviewer);
        }
        outcome
    }

    /// Erase the subject's rows. Requires an approved request; the erasure
    /// is one transaction, so a failure leaves the request approved and
    /// the rows in place.
    pub fn execute(&self, request_id: &str, access: &AccessContext) -> Result<DeletionResult> {
        self.require_justification(access, "execute", RESOURCE_REQUEST, request_id)?;
        let outcome = self.execute_inner(request_id);
        let approved_by = self.get_request(request_id).and_then(|r| r.approved_by);
        self.audit(
            access,
            "execute",
            RESOURCE_REQUEST,
            request_id,
            approved_by.as_deref(),
            &outcome,
            |result| result.deleted_count as u64,
        )?;
        let ctx = LogContext::for_request(request_id);
        match &outcome {
            Ok(result) => {
                log_info!(
                    ctx,
                    "GDPR_DELETION_COMPLETE",
                    deleted = result.deleted_count,
                    tables = result.affected_tables
                );
            }
            Err(err) => {
                log_warn!(ctx, "GDPR_DELETION_FAILED", error = err.to_string());
            }
        }
        outcome
    }

    fn execute_inner(&self, request_id: &str) -> Result<DeletionResult> {
        let request = self
            .get_request(request_id)
            .ok_or_else(|| Error::NotFound(format!("deletion request {}", request_id)))?;
        if request.status != DeletionStatus::Approved {
            return Err(Error::FailedPrecondition(format!(
                "request {} is {}, expected approved",
                request_id, request.status
            )));
        }

        let deletion = self
            .cold
            .delete_matching(
                &self.subject_key(&request.subject_identifier),
                &self.config.gdpr_extra_tables,
            )?;
        let completed_at = self.clock.now();
        let hash = verification_hash(request_id, deletion.deleted_count, completed_at);

        self.transition(request_id, DeletionStatus::Approved, |request| {
            request.status = DeletionStatus::Completed;
            request.completed_at = Some(completed_at);
            request.deleted_count = deletion.deleted_count;
            request.affected_tables = deletion.affected_tables.clone();
            request.verification_hash = Some(hash.clone());
        })?;

        Ok(DeletionResult {
            request_id: request_id.to_string(),
            deleted_count: deletion.deleted_count,
            affected_tables: deletion.affected_tables,
            verification_hash: hash,
            completed_at,
        })
    }

    /// Re-query for rows still mentioning the subject.
    pub fn verify(&self, request_id: &str, access: &AccessContext) -> Result<DeletionVerification> {
        self.require_justification(access, "verify", RESOURCE_REQUEST, request_id)?;
        let outcome = self
            .get_request(request_id)
            .ok_or_else(|| Error::NotFound(format!("deletion request {}", request_id)))
            .and_then(|request| {
                let remaining = self
                    .cold
                    .count_matching(
                        &self.subject_key(&request.subject_identifier),
                        &self.config.gdpr_extra_tables,
                    )?;
                Ok(DeletionVerification {
                    request_id: request_id.to_string(),
                    status: request.status,
                    deleted_count: request.deleted_count,
                    remaining_count: remaining,
                    verified: remaining == 0,
                    verified_at: self.clock.now(),
                })
            });
        self.audit(access, "verify", RESOURCE_REQUEST, request_id, None, &outcome, |v| {
            v.remaining_count as u64
        })?;
        if let Ok(verification) = &outcome {
            log_info!(
                LogContext::for_request(request_id),
                "GDPR_DELETION_VERIFIED",
                remaining = verification.remaining_count,
                verified = verification.verified
            );
        }
        outcome
    }

    /// The subject's rows, newest first, up to the configured cap.
    pub fn export(&self, subject_identifier: &str, access: &AccessContext) -> Result<DataExport> {
        let subject_ref = compute_hash(subject_identifier);
        self.require_justification(access, "export", RESOURCE_SUBJECT, &subject_ref)?;
        let outcome = self
            .cold
            .export_matching(&self.subject_key(subject_identifier), self.config.export_cap)
            .map(|data| DataExport {
                subject_id: subject_identifier.to_string(),
                record_count: data.len(),
                data,
                exported_at: self.clock.now(),
                format: "JSON".to_string(),
                regulation: self.config.regulation.clone(),
            });
        // The audit trail names the subject by hash only.
        self.audit(access, "export", RESOURCE_SUBJECT, &subject_ref, None, &outcome, |e| {
            e.record_count as u64
        })?;
        if let Ok(export) = &outcome {
            log_info!(
                LogContext::for_task("gdpr"),
                "GDPR_EXPORT_COMPLETE",
                subject_hash = &subject_ref[..16],
                records = export.record_count
            );
        }
        outcome
    }

    pub fn get_request(&self, request_id: &str) -> Option<GdprDeletionRequest> {
        self.requests.read().get(request_id).cloned()
    }

    /// Requests, newest first, optionally filtered by status.
    pub fn list_requests(&self, status: Option<DeletionStatus>) -> Vec<GdprDeletionRequest> {
        let mut requests: Vec<GdprDeletionRequest> = self
            .requests
            .read()
            .values()
            .filter(|request| status.map_or(true, |s| request.status == s))
            .cloned()
            .collect();
        requests.sort_by(|a, b| {
            b.requested_at
                .cmp(&a.requested_at)
                .then_with(|| a.request_id.cmp(&b.request_id))
        });
        requests
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::compliance::audit::InMemoryAuditStore;
    use crate::events::{AgentMode, EventEnvelope, EventPayload, EventType, SystemDetails, SystemKind};
    use crate::storage::SqliteColdStore;

    fn seed(cold: &SqliteColdStore, now: DateTime<Utc>, subject: &str, count: usize) {
        let events: Vec<EventEnvelope> = (0..count)
            .map(|i| {
                let mut event = EventEnvelope::new(
                    "agent-int-0123456789ab",
                    AgentMode::Internal,
                    now,
                    EventType::SystemEvent,
                    "info",
                    &format!("login {} by {}", i, subject),
                    EventPayload::System(SystemDetails {
                        kind: SystemKind::Healthy,
                        component: None,
                    }),
                );
                event.id = format!("evt_{}_{}", subject.len(), i);
                event
            })
            .collect();
        cold.insert_batch(&events).unwrap();
    }

    fn service() -> (GdprService, Arc<SqliteColdStore>, Arc<ManualClock>) {
        let clock = ManualClock::shared(Utc::now());
        let cold = Arc::new(SqliteColdStore::open_in_memory().unwrap());
        let audit = Arc::new(
            AuditLog::ephemeral(Arc::new(InMemoryAuditStore::new()), clock.clone()).unwrap(),
        );
        let service = GdprService::new(cold.clone(), audit, ComplianceConfig::default(), clock.clone());
        (service, cold, clock)
    }

    fn dpo() -> AccessContext {
        AccessContext::new("dpo@example.com", "Article 17 request #42")
    }

    #[test]
    fn test_full_workflow() {
        let (service, cold, clock) = service();
        seed(&cold, clock.now(), "alice@example.com", 4);
        seed(&cold, clock.now(), "bob@example.org", 2);

        let request = service
            .create_request("alice@example.com", "alice", "", &dpo())
            .unwrap();
        assert_eq!(request.status, DeletionStatus::Pending);
        service.approve(&request.request_id, "legal", &dpo()).unwrap();
        let result = service.execute(&request.request_id, &dpo()).unwrap();
        assert_eq!(result.deleted_count, 4);
        assert!(result.affected_tables.contains(&"event_logs".to_string()));
        assert_eq!(
            result.verification_hash,
            verification_hash(&request.request_id, 4, result.completed_at)
        );

        let verification = service.verify(&request.request_id, &dpo()).unwrap();
        assert!(verification.verified);
        assert_eq!(verification.status, DeletionStatus::Completed);
        assert_eq!(cold.stats().unwrap().total, 2);

        let actions: Vec<String> = service
            .audit_log()
            .entries_for(&request.request_id)
            .unwrap()
            .into_iter()
            .map(|e| e.record.action)
            .collect();
        assert_eq!(actions, vec!["create", "approve", "execute", "verify"]);
        assert!(service.audit_log().verify_chain().unwrap().is_intact());
    }

    #[test]
    fn test_state_machine_violations_are_audited() {
        let (service, _, _) = service();
        let request = service.create_request("carol", "carol", "", &dpo()).unwrap();

        assert!(matches!(
            service.execute(&request.request_id, &dpo()),
            Err(Error::FailedPrecondition(_))
        ));
        service.reject(&request.request_id, "legal", "identity not confirmed", &dpo()).unwrap();
        assert!(matches!(
            service.approve(&request.request_id, "legal", &dpo()),
            Err(Error::FailedPrecondition(_))
        ));
        assert!(matches!(
            service.approve("missing", "legal", &dpo()),
            Err(Error::NotFound(_))
        ));

        let entries = service.audit_log().entries_for(&request.request_id).unwrap();
        let failed: Vec<&str> = entries
            .iter()
            .filter(|e| !e.record.success)
            .map(|e| e.record.action.as_str())
            .collect();
        assert_eq!(failed, vec!["execute", "approve"]);
        assert!(entries.iter().all(|e| !e.record.justification.is_empty()));
        assert_eq!(service.list_requests(Some(DeletionStatus::Rejected)).len(), 1);
        assert!(service.list_requests(Some(DeletionStatus::Pending)).is_empty());
    }

    #[test]
    fn test_justification_required() {
        let (service, _, _) = service();
        let anonymous = AccessContext::new("someone", "  ");
        assert!(matches!(
            service.create_request("dave", "dave", "", &anonymous),
            Err(Error::InvalidArgument(_))
        ));
        assert!(service.list_requests(None).is_empty());

        let request = service.create_request("dave", "dave", "", &dpo()).unwrap();
        assert!(service.approve(&request.request_id, "legal", &anonymous).is_err());
        assert!(service.export("dave", &anonymous).is_err());
        assert_eq!(
            service.get_request(&request.request_id).unwrap().status,
            DeletionStatus::Pending
        );

        // Refusals are on the trail as failed entries by the caller.
        let entries = service.audit_log().entries().unwrap();
        let refused: Vec<&str> = entries
            .iter()
            .filter(|e| !e.record.success)
            .map(|e| e.record.action.as_str())
            .collect();
        assert_eq!(refused, vec!["create", "approve", "export"]);
        assert!(entries
            .iter()
            .filter(|e| !e.record.success)
            .all(|e| e.record.user_id == "someone"
                && e.record.error.as_deref() == Some("invalid argument: justification is required")));
        assert!(service.audit_log().verify_chain().unwrap().is_intact());
    }

    #[test]
    fn test_failed_erasure_leaves_request_approved() {
        let clock = ManualClock::shared(Utc::now());
        let cold = Arc::new(SqliteColdStore::open_in_memory().unwrap());
        seed(&cold, clock.now(), "erin@example.com", 3);
        let audit = Arc::new(
            AuditLog::ephemeral(Arc::new(InMemoryAuditStore::new()), clock.clone()).unwrap(),
        );
        let config = ComplianceConfig {
            gdpr_extra_tables: vec!["missing_table".to_string()],
            ..ComplianceConfig::default()
        };
        let service = GdprService::new(cold.clone(), audit, config, clock);

        let request = service.create_request("erin@example.com", "erin", "", &dpo()).unwrap();
        service.approve(&request.request_id, "legal", &dpo()).unwrap();
        assert!(service.execute(&request.request_id, &dpo()).is_err());
        assert_eq!(
            service.get_request(&request.request_id).unwrap().status,
            DeletionStatus::Approved
        );
        assert_eq!(cold.stats().unwrap().total, 3);
    }

    #[test]
    fn test_export_caps_rows_and_hashes_subject() {
        let clock = ManualClock::shared(Utc::now());
        let cold = Arc::new(SqliteColdStore::open_in_memory().unwrap());
        seed(&cold, clock.now(), "frank@example.com", 5);
        let audit = Arc::new(
            AuditLog::ephemeral(Arc::new(InMemoryAuditStore::new()), clock.clone()).unwrap(),
        );
        let config = ComplianceConfig {
            export_cap: 3,
            ..ComplianceConfig::default()
        };
        let service = GdprService::new(cold, audit, config, clock);

        let export = service.export("frank@example.com", &dpo()).unwrap();
        assert_eq!(export.record_count, 3);
        assert_eq!(export.regulation, "GDPR");
        assert_eq!(export.format, "JSON");

        let entries = service.audit_log().entries().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].record.record_count, 3);
        assert_eq!(
            entries[0].record.resource_id.as_deref(),
            Some(compute_hash("frank@example.com").as_str())
        );
    }
}
