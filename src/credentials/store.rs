//! Credential store.
//!
//! Issues, verifies, rotates and revokes per-agent credentials. Exactly one
//! credential per agent is active; a rotated-out credential keeps
//! authenticating until its grace window closes. API keys are kept only as
//! their SHA-256; certificate private keys are handed out once.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use rand::{rngs::OsRng, RngCore};
use serde::Serialize;

use crate::clock::Clock;
use crate::config::CredentialConfig;
use crate::error::{Error, Result};
use crate::events::AgentMode;
use crate::hashing::compute_hash;
use crate::logging::structured::LogContext;
use crate::{log_info, log_warn};

use super::ca::{CertificateAuthority, CertificateIdentity};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialKind {
    Mtls,
    ApiKey,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum CredentialStatus {
    Active,
    Deprecated { until: DateTime<Utc> },
    Revoked,
}

/// Audit view of a credential. Never carries secret material.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CredentialRecord {
    /// Certificate fingerprint or API key hash.
    pub id: String,
    pub agent_id: String,
    pub kind: CredentialKind,
    pub issued_at: DateTime<Utc>,
    pub not_after: Option<DateTime<Utc>>,
    pub status: CredentialStatus,
}

/// Material returned to the enrolling agent.
#[derive(Clone, PartialEq)]
pub enum IssuedCredential {
    Mtls {
        certificate_pem: String,
        ca_certificate_pem: String,
        fingerprint: String,
        not_after: DateTime<Utc>,
    },
    ApiKey {
        api_key: String,
    },
}

impl std::fmt::Debug for IssuedCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IssuedCredential::Mtls {
                fingerprint,
                not_after,
                ..
            } => f
                .debug_struct("Mtls")
                .field("fingerprint", fingerprint)
                .field("not_after", not_after)
                .finish_non_exhaustive(),
            IssuedCredential::ApiKey { .. } => f.write_str("ApiKey { .. }"),
        }
    }
}

/// A credential presented by an agent.
#[derive(Debug, Clone, Copy)]
pub enum AgentCredential<'a> {
    /// DER certificates, leaf first.
    Mtls(&'a [Vec<u8>]),
    ApiKey(&'a str),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedCredential {
    pub agent_id: String,
    pub kind: CredentialKind,
    pub not_after: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct Inner {
    records: HashMap<String, CredentialRecord>,
    active: HashMap<String, String>,
    pending_keys: HashMap<String, String>,
}

pub struct CredentialStore {
    ca: CertificateAuthority,
    config: CredentialConfig,
    clock: Arc<dyn Clock>,
    inner: Mutex<Inner>,
}

/// 32 random bytes, hex encoded.
pub fn generate_api_key() -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

impl CredentialStore {
    pub fn new(config: CredentialConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        let ca = CertificateAuthority::generate(&config.ca_common_name, clock.now())?;
        log_info!(
            LogContext::for_task("credentials"),
            "AGENT_CA_GENERATED",
            common_name = config.ca_common_name
        );
        Ok(Self {
            ca,
            config,
            clock,
            inner: Mutex::new(Inner::default()),
        })
    }

    pub fn ca_certificate_pem(&self) -> String {
        self.ca.certificate_pem()
    }

    /// Issue the first credential for an agent.
    pub fn issue(&self, agent_id: &str, mode: AgentMode) -> Result<IssuedCredential> {
        if self.inner.lock().active.contains_key(agent_id) {
            return Err(Error::Conflict(format!(
                "agent {} already holds an active credential",
                agent_id
            )));
        }
        self.issue_active(agent_id, mode)
    }

    fn issue_active(&self, agent_id: &str, mode: AgentMode) -> Result<IssuedCredential> {
        let now = self.clock.now();
        let (record, issued, private_key) = match mode {
            AgentMode::External => {
                let cert = self.ca.issue(agent_id, now, self.config.cert_validity_days)?;
                let record = CredentialRecord {
                    id: cert.fingerprint.clone(),
                    agent_id: agent_id.to_string(),
                    kind: CredentialKind::Mtls,
                    issued_at: now,
                    not_after: Some(cert.not_after),
                    status: CredentialStatus::Active,
                };
                let issued = IssuedCredential::Mtls {
                    certificate_pem: cert.certificate_pem,
                    ca_certificate_pem: self.ca.certificate_pem(),
                    fingerprint: cert.fingerprint,
                    not_after: cert.not_after,
                };
                (record, issued, Some(cert.private_key_pem))
            }
            AgentMode::Internal => {
                let api_key = generate_api_key();
                let record = CredentialRecord {
                    id: compute_hash(&api_key),
                    agent_id: agent_id.to_string(),
                    kind: CredentialKind::ApiKey,
                    issued_at: now,
                    not_after: None,
                    status: CredentialStatus::Active,
                };
                (record, IssuedCredential::ApiKey { api_key }, None)
            }
        };

        let mut inner = self.inner.lock();
        inner.active.insert(agent_id.to_string(), record.id.clone());
        match private_key {
            Some(key) => {
                inner.pending_keys.insert(agent_id.to_string(), key);
            }
            None => {
                inner.pending_keys.remove(agent_id);
            }
        }
        log_info!(
            LogContext::for_agent(agent_id),
            "CREDENTIAL_ISSUED",
            kind = record.kind,
            credential = &record.id[..16]
        );
        inner.records.insert(record.id.clone(), record);
        Ok(issued)
    }

    /// One-shot retrieval of the private key for the agent's newest
    /// certificate.
    pub fn take_private_key(&self, agent_id: &str) -> Option<String> {
        self.inner.lock().pending_keys.remove(agent_id)
    }

    pub fn verify_mtls(&self, chain: &[Vec<u8>]) -> Result<VerifiedCredential> {
        let now = self.clock.now();
        let CertificateIdentity {
            agent_id,
            fingerprint,
            not_after,
        } = self.ca.verify(chain, now)?;
        self.check_status(&fingerprint, &agent_id, now)?;
        Ok(VerifiedCredential {
            agent_id,
            kind: CredentialKind::Mtls,
            not_after: Some(not_after),
        })
    }

    pub fn verify_api_key(&self, api_key: &str) -> Result<VerifiedCredential> {
        let now = self.clock.now();
        let id = compute_hash(api_key.trim());
        let agent_id = self
            .inner
            .lock()
            .records
            .get(&id)
            .filter(|record| record.kind == CredentialKind::ApiKey)
            .map(|record| record.agent_id.clone())
            .ok_or_else(|| Error::Unauthenticated("unknown api key".into()))?;
        self.check_status(&id, &agent_id, now)?;
        Ok(VerifiedCredential {
            agent_id,
            kind: CredentialKind::ApiKey,
            not_after: None,
        })
    }

    pub fn verify(&self, credential: AgentCredential<'_>) -> Result<VerifiedCredential> {
        match credential {
            AgentCredential::Mtls(chain) => self.verify_mtls(chain),
            AgentCredential::ApiKey(key) => self.verify_api_key(key),
        }
    }

    fn check_status(&self, id: &str, agent_id: &str, now: DateTime<Utc>) -> Result<()> {
        let mut inner = self.inner.lock();
        let record = inner
            .records
            .get_mut(id)
            .filter(|record| record.agent_id == agent_id)
            .ok_or_else(|| Error::Unauthenticated("credential not issued by this store".into()))?;
        match record.status {
            CredentialStatus::Active => Ok(()),
            CredentialStatus::Deprecated { until } if now <= until => Ok(()),
            CredentialStatus::Deprecated { .. } => {
                record.status = CredentialStatus::Revoked;
                Err(Error::Revoked(format!(
                    "credential for {} was rotated out",
                    agent_id
                )))
            }
            CredentialStatus::Revoked => Err(Error::Revoked(format!(
                "credential for {} is revoked",
                agent_id
            ))),
        }
    }

    /// Replace the active credential; the old one stays valid for the grace
    /// window.
    pub fn rotate(&self, agent_id: &str, mode: AgentMode) -> Result<IssuedCredential> {
        let now = self.clock.now();
        let until = now + Duration::seconds(self.config.rotation_grace_secs);
        {
            let mut inner = self.inner.lock();
            let current = inner
                .active
                .get(agent_id)
                .cloned()
                .ok_or_else(|| Error::NotFound(format!("no active credential for {}", agent_id)))?;
            if let Some(record) = inner.records.get_mut(&current) {
                record.status = CredentialStatus::Deprecated { until };
            }
        }
        let issued = self.issue_active(agent_id, mode)?;
        log_info!(
            LogContext::for_agent(agent_id),
            "CREDENTIAL_ROTATED",
            grace_until = until.to_rfc3339()
        );
        Ok(issued)
    }

    /// Revoke every credential of an agent. Returns how many changed.
    pub fn revoke_all(&self, agent_id: &str) -> usize {
        let mut inner = self.inner.lock();
        inner.active.remove(agent_id);
        inner.pending_keys.remove(agent_id);
        let mut revoked = 0;
        for record in inner.records.values_mut() {
            if record.agent_id == agent_id && record.status != CredentialStatus::Revoked {
                record.status = CredentialStatus::Revoked;
                revoked += 1;
            }
        }
        drop(inner);
        log_warn!(
            LogContext::for_agent(agent_id),
            "CREDENTIALS_REVOKED",
            count = revoked
        );
        revoked
    }

    pub fn active_credential(&self, agent_id: &str) -> Option<CredentialRecord> {
        let inner = self.inner.lock();
        inner
            .active
            .get(agent_id)
            .and_then(|id| inner.records.get(id))
            .cloned()
    }

    /// Every credential ever issued to the agent, oldest first.
    pub fn credentials_for(&self, agent_id: &str) -> Vec<CredentialRecord> {
        let mut records: Vec<CredentialRecord> = self
            .inner
            .lock()
            .records
            .values()
            .filter(|record| record.agent_id == agent_id)
            .cloned()
            .collect();
        records.sort_by_key(|record| record.issued_at);
        records
    }
}
