//! Tamper-evident audit log for access to personal data.
//!
//! Every entry stores the SHA-256 of its canonical JSON form, chained to
//! the previous entry's hash, and an Ed25519 signature over that hash.
//! Editing, dropping or reordering entries breaks `verify_chain`.

use std::net::IpAddr;
use std::sync::Arc;

use base64::{engine::general_purpose, Engine as _};
use chrono::{DateTime, Utc};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use parking_lot::Mutex;
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::clock::Clock;
use crate::error::Result;
use crate::hashing::compute_hash;
use crate::logging::structured::LogContext;
use crate::storage::SqliteColdStore;
use crate::{log_debug, log_error};

/// Previous-hash value of the first entry.
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// What a caller is about to record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub user_id: String,
    pub action: String,
    pub resource_type: String,
    pub resource_id: Option<String>,
    pub query_text: Option<String>,
    pub record_count: u64,
    pub ip_address: Option<IpAddr>,
    pub user_agent: Option<String>,
    pub justification: String,
    pub approved_by: Option<String>,
    pub session_id: Option<String>,
    pub success: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub record: AuditRecord,
    pub prev_hash: String,
    pub entry_hash: String,
    /// Base64 Ed25519 signature over `entry_hash`.
    pub signature: String,
}

impl AuditEntry {
    /// Hash of the entry with `entry_hash` and `signature` blanked.
    pub fn canonical_hash(&self) -> Result<String> {
        let mut hashable = self.clone();
        hashable.entry_hash = String::new();
        hashable.signature = String::new();
        Ok(compute_hash(&serde_json::to_string(&hashable)?))
    }
}

/// Result of walking the chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainVerification {
    pub entries: usize,
    pub head: Option<String>,
    /// First broken sequence number and why.
    pub violation: Option<(u64, String)>,
}

impl ChainVerification {
    pub fn is_intact(&self) -> bool {
        self.violation.is_none()
    }
}

pub trait AuditStore: Send + Sync {
    fn append(&self, entry: &AuditEntry) -> Result<()>;

    /// All entries in sequence order.
    fn entries(&self) -> Result<Vec<AuditEntry>>;

    fn last(&self) -> Result<Option<AuditEntry>>;
}

#[derive(Default)]
pub struct InMemoryAuditStore {
    entries: Mutex<Vec<AuditEntry>>,
}

impl InMemoryAuditStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AuditStore for InMemoryAuditStore {
    fn append(&self, entry: &AuditEntry) -> Result<()> {
        self.entries.lock().push(entry.clone());
        Ok(())
    }

    fn entries(&self) -> Result<Vec<AuditEntry>> {
        Ok(self.entries.lock().clone())
    }

    fn last(&self) -> Result<Option<AuditEntry>> {
        Ok(self.entries.lock().last().cloned())
    }
}

/// Audit rows in the cold store's `audit_access_logs` table.
pub struct SqliteAuditStore {
    db: Arc<SqliteColdStore>,
}

impl SqliteAuditStore {
    pub fn new(db: Arc<SqliteColdStore>) -> Self {
        Self { db }
    }
}

fn decode_entry(json: String) -> rusqlite::Result<AuditEntry> {
    serde_json::from_str(&json).map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(err))
    })
}

impl AuditStore for SqliteAuditStore {
    fn append(&self, entry: &AuditEntry) -> Result<()> {
        let json = serde_json::to_string(entry)?;
        let r = &entry.record;
        self.db.with_connection(|conn| {
            conn.execute(
                "INSERT INTO audit_access_logs (sequence, timestamp, user_id, action, resource_type,
                     resource_id, query_text, record_count, ip_address, user_agent, justification,
                     approved_by, session_id, entry_json)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
                params![
                    entry.sequence as i64,
                    entry.timestamp.to_rfc3339(),
                    r.user_id,
                    r.action,
                    r.resource_type,
                    r.resource_id,
                    r.query_text,
                    r.record_count as i64,
                    r.ip_address.map(|ip| ip.to_string()),
                    r.user_agent,
                    r.justification,
                    r.approved_by,
                    r.session_id,
                    json,
                ],
            )
        })?;
        Ok(())
    }

    fn entries(&self) -> Result<Vec<AuditEntry>> {
        self.db.with_connection(|conn| {
            let mut stmt =
                conn.prepare("SELECT entry_json FROM audit_access_logs ORDER BY sequence")?;
            let entries = stmt
                .query_map([], |row| decode_entry(row.get(0)?))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(entries)
        })
    }

    fn last(&self) -> Result<Option<AuditEntry>> {
        self.db.with_connection(|conn| {
            conn.query_row(
                "SELECT entry_json FROM audit_access_logs ORDER BY sequence DESC LIMIT 1",
                [],
                |row| decode_entry(row.get(0)?),
            )
            .optional()
        })
    }
}

struct ChainHead {
    sequence: u64,
    hash: String,
}

/// Appends signed, chained entries to an [`AuditStore`].
pub struct AuditLog {
    store: Arc<dyn AuditStore>,
    signing_key: SigningKey,
    clock: Arc<dyn Clock>,
    head: Mutex<ChainHead>,
}

impl AuditLog {
    /// Continue the chain already in `store`.
    pub fn new(store: Arc<dyn AuditStore>, signing_key: SigningKey, clock: Arc<dyn Clock>) -> Result<Self> {
        let head = match store.last()? {
            Some(entry) => ChainHead {
                sequence: entry.sequence,
                hash: entry.entry_hash,
            },
            None => ChainHead {
                sequence: 0,
                hash: GENESIS_HASH.to_string(),
            },
        };
        Ok(Self {
            store,
            signing_key,
            clock,
            head: Mutex::new(head),
        })
    }

    /// Log with a fresh random signing key.
    pub fn ephemeral(store: Arc<dyn AuditStore>, clock: Arc<dyn Clock>) -> Result<Self> {
        let secret: [u8; 32] = rand::random();
        Self::new(store, SigningKey::from_bytes(&secret), clock)
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    pub fn append(&self, record: AuditRecord) -> Result<AuditEntry> {
        let mut head = self.head.lock();
        let mut entry = AuditEntry {
            sequence: head.sequence + 1,
            timestamp: self.clock.now(),
            record,
            prev_hash: head.hash.clone(),
            entry_hash: String::new(),
            signature: String::new(),
        };
        entry.entry_hash = entry.canonical_hash()?;
        let signature = self.signing_key.sign(entry.entry_hash.as_bytes());
        entry.signature = general_purpose::STANDARD.encode(signature.to_bytes());

        if let Err(err) = self.store.append(&entry) {
            log_error!(
                LogContext::for_task("audit"),
                "AUDIT_APPEND_FAILED",
                sequence = entry.sequence,
                error = err.to_string()
            );
            return Err(err);
        }
        head.sequence = entry.sequence;
        head.hash = entry.entry_hash.clone();

        log_debug!(
            LogContext::for_task("audit"),
            "AUDIT_APPENDED",
            sequence = entry.sequence,
            action = entry.record.action,
            success = entry.record.success
        );
        Ok(entry)
    }

    pub fn entries(&self) -> Result<Vec<AuditEntry>> {
        self.store.entries()
    }

    /// Entries about one resource, in order.
    pub fn entries_for(&self, resource_id: &str) -> Result<Vec<AuditEntry>> {
        Ok(self
            .store
            .entries()?
            .into_iter()
            .filter(|entry| entry.record.resource_id.as_deref() == Some(resource_id))
            .collect())
    }

    pub fn verify_chain(&self) -> Result<ChainVerification> {
        verify_entries(&self.store.entries()?, &self.verifying_key())
    }
}

/// Walk `entries` checking sequence, links, hashes and signatures.
pub fn verify_entries(entries: &[AuditEntry], key: &VerifyingKey) -> Result<ChainVerification> {
    let mut expected_prev = GENESIS_HASH.to_string();
    for (idx, entry) in entries.iter().enumerate() {
        let expected_sequence = idx as u64 + 1;
        let violation = if entry.sequence != expected_sequence {
            Some(format!("expected sequence {}", expected_sequence))
        } else if entry.prev_hash != expected_prev {
            Some("previous hash does not link".to_string())
        } else if entry.canonical_hash()? != entry.entry_hash {
            Some("entry hash mismatch".to_string())
        } else if !signature_valid(entry, key) {
            Some("bad signature".to_string())
        } else {
            None
        };
        if let Some(reason) = violation {
            return Ok(ChainVerification {
                entries: entries.len(),
                head: entries.last().map(|e| e.entry_hash.clone()),
                violation: Some((entry.sequence, reason)),
            });
        }
        expected_prev = entry.entry_hash.clone();
    }
    Ok(ChainVerification {
        entries: entries.len(),
        head: entries.last().map(|e| e.entry_hash.clone()),
        violation: None,
    })
}

fn signature_valid(entry: &AuditEntry, key: &VerifyingKey) -> bool {
    let Ok(bytes) = general_purpose::STANDARD.decode(&entry.signature) else {
        return false;
    };
    let Ok(bytes) = <[u8; 64]>::try_from(bytes.as_slice()) else {
        return false;
    };
    key.verify(entry.entry_hash.as_bytes(), &Signature::from_bytes(&bytes))
        .is_ok()
}
