//! Cold tier: the relational `event_logs` table.
//!
//! [`SqliteColdStore`] runs the unpartitioned SQLite layout from
//! [`queries`](super::queries); the partition id is kept per row so
//! partition-level operations (archive objects, stats) behave as they do
//! over the PostgreSQL partitions.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use lazy_static::lazy_static;
use parking_lot::Mutex;
use regex::Regex;
use rusqlite::types::Type;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::events::EventEnvelope;
use crate::logging::structured::LogContext;
use crate::{log_debug, log_info};

use super::models::{
    canonical_timestamp, integrity_hash, partition_name, ColdStoreStats, LogQuery,
    RetentionPolicy, StoredLog, DEFAULT_RETENTION_DAYS,
};
use super::queries::{build_event_log_insert, build_retention_delete, build_sqlite_schema, Dialect};

lazy_static! {
    static ref TABLE_NAME: Regex = Regex::new(r"^[a-z_][a-z0-9_]*$").unwrap();
}

const SELECT_COLUMNS: &str = "id, source_id, timestamp, agent_id, agent_mode, event_type, \
     source, event_id, level, computer, message, raw_data, retention_until, archived, \
     integrity_hash, partition_key";

/// One batch of an integrity scan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IntegrityScan {
    pub scanned: usize,
    /// Highest row id seen; pass it back to continue the scan.
    pub last_id: i64,
    pub tampered: Vec<i64>,
}

/// How a data subject's rows are found: the identifier in cleartext, or
/// the salted occurrence hash ingest recorded when it redacted the value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubjectKey {
    pub identifier: String,
    pub occurrence_hash: Option<String>,
}

impl SubjectKey {
    pub fn new(identifier: &str) -> Self {
        Self {
            identifier: identifier.to_string(),
            occurrence_hash: None,
        }
    }

    pub fn with_occurrence_hash(mut self, hash: String) -> Self {
        self.occurrence_hash = Some(hash);
        self
    }

    fn hash_or_identifier(&self) -> &str {
        self.occurrence_hash.as_deref().unwrap_or(&self.identifier)
    }
}

/// Outcome of a subject erasure.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubjectDeletion {
    pub deleted_count: usize,
    pub affected_tables: Vec<String>,
}

pub trait ColdStore: Send + Sync {
    /// Insert events in one transaction. Events whose envelope id is
    /// already stored are skipped; returns the number of new rows.
    fn insert_batch(&self, events: &[EventEnvelope]) -> Result<usize>;

    fn query(&self, query: &LogQuery) -> Result<Vec<StoredLog>>;

    fn get(&self, id: i64) -> Result<Option<StoredLog>>;

    /// Recompute hashes for up to `limit` rows with id greater than `after_id`.
    fn scan_integrity(&self, after_id: i64, limit: usize) -> Result<IntegrityScan>;

    /// Unarchived rows past retention whose policy permits archival.
    fn archive_candidates(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<StoredLog>>;

    fn mark_archived(&self, ids: &[i64]) -> Result<usize>;

    /// Delete rows of the policy's `(event_type, agent_mode)` past retention.
    fn delete_expired(&self, policy: &RetentionPolicy, now: DateTime<Utc>) -> Result<usize>;

    /// Delete every row mentioning `subject`, across `event_logs` and
    /// `extra_tables`, in one transaction.
    fn delete_matching(&self, subject: &SubjectKey, extra_tables: &[String]) -> Result<SubjectDeletion>;

    fn count_matching(&self, subject: &SubjectKey, extra_tables: &[String]) -> Result<usize>;

    fn export_matching(&self, subject: &SubjectKey, limit: usize) -> Result<Vec<StoredLog>>;

    fn stats(&self) -> Result<ColdStoreStats>;

    fn retention_policies(&self) -> Result<Vec<RetentionPolicy>>;

    fn retention_policy(&self, event_type: &str, agent_mode: &str)
        -> Result<Option<RetentionPolicy>>;

    fn upsert_retention_policy(&self, policy: &RetentionPolicy) -> Result<()>;
}

pub struct SqliteColdStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteColdStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.ensure_schema()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.ensure_schema()?;
        Ok(store)
    }

    /// Create tables and seed the default retention policies.
    pub fn ensure_schema(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute_batch(build_sqlite_schema())?;
        for policy in RetentionPolicy::seeded() {
            conn.execute(
                "INSERT OR IGNORE INTO retention_policies
                 (event_type, agent_mode, retention_days, legal_hold, regulation, auto_delete, archive_required)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    policy.event_type,
                    policy.agent_mode,
                    policy.retention_days,
                    policy.legal_hold,
                    policy.regulation,
                    policy.auto_delete,
                    policy.archive_required
                ],
            )?;
        }
        Ok(())
    }

    /// Run `f` against the underlying connection under the store lock.
    pub fn with_connection<R, F>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<R>,
    {
        let conn = self.conn.lock();
        Ok(f(&conn)?)
    }

    fn retention_days(conn: &Connection) -> Result<HashMap<(String, String), i64>> {
        let mut stmt =
            conn.prepare("SELECT event_type, agent_mode, retention_days FROM retention_policies")?;
        let rows = stmt.query_map([], |row| {
            Ok(((row.get::<_, String>(0)?, row.get::<_, String>(1)?), row.get(2)?))
        })?;
        let mut days = HashMap::new();
        for row in rows {
            let (key, value) = row?;
            days.insert(key, value);
        }
        Ok(days)
    }

    fn select_logs(
        conn: &Connection,
        sql: &str,
        values: Vec<rusqlite::types::Value>,
    ) -> Result<Vec<StoredLog>> {
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(params_from_iter(values), row_to_log)?;
        let mut logs = Vec::new();
        for row in rows {
            logs.push(row?);
        }
        Ok(logs)
    }
}

fn parse_ts(idx: usize, value: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&value)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|err| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err)))
}

fn row_to_log(row: &Row<'_>) -> rusqlite::Result<StoredLog> {
    let raw: Option<String> = row.get(11)?;
    let raw_data = match raw {
        Some(text) => serde_json::from_str(&text).map_err(|err| {
            rusqlite::Error::FromSqlConversionFailure(11, Type::Text, Box::new(err))
        })?,
        None => Value::Null,
    };
    Ok(StoredLog {
        id: row.get(0)?,
        source_id: row.get(1)?,
        timestamp: parse_ts(2, row.get(2)?)?,
        agent_id: row.get(3)?,
        agent_mode: row.get(4)?,
        event_type: row.get(5)?,
        source: row.get::<_, Option<String>>(6)?.unwrap_or_default(),
        event_id: row.get(7)?,
        level: row.get::<_, Option<String>>(8)?.unwrap_or_default(),
        computer: row.get(9)?,
        message: row.get(10)?,
        raw_data,
        retention_until: parse_ts(12, row.get(12)?)?,
        archived: row.get(13)?,
        integrity_hash: row.get(14)?,
        partition: row.get(15)?,
    })
}

fn row_to_policy(row: &Row<'_>) -> rusqlite::Result<RetentionPolicy> {
    Ok(RetentionPolicy {
        event_type: row.get(0)?,
        agent_mode: row.get(1)?,
        retention_days: row.get(2)?,
        legal_hold: row.get(3)?,
        regulation: row.get(4)?,
        auto_delete: row.get(5)?,
        archive_required: row.get(6)?,
    })
}

fn checked_tables(extra_tables: &[String]) -> Result<Vec<&str>> {
    let mut tables = vec!["event_logs"];
    for table in extra_tables {
        if !TABLE_NAME.is_match(table) {
            return Err(Error::InvalidArgument(format!(
                "invalid table name: {}",
                table
            )));
        }
        if table != "event_logs" {
            tables.push(table.as_str());
        }
    }
    Ok(tables)
}

/// `?1` is the identifier, `?2` its occurrence hash. Redacted events only
/// carry the hash, inside `raw_data`.
fn subject_filter(table: &str) -> &'static str {
    if table == "event_logs" {
        "(instr(message, ?1) > 0 OR instr(COALESCE(raw_data, ''), ?1) > 0 \
         OR instr(COALESCE(raw_data, ''), ?2) > 0)"
    } else {
        "(instr(message, ?1) > 0 OR instr(message, ?2) > 0)"
    }
}

impl ColdStore for SqliteColdStore {
    fn insert_batch(&self, events: &[EventEnvelope]) -> Result<usize> {
        if events.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn.lock();
        let days = Self::retention_days(&conn)?;
        let tx = conn.transaction()?;
        let mut inserted = 0;
        {
            let mut stmt = tx.prepare(&build_event_log_insert(Dialect::Sqlite))?;
            for event in events {
                let event_type = event.event_type.as_str();
                let agent_mode = event.agent_mode.as_str();
                let retention = days
                    .get(&(event_type.to_string(), agent_mode.to_string()))
                    .copied()
                    .unwrap_or(DEFAULT_RETENTION_DAYS);
                let retention_until = event.timestamp + Duration::days(retention);
                let (event_id, computer) = event.windows_fields();
                let raw = serde_json::to_string(event)?;
                let hash = integrity_hash(&event.timestamp, &event.agent_id, event_type, &event.message);

                inserted += stmt.execute(params![
                    event.id,
                    canonical_timestamp(&event.timestamp),
                    event.agent_id,
                    agent_mode,
                    event_type,
                    event.source,
                    event_id,
                    event.level,
                    computer,
                    event.message,
                    raw,
                    canonical_timestamp(&retention_until),
                    false,
                    hash,
                    partition_name(&event.timestamp),
                ])?;
            }
        }
        tx.commit()?;

        log_debug!(
            LogContext::for_task("cold_store"),
            "COLD_BATCH_INSERTED",
            received = events.len(),
            inserted = inserted
        );
        Ok(inserted)
    }

    fn query(&self, query: &LogQuery) -> Result<Vec<StoredLog>> {
        let mut clauses: Vec<String> = Vec::new();
        let mut values: Vec<rusqlite::types::Value> = Vec::new();

        let mut push = |clause: &str, value: rusqlite::types::Value| {
            values.push(value);
            clauses.push(format!("{} ?{}", clause, values.len()));
        };
        if let Some(agent_id) = &query.agent_id {
            push("agent_id =", agent_id.clone().into());
        }
        if let Some(event_type) = &query.event_type {
            push("event_type =", event_type.clone().into());
        }
        if let Some(level) = &query.level {
            push("level =", level.clone().into());
        }
        if let Some(start) = &query.start {
            push("timestamp >=", canonical_timestamp(start).into());
        }
        if let Some(end) = &query.end {
            push("timestamp <=", canonical_timestamp(end).into());
        }
        if let Some(needle) = &query.message_contains {
            values.push(needle.clone().into());
            clauses.push(format!("instr(message, ?{}) > 0", values.len()));
        }

        let mut sql = format!("SELECT {} FROM event_logs", SELECT_COLUMNS);
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        let limit = query.limit.unwrap_or(LogQuery::DEFAULT_LIMIT) as i64;
        let offset = query.offset.unwrap_or(0) as i64;
        sql.push_str(&format!(
            " ORDER BY timestamp DESC, id DESC LIMIT {} OFFSET {}",
            limit, offset
        ));

        let conn = self.conn.lock();
        Self::select_logs(&conn, &sql, values)
    }

    fn get(&self, id: i64) -> Result<Option<StoredLog>> {
        let conn = self.conn.lock();
        let sql = format!("SELECT {} FROM event_logs WHERE id = ?1", SELECT_COLUMNS);
        Ok(conn.query_row(&sql, params![id], row_to_log).optional()?)
    }

    fn scan_integrity(&self, after_id: i64, limit: usize) -> Result<IntegrityScan> {
        let conn = self.conn.lock();
        let sql = format!(
            "SELECT {} FROM event_logs WHERE id > ?1 ORDER BY id LIMIT ?2",
            SELECT_COLUMNS
        );
        let rows = Self::select_logs(&conn, &sql, vec![after_id.into(), (limit as i64).into()])?;

        let mut scan = IntegrityScan {
            scanned: rows.len(),
            last_id: after_id,
            tampered: Vec::new(),
        };
        for row in rows {
            scan.last_id = scan.last_id.max(row.id);
            if !row.is_intact() {
                scan.tampered.push(row.id);
            }
        }
        Ok(scan)
    }

    fn archive_candidates(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<StoredLog>> {
        let columns: Vec<String> = SELECT_COLUMNS
            .split(", ")
            .map(|column| format!("e.{}", column.trim()))
            .collect();
        let sql = format!(
            "SELECT {} FROM event_logs e
             LEFT JOIN retention_policies p
               ON p.event_type = e.event_type AND p.agent_mode = e.agent_mode
             WHERE e.archived = 0
               AND e.retention_until <= ?1
               AND (p.event_type IS NULL OR p.legal_hold = 0 OR p.archive_required = 1)
             ORDER BY e.id LIMIT ?2",
            columns.join(", ")
        );
        let conn = self.conn.lock();
        Self::select_logs(
            &conn,
            &sql,
            vec![canonical_timestamp(&now).into(), (limit as i64).into()],
        )
    }

    fn mark_archived(&self, ids: &[i64]) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let mut updated = 0;
        {
            let mut stmt = tx.prepare("UPDATE event_logs SET archived = 1 WHERE id = ?1")?;
            for id in ids {
                updated += stmt.execute(params![id])?;
            }
        }
        tx.commit()?;
        Ok(updated)
    }

    fn delete_expired(&self, policy: &RetentionPolicy, now: DateTime<Utc>) -> Result<usize> {
        if !policy.allows_deletion() {
            return Ok(0);
        }
        let conn = self.conn.lock();
        let deleted = conn.execute(
            &build_retention_delete(Dialect::Sqlite, policy.archive_required),
            params![policy.event_type, policy.agent_mode, canonical_timestamp(&now)],
        )?;
        Ok(deleted)
    }

    fn delete_matching(&self, subject: &SubjectKey, extra_tables: &[String]) -> Result<SubjectDeletion> {
        let tables = checked_tables(extra_tables)?;
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let mut outcome = SubjectDeletion::default();
        for table in tables {
            let sql = format!("DELETE FROM {} WHERE {}", table, subject_filter(table));
            outcome.deleted_count += tx.execute(
                &sql,
                params![subject.identifier, subject.hash_or_identifier()],
            )?;
            outcome.affected_tables.push(table.to_string());
        }
        // Dropping `tx` on an error above rolls the whole erasure back.
        tx.commit()?;

        log_info!(
            LogContext::for_task("cold_store"),
            "SUBJECT_ROWS_DELETED",
            deleted = outcome.deleted_count,
            tables = outcome.affected_tables
        );
        Ok(outcome)
    }

    fn count_matching(&self, subject: &SubjectKey, extra_tables: &[String]) -> Result<usize> {
        let tables = checked_tables(extra_tables)?;
        let conn = self.conn.lock();
        let mut total = 0usize;
        for table in tables {
            let sql = format!("SELECT COUNT(*) FROM {} WHERE {}", table, subject_filter(table));
            let count: i64 = conn.query_row(
                &sql,
                params![subject.identifier, subject.hash_or_identifier()],
                |row| row.get(0),
            )?;
            total += count as usize;
        }
        Ok(total)
    }

    fn export_matching(&self, subject: &SubjectKey, limit: usize) -> Result<Vec<StoredLog>> {
        let sql = format!(
            "SELECT {} FROM event_logs WHERE {} ORDER BY timestamp DESC, id DESC LIMIT ?3",
            SELECT_COLUMNS,
            subject_filter("event_logs")
        );
        let conn = self.conn.lock();
        Self::select_logs(
            &conn,
            &sql,
            vec![
                subject.identifier.clone().into(),
                subject.hash_or_identifier().to_string().into(),
                (limit as i64).into(),
            ],
        )
    }

    fn stats(&self) -> Result<ColdStoreStats> {
        let conn = self.conn.lock();
        let (total, archived): (i64, i64) = conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(archived), 0) FROM event_logs",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        let mut stmt =
            conn.prepare("SELECT DISTINCT partition_key FROM event_logs ORDER BY partition_key")?;
        let partitions = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(ColdStoreStats {
            total: total as u64,
            archived: archived as u64,
            active: (total - archived) as u64,
            partitions,
        })
    }

    fn retention_policies(&self) -> Result<Vec<RetentionPolicy>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT event_type, agent_mode, retention_days, legal_hold, regulation, auto_delete, archive_required
             FROM retention_policies ORDER BY event_type, agent_mode",
        )?;
        let policies = stmt
            .query_map([], row_to_policy)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(policies)
    }

    fn retention_policy(
        &self,
        event_type: &str,
        agent_mode: &str,
    ) -> Result<Option<RetentionPolicy>> {
        let conn = self.conn.lock();
        Ok(conn
            .query_row(
                "SELECT event_type, agent_mode, retention_days, legal_hold, regulation, auto_delete, archive_required
                 FROM retention_policies WHERE event_type = ?1 AND agent_mode = ?2",
                params![event_type, agent_mode],
                row_to_policy,
            )
            .optional()?)
    }

    fn upsert_retention_policy(&self, policy: &RetentionPolicy) -> Result<()> {
        if policy.retention_days <= 0 {
            return Err(Error::InvalidArgument(format!(
                "retention_days must be positive, got {}",
                policy.retention_days
            )));
        }
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO retention_policies
             (event_type, agent_mode, retention_days, legal_hold, regulation, auto_delete, archive_required)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(event_type, agent_mode) DO UPDATE SET
               retention_days = excluded.retention_days,
               legal_hold = excluded.legal_hold,
               regulation = excluded.regulation,
               auto_delete = excluded.auto_delete,
               archive_required = excluded.archive_required",
            params![
                policy.event_type,
                policy.agent_mode,
                policy.retention_days,
                policy.legal_hold,
                policy.regulation,
                policy.auto_delete,
                policy.archive_required
            ],
        )?;
        log_info!(
            LogContext::default(),
            "RETENTION_POLICY_UPDATED",
            event_type = policy.event_type,
            agent_mode = policy.agent_mode,
            legal_hold = policy.legal_hold
        );
        Ok(())
    }
}
