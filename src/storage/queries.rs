//! SQL query builders.
//!
//! Generates DDL and DML for the cold tier and the audit table. PostgreSQL
//! is the production dialect (monthly range partitions); SQLite runs the
//! same layout unpartitioned, with the partition name kept as a column.

use chrono::{DateTime, Datelike, TimeZone, Utc};

use super::models::partition_name;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Postgres,
    Sqlite,
}

impl Dialect {
    pub fn placeholder(&self, n: usize) -> String {
        match self {
            Dialect::Postgres => format!("${}", n),
            Dialect::Sqlite => format!("?{}", n),
        }
    }

    /// Unique key of an event row. Envelope ids are only unique per agent;
    /// PostgreSQL also needs the partition column in every unique index.
    pub fn event_conflict_target(&self) -> &'static str {
        match self {
            Dialect::Postgres => "(agent_id, source_id, timestamp)",
            Dialect::Sqlite => "(agent_id, source_id)",
        }
    }
}

/// Insertable columns of `event_logs`, in bind order.
pub fn get_event_log_columns() -> Vec<&'static str> {
    vec![
        "source_id",
        "timestamp",
        "agent_id",
        "agent_mode",
        "event_type",
        "source",
        "event_id",
        "level",
        "computer",
        "message",
        "raw_data",
        "retention_until",
        "archived",
        "integrity_hash",
        "partition_key",
    ]
}

/// Build INSERT for event_logs, idempotent on the agent's envelope id.
pub fn build_event_log_insert(dialect: Dialect) -> String {
    let columns = get_event_log_columns();
    let placeholders: Vec<String> = (1..=columns.len()).map(|n| dialect.placeholder(n)).collect();

    format!(
        "INSERT INTO event_logs ({}) VALUES ({}) ON CONFLICT {} DO NOTHING",
        columns.join(", "),
        placeholders.join(", "),
        dialect.event_conflict_target()
    )
}

/// Partitioned parent table and its indices (PostgreSQL).
pub fn build_event_logs_ddl() -> &'static str {
    r#"
    CREATE TABLE IF NOT EXISTS event_logs (
        id BIGSERIAL,
        source_id VARCHAR(64) NOT NULL,
        timestamp TIMESTAMPTZ NOT NULL,
        agent_id CHAR(64) NOT NULL,
        agent_mode CHAR(16) NOT NULL,
        event_type CHAR(64) NOT NULL,
        source VARCHAR(128),
        event_id INTEGER,
        level VARCHAR(32),
        computer VARCHAR(256),
        message TEXT,
        raw_data JSONB,
        retention_until TIMESTAMPTZ NOT NULL,
        archived BOOLEAN NOT NULL DEFAULT FALSE,
        integrity_hash CHAR(64) NOT NULL,
        partition_key VARCHAR(32) NOT NULL,
        PRIMARY KEY (id, timestamp),
        UNIQUE (agent_id, source_id, timestamp)
    ) PARTITION BY RANGE (timestamp);
    CREATE INDEX IF NOT EXISTS idx_event_logs_agent_ts ON event_logs (agent_id, timestamp);
    CREATE INDEX IF NOT EXISTS idx_event_logs_event_type ON event_logs (event_type);
    CREATE INDEX IF NOT EXISTS idx_event_logs_level ON event_logs (level);
    CREATE INDEX IF NOT EXISTS idx_event_logs_computer ON event_logs (computer);
    CREATE INDEX IF NOT EXISTS idx_event_logs_retention ON event_logs (retention_until);
    CREATE INDEX IF NOT EXISTS idx_event_logs_archived ON event_logs (archived);
    "#
}

/// Monthly partition covering `ts` (PostgreSQL).
pub fn build_partition_ddl(ts: &DateTime<Utc>) -> String {
    let start = Utc
        .with_ymd_and_hms(ts.year(), ts.month(), 1, 0, 0, 0)
        .single()
        .unwrap_or(*ts);
    let (next_year, next_month) = if ts.month() == 12 {
        (ts.year() + 1, 1)
    } else {
        (ts.year(), ts.month() + 1)
    };
    let end = Utc
        .with_ymd_and_hms(next_year, next_month, 1, 0, 0, 0)
        .single()
        .unwrap_or(*ts);

    format!(
        "CREATE TABLE IF NOT EXISTS {} PARTITION OF event_logs FOR VALUES FROM ('{}') TO ('{}')",
        partition_name(ts),
        start.format("%Y-%m-%d"),
        end.format("%Y-%m-%d")
    )
}

/// Unpartitioned layout used by the SQLite executor.
pub fn build_sqlite_schema() -> &'static str {
    r#"
    CREATE TABLE IF NOT EXISTS event_logs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        source_id TEXT NOT NULL,
        timestamp TEXT NOT NULL,
        agent_id TEXT NOT NULL,
        agent_mode TEXT NOT NULL,
        event_type TEXT NOT NULL,
        source TEXT,
        event_id INTEGER,
        level TEXT,
        computer TEXT,
        message TEXT NOT NULL DEFAULT '',
        raw_data TEXT,
        retention_until TEXT NOT NULL,
        archived INTEGER NOT NULL DEFAULT 0,
        integrity_hash TEXT NOT NULL,
        partition_key TEXT NOT NULL,
        UNIQUE (agent_id, source_id)
    );
    CREATE INDEX IF NOT EXISTS idx_event_logs_agent_ts ON event_logs (agent_id, timestamp);
    CREATE INDEX IF NOT EXISTS idx_event_logs_event_type ON event_logs (event_type);
    CREATE INDEX IF NOT EXISTS idx_event_logs_level ON event_logs (level);
    CREATE INDEX IF NOT EXISTS idx_event_logs_computer ON event_logs (computer);
    CREATE INDEX IF NOT EXISTS idx_event_logs_retention ON event_logs (retention_until);
    CREATE INDEX IF NOT EXISTS idx_event_logs_archived ON event_logs (archived);
    CREATE INDEX IF NOT EXISTS idx_event_logs_partition ON event_logs (partition_key);

    CREATE TABLE IF NOT EXISTS retention_policies (
        event_type TEXT NOT NULL,
        agent_mode TEXT NOT NULL,
        retention_days INTEGER NOT NULL,
        legal_hold INTEGER NOT NULL DEFAULT 0,
        regulation TEXT NOT NULL DEFAULT '',
        auto_delete INTEGER NOT NULL DEFAULT 1,
        archive_required INTEGER NOT NULL DEFAULT 0,
        PRIMARY KEY (event_type, agent_mode)
    );

    CREATE TABLE IF NOT EXISTS audit_access_logs (
        sequence INTEGER PRIMARY KEY,
        timestamp TEXT NOT NULL,
        user_id TEXT NOT NULL,
        action TEXT NOT NULL,
        resource_type TEXT NOT NULL,
        resource_id TEXT,
        query_text TEXT,
        record_count INTEGER NOT NULL DEFAULT 0,
        ip_address TEXT,
        user_agent TEXT,
        justification TEXT,
        approved_by TEXT,
        session_id TEXT,
        entry_json TEXT NOT NULL
    );
    "#
}

/// Audit table (PostgreSQL).
pub fn build_audit_ddl() -> &'static str {
    r#"
    CREATE TABLE IF NOT EXISTS audit_access_logs (
        sequence BIGINT PRIMARY KEY,
        timestamp TIMESTAMPTZ NOT NULL,
        user_id VARCHAR(128) NOT NULL,
        action VARCHAR(32) NOT NULL,
        resource_type VARCHAR(64) NOT NULL,
        resource_id VARCHAR(128),
        query_text TEXT,
        record_count BIGINT NOT NULL DEFAULT 0,
        ip_address INET,
        user_agent TEXT,
        justification TEXT,
        approved_by VARCHAR(128),
        session_id VARCHAR(128),
        entry_json JSONB NOT NULL
    )
    "#
}

/// Retention delete for one policy; archived rows only when required.
pub fn build_retention_delete(dialect: Dialect, archive_required: bool) -> String {
    let archived = if archive_required { " AND archived = TRUE" } else { "" };
    let archived = match dialect {
        Dialect::Sqlite => archived.replace("TRUE", "1"),
        Dialect::Postgres => archived.to_string(),
    };
    format!(
        "DELETE FROM event_logs WHERE event_type = {} AND agent_mode = {} AND retention_until <= {}{}",
        dialect.placeholder(1),
        dialect.placeholder(2),
        dialect.placeholder(3),
        archived
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_log_insert_query() {
        let query = build_event_log_insert(Dialect::Postgres);
        assert!(query.contains("INSERT INTO event_logs"));
        assert!(query.contains("integrity_hash"));
        assert!(query.contains("$15"));
        assert!(query.ends_with("ON CONFLICT (agent_id, source_id, timestamp) DO NOTHING"));

        let sqlite = build_event_log_insert(Dialect::Sqlite);
        assert!(sqlite.contains("?15"));
        assert!(sqlite.ends_with("ON CONFLICT (agent_id, source_id) DO NOTHING"));
        assert!(build_sqlite_schema().contains("UNIQUE (agent_id, source_id)"));
    }

    #[test]
    fn test_partition_ddl_bounds() {
        let ts = Utc.with_ymd_and_hms(2025, 12, 15, 8, 0, 0).unwrap();
        let ddl = build_partition_ddl(&ts);
        assert_eq!(
            ddl,
            "CREATE TABLE IF NOT EXISTS event_logs_2025_12 PARTITION OF event_logs FOR VALUES FROM ('2025-12-01') TO ('2026-01-01')"
        );
    }

    #[test]
    fn test_retention_delete() {
        let q = build_retention_delete(Dialect::Sqlite, true);
        assert!(q.ends_with("retention_until <= ?3 AND archived = 1"));
        let q = build_retention_delete(Dialect::Postgres, false);
        assert!(!q.contains("archived"));
    }

    #[test]
    fn test_postgres_ddl() {
        let ddl = build_event_logs_ddl();
        assert!(ddl.contains("PARTITION BY RANGE (timestamp)"));
        assert!(ddl.contains("UNIQUE (agent_id, source_id, timestamp)"));
        assert!(build_audit_ddl().contains("entry_json JSONB NOT NULL"));
    }

    #[test]
    fn test_column_count() {
        assert_eq!(get_event_log_columns().len(), 15);
    }
}
