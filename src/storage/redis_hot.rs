//! Hot tier over Redis Streams.
//!
//! Each entry holds the serialised envelope in a single `data` field.

use chrono::{DateTime, Utc};
use redis::streams::{StreamId as RedisStreamId, StreamRangeReply, StreamReadReply};
use redis::{cmd, Client, Commands, Connection};

use crate::error::{Error, Result};
use crate::events::EventEnvelope;
use crate::log_debug;
use crate::logging::structured::LogContext;

use super::hot::{HotStore, DEFAULT_MAX_LEN, DEFAULT_TTL_SECS};
use super::models::{stream_key, HotStoreStats, StreamEntry, StreamId};

const KEY_PATTERN: &str = "logs:agent:*";
const DATA_FIELD: &str = "data";

pub struct RedisHotStore {
    client: Client,
    max_len: usize,
    ttl_secs: i64,
}

impl RedisHotStore {
    pub fn new(redis_url: &str) -> Result<Self> {
        Self::with_limits(redis_url, DEFAULT_MAX_LEN, DEFAULT_TTL_SECS)
    }

    pub fn with_limits(redis_url: &str, max_len: usize, ttl_secs: i64) -> Result<Self> {
        let client = Client::open(redis_url)?;
        Ok(Self {
            client,
            max_len,
            ttl_secs,
        })
    }

    fn connection(&self) -> Result<Connection> {
        Ok(self.client.get_connection()?)
    }

    fn decode(key: &str, raw: &RedisStreamId) -> Result<StreamEntry> {
        let id = StreamId::parse(&raw.id)
            .ok_or_else(|| Error::Storage(format!("malformed stream id {}", raw.id)))?;
        let data: String = raw
            .get(DATA_FIELD)
            .ok_or_else(|| Error::Storage(format!("entry {} has no data field", raw.id)))?;
        Ok(StreamEntry {
            key: key.to_string(),
            id,
            event: serde_json::from_str(&data)?,
        })
    }

    fn keys(conn: &mut Connection) -> Result<Vec<String>> {
        let mut keys: Vec<String> = conn.scan_match::<_, String>(KEY_PATTERN)?.collect();
        keys.sort();
        keys.dedup();
        Ok(keys)
    }
}

impl HotStore for RedisHotStore {
    fn append(&self, event: &EventEnvelope) -> Result<StreamEntry> {
        let mut conn = self.connection()?;
        let key = stream_key(&event.agent_id, &event.timestamp);
        let data = serde_json::to_string(event)?;

        let id: String = cmd("XADD")
            .arg(&key)
            .arg("MAXLEN")
            .arg("~")
            .arg(self.max_len)
            .arg("*")
            .arg(DATA_FIELD)
            .arg(data)
            .query(&mut conn)?;
        let _: i64 = cmd("EXPIRE").arg(&key).arg(self.ttl_secs).query(&mut conn)?;

        let id = StreamId::parse(&id)
            .ok_or_else(|| Error::Storage(format!("malformed stream id {}", id)))?;
        Ok(StreamEntry {
            key,
            id,
            event: event.clone(),
        })
    }

    fn range(
        &self,
        key: &str,
        start: Option<StreamId>,
        end: Option<StreamId>,
        count: usize,
    ) -> Result<Vec<StreamEntry>> {
        let mut conn = self.connection()?;
        let reply: StreamRangeReply = cmd("XRANGE")
            .arg(key)
            .arg(start.map_or_else(|| "-".to_string(), |id| id.to_string()))
            .arg(end.map_or_else(|| "+".to_string(), |id| id.to_string()))
            .arg("COUNT")
            .arg(count)
            .query(&mut conn)?;
        reply.ids.iter().map(|raw| Self::decode(key, raw)).collect()
    }

    fn create_group(&self, key: &str, group: &str) -> Result<()> {
        let mut conn = self.connection()?;
        let created: redis::RedisResult<String> = cmd("XGROUP")
            .arg("CREATE")
            .arg(key)
            .arg(group)
            .arg("0")
            .arg("MKSTREAM")
            .query(&mut conn);
        match created {
            Ok(_) => Ok(()),
            Err(err) if err.code() == Some("BUSYGROUP") => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    fn read_group(
        &self,
        key: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<StreamEntry>> {
        let mut conn = self.connection()?;
        let reply: Option<StreamReadReply> = cmd("XREADGROUP")
            .arg("GROUP")
            .arg(group)
            .arg(consumer)
            .arg("COUNT")
            .arg(count)
            .arg("STREAMS")
            .arg(key)
            .arg(">")
            .query(&mut conn)
            .map_err(|err| match err.code() {
                Some("NOGROUP") => Error::NotFound(format!("consumer group {} on {}", group, key)),
                _ => err.into(),
            })?;

        let mut entries = Vec::new();
        for stream in reply.map(|r| r.keys).unwrap_or_default() {
            for raw in &stream.ids {
                entries.push(Self::decode(&stream.key, raw)?);
            }
        }
        Ok(entries)
    }

    fn ack(&self, key: &str, group: &str, ids: &[StreamId]) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut conn = self.connection()?;
        let mut command = cmd("XACK");
        command.arg(key).arg(group);
        for id in ids {
            command.arg(id.to_string());
        }
        Ok(command.query(&mut conn)?)
    }

    fn pending(&self, key: &str, group: &str) -> Result<usize> {
        let mut conn = self.connection()?;
        let (count, _, _, _): (usize, Option<String>, Option<String>, Option<Vec<(String, String)>>) =
            cmd("XPENDING").arg(key).arg(group).query(&mut conn)?;
        Ok(count)
    }

    fn entries_older_than(&self, cutoff: DateTime<Utc>, limit: usize) -> Result<Vec<StreamEntry>> {
        let mut conn = self.connection()?;
        let mut found = Vec::new();
        for key in Self::keys(&mut conn)? {
            let reply: StreamRangeReply = cmd("XRANGE")
                .arg(&key)
                .arg("-")
                .arg("+")
                .arg("COUNT")
                .arg(limit)
                .query(&mut conn)?;
            for raw in &reply.ids {
                if found.len() >= limit {
                    return Ok(found);
                }
                let entry = Self::decode(&key, raw)?;
                if entry.event.timestamp < cutoff {
                    found.push(entry);
                }
            }
        }
        log_debug!(
            LogContext::for_task("hot_store"),
            "HOT_SCAN_COMPLETE",
            found = found.len()
        );
        Ok(found)
    }

    fn delete(&self, key: &str, ids: &[StreamId]) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut conn = self.connection()?;
        let mut command = cmd("XDEL");
        command.arg(key);
        for id in ids {
            command.arg(id.to_string());
        }
        Ok(command.query(&mut conn)?)
    }

    fn stats(&self) -> Result<HotStoreStats> {
        let mut conn = self.connection()?;
        let keys = Self::keys(&mut conn)?;
        let mut stats = HotStoreStats {
            streams: keys.len(),
            ..HotStoreStats::default()
        };
        for key in &keys {
            let len: usize = cmd("XLEN").arg(key).query(&mut conn)?;
            stats.entries += len;
            let info: Vec<redis::Value> = cmd("XINFO").arg("GROUPS").arg(key).query(&mut conn)?;
            stats.groups += info.len();
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{AgentMode, SystemDetails, SystemKind};

    // Requires a running Redis instance.
    #[test]
    #[ignore]
    fn test_redis_append_and_group_read() {
        let store = RedisHotStore::new("redis://127.0.0.1/").expect("connect");
        let event = EventEnvelope::new_system(
            "agent-int-redistest0001",
            AgentMode::Internal,
            Utc::now(),
            SystemDetails {
                kind: SystemKind::Started,
                component: None,
            },
            "info",
            "agent started",
        );
        let entry = store.append(&event).expect("append");
        store.create_group(&entry.key, "storage").expect("group");
        let read = store
            .read_group(&entry.key, "storage", "c1", 10)
            .expect("read");
        assert!(read.iter().any(|e| e.id == entry.id));
        let ids: Vec<StreamId> = read.iter().map(|e| e.id).collect();
        store.ack(&entry.key, "storage", &ids).expect("ack");
        store.delete(&entry.key, &[entry.id]).expect("delete");
    }
}
