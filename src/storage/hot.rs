//! Hot tier: bounded, time-ordered streams per agent and day.
//!
//! Mirrors Redis Streams semantics: monotonic ids, approximate MAXLEN
//! trimming on append, idle key expiry, and consumer groups that track the
//! last delivered id plus a pending list until ack.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;

use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::events::EventEnvelope;

use super::models::{stream_key, HotStoreStats, StreamEntry, StreamId};

/// Default per-stream length cap.
pub const DEFAULT_MAX_LEN: usize = 100_000;

/// Default idle expiry of a stream key. Longer than the promotion age plus
/// one hot-to-cold interval, so idle streams are promoted before they expire.
pub const DEFAULT_TTL_SECS: i64 = 7_200;

pub trait HotStore: Send + Sync {
    /// Append to the agent's stream for the event's day.
    fn append(&self, event: &EventEnvelope) -> Result<StreamEntry>;

    /// Entries with `start <= id <= end`, oldest first.
    fn range(
        &self,
        key: &str,
        start: Option<StreamId>,
        end: Option<StreamId>,
        count: usize,
    ) -> Result<Vec<StreamEntry>>;

    /// Create a consumer group positioned before the first entry.
    /// Creating an existing group is a no-op.
    fn create_group(&self, key: &str, group: &str) -> Result<()>;

    /// Deliver up to `count` entries the group has not seen yet.
    fn read_group(
        &self,
        key: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<StreamEntry>>;

    fn ack(&self, key: &str, group: &str, ids: &[StreamId]) -> Result<usize>;

    /// Delivered but unacknowledged entries of a group.
    fn pending(&self, key: &str, group: &str) -> Result<usize>;

    /// Entries across all streams whose event timestamp is before `cutoff`.
    fn entries_older_than(&self, cutoff: DateTime<Utc>, limit: usize) -> Result<Vec<StreamEntry>>;

    fn delete(&self, key: &str, ids: &[StreamId]) -> Result<usize>;

    fn stats(&self) -> Result<HotStoreStats>;
}

#[derive(Debug, Default)]
struct ConsumerGroup {
    last_delivered: Option<StreamId>,
    pending: BTreeMap<StreamId, String>,
}

#[derive(Debug)]
struct Stream {
    entries: BTreeMap<StreamId, EventEnvelope>,
    last_id: Option<StreamId>,
    groups: HashMap<String, ConsumerGroup>,
    expires_at: DateTime<Utc>,
}

impl Stream {
    fn new(expires_at: DateTime<Utc>) -> Self {
        Self {
            entries: BTreeMap::new(),
            last_id: None,
            groups: HashMap::new(),
            expires_at,
        }
    }

    fn next_id(&self, now: DateTime<Utc>) -> StreamId {
        let millis = now.timestamp_millis();
        match self.last_id {
            Some(last) if last.millis >= millis => StreamId {
                millis: last.millis,
                seq: last.seq + 1,
            },
            _ => StreamId { millis, seq: 0 },
        }
    }
}

/// In-process hot store.
pub struct InMemoryHotStore {
    streams: Mutex<HashMap<String, Stream>>,
    max_len: usize,
    ttl: Duration,
    clock: Arc<dyn Clock>,
}

impl InMemoryHotStore {
    pub fn new(max_len: usize, ttl_secs: i64, clock: Arc<dyn Clock>) -> Self {
        Self {
            streams: Mutex::new(HashMap::new()),
            max_len: max_len.max(1),
            ttl: Duration::seconds(ttl_secs),
            clock,
        }
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self::new(DEFAULT_MAX_LEN, DEFAULT_TTL_SECS, clock)
    }

    fn purge_expired(&self, streams: &mut HashMap<String, Stream>) {
        let now = self.clock.now();
        streams.retain(|_, stream| stream.expires_at > now);
    }

    fn entry(key: &str, id: StreamId, event: &EventEnvelope) -> StreamEntry {
        StreamEntry {
            key: key.to_string(),
            id,
            event: event.clone(),
        }
    }
}

impl HotStore for InMemoryHotStore {
    fn append(&self, event: &EventEnvelope) -> Result<StreamEntry> {
        let now = self.clock.now();
        let key = stream_key(&event.agent_id, &event.timestamp);
        let mut streams = self.streams.lock();
        self.purge_expired(&mut streams);

        let stream = streams
            .entry(key.clone())
            .or_insert_with(|| Stream::new(now + self.ttl));
        let id = stream.next_id(now);
        stream.entries.insert(id, event.clone());
        stream.last_id = Some(id);
        stream.expires_at = now + self.ttl;

        while stream.entries.len() > self.max_len {
            if let Some((oldest, _)) = stream.entries.pop_first() {
                for group in stream.groups.values_mut() {
                    group.pending.remove(&oldest);
                }
            }
        }

        Ok(Self::entry(&key, id, event))
    }

    fn range(
        &self,
        key: &str,
        start: Option<StreamId>,
        end: Option<StreamId>,
        count: usize,
    ) -> Result<Vec<StreamEntry>> {
        let mut streams = self.streams.lock();
        self.purge_expired(&mut streams);
        let Some(stream) = streams.get(key) else {
            return Ok(Vec::new());
        };
        Ok(stream
            .entries
            .iter()
            .filter(|(id, _)| start.map_or(true, |s| **id >= s) && end.map_or(true, |e| **id <= e))
            .take(count)
            .map(|(id, event)| Self::entry(key, *id, event))
            .collect())
    }

    fn create_group(&self, key: &str, group: &str) -> Result<()> {
        let now = self.clock.now();
        let mut streams = self.streams.lock();
        self.purge_expired(&mut streams);
        let stream = streams
            .entry(key.to_string())
            .or_insert_with(|| Stream::new(now + self.ttl));
        stream.groups.entry(group.to_string()).or_default();
        Ok(())
    }

    fn read_group(
        &self,
        key: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<StreamEntry>> {
        let mut streams = self.streams.lock();
        self.purge_expired(&mut streams);
        let stream = streams
            .get_mut(key)
            .ok_or_else(|| Error::NotFound(format!("stream {}", key)))?;
        let Stream {
            entries, groups, ..
        } = stream;
        let state = groups
            .get_mut(group)
            .ok_or_else(|| Error::NotFound(format!("consumer group {} on {}", group, key)))?;

        let delivered: Vec<StreamEntry> = entries
            .iter()
            .filter(|(id, _)| state.last_delivered.map_or(true, |last| **id > last))
            .take(count)
            .map(|(id, event)| Self::entry(key, *id, event))
            .collect();
        for entry in &delivered {
            state.pending.insert(entry.id, consumer.to_string());
            state.last_delivered = Some(entry.id);
        }
        Ok(delivered)
    }

    fn ack(&self, key: &str, group: &str, ids: &[StreamId]) -> Result<usize> {
        let mut streams = self.streams.lock();
        let Some(state) = streams
            .get_mut(key)
            .and_then(|stream| stream.groups.get_mut(group))
        else {
            return Ok(0);
        };
        Ok(ids
            .iter()
            .filter(|id| state.pending.remove(id).is_some())
            .count())
    }

    fn pending(&self, key: &str, group: &str) -> Result<usize> {
        let streams = self.streams.lock();
        Ok(streams
            .get(key)
            .and_then(|stream| stream.groups.get(group))
            .map_or(0, |state| state.pending.len()))
    }

    fn entries_older_than(&self, cutoff: DateTime<Utc>, limit: usize) -> Result<Vec<StreamEntry>> {
        let mut streams = self.streams.lock();
        self.purge_expired(&mut streams);

        let mut keys: Vec<&String> = streams.keys().collect();
        keys.sort();
        let mut found = Vec::new();
        for key in keys {
            for (id, event) in &streams[key].entries {
                if found.len() >= limit {
                    return Ok(found);
                }
                if event.timestamp < cutoff {
                    found.push(Self::entry(key, *id, event));
                }
            }
        }
        Ok(found)
    }

    fn delete(&self, key: &str, ids: &[StreamId]) -> Result<usize> {
        let mut streams = self.streams.lock();
        let Some(stream) = streams.get_mut(key) else {
            return Ok(0);
        };
        let mut removed = 0;
        for id in ids {
            if stream.entries.remove(id).is_some() {
                removed += 1;
            }
            for group in stream.groups.values_mut() {
                group.pending.remove(id);
            }
        }
        Ok(removed)
    }

    fn stats(&self) -> Result<HotStoreStats> {
        let mut streams = self.streams.lock();
        self.purge_expired(&mut streams);
        Ok(HotStoreStats {
            streams: streams.len(),
            entries: streams.values().map(|s| s.entries.len()).sum(),
            groups: streams.values().map(|s| s.groups.len()).sum(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::events::{AgentMode, DeviceDetails, DeviceKind};

    fn device_event(agent_id: &str, ts: DateTime<Utc>) -> EventEnvelope {
        EventEnvelope::new_device(
            agent_id,
            AgentMode::Internal,
            ts,
            DeviceDetails {
                kind: DeviceKind::Data,
                device_id: Some("usb-1".into()),
                device_type: None,
            },
            "reading",
        )
    }

    fn store(max_len: usize) -> (Arc<ManualClock>, InMemoryHotStore) {
        let clock = ManualClock::shared(Utc::now());
        let store = InMemoryHotStore::new(max_len, DEFAULT_TTL_SECS, clock.clone());
        (clock, store)
    }

    #[test]
    fn test_ids_strictly_monotonic_within_stream() {
        let (_clock, store) = store(DEFAULT_MAX_LEN);
        let now = Utc::now();
        let ids: Vec<StreamId> = (0..50)
            .map(|_| store.append(&device_event("agent-a", now)).unwrap().id)
            .collect();
        assert!(ids.windows(2).all(|pair| pair[0] < pair[1]));
    }

    #[test]
    fn test_append_trims_to_max_len() {
        let (_clock, store) = store(10);
        let now = Utc::now();
        let mut last = None;
        for _ in 0..25 {
            last = Some(store.append(&device_event("agent-a", now)).unwrap());
        }
        let last = last.unwrap();
        let entries = store.range(&last.key, None, None, 100).unwrap();
        assert_eq!(entries.len(), 10);
        assert_eq!(entries.last().unwrap().id, last.id);
    }

    #[test]
    fn test_idle_streams_expire() {
        let (clock, store) = store(DEFAULT_MAX_LEN);
        store.append(&device_event("agent-a", Utc::now())).unwrap();
        clock.advance(Duration::seconds(DEFAULT_TTL_SECS - 1));
        assert_eq!(store.stats().unwrap().entries, 1);
        clock.advance(Duration::seconds(2));
        assert_eq!(store.stats().unwrap().streams, 0);
    }

    #[test]
    fn test_consumer_group_delivers_once_until_ack() {
        let (_clock, store) = store(DEFAULT_MAX_LEN);
        let now = Utc::now();
        let first = store.append(&device_event("agent-a", now)).unwrap();
        store.append(&device_event("agent-a", now)).unwrap();
        store.create_group(&first.key, "storage").unwrap();
        store.create_group(&first.key, "analytics").unwrap();
        store.create_group(&first.key, "storage").unwrap();

        let batch = store.read_group(&first.key, "storage", "c1", 10).unwrap();
        assert_eq!(batch.len(), 2);
        assert!(store.read_group(&first.key, "storage", "c1", 10).unwrap().is_empty());
        assert_eq!(store.pending(&first.key, "storage").unwrap(), 2);

        // Each group sees the full stream.
        assert_eq!(store.read_group(&first.key, "analytics", "c2", 10).unwrap().len(), 2);

        let ids: Vec<StreamId> = batch.iter().map(|e| e.id).collect();
        assert_eq!(store.ack(&first.key, "storage", &ids).unwrap(), 2);
        assert_eq!(store.pending(&first.key, "storage").unwrap(), 0);
    }

    #[test]
    fn test_read_group_unknown_group_fails() {
        let (_clock, store) = store(DEFAULT_MAX_LEN);
        let entry = store.append(&device_event("agent-a", Utc::now())).unwrap();
        let err = store.read_group(&entry.key, "nobody", "c", 1).unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[test]
    fn test_entries_older_than_uses_event_time() {
        let (_clock, store) = store(DEFAULT_MAX_LEN);
        let now = Utc::now();
        store.append(&device_event("agent-a", now - Duration::hours(2))).unwrap();
        store.append(&device_event("agent-b", now - Duration::hours(2))).unwrap();
        store.append(&device_event("agent-a", now)).unwrap();

        let old = store.entries_older_than(now - Duration::hours(1), 100).unwrap();
        assert_eq!(old.len(), 2);
        for entry in &old {
            assert_eq!(store.delete(&entry.key, &[entry.id]).unwrap(), 1);
        }
        assert!(store
            .entries_older_than(now - Duration::hours(1), 100)
            .unwrap()
            .is_empty());
        assert_eq!(store.stats().unwrap().entries, 1);
    }
}
