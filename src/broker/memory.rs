//! In-process durable topic broker.
//!
//! Queues and their contents survive connection loss; unacked deliveries
//! are requeued (flagged redelivered) when the connection drops. Fault
//! hooks let tests cut the connection and refuse reconnects.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::error::{Error, Result};
use crate::events::Topology;

use super::message::{Delivery, OutboundMessage, PublishConfirm};
use super::topic::topic_matches;
use super::transport::BrokerTransport;

/// Upper bound on one wait for a delivery before re-checking state.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone)]
struct Stored {
    message: OutboundMessage,
    delivery_count: u32,
}

#[derive(Debug, Default)]
struct QueueState {
    ready: VecDeque<Stored>,
    dead_letter: Option<String>,
}

#[derive(Debug)]
struct Unacked {
    queue: String,
    consumer: String,
    stored: Stored,
}

/// One accepted publish, kept for inspection.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishRecord {
    pub sequence: u64,
    pub exchange: String,
    pub routing_key: String,
    pub routed_queues: Vec<String>,
    pub headers: std::collections::BTreeMap<String, String>,
    pub persistent: bool,
}

#[derive(Debug, Default)]
struct Inner {
    connected: bool,
    available: bool,
    connections: u64,
    bindings: HashMap<String, Vec<(String, String)>>,
    queues: HashMap<String, QueueState>,
    unacked: HashMap<u64, Unacked>,
    next_tag: u64,
    next_sequence: u64,
    published: Vec<PublishRecord>,
}

impl Inner {
    fn requeue_unacked(&mut self) {
        let mut pending: Vec<(u64, Unacked)> = self.unacked.drain().collect();
        // Preserve original delivery order when putting messages back.
        pending.sort_by_key(|(tag, _)| std::cmp::Reverse(*tag));
        for (_, unacked) in pending {
            if let Some(queue) = self.queues.get_mut(&unacked.queue) {
                queue.ready.push_front(unacked.stored);
            }
        }
    }

    fn dead_letter(&mut self, queue: &str, mut stored: Stored) {
        let target = self
            .queues
            .get(queue)
            .and_then(|state| state.dead_letter.clone());
        if let Some(target) = target {
            stored.delivery_count = 0;
            stored
                .message
                .headers
                .insert("x-first-death-queue".to_string(), queue.to_string());
            self.queues
                .entry(target)
                .or_default()
                .ready
                .push_back(stored);
        }
    }
}

pub struct MemoryBroker {
    inner: Mutex<Inner>,
    notify: Notify,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                available: true,
                next_tag: 1,
                next_sequence: 1,
                ..Inner::default()
            }),
            notify: Notify::new(),
        }
    }

    /// Simulate a network cut: the connection closes and unacked
    /// deliveries return to their queues.
    pub fn drop_connection(&self) {
        let mut inner = self.inner.lock();
        inner.connected = false;
        inner.requeue_unacked();
        drop(inner);
        self.notify.notify_waiters();
    }

    /// While unavailable, `open` fails.
    pub fn set_available(&self, available: bool) {
        self.inner.lock().available = available;
    }

    /// Successful `open` calls so far.
    pub fn connection_count(&self) -> u64 {
        self.inner.lock().connections
    }

    pub fn published(&self) -> Vec<PublishRecord> {
        self.inner.lock().published.clone()
    }

    pub fn published_with_key(&self, routing_key: &str) -> Vec<PublishRecord> {
        self.inner
            .lock()
            .published
            .iter()
            .filter(|record| record.routing_key == routing_key)
            .cloned()
            .collect()
    }

    /// Messages ready for delivery on `queue`.
    pub fn queue_depth(&self, queue: &str) -> usize {
        self.inner
            .lock()
            .queues
            .get(queue)
            .map_or(0, |state| state.ready.len())
    }

    pub fn unacked_count(&self, queue: &str) -> usize {
        self.inner
            .lock()
            .unacked
            .values()
            .filter(|unacked| unacked.queue == queue)
            .count()
    }

    /// Ready messages on `queue`, oldest first.
    pub fn peek(&self, queue: &str) -> Vec<OutboundMessage> {
        self.inner
            .lock()
            .queues
            .get(queue)
            .map(|state| state.ready.iter().map(|s| s.message.clone()).collect())
            .unwrap_or_default()
    }

    pub fn has_queue(&self, queue: &str) -> bool {
        self.inner.lock().queues.contains_key(queue)
    }

    fn try_take(&self, queue: &str, consumer: &str, prefetch: u16) -> Result<Option<Delivery>> {
        let mut inner = self.inner.lock();
        if !inner.connected {
            return Err(Error::Transient("broker connection closed".to_string()));
        }
        if !inner.queues.contains_key(queue) {
            return Err(Error::NotFound(format!("queue {}", queue)));
        }
        let in_flight = inner
            .unacked
            .values()
            .filter(|unacked| unacked.consumer == consumer)
            .count();
        if in_flight >= prefetch.max(1) as usize {
            return Ok(None);
        }
        let Some(mut stored) = inner.queues.get_mut(queue).and_then(|q| q.ready.pop_front()) else {
            return Ok(None);
        };

        stored.delivery_count += 1;
        let tag = inner.next_tag;
        inner.next_tag += 1;
        let delivery = Delivery {
            tag,
            queue: queue.to_string(),
            routing_key: stored.message.routing_key.clone(),
            body: stored.message.body.clone(),
            headers: stored.message.headers.clone(),
            redelivered: stored.delivery_count > 1,
            delivery_count: stored.delivery_count,
        };
        inner.unacked.insert(
            tag,
            Unacked {
                queue: queue.to_string(),
                consumer: consumer.to_string(),
                stored,
            },
        );
        Ok(Some(delivery))
    }

    fn settle(&self, tag: u64) -> Result<Unacked> {
        let mut inner = self.inner.lock();
        if !inner.connected {
            return Err(Error::Transient("broker connection closed".to_string()));
        }
        inner
            .unacked
            .remove(&tag)
            .ok_or_else(|| Error::FailedPrecondition(format!("unknown delivery tag {}", tag)))
    }
}

#[async_trait]
impl BrokerTransport for MemoryBroker {
    async fn open(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if !inner.available {
            return Err(Error::Transient("broker unavailable".to_string()));
        }
        if !inner.connected {
            inner.connected = true;
            inner.connections += 1;
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.inner.lock().connected
    }

    async fn declare(&self, topology: &Topology) -> Result<()> {
        let mut inner = self.inner.lock();
        if !inner.connected {
            return Err(Error::Transient("broker connection closed".to_string()));
        }
        for spec in &topology.queues {
            if let Some(dlq) = &spec.dead_letter {
                inner.queues.entry(dlq.clone()).or_default();
            }
            let state = inner.queues.entry(spec.name.clone()).or_default();
            state.dead_letter = spec.dead_letter.clone();

            let bindings = inner.bindings.entry(topology.exchange.clone()).or_default();
            for pattern in &spec.bindings {
                let binding = (pattern.clone(), spec.name.clone());
                if !bindings.contains(&binding) {
                    bindings.push(binding);
                }
            }
        }
        Ok(())
    }

    async fn publish(&self, exchange: &str, message: OutboundMessage) -> Result<PublishConfirm> {
        let mut inner = self.inner.lock();
        if !inner.connected {
            return Err(Error::Transient("broker connection closed".to_string()));
        }
        let bindings = inner
            .bindings
            .get(exchange)
            .ok_or_else(|| Error::NotFound(format!("exchange {}", exchange)))?;

        let mut routed: Vec<String> = bindings
            .iter()
            .filter(|(pattern, _)| topic_matches(pattern, &message.routing_key))
            .map(|(_, queue)| queue.clone())
            .collect();
        routed.sort();
        routed.dedup();

        for queue in &routed {
            inner.queues.entry(queue.clone()).or_default().ready.push_back(Stored {
                message: message.clone(),
                delivery_count: 0,
            });
        }

        let sequence = inner.next_sequence;
        inner.next_sequence += 1;
        inner.published.push(PublishRecord {
            sequence,
            exchange: exchange.to_string(),
            routing_key: message.routing_key.clone(),
            routed_queues: routed.clone(),
            headers: message.headers.clone(),
            persistent: message.persistent,
        });
        drop(inner);
        self.notify.notify_waiters();

        Ok(PublishConfirm {
            sequence,
            routed_queues: routed,
        })
    }

    async fn next_delivery(&self, queue: &str, consumer: &str, prefetch: u16) -> Result<Delivery> {
        loop {
            let notified = self.notify.notified();
            if let Some(delivery) = self.try_take(queue, consumer, prefetch)? {
                return Ok(delivery);
            }
            let _ = tokio::time::timeout(POLL_INTERVAL, notified).await;
        }
    }

    async fn ack(&self, tag: u64) -> Result<()> {
        self.settle(tag)?;
        self.notify.notify_waiters();
        Ok(())
    }

    async fn nack(&self, tag: u64, requeue: bool) -> Result<()> {
        let unacked = self.settle(tag)?;
        let mut inner = self.inner.lock();
        if requeue {
            if let Some(queue) = inner.queues.get_mut(&unacked.queue) {
                queue.ready.push_front(unacked.stored);
            }
        } else {
            inner.dead_letter(&unacked.queue, unacked.stored);
        }
        drop(inner);
        self.notify.notify_waiters();
        Ok(())
    }

    async fn close(&self) {
        let mut inner = self.inner.lock();
        inner.connected = false;
        inner.requeue_unacked();
        drop(inner);
        self.notify.notify_waiters();
    }
}
