//! Broker adapter.
//!
//! Owns the connection lifecycle over a [`BrokerTransport`]: topology
//! declaration, confirmed publishes, consumer loops with ack/nack and
//! poison-message routing, and a reconnect supervisor that restores the
//! channel with linearly growing delays.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::task::JoinHandle;

use crate::config::BrokerConfig;
use crate::error::{Error, Result};
use crate::events::{determine_routing, EventEnvelope, Topology};
use crate::logging::structured::LogContext;
use crate::resilience::CancelToken;
use crate::{log_debug, log_error, log_info, log_warn};

use super::message::{
    priority_for, BrokerHealth, ConnectionState, Delivery, OutboundMessage, PublishConfirm,
};
use super::transport::BrokerTransport;

/// Consumer callback. `Ok` acks the delivery; `Err` nacks it.
#[async_trait]
pub trait DeliveryHandler: Send + Sync {
    async fn handle(&self, delivery: &Delivery) -> Result<()>;
}

/// Anything that can put an accepted event on the bus.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish_event(&self, event: &EventEnvelope) -> Result<PublishConfirm>;
}

/// Returned by [`BrokerAdapter::subscribe`]; cancelling stops the consumer.
#[derive(Debug, Clone)]
pub struct SubscriptionHandle {
    pub id: u64,
    pub queue: String,
    cancel: CancelToken,
}

impl SubscriptionHandle {
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

struct Subscription {
    queue: String,
    cancel: CancelToken,
    task: JoinHandle<()>,
}

struct AdapterInner {
    transport: Arc<dyn BrokerTransport>,
    config: BrokerConfig,
    topology: Topology,
    state: Mutex<ConnectionState>,
    publish_lock: tokio::sync::Mutex<()>,
    subscriptions: Mutex<HashMap<u64, Subscription>>,
    next_subscription: AtomicU64,
    cancel: CancelToken,
    published: AtomicU64,
    publish_failures: AtomicU64,
    reconnects: AtomicU64,
    /// Set when the supervisor ran out of attempts; the next publish or
    /// consume failure starts a fresh one.
    reconnect_exhausted: AtomicBool,
}

#[derive(Clone)]
pub struct BrokerAdapter {
    inner: Arc<AdapterInner>,
}

impl BrokerAdapter {
    pub fn new(transport: Arc<dyn BrokerTransport>, config: BrokerConfig) -> Self {
        let topology = Topology::standard(&config.exchange);
        Self {
            inner: Arc::new(AdapterInner {
                transport,
                config,
                topology,
                state: Mutex::new(ConnectionState::Disconnected),
                publish_lock: tokio::sync::Mutex::new(()),
                subscriptions: Mutex::new(HashMap::new()),
                next_subscription: AtomicU64::new(1),
                cancel: CancelToken::new(),
                published: AtomicU64::new(0),
                publish_failures: AtomicU64::new(0),
                reconnects: AtomicU64::new(0),
                reconnect_exhausted: AtomicBool::new(false),
            }),
        }
    }

    pub fn topology(&self) -> &Topology {
        &self.inner.topology
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.lock()
    }

    /// Open the connection and declare the topology.
    pub async fn connect(&self) -> Result<()> {
        if self.state() == ConnectionState::Closed {
            return Err(Error::FailedPrecondition("broker adapter closed".into()));
        }
        let ctx = LogContext::for_task("broker");
        self.inner.open_and_declare().await?;
        *self.inner.state.lock() = ConnectionState::Connected;
        self.inner.reconnect_exhausted.store(false, Ordering::SeqCst);
        log_info!(
            ctx,
            "BROKER_CONNECTED",
            exchange = self.inner.config.exchange,
            queues = self.inner.topology.queues.len()
        );
        Ok(())
    }

    /// Publish one message and wait for the broker's confirm.
    ///
    /// Fails fast with [`Error::Transient`] while the channel is down. If
    /// an earlier reconnect supervisor gave up, this starts another one.
    pub async fn publish(&self, message: OutboundMessage) -> Result<PublishConfirm> {
        self.inner.publish(message).await
    }

    /// Start a consumer on `queue`.
    pub async fn subscribe(
        &self,
        queue: &str,
        handler: Arc<dyn DeliveryHandler>,
    ) -> Result<SubscriptionHandle> {
        if self.state() == ConnectionState::Closed {
            return Err(Error::FailedPrecondition("broker adapter closed".into()));
        }
        if !self.inner.topology.queues.iter().any(|q| q.name == queue) {
            return Err(Error::NotFound(format!("queue {} is not declared", queue)));
        }

        let id = self.inner.next_subscription.fetch_add(1, Ordering::Relaxed);
        let cancel = self.inner.cancel.child();
        let task = tokio::spawn(consume(
            self.inner.clone(),
            queue.to_string(),
            format!("{}-consumer-{}", queue, id),
            handler,
            cancel.clone(),
        ));
        self.inner.subscriptions.lock().insert(
            id,
            Subscription {
                queue: queue.to_string(),
                cancel: cancel.clone(),
                task,
            },
        );
        log_info!(LogContext::for_task("broker"), "SUBSCRIBED", queue = queue, id = id);
        Ok(SubscriptionHandle {
            id,
            queue: queue.to_string(),
            cancel,
        })
    }

    /// Stop a consumer and wait for it to finish its current delivery.
    pub async fn unsubscribe(&self, handle: &SubscriptionHandle) {
        handle.cancel();
        let subscription = self.inner.subscriptions.lock().remove(&handle.id);
        if let Some(subscription) = subscription {
            let _ = subscription.task.await;
        }
    }

    pub async fn ack(&self, tag: u64) -> Result<()> {
        self.inner.transport.ack(tag).await
    }

    pub async fn nack(&self, tag: u64, requeue: bool) -> Result<()> {
        self.inner.transport.nack(tag, requeue).await
    }

    pub fn health(&self) -> BrokerHealth {
        let subscriptions = self
            .inner
            .subscriptions
            .lock()
            .values()
            .filter(|s| !s.task.is_finished())
            .count();
        BrokerHealth {
            state: self.state(),
            transport_open: self.inner.transport.is_open(),
            published: self.inner.published.load(Ordering::Relaxed),
            publish_failures: self.inner.publish_failures.load(Ordering::Relaxed),
            reconnects: self.inner.reconnects.load(Ordering::Relaxed),
            subscriptions,
        }
    }

    /// Stop consumers and the supervisor, then close the transport.
    /// Later calls are no-ops.
    pub async fn close(&self) {
        {
            let mut state = self.inner.state.lock();
            if *state == ConnectionState::Closed {
                return;
            }
            *state = ConnectionState::Closed;
        }
        self.inner.cancel.cancel();

        let subscriptions: Vec<Subscription> = self
            .inner
            .subscriptions
            .lock()
            .drain()
            .map(|(_, s)| s)
            .collect();
        let deadline = Duration::from_secs(self.inner.config.connection_timeout_secs.max(1));
        for subscription in subscriptions {
            subscription.cancel.cancel();
            if tokio::time::timeout(deadline, subscription.task).await.is_err() {
                log_warn!(
                    LogContext::for_task("broker"),
                    "CONSUMER_DRAIN_TIMEOUT",
                    queue = subscription.queue
                );
            }
        }
        self.inner.transport.close().await;
        log_info!(LogContext::for_task("broker"), "BROKER_CLOSED");
    }
}

impl AdapterInner {
    async fn open_and_declare(&self) -> Result<()> {
        let timeout = Duration::from_secs(self.config.connection_timeout_secs.max(1));
        tokio::time::timeout(timeout, async {
            self.transport.open().await?;
            self.transport.declare(&self.topology).await
        })
        .await
        .map_err(|_| Error::Transient("broker connect timed out".into()))?
    }

    async fn publish(self: &Arc<Self>, message: OutboundMessage) -> Result<PublishConfirm> {
        let state = *self.state.lock();
        match state {
            ConnectionState::Connected => {}
            ConnectionState::Closed => {
                return Err(Error::FailedPrecondition("broker adapter closed".into()))
            }
            _ => {
                self.publish_failures.fetch_add(1, Ordering::Relaxed);
                self.connection_lost();
                return Err(Error::Transient("broker reconnecting".into()));
            }
        }

        let routing_key = message.routing_key.clone();
        let timeout = Duration::from_millis(self.config.publish_timeout_ms.max(1));
        let outcome = {
            let _serial = self.publish_lock.lock().await;
            tokio::time::timeout(timeout, self.transport.publish(&self.config.exchange, message))
                .await
                .unwrap_or_else(|_| Err(Error::Transient("publish confirm timed out".into())))
        };

        match outcome {
            Ok(confirm) => {
                self.published.fetch_add(1, Ordering::Relaxed);
                if !confirm.is_routed() {
                    log_warn!(
                        LogContext::for_task("broker"),
                        "PUBLISH_UNROUTED",
                        routing_key = routing_key
                    );
                }
                Ok(confirm)
            }
            Err(err) => {
                self.publish_failures.fetch_add(1, Ordering::Relaxed);
                if matches!(err, Error::Transient(_)) {
                    self.connection_lost();
                }
                Err(err)
            }
        }
    }

    /// Mark the connection lost and start the reconnect supervisor, once.
    /// An exhausted supervisor is restarted from `Disconnected`.
    fn connection_lost(self: &Arc<Self>) {
        {
            let mut state = self.state.lock();
            let restart = *state == ConnectionState::Disconnected
                && self.reconnect_exhausted.swap(false, Ordering::SeqCst);
            if *state != ConnectionState::Connected && !restart {
                return;
            }
            *state = ConnectionState::Reconnecting;
        }
        log_warn!(LogContext::for_task("broker"), "BROKER_CONNECTION_LOST");
        tokio::spawn(reconnect(self.clone()));
    }
}

async fn reconnect(inner: Arc<AdapterInner>) {
    let ctx = LogContext::for_task("broker_reconnect");
    let max_attempts = inner.config.max_reconnect_attempts.max(1);
    for attempt in 1..=max_attempts {
        let delay = Duration::from_millis(inner.config.reconnect_delay_ms * attempt as u64);
        tokio::select! {
            _ = inner.cancel.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
        match inner.open_and_declare().await {
            Ok(()) => {
                let mut state = inner.state.lock();
                if *state == ConnectionState::Reconnecting {
                    *state = ConnectionState::Connected;
                }
                drop(state);
                inner.reconnects.fetch_add(1, Ordering::Relaxed);
                log_info!(ctx, "BROKER_RECONNECTED", attempt = attempt);
                return;
            }
            Err(err) => {
                log_warn!(
                    ctx,
                    "BROKER_RECONNECT_FAILED",
                    attempt = attempt,
                    max_attempts = max_attempts,
                    error = err.to_string()
                );
            }
        }
    }

    let mut state = inner.state.lock();
    if *state == ConnectionState::Reconnecting {
        *state = ConnectionState::Disconnected;
        inner.reconnect_exhausted.store(true, Ordering::SeqCst);
    }
    drop(state);
    log_error!(ctx, "BROKER_RECONNECT_EXHAUSTED", attempts = max_attempts);
}

async fn consume(
    inner: Arc<AdapterInner>,
    queue: String,
    consumer: String,
    handler: Arc<dyn DeliveryHandler>,
    cancel: CancelToken,
) {
    let ctx = LogContext::for_task(&consumer);
    let idle = Duration::from_millis(inner.config.reconnect_delay_ms.clamp(10, 1_000));
    let mut was_interrupted = false;

    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            next = inner.transport.next_delivery(&queue, &consumer, inner.config.prefetch_count) => next,
        };

        let delivery = match next {
            Ok(delivery) => {
                if was_interrupted {
                    log_info!(ctx, "SUBSCRIPTION_RESTORED", queue = queue);
                    was_interrupted = false;
                }
                delivery
            }
            Err(Error::Transient(reason)) => {
                if !was_interrupted {
                    log_warn!(ctx, "SUBSCRIPTION_INTERRUPTED", queue = queue, reason = reason);
                    was_interrupted = true;
                }
                inner.connection_lost();
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(idle) => continue,
                }
            }
            Err(err) => {
                log_error!(ctx, "CONSUME_FAILED", queue = queue, error = err.to_string());
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(idle) => continue,
                }
            }
        };

        let settled = match handler.handle(&delivery).await {
            Ok(()) => inner.transport.ack(delivery.tag).await,
            Err(err) => {
                let poison = delivery.delivery_count >= inner.config.max_redeliveries.max(1);
                if poison {
                    log_warn!(
                        ctx,
                        "MESSAGE_DEAD_LETTERED",
                        routing_key = delivery.routing_key,
                        deliveries = delivery.delivery_count,
                        error = err.to_string()
                    );
                } else {
                    log_debug!(
                        ctx,
                        "MESSAGE_REQUEUED",
                        routing_key = delivery.routing_key,
                        deliveries = delivery.delivery_count,
                        error = err.to_string()
                    );
                }
                inner.transport.nack(delivery.tag, !poison).await
            }
        };
        if let Err(err) = settled {
            // The broker redelivers anything left unsettled on a lost channel.
            log_warn!(ctx, "SETTLE_FAILED", tag = delivery.tag, error = err.to_string());
        }
    }
    log_debug!(ctx, "CONSUMER_STOPPED", queue = queue);
}

#[async_trait]
impl EventPublisher for BrokerAdapter {
    async fn publish_event(&self, event: &EventEnvelope) -> Result<PublishConfirm> {
        let ctx = LogContext::for_agent(&event.agent_id).with_event(&event.id);
        let routing_key = determine_routing(event, &ctx);
        let message = OutboundMessage::json(
            &routing_key.to_string(),
            serde_json::to_vec(event)?,
            Utc::now(),
        )
        .with_header("event_id", &event.id)
        .with_header("agent_id", &event.agent_id)
        .with_header("event_type", event.event_type.as_str())
        .with_priority(priority_for(event.severity));
        self.publish(message).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use crate::events::{dead_letter_queue, AgentMode, DeviceDetails, DeviceKind};
    use std::sync::atomic::AtomicUsize;

    fn config() -> BrokerConfig {
        BrokerConfig {
            reconnect_delay_ms: 10,
            max_reconnect_attempts: 5,
            ..BrokerConfig::default()
        }
    }

    async fn adapter() -> (Arc<MemoryBroker>, BrokerAdapter) {
        let broker = Arc::new(MemoryBroker::new());
        let adapter = BrokerAdapter::new(broker.clone(), config());
        adapter.connect().await.unwrap();
        (broker, adapter)
    }

    fn device_event() -> EventEnvelope {
        EventEnvelope::new_device(
            "agent-int-0123456789ab",
            AgentMode::Internal,
            Utc::now(),
            DeviceDetails {
                kind: DeviceKind::Connected,
                device_id: None,
                device_type: None,
            },
            "usb attached",
        )
    }

    struct Counting {
        seen: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl DeliveryHandler for Counting {
        async fn handle(&self, _delivery: &Delivery) -> Result<()> {
            self.seen.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(Error::InvalidArgument("poison".into()))
            } else {
                Ok(())
            }
        }
    }

    async fn wait_until<F: Fn() -> bool>(check: F) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_publish_event_uses_routing_key_and_headers() {
        let (broker, adapter) = adapter().await;
        let event = device_event();
        let confirm = adapter.publish_event(&event).await.unwrap();
        assert_eq!(confirm.routed_queues, vec!["device_events".to_string()]);

        let records = broker.published_with_key("device.connected");
        assert_eq!(records.len(), 1);
        assert!(records[0].persistent);
        assert_eq!(records[0].headers.get("event_id"), Some(&event.id));
    }

    #[tokio::test]
    async fn test_handler_success_acks() {
        let (broker, adapter) = adapter().await;
        let handler = Arc::new(Counting {
            seen: AtomicUsize::new(0),
            fail: false,
        });
        adapter.subscribe("device_events", handler.clone()).await.unwrap();
        adapter.publish_event(&device_event()).await.unwrap();

        wait_until(|| handler.seen.load(Ordering::SeqCst) == 1).await;
        wait_until(|| broker.unacked_count("device_events") == 0).await;
        assert_eq!(broker.queue_depth("device_events"), 0);
        adapter.close().await;
    }

    #[tokio::test]
    async fn test_poison_message_reaches_dead_letter_queue() {
        let (broker, adapter) = adapter().await;
        let handler = Arc::new(Counting {
            seen: AtomicUsize::new(0),
            fail: true,
        });
        adapter.subscribe("device_events", handler.clone()).await.unwrap();
        adapter.publish_event(&device_event()).await.unwrap();

        let dlq = dead_letter_queue("device_events");
        wait_until(|| broker.queue_depth(&dlq) == 1).await;
        assert_eq!(handler.seen.load(Ordering::SeqCst), 3);
        assert_eq!(broker.queue_depth("device_events"), 0);
        adapter.close().await;
    }

    #[tokio::test]
    async fn test_reconnect_restores_publish_and_subscriptions() {
        let (broker, adapter) = adapter().await;
        let handler = Arc::new(Counting {
            seen: AtomicUsize::new(0),
            fail: false,
        });
        adapter.subscribe("device_events", handler.clone()).await.unwrap();

        broker.set_available(false);
        broker.drop_connection();
        let err = adapter.publish_event(&device_event()).await.unwrap_err();
        assert!(matches!(err, Error::Transient(_)));
        assert_eq!(adapter.state(), ConnectionState::Reconnecting);

        // Still reconnecting: publishes keep failing fast.
        assert!(adapter.publish_event(&device_event()).await.is_err());

        broker.set_available(true);
        wait_until(|| adapter.state() == ConnectionState::Connected).await;
        adapter.publish_event(&device_event()).await.unwrap();
        wait_until(|| handler.seen.load(Ordering::SeqCst) == 1).await;
        let health = adapter.health();
        assert!(health.reconnects >= 1);
        assert!(health.is_healthy());
        adapter.close().await;
        assert!(!adapter.health().is_healthy());
    }

    #[tokio::test]
    async fn test_publish_restarts_exhausted_supervisor() {
        let broker = Arc::new(MemoryBroker::new());
        let adapter = BrokerAdapter::new(
            broker.clone(),
            BrokerConfig {
                max_reconnect_attempts: 2,
                ..config()
            },
        );
        adapter.connect().await.unwrap();

        broker.set_available(false);
        broker.drop_connection();
        assert!(adapter.publish_event(&device_event()).await.is_err());
        wait_until(|| adapter.state() == ConnectionState::Disconnected).await;
        assert!(!adapter.health().is_healthy());

        broker.set_available(true);
        let err = adapter.publish_event(&device_event()).await.unwrap_err();
        assert!(matches!(err, Error::Transient(_)));
        wait_until(|| adapter.state() == ConnectionState::Connected).await;
        adapter.publish_event(&device_event()).await.unwrap();
        assert!(adapter.health().is_healthy());
        adapter.close().await;
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (_broker, adapter) = adapter().await;
        adapter.close().await;
        adapter.close().await;
        assert_eq!(adapter.state(), ConnectionState::Closed);
        assert!(matches!(
            adapter.publish_event(&device_event()).await,
            Err(Error::FailedPrecondition(_))
        ));
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_consumer() {
        let (broker, adapter) = adapter().await;
        let handler = Arc::new(Counting {
            seen: AtomicUsize::new(0),
            fail: false,
        });
        let handle = adapter.subscribe("device_events", handler.clone()).await.unwrap();
        adapter.unsubscribe(&handle).await;
        adapter.publish_event(&device_event()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(handler.seen.load(Ordering::SeqCst), 0);
        assert_eq!(broker.queue_depth("device_events"), 1);
    }
}
