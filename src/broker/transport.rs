//! Transport seam between the adapter and a concrete broker.

use async_trait::async_trait;

use crate::error::Result;
use crate::events::Topology;

use super::message::{Delivery, OutboundMessage, PublishConfirm};

/// A durable topic broker connection.
///
/// Operations on a lost connection fail with
/// [`Error::Transient`](crate::error::Error::Transient) until `open`
/// succeeds again.
#[async_trait]
pub trait BrokerTransport: Send + Sync {
    /// Open (or reopen) the connection and channel.
    async fn open(&self) -> Result<()>;

    fn is_open(&self) -> bool;

    /// Declare the exchange, queues, bindings and dead-letter queues.
    async fn declare(&self, topology: &Topology) -> Result<()>;

    /// Publish with confirms; resolves once the routed queues hold the message.
    async fn publish(&self, exchange: &str, message: OutboundMessage) -> Result<PublishConfirm>;

    /// Wait for the next message on `queue` for `consumer`.
    async fn next_delivery(&self, queue: &str, consumer: &str, prefetch: u16) -> Result<Delivery>;

    async fn ack(&self, tag: u64) -> Result<()>;

    async fn nack(&self, tag: u64, requeue: bool) -> Result<()>;

    async fn close(&self);
}
