//! Boundary between the messaging patterns and the broker client.
//!
//! Everything above this module talks to an [`AmqpChannel`]: one broker connection with a single
//! multiplexed channel. The production implementation lives in [`crate::client`] and wraps lapin;
//! tests swap in a mock or the in-memory broker.

use crate::{
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
#[cfg(any(test, feature = "mocks"))]
use mockall::automock;
use std::{collections::BTreeMap, fmt::Debug, sync::Arc};

pub type DeliveryStream = BoxStream<'static, Result<RawDelivery, AmqpError>>;

pub type SignalHandler = Arc<dyn Fn(BrokerSignal) + Send + Sync>;

/// Close and failure notifications raised by the connection or the channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerSignal {
    /// The connection or the channel was closed.
    Closed,
    /// The broker closed the connection or the channel with an error reply.
    ClosedByBroker(String),
    /// The transport went away (reset, broken pipe, eof).
    ConnectionLost(String),
    /// Any other broker-side failure.
    Error(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishProperties {
    pub content_type: String,
    pub message_id: String,
    pub persistent: bool,
    pub headers: BTreeMap<String, String>,
}

/// Settles exactly one delivery on the broker.
#[async_trait]
pub trait DeliveryAcker: Send + Sync {
    async fn ack(&self) -> Result<(), AmqpError>;
    async fn nack(&self, requeue: bool) -> Result<(), AmqpError>;
}

/// A delivery as pushed by the broker, before decoding.
pub struct RawDelivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub message_id: Option<String>,
    pub headers: BTreeMap<String, String>,
    pub data: Vec<u8>,
    pub acker: Arc<dyn DeliveryAcker>,
}

impl Debug for RawDelivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawDelivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("exchange", &self.exchange)
            .field("routing_key", &self.routing_key)
            .field("redelivered", &self.redelivered)
            .field("message_id", &self.message_id)
            .field("len", &self.data.len())
            .finish()
    }
}

#[cfg_attr(any(test, feature = "mocks"), automock)]
#[async_trait]
pub trait AmqpChannel: Send + Sync {
    /// Caps the unacknowledged deliveries outstanding on the whole channel.
    async fn qos(&self, prefetch: u16) -> Result<(), AmqpError>;

    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError>;

    /// Returns the declared queue name, generated by the broker for anonymous queues.
    async fn declare_queue(&self, def: &QueueDefinition) -> Result<String, AmqpError>;

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError>;

    async fn publish(
        &self,
        exchange: &str,
        key: &str,
        payload: &[u8],
        props: &PublishProperties,
    ) -> Result<(), AmqpError>;

    async fn consume(&self, queue: &str, tag: &str) -> Result<DeliveryStream, AmqpError>;

    fn on_signal(&self, handler: SignalHandler);

    async fn close(&self) -> Result<(), AmqpError>;
}

#[cfg_attr(any(test, feature = "mocks"), automock)]
#[async_trait]
pub trait Connector: Send + Sync {
    /// Opens one connection and one channel on it.
    async fn open(&self, url: &str) -> Result<Arc<dyn AmqpChannel>, AmqpError>;
}
