//! Broker seam.
//!
//! The connection manager, declarer, publisher and consumer only talk to the
//! broker through these traits. `amqp_client` implements them on top of
//! lapin; `memory` implements them in-process for tests and local runs.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;

use super::errors::Result;
use super::BrokerError;

/// Stream of deliveries for one consumer. Ends (optionally after an error
/// item) when the consumer is cancelled or its channel goes away.
pub type DeliveryStream = BoxStream<'static, Result<Delivery>>;

/// Callback invoked when a connection fails at the transport level.
pub type ErrorHandler = Box<dyn FnMut(BrokerError) + Send + 'static>;

/// Opens connections to a broker address.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, uri: &str) -> Result<Box<dyn BrokerConnection>>;
}

/// A live transport session to the broker.
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>>;

    /// Registers a callback for transport-level failures (broker restart,
    /// network partition, heartbeat timeout).
    fn on_error(&self, handler: ErrorHandler);

    async fn close(&self) -> Result<()>;
}

/// Arguments a queue is declared with.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueArguments {
    pub durable: bool,
    pub dead_letter_queue: Option<String>,
}

/// What the broker reports back from a declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueInfo {
    pub name: String,
    pub message_count: u32,
    pub consumer_count: u32,
}

/// A logical session multiplexed over a connection.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    async fn declare_queue(&self, name: &str, arguments: &QueueArguments) -> Result<QueueInfo>;

    /// Sends `payload` to `queue` through the default exchange.
    async fn publish(&self, queue: &str, payload: &[u8]) -> Result<()>;

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream>;

    async fn set_prefetch(&self, count: u16) -> Result<()>;

    fn is_open(&self) -> bool;

    async fn close(&self) -> Result<()>;
}

/// Settles a single delivery on the channel it arrived on.
#[async_trait]
pub trait DeliveryAcker: Send + Sync {
    async fn ack(&self) -> Result<()>;
    async fn reject(&self, requeue: bool) -> Result<()>;
}

/// One delivered message.
///
/// `ack` and `reject` take `self`, so a delivery can be settled at most once
/// and its handle cannot outlive the processing of that delivery.
pub struct Delivery {
    delivery_tag: u64,
    redelivered: bool,
    data: Vec<u8>,
    acker: Box<dyn DeliveryAcker>,
}

impl Delivery {
    pub fn new(
        delivery_tag: u64,
        redelivered: bool,
        data: Vec<u8>,
        acker: Box<dyn DeliveryAcker>,
    ) -> Self {
        Self {
            delivery_tag,
            redelivered,
            data,
            acker,
        }
    }

    pub fn delivery_tag(&self) -> u64 {
        self.delivery_tag
    }

    pub fn redelivered(&self) -> bool {
        self.redelivered
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub async fn ack(self) -> Result<()> {
        self.acker.ack().await
    }

    pub async fn reject(self, requeue: bool) -> Result<()> {
        self.acker.reject(requeue).await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("redelivered", &self.redelivered)
            .field("len", &self.data.len())
            .finish()
    }
}
