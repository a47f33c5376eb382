use std::fmt;
use std::sync::Arc;

use tracing::debug;

use super::errors::Result;
use super::transport::{BrokerChannel, DeliveryStream, QueueArguments, QueueInfo};

/// Configuration options for the shared channel
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelConfig {
    /// Number of unacknowledged messages allowed. `None` keeps the broker's
    /// default instead of issuing `basic.qos`.
    pub prefetch_count: Option<u16>,
}

impl ChannelConfig {
    /// Applies the configuration to a freshly opened channel.
    pub(crate) async fn apply(&self, channel: &dyn BrokerChannel) -> Result<()> {
        if let Some(prefetch) = self.prefetch_count {
            debug!("Setting channel QoS to {}", prefetch);
            channel.set_prefetch(prefetch).await?;
        }
        Ok(())
    }
}

/// The channel shared by publishers and consumers of one process.
///
/// Every successful connect produces a handle with a new generation. A
/// handle is never repaired: once its connection dies the connection manager
/// stops handing it out and callers have to fetch the replacement.
#[derive(Clone)]
pub struct ChannelHandle {
    generation: u64,
    channel: Arc<dyn BrokerChannel>,
}

impl ChannelHandle {
    pub(crate) fn new(generation: u64, channel: Arc<dyn BrokerChannel>) -> Self {
        Self {
            generation,
            channel,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_open(&self) -> bool {
        self.channel.is_open()
    }

    pub(crate) async fn declare_queue(
        &self,
        name: &str,
        arguments: &QueueArguments,
    ) -> Result<QueueInfo> {
        self.channel.declare_queue(name, arguments).await
    }

    pub(crate) async fn publish(&self, queue: &str, payload: &[u8]) -> Result<()> {
        self.channel.publish(queue, payload).await
    }

    pub(crate) async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream> {
        self.channel.consume(queue, consumer_tag).await
    }

    pub(crate) async fn close(&self) -> Result<()> {
        self.channel.close().await
    }
}

impl fmt::Debug for ChannelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelHandle")
            .field("generation", &self.generation)
            .field("open", &self.channel.is_open())
            .finish()
    }
}
