//! Queue declaration.
//!
//! Declarations are scoped to a channel's session, so the connection manager
//! replays every registered [`QueueSpec`] after each successful connect.

use tracing::{error, info};

use super::channel_manager::ChannelHandle;
use super::errors::{BrokerError, Result};
use super::transport::{QueueArguments, QueueInfo};

/// A queue the process depends on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    name: String,
    arguments: QueueArguments,
}

impl QueueSpec {
    pub fn new(name: impl Into<String>, durable: bool) -> Self {
        Self {
            name: name.into(),
            arguments: QueueArguments {
                durable,
                dead_letter_queue: None,
            },
        }
    }

    /// A queue that survives broker restarts.
    pub fn durable(name: impl Into<String>) -> Self {
        Self::new(name, true)
    }

    /// Routes messages rejected without requeue to `queue` instead of
    /// discarding them.
    pub fn with_dead_letter(mut self, queue: impl Into<String>) -> Self {
        self.arguments.dead_letter_queue = Some(queue.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn arguments(&self) -> &QueueArguments {
        &self.arguments
    }

    pub fn dead_letter_queue(&self) -> Option<&str> {
        self.arguments.dead_letter_queue.as_deref()
    }
}

/// Asserts that `spec` exists on the broker with exactly these arguments.
///
/// Redeclaring with identical arguments is a no-op on the broker. A queue that
/// already exists with other arguments yields [`BrokerError::QueueMismatch`].
pub async fn ensure_queue(channel: &ChannelHandle, spec: &QueueSpec) -> Result<QueueInfo> {
    if let Some(dead_letter_queue) = spec.dead_letter_queue() {
        let target = QueueSpec::durable(dead_letter_queue);
        declare(channel, &target).await?;
    }
    declare(channel, spec).await
}

async fn declare(channel: &ChannelHandle, spec: &QueueSpec) -> Result<QueueInfo> {
    info!("About to declare queue: {}", spec.name());

    match channel.declare_queue(spec.name(), spec.arguments()).await {
        Ok(queue) => {
            info!(
                queue = %queue.name,
                durable = spec.arguments().durable,
                messages = queue.message_count,
                consumers = queue.consumer_count,
                "Queue declared"
            );
            Ok(queue)
        }
        Err(e @ BrokerError::QueueMismatch { .. }) => {
            error!(
                queue = spec.name(),
                "Queue configuration conflict, operator action required: {}", e
            );
            Err(e)
        }
        Err(e) => {
            error!(queue = spec.name(), "Failed to declare queue: {}", e);
            Err(e)
        }
    }
}
