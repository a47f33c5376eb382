use serde::Serialize;
use tracing::{debug, error, warn};

use super::connection::ConnectionManager;
use super::errors::{BrokerError, Result};

/// Publishes JSON messages to queues through the default exchange.
///
/// Publishing never waits for a connection. While the manager is
/// disconnected the message is dropped and [`BrokerError::NotConnected`] is
/// returned; callers that cannot lose the message must retry themselves.
#[derive(Clone)]
pub struct Publisher {
    manager: ConnectionManager,
}

impl Publisher {
    pub fn new(manager: ConnectionManager) -> Self {
        Self { manager }
    }

    pub async fn publish<T>(&self, queue: &str, message: &T) -> Result<()>
    where
        T: Serialize + ?Sized,
    {
        let payload = serde_json::to_vec(message).map_err(|e| {
            error!(queue, "Failed to serialize message: {}", e);
            BrokerError::from(e)
        })?;

        let Some(channel) = self.manager.current_channel() else {
            warn!(queue, "Cannot publish, RabbitMQ channel not available");
            return Err(BrokerError::NotConnected);
        };

        match channel.publish(queue, &payload).await {
            Ok(()) => {
                debug!(
                    queue,
                    bytes = payload.len(),
                    generation = channel.generation(),
                    "Message published"
                );
                Ok(())
            }
            Err(e) => {
                error!(queue, "Failed to publish message: {}", e);
                Err(e)
            }
        }
    }
}
