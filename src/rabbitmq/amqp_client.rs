// src/rabbitmq/amqp_client.rs

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
    acker::Acker,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
        BasicRejectOptions, QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use tracing::{debug, warn};

use super::errors::{BrokerError, Result};
use super::transport::{
    BrokerChannel, BrokerConnection, Connector, Delivery, DeliveryAcker, DeliveryStream,
    ErrorHandler, QueueArguments, QueueInfo,
};

const PERSISTENT: u8 = 2;

/// Opens lapin connections.
#[derive(Debug, Clone, Default)]
pub struct LapinConnector;

#[async_trait]
impl Connector for LapinConnector {
    async fn connect(&self, uri: &str) -> Result<Box<dyn BrokerConnection>> {
        let connection = Connection::connect(uri, ConnectionProperties::default())
            .await
            .map_err(|e| BrokerError::ConnectionError(format!("Failed to connect: {}", e)))?;

        Ok(Box::new(LapinConnection { connection }))
    }
}

pub struct LapinConnection {
    connection: Connection,
}

#[async_trait]
impl BrokerConnection for LapinConnection {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>> {
        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(|e| BrokerError::ChannelError(format!("Failed to create channel: {}", e)))?;

        Ok(Arc::new(LapinChannel { channel }))
    }

    fn on_error(&self, mut handler: ErrorHandler) {
        self.connection.on_error(move |err| {
            handler(BrokerError::ConnectionLost(err.to_string()));
        });
    }

    async fn close(&self) -> Result<()> {
        if !self.connection.status().connected() {
            return Ok(());
        }
        self.connection.close(200, "Normal shutdown").await?;
        Ok(())
    }
}

pub struct LapinChannel {
    channel: Channel,
}

fn declare_arguments(arguments: &QueueArguments) -> FieldTable {
    let mut table = FieldTable::default();
    if let Some(dead_letter_queue) = &arguments.dead_letter_queue {
        // the default exchange routes by queue name
        table.insert(
            "x-dead-letter-exchange".into(),
            AMQPValue::LongString("".into()),
        );
        table.insert(
            "x-dead-letter-routing-key".into(),
            AMQPValue::LongString(dead_letter_queue.as_str().into()),
        );
    }
    table
}

#[async_trait]
impl BrokerChannel for LapinChannel {
    async fn declare_queue(&self, name: &str, arguments: &QueueArguments) -> Result<QueueInfo> {
        let queue = self
            .channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable: arguments.durable,
                    ..QueueDeclareOptions::default()
                },
                declare_arguments(arguments),
            )
            .await
            .map_err(|e| BrokerError::from_declare(name, e))?;

        Ok(QueueInfo {
            name: queue.name().as_str().to_string(),
            message_count: queue.message_count(),
            consumer_count: queue.consumer_count(),
        })
    }

    async fn publish(&self, queue: &str, payload: &[u8]) -> Result<()> {
        let properties = BasicProperties::default()
            .with_content_type("application/json".into())
            .with_delivery_mode(PERSISTENT);

        // The returned confirmation is dropped: delivery is fire-and-forget
        // once the frame has been written.
        self.channel
            .basic_publish(
                "",
                queue,
                BasicPublishOptions::default(),
                payload,
                properties,
            )
            .await
            .map_err(|e| BrokerError::PublishError(e.to_string()))?;

        Ok(())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::ConsumeError(e.to_string()))?;

        debug!(queue, consumer_tag, "lapin consumer registered");

        let stream = consumer.map(|delivery| match delivery {
            Ok(delivery) => Ok(Delivery::new(
                delivery.delivery_tag,
                delivery.redelivered,
                delivery.data,
                Box::new(LapinAcker {
                    acker: delivery.acker,
                }),
            )),
            Err(e) => Err(BrokerError::from(e)),
        });

        Ok(stream.boxed())
    }

    async fn set_prefetch(&self, count: u16) -> Result<()> {
        self.channel
            .basic_qos(count, BasicQosOptions::default())
            .await
            .map_err(|e| BrokerError::ChannelError(format!("Failed to set QoS: {}", e)))
    }

    fn is_open(&self) -> bool {
        self.channel.status().connected()
    }

    async fn close(&self) -> Result<()> {
        if !self.channel.status().connected() {
            return Ok(());
        }
        if let Err(e) = self.channel.close(200, "Normal shutdown").await {
            warn!("Failed to close channel cleanly: {}", e);
        }
        Ok(())
    }
}

struct LapinAcker {
    acker: Acker,
}

#[async_trait]
impl DeliveryAcker for LapinAcker {
    async fn ack(&self) -> Result<()> {
        self.acker
            .ack(BasicAckOptions::default())
            .await
            .map_err(|e| BrokerError::AckError(e.to_string()))?;
        Ok(())
    }

    async fn reject(&self, requeue: bool) -> Result<()> {
        self.acker
            .reject(BasicRejectOptions { requeue })
            .await
            .map_err(|e| BrokerError::AckError(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lapin::types::ShortString;

    #[test]
    fn plain_queues_carry_no_arguments() {
        let table = declare_arguments(&QueueArguments {
            durable: true,
            dead_letter_queue: None,
        });

        assert!(table.inner().is_empty());
    }

    #[test]
    fn dead_letter_routes_through_default_exchange() {
        let table = declare_arguments(&QueueArguments {
            durable: true,
            dead_letter_queue: Some("orders.dead".to_string()),
        });

        let inner = table.inner();
        assert_eq!(inner.len(), 2);
        assert_eq!(
            inner.get(&ShortString::from("x-dead-letter-routing-key")),
            Some(&AMQPValue::LongString("orders.dead".into()))
        );
        assert_eq!(
            inner.get(&ShortString::from("x-dead-letter-exchange")),
            Some(&AMQPValue::LongString("".into()))
        );
    }
}
