//! Message consumption.
//!
//! Each subscription gets one worker task per connection generation. The
//! worker drains its delivery stream sequentially, so deliveries of a queue
//! are handled in the order the broker sent them.
//!
//! Per delivery:
//! 1. deserialize the JSON payload; malformed payloads are rejected without
//!    requeue (poison messages are never redelivered),
//! 2. run the handler,
//! 3. ack on success, reject without requeue on failure or panic.

use std::any::Any;
use std::future::Future;
use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::{FutureExt, StreamExt};
use serde::de::DeserializeOwned;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::channel_manager::ChannelHandle;
use super::connection::ConnectionManager;
use super::declarer::QueueSpec;
use super::errors::{BrokerError, Result};
use super::transport::{Delivery, DeliveryStream};

/// Domain logic run for every message of a subscribed queue.
///
/// Returning an error rejects the message without requeue.
#[async_trait]
pub trait MessageHandler<T: Send + 'static>: Send + Sync + 'static {
    async fn handle(&self, message: T) -> anyhow::Result<()>;
}

/// Adapts an async closure into a [`MessageHandler`].
pub struct FnHandler<F>(F);

pub fn handler_fn<F>(f: F) -> FnHandler<F> {
    FnHandler(f)
}

#[async_trait]
impl<T, F, Fut> MessageHandler<T> for FnHandler<F>
where
    T: Send + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(&self, message: T) -> anyhow::Result<()> {
        (self.0)(message).await
    }
}

#[derive(Debug)]
pub(crate) enum HandlingError {
    Malformed(serde_json::Error),
    Failed(anyhow::Error),
}

/// Type-erased handler working on raw payloads.
#[async_trait]
pub(crate) trait DeliveryHandler: Send + Sync {
    async fn handle_payload(&self, payload: &[u8]) -> std::result::Result<(), HandlingError>;
}

struct TypedHandler<T, H> {
    handler: H,
    _message: PhantomData<fn() -> T>,
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[async_trait]
impl<T, H> DeliveryHandler for TypedHandler<T, H>
where
    T: DeserializeOwned + Send + 'static,
    H: MessageHandler<T>,
{
    async fn handle_payload(&self, payload: &[u8]) -> std::result::Result<(), HandlingError> {
        let message: T = serde_json::from_slice(payload).map_err(HandlingError::Malformed)?;

        match AssertUnwindSafe(self.handler.handle(message))
            .catch_unwind()
            .await
        {
            Ok(result) => result.map_err(HandlingError::Failed),
            Err(panic) => Err(HandlingError::Failed(anyhow::anyhow!(
                "handler panicked: {}",
                panic_message(panic.as_ref())
            ))),
        }
    }
}

/// A queue together with the handler for its messages.
#[derive(Clone)]
pub struct Subscription {
    queue: QueueSpec,
    handler: Arc<dyn DeliveryHandler>,
}

impl Subscription {
    pub fn new<T, H>(queue: QueueSpec, handler: H) -> Self
    where
        T: DeserializeOwned + Send + 'static,
        H: MessageHandler<T>,
    {
        Self {
            queue,
            handler: Arc::new(TypedHandler {
                handler,
                _message: PhantomData,
            }),
        }
    }

    pub fn queue(&self) -> &QueueSpec {
        &self.queue
    }
}

/// Why a delivery was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    Malformed,
    HandlerFailed,
}

/// What happened to one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Acked,
    Rejected(RejectReason),
    /// The broker could not be told; it will redeliver once the channel is gone.
    SettleFailed,
}

/// Runs the handler for one delivery and settles it exactly once.
pub(crate) async fn process_delivery(
    queue: &str,
    delivery: Delivery,
    handler: &dyn DeliveryHandler,
) -> DeliveryOutcome {
    let delivery_tag = delivery.delivery_tag();
    if delivery.redelivered() {
        debug!(queue, delivery_tag, "Processing redelivered message");
    }

    let handled = handler.handle_payload(delivery.data()).await;
    let (settled, outcome) = match handled {
        Ok(()) => (delivery.ack().await, DeliveryOutcome::Acked),
        Err(HandlingError::Malformed(e)) => {
            error!(queue, delivery_tag, "Failed to deserialize message, dropping it: {}", e);
            (
                delivery.reject(false).await,
                DeliveryOutcome::Rejected(RejectReason::Malformed),
            )
        }
        Err(HandlingError::Failed(e)) => {
            error!(queue, delivery_tag, "Error processing message, dropping it: {:#}", e);
            (
                delivery.reject(false).await,
                DeliveryOutcome::Rejected(RejectReason::HandlerFailed),
            )
        }
    };

    match settled {
        Ok(()) => outcome,
        Err(e) => {
            error!(queue, delivery_tag, "Failed to settle message: {}", e);
            DeliveryOutcome::SettleFailed
        }
    }
}

/// Drains `deliveries` until the stream fails or ends, then calls `on_end`.
pub(crate) async fn consume_loop<F>(
    queue: String,
    mut deliveries: DeliveryStream,
    handler: Arc<dyn DeliveryHandler>,
    on_end: F,
) where
    F: FnOnce(BrokerError) + Send,
{
    while let Some(item) = deliveries.next().await {
        match item {
            Ok(delivery) => {
                process_delivery(&queue, delivery, handler.as_ref()).await;
            }
            Err(e) => {
                error!(queue = %queue, "Error receiving message: {}", e);
                on_end(e);
                return;
            }
        }
    }

    warn!(queue = %queue, "Consumer stream ended");
    on_end(BrokerError::ConsumeError(format!(
        "consumer for queue '{}' was cancelled",
        queue
    )));
}

/// Registers a broker consumer for `subscription` on `channel` and spawns its worker.
pub(crate) async fn start<F>(
    channel: &ChannelHandle,
    subscription: &Subscription,
    on_end: F,
) -> Result<JoinHandle<()>>
where
    F: FnOnce(BrokerError) + Send + 'static,
{
    let queue = subscription.queue.name().to_string();
    let suffix = Uuid::new_v4().simple().to_string();
    let consumer_tag = format!("{}-consumer-{}", queue, &suffix[..8]);

    let deliveries = channel.consume(&queue, &consumer_tag).await?;
    info!(
        queue = %queue,
        consumer_tag = %consumer_tag,
        generation = channel.generation(),
        "Started consuming from queue"
    );

    let handler = Arc::clone(&subscription.handler);
    Ok(tokio::spawn(consume_loop(queue, deliveries, handler, on_end)))
}

/// Subscribes handlers to queues through a [`ConnectionManager`].
#[derive(Clone)]
pub struct Consumer {
    manager: ConnectionManager,
}

impl Consumer {
    pub fn new(manager: ConnectionManager) -> Self {
        Self { manager }
    }

    /// Subscribes `handler` to `queue`. The subscription is (re-)established
    /// after every successful connect until the manager shuts down.
    pub async fn subscribe<T, H>(&self, queue: QueueSpec, handler: H) -> Result<()>
    where
        T: DeserializeOwned + Send + 'static,
        H: MessageHandler<T>,
    {
        self.manager
            .subscribe(Subscription::new(queue, handler))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rabbitmq::memory::MemoryBroker;
    use crate::rabbitmq::transport::{BrokerChannel, Connector, QueueArguments};
    use serde::Deserialize;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Deserialize)]
    struct Order {
        id: String,
        qty: u32,
    }

    struct Recording {
        seen: Arc<std::sync::Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl MessageHandler<Order> for Recording {
        async fn handle(&self, order: Order) -> anyhow::Result<()> {
            if order.qty == 0 {
                anyhow::bail!("order {} has no items", order.id);
            }
            self.seen.lock().unwrap().push(order.id);
            Ok(())
        }
    }

    async fn channel_with_queue(broker: &MemoryBroker) -> Arc<dyn BrokerChannel> {
        let connection = broker.connect("memory://").await.unwrap();
        let channel = connection.create_channel().await.unwrap();
        channel
            .declare_queue(
                "orders",
                &QueueArguments {
                    durable: true,
                    dead_letter_queue: None,
                },
            )
            .await
            .unwrap();
        channel
    }

    async fn next_outcome(
        stream: &mut DeliveryStream,
        subscription: &Subscription,
    ) -> DeliveryOutcome {
        let delivery = stream.next().await.unwrap().unwrap();
        process_delivery("orders", delivery, subscription.handler.as_ref()).await
    }

    fn recording() -> (Subscription, Arc<std::sync::Mutex<Vec<String>>>) {
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let subscription = Subscription::new(
            QueueSpec::durable("orders"),
            Recording {
                seen: Arc::clone(&seen),
            },
        );
        (subscription, seen)
    }

    #[tokio::test]
    async fn successful_handler_acks_once() {
        let broker = MemoryBroker::new();
        let channel = channel_with_queue(&broker).await;
        let (subscription, seen) = recording();
        channel.publish("orders", br#"{"id":"42","qty":3}"#).await.unwrap();

        let mut stream = channel.consume("orders", "test").await.unwrap();
        let outcome = next_outcome(&mut stream, &subscription).await;

        assert_eq!(outcome, DeliveryOutcome::Acked);
        assert_eq!(*seen.lock().unwrap(), vec!["42".to_string()]);
        assert_eq!(broker.acked_count("orders"), 1);
        assert_eq!(broker.unacked_count("orders"), 0);
        assert_eq!(broker.ready_count("orders"), 0);
    }

    #[tokio::test]
    async fn malformed_payload_is_rejected_without_requeue() {
        let broker = MemoryBroker::new();
        let channel = channel_with_queue(&broker).await;
        let (subscription, seen) = recording();
        channel.publish("orders", b"{not json").await.unwrap();

        let mut stream = channel.consume("orders", "test").await.unwrap();
        let outcome = next_outcome(&mut stream, &subscription).await;

        assert_eq!(outcome, DeliveryOutcome::Rejected(RejectReason::Malformed));
        assert!(seen.lock().unwrap().is_empty());
        assert_eq!(broker.ready_count("orders"), 0);
        assert_eq!(broker.discarded().len(), 1);
    }

    #[tokio::test]
    async fn handler_failure_is_rejected_without_requeue() {
        let broker = MemoryBroker::new();
        let channel = channel_with_queue(&broker).await;
        let (subscription, _) = recording();
        channel.publish("orders", br#"{"id":"7","qty":0}"#).await.unwrap();

        let mut stream = channel.consume("orders", "test").await.unwrap();
        let outcome = next_outcome(&mut stream, &subscription).await;

        assert_eq!(outcome, DeliveryOutcome::Rejected(RejectReason::HandlerFailed));
        assert_eq!(broker.ready_count("orders"), 0);
        assert_eq!(broker.unacked_count("orders"), 0);
        assert_eq!(broker.acked_count("orders"), 0);
    }

    #[tokio::test]
    async fn panicking_handler_counts_as_failure() {
        let broker = MemoryBroker::new();
        let channel = channel_with_queue(&broker).await;
        let subscription = Subscription::new(
            QueueSpec::durable("orders"),
            handler_fn(|_order: Order| async move {
                if true {
                    panic!("boom");
                }
                Ok::<(), anyhow::Error>(())
            }),
        );
        channel.publish("orders", br#"{"id":"1","qty":1}"#).await.unwrap();

        let mut stream = channel.consume("orders", "test").await.unwrap();
        let outcome = next_outcome(&mut stream, &subscription).await;

        assert_eq!(outcome, DeliveryOutcome::Rejected(RejectReason::HandlerFailed));
        assert_eq!(broker.discarded().len(), 1);
    }

    #[tokio::test]
    async fn settling_after_connection_loss_reports_failure() {
        let broker = MemoryBroker::new();
        let channel = channel_with_queue(&broker).await;
        let (subscription, _) = recording();
        channel.publish("orders", br#"{"id":"9","qty":1}"#).await.unwrap();

        let mut stream = channel.consume("orders", "test").await.unwrap();
        let delivery = stream.next().await.unwrap().unwrap();
        broker.drop_connections();

        let outcome = process_delivery("orders", delivery, subscription.handler.as_ref()).await;
        assert_eq!(outcome, DeliveryOutcome::SettleFailed);
        assert_eq!(broker.ready_count("orders"), 1);
    }

    #[tokio::test]
    async fn consume_loop_preserves_order_and_reports_end() {
        let broker = MemoryBroker::new();
        let channel = channel_with_queue(&broker).await;
        let (subscription, seen) = recording();
        for id in ["1", "2", "3"] {
            let payload = format!(r#"{{"id":"{}","qty":1}}"#, id);
            channel.publish("orders", payload.as_bytes()).await.unwrap();
        }

        let stream = channel.consume("orders", "test").await.unwrap();
        let ended = Arc::new(AtomicUsize::new(0));
        let ended_flag = Arc::clone(&ended);
        let worker = tokio::spawn(consume_loop(
            "orders".to_string(),
            stream,
            Arc::clone(&subscription.handler),
            move |_| {
                ended_flag.fetch_add(1, Ordering::SeqCst);
            },
        ));

        while broker.acked_count("orders") < 3 {
            tokio::task::yield_now().await;
        }
        broker.drop_connections();
        worker.await.unwrap();

        assert_eq!(*seen.lock().unwrap(), vec!["1", "2", "3"]);
        assert_eq!(ended.load(Ordering::SeqCst), 1);
    }
}
