//! In-process broker.
//!
//! Implements the transport traits with the broker-side behaviour the client
//! depends on: durable queues that outlive connections, round-robin delivery
//! to consumers, per-delivery acknowledgement, redelivery of unacknowledged
//! messages when a connection dies, and broker-side dead-lettering of
//! messages rejected without requeue.
//!
//! It also lets a test make the broker unreachable, fail a number of connect
//! attempts, drop every connection or simulate a broker restart.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;

use super::errors::{BrokerError, Result};
use super::transport::{
    BrokerChannel, BrokerConnection, Connector, Delivery, DeliveryAcker, DeliveryStream,
    ErrorHandler, QueueArguments, QueueInfo,
};

type DeliverySender = mpsc::UnboundedSender<Result<Delivery>>;

/// Shared handle to an in-process broker. Clones refer to the same broker.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

#[derive(Default)]
struct BrokerState {
    unreachable: bool,
    failures_remaining: u32,
    connect_attempts: Vec<Instant>,
    next_connection_id: u64,
    connections: HashMap<u64, ConnectionEntry>,
    queues: HashMap<String, MemoryQueue>,
    next_delivery_tag: u64,
    unacked: HashMap<u64, Unacked>,
    discarded: Vec<(String, Vec<u8>)>,
    last_prefetch: Option<u16>,
}

struct ConnectionEntry {
    open: bool,
    channels: usize,
    error_handlers: Vec<ErrorHandler>,
}

struct MemoryQueue {
    arguments: QueueArguments,
    ready: VecDeque<StoredMessage>,
    consumers: Vec<ConsumerEntry>,
    next_consumer: usize,
    acked: u64,
}

#[derive(Clone)]
struct StoredMessage {
    data: Vec<u8>,
    redelivered: bool,
}

struct ConsumerEntry {
    tag: String,
    connection_id: u64,
    sender: DeliverySender,
}

struct Unacked {
    queue: String,
    connection_id: u64,
    message: StoredMessage,
}

impl MemoryQueue {
    fn new(arguments: QueueArguments) -> Self {
        Self {
            arguments,
            ready: VecDeque::new(),
            consumers: Vec::new(),
            next_consumer: 0,
            acked: 0,
        }
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Makes every following connect attempt fail (or succeed again).
    pub fn set_reachable(&self, reachable: bool) {
        self.lock().unreachable = !reachable;
    }

    /// Fails the next `count` connect attempts.
    pub fn fail_next_connects(&self, count: u32) {
        self.lock().failures_remaining = count;
    }

    /// Times of every connect attempt, successful or not.
    pub fn connect_attempts(&self) -> Vec<Instant> {
        self.lock().connect_attempts.clone()
    }

    pub fn open_connections(&self) -> usize {
        self.lock().connections.values().filter(|c| c.open).count()
    }

    pub fn open_channels(&self) -> usize {
        self.lock()
            .connections
            .values()
            .filter(|c| c.open)
            .map(|c| c.channels)
            .sum()
    }

    pub fn queue_exists(&self, queue: &str) -> bool {
        self.lock().queues.contains_key(queue)
    }

    pub fn is_durable(&self, queue: &str) -> Option<bool> {
        self.lock().queues.get(queue).map(|q| q.arguments.durable)
    }

    pub fn consumer_count(&self, queue: &str) -> usize {
        self.lock()
            .queues
            .get(queue)
            .map_or(0, |q| q.consumers.len())
    }

    /// Messages waiting in `queue` that have not been delivered.
    pub fn ready_count(&self, queue: &str) -> usize {
        self.lock().queues.get(queue).map_or(0, |q| q.ready.len())
    }

    pub fn unacked_count(&self, queue: &str) -> usize {
        self.lock()
            .unacked
            .values()
            .filter(|u| u.queue == queue)
            .count()
    }

    pub fn acked_count(&self, queue: &str) -> u64 {
        self.lock().queues.get(queue).map_or(0, |q| q.acked)
    }

    /// Messages rejected without requeue that had no dead-letter target.
    pub fn discarded(&self) -> Vec<(String, Vec<u8>)> {
        self.lock().discarded.clone()
    }

    pub fn last_prefetch(&self) -> Option<u16> {
        self.lock().last_prefetch
    }

    /// Declares a queue out of band, as another client would.
    pub fn create_queue(&self, queue: &str, arguments: QueueArguments) {
        self.lock()
            .queues
            .entry(queue.to_string())
            .or_insert_with(|| MemoryQueue::new(arguments));
    }

    /// Enqueues raw bytes out of band, bypassing any client-side serialization.
    pub fn inject(&self, queue: &str, data: &[u8]) {
        let mut state = self.lock();
        if let Some(q) = state.queues.get_mut(queue) {
            q.ready.push_back(StoredMessage {
                data: data.to_vec(),
                redelivered: false,
            });
            state.dispatch(self, queue);
        }
    }

    /// Severs every open connection as a network partition would.
    pub fn drop_connections(&self) {
        let handlers = {
            let mut state = self.lock();
            let ids: Vec<u64> = state
                .connections
                .iter()
                .filter(|(_, c)| c.open)
                .map(|(id, _)| *id)
                .collect();

            let mut handlers = Vec::new();
            for id in ids {
                handlers.extend(state.close_connection(self, id, true));
            }
            handlers
        };

        // run outside the lock; handlers may call back into the client
        for mut handler in handlers {
            handler(BrokerError::ConnectionLost(
                "CONNECTION_FORCED - broker forced connection closure".to_string(),
            ));
        }
    }

    /// Drops every connection and forgets non-durable queues.
    pub fn restart(&self) {
        self.drop_connections();
        self.lock().queues.retain(|_, q| q.arguments.durable);
    }

    fn open_connection(&self) -> Result<u64> {
        let mut state = self.lock();
        state.connect_attempts.push(Instant::now());

        if state.unreachable {
            return Err(BrokerError::ConnectionError(
                "Connection refused (os error 111)".to_string(),
            ));
        }
        if state.failures_remaining > 0 {
            state.failures_remaining -= 1;
            return Err(BrokerError::ConnectionError(
                "Connection refused (os error 111)".to_string(),
            ));
        }

        state.next_connection_id += 1;
        let id = state.next_connection_id;
        state.connections.insert(
            id,
            ConnectionEntry {
                open: true,
                channels: 0,
                error_handlers: Vec::new(),
            },
        );
        Ok(id)
    }

    fn settle(&self, delivery_tag: u64, connection_id: u64, outcome: Settlement) -> Result<()> {
        let mut state = self.lock();

        if !state.connection_open(connection_id) {
            return Err(BrokerError::AckError(
                "channel closed before the delivery was settled".to_string(),
            ));
        }
        let unacked = state.unacked.remove(&delivery_tag).ok_or_else(|| {
            BrokerError::AckError(format!(
                "PRECONDITION_FAILED - unknown delivery tag {}",
                delivery_tag
            ))
        })?;

        match outcome {
            Settlement::Ack => {
                if let Some(q) = state.queues.get_mut(&unacked.queue) {
                    q.acked += 1;
                }
            }
            Settlement::Requeue => {
                if let Some(q) = state.queues.get_mut(&unacked.queue) {
                    q.ready.push_front(StoredMessage {
                        redelivered: true,
                        ..unacked.message
                    });
                }
                state.dispatch(self, &unacked.queue);
            }
            Settlement::Discard => {
                let dead_letter = state
                    .queues
                    .get(&unacked.queue)
                    .and_then(|q| q.arguments.dead_letter_queue.clone())
                    .filter(|dlq| state.queues.contains_key(dlq));

                match dead_letter {
                    Some(dlq) => {
                        if let Some(q) = state.queues.get_mut(&dlq) {
                            q.ready.push_back(StoredMessage {
                                data: unacked.message.data,
                                redelivered: false,
                            });
                        }
                        state.dispatch(self, &dlq);
                    }
                    None => state.discarded.push((unacked.queue, unacked.message.data)),
                }
            }
        }
        Ok(())
    }
}

enum Settlement {
    Ack,
    Requeue,
    Discard,
}

impl BrokerState {
    fn connection_open(&self, id: u64) -> bool {
        self.connections.get(&id).is_some_and(|c| c.open)
    }

    /// Hands ready messages of `queue` to its consumers, round-robin.
    fn dispatch(&mut self, broker: &MemoryBroker, queue: &str) {
        let BrokerState {
            queues,
            unacked,
            next_delivery_tag,
            ..
        } = self;
        let Some(q) = queues.get_mut(queue) else {
            return;
        };

        while !q.consumers.is_empty() {
            let Some(message) = q.ready.pop_front() else {
                break;
            };
            let index = q.next_consumer % q.consumers.len();
            q.next_consumer = index + 1;
            let consumer = &q.consumers[index];

            *next_delivery_tag += 1;
            let tag = *next_delivery_tag;
            let delivery = Delivery::new(
                tag,
                message.redelivered,
                message.data.clone(),
                Box::new(MemoryAcker {
                    broker: broker.clone(),
                    delivery_tag: tag,
                    connection_id: consumer.connection_id,
                }),
            );

            if consumer.sender.send(Ok(delivery)).is_err() {
                // receiver gone: forget the consumer and keep the message
                debug!(queue, consumer_tag = %consumer.tag, "dropping dead consumer");
                q.consumers.remove(index);
                q.ready.push_front(message);
                continue;
            }

            unacked.insert(
                tag,
                Unacked {
                    queue: queue.to_string(),
                    connection_id: consumer.connection_id,
                    message,
                },
            );
        }
    }

    /// Closes a connection, cancels its consumers and requeues what they
    /// held. Returns the error handlers when the close was not requested by
    /// the client.
    fn close_connection(
        &mut self,
        broker: &MemoryBroker,
        id: u64,
        forced: bool,
    ) -> Vec<ErrorHandler> {
        let handlers = match self.connections.get_mut(&id) {
            Some(entry) if entry.open => {
                entry.open = false;
                entry.channels = 0;
                std::mem::take(&mut entry.error_handlers)
            }
            _ => return Vec::new(),
        };

        for q in self.queues.values_mut() {
            q.consumers.retain(|c| {
                if c.connection_id != id {
                    return true;
                }
                if forced {
                    let _ = c.sender.send(Err(BrokerError::ConnectionLost(
                        "connection closed by broker".to_string(),
                    )));
                }
                false
            });
        }

        let mut tags: Vec<u64> = self
            .unacked
            .iter()
            .filter(|(_, u)| u.connection_id == id)
            .map(|(tag, _)| *tag)
            .collect();
        tags.sort_unstable();

        let mut touched = Vec::new();
        for tag in tags.into_iter().rev() {
            if let Some(unacked) = self.unacked.remove(&tag) {
                if let Some(q) = self.queues.get_mut(&unacked.queue) {
                    q.ready.push_front(StoredMessage {
                        redelivered: true,
                        ..unacked.message
                    });
                }
                touched.push(unacked.queue);
            }
        }
        touched.sort();
        touched.dedup();
        for queue in touched {
            self.dispatch(broker, &queue);
        }

        if forced {
            handlers
        } else {
            Vec::new()
        }
    }
}

#[async_trait]
impl Connector for MemoryBroker {
    async fn connect(&self, _uri: &str) -> Result<Box<dyn BrokerConnection>> {
        let id = self.open_connection()?;
        Ok(Box::new(MemoryConnection {
            broker: self.clone(),
            id,
        }))
    }
}

struct MemoryConnection {
    broker: MemoryBroker,
    id: u64,
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>> {
        let mut state = self.broker.lock();
        match state.connections.get_mut(&self.id) {
            Some(entry) if entry.open => entry.channels += 1,
            _ => return Err(BrokerError::ChannelError("connection is closed".to_string())),
        }

        Ok(Arc::new(MemoryChannel {
            broker: self.broker.clone(),
            connection_id: self.id,
            open: AtomicBool::new(true),
        }))
    }

    fn on_error(&self, handler: ErrorHandler) {
        let mut state = self.broker.lock();
        if let Some(entry) = state.connections.get_mut(&self.id) {
            entry.error_handlers.push(handler);
        }
    }

    async fn close(&self) -> Result<()> {
        let mut state = self.broker.lock();
        state.close_connection(&self.broker, self.id, false);
        Ok(())
    }
}

struct MemoryChannel {
    broker: MemoryBroker,
    connection_id: u64,
    open: AtomicBool,
}

impl MemoryChannel {
    fn ensure_open(&self, state: &BrokerState) -> Result<()> {
        if self.open.load(Ordering::SeqCst) && state.connection_open(self.connection_id) {
            Ok(())
        } else {
            Err(BrokerError::ChannelError("channel is closed".to_string()))
        }
    }

    fn mark_closed(&self, state: &mut BrokerState) {
        if self.open.swap(false, Ordering::SeqCst) {
            if let Some(entry) = state.connections.get_mut(&self.connection_id) {
                entry.channels = entry.channels.saturating_sub(1);
            }
        }
    }
}

fn mismatch(queue: &str, current: &QueueArguments, requested: &QueueArguments) -> Option<String> {
    if current.durable != requested.durable {
        return Some(format!(
            "PRECONDITION_FAILED - inequivalent arg 'durable' for queue '{}': received '{}' but current is '{}'",
            queue, requested.durable, current.durable
        ));
    }
    if current.dead_letter_queue != requested.dead_letter_queue {
        return Some(format!(
            "PRECONDITION_FAILED - inequivalent arg 'x-dead-letter-routing-key' for queue '{}'",
            queue
        ));
    }
    None
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn declare_queue(&self, name: &str, arguments: &QueueArguments) -> Result<QueueInfo> {
        let mut state = self.broker.lock();
        self.ensure_open(&state)?;

        let queue = state
            .queues
            .entry(name.to_string())
            .or_insert_with(|| MemoryQueue::new(arguments.clone()));

        if let Some(reason) = mismatch(name, &queue.arguments, arguments) {
            // a failed declaration closes the channel, as RabbitMQ does
            self.mark_closed(&mut state);
            return Err(BrokerError::QueueMismatch {
                queue: name.to_string(),
                reason,
            });
        }

        Ok(QueueInfo {
            name: name.to_string(),
            message_count: queue.ready.len() as u32,
            consumer_count: queue.consumers.len() as u32,
        })
    }

    async fn publish(&self, queue: &str, payload: &[u8]) -> Result<()> {
        let mut state = self.broker.lock();
        self.ensure_open(&state)
            .map_err(|e| BrokerError::PublishError(e.to_string()))?;

        match state.queues.get_mut(queue) {
            Some(q) => {
                q.ready.push_back(StoredMessage {
                    data: payload.to_vec(),
                    redelivered: false,
                });
                state.dispatch(&self.broker, queue);
            }
            // the default exchange silently drops unroutable messages
            None => debug!(queue, "dropping unroutable message"),
        }
        Ok(())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream> {
        let mut state = self.broker.lock();
        self.ensure_open(&state)
            .map_err(|e| BrokerError::ConsumeError(e.to_string()))?;

        let (tx, rx) = mpsc::unbounded_channel();
        let q = state.queues.get_mut(queue).ok_or_else(|| {
            BrokerError::ConsumeError(format!("NOT_FOUND - no queue '{}'", queue))
        })?;
        q.consumers.push(ConsumerEntry {
            tag: consumer_tag.to_string(),
            connection_id: self.connection_id,
            sender: tx,
        });
        state.dispatch(&self.broker, queue);

        let stream = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });
        Ok(stream.boxed())
    }

    async fn set_prefetch(&self, count: u16) -> Result<()> {
        let mut state = self.broker.lock();
        self.ensure_open(&state)?;
        state.last_prefetch = Some(count);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst) && self.broker.lock().connection_open(self.connection_id)
    }

    async fn close(&self) -> Result<()> {
        let mut state = self.broker.lock();
        self.mark_closed(&mut state);
        Ok(())
    }
}

struct MemoryAcker {
    broker: MemoryBroker,
    delivery_tag: u64,
    connection_id: u64,
}

#[async_trait]
impl DeliveryAcker for MemoryAcker {
    async fn ack(&self) -> Result<()> {
        self.broker
            .settle(self.delivery_tag, self.connection_id, Settlement::Ack)
    }

    async fn reject(&self, requeue: bool) -> Result<()> {
        let outcome = if requeue {
            Settlement::Requeue
        } else {
            Settlement::Discard
        };
        self.broker
            .settle(self.delivery_tag, self.connection_id, outcome)
    }
}
