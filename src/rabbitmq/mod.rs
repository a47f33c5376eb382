// RabbitMQ client: supervised connection, queue declaration, publishing and
// consuming over a pluggable transport.

pub mod amqp_client;
pub mod channel_manager;
pub mod connection;
pub mod consumer;
pub mod declarer;
pub mod errors;
pub mod memory;
pub mod publisher;
pub mod retry;
pub mod transport;

pub use channel_manager::{ChannelConfig, ChannelHandle};
pub use connection::{ConnectionManager, ConnectionState, ConnectionStatus};
pub use consumer::{handler_fn, Consumer, MessageHandler, Subscription};
pub use declarer::{ensure_queue, QueueSpec};
pub use errors::{BrokerError, Result};
pub use memory::MemoryBroker;
pub use publisher::Publisher;
pub use retry::{RetryPolicy, RetryState};
