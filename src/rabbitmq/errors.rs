// src/rabbitmq/errors.rs

use lapin::Error as LapinError;
use serde_json::Error as SerdeError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("RabbitMQ connection error: {0}")]
    ConnectionError(String),

    #[error("RabbitMQ channel error: {0}")]
    ChannelError(String),

    #[error("No RabbitMQ channel available")]
    NotConnected,

    #[error("RabbitMQ connection lost: {0}")]
    ConnectionLost(String),

    #[error("Queue '{queue}' exists with different parameters: {reason}")]
    QueueMismatch { queue: String, reason: String },

    #[error("Message serialization error: {0}")]
    SerializationError(#[from] SerdeError),

    #[error("RabbitMQ publish error: {0}")]
    PublishError(String),

    #[error("RabbitMQ consume error: {0}")]
    ConsumeError(String),

    #[error("RabbitMQ acknowledge error: {0}")]
    AckError(String),

    #[error("Queue '{0}' already has a subscriber")]
    AlreadySubscribed(String),

    #[error("Unknown error: {0}")]
    Unknown(String),
}

// Custom Result type for RabbitMQ operations
pub type Result<T> = std::result::Result<T, BrokerError>;

impl BrokerError {
    /// Maps a failed `queue.declare` into a mismatch when the broker refused
    /// the declaration because the queue already exists with other arguments.
    pub fn from_declare(queue: &str, error: LapinError) -> Self {
        let error_text = error.to_string();

        if error_text.contains("PRECONDITION_FAILED")
            || error_text.contains("PRECONDITIONFAILED")
            || error_text.contains("inequivalent arg")
        {
            BrokerError::QueueMismatch {
                queue: queue.to_string(),
                reason: error_text,
            }
        } else {
            BrokerError::from(error)
        }
    }
}

// Converting from lapin errors
impl From<LapinError> for BrokerError {
    fn from(error: LapinError) -> Self {
        // lapin only exposes a handful of structured variants; the rest are
        // classified by their rendered text
        match error {
            LapinError::IOError(e) => BrokerError::ConnectionError(e.to_string()),
            LapinError::InvalidConnectionState(state) => {
                BrokerError::ConnectionLost(format!("connection is {:?}", state))
            }
            LapinError::InvalidChannelState(state) => {
                BrokerError::ChannelError(format!("channel is {:?}", state))
            }
            other => {
                let error_text = other.to_string();

                if error_text.contains("connection") {
                    BrokerError::ConnectionError(error_text)
                } else if error_text.contains("channel") {
                    BrokerError::ChannelError(error_text)
                } else if error_text.contains("publish") {
                    BrokerError::PublishError(error_text)
                } else if error_text.contains("consume") {
                    BrokerError::ConsumeError(error_text)
                } else if error_text.contains("ack") || error_text.contains("nack") {
                    BrokerError::AckError(error_text)
                } else {
                    BrokerError::Unknown(error_text)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_are_connection_errors() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err = BrokerError::from(LapinError::IOError(std::sync::Arc::new(io)));

        assert!(matches!(err, BrokerError::ConnectionError(_)));
    }

    #[test]
    fn mismatch_names_the_queue() {
        let err = BrokerError::QueueMismatch {
            queue: "orders".to_string(),
            reason: "inequivalent arg 'durable'".to_string(),
        };

        assert_eq!(
            err.to_string(),
            "Queue 'orders' exists with different parameters: inequivalent arg 'durable'"
        );
    }

    #[test]
    fn serde_errors_convert() {
        let serde_err = serde_json::from_slice::<u32>(b"nope").unwrap_err();
        let err: BrokerError = serde_err.into();

        assert!(matches!(err, BrokerError::SerializationError(_)));
    }
}
