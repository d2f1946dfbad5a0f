//! # Messaging Error Types
//!
//! Structured error handling for the broker layer using thiserror
//! instead of `Box<dyn Error>` patterns.

use thiserror::Error;

/// Messaging error types shared by transports, consumers and publishers
#[derive(Error, Debug)]
pub enum MessagingError {
    #[error("Broker transport error: {operation}: {message}")]
    Transport { operation: String, message: String },

    #[error("Broker connection is closed")]
    ConnectionClosed,

    #[error("Queue not found: {queue_name}")]
    QueueNotFound { queue_name: String },

    #[error("Message serialization error: {message}")]
    MessageSerialization { message: String },

    #[error("Message deserialization error: {message}")]
    MessageDeserialization { message: String },

    #[error("Message {index} is too large for the batch: {size_bytes} bytes exceeds limit of {limit_bytes} bytes")]
    MessageTooLarge {
        index: usize,
        size_bytes: usize,
        limit_bytes: usize,
    },

    #[error("Invalid batch size: {batch_size}")]
    InvalidBatchSize { batch_size: usize },

    #[error("Unknown delivery {delivery_id} on queue {queue_name}")]
    UnknownDelivery { queue_name: String, delivery_id: i64 },

    #[error("Configuration error: {component}: {message}")]
    Configuration { component: String, message: String },

    #[error("Internal messaging error: {message}")]
    Internal { message: String },
}

impl MessagingError {
    /// Create a transport error
    pub fn transport(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transport {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Create a queue not found error
    pub fn queue_not_found(queue_name: impl Into<String>) -> Self {
        Self::QueueNotFound {
            queue_name: queue_name.into(),
        }
    }

    /// Create a message serialization error
    pub fn message_serialization(message: impl Into<String>) -> Self {
        Self::MessageSerialization {
            message: message.into(),
        }
    }

    /// Create a message deserialization error
    pub fn message_deserialization(message: impl Into<String>) -> Self {
        Self::MessageDeserialization {
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn configuration(component: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Configuration {
            component: component.into(),
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Whether the error came from the broker transport rather than from message content
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::Transport { .. } | Self::ConnectionClosed | Self::QueueNotFound { .. }
        )
    }
}

/// Conversion from serde_json::Error to MessagingError
impl From<serde_json::Error> for MessagingError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_syntax() || err.is_data() || err.is_eof() {
            MessagingError::message_deserialization(err.to_string())
        } else {
            MessagingError::message_serialization(err.to_string())
        }
    }
}

/// Conversion from pgmq::errors::PgmqError to MessagingError
#[cfg(feature = "postgres")]
impl From<pgmq::errors::PgmqError> for MessagingError {
    fn from(err: pgmq::errors::PgmqError) -> Self {
        MessagingError::transport("pgmq", err.to_string())
    }
}

/// Result type alias for messaging operations
pub type MessagingResult<T> = Result<T, MessagingError>;
