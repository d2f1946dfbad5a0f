//! # Message Envelope
//!
//! The wire shape shared by consumers and publishers:
//!
//! ```json
//! { "Timestamp": "2024-05-01T12:00:00Z", "MessageType": "farm.telemetry.Reading", "Data": { ... } }
//! ```
//!
//! `MessageType` is the discriminator used by the [`HandlerRegistry`](super::HandlerRegistry)
//! to route a delivery; `Data` stays opaque JSON until a typed handler decodes it.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;

use super::errors::{MessagingError, MessagingResult};

/// A typed message that can travel inside an [`Envelope`]
///
/// The discriminator is declared once per type; by convention it is the
/// fully qualified name of the message.
///
/// ```rust
/// use dispatch_core::messaging::Message;
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Serialize, Deserialize)]
/// struct TelemetryReading {
///     device_id: String,
///     temperature: f64,
/// }
///
/// impl Message for TelemetryReading {
///     const MESSAGE_TYPE: &'static str = "farm.telemetry.TelemetryReading";
/// }
/// ```
pub trait Message: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Discriminator written to the envelope's `MessageType` field
    const MESSAGE_TYPE: &'static str;

    /// Discriminator as a [`MessageType`]
    fn message_type() -> MessageType {
        MessageType::new(Self::MESSAGE_TYPE)
    }
}

/// Message type discriminator
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageType(String);

impl MessageType {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MessageType {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for MessageType {
    fn from(name: String) -> Self {
        Self(name)
    }
}

/// Broker message wrapper
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Envelope {
    /// When the envelope was created (UTC)
    pub timestamp: DateTime<Utc>,
    /// Routing discriminator
    pub message_type: MessageType,
    /// Opaque payload
    pub data: serde_json::Value,
}

impl Envelope {
    /// Wrap an untyped payload
    pub fn new(message_type: impl Into<MessageType>, data: serde_json::Value) -> Self {
        Self {
            timestamp: Utc::now(),
            message_type: message_type.into(),
            data,
        }
    }

    /// Wrap a typed message
    pub fn from_message<M: Message>(message: &M) -> MessagingResult<Self> {
        let data = serde_json::to_value(message)
            .map_err(|e| MessagingError::message_serialization(e.to_string()))?;
        Ok(Self::new(M::message_type(), data))
    }

    /// Decode the payload into a typed message
    ///
    /// Reads straight from the JSON value; the payload is never re-serialized to text first.
    pub fn decode<M: Message>(&self) -> MessagingResult<M> {
        M::deserialize(&self.data)
            .map_err(|e| MessagingError::message_deserialization(e.to_string()))
    }

    /// Whether this envelope carries messages of type `M`
    pub fn is<M: Message>(&self) -> bool {
        self.message_type.as_str() == M::MESSAGE_TYPE
    }

    /// Encode to the JSON wire body
    pub fn to_bytes(&self) -> MessagingResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| MessagingError::message_serialization(e.to_string()))
    }

    /// Decode from a JSON wire body
    pub fn from_bytes(body: &[u8]) -> MessagingResult<Self> {
        serde_json::from_slice(body)
            .map_err(|e| MessagingError::message_deserialization(e.to_string()))
    }

    /// Age of the envelope in milliseconds
    pub fn age_ms(&self) -> i64 {
        Utc::now()
            .signed_duration_since(self.timestamp)
            .num_milliseconds()
    }
}
