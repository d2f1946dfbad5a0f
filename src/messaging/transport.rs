//! # Broker Transport
//!
//! The seam between the runtime and a concrete broker client. Consumers and
//! publishers only ever talk to a `BrokerTransport`; reconnection, redelivery
//! and batching limits are properties of the transport, not of this crate.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;

use super::errors::MessagingResult;

/// A message handed to a consumer by the broker
///
/// The `delivery_id` is the receipt used to complete or dead-letter the message.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub delivery_id: i64,
    pub queue_name: String,
    pub body: Vec<u8>,
    /// How many times the broker has handed this message out, including this one
    pub delivery_count: u32,
    pub enqueued_at: DateTime<Utc>,
}

impl Delivery {
    /// Body as text for logging; invalid UTF-8 is replaced
    pub fn body_lossy(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Broker client operations needed by the runtime
#[async_trait]
pub trait BrokerTransport: Send + Sync + std::fmt::Debug {
    /// Transport name for logging
    fn name(&self) -> &'static str;

    /// Create the queue if it does not exist
    async fn ensure_queue(&self, queue_name: &str) -> MessagingResult<()>;

    /// Wait up to `wait` for the next message. The message stays invisible to
    /// other receivers for `visibility_timeout` unless completed or dead-lettered.
    async fn receive(
        &self,
        queue_name: &str,
        visibility_timeout: Duration,
        wait: Duration,
    ) -> MessagingResult<Option<Delivery>>;

    /// Acknowledge: remove the message from the live queue
    async fn complete(&self, queue_name: &str, delivery_id: i64) -> MessagingResult<()>;

    /// Move the message into the queue's terminal dead-letter store
    async fn dead_letter(
        &self,
        queue_name: &str,
        delivery_id: i64,
        reason: &str,
    ) -> MessagingResult<()>;

    /// Send a single encoded message, returning its broker id
    async fn send(&self, queue_name: &str, body: Vec<u8>) -> MessagingResult<i64>;

    /// Send an assembled batch in one transport call
    async fn send_batch(&self, queue_name: &str, bodies: Vec<Vec<u8>>) -> MessagingResult<Vec<i64>>;

    /// Wire-size ceiling for one batch, in bytes
    fn max_batch_bytes(&self) -> usize;

    /// Release the underlying client
    async fn close(&self) -> MessagingResult<()>;
}
