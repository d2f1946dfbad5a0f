//! # PostgreSQL Message Queue Transport (pgmq-rs)
//!
//! [`BrokerTransport`] backed by pgmq. Completion deletes the message and
//! dead-lettering archives it, so failed messages remain queryable in the
//! queue's archive table for manual inspection.

use async_trait::async_trait;
use pgmq::PGMQueue;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::errors::{MessagingError, MessagingResult};
use super::transport::{BrokerTransport, Delivery};
use crate::constants::broker::DEFAULT_MAX_BATCH_BYTES;

/// Idle wait between reads while `receive` is waiting for a message
const READ_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// pgmq-rs based transport
#[derive(Debug, Clone)]
pub struct PgmqTransport {
    pgmq: PGMQueue,
    max_batch_bytes: usize,
}

impl PgmqTransport {
    /// Connect using a connection string
    pub async fn connect(database_url: &str) -> MessagingResult<Self> {
        info!("Connecting to pgmq");

        let pgmq = PGMQueue::new(database_url.to_string()).await?;

        info!("Connected to pgmq");
        Ok(Self {
            pgmq,
            max_batch_bytes: DEFAULT_MAX_BATCH_BYTES,
        })
    }

    pub fn with_max_batch_bytes(mut self, max_batch_bytes: usize) -> Self {
        self.max_batch_bytes = max_batch_bytes;
        self
    }

    fn parse_body(body: &[u8]) -> MessagingResult<serde_json::Value> {
        serde_json::from_slice(body).map_err(|e| MessagingError::message_serialization(e.to_string()))
    }

    fn visibility_seconds(visibility_timeout: Duration) -> i32 {
        i32::try_from(visibility_timeout.as_secs()).unwrap_or(i32::MAX)
    }
}

#[async_trait]
impl BrokerTransport for PgmqTransport {
    fn name(&self) -> &'static str {
        "pgmq"
    }

    async fn ensure_queue(&self, queue_name: &str) -> MessagingResult<()> {
        debug!(queue = %queue_name, "Creating queue");
        self.pgmq
            .create(queue_name)
            .await
            .map_err(|e| MessagingError::transport("create_queue", format!("{queue_name}: {e}")))
    }

    async fn receive(
        &self,
        queue_name: &str,
        visibility_timeout: Duration,
        wait: Duration,
    ) -> MessagingResult<Option<Delivery>> {
        let deadline = Instant::now() + wait;
        let vt = Some(Self::visibility_seconds(visibility_timeout));

        loop {
            let message = self
                .pgmq
                .read::<serde_json::Value>(queue_name, vt)
                .await
                .map_err(|e| MessagingError::transport("read", format!("{queue_name}: {e}")))?;

            if let Some(message) = message {
                let body = serde_json::to_vec(&message.message)?;
                return Ok(Some(Delivery {
                    delivery_id: message.msg_id,
                    queue_name: queue_name.to_string(),
                    body,
                    delivery_count: u32::try_from(message.read_ct).unwrap_or(0),
                    enqueued_at: message.enqueued_at,
                }));
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(READ_POLL_INTERVAL.min(deadline - now)).await;
        }
    }

    async fn complete(&self, queue_name: &str, delivery_id: i64) -> MessagingResult<()> {
        self.pgmq
            .delete(queue_name, delivery_id)
            .await
            .map_err(|e| MessagingError::transport("delete", format!("{delivery_id}: {e}")))?;
        Ok(())
    }

    async fn dead_letter(
        &self,
        queue_name: &str,
        delivery_id: i64,
        reason: &str,
    ) -> MessagingResult<()> {
        warn!(
            queue = %queue_name,
            msg_id = delivery_id,
            reason = %reason,
            "Archiving message"
        );
        self.pgmq
            .archive(queue_name, delivery_id)
            .await
            .map_err(|e| MessagingError::transport("archive", format!("{delivery_id}: {e}")))?;
        Ok(())
    }

    async fn send(&self, queue_name: &str, body: Vec<u8>) -> MessagingResult<i64> {
        let message = Self::parse_body(&body)?;
        self.pgmq
            .send(queue_name, &message)
            .await
            .map_err(|e| MessagingError::transport("send", format!("{queue_name}: {e}")))
    }

    async fn send_batch(&self, queue_name: &str, bodies: Vec<Vec<u8>>) -> MessagingResult<Vec<i64>> {
        let messages = bodies
            .iter()
            .map(|body| Self::parse_body(body))
            .collect::<MessagingResult<Vec<_>>>()?;
        self.pgmq
            .send_batch(queue_name, &messages)
            .await
            .map_err(|e| MessagingError::transport("send_batch", format!("{queue_name}: {e}")))
    }

    fn max_batch_bytes(&self) -> usize {
        self.max_batch_bytes
    }

    async fn close(&self) -> MessagingResult<()> {
        self.pgmq.connection.close().await;
        info!("pgmq connection pool closed");
        Ok(())
    }
}
