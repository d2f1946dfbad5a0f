//! # Publisher
//!
//! Single and batched sends to one queue. Every send reports its outcome to
//! the caller; failures are logged to the connection's sink as well.
//!
//! Batch publishing assembles envelopes in input order into batches bounded by
//! the caller's `batch_size` (or the publisher's configured default) and the
//! transport's wire-size ceiling. A batch is
//! flushed when it is full, when the next envelope would overflow it, and once
//! more when the input is exhausted. A failed flush is recorded and publishing
//! moves on; an envelope that cannot fit even an empty batch aborts the whole
//! operation.
//!
//! ```rust
//! use dispatch_core::logging::MemoryLogSink;
//! use dispatch_core::messaging::{BrokerConnection, Envelope, InMemoryBroker};
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! # tokio_test::block_on(async {
//! let connection = Arc::new(BrokerConnection::new(
//!     Arc::new(InMemoryBroker::new()),
//!     Arc::new(MemoryLogSink::new()),
//! ));
//! let publisher = connection.create_publisher("readings").await?;
//!
//! let envelopes: Vec<Envelope> = (0..7)
//!     .map(|seq| Envelope::new("farm.telemetry.Pulse", json!({ "seq": seq })))
//!     .collect();
//! let report = publisher.publish_batch(&envelopes, 3).await?;
//! assert_eq!(report.batch_sizes(), vec![3, 3, 1]);
//! # Ok::<(), dispatch_core::MessagingError>(())
//! # }).unwrap();
//! ```

use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error, instrument, warn};

use super::batch::MessageBatch;
use super::connection::BrokerConnection;
use super::envelope::{Envelope, Message, MessageType};
use super::errors::{MessagingError, MessagingResult};
use crate::config::PublisherConfig;
use crate::constants::sources;

/// Broker acknowledgement of a single publish
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PublishReceipt {
    pub queue_name: String,
    pub message_id: i64,
    pub message_type: MessageType,
    pub size_bytes: usize,
}

/// Result of one batch flush
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchOutcome {
    /// Input index of the first envelope in the batch
    pub first_index: usize,
    pub len: usize,
    /// Broker ids on success, the transport error text on failure
    pub result: Result<Vec<i64>, String>,
}

impl BatchOutcome {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }

    /// Input indices covered by this batch
    pub fn indices(&self) -> std::ops::Range<usize> {
        self.first_index..self.first_index + self.len
    }
}

/// Every flush of one `publish_batch` call, in order
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchPublishReport {
    pub batches: Vec<BatchOutcome>,
}

impl BatchPublishReport {
    /// Envelopes in batches the broker accepted
    pub fn sent_count(&self) -> usize {
        self.batches
            .iter()
            .filter(|b| b.is_success())
            .map(|b| b.len)
            .sum()
    }

    pub fn failed_batches(&self) -> Vec<&BatchOutcome> {
        self.batches.iter().filter(|b| !b.is_success()).collect()
    }

    pub fn is_complete_success(&self) -> bool {
        self.batches.iter().all(BatchOutcome::is_success)
    }

    /// Sizes of the flushed batches, in flush order
    pub fn batch_sizes(&self) -> Vec<usize> {
        self.batches.iter().map(|b| b.len).collect()
    }
}

/// Sends envelopes to one queue over the shared connection
#[derive(Debug, Clone)]
pub struct Publisher {
    connection: Arc<BrokerConnection>,
    queue_name: String,
    config: PublisherConfig,
}

impl Publisher {
    pub(crate) fn new(
        connection: Arc<BrokerConnection>,
        queue_name: String,
        config: PublisherConfig,
    ) -> Self {
        Self {
            connection,
            queue_name,
            config,
        }
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    /// Batch size used by [`publish_batch_default`](Self::publish_batch_default)
    pub fn default_batch_size(&self) -> usize {
        self.config.default_batch_size
    }

    /// Encode and send one envelope
    pub async fn publish(&self, envelope: &Envelope) -> MessagingResult<PublishReceipt> {
        self.connection.ensure_open()?;
        let body = envelope.to_bytes()?;
        let size_bytes = body.len();

        match self
            .connection
            .transport()
            .send(&self.queue_name, body)
            .await
        {
            Ok(message_id) => {
                debug!(
                    queue = %self.queue_name,
                    message_type = %envelope.message_type,
                    message_id,
                    size_bytes,
                    "Published message"
                );
                Ok(PublishReceipt {
                    queue_name: self.queue_name.clone(),
                    message_id,
                    message_type: envelope.message_type.clone(),
                    size_bytes,
                })
            }
            Err(e) => {
                error!(
                    queue = %self.queue_name,
                    message_type = %envelope.message_type,
                    error = %e,
                    "Failed to publish message"
                );
                self.connection
                    .log_sink()
                    .log_error(&e, Some(sources::PUBLISHER))
                    .await;
                Err(e)
            }
        }
    }

    /// Wrap a typed message in an envelope and send it
    pub async fn publish_message<M: Message>(&self, message: &M) -> MessagingResult<PublishReceipt> {
        let envelope = Envelope::from_message(message)?;
        self.publish(&envelope).await
    }

    /// Send envelopes in batches of at most `batch_size`
    ///
    /// Returns `MessageTooLarge` with the failing input index when an envelope
    /// does not fit an empty batch; batches flushed before it stay sent and no
    /// later envelope is sent.
    #[instrument(skip(self, envelopes), fields(queue = %self.queue_name, count = envelopes.len()))]
    pub async fn publish_batch(
        &self,
        envelopes: &[Envelope],
        batch_size: usize,
    ) -> MessagingResult<BatchPublishReport> {
        if batch_size == 0 {
            return Err(MessagingError::InvalidBatchSize { batch_size });
        }
        self.connection.ensure_open()?;

        let max_bytes = self.connection.transport().max_batch_bytes();
        let mut report = BatchPublishReport::default();
        let mut batch = MessageBatch::new(0, batch_size, max_bytes);

        for (index, envelope) in envelopes.iter().enumerate() {
            let body = envelope.to_bytes()?;

            if let Err(body) = batch.try_add(body) {
                if !batch.is_empty() {
                    let full =
                        std::mem::replace(&mut batch, MessageBatch::new(index, batch_size, max_bytes));
                    report.batches.push(self.flush(full).await);
                }

                if let Err(body) = batch.try_add(body) {
                    let err = MessagingError::MessageTooLarge {
                        index,
                        size_bytes: body.len(),
                        limit_bytes: max_bytes,
                    };
                    error!(
                        index,
                        size_bytes = body.len(),
                        limit_bytes = max_bytes,
                        flushed = report.batches.len(),
                        "Aborting batch publish: message too large for an empty batch"
                    );
                    self.connection
                        .log_sink()
                        .log_error(&err, Some(sources::PUBLISHER))
                        .await;
                    return Err(err);
                }
            }

            if batch.is_full() {
                let full =
                    std::mem::replace(&mut batch, MessageBatch::new(index + 1, batch_size, max_bytes));
                report.batches.push(self.flush(full).await);
            }
        }

        if !batch.is_empty() {
            report.batches.push(self.flush(batch).await);
        }

        debug!(
            batches = report.batches.len(),
            sent = report.sent_count(),
            failed = report.failed_batches().len(),
            "Batch publish finished"
        );
        Ok(report)
    }

    /// Send envelopes in batches of the configured default size
    pub async fn publish_batch_default(
        &self,
        envelopes: &[Envelope],
    ) -> MessagingResult<BatchPublishReport> {
        self.publish_batch(envelopes, self.config.default_batch_size)
            .await
    }

    /// Wrap typed messages in envelopes and send them in batches
    pub async fn publish_messages<M: Message>(
        &self,
        messages: &[M],
        batch_size: usize,
    ) -> MessagingResult<BatchPublishReport> {
        let envelopes = messages
            .iter()
            .map(Envelope::from_message)
            .collect::<MessagingResult<Vec<_>>>()?;
        self.publish_batch(&envelopes, batch_size).await
    }

    async fn flush(&self, batch: MessageBatch) -> BatchOutcome {
        let first_index = batch.first_index();
        let len = batch.len();
        let bytes = batch.bytes();

        let result = self
            .connection
            .transport()
            .send_batch(&self.queue_name, batch.into_bodies())
            .await;

        match result {
            Ok(ids) => {
                debug!(first_index, len, bytes, "Flushed batch");
                BatchOutcome {
                    first_index,
                    len,
                    result: Ok(ids),
                }
            }
            Err(e) => {
                warn!(first_index, len, bytes, error = %e, "Failed to send batch");
                self.connection
                    .log_sink()
                    .log_error(&e, Some(sources::PUBLISHER))
                    .await;
                BatchOutcome {
                    first_index,
                    len,
                    result: Err(e.to_string()),
                }
            }
        }
    }
}
