//! # Consumer
//!
//! Pulls deliveries from one queue and settles each one exactly once:
//!
//! ```text
//! RECEIVED -> DECODED -> HANDLED    -> complete
//!                     -> UNROUTABLE -> log, then leave or dead-letter
//!                     -> FAILED     -> dead-letter
//! ```
//!
//! Per-message failures never leave [`Consumer::process_delivery`]; the
//! consume loop only stops on shutdown or when the connection is closed.
//! Messages are processed one at a time.

use futures::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use super::connection::BrokerConnection;
use super::envelope::{Envelope, MessageType};
use super::errors::{MessagingError, MessagingResult};
use super::registry::{HandlerError, HandlerRegistry, ResolvedHandler};
use super::transport::Delivery;
use crate::config::ConsumerConfig;
use crate::constants::{broker, sources};
use crate::logging::{self, LogLevel};

/// What to do with a message no handler or callback is registered for
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnroutablePolicy {
    /// Log it and leave it unacknowledged; the broker redelivers it
    Leave,
    /// Log it and move it to the dead-letter store
    #[default]
    DeadLetter,
}

/// Settlement the consumer attempted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SettleAction {
    Complete,
    DeadLetter,
}

/// How one delivery ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Handled and completed
    Acknowledged { message_type: MessageType },
    /// Moved to the dead-letter store
    DeadLettered {
        reason: &'static str,
        message_type: Option<MessageType>,
        error: String,
    },
    /// No binding for the type; `dead_lettered` reflects the policy
    Unroutable {
        message_type: MessageType,
        dead_lettered: bool,
    },
    /// The settle call failed; the message is left to broker redelivery
    SettleFailed { action: SettleAction, error: String },
}

impl DeliveryOutcome {
    pub fn is_acknowledged(&self) -> bool {
        matches!(self, Self::Acknowledged { .. })
    }

    pub fn is_dead_lettered(&self) -> bool {
        matches!(
            self,
            Self::DeadLettered { .. }
                | Self::Unroutable {
                    dead_lettered: true,
                    ..
                }
        )
    }
}

/// Point-in-time counters for one consumer
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConsumerStats {
    pub received: u64,
    pub acknowledged: u64,
    pub dead_lettered: u64,
    pub unroutable: u64,
    pub decode_failures: u64,
    pub handler_failures: u64,
    pub transport_errors: u64,
}

#[derive(Debug, Default)]
struct ConsumerCounters {
    received: AtomicU64,
    acknowledged: AtomicU64,
    dead_lettered: AtomicU64,
    unroutable: AtomicU64,
    decode_failures: AtomicU64,
    handler_failures: AtomicU64,
    transport_errors: AtomicU64,
}

impl ConsumerCounters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> ConsumerStats {
        ConsumerStats {
            received: self.received.load(Ordering::Relaxed),
            acknowledged: self.acknowledged.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            unroutable: self.unroutable.load(Ordering::Relaxed),
            decode_failures: self.decode_failures.load(Ordering::Relaxed),
            handler_failures: self.handler_failures.load(Ordering::Relaxed),
            transport_errors: self.transport_errors.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug)]
struct ConsumerInner {
    connection: Arc<BrokerConnection>,
    queue_name: String,
    registry: Arc<HandlerRegistry>,
    config: ConsumerConfig,
    counters: ConsumerCounters,
}

/// Consume loop for one queue
#[derive(Debug)]
pub struct Consumer {
    inner: Arc<ConsumerInner>,
    started: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Consumer {
    pub(crate) fn new(
        connection: Arc<BrokerConnection>,
        queue_name: String,
        registry: Arc<HandlerRegistry>,
        config: ConsumerConfig,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(ConsumerInner {
                connection,
                queue_name,
                registry,
                config,
                counters: ConsumerCounters::default(),
            }),
            started: AtomicBool::new(false),
            shutdown_tx,
            task: Mutex::new(None),
        }
    }

    pub fn queue_name(&self) -> &str {
        &self.inner.queue_name
    }

    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.inner.registry
    }

    /// Start the consume loop on a spawned task
    ///
    /// Returns `Ok(false)` without doing anything when the loop was already started.
    pub fn begin_processing(&self) -> MessagingResult<bool> {
        self.inner.connection.ensure_open()?;
        if self.started.swap(true, Ordering::AcqRel) {
            debug!(queue = %self.inner.queue_name, "Consumer already processing");
            return Ok(false);
        }

        let inner = Arc::clone(&self.inner);
        let shutdown_rx = self.shutdown_tx.subscribe();
        let handle = tokio::spawn(async move { inner.run(shutdown_rx).await });
        *self.task.lock() = Some(handle);

        info!(queue = %self.inner.queue_name, "Consumer started");
        Ok(true)
    }

    /// Whether the consume loop is currently running
    pub fn is_processing(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Decode, dispatch and settle one delivery
    pub async fn process_delivery(&self, delivery: Delivery) -> DeliveryOutcome {
        self.inner.process_delivery(delivery).await
    }

    pub fn stats(&self) -> ConsumerStats {
        self.inner.counters.snapshot()
    }

    /// Stop receiving, give the in-flight message up to `grace` to finish,
    /// then abort the loop
    pub async fn shutdown(&self, grace: Duration) {
        self.shutdown_tx.send_replace(true);

        let handle = self.task.lock().take();
        let Some(mut handle) = handle else {
            return;
        };

        match tokio::time::timeout(grace, &mut handle).await {
            Ok(Ok(())) => info!(queue = %self.inner.queue_name, "Consumer stopped"),
            Ok(Err(e)) => warn!(queue = %self.inner.queue_name, error = %e, "Consumer task ended abnormally"),
            Err(_) => {
                warn!(
                    queue = %self.inner.queue_name,
                    grace_ms = grace.as_millis() as u64,
                    "Consumer did not stop within grace period, aborting"
                );
                handle.abort();
            }
        }
    }
}

impl Drop for Consumer {
    fn drop(&mut self) {
        self.shutdown_tx.send_replace(true);
    }
}

impl ConsumerInner {
    #[instrument(skip(self, shutdown), fields(queue = %self.queue_name))]
    async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let transport = Arc::clone(self.connection.transport());
        let visibility_timeout = self.config.visibility_timeout();
        let poll_interval = self.config.poll_interval();

        loop {
            if *shutdown.borrow() || self.connection.is_closed() {
                break;
            }

            let received = tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                received = transport.receive(&self.queue_name, visibility_timeout, poll_interval) => received,
            };

            match received {
                Ok(Some(delivery)) => {
                    self.process_delivery(delivery).await;
                }
                Ok(None) => {}
                Err(e) => {
                    if self.connection.is_closed() {
                        break;
                    }
                    ConsumerCounters::bump(&self.counters.transport_errors);
                    warn!(error = %e, "Receive failed, continuing after poll interval");
                    self.connection
                        .log_sink()
                        .log_error(&e, Some(sources::CONSUMER))
                        .await;

                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = tokio::time::sleep(poll_interval) => {}
                    }
                }
            }
        }

        debug!("Consume loop exited");
    }

    async fn process_delivery(&self, delivery: Delivery) -> DeliveryOutcome {
        ConsumerCounters::bump(&self.counters.received);

        let envelope = match Envelope::from_bytes(&delivery.body) {
            Ok(envelope) => envelope,
            Err(e) => {
                ConsumerCounters::bump(&self.counters.decode_failures);
                warn!(
                    queue = %self.queue_name,
                    delivery_id = delivery.delivery_id,
                    error = %e,
                    "Failed to decode delivery"
                );
                self.connection
                    .log_sink()
                    .log(
                        LogLevel::Error,
                        &format!("Failed to decode message {}: {e}", delivery.delivery_id),
                        Some(json!({
                            "queue": self.queue_name,
                            "delivery_id": delivery.delivery_id,
                            "delivery_count": delivery.delivery_count,
                            "payload": delivery.body_lossy(),
                        })),
                        Some(sources::CONSUMER),
                    )
                    .await;
                return self
                    .dead_letter(&delivery, broker::DECODE_FAILURE_REASON, None, e.to_string())
                    .await;
            }
        };

        let Some(resolved) = self.registry.resolve(&envelope.message_type) else {
            return self.unroutable(&delivery, envelope).await;
        };
        debug!(
            queue = %self.queue_name,
            delivery_id = delivery.delivery_id,
            message_type = %envelope.message_type,
            age_ms = envelope.age_ms(),
            "Dispatching message"
        );

        let result = match resolved {
            ResolvedHandler::Handler(handler) => AssertUnwindSafe(handler.receive(&envelope))
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| Err(panic_error(panic))),
            ResolvedHandler::Callback(callback) => {
                std::panic::catch_unwind(AssertUnwindSafe(|| callback(&envelope)))
                    .unwrap_or_else(|panic| Err(panic_error(panic)))
            }
        };

        match result {
            Ok(()) => self.complete(&delivery, envelope.message_type).await,
            Err(e) => {
                let reason = if e.is_decode() {
                    ConsumerCounters::bump(&self.counters.decode_failures);
                    broker::DECODE_FAILURE_REASON
                } else {
                    ConsumerCounters::bump(&self.counters.handler_failures);
                    broker::HANDLER_FAILURE_REASON
                };
                error!(
                    queue = %self.queue_name,
                    delivery_id = delivery.delivery_id,
                    message_type = %envelope.message_type,
                    error = %e,
                    "Handler failed"
                );
                self.connection
                    .log_sink()
                    .log_error(&e, Some(sources::CONSUMER))
                    .await;
                self.dead_letter(&delivery, reason, Some(envelope.message_type), e.to_string())
                    .await
            }
        }
    }

    async fn unroutable(&self, delivery: &Delivery, envelope: Envelope) -> DeliveryOutcome {
        ConsumerCounters::bump(&self.counters.unroutable);
        let message_type = envelope.message_type;
        let policy = self.config.unroutable_policy;

        warn!(
            queue = %self.queue_name,
            delivery_id = delivery.delivery_id,
            message_type = %message_type,
            ?policy,
            "Handler not found"
        );
        self.connection
            .log_sink()
            .log(
                LogLevel::Warning,
                &format!("Handler not found for {message_type}"),
                Some(json!({
                    "queue": self.queue_name,
                    "delivery_id": delivery.delivery_id,
                    "policy": policy,
                })),
                Some(sources::CONSUMER),
            )
            .await;

        match policy {
            UnroutablePolicy::Leave => DeliveryOutcome::Unroutable {
                message_type,
                dead_lettered: false,
            },
            UnroutablePolicy::DeadLetter => {
                match self
                    .dead_letter(
                        delivery,
                        broker::UNROUTABLE_REASON,
                        Some(message_type.clone()),
                        format!("Handler not found for {message_type}"),
                    )
                    .await
                {
                    DeliveryOutcome::DeadLettered { .. } => DeliveryOutcome::Unroutable {
                        message_type,
                        dead_lettered: true,
                    },
                    other => other,
                }
            }
        }
    }

    async fn complete(&self, delivery: &Delivery, message_type: MessageType) -> DeliveryOutcome {
        match self
            .connection
            .transport()
            .complete(&self.queue_name, delivery.delivery_id)
            .await
        {
            Ok(()) => {
                ConsumerCounters::bump(&self.counters.acknowledged);
                logging::log_message_operation(
                    "complete",
                    &self.queue_name,
                    Some(message_type.as_str()),
                    Some(delivery.delivery_id),
                    "acknowledged",
                );
                DeliveryOutcome::Acknowledged { message_type }
            }
            Err(e) => self.settle_failed(SettleAction::Complete, e).await,
        }
    }

    async fn dead_letter(
        &self,
        delivery: &Delivery,
        reason: &'static str,
        message_type: Option<MessageType>,
        error: String,
    ) -> DeliveryOutcome {
        match self
            .connection
            .transport()
            .dead_letter(&self.queue_name, delivery.delivery_id, reason)
            .await
        {
            Ok(()) => {
                ConsumerCounters::bump(&self.counters.dead_lettered);
                logging::log_message_operation(
                    "dead_letter",
                    &self.queue_name,
                    message_type.as_ref().map(MessageType::as_str),
                    Some(delivery.delivery_id),
                    reason,
                );
                DeliveryOutcome::DeadLettered {
                    reason,
                    message_type,
                    error,
                }
            }
            Err(e) => self.settle_failed(SettleAction::DeadLetter, e).await,
        }
    }

    async fn settle_failed(&self, action: SettleAction, e: MessagingError) -> DeliveryOutcome {
        ConsumerCounters::bump(&self.counters.transport_errors);
        warn!(queue = %self.queue_name, ?action, error = %e, "Failed to settle delivery");
        self.connection
            .log_sink()
            .log_error(&e, Some(sources::CONSUMER))
            .await;
        DeliveryOutcome::SettleFailed {
            action,
            error: e.to_string(),
        }
    }
}

fn panic_error(panic: Box<dyn Any + Send>) -> HandlerError {
    let message = panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic payload".to_string());
    HandlerError::Failed(anyhow::anyhow!("handler panicked: {message}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::MemoryLogSink;
    use crate::messaging::memory::InMemoryBroker;
    use crate::messaging::transport::BrokerTransport;

    const QUEUE: &str = "inbound";

    async fn consumer_with(
        policy: UnroutablePolicy,
    ) -> (Arc<InMemoryBroker>, Arc<MemoryLogSink>, Consumer) {
        let broker = Arc::new(InMemoryBroker::new());
        let sink = Arc::new(MemoryLogSink::new());
        let connection = Arc::new(BrokerConnection::new(broker.clone(), sink.clone()));
        let config = ConsumerConfig {
            unroutable_policy: policy,
            ..ConsumerConfig::default()
        };
        let consumer = connection
            .create_consumer(QUEUE, Arc::new(HandlerRegistry::new()), config)
            .await
            .unwrap();
        (broker, sink, consumer)
    }

    async fn deliver(broker: &InMemoryBroker, body: &[u8]) -> Delivery {
        broker.send(QUEUE, body.to_vec()).await.unwrap();
        broker
            .receive(QUEUE, Duration::from_secs(30), Duration::ZERO)
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_malformed_body_is_dead_lettered() {
        let (broker, sink, consumer) = consumer_with(UnroutablePolicy::DeadLetter).await;
        let delivery = deliver(&broker, b"not json").await;

        let outcome = consumer.process_delivery(delivery).await;
        assert!(matches!(
            outcome,
            DeliveryOutcome::DeadLettered { reason: broker::DECODE_FAILURE_REASON, .. }
        ));
        assert_eq!(broker.dead_letters(QUEUE).len(), 1);
        assert_eq!(consumer.stats().decode_failures, 1);

        let records = sink.records_from(sources::CONSUMER);
        assert_eq!(records[0].data.as_ref().unwrap()["payload"], "not json");
    }

    #[tokio::test]
    async fn test_unroutable_leave_policy() {
        let (broker, sink, consumer) = consumer_with(UnroutablePolicy::Leave).await;
        let body = Envelope::new("farm.unknown.Thing", json!({})).to_bytes().unwrap();
        let delivery = deliver(&broker, &body).await;

        let outcome = consumer.process_delivery(delivery).await;
        assert_eq!(
            outcome,
            DeliveryOutcome::Unroutable {
                message_type: MessageType::new("farm.unknown.Thing"),
                dead_lettered: false,
            }
        );
        assert_eq!(broker.in_flight_count(QUEUE), 1);
        assert!(broker.dead_letters(QUEUE).is_empty());
        assert_eq!(broker.completed_count(QUEUE), 0);
        assert_eq!(
            sink.records_at_least(LogLevel::Warning)[0].message,
            "Handler not found for farm.unknown.Thing"
        );
    }

    #[tokio::test]
    async fn test_unroutable_dead_letter_policy() {
        let (broker, _sink, consumer) = consumer_with(UnroutablePolicy::DeadLetter).await;
        let body = Envelope::new("farm.unknown.Thing", json!({})).to_bytes().unwrap();
        let delivery = deliver(&broker, &body).await;

        let outcome = consumer.process_delivery(delivery).await;
        assert!(outcome.is_dead_lettered());
        assert_eq!(broker.dead_letters(QUEUE)[0].reason, broker::UNROUTABLE_REASON);
    }

    #[tokio::test]
    async fn test_callback_panic_is_dead_lettered() {
        let (broker, _sink, consumer) = consumer_with(UnroutablePolicy::DeadLetter).await;
        consumer
            .registry()
            .register_callback_for("farm.flaky", |_| panic!("sensor bus reset"));
        let body = Envelope::new("farm.flaky", json!({})).to_bytes().unwrap();
        let delivery = deliver(&broker, &body).await;

        let outcome = consumer.process_delivery(delivery).await;
        match outcome {
            DeliveryOutcome::DeadLettered { reason, error, .. } => {
                assert_eq!(reason, broker::HANDLER_FAILURE_REASON);
                assert!(error.contains("sensor bus reset"));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(consumer.stats().handler_failures, 1);
    }

    #[tokio::test]
    async fn test_complete_failure_is_reported() {
        let (broker, _sink, consumer) = consumer_with(UnroutablePolicy::DeadLetter).await;
        consumer
            .registry()
            .register_callback_for("farm.ok", |_| Ok(()));
        let body = Envelope::new("farm.ok", json!({})).to_bytes().unwrap();
        let delivery = deliver(&broker, &body).await;
        broker.fail_next_completes(1);

        let outcome = consumer.process_delivery(delivery).await;
        assert!(matches!(
            outcome,
            DeliveryOutcome::SettleFailed { action: SettleAction::Complete, .. }
        ));
        assert_eq!(broker.in_flight_count(QUEUE), 1);
        assert_eq!(consumer.stats().transport_errors, 1);
    }

    #[tokio::test]
    async fn test_begin_processing_is_idempotent() {
        let (_broker, _sink, consumer) = consumer_with(UnroutablePolicy::DeadLetter).await;
        assert!(consumer.begin_processing().unwrap());
        assert!(!consumer.begin_processing().unwrap());
        assert!(consumer.is_processing());

        consumer.shutdown(Duration::from_secs(1)).await;
        assert!(!consumer.is_processing());
    }

    #[test]
    fn test_policy_serde_names() {
        assert_eq!(
            serde_json::to_value(UnroutablePolicy::DeadLetter).unwrap(),
            json!("dead_letter")
        );
        let policy: UnroutablePolicy = serde_json::from_value(json!("leave")).unwrap();
        assert_eq!(policy, UnroutablePolicy::Leave);
    }
}
