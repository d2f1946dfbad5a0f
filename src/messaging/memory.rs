//! # In-Memory Broker
//!
//! A process-local [`BrokerTransport`] with the delivery semantics the runtime
//! relies on: visibility timeouts with redelivery, explicit completion, and a
//! per-queue dead-letter store. Used for local development, embedded setups
//! and tests. Fault injection hooks let tests simulate transport failures.
//!
//! Send history (`sent_bodies`, `batch_sizes`) is only kept by brokers built
//! with [`InMemoryBroker::with_history`]; the default broker retains nothing
//! once a message is completed.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info};

use super::errors::{MessagingError, MessagingResult};
use super::transport::{BrokerTransport, Delivery};
use crate::constants::broker::DEFAULT_MAX_BATCH_BYTES;

/// A message moved to a queue's dead-letter store
#[derive(Debug, Clone)]
pub struct DeadLetterRecord {
    pub delivery_id: i64,
    pub body: Vec<u8>,
    pub reason: String,
    pub delivery_count: u32,
    pub dead_lettered_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct StoredMessage {
    id: i64,
    body: Vec<u8>,
    delivery_count: u32,
    enqueued_at: DateTime<Utc>,
}

#[derive(Debug)]
struct InFlight {
    message: StoredMessage,
    visible_at: Instant,
}

#[derive(Debug, Default)]
struct QueueState {
    ready: VecDeque<StoredMessage>,
    in_flight: HashMap<i64, InFlight>,
    dead_letters: Vec<DeadLetterRecord>,
    completed: u64,
    history: Option<SendHistory>,
}

#[derive(Debug, Default)]
struct SendHistory {
    /// Size of every successful `send_batch` call, in call order
    batch_sizes: Vec<usize>,
    /// Every body accepted by the queue, in acceptance order
    sent: Vec<Vec<u8>>,
}

impl QueueState {
    /// Return expired in-flight messages to the front of the ready queue
    fn reclaim_expired(&mut self, now: Instant) {
        let mut expired: Vec<i64> = self
            .in_flight
            .iter()
            .filter(|(_, entry)| entry.visible_at <= now)
            .map(|(id, _)| *id)
            .collect();
        expired.sort_unstable_by(|a, b| b.cmp(a));

        for id in expired {
            if let Some(entry) = self.in_flight.remove(&id) {
                self.ready.push_front(entry.message);
            }
        }
    }

    fn accept(&mut self, id: i64, body: Vec<u8>) {
        if let Some(history) = self.history.as_mut() {
            history.sent.push(body.clone());
        }
        self.ready.push_back(StoredMessage {
            id,
            body,
            delivery_count: 0,
            enqueued_at: Utc::now(),
        });
    }
}

#[derive(Debug, Default)]
struct FaultPlan {
    receives: u32,
    sends: u32,
    batches: u32,
    completes: u32,
}

fn take_fault(counter: &mut u32) -> bool {
    if *counter > 0 {
        *counter -= 1;
        true
    } else {
        false
    }
}

/// Process-local broker
#[derive(Debug)]
pub struct InMemoryBroker {
    queues: Mutex<HashMap<String, QueueState>>,
    faults: Mutex<FaultPlan>,
    next_id: AtomicI64,
    notify: Notify,
    max_batch_bytes: usize,
    record_history: bool,
    closed: AtomicBool,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::with_max_batch_bytes(DEFAULT_MAX_BATCH_BYTES)
    }

    /// Create a broker with a custom batch wire-size ceiling
    pub fn with_max_batch_bytes(max_batch_bytes: usize) -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
            faults: Mutex::new(FaultPlan::default()),
            next_id: AtomicI64::new(1),
            notify: Notify::new(),
            max_batch_bytes,
            record_history: false,
            closed: AtomicBool::new(false),
        }
    }

    /// Keep every accepted body and batch size for inspection
    ///
    /// History grows with every send, so leave it off outside tests.
    pub fn with_history(mut self) -> Self {
        self.record_history = true;
        self
    }

    fn ensure_open(&self, operation: &str) -> MessagingResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(MessagingError::transport(operation, "broker is closed"));
        }
        Ok(())
    }

    fn with_queue<T>(
        &self,
        queue_name: &str,
        f: impl FnOnce(&mut QueueState) -> T,
    ) -> MessagingResult<T> {
        let mut queues = self.queues.lock();
        let queue = queues
            .get_mut(queue_name)
            .ok_or_else(|| MessagingError::queue_not_found(queue_name))?;
        Ok(f(queue))
    }

    fn try_take(&self, queue_name: &str, visibility_timeout: Duration) -> MessagingResult<Option<Delivery>> {
        self.with_queue(queue_name, |queue| {
            let now = Instant::now();
            queue.reclaim_expired(now);

            queue.ready.pop_front().map(|mut message| {
                message.delivery_count += 1;
                let delivery = Delivery {
                    delivery_id: message.id,
                    queue_name: queue_name.to_string(),
                    body: message.body.clone(),
                    delivery_count: message.delivery_count,
                    enqueued_at: message.enqueued_at,
                };
                queue.in_flight.insert(
                    message.id,
                    InFlight {
                        message,
                        visible_at: now + visibility_timeout,
                    },
                );
                delivery
            })
        })
    }

    /// Fail the next `count` receive calls with a transport error
    pub fn fail_next_receives(&self, count: u32) {
        self.faults.lock().receives += count;
    }

    /// Fail the next `count` single sends with a transport error
    pub fn fail_next_sends(&self, count: u32) {
        self.faults.lock().sends += count;
    }

    /// Fail the next `count` batch sends with a transport error
    pub fn fail_next_batches(&self, count: u32) {
        self.faults.lock().batches += count;
    }

    /// Fail the next `count` completions with a transport error
    pub fn fail_next_completes(&self, count: u32) {
        self.faults.lock().completes += count;
    }

    /// Messages waiting to be received
    pub fn ready_count(&self, queue_name: &str) -> usize {
        self.with_queue(queue_name, |q| q.ready.len()).unwrap_or(0)
    }

    /// Messages received but neither completed nor dead-lettered
    pub fn in_flight_count(&self, queue_name: &str) -> usize {
        self.with_queue(queue_name, |q| q.in_flight.len()).unwrap_or(0)
    }

    /// Messages acknowledged so far
    pub fn completed_count(&self, queue_name: &str) -> u64 {
        self.with_queue(queue_name, |q| q.completed).unwrap_or(0)
    }

    /// Snapshot of the queue's dead-letter store
    pub fn dead_letters(&self, queue_name: &str) -> Vec<DeadLetterRecord> {
        self.with_queue(queue_name, |q| q.dead_letters.clone())
            .unwrap_or_default()
    }

    /// Sizes of the batches accepted by `send_batch`, in call order
    ///
    /// Empty unless the broker was built [`with_history`](Self::with_history).
    pub fn batch_sizes(&self, queue_name: &str) -> Vec<usize> {
        self.with_queue(queue_name, |q| {
            q.history
                .as_ref()
                .map(|h| h.batch_sizes.clone())
                .unwrap_or_default()
        })
        .unwrap_or_default()
    }

    /// Every body the queue accepted, in order
    ///
    /// Empty unless the broker was built [`with_history`](Self::with_history).
    pub fn sent_bodies(&self, queue_name: &str) -> Vec<Vec<u8>> {
        self.with_queue(queue_name, |q| {
            q.history.as_ref().map(|h| h.sent.clone()).unwrap_or_default()
        })
        .unwrap_or_default()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[async_trait]
impl BrokerTransport for InMemoryBroker {
    fn name(&self) -> &'static str {
        "in_memory"
    }

    async fn ensure_queue(&self, queue_name: &str) -> MessagingResult<()> {
        self.ensure_open("ensure_queue")?;
        let mut queues = self.queues.lock();
        if !queues.contains_key(queue_name) {
            let state = QueueState {
                history: self.record_history.then(SendHistory::default),
                ..QueueState::default()
            };
            queues.insert(queue_name.to_string(), state);
            debug!(queue = %queue_name, "Created in-memory queue");
        }
        Ok(())
    }

    async fn receive(
        &self,
        queue_name: &str,
        visibility_timeout: Duration,
        wait: Duration,
    ) -> MessagingResult<Option<Delivery>> {
        self.ensure_open("receive")?;
        if take_fault(&mut self.faults.lock().receives) {
            return Err(MessagingError::transport("receive", "injected receive failure"));
        }

        let deadline = Instant::now() + wait;
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(delivery) = self.try_take(queue_name, visibility_timeout)? {
                return Ok(Some(delivery));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(deadline) => {}
            }
            if self.closed.load(Ordering::Acquire) {
                return Err(MessagingError::ConnectionClosed);
            }
        }
    }

    async fn complete(&self, queue_name: &str, delivery_id: i64) -> MessagingResult<()> {
        self.ensure_open("complete")?;
        if take_fault(&mut self.faults.lock().completes) {
            return Err(MessagingError::transport("complete", "injected complete failure"));
        }

        self.with_queue(queue_name, |queue| {
            queue
                .in_flight
                .remove(&delivery_id)
                .map(|_| queue.completed += 1)
        })?
        .ok_or_else(|| MessagingError::UnknownDelivery {
            queue_name: queue_name.to_string(),
            delivery_id,
        })
    }

    async fn dead_letter(
        &self,
        queue_name: &str,
        delivery_id: i64,
        reason: &str,
    ) -> MessagingResult<()> {
        self.ensure_open("dead_letter")?;

        self.with_queue(queue_name, |queue| {
            queue.in_flight.remove(&delivery_id).map(|entry| {
                queue.dead_letters.push(DeadLetterRecord {
                    delivery_id,
                    body: entry.message.body,
                    reason: reason.to_string(),
                    delivery_count: entry.message.delivery_count,
                    dead_lettered_at: Utc::now(),
                });
            })
        })?
        .ok_or_else(|| MessagingError::UnknownDelivery {
            queue_name: queue_name.to_string(),
            delivery_id,
        })
    }

    async fn send(&self, queue_name: &str, body: Vec<u8>) -> MessagingResult<i64> {
        self.ensure_open("send")?;
        if take_fault(&mut self.faults.lock().sends) {
            return Err(MessagingError::transport("send", "injected send failure"));
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.with_queue(queue_name, |queue| queue.accept(id, body))?;
        self.notify.notify_waiters();
        Ok(id)
    }

    async fn send_batch(&self, queue_name: &str, bodies: Vec<Vec<u8>>) -> MessagingResult<Vec<i64>> {
        self.ensure_open("send_batch")?;
        if take_fault(&mut self.faults.lock().batches) {
            return Err(MessagingError::transport("send_batch", "injected batch failure"));
        }

        let total: usize = bodies.iter().map(Vec::len).sum();
        if total > self.max_batch_bytes {
            return Err(MessagingError::transport(
                "send_batch",
                format!("batch of {total} bytes exceeds {} bytes", self.max_batch_bytes),
            ));
        }

        let ids = self.with_queue(queue_name, |queue| {
            if let Some(history) = queue.history.as_mut() {
                history.batch_sizes.push(bodies.len());
            }
            bodies
                .into_iter()
                .map(|body| {
                    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                    queue.accept(id, body);
                    id
                })
                .collect::<Vec<_>>()
        })?;
        self.notify.notify_waiters();
        Ok(ids)
    }

    fn max_batch_bytes(&self) -> usize {
        self.max_batch_bytes
    }

    async fn close(&self) -> MessagingResult<()> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            info!("In-memory broker closed");
        }
        self.notify.notify_waiters();
        Ok(())
    }
}
