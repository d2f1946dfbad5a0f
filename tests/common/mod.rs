//! Shared fixtures for integration tests.
#![allow(dead_code)]

use dispatch_core::config::ConsumerConfig;
use dispatch_core::logging::MemoryLogSink;
use dispatch_core::messaging::{BrokerConnection, Envelope, InMemoryBroker, Message};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SoilReading {
    pub sensor_id: String,
    pub moisture: f64,
}

impl Message for SoilReading {
    const MESSAGE_TYPE: &'static str = "farm.telemetry.SoilReading";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValveCommand {
    pub zone: u32,
    pub open: bool,
}

impl Message for ValveCommand {
    const MESSAGE_TYPE: &'static str = "farm.irrigation.ValveCommand";
}

pub fn reading(seq: usize) -> SoilReading {
    SoilReading {
        sensor_id: format!("sensor-{seq}"),
        moisture: seq as f64 / 10.0,
    }
}

/// Connection over a fresh in-memory broker that records its send history
pub fn memory_connection() -> (Arc<InMemoryBroker>, Arc<MemoryLogSink>, Arc<BrokerConnection>) {
    let broker = Arc::new(InMemoryBroker::new().with_history());
    let sink = Arc::new(MemoryLogSink::new());
    let connection = Arc::new(BrokerConnection::new(broker.clone(), sink.clone()));
    (broker, sink, connection)
}

/// Consumer settings with a short poll interval
pub fn fast_consumer_config() -> ConsumerConfig {
    ConsumerConfig {
        poll_interval_ms: 10,
        shutdown_grace_ms: 500,
        ..ConsumerConfig::default()
    }
}

pub fn encode<M: Message>(message: &M) -> Vec<u8> {
    Envelope::from_message(message)
        .and_then(|envelope| envelope.to_bytes())
        .unwrap()
}

/// Poll `condition` until it holds or `limit` elapses
pub async fn wait_until(limit: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}
