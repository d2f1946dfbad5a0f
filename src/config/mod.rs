//! # Runtime Configuration
//!
//! Settings for the broker connection, consumers, publishers and the supervisor.
//! Loaded once at startup through [`ConfigManager`] from a TOML source with
//! `DISPATCH__SECTION__KEY` environment overrides; never mutated afterwards.
//!
//! Every section carries serde defaults, so a file only needs the values it changes:
//!
//! ```toml
//! [broker]
//! host = "memory://"
//! queue = "farm-telemetry"
//!
//! [consumer]
//! unroutable_policy = "leave"
//!
//! [supervisor]
//! worker_timeout_ms = 5000
//! ```

pub mod error;
pub mod loader;

pub use error::{ConfigResult, ConfigurationError};
pub use loader::ConfigManager;

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::constants::{self, broker, workers};
use crate::messaging::UnroutablePolicy;

/// Root configuration structure
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Broker connection and queue names
    pub broker: BrokerConfig,

    /// Consume loop settings
    pub consumer: ConsumerConfig,

    /// Publishing settings
    pub publisher: PublisherConfig,

    /// Supervisor and ephemeral worker settings
    pub supervisor: SupervisorConfig,
}

/// Broker connection settings
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// `memory://` for the in-process broker, or a `postgres://` connection string
    pub host: String,
    /// Queue consumed by the runtime
    pub queue: String,
    /// Destination for published messages; falls back to `queue`
    pub topic: Option<String>,
    /// Wire-size ceiling for one published batch
    pub max_batch_bytes: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "memory://".to_string(),
            queue: "dispatch".to_string(),
            topic: None,
            max_batch_bytes: broker::DEFAULT_MAX_BATCH_BYTES,
        }
    }
}

impl BrokerConfig {
    /// Queue that publishers send to
    pub fn publish_queue(&self) -> &str {
        self.topic.as_deref().unwrap_or(&self.queue)
    }

    /// Host with any password in a connection string masked
    pub fn sanitized_host(&self) -> String {
        let Some((scheme, rest)) = self.host.split_once("://") else {
            return self.host.clone();
        };
        let Some((credentials, location)) = rest.rsplit_once('@') else {
            return self.host.clone();
        };
        match credentials.split_once(':') {
            Some((user, _password)) => format!("{scheme}://{user}:***@{location}"),
            None => self.host.clone(),
        }
    }
}

/// Consume loop settings
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ConsumerConfig {
    /// How long a received message stays invisible to other receivers
    pub visibility_timeout_seconds: u64,
    /// Receive wait, and the pause after a transport error
    pub poll_interval_ms: u64,
    /// What to do with messages no handler is registered for
    pub unroutable_policy: UnroutablePolicy,
    /// How long shutdown waits for the in-flight message
    pub shutdown_grace_ms: u64,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            visibility_timeout_seconds: broker::DEFAULT_VISIBILITY_TIMEOUT_SECONDS,
            poll_interval_ms: broker::DEFAULT_POLL_INTERVAL_MS,
            unroutable_policy: UnroutablePolicy::default(),
            shutdown_grace_ms: constants::DEFAULT_SHUTDOWN_GRACE.as_millis() as u64,
        }
    }
}

impl ConsumerConfig {
    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_seconds)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

/// Publishing settings
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct PublisherConfig {
    /// Batch size used when the caller does not pick one
    pub default_batch_size: usize,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            default_batch_size: broker::DEFAULT_BATCH_SIZE,
        }
    }
}

/// Supervisor and ephemeral worker settings
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// How long the supervisor waits for a worker's reply
    pub worker_timeout_ms: u64,
    /// Supervisor mailbox depth
    pub mailbox_capacity: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            worker_timeout_ms: constants::DEFAULT_WORKER_TIMEOUT.as_millis() as u64,
            mailbox_capacity: workers::DEFAULT_SUPERVISOR_MAILBOX_CAPACITY,
        }
    }
}

impl SupervisorConfig {
    pub fn worker_timeout(&self) -> Duration {
        Duration::from_millis(self.worker_timeout_ms)
    }
}

impl RuntimeConfig {
    /// Reject settings the runtime cannot run with
    pub fn validate(&self) -> ConfigResult<()> {
        if self.broker.host.trim().is_empty() {
            return Err(ConfigurationError::missing_required_field(
                "host",
                "broker configuration",
            ));
        }
        if self.broker.queue.trim().is_empty() {
            return Err(ConfigurationError::missing_required_field(
                "queue",
                "broker configuration",
            ));
        }
        if matches!(self.broker.topic.as_deref(), Some(topic) if topic.trim().is_empty()) {
            return Err(ConfigurationError::invalid_value(
                "topic",
                "",
                "topic must be omitted or non-empty",
            ));
        }
        if self.broker.max_batch_bytes == 0 {
            return Err(ConfigurationError::invalid_value(
                "max_batch_bytes",
                "0",
                "batches must allow at least one byte",
            ));
        }
        if self.publisher.default_batch_size == 0 {
            return Err(ConfigurationError::invalid_value(
                "default_batch_size",
                "0",
                "batch size must be greater than zero",
            ));
        }
        if self.supervisor.worker_timeout_ms == 0 {
            return Err(ConfigurationError::invalid_value(
                "worker_timeout_ms",
                "0",
                "worker timeout must be greater than zero",
            ));
        }
        if self.supervisor.mailbox_capacity == 0 {
            return Err(ConfigurationError::invalid_value(
                "mailbox_capacity",
                "0",
                "mailbox capacity must be greater than zero",
            ));
        }
        Ok(())
    }
}
