//! # System Constants
//!
//! Operational defaults for the dispatch runtime. Every value here can be
//! overridden through [`RuntimeConfig`](crate::config::RuntimeConfig); these
//! are the values used when a setting is absent.

use std::time::Duration;

/// How long a supervisor waits for an ephemeral worker to reply
pub const DEFAULT_WORKER_TIMEOUT: Duration = Duration::from_secs(30);

/// Grace period for in-flight work during shutdown
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Source tags written to the log sink
pub mod sources {
    pub const CONSUMER: &str = "Consumer";
    pub const PUBLISHER: &str = "Publisher";
    pub const SUPERVISOR: &str = "Supervisor";
    pub const CONNECTION: &str = "BrokerConnection";
    pub const RUNTIME: &str = "WorkerRuntime";
}

/// Broker-facing defaults
pub mod broker {
    /// Default wire-size ceiling for a single batch (256 KiB, the common broker limit)
    pub const DEFAULT_MAX_BATCH_BYTES: usize = 256 * 1024;

    /// Default number of envelopes per published batch
    pub const DEFAULT_BATCH_SIZE: usize = 100;

    /// Default visibility timeout for received messages, in seconds
    pub const DEFAULT_VISIBILITY_TIMEOUT_SECONDS: u64 = 30;

    /// Default idle wait between empty receives, in milliseconds
    pub const DEFAULT_POLL_INTERVAL_MS: u64 = 250;

    /// Dead-letter reason for messages no handler was registered for
    pub const UNROUTABLE_REASON: &str = "unroutable";

    /// Dead-letter reason for bodies that are not valid envelopes
    pub const DECODE_FAILURE_REASON: &str = "decode_failure";

    /// Dead-letter reason for handler or callback errors
    pub const HANDLER_FAILURE_REASON: &str = "handler_failure";
}

/// Worker naming
pub mod workers {
    /// Timestamp portion of an ephemeral worker name
    pub const NAME_TIMESTAMP_FORMAT: &str = "%Y-%m-%d%H:%M:%S:%f";

    /// Mailbox depth for an ephemeral worker; it only ever receives one request
    pub const WORKER_MAILBOX_CAPACITY: usize = 1;

    /// Default supervisor mailbox depth
    pub const DEFAULT_SUPERVISOR_MAILBOX_CAPACITY: usize = 256;
}
