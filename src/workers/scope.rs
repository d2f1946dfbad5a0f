//! # Worker Scope
//!
//! Resources composed for exactly one ephemeral worker: its name, a log sink
//! tagged with that name, and an optional publisher. The scope is moved into
//! the worker at construction and released when the worker is dropped, on
//! every exit path including an abort.

use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

use crate::logging::{LogLevel, LogSink};
use crate::messaging::Publisher;

/// Per-invocation resources owned by one worker
#[derive(Debug)]
pub struct WorkerScope {
    worker_name: String,
    worker_type: String,
    log_sink: Arc<dyn LogSink>,
    publisher: Option<Publisher>,
    open_scopes: Arc<AtomicU64>,
}

impl WorkerScope {
    pub(crate) fn new(
        worker_name: String,
        worker_type: String,
        log_sink: Arc<dyn LogSink>,
        publisher: Option<Publisher>,
        open_scopes: Arc<AtomicU64>,
    ) -> Self {
        open_scopes.fetch_add(1, Ordering::AcqRel);
        Self {
            worker_name,
            worker_type,
            log_sink,
            publisher,
            open_scopes,
        }
    }

    /// A scope not tracked by any supervisor, for constructing workers directly
    pub fn detached(worker_name: impl Into<String>, log_sink: Arc<dyn LogSink>) -> Self {
        let worker_name = worker_name.into();
        Self::new(
            worker_name.clone(),
            worker_name,
            log_sink,
            None,
            Arc::new(AtomicU64::new(0)),
        )
    }

    pub fn worker_name(&self) -> &str {
        &self.worker_name
    }

    pub fn worker_type(&self) -> &str {
        &self.worker_type
    }

    pub fn log_sink(&self) -> &Arc<dyn LogSink> {
        &self.log_sink
    }

    pub fn publisher(&self) -> Option<&Publisher> {
        self.publisher.as_ref()
    }

    /// Log with this worker's name as the source
    pub async fn log(&self, level: LogLevel, message: &str, data: Option<Value>) {
        self.log_sink
            .log(level, message, data, Some(&self.worker_name))
            .await;
    }
}

impl Drop for WorkerScope {
    fn drop(&mut self) {
        self.open_scopes.fetch_sub(1, Ordering::AcqRel);
        debug!(worker_name = %self.worker_name, "Worker scope released");
    }
}
