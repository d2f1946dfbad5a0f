//! # Log Sink
//!
//! The collaborator interface the runtime reports message-level events to.
//! Storage is not this crate's concern: [`TracingLogSink`] forwards records to
//! `tracing`, [`MemoryLogSink`] keeps them in memory for inspection, and
//! services that persist logs provide their own implementation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::error::Error as StdError;
use std::fmt;
use uuid::Uuid;

/// Severity of a logged event
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    None,
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LogLevel::None => "none",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warning",
            LogLevel::Error => "error",
            LogLevel::Critical => "critical",
        };
        f.write_str(name)
    }
}

/// A single logged event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRecord {
    pub log_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
    pub source: Option<String>,
    pub data: Option<serde_json::Value>,
}

/// Message text for an error: the error itself, then its immediate cause
pub fn error_message(error: &(dyn StdError + 'static)) -> String {
    let inner = error.source().map(|e| e.to_string()).unwrap_or_default();
    format!("{error} || {inner}")
}

/// Full cause chain of an error as structured data
pub fn error_chain(error: &(dyn StdError + 'static)) -> serde_json::Value {
    let mut chain = Vec::new();
    let mut current = error.source();
    while let Some(cause) = current {
        chain.push(serde_json::Value::String(cause.to_string()));
        current = cause.source();
    }
    serde_json::json!({ "error": error.to_string(), "causes": chain })
}

/// Destination for runtime log events
#[async_trait]
pub trait LogSink: Send + Sync + fmt::Debug {
    /// Log a message at the given level with optional structured data
    async fn log(
        &self,
        level: LogLevel,
        message: &str,
        data: Option<serde_json::Value>,
        source: Option<&str>,
    );

    /// Log an error at `Error` level; the message carries the error and its cause,
    /// the data carries the full chain
    async fn log_error(&self, error: &(dyn StdError + Send + Sync + 'static), source: Option<&str>) {
        self.log(
            LogLevel::Error,
            &error_message(error),
            Some(error_chain(error)),
            source,
        )
        .await;
    }
}

/// Forwards records to the `tracing` subscriber
#[derive(Debug, Default, Clone)]
pub struct TracingLogSink;

#[async_trait]
impl LogSink for TracingLogSink {
    async fn log(
        &self,
        level: LogLevel,
        message: &str,
        data: Option<serde_json::Value>,
        source: Option<&str>,
    ) {
        let source = source.unwrap_or("unknown");
        let data = data.map(|d| d.to_string());
        match level {
            LogLevel::None => {}
            LogLevel::Debug => tracing::debug!(source = %source, data = ?data, "{message}"),
            LogLevel::Info => tracing::info!(source = %source, data = ?data, "{message}"),
            LogLevel::Warning => tracing::warn!(source = %source, data = ?data, "{message}"),
            LogLevel::Error | LogLevel::Critical => {
                tracing::error!(source = %source, level = %level, data = ?data, "{message}")
            }
        }
    }
}

/// Keeps every record in memory
#[derive(Debug, Default)]
pub struct MemoryLogSink {
    records: Mutex<Vec<LogRecord>>,
}

impl MemoryLogSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<LogRecord> {
        self.records.lock().clone()
    }

    /// Records written with the given source tag
    pub fn records_from(&self, source: &str) -> Vec<LogRecord> {
        self.records
            .lock()
            .iter()
            .filter(|r| r.source.as_deref() == Some(source))
            .cloned()
            .collect()
    }

    /// Records at or above `level`
    pub fn records_at_least(&self, level: LogLevel) -> Vec<LogRecord> {
        self.records
            .lock()
            .iter()
            .filter(|r| r.level >= level)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

#[async_trait]
impl LogSink for MemoryLogSink {
    async fn log(
        &self,
        level: LogLevel,
        message: &str,
        data: Option<serde_json::Value>,
        source: Option<&str>,
    ) {
        if level == LogLevel::None {
            return;
        }
        self.records.lock().push(LogRecord {
            log_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            level,
            message: message.to_string(),
            source: source.map(str::to_string),
            data,
        });
    }
}
