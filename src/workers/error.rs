//! Worker and supervisor error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Worker {worker_name} did not reply within {timeout_ms}ms")]
    Timeout { worker_name: String, timeout_ms: u64 },

    #[error("Unknown worker type: {worker_type}")]
    UnknownWorkerType { worker_type: String },

    #[error("No route registered for {route_key}")]
    UnknownRoute { route_key: String },

    #[error("Mailbox closed: {target}")]
    MailboxClosed { target: String },

    #[error("Worker {worker_name} failed to start: {message}")]
    StartFailed { worker_name: String, message: String },

    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

impl WorkerError {
    pub fn unknown_worker_type(worker_type: impl Into<String>) -> Self {
        Self::UnknownWorkerType {
            worker_type: worker_type.into(),
        }
    }

    pub fn mailbox_closed(target: impl Into<String>) -> Self {
        Self::MailboxClosed {
            target: target.into(),
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

pub type WorkerResult<T> = Result<T, WorkerError>;
