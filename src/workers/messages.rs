//! # Worker Messages
//!
//! Request and reply shapes exchanged between callers, the supervisor and
//! ephemeral workers.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::time::Instant;
use uuid::Uuid;

/// One unit of work handed to a worker
#[derive(Debug, Clone)]
pub struct WorkerRequest {
    pub request_id: Uuid,
    /// Route the request arrived on
    pub route_key: String,
    pub payload: Value,
    /// When the supervisor stops waiting for a reply
    pub deadline: Instant,
}

impl WorkerRequest {
    /// Time left before the deadline, zero once it has passed
    pub fn remaining(&self) -> std::time::Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    Success,
    Failure,
}

/// Reply delivered to the original caller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerResponse {
    pub request_id: Uuid,
    pub status: ResponseStatus,
    pub data: Option<Value>,
    pub error: Option<String>,
}

impl WorkerResponse {
    pub fn success(request_id: Uuid, data: Value) -> Self {
        Self {
            request_id,
            status: ResponseStatus::Success,
            data: Some(data),
            error: None,
        }
    }

    pub fn failure(request_id: Uuid, error: impl Into<String>) -> Self {
        Self {
            request_id,
            status: ResponseStatus::Failure,
            data: None,
            error: Some(error.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ResponseStatus::Success
    }

    /// Data on success, the error text on failure
    pub fn into_result(self) -> Result<Option<Value>, String> {
        match self.status {
            ResponseStatus::Success => Ok(self.data),
            ResponseStatus::Failure => Err(self
                .error
                .unwrap_or_else(|| "worker reported failure".to_string())),
        }
    }
}

/// A request addressed to the supervisor
#[derive(Debug)]
pub struct SupervisorMessage {
    pub request_id: Uuid,
    pub route_key: String,
    pub payload: Value,
    /// Where the response goes; `None` for fire-and-forget
    pub reply_to: Option<oneshot::Sender<WorkerResponse>>,
}

impl SupervisorMessage {
    pub fn new(route_key: impl Into<String>, payload: Value) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            route_key: route_key.into(),
            payload,
            reply_to: None,
        }
    }

    pub fn with_reply_to(mut self, reply_to: oneshot::Sender<WorkerResponse>) -> Self {
        self.reply_to = Some(reply_to);
        self
    }

    /// Deliver `response` to the caller, if one is waiting
    pub(crate) fn reply(self, response: WorkerResponse) {
        if let Some(reply_to) = self.reply_to {
            let _ = reply_to.send(response);
        }
    }
}
