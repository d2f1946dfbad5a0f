//! # Worker Traits
//!
//! Lifecycle and handling contracts for the actor-like primitives run by the
//! [`Supervisor`](super::Supervisor).
//!
//! ```text
//! SupervisorMessage ──→ Supervisor ──┬─→ Route::Inline   ──→ InlineHandler
//!                                    │
//!                                    └─→ Route::Instance ──→ WorkerFactory ──→ Worker (one request)
//! ```

use async_trait::async_trait;
use serde_json::Value;

use super::error::WorkerResult;
use super::messages::WorkerRequest;
use super::scope::WorkerScope;

/// A disposable worker that handles exactly one request
///
/// ## Lifecycle
///
/// - `started()`: called once the worker task is running (default: no-op)
/// - `handle()`: called with the single request
/// - `stopped()`: called after the reply when the mailbox closes (default: no-op).
///   Not called when the worker is aborted at the timeout; the scope is
///   released either way.
#[async_trait]
pub trait Worker: Send + 'static {
    /// Worker name for logging
    fn name(&self) -> &str;

    /// Called when the worker is started
    ///
    /// An error here fails the request without calling `handle`.
    fn started(&mut self) -> WorkerResult<()> {
        Ok(())
    }

    /// Handle the request and produce the reply data
    async fn handle(&mut self, request: WorkerRequest) -> WorkerResult<Value>;

    /// Called when the worker is being stopped
    ///
    /// Errors are logged, not propagated.
    fn stopped(&mut self) -> WorkerResult<()> {
        Ok(())
    }
}

/// A worker type that can be built from a scope by the factory
pub trait FromScope: Worker + Sized {
    /// Type tag the factory registers the constructor under
    const WORKER_TYPE: &'static str;

    fn from_scope(scope: WorkerScope) -> WorkerResult<Self>;
}

/// A request handled by the supervisor itself, without spawning a worker
#[async_trait]
pub trait InlineHandler: Send + Sync + 'static {
    async fn handle(&self, request: WorkerRequest) -> WorkerResult<Value>;
}
