//! # Workers
//!
//! The supervisory worker model: a long-lived [`Supervisor`] that handles
//! requests inline or hands each one to a disposable [`Worker`] built by the
//! [`WorkerFactory`], bounded by a timeout and torn down afterwards.

pub mod error;
pub mod factory;
pub mod messages;
pub mod scope;
pub mod supervisor;
pub mod traits;

pub use error::{WorkerError, WorkerResult};
pub use factory::{WorkerConstructor, WorkerFactory};
pub use messages::{ResponseStatus, SupervisorMessage, WorkerRequest, WorkerResponse};
pub use scope::WorkerScope;
pub use supervisor::{
    ActiveWorker, Route, Supervisor, SupervisorHandle, SupervisorHandler, SupervisorStats,
};
pub use traits::{FromScope, InlineHandler, Worker};
