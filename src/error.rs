//! Crate-level error type wrapping each area's errors.

use thiserror::Error;

use crate::config::ConfigurationError;
use crate::messaging::{HandlerError, MessagingError};
use crate::workers::WorkerError;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Messaging(#[from] MessagingError),

    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error(transparent)]
    Worker(#[from] WorkerError),

    #[error(transparent)]
    Handler(#[from] HandlerError),
}

pub type Result<T> = std::result::Result<T, DispatchError>;
