#![allow(clippy::doc_markdown)] // Allow technical terms like PostgreSQL, PGMQ in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Dispatch Core Rust
//!
//! Message-driven worker runtime: consume typed envelopes from a broker queue,
//! dispatch them to registered handlers, publish results in size-bounded
//! batches, and run request work in short-lived supervised workers.
//!
//! ## Architecture
//!
//! A single [`BrokerConnection`](messaging::BrokerConnection) owns the
//! transport and manufactures consumers and publishers that share it.
//! Consumers resolve each delivery's message type through the
//! [`HandlerRegistry`](messaging::HandlerRegistry) and settle it exactly once:
//! completed on success, dead-lettered on decode or handler failure.
//!
//! The [`Supervisor`](workers::Supervisor) is a long-lived actor that either
//! answers a request inline or builds a fresh [`Worker`](workers::Worker)
//! for it, waits for the reply under a timeout, and tears the worker down.
//!
//! ## Module Organization
//!
//! - [`messaging`] - Envelopes, transports, registry, consumers and publishers
//! - [`workers`] - Supervisor, worker factory and worker lifecycle
//! - [`runtime`] - Process-level composition and ordered shutdown
//! - [`config`] - TOML and environment configuration
//! - [`logging`] - Structured logging and the log sink interface
//! - [`error`] - Crate-level error type
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use dispatch_core::config::ConfigManager;
//! use dispatch_core::runtime::WorkerRuntime;
//!
//! # async fn example() -> dispatch_core::Result<()> {
//! dispatch_core::logging::init_structured_logging();
//!
//! let manager = ConfigManager::load_from_file("config/dispatch.toml")?;
//! let runtime = WorkerRuntime::builder(manager.config().clone())
//!     .build()
//!     .await?;
//!
//! runtime.run_until_shutdown_signal().await
//! # }
//! ```
//!
//! ## Testing
//!
//! The in-memory broker backs every test; the PGMQ transport is behind the
//! `postgres` feature.
//!
//! ```bash
//! cargo test --lib    # Unit tests
//! cargo test          # All tests
//! ```

pub mod config;
pub mod constants;
pub mod error;
pub mod logging;
pub mod messaging;
pub mod runtime;
pub mod workers;

pub use config::{ConfigManager, RuntimeConfig};
pub use error::{DispatchError, Result};
pub use messaging::{
    BrokerConnection, BrokerTransport, Consumer, Envelope, HandlerRegistry, InMemoryBroker,
    Message, MessagingError, Publisher,
};
pub use runtime::{WorkerRuntime, WorkerRuntimeBuilder};
pub use workers::{
    FromScope, Supervisor, SupervisorHandle, Worker, WorkerError, WorkerFactory, WorkerRequest,
    WorkerResponse, WorkerScope,
};
