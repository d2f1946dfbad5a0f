//! # Messaging Module
//!
//! Broker-facing half of the runtime: the envelope wire shape, the transport
//! seam and its implementations, the handler registry, and the consumers and
//! publishers manufactured by a [`BrokerConnection`].

pub mod batch;
pub mod connection;
pub mod consumer;
pub mod envelope;
pub mod errors;
pub mod memory;
#[cfg(feature = "postgres")]
pub mod pgmq_transport;
pub mod publisher;
pub mod registry;
pub mod transport;

pub use batch::MessageBatch;
pub use connection::BrokerConnection;
pub use consumer::{
    Consumer, ConsumerStats, DeliveryOutcome, SettleAction, UnroutablePolicy,
};
pub use envelope::{Envelope, Message, MessageType};
pub use errors::{MessagingError, MessagingResult};
pub use memory::{DeadLetterRecord, InMemoryBroker};
#[cfg(feature = "postgres")]
pub use pgmq_transport::PgmqTransport;
pub use publisher::{BatchOutcome, BatchPublishReport, PublishReceipt, Publisher};
pub use registry::{
    Callback, Handler, HandlerError, HandlerRegistry, HandlerResult, MessageHandler,
    ResolvedHandler,
};
pub use transport::{BrokerTransport, Delivery};
