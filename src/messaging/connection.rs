//! # Broker Connection
//!
//! Owns the single transport handle for the process. Consumers and publishers
//! are manufactured from it and share it; it is constructed once at startup,
//! passed around as `Arc<BrokerConnection>`, and closed once at shutdown.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

use super::consumer::Consumer;
use super::errors::{MessagingError, MessagingResult};
use super::memory::InMemoryBroker;
use super::publisher::Publisher;
use super::registry::HandlerRegistry;
use super::transport::BrokerTransport;
use crate::config::{BrokerConfig, ConsumerConfig, PublisherConfig};
use crate::constants::sources;
use crate::logging::{LogLevel, LogSink};

/// The process-wide broker connection
#[derive(Debug)]
pub struct BrokerConnection {
    transport: Arc<dyn BrokerTransport>,
    log_sink: Arc<dyn LogSink>,
    closed: AtomicBool,
}

impl BrokerConnection {
    pub fn new(transport: Arc<dyn BrokerTransport>, log_sink: Arc<dyn LogSink>) -> Self {
        Self {
            transport,
            log_sink,
            closed: AtomicBool::new(false),
        }
    }

    /// Open the transport named by the broker host
    ///
    /// `memory://` selects the in-process broker; `postgres://` and
    /// `postgresql://` select pgmq and require the `postgres` feature.
    pub async fn connect(config: &BrokerConfig, log_sink: Arc<dyn LogSink>) -> MessagingResult<Self> {
        let host = config.host.trim();
        let transport: Arc<dyn BrokerTransport> = if host.starts_with("memory://") {
            Arc::new(InMemoryBroker::with_max_batch_bytes(config.max_batch_bytes))
        } else if host.starts_with("postgres://") || host.starts_with("postgresql://") {
            Self::connect_postgres(host, config.max_batch_bytes).await?
        } else {
            return Err(MessagingError::configuration(
                "broker",
                format!("unsupported broker host: {}", config.sanitized_host()),
            ));
        };

        info!(
            transport = transport.name(),
            host = %config.sanitized_host(),
            "Broker connection established"
        );
        Ok(Self::new(transport, log_sink))
    }

    #[cfg(feature = "postgres")]
    async fn connect_postgres(
        host: &str,
        max_batch_bytes: usize,
    ) -> MessagingResult<Arc<dyn BrokerTransport>> {
        let transport = super::pgmq_transport::PgmqTransport::connect(host)
            .await?
            .with_max_batch_bytes(max_batch_bytes);
        Ok(Arc::new(transport))
    }

    #[cfg(not(feature = "postgres"))]
    async fn connect_postgres(
        _host: &str,
        _max_batch_bytes: usize,
    ) -> MessagingResult<Arc<dyn BrokerTransport>> {
        Err(MessagingError::configuration(
            "broker",
            "postgres broker requires the `postgres` feature",
        ))
    }

    pub fn transport(&self) -> &Arc<dyn BrokerTransport> {
        &self.transport
    }

    pub fn log_sink(&self) -> &Arc<dyn LogSink> {
        &self.log_sink
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn ensure_open(&self) -> MessagingResult<()> {
        if self.is_closed() {
            Err(MessagingError::ConnectionClosed)
        } else {
            Ok(())
        }
    }

    /// Create a consumer for `queue_name`, creating the queue if needed
    pub async fn create_consumer(
        self: &Arc<Self>,
        queue_name: impl Into<String>,
        registry: Arc<HandlerRegistry>,
        config: ConsumerConfig,
    ) -> MessagingResult<Consumer> {
        self.ensure_open()?;
        let queue_name = queue_name.into();
        self.transport.ensure_queue(&queue_name).await?;
        Ok(Consumer::new(Arc::clone(self), queue_name, registry, config))
    }

    /// Create a publisher for `queue_name` with default publishing settings
    pub async fn create_publisher(
        self: &Arc<Self>,
        queue_name: impl Into<String>,
    ) -> MessagingResult<Publisher> {
        self.create_publisher_with_config(queue_name, PublisherConfig::default())
            .await
    }

    /// Create a publisher for `queue_name`, creating the queue if needed
    pub async fn create_publisher_with_config(
        self: &Arc<Self>,
        queue_name: impl Into<String>,
        config: PublisherConfig,
    ) -> MessagingResult<Publisher> {
        self.ensure_open()?;
        if config.default_batch_size == 0 {
            return Err(MessagingError::InvalidBatchSize { batch_size: 0 });
        }
        let queue_name = queue_name.into();
        self.transport.ensure_queue(&queue_name).await?;
        Ok(Publisher::new(Arc::clone(self), queue_name, config))
    }

    /// Close the transport; later calls are no-ops
    pub async fn close(&self) -> MessagingResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        match self.transport.close().await {
            Ok(()) => {
                info!(transport = self.transport.name(), "Broker connection closed");
                self.log_sink
                    .log(
                        LogLevel::Info,
                        "Broker connection closed",
                        None,
                        Some(sources::CONNECTION),
                    )
                    .await;
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "Failed to close broker transport cleanly");
                self.log_sink.log_error(&e, Some(sources::CONNECTION)).await;
                Err(e)
            }
        }
    }
}
