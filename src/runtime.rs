//! # Worker Runtime
//!
//! Process-level composition: one broker connection, a publisher on the
//! publish queue, the supervisor, and one or more consumers sharing a handler
//! registry. Startup creates them in that order and shutdown walks it back:
//! consumers stop first (grace period, then abort), then the supervisor drains,
//! then the connection is closed.

use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

use crate::config::{ConfigManager, RuntimeConfig};
use crate::constants::sources;
use crate::error::Result;
use crate::logging::{LogLevel, LogSink, TracingLogSink};
use crate::messaging::{
    BrokerConnection, BrokerTransport, Consumer, ConsumerStats, HandlerRegistry, Publisher,
};
use crate::workers::{
    FromScope, InlineHandler, Supervisor, SupervisorHandle, SupervisorHandler, Worker,
    WorkerFactory, WorkerResult, WorkerScope,
};

/// Collects handlers, worker types and routes before anything is started
pub struct WorkerRuntimeBuilder {
    config: RuntimeConfig,
    log_sink: Arc<dyn LogSink>,
    transport: Option<Arc<dyn BrokerTransport>>,
    registry: Arc<HandlerRegistry>,
    factory: WorkerFactory,
    inline_routes: Vec<(String, Arc<dyn InlineHandler>)>,
    worker_routes: Vec<(String, String)>,
    extra_queues: Vec<String>,
}

impl WorkerRuntimeBuilder {
    pub fn new(config: RuntimeConfig) -> Self {
        Self {
            config,
            log_sink: Arc::new(TracingLogSink),
            transport: None,
            registry: Arc::new(HandlerRegistry::new()),
            factory: WorkerFactory::new(),
            inline_routes: Vec::new(),
            worker_routes: Vec::new(),
            extra_queues: Vec::new(),
        }
    }

    pub fn from_manager(manager: &ConfigManager) -> Self {
        Self::new(manager.config().clone())
    }

    pub fn with_log_sink(mut self, log_sink: Arc<dyn LogSink>) -> Self {
        self.log_sink = log_sink;
        self
    }

    /// Use this transport instead of connecting to `broker.host`
    pub fn with_transport(mut self, transport: Arc<dyn BrokerTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Registry the consumers dispatch from; handlers may be added to it at any time
    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.registry
    }

    pub fn register_worker<W: FromScope>(mut self) -> Self {
        self.factory.register::<W>();
        self
    }

    pub fn register_worker_fn<F>(mut self, worker_type: impl Into<String>, constructor: F) -> Self
    where
        F: Fn(WorkerScope) -> WorkerResult<Box<dyn Worker>> + Send + Sync + 'static,
    {
        self.factory.register_fn(worker_type, constructor);
        self
    }

    /// Messages of `message_type` are handled by the supervisor itself
    pub fn dispatch_inline(
        mut self,
        message_type: impl Into<String>,
        handler: Arc<dyn InlineHandler>,
    ) -> Self {
        self.inline_routes.push((message_type.into(), handler));
        self
    }

    /// Each message of `message_type` is handled by a new worker of `worker_type`
    pub fn dispatch_to_worker(
        mut self,
        message_type: impl Into<String>,
        worker_type: impl Into<String>,
    ) -> Self {
        self.worker_routes
            .push((message_type.into(), worker_type.into()));
        self
    }

    /// Consume another queue besides `broker.queue`
    pub fn consume_queue(mut self, queue_name: impl Into<String>) -> Self {
        self.extra_queues.push(queue_name.into());
        self
    }

    pub async fn build(mut self) -> Result<WorkerRuntime> {
        self.config.validate()?;

        let connection = Arc::new(match self.transport.take() {
            Some(transport) => BrokerConnection::new(transport, Arc::clone(&self.log_sink)),
            None => BrokerConnection::connect(&self.config.broker, Arc::clone(&self.log_sink)).await?,
        });

        match self.assemble(&connection).await {
            Ok(runtime) => Ok(runtime),
            Err(e) => {
                error!(error = %e, "Failed to assemble worker runtime");
                if let Err(close_error) = connection.close().await {
                    warn!(error = %close_error, "Failed to close broker connection after startup failure");
                }
                Err(e)
            }
        }
    }

    async fn assemble(self, connection: &Arc<BrokerConnection>) -> Result<WorkerRuntime> {
        let Self {
            config,
            log_sink,
            registry,
            factory,
            inline_routes,
            worker_routes,
            extra_queues,
            ..
        } = self;

        let publisher = connection
            .create_publisher_with_config(config.broker.publish_queue(), config.publisher.clone())
            .await?;

        let mut supervisor = Supervisor::new(factory, Arc::clone(&log_sink), config.supervisor.clone())
            .with_publisher(publisher.clone());
        let mut routed_types = Vec::new();
        for (message_type, handler) in inline_routes {
            supervisor = supervisor.route_inline(message_type.clone(), handler);
            routed_types.push(message_type);
        }
        for (message_type, worker_type) in worker_routes {
            supervisor = supervisor.route_instance(message_type.clone(), worker_type);
            routed_types.push(message_type);
        }
        let supervisor = supervisor.spawn()?;

        for message_type in routed_types {
            registry.register_handler(
                message_type,
                Arc::new(SupervisorHandler::new(supervisor.clone())),
            );
        }

        let mut consumers = Vec::with_capacity(1 + extra_queues.len());
        for queue_name in std::iter::once(config.broker.queue.clone()).chain(extra_queues) {
            let consumer = connection
                .create_consumer(queue_name, Arc::clone(&registry), config.consumer.clone())
                .await;
            match consumer {
                Ok(consumer) => consumers.push(consumer),
                Err(e) => {
                    supervisor.shutdown().await?;
                    return Err(e.into());
                }
            }
        }

        info!(
            consumers = consumers.len(),
            publish_queue = %publisher.queue_name(),
            handlers = registry.len(),
            "Worker runtime assembled"
        );

        Ok(WorkerRuntime {
            config,
            connection: Arc::clone(connection),
            registry,
            publisher,
            supervisor,
            consumers,
            log_sink,
        })
    }
}

/// A running composition of connection, consumers, publisher and supervisor
pub struct WorkerRuntime {
    config: RuntimeConfig,
    connection: Arc<BrokerConnection>,
    registry: Arc<HandlerRegistry>,
    publisher: Publisher,
    supervisor: SupervisorHandle,
    consumers: Vec<Consumer>,
    log_sink: Arc<dyn LogSink>,
}

impl std::fmt::Debug for WorkerRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerRuntime")
            .field("queues", &self.queue_names())
            .field("publish_queue", &self.publisher.queue_name())
            .field("supervisor", &self.supervisor)
            .finish()
    }
}

impl WorkerRuntime {
    pub fn builder(config: RuntimeConfig) -> WorkerRuntimeBuilder {
        WorkerRuntimeBuilder::new(config)
    }

    /// Begin processing on every consumer
    pub async fn start(&self) -> Result<()> {
        for consumer in &self.consumers {
            consumer.begin_processing()?;
        }
        info!(queues = ?self.queue_names(), "Worker runtime started");
        self.log_sink
            .log(
                LogLevel::Info,
                "Worker runtime started",
                Some(serde_json::json!({ "queues": self.queue_names() })),
                Some(sources::RUNTIME),
            )
            .await;
        Ok(())
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn connection(&self) -> &Arc<BrokerConnection> {
        &self.connection
    }

    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.registry
    }

    pub fn publisher(&self) -> &Publisher {
        &self.publisher
    }

    pub fn supervisor(&self) -> &SupervisorHandle {
        &self.supervisor
    }

    pub fn queue_names(&self) -> Vec<String> {
        self.consumers
            .iter()
            .map(|consumer| consumer.queue_name().to_string())
            .collect()
    }

    pub fn consumer_stats(&self) -> Vec<(String, ConsumerStats)> {
        self.consumers
            .iter()
            .map(|consumer| (consumer.queue_name().to_string(), consumer.stats()))
            .collect()
    }

    /// Stop consumers, then the supervisor, then close the connection
    pub async fn shutdown(self) -> Result<()> {
        info!("Shutting down worker runtime");
        let grace = self.config.consumer.shutdown_grace();

        for consumer in &self.consumers {
            consumer.shutdown(grace).await;
        }
        self.supervisor.shutdown().await?;
        self.connection.close().await?;

        self.log_sink
            .log(
                LogLevel::Info,
                "Worker runtime stopped",
                Some(serde_json::json!({
                    "consumers": self.consumer_stats(),
                    "supervisor": self.supervisor.stats(),
                })),
                Some(sources::RUNTIME),
            )
            .await;
        info!("Worker runtime shutdown complete");
        Ok(())
    }

    /// Start, wait for Ctrl+C or SIGTERM, then shut down
    pub async fn run_until_shutdown_signal(self) -> Result<()> {
        self.start().await?;
        info!("Press Ctrl+C to shutdown gracefully");
        shutdown_signal().await;
        info!("Shutdown signal received, initiating graceful shutdown");
        self.shutdown().await
    }
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C");
        },
        _ = terminate => {
            info!("Received SIGTERM");
        },
    }
}
