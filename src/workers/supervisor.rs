//! # Supervisor
//!
//! Long-lived actor that owns the worker factory and the route table. Each
//! request it receives is either handled inline or given to a freshly spawned
//! worker that lives for that one request:
//!
//! 1. name the worker `{worker_type}-{timestamp}` and build it with its own [`WorkerScope`];
//! 2. spawn its task and send it the request, then close its mailbox;
//! 3. wait for the reply, bounded by the configured timeout;
//! 4. on a timeout abort it;
//! 5. send the response to the original caller, then wait for the worker to
//!    stop before releasing its slot in the active map.
//!
//! Waiting happens on a per-request task, so many workers can be active at once
//! while the supervisor keeps draining its mailbox.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::error::{WorkerError, WorkerResult};
use super::factory::WorkerFactory;
use super::messages::{SupervisorMessage, WorkerRequest, WorkerResponse};
use super::scope::WorkerScope;
use super::traits::{InlineHandler, Worker};
use crate::config::SupervisorConfig;
use crate::constants::{sources, workers};
use crate::logging::{self, LogLevel, LogSink};
use crate::messaging::{Envelope, HandlerError, HandlerResult, MessageHandler, Publisher};

/// How the supervisor serves a route
#[derive(Clone)]
pub enum Route {
    /// Handled by the supervisor itself
    Inline(Arc<dyn InlineHandler>),
    /// Handled by a new worker of the named type
    Instance(String),
}

impl fmt::Debug for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Route::Inline(_) => f.write_str("Route::Inline"),
            Route::Instance(worker_type) => write!(f, "Route::Instance({worker_type})"),
        }
    }
}

/// A worker currently holding a request
#[derive(Debug, Clone, Serialize)]
pub struct ActiveWorker {
    pub worker_name: String,
    pub worker_type: String,
    pub request_id: Uuid,
    pub started_at: DateTime<Utc>,
}

/// Point-in-time supervisor counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SupervisorStats {
    pub spawned: u64,
    pub terminated: u64,
    pub timed_out: u64,
    pub active: u64,
    /// Worker scopes not yet released
    pub open_scopes: u64,
}

#[derive(Debug, Default)]
struct SupervisorShared {
    spawned: AtomicU64,
    terminated: AtomicU64,
    timed_out: AtomicU64,
    open_scopes: Arc<AtomicU64>,
    name_sequence: AtomicU64,
    active: DashMap<String, ActiveWorker>,
}

impl SupervisorShared {
    fn worker_name(&self, worker_type: &str) -> String {
        let base = format!(
            "{worker_type}-{}",
            Utc::now().format(workers::NAME_TIMESTAMP_FORMAT)
        );
        if self.active.contains_key(&base) {
            let sequence = self.name_sequence.fetch_add(1, Ordering::Relaxed);
            format!("{base}-{sequence}")
        } else {
            base
        }
    }

    fn snapshot(&self) -> SupervisorStats {
        SupervisorStats {
            spawned: self.spawned.load(Ordering::Acquire),
            terminated: self.terminated.load(Ordering::Acquire),
            timed_out: self.timed_out.load(Ordering::Acquire),
            active: self.active.len() as u64,
            open_scopes: self.open_scopes.load(Ordering::Acquire),
        }
    }
}

enum SupervisorCommand {
    Route(SupervisorMessage),
    Instance {
        worker_type: String,
        message: SupervisorMessage,
    },
    Shutdown(oneshot::Sender<()>),
}

/// Builder and owner of the supervisor actor
pub struct Supervisor {
    factory: WorkerFactory,
    routes: HashMap<String, Route>,
    log_sink: Arc<dyn LogSink>,
    publisher: Option<Publisher>,
    config: SupervisorConfig,
}

impl fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Supervisor")
            .field("factory", &self.factory)
            .field("routes", &self.routes)
            .field("config", &self.config)
            .finish()
    }
}

impl Supervisor {
    pub fn new(factory: WorkerFactory, log_sink: Arc<dyn LogSink>, config: SupervisorConfig) -> Self {
        Self {
            factory,
            routes: HashMap::new(),
            log_sink,
            publisher: None,
            config,
        }
    }

    /// Publisher handed to every worker scope
    pub fn with_publisher(mut self, publisher: Publisher) -> Self {
        self.publisher = Some(publisher);
        self
    }

    /// Serve `route_key` with a handler run by the supervisor itself
    pub fn route_inline(mut self, route_key: impl Into<String>, handler: Arc<dyn InlineHandler>) -> Self {
        self.routes.insert(route_key.into(), Route::Inline(handler));
        self
    }

    /// Serve `route_key` with a new worker of `worker_type` per request
    pub fn route_instance(mut self, route_key: impl Into<String>, worker_type: impl Into<String>) -> Self {
        self.routes
            .insert(route_key.into(), Route::Instance(worker_type.into()));
        self
    }

    pub fn routes(&self) -> &HashMap<String, Route> {
        &self.routes
    }

    /// Start the supervisor actor
    ///
    /// Fails when an instance route names a worker type the factory does not know.
    pub fn spawn(self) -> WorkerResult<SupervisorHandle> {
        for route in self.routes.values() {
            if let Route::Instance(worker_type) = route {
                if !self.factory.contains(worker_type) {
                    return Err(WorkerError::unknown_worker_type(worker_type.clone()));
                }
            }
        }

        let (sender, receiver) = mpsc::channel(self.config.mailbox_capacity.max(1));
        let shared = Arc::new(SupervisorShared::default());
        let actor = SupervisorActor {
            factory: Arc::new(self.factory),
            routes: self.routes,
            log_sink: self.log_sink,
            publisher: self.publisher,
            worker_timeout: self.config.worker_timeout(),
            shared: Arc::clone(&shared),
            in_flight: JoinSet::new(),
        };

        info!(
            routes = actor.routes.len(),
            worker_timeout_ms = actor.worker_timeout.as_millis() as u64,
            "Starting supervisor"
        );
        let task = tokio::spawn(actor.run(receiver));

        Ok(SupervisorHandle {
            sender,
            shared,
            task: Arc::new(Mutex::new(Some(task))),
        })
    }
}

struct SupervisorActor {
    factory: Arc<WorkerFactory>,
    routes: HashMap<String, Route>,
    log_sink: Arc<dyn LogSink>,
    publisher: Option<Publisher>,
    worker_timeout: Duration,
    shared: Arc<SupervisorShared>,
    in_flight: JoinSet<()>,
}

impl SupervisorActor {
    async fn run(mut self, mut receiver: mpsc::Receiver<SupervisorCommand>) {
        let mut shutdown_ack = None;

        loop {
            tokio::select! {
                command = receiver.recv() => {
                    match command {
                        Some(SupervisorCommand::Shutdown(ack)) => {
                            shutdown_ack = Some(ack);
                            break;
                        }
                        Some(command) => self.handle_command(command).await,
                        None => {
                            info!("Supervisor mailbox closed");
                            break;
                        }
                    }
                }
                Some(joined) = self.in_flight.join_next(), if !self.in_flight.is_empty() => {
                    if let Err(e) = joined {
                        error!(error = %e, "Worker supervision task failed");
                    }
                }
            }
        }

        receiver.close();
        while let Some(command) = receiver.recv().await {
            match command {
                SupervisorCommand::Route(message) | SupervisorCommand::Instance { message, .. } => {
                    let request_id = message.request_id;
                    message.reply(WorkerResponse::failure(
                        request_id,
                        "supervisor is shutting down",
                    ));
                }
                SupervisorCommand::Shutdown(ack) => {
                    let _ = ack.send(());
                }
            }
        }

        let draining = self.in_flight.len();
        if draining > 0 {
            info!(draining, "Waiting for active workers before supervisor shutdown");
        }
        while let Some(joined) = self.in_flight.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Worker supervision task failed");
            }
        }

        info!(stats = ?self.shared.snapshot(), "Supervisor stopped");
        if let Some(ack) = shutdown_ack {
            let _ = ack.send(());
        }
    }

    async fn handle_command(&mut self, command: SupervisorCommand) {
        match command {
            SupervisorCommand::Route(message) => {
                let route = self.routes.get(&message.route_key).cloned();
                self.handle_route(route, message).await;
            }
            SupervisorCommand::Instance {
                worker_type,
                message,
            } => self.handle_with_instance_of(&worker_type, message).await,
            SupervisorCommand::Shutdown(_) => {}
        }
    }

    async fn handle_route(&mut self, route: Option<Route>, message: SupervisorMessage) {
        match route {
            Some(Route::Inline(handler)) => self.handle_inline(handler, message).await,
            Some(Route::Instance(worker_type)) => {
                self.handle_with_instance_of(&worker_type, message).await;
            }
            None => {
                warn!(route_key = %message.route_key, "No route registered");
                let error = WorkerError::UnknownRoute {
                    route_key: message.route_key.clone(),
                };
                self.log_sink.log_error(&error, Some(sources::SUPERVISOR)).await;
                let request_id = message.request_id;
                message.reply(WorkerResponse::failure(request_id, error.to_string()));
            }
        }
    }

    fn request_for(&self, message: &SupervisorMessage) -> WorkerRequest {
        WorkerRequest {
            request_id: message.request_id,
            route_key: message.route_key.clone(),
            payload: message.payload.clone(),
            deadline: Instant::now() + self.worker_timeout,
        }
    }

    async fn handle_inline(&self, handler: Arc<dyn InlineHandler>, message: SupervisorMessage) {
        let request = self.request_for(&message);
        let request_id = request.request_id;
        let response = match handler.handle(request).await {
            Ok(data) => WorkerResponse::success(request_id, data),
            Err(e) => {
                warn!(route_key = %message.route_key, error = %e, "Inline handler failed");
                self.log_sink.log_error(&e, Some(sources::SUPERVISOR)).await;
                WorkerResponse::failure(request_id, e.to_string())
            }
        };
        message.reply(response);
    }

    /// Spawn a worker of `worker_type` for this one message and supervise it
    async fn handle_with_instance_of(&mut self, worker_type: &str, message: SupervisorMessage) {
        let request = self.request_for(&message);
        let request_id = request.request_id;
        let worker_name = self.shared.worker_name(worker_type);

        let scope = WorkerScope::new(
            worker_name.clone(),
            worker_type.to_string(),
            Arc::clone(&self.log_sink),
            self.publisher.clone(),
            Arc::clone(&self.shared.open_scopes),
        );

        let worker = match self.factory.create(worker_type, scope) {
            Ok(worker) => worker,
            Err(e) => {
                error!(worker_type, error = %e, "Failed to construct worker");
                self.log_sink.log_error(&e, Some(sources::SUPERVISOR)).await;
                message.reply(WorkerResponse::failure(request_id, e.to_string()));
                return;
            }
        };

        self.shared.spawned.fetch_add(1, Ordering::AcqRel);
        self.shared.active.insert(
            worker_name.clone(),
            ActiveWorker {
                worker_name: worker_name.clone(),
                worker_type: worker_type.to_string(),
                request_id,
                started_at: Utc::now(),
            },
        );
        logging::log_worker_operation("spawn", &worker_name, worker_type, "started");

        let supervision = WorkerSupervision {
            worker_name,
            worker_type: worker_type.to_string(),
            timeout: self.worker_timeout,
            shared: Arc::clone(&self.shared),
            log_sink: Arc::clone(&self.log_sink),
        };
        self.in_flight
            .spawn(supervision.run(worker, request, message));
    }
}

struct WorkerMail {
    request: WorkerRequest,
    reply: oneshot::Sender<WorkerResult<Value>>,
}

/// Lifetime of one ephemeral worker, from spawn to termination
struct WorkerSupervision {
    worker_name: String,
    worker_type: String,
    timeout: Duration,
    shared: Arc<SupervisorShared>,
    log_sink: Arc<dyn LogSink>,
}

impl WorkerSupervision {
    async fn run(self, worker: Box<dyn Worker>, request: WorkerRequest, message: SupervisorMessage) {
        let request_id = request.request_id;
        let deadline = request.deadline;
        let (mailbox, inbox) = mpsc::channel(workers::WORKER_MAILBOX_CAPACITY);
        let mut task = tokio::spawn(worker_loop(worker, inbox));

        let (reply_tx, reply_rx) = oneshot::channel();
        let sent = mailbox
            .send(WorkerMail {
                request,
                reply: reply_tx,
            })
            .await;
        // One request per worker: closing the mailbox lets it stop after replying.
        drop(mailbox);

        let response = if sent.is_err() {
            WorkerResponse::failure(
                request_id,
                WorkerError::mailbox_closed(self.worker_name.clone()).to_string(),
            )
        } else {
            match tokio::time::timeout_at(deadline, reply_rx).await {
                Ok(Ok(Ok(data))) => WorkerResponse::success(request_id, data),
                Ok(Ok(Err(e))) => {
                    warn!(worker_name = %self.worker_name, error = %e, "Worker reported failure");
                    self.log_sink
                        .log_error(&e, Some(self.worker_name.as_str()))
                        .await;
                    WorkerResponse::failure(request_id, e.to_string())
                }
                Ok(Err(_)) => WorkerResponse::failure(
                    request_id,
                    format!("worker {} stopped without replying", self.worker_name),
                ),
                Err(_) => {
                    let error = WorkerError::Timeout {
                        worker_name: self.worker_name.clone(),
                        timeout_ms: self.timeout.as_millis() as u64,
                    };
                    self.shared.timed_out.fetch_add(1, Ordering::AcqRel);
                    warn!(worker_name = %self.worker_name, "Worker timed out, aborting");
                    self.log_sink
                        .log(
                            LogLevel::Warning,
                            &error.to_string(),
                            None,
                            Some(sources::SUPERVISOR),
                        )
                        .await;
                    task.abort();
                    WorkerResponse::failure(request_id, error.to_string())
                }
            }
        };

        let outcome = if response.is_success() { "success" } else { "failure" };
        message.reply(response);

        if tokio::time::timeout(self.timeout, &mut task).await.is_err() {
            warn!(worker_name = %self.worker_name, "Worker did not stop after replying, aborting");
            task.abort();
            let _ = task.await;
        }

        self.shared.active.remove(&self.worker_name);
        self.shared.terminated.fetch_add(1, Ordering::AcqRel);
        logging::log_worker_operation("terminate", &self.worker_name, &self.worker_type, outcome);
    }
}

async fn worker_loop(mut worker: Box<dyn Worker>, mut inbox: mpsc::Receiver<WorkerMail>) {
    if let Err(e) = worker.started() {
        let start_error = WorkerError::StartFailed {
            worker_name: worker.name().to_string(),
            message: e.to_string(),
        };
        error!(error = %start_error, "Worker failed to start");
        if let Some(mail) = inbox.recv().await {
            let _ = mail.reply.send(Err(start_error));
        }
        return;
    }
    debug!(worker_name = %worker.name(), "Worker started");

    while let Some(WorkerMail { request, reply }) = inbox.recv().await {
        let result = worker.handle(request).await;
        let _ = reply.send(result);
    }

    if let Err(e) = worker.stopped() {
        warn!(worker_name = %worker.name(), error = %e, "Worker stop hook failed");
    }
    debug!(worker_name = %worker.name(), "Worker stopped");
}

/// Cloneable handle to a running supervisor
#[derive(Clone)]
pub struct SupervisorHandle {
    sender: mpsc::Sender<SupervisorCommand>,
    shared: Arc<SupervisorShared>,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl fmt::Debug for SupervisorHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SupervisorHandle")
            .field("stats", &self.shared.snapshot())
            .finish()
    }
}

impl SupervisorHandle {
    async fn send(&self, command: SupervisorCommand) -> WorkerResult<()> {
        self.sender
            .send(command)
            .await
            .map_err(|_| WorkerError::mailbox_closed("supervisor"))
    }

    /// Send a request on `route_key` and wait for the response
    pub async fn ask(&self, route_key: impl Into<String>, payload: Value) -> WorkerResult<WorkerResponse> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let message = SupervisorMessage::new(route_key, payload).with_reply_to(reply_tx);
        self.send(SupervisorCommand::Route(message)).await?;
        reply_rx
            .await
            .map_err(|_| WorkerError::mailbox_closed("supervisor reply"))
    }

    /// Send a request on `route_key` without waiting for the response
    pub async fn tell(&self, route_key: impl Into<String>, payload: Value) -> WorkerResult<()> {
        self.send(SupervisorCommand::Route(SupervisorMessage::new(route_key, payload)))
            .await
    }

    /// Route an already-built message, replying to its `reply_to`
    pub async fn dispatch(&self, message: SupervisorMessage) -> WorkerResult<()> {
        self.send(SupervisorCommand::Route(message)).await
    }

    /// Give `payload` to a new worker of `worker_type`, bypassing the route table
    pub async fn handle_with_instance_of(
        &self,
        worker_type: impl Into<String>,
        payload: Value,
    ) -> WorkerResult<WorkerResponse> {
        let worker_type = worker_type.into();
        let (reply_tx, reply_rx) = oneshot::channel();
        let message = SupervisorMessage::new(worker_type.clone(), payload).with_reply_to(reply_tx);
        self.send(SupervisorCommand::Instance {
            worker_type,
            message,
        })
        .await?;
        reply_rx
            .await
            .map_err(|_| WorkerError::mailbox_closed("supervisor reply"))
    }

    pub fn stats(&self) -> SupervisorStats {
        self.shared.snapshot()
    }

    pub fn active_workers(&self) -> Vec<ActiveWorker> {
        let mut active: Vec<ActiveWorker> = self
            .shared
            .active
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        active.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        active
    }

    pub fn is_running(&self) -> bool {
        !self.sender.is_closed()
    }

    /// Stop accepting requests, wait for active workers, then stop the actor
    ///
    /// Safe to call more than once.
    pub async fn shutdown(&self) -> WorkerResult<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.sender.send(SupervisorCommand::Shutdown(ack_tx)).await.is_ok() {
            let _ = ack_rx.await;
        }

        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!(error = %e, "Supervisor task ended abnormally");
            }
        }
        Ok(())
    }
}

/// Forwards envelopes to a supervisor route, so a consumer can dispatch to workers
///
/// The route key defaults to the envelope's message type. A failure response
/// becomes a handler failure.
#[derive(Debug, Clone)]
pub struct SupervisorHandler {
    supervisor: SupervisorHandle,
    route_key: Option<String>,
}

impl SupervisorHandler {
    pub fn new(supervisor: SupervisorHandle) -> Self {
        Self {
            supervisor,
            route_key: None,
        }
    }

    pub fn with_route(supervisor: SupervisorHandle, route_key: impl Into<String>) -> Self {
        Self {
            supervisor,
            route_key: Some(route_key.into()),
        }
    }
}

#[async_trait]
impl MessageHandler for SupervisorHandler {
    async fn receive(&self, envelope: &Envelope) -> HandlerResult {
        let route_key = self
            .route_key
            .clone()
            .unwrap_or_else(|| envelope.message_type.to_string());

        let response = self
            .supervisor
            .ask(route_key, envelope.data.clone())
            .await
            .map_err(|e| HandlerError::Failed(e.into()))?;

        match response.into_result() {
            Ok(_) => Ok(()),
            Err(error) => Err(HandlerError::Failed(anyhow::anyhow!(error))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::MemoryLogSink;
    use crate::workers::FromScope;
    use serde_json::json;

    struct DoublingWorker {
        scope: WorkerScope,
    }

    #[async_trait]
    impl Worker for DoublingWorker {
        fn name(&self) -> &str {
            self.scope.worker_name()
        }

        async fn handle(&mut self, request: WorkerRequest) -> WorkerResult<Value> {
            let value = request.payload["value"].as_i64().unwrap_or_default();
            Ok(json!({ "value": value * 2 }))
        }
    }

    impl FromScope for DoublingWorker {
        const WORKER_TYPE: &'static str = "doubler";

        fn from_scope(scope: WorkerScope) -> WorkerResult<Self> {
            Ok(Self { scope })
        }
    }

    struct Ping;

    #[async_trait]
    impl InlineHandler for Ping {
        async fn handle(&self, _request: WorkerRequest) -> WorkerResult<Value> {
            Ok(json!("pong"))
        }
    }

    fn supervisor() -> Supervisor {
        let mut factory = WorkerFactory::new();
        factory.register::<DoublingWorker>();
        Supervisor::new(
            factory,
            Arc::new(MemoryLogSink::new()),
            SupervisorConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_inline_route() {
        let handle = supervisor()
            .route_inline("ping", Arc::new(Ping))
            .spawn()
            .unwrap();

        let response = handle.ask("ping", json!({})).await.unwrap();
        assert_eq!(response.data, Some(json!("pong")));
        assert_eq!(handle.stats().spawned, 0);
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_instance_route_spawns_and_terminates() {
        let handle = supervisor()
            .route_instance("double", DoublingWorker::WORKER_TYPE)
            .spawn()
            .unwrap();

        let response = handle.ask("double", json!({"value": 21})).await.unwrap();
        assert!(response.is_success());
        assert_eq!(response.data, Some(json!({"value": 42})));

        // The reply is sent before the worker finishes stopping.
        tokio::time::timeout(Duration::from_secs(2), async {
            while handle.stats().terminated < 1 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        let stats = handle.stats();
        assert_eq!(stats.spawned, 1);
        assert_eq!(stats.terminated, 1);
        assert_eq!(stats.active, 0);
        assert_eq!(stats.open_scopes, 0);
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_route_fails_response() {
        let handle = supervisor().spawn().unwrap();
        let response = handle.ask("nowhere", json!({})).await.unwrap();
        assert!(!response.is_success());
        assert!(response.error.unwrap().contains("nowhere"));
        handle.shutdown().await.unwrap();
    }

    #[test]
    fn test_spawn_rejects_unknown_worker_type() {
        let result = supervisor().route_instance("x", "missing").spawn();
        assert!(matches!(result, Err(WorkerError::UnknownWorkerType { .. })));
    }

    #[test]
    fn test_worker_names_carry_type_and_timestamp() {
        let shared = SupervisorShared::default();
        let first = shared.worker_name("doubler");
        let timestamp = first.strip_prefix("doubler-").unwrap();
        // %Y-%m-%d%H:%M:%S:%f renders as 2024-05-0112:00:00:123456789
        assert_eq!(timestamp.len(), 28);

        shared.active.insert(
            first.clone(),
            ActiveWorker {
                worker_name: first.clone(),
                worker_type: "doubler".to_string(),
                request_id: Uuid::new_v4(),
                started_at: Utc::now(),
            },
        );
        assert_ne!(shared.worker_name("doubler"), first);
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let handle = supervisor().spawn().unwrap();
        handle.shutdown().await.unwrap();
        handle.shutdown().await.unwrap();
        assert!(!handle.is_running());
        assert!(handle.ask("ping", json!({})).await.is_err());
    }
}
