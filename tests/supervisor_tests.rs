mod common;

use async_trait::async_trait;
use common::wait_until;
use dispatch_core::config::SupervisorConfig;
use dispatch_core::logging::{LogLevel, MemoryLogSink};
use dispatch_core::messaging::{Envelope, MessageHandler};
use dispatch_core::workers::{
    Supervisor, SupervisorHandler, SupervisorMessage, Worker, WorkerError, WorkerFactory,
    WorkerRequest, WorkerResult, WorkerScope,
};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Semaphore};
use tokio::task::JoinSet;

const LIMIT: Duration = Duration::from_secs(2);

#[derive(Debug, Default)]
struct Lifecycle {
    started: AtomicUsize,
    handled: AtomicUsize,
    stopped: AtomicUsize,
    dropped: AtomicUsize,
}

/// Reports every lifecycle hook, and its own drop, to a shared tally
struct TallyWorker {
    scope: WorkerScope,
    tally: Arc<Lifecycle>,
    hang: bool,
}

impl Drop for TallyWorker {
    fn drop(&mut self) {
        self.tally.dropped.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Worker for TallyWorker {
    fn name(&self) -> &str {
        self.scope.worker_name()
    }

    fn started(&mut self) -> WorkerResult<()> {
        self.tally.started.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn handle(&mut self, request: WorkerRequest) -> WorkerResult<Value> {
        self.tally.handled.fetch_add(1, Ordering::SeqCst);
        if self.hang {
            std::future::pending::<()>().await;
        }
        self.scope
            .log(LogLevel::Info, "irrigation scheduled", Some(request.payload.clone()))
            .await;
        Ok(json!({
            "zone": request.payload["zone"],
            "worker": self.scope.worker_name(),
            "remaining_ms": request.remaining().as_millis() as u64,
        }))
    }

    fn stopped(&mut self) -> WorkerResult<()> {
        self.tally.stopped.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn factory(tally: &Arc<Lifecycle>) -> WorkerFactory {
    let mut factory = WorkerFactory::new();
    let quick = Arc::clone(tally);
    factory.register_fn("scheduler", move |scope| {
        Ok(Box::new(TallyWorker {
            scope,
            tally: Arc::clone(&quick),
            hang: false,
        }) as Box<dyn Worker>)
    });
    let stuck = Arc::clone(tally);
    factory.register_fn("stuck", move |scope| {
        Ok(Box::new(TallyWorker {
            scope,
            tally: Arc::clone(&stuck),
            hang: true,
        }) as Box<dyn Worker>)
    });
    factory
}

#[tokio::test]
async fn ephemeral_worker_lifecycle_runs_once_per_request() {
    let tally = Arc::new(Lifecycle::default());
    let sink = Arc::new(MemoryLogSink::new());
    let supervisor = Supervisor::new(factory(&tally), sink.clone(), SupervisorConfig::default())
        .route_instance("schedule", "scheduler")
        .spawn()
        .unwrap();

    let response = supervisor.ask("schedule", json!({ "zone": 3 })).await.unwrap();

    assert!(response.is_success());
    let data = response.data.unwrap();
    assert_eq!(data["zone"], 3);
    let worker_name = data["worker"].as_str().unwrap().to_string();
    assert!(worker_name.starts_with("scheduler-"));
    let remaining_ms = data["remaining_ms"].as_u64().unwrap();
    assert!(remaining_ms > 0 && remaining_ms <= 30_000);

    assert!(wait_until(LIMIT, || supervisor.stats().terminated == 1).await);
    let stats = supervisor.stats();
    assert_eq!(stats.spawned, 1);
    assert_eq!(stats.terminated, 1);
    assert_eq!(stats.active, 0);
    assert_eq!(stats.open_scopes, 0);
    assert!(supervisor.active_workers().is_empty());

    assert_eq!(tally.started.load(Ordering::SeqCst), 1);
    assert_eq!(tally.handled.load(Ordering::SeqCst), 1);
    assert_eq!(tally.stopped.load(Ordering::SeqCst), 1);
    assert_eq!(tally.dropped.load(Ordering::SeqCst), 1);

    let worker_logs = sink.records_from(&worker_name);
    assert_eq!(worker_logs.len(), 1);
    assert_eq!(worker_logs[0].message, "irrigation scheduled");

    supervisor.shutdown().await.unwrap();
}

#[tokio::test]
async fn each_request_gets_a_fresh_worker() {
    let tally = Arc::new(Lifecycle::default());
    let supervisor = Supervisor::new(
        factory(&tally),
        Arc::new(MemoryLogSink::new()),
        SupervisorConfig::default(),
    )
    .spawn()
    .unwrap();

    let mut names = Vec::new();
    for zone in 0..3 {
        let response = supervisor
            .handle_with_instance_of("scheduler", json!({ "zone": zone }))
            .await
            .unwrap();
        names.push(response.data.unwrap()["worker"].as_str().unwrap().to_string());
    }
    names.sort();
    names.dedup();

    assert_eq!(names.len(), 3);
    assert_eq!(supervisor.stats().spawned, 3);
    assert!(wait_until(LIMIT, || supervisor.stats().terminated == 3).await);
    assert_eq!(tally.dropped.load(Ordering::SeqCst), 3);
    supervisor.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn unresponsive_worker_is_aborted_at_the_timeout() {
    let tally = Arc::new(Lifecycle::default());
    let sink = Arc::new(MemoryLogSink::new());
    let supervisor = Supervisor::new(factory(&tally), sink.clone(), SupervisorConfig::default())
        .route_instance("schedule", "stuck")
        .spawn()
        .unwrap();

    let started = tokio::time::Instant::now();
    let response = supervisor.ask("schedule", json!({ "zone": 1 })).await.unwrap();
    let waited = started.elapsed();

    assert!(!response.is_success());
    assert!(response.error.as_deref().unwrap().contains("did not reply within 30000ms"));
    assert!(waited >= Duration::from_secs(30));
    assert!(waited < Duration::from_secs(31));

    assert!(wait_until(LIMIT, || supervisor.stats().terminated == 1).await);
    let stats = supervisor.stats();
    assert_eq!(stats.timed_out, 1);
    assert_eq!(stats.terminated, 1);
    assert_eq!(stats.active, 0);
    assert_eq!(stats.open_scopes, 0);

    assert_eq!(tally.handled.load(Ordering::SeqCst), 1);
    assert_eq!(tally.stopped.load(Ordering::SeqCst), 0);
    assert_eq!(tally.dropped.load(Ordering::SeqCst), 1);
    assert_eq!(sink.records_at_least(LogLevel::Warning).len(), 1);

    supervisor.shutdown().await.unwrap();
}

/// Holds its request until the shared gate hands out a permit
struct GatedWorker {
    scope: WorkerScope,
    gate: Arc<Semaphore>,
}

#[async_trait]
impl Worker for GatedWorker {
    fn name(&self) -> &str {
        self.scope.worker_name()
    }

    async fn handle(&mut self, request: WorkerRequest) -> WorkerResult<Value> {
        let _permit = self
            .gate
            .acquire()
            .await
            .map_err(|e| WorkerError::Failed(e.into()))?;
        Ok(json!({ "zone": request.payload["zone"], "worker": self.scope.worker_name() }))
    }
}

#[tokio::test]
async fn concurrent_requests_each_hold_their_own_worker() {
    const REQUESTS: usize = 5;
    let gate = Arc::new(Semaphore::new(0));
    let mut factory = WorkerFactory::new();
    let worker_gate = Arc::clone(&gate);
    factory.register_fn("sprinkler", move |scope| {
        Ok(Box::new(GatedWorker {
            scope,
            gate: Arc::clone(&worker_gate),
        }) as Box<dyn Worker>)
    });
    let supervisor = Supervisor::new(factory, Arc::new(MemoryLogSink::new()), SupervisorConfig::default())
        .route_instance("irrigate", "sprinkler")
        .spawn()
        .unwrap();

    let mut asks = JoinSet::new();
    for zone in 0..REQUESTS {
        let supervisor = supervisor.clone();
        asks.spawn(async move { supervisor.ask("irrigate", json!({ "zone": zone })).await });
    }

    assert!(wait_until(LIMIT, || supervisor.active_workers().len() == REQUESTS).await);
    let mut active: Vec<String> = supervisor
        .active_workers()
        .into_iter()
        .map(|worker| worker.worker_name)
        .collect();
    active.sort();
    active.dedup();
    assert_eq!(active.len(), REQUESTS);
    assert_eq!(supervisor.stats().terminated, 0);

    gate.add_permits(REQUESTS);
    let mut zones = Vec::new();
    while let Some(joined) = asks.join_next().await {
        let response = joined.unwrap().unwrap();
        assert!(response.is_success());
        zones.push(response.data.unwrap()["zone"].as_u64().unwrap());
    }
    zones.sort_unstable();
    assert_eq!(zones, (0..REQUESTS as u64).collect::<Vec<_>>());

    assert!(wait_until(LIMIT, || supervisor.stats().terminated == REQUESTS as u64).await);
    let stats = supervisor.stats();
    assert_eq!(stats.spawned, REQUESTS as u64);
    assert_eq!(stats.active, 0);
    assert_eq!(stats.open_scopes, 0);
    supervisor.shutdown().await.unwrap();
}

/// Spends its request's remaining time, less `margin_ms`, before replying
struct DeadlineWorker {
    scope: WorkerScope,
    margin_ms: i64,
}

#[async_trait]
impl Worker for DeadlineWorker {
    fn name(&self) -> &str {
        self.scope.worker_name()
    }

    async fn handle(&mut self, request: WorkerRequest) -> WorkerResult<Value> {
        let remaining = request.remaining().as_millis() as i64;
        let budget = (remaining - self.margin_ms).max(0) as u64;
        tokio::time::sleep(Duration::from_millis(budget)).await;
        Ok(json!({ "slept_ms": budget }))
    }
}

#[tokio::test(start_paused = true)]
async fn reply_deadline_is_fixed_when_the_request_is_built() {
    let mut factory = WorkerFactory::new();
    factory.register_fn("early", |scope| {
        Ok(Box::new(DeadlineWorker { scope, margin_ms: 5 }) as Box<dyn Worker>)
    });
    factory.register_fn("late", |scope| {
        Ok(Box::new(DeadlineWorker { scope, margin_ms: -5 }) as Box<dyn Worker>)
    });
    let supervisor = Supervisor::new(
        factory,
        Arc::new(MemoryLogSink::new()),
        SupervisorConfig {
            worker_timeout_ms: 1_000,
            ..SupervisorConfig::default()
        },
    )
    .spawn()
    .unwrap();

    let early = supervisor.handle_with_instance_of("early", json!({})).await.unwrap();
    assert!(early.is_success());

    let late = supervisor.handle_with_instance_of("late", json!({})).await.unwrap();
    assert!(late.error.unwrap().contains("did not reply within 1000ms"));
    assert_eq!(supervisor.stats().timed_out, 1);

    supervisor.shutdown().await.unwrap();
}

/// Replies at once but takes a while in its stop hook
struct SlowStopWorker {
    scope: WorkerScope,
}

#[async_trait]
impl Worker for SlowStopWorker {
    fn name(&self) -> &str {
        self.scope.worker_name()
    }

    async fn handle(&mut self, _request: WorkerRequest) -> WorkerResult<Value> {
        Ok(json!({ "flushed": true }))
    }

    fn stopped(&mut self) -> WorkerResult<()> {
        std::thread::sleep(Duration::from_millis(400));
        Ok(())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn caller_is_answered_before_the_worker_finishes_stopping() {
    let mut factory = WorkerFactory::new();
    factory.register_fn("flusher", |scope| {
        Ok(Box::new(SlowStopWorker { scope }) as Box<dyn Worker>)
    });
    let supervisor = Supervisor::new(factory, Arc::new(MemoryLogSink::new()), SupervisorConfig::default())
        .route_instance("flush", "flusher")
        .spawn()
        .unwrap();

    let started = std::time::Instant::now();
    let response = supervisor.ask("flush", json!({})).await.unwrap();
    assert!(response.is_success());
    assert!(started.elapsed() < Duration::from_millis(400));
    assert_eq!(supervisor.stats().terminated, 0);

    assert!(wait_until(LIMIT, || supervisor.stats().terminated == 1).await);
    assert!(supervisor.active_workers().is_empty());
    supervisor.shutdown().await.unwrap();
}

#[tokio::test]
async fn tell_delivers_without_a_reply_channel() {
    let tally = Arc::new(Lifecycle::default());
    let supervisor = Supervisor::new(
        factory(&tally),
        Arc::new(MemoryLogSink::new()),
        SupervisorConfig::default(),
    )
    .route_instance("schedule", "scheduler")
    .spawn()
    .unwrap();

    supervisor.tell("schedule", json!({ "zone": 8 })).await.unwrap();

    let (reply_tx, reply_rx) = oneshot::channel();
    supervisor
        .dispatch(SupervisorMessage::new("schedule", json!({ "zone": 9 })).with_reply_to(reply_tx))
        .await
        .unwrap();
    assert!(reply_rx.await.unwrap().is_success());

    supervisor.shutdown().await.unwrap();
    assert_eq!(tally.handled.load(Ordering::SeqCst), 2);
    assert_eq!(supervisor.stats().terminated, 2);
}

#[tokio::test]
async fn supervisor_handler_bridges_envelopes_to_workers() {
    let tally = Arc::new(Lifecycle::default());
    let supervisor = Supervisor::new(
        factory(&tally),
        Arc::new(MemoryLogSink::new()),
        SupervisorConfig {
            worker_timeout_ms: 50,
            ..SupervisorConfig::default()
        },
    )
    .route_instance("farm.irrigation.Schedule", "scheduler")
    .route_instance("farm.irrigation.Jam", "stuck")
    .spawn()
    .unwrap();

    let handler = SupervisorHandler::new(supervisor.clone());
    handler
        .receive(&Envelope::new("farm.irrigation.Schedule", json!({ "zone": 2 })))
        .await
        .unwrap();

    let err = handler
        .receive(&Envelope::new("farm.irrigation.Jam", json!({ "zone": 2 })))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("did not reply within 50ms"));

    supervisor.shutdown().await.unwrap();
}
