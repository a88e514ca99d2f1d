//! Shared fixtures for pool integration tests.

#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use agent_worker_pool::config::ConcurrencyConfig;
use agent_worker_pool::core::{InMemoryEventSink, WorkerPool};
use agent_worker_pool::process::in_memory::HeartbeatMode;
use agent_worker_pool::process::InMemoryFactory;
use agent_worker_pool::runtime::RequestHandler;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::time::Instant;

/// One handled request as seen by a worker.
#[derive(Debug, Clone)]
pub struct Span {
    pub request_id: String,
    pub started: Instant,
    pub finished: Instant,
}

/// Scriptable handler. Payload fields:
/// - `sleep_ms`: delay before replying
/// - `hang`: never reply
/// - `panic`: crash the worker
/// - `fail`: reply with this error message
#[derive(Clone, Default)]
pub struct TestHandler {
    pub log: Arc<Mutex<Vec<Span>>>,
}

impl TestHandler {
    pub fn spans(&self) -> Vec<Span> {
        self.log.lock().clone()
    }

    pub fn order(&self) -> Vec<String> {
        self.log.lock().iter().map(|s| s.request_id.clone()).collect()
    }
}

#[async_trait]
impl RequestHandler for TestHandler {
    async fn handle(&self, request_id: &str, payload: Value) -> Result<Value, String> {
        let started = Instant::now();
        if payload["hang"].as_bool() == Some(true) {
            std::future::pending::<()>().await;
        }
        if payload["panic"].as_bool() == Some(true) {
            panic!("handler crashed");
        }
        if let Some(ms) = payload["sleep_ms"].as_u64() {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
        self.log.lock().push(Span {
            request_id: request_id.to_string(),
            started,
            finished: Instant::now(),
        });
        match payload["fail"].as_str() {
            Some(message) => Err(message.to_string()),
            None => Ok(json!({ "echo": payload })),
        }
    }
}

pub struct Harness {
    pub pool: WorkerPool,
    pub factory: Arc<InMemoryFactory<TestHandler>>,
    pub handler: TestHandler,
    pub events: Arc<InMemoryEventSink>,
}

/// Small, fast configuration; tests override what they exercise.
pub fn config() -> ConcurrencyConfig {
    ConcurrencyConfig::new()
        .with_min_workers(1)
        .with_max_workers(2)
        .with_max_queue_size(32)
        .with_worker_timeout_ms(5_000)
        .with_heartbeat_interval_ms(1_000)
        .with_stuck_threshold_ms(10_000)
        .with_shutdown_grace_ms(1_000)
}

pub fn factory(heartbeats: HeartbeatMode) -> (Arc<InMemoryFactory<TestHandler>>, TestHandler) {
    let handler = TestHandler::default();
    let factory = Arc::new(InMemoryFactory::new(handler.clone()).with_heartbeats(heartbeats));
    (factory, handler)
}

pub async fn start_with(config: ConcurrencyConfig, heartbeats: HeartbeatMode) -> Harness {
    let (factory, handler) = factory(heartbeats);
    start_with_factory(config, factory, handler).await
}

pub async fn start_with_factory(
    config: ConcurrencyConfig,
    factory: Arc<InMemoryFactory<TestHandler>>,
    handler: TestHandler,
) -> Harness {
    let events = Arc::new(InMemoryEventSink::new(10_000));
    let pool = WorkerPool::start_with_sink(config, factory.clone(), events.clone())
        .await
        .expect("pool should start");
    Harness {
        pool,
        factory,
        handler,
        events,
    }
}

pub async fn start(config: ConcurrencyConfig) -> Harness {
    start_with(config, HeartbeatMode::FromConfig).await
}

/// Yield until `cond` holds, failing the test after a generous bound.
pub async fn wait_until(mut cond: impl FnMut() -> bool) {
    let waited = tokio::time::timeout(Duration::from_secs(5), async {
        while !cond() {
            tokio::task::yield_now().await;
        }
    })
    .await;
    assert!(waited.is_ok(), "condition not reached in time");
}

/// Spawn a future on the runtime and return its handle.
pub fn background<F>(fut: F) -> tokio::task::JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    tokio::spawn(fut)
}
