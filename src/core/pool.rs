//! `WorkerPool`: the single entry point composing the scheduler, session
//! mutex, backpressure monitor, worker lifecycle and health supervision.
//!
//! # Concurrency model
//!
//! All bookkeeping (queue, worker registry, backpressure state) lives in one
//! [`PoolState`] behind a `parking_lot::Mutex`. Critical sections are short
//! and never span an `.await`, so every mutation is atomic with respect to
//! every other. Callers suspend only on channels and timers: waiting for
//! their session, for a worker, and for the reply.
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use agent_worker_pool::config::ConcurrencyConfig;
//! use agent_worker_pool::core::{Priority, WorkerPool, WorkerRequest};
//! use agent_worker_pool::process::CommandFactory;
//! use serde_json::json;
//!
//! let pool = WorkerPool::start(
//!     ConcurrencyConfig::from_env()?,
//!     Arc::new(CommandFactory::new("/usr/local/bin/agent-worker")),
//! )
//! .await?;
//!
//! let response = pool
//!     .submit(
//!         WorkerRequest::new(json!({"prompt": "hello"}))
//!             .with_session("telegram:42")
//!             .with_priority(Priority::High),
//!     )
//!     .await?;
//!
//! pool.shutdown().await;
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::ConcurrencyConfig;
use crate::core::backpressure::BackpressureMonitor;
use crate::core::error::{ConcurrencyError, PoolResult};
use crate::core::events::{
    EventSink, PoolEvent, RequestCompleted, RequestQueued, RequestStarted, RequestTimedOut,
    TracingEventSink, WorkerRecycled,
};
use crate::core::health::{run_health_loop, WorkerHealth};
use crate::core::lifecycle::{stop_process, ActiveRequest, Reply, TerminationReason, WorkerRegistry};
use crate::core::metrics::{ConcurrencyMetrics, LatencyWindow, PoolCounters};
use crate::core::scheduler::PriorityScheduler;
use crate::core::session::{SessionGuard, SessionMutex};
use crate::core::types::{
    QueueEntry, WorkerId, WorkerInfo, WorkerOutcome, WorkerRequest, WorkerResponse, WorkerState,
};
use crate::process::{ParentMessage, SubprocessFactory};
use crate::util::clock::{duration_ms, now_ms};

/// A queued request and the channel its caller waits on.
pub(crate) struct Pending {
    pub request: WorkerRequest,
    pub reply: Reply,
}

/// Everything mutated by pool operations, guarded by one lock.
pub(crate) struct PoolState {
    pub scheduler: PriorityScheduler<Pending>,
    pub backpressure: BackpressureMonitor,
    pub registry: WorkerRegistry,
}

pub(crate) struct PoolInner {
    pub config: ConcurrencyConfig,
    pub factory: Arc<dyn SubprocessFactory>,
    pub sink: Arc<dyn EventSink>,
    pub sessions: Arc<SessionMutex>,
    pub health: WorkerHealth,
    pub state: Mutex<PoolState>,
    pub counters: PoolCounters,
    pub latency: Mutex<LatencyWindow>,
    shutting_down: AtomicBool,
    /// Signalled whenever a request leaves the queue or completes.
    pub progress: Notify,
    health_task: Mutex<Option<JoinHandle<()>>>,
}

impl PoolInner {
    pub(crate) fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    /// Assign queued requests to idle workers and spawn workers for
    /// unmet demand.
    pub(crate) fn pump(self: &Arc<Self>) {
        let mut dispatches = Vec::new();
        {
            let mut state = self.state.lock();
            while !state.scheduler.is_empty() {
                let Some(worker_id) = state.registry.next_idle() else {
                    break;
                };
                let Some(entry) = state.scheduler.dequeue() else {
                    break;
                };
                let queued_ms = duration_ms(entry.enqueued_at.elapsed());
                let Pending { request, reply } = entry.payload;
                if reply.is_closed() {
                    debug!(request_id = %request.id, "dropping request abandoned while queued");
                    continue;
                }
                let active = ActiveRequest {
                    request_id: request.id.clone(),
                    dispatched_at: Instant::now(),
                    reply: Some(reply),
                };
                let Some(handle) = state.registry.begin_request(worker_id, active) else {
                    continue;
                };
                self.sink.publish(PoolEvent::RequestStarted(RequestStarted {
                    request_id: request.id.clone(),
                    worker_id,
                    queued_ms,
                    timestamp_ms: now_ms(),
                }));
                dispatches.push((worker_id, handle, request));
            }

            while state.registry.count(WorkerState::Starting) < state.scheduler.len() {
                match self.spawn_one(&mut state) {
                    Ok(worker_id) => debug!(worker_id = %worker_id, "spawning worker for queued demand"),
                    Err(_) => break,
                }
            }

            let queue_len = state.scheduler.len();
            state.backpressure.observe(queue_len);
        }

        if !dispatches.is_empty() {
            self.progress.notify_waiters();
        }
        for (worker_id, handle, request) in dispatches {
            let inner = Arc::clone(self);
            tokio::spawn(async move {
                debug!(worker_id = %worker_id, request_id = %request.id, "dispatching request");
                let message = ParentMessage::request(request.id, request.payload);
                if let Err(e) = handle.send(&message).await {
                    warn!(worker_id = %worker_id, error = %e, "dispatch failed");
                    inner.terminate(worker_id, TerminationReason::Crashed { code: None });
                }
            });
        }
    }

    /// Enqueue, dispatch and await one request. Session and backpressure
    /// checks happen in the caller.
    ///
    /// Also returns the worker a timed-out request was running on.
    async fn run_request(
        self: &Arc<Self>,
        request: WorkerRequest,
        timeout: Duration,
    ) -> (PoolResult<WorkerResponse>, Option<WorkerId>) {
        let request_id = request.id.clone();
        let (tx, mut rx) = oneshot::channel();
        {
            let mut state = self.state.lock();
            let priority = request.priority;
            let session_id = request.session_id.clone();
            let entry = QueueEntry::new(request_id.clone(), priority, Pending { request, reply: tx })
                .with_session(session_id.clone());
            if let Err(e) = state.scheduler.enqueue(entry) {
                return (Err(e), None);
            }
            let queue_length = state.scheduler.len();
            self.sink.publish(PoolEvent::RequestQueued(RequestQueued {
                request_id: request_id.clone(),
                priority,
                session_id,
                queue_length,
                timestamp_ms: now_ms(),
            }));
            if let Some(activated) = state.backpressure.observe(queue_length) {
                self.sink.publish(PoolEvent::BackpressureActivated(activated));
            }
        }

        let _queued = QueuedRequest {
            inner: self.as_ref(),
            request_id: &request_id,
        };
        self.pump();

        let waited = tokio::time::timeout(timeout, &mut rx).await;
        match waited {
            Ok(Ok(result)) => (result, None),
            Ok(Err(_)) => (Err(ConcurrencyError::shutting_down()), None),
            Err(_) => {
                let (timed_out, worker_id) = self.on_request_timeout(&request_id, timeout);
                (settle_after_deadline(&mut rx, timed_out), worker_id)
            }
        }
    }

    /// Withdraw a request whose caller stopped waiting. Once this returns,
    /// no reply can be sent for it any more.
    fn on_request_timeout(&self, request_id: &str, timeout: Duration) -> (ConcurrencyError, Option<WorkerId>) {
        let timeout_ms = duration_ms(timeout);
        let mut state = self.state.lock();
        let mut suspect = None;
        if state.scheduler.remove(request_id).is_some() {
            debug!(request_id, timeout_ms, "request timed out before dispatch");
        } else if let Some(worker_id) = state.registry.mark_suspect(request_id, Instant::now()) {
            debug!(request_id, worker_id = %worker_id, "worker flagged suspect");
            self.sink.publish(PoolEvent::RequestTimedOut(RequestTimedOut {
                request_id: request_id.to_string(),
                worker_id,
                timeout_ms,
                timestamp_ms: now_ms(),
            }));
            suspect = Some(worker_id);
        }
        drop(state);
        self.progress.notify_waiters();
        let err = ConcurrencyError::WorkerTimeout {
            request_id: request_id.to_string(),
            waited_ms: timeout_ms,
        };
        (err, suspect)
    }

    fn is_drained(&self) -> bool {
        let state = self.state.lock();
        state.scheduler.is_empty() && !state.registry.has_awaited_requests()
    }
}

/// Prefer a reply that was delivered as the deadline fired over the
/// timeout error.
fn settle_after_deadline(
    rx: &mut oneshot::Receiver<PoolResult<WorkerResponse>>,
    timed_out: ConcurrencyError,
) -> PoolResult<WorkerResponse> {
    rx.try_recv().unwrap_or(Err(timed_out))
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        if let Some(task) = self.health_task.get_mut().take() {
            task.abort();
        }
        for retired in self.state.get_mut().registry.retire_all() {
            if let Some(handle) = retired.handle {
                handle.kill();
            }
        }
    }
}

/// Removes a request from the queue if its caller goes away before
/// dispatch. A no-op once the request has left the queue.
struct QueuedRequest<'a> {
    inner: &'a PoolInner,
    request_id: &'a str,
}

impl Drop for QueuedRequest<'_> {
    fn drop(&mut self) {
        let mut state = self.inner.state.lock();
        if state.scheduler.remove(self.request_id).is_some() {
            let queue_len = state.scheduler.len();
            state.backpressure.observe(queue_len);
        }
    }
}

/// Pool of subprocess workers.
///
/// Cheap to clone; clones share the same pool.
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("config", &self.inner.config)
            .field("shutting_down", &self.inner.is_shutting_down())
            .finish_non_exhaustive()
    }
}

impl WorkerPool {
    /// Start a pool that reports events through [`TracingEventSink`].
    ///
    /// # Errors
    ///
    /// See [`start_with_sink`](Self::start_with_sink).
    pub async fn start(config: ConcurrencyConfig, factory: Arc<dyn SubprocessFactory>) -> PoolResult<Self> {
        Self::start_with_sink(config, factory, Arc::new(TracingEventSink)).await
    }

    /// Validate `config`, spawn `min_workers` workers and start health
    /// supervision.
    ///
    /// # Errors
    ///
    /// - [`ConcurrencyError::InvalidConfig`] if validation fails
    /// - [`ConcurrencyError::Spawn`] if the initial workers cannot be started
    pub async fn start_with_sink(
        config: ConcurrencyConfig,
        factory: Arc<dyn SubprocessFactory>,
        sink: Arc<dyn EventSink>,
    ) -> PoolResult<Self> {
        config.validate().map_err(ConcurrencyError::InvalidConfig)?;

        let inner = Arc::new(PoolInner {
            health: WorkerHealth::from_config(&config),
            state: Mutex::new(PoolState {
                scheduler: PriorityScheduler::new(config.max_queue_size),
                backpressure: BackpressureMonitor::new(config.max_queue_size, config.backpressure_threshold),
                registry: WorkerRegistry::new(),
            }),
            factory,
            sink,
            sessions: Arc::new(SessionMutex::new()),
            counters: PoolCounters::default(),
            latency: Mutex::new(LatencyWindow::default()),
            shutting_down: AtomicBool::new(false),
            progress: Notify::new(),
            health_task: Mutex::new(None),
            config,
        });

        inner.ensure_min_workers().await?;

        let task = tokio::spawn(run_health_loop(
            Arc::downgrade(&inner),
            inner.config.heartbeat_interval(),
        ));
        *inner.health_task.lock() = Some(task);

        info!(
            min_workers = inner.config.min_workers,
            max_workers = inner.config.max_workers,
            max_queue_size = inner.config.max_queue_size,
            "worker pool started"
        );
        Ok(Self { inner })
    }

    /// Run a request on a worker and wait for its reply.
    ///
    /// Requests sharing a `session_id` run one at a time in submission
    /// order; requests without one run concurrently with anything.
    ///
    /// # Errors
    ///
    /// - [`ConcurrencyError::Backpressure`] if load is too high for the
    ///   request's priority, or the pool is shutting down
    /// - [`ConcurrencyError::LockAcquisition`] if the session stays busy
    /// - [`ConcurrencyError::QueueFull`] if the queue is at its cap
    /// - [`ConcurrencyError::WorkerTimeout`] if no reply arrives in time
    /// - [`ConcurrencyError::WorkerOom`] if the worker blew its memory limit
    /// - [`ConcurrencyError::Spawn`] if no worker could be started
    pub async fn submit(&self, request: WorkerRequest) -> PoolResult<WorkerResponse> {
        let inner = &self.inner;
        if inner.is_shutting_down() {
            return Err(ConcurrencyError::shutting_down());
        }
        {
            let state = inner.state.lock();
            if let Err(e) = state.backpressure.admit(request.priority, state.scheduler.len()) {
                debug!(request_id = %request.id, priority = %request.priority, "rejected by backpressure");
                return Err(e);
            }
        }

        let started = Instant::now();
        let request_id = request.id.clone();
        let (result, worker_id) = self.run_admitted(request).await;
        self.record_outcome(&request_id, started, worker_id, &result);
        result
    }

    /// Session lock, then queue and dispatch.
    async fn run_admitted(&self, request: WorkerRequest) -> (PoolResult<WorkerResponse>, Option<WorkerId>) {
        let inner = &self.inner;
        let timeout = self.effective_timeout(&request);
        let _session = match request.session_id.as_deref() {
            Some(session_id) => {
                let lock_timeout = inner
                    .config
                    .session_lock_timeout_ms
                    .map_or(timeout, Duration::from_millis);
                match SessionGuard::acquire(Arc::clone(&inner.sessions), session_id, Some(lock_timeout)).await {
                    Ok(guard) => Some(guard),
                    Err(e) => return (Err(e), None),
                }
            }
            None => None,
        };
        if inner.is_shutting_down() {
            return (Err(ConcurrencyError::shutting_down()), None);
        }
        inner.run_request(request, timeout).await
    }

    fn effective_timeout(&self, request: &WorkerRequest) -> Duration {
        let cap = self.inner.config.worker_timeout_ms;
        Duration::from_millis(request.timeout_ms.map_or(cap, |ms| ms.min(cap)))
    }

    fn record_outcome(
        &self,
        request_id: &str,
        started: Instant,
        timed_out_on: Option<WorkerId>,
        result: &PoolResult<WorkerResponse>,
    ) {
        let inner = &self.inner;
        let now = Instant::now();
        let latency_ms = duration_ms(now.saturating_duration_since(started));
        let (worker_id, error) = match result {
            Ok(response) => {
                let failed = !response.outcome.is_success();
                inner.counters.record_processed(failed);
                inner.latency.lock().record(now, latency_ms);
                let error = match &response.outcome {
                    WorkerOutcome::Success(_) => None,
                    WorkerOutcome::Failure(message) => Some(message.clone()),
                };
                debug!(request_id, worker_id = %response.worker_id, latency_ms, success = !failed, "request completed");
                (Some(response.worker_id), error)
            }
            Err(e) => {
                inner.counters.record_error();
                debug!(request_id, kind = e.kind(), error = %e, "request failed");
                let worker_id = match e {
                    ConcurrencyError::WorkerOom { worker_id, .. } => Some(*worker_id),
                    _ => timed_out_on,
                };
                (worker_id, Some(e.kind().to_string()))
            }
        };
        inner.sink.publish(PoolEvent::RequestCompleted(RequestCompleted {
            request_id: request_id.to_string(),
            worker_id,
            success: error.is_none(),
            error,
            latency_ms,
            timestamp_ms: now_ms(),
        }));
    }

    /// Current statistics.
    #[must_use]
    pub fn metrics(&self) -> ConcurrencyMetrics {
        let inner = &self.inner;
        let (active_workers, idle_workers, stuck_workers, queue_depth, backpressure_level) = {
            let state = inner.state.lock();
            let queue_depth = state.scheduler.len();
            (
                state.registry.count(WorkerState::Busy),
                state.registry.count(WorkerState::Idle),
                state.registry.count(WorkerState::Stuck),
                queue_depth,
                state.backpressure.current_load(queue_depth),
            )
        };
        let latency = inner.latency.lock();
        ConcurrencyMetrics {
            active_workers,
            idle_workers,
            queue_depth,
            total_processed: inner.counters.total_processed.load(Ordering::Relaxed),
            total_errors: inner.counters.total_errors.load(Ordering::Relaxed),
            avg_latency_ms: latency.average(),
            p95_latency_ms: latency.percentile(95.0),
            p99_latency_ms: latency.percentile(99.0),
            throughput_per_minute: latency.throughput(Instant::now()),
            backpressure_level,
            stuck_workers,
        }
    }

    /// Snapshot of every worker the pool knows about, ordered by id.
    #[must_use]
    pub fn workers(&self) -> Vec<WorkerInfo> {
        self.inner.state.lock().registry.snapshot()
    }

    /// Whether health checks consider `worker_id` stuck right now.
    #[must_use]
    pub fn is_stuck(&self, worker_id: WorkerId) -> bool {
        let state = self.inner.state.lock();
        state.registry.get(worker_id).is_some_and(|info| {
            self.inner
                .health
                .is_stuck(info, state.registry.suspect_since(worker_id), Instant::now())
        })
    }

    /// Configuration the pool was started with.
    #[must_use]
    pub fn config(&self) -> &ConcurrencyConfig {
        &self.inner.config
    }

    /// Requests currently waiting for a worker.
    #[must_use]
    pub fn queue_depth(&self) -> usize {
        self.inner.state.lock().scheduler.len()
    }

    /// Whether [`shutdown`](Self::shutdown) has been called.
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.inner.is_shutting_down()
    }

    /// Stop accepting work, let queued and in-flight requests finish for up
    /// to `shutdown_grace_ms`, then fail whatever is left and stop every
    /// worker. Calling it again is a no-op.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        if inner.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("shutting down worker pool");
        if let Some(task) = inner.health_task.lock().take() {
            task.abort();
        }

        let grace = inner.config.shutdown_grace();
        let drained = tokio::time::timeout(grace, async {
            loop {
                let progress = inner.progress.notified();
                tokio::pin!(progress);
                let _ = progress.as_mut().enable();
                if inner.is_drained() {
                    break;
                }
                progress.await;
            }
        })
        .await
        .is_ok();
        if !drained {
            warn!(grace_ms = inner.config.shutdown_grace_ms, "shutdown grace period elapsed with work outstanding");
        }

        let (queued, retired) = {
            let mut state = inner.state.lock();
            let queued = state.scheduler.drain();
            let retired = state.registry.retire_all();
            for worker in &retired {
                inner.sink.publish(PoolEvent::WorkerRecycled(WorkerRecycled {
                    worker_id: worker.info.worker_id,
                    reason: TerminationReason::Shutdown,
                    requests_processed: worker.info.requests_processed,
                    timestamp_ms: now_ms(),
                }));
            }
            (queued, retired)
        };

        for entry in queued {
            let _ = entry.payload.reply.send(Err(ConcurrencyError::shutting_down()));
        }
        let worker_count = retired.len();
        for worker in retired {
            if let Some(reply) = worker.active.and_then(|a| a.reply) {
                let _ = reply.send(Err(ConcurrencyError::shutting_down()));
            }
            if let Some(handle) = worker.handle {
                stop_process(handle, true);
            }
        }
        info!(workers = worker_count, "worker pool shut down");
    }
}
