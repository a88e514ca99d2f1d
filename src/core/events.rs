//! Domain events and the sinks that receive them.
//!
//! Events are observability only; no pool decision depends on a sink.
//! Sinks are called from inside pool critical sections, so `publish` must
//! not block and must not call back into the pool.

use std::collections::VecDeque;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::core::lifecycle::TerminationReason;
use crate::core::types::{Priority, RequestId, SessionId, WorkerId};

/// A worker finished spawning and became idle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerSpawned {
    /// New worker.
    pub worker_id: WorkerId,
    /// OS process id.
    pub pid: u32,
    /// Event time, ms since epoch.
    pub timestamp_ms: u128,
}

/// A worker was terminated (planned or not) and removed from the pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerRecycled {
    /// Retired worker.
    pub worker_id: WorkerId,
    /// Why it was retired.
    pub reason: TerminationReason,
    /// Requests it completed over its lifetime.
    pub requests_processed: u64,
    /// Event time, ms since epoch.
    pub timestamp_ms: u128,
}

/// Health checks flagged a worker as stuck.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerStuck {
    /// Stuck worker.
    pub worker_id: WorkerId,
    /// Milliseconds since its last heartbeat.
    pub silent_for_ms: u64,
    /// Request it was serving, if any.
    pub request_id: Option<RequestId>,
    /// Event time, ms since epoch.
    pub timestamp_ms: u128,
}

/// A request entered the scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestQueued {
    /// Request.
    pub request_id: RequestId,
    /// Its priority.
    pub priority: Priority,
    /// Its session, if any.
    pub session_id: Option<SessionId>,
    /// Queue length after enqueue.
    pub queue_length: usize,
    /// Event time, ms since epoch.
    pub timestamp_ms: u128,
}

/// A request was dispatched to a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestStarted {
    /// Request.
    pub request_id: RequestId,
    /// Worker serving it.
    pub worker_id: WorkerId,
    /// Time spent queued.
    pub queued_ms: u64,
    /// Event time, ms since epoch.
    pub timestamp_ms: u128,
}

/// An admitted request finished, successfully or not.
///
/// Emitted once per request that passed the backpressure gate, including
/// requests that failed with a [`ConcurrencyError`](crate::core::ConcurrencyError).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestCompleted {
    /// Request.
    pub request_id: RequestId,
    /// Worker that served it, when one is known.
    pub worker_id: Option<WorkerId>,
    /// Whether the worker reported success.
    pub success: bool,
    /// When `success` is false: the worker's error message for a
    /// reported failure, otherwise the pool error kind (e.g. `worker_timeout`).
    pub error: Option<String>,
    /// Time from submit to completion.
    pub latency_ms: u64,
    /// Event time, ms since epoch.
    pub timestamp_ms: u128,
}

/// A request exceeded its timeout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestTimedOut {
    /// Request.
    pub request_id: RequestId,
    /// Worker flagged as suspect.
    pub worker_id: WorkerId,
    /// Timeout that elapsed.
    pub timeout_ms: u64,
    /// Event time, ms since epoch.
    pub timestamp_ms: u128,
}

/// Queue load crossed the backpressure threshold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackpressureActivated {
    /// Load at activation.
    pub load: f64,
    /// Configured threshold.
    pub threshold: f64,
    /// Queue length at activation.
    pub queue_length: usize,
    /// Event time, ms since epoch.
    pub timestamp_ms: u128,
}

/// Every event the pool emits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PoolEvent {
    /// See [`WorkerSpawned`].
    WorkerSpawned(WorkerSpawned),
    /// See [`WorkerRecycled`].
    WorkerRecycled(WorkerRecycled),
    /// See [`WorkerStuck`].
    WorkerStuck(WorkerStuck),
    /// See [`RequestQueued`].
    RequestQueued(RequestQueued),
    /// See [`RequestStarted`].
    RequestStarted(RequestStarted),
    /// See [`RequestCompleted`].
    RequestCompleted(RequestCompleted),
    /// See [`RequestTimedOut`].
    RequestTimedOut(RequestTimedOut),
    /// See [`BackpressureActivated`].
    BackpressureActivated(BackpressureActivated),
}

impl PoolEvent {
    /// Stable event name, matching the serialized `type` tag.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::WorkerSpawned(_) => "worker_spawned",
            Self::WorkerRecycled(_) => "worker_recycled",
            Self::WorkerStuck(_) => "worker_stuck",
            Self::RequestQueued(_) => "request_queued",
            Self::RequestStarted(_) => "request_started",
            Self::RequestCompleted(_) => "request_completed",
            Self::RequestTimedOut(_) => "request_timed_out",
            Self::BackpressureActivated(_) => "backpressure_activated",
        }
    }

    /// Event time, ms since epoch.
    #[must_use]
    pub const fn timestamp_ms(&self) -> u128 {
        match self {
            Self::WorkerSpawned(e) => e.timestamp_ms,
            Self::WorkerRecycled(e) => e.timestamp_ms,
            Self::WorkerStuck(e) => e.timestamp_ms,
            Self::RequestQueued(e) => e.timestamp_ms,
            Self::RequestStarted(e) => e.timestamp_ms,
            Self::RequestCompleted(e) => e.timestamp_ms,
            Self::RequestTimedOut(e) => e.timestamp_ms,
            Self::BackpressureActivated(e) => e.timestamp_ms,
        }
    }
}

/// Event bus abstraction.
pub trait EventSink: Send + Sync {
    /// Publish an event. Must not block.
    fn publish(&self, event: PoolEvent);
}

/// Logs every event through `tracing`. The default sink.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn publish(&self, event: PoolEvent) {
        match &event {
            PoolEvent::WorkerSpawned(e) => {
                info!(worker_id = %e.worker_id, pid = e.pid, "worker spawned");
            }
            PoolEvent::WorkerRecycled(e) => info!(
                worker_id = %e.worker_id,
                reason = ?e.reason,
                requests_processed = e.requests_processed,
                "worker recycled"
            ),
            PoolEvent::WorkerStuck(e) => warn!(
                worker_id = %e.worker_id,
                silent_for_ms = e.silent_for_ms,
                request_id = ?e.request_id,
                "worker stuck"
            ),
            PoolEvent::RequestTimedOut(e) => warn!(
                request_id = %e.request_id,
                worker_id = %e.worker_id,
                timeout_ms = e.timeout_ms,
                "request timed out"
            ),
            other => debug!(event = other.name(), "pool event"),
        }
    }
}

/// In-memory event sink for testing and dev, keeping the most recent events.
pub struct InMemoryEventSink {
    events: Mutex<VecDeque<PoolEvent>>,
    max_events: usize,
}

impl InMemoryEventSink {
    /// Create a new in-memory sink with a bounded buffer.
    #[must_use]
    pub fn new(max_events: usize) -> Self {
        Self {
            events: Mutex::new(VecDeque::with_capacity(max_events.min(1024))),
            max_events,
        }
    }

    /// Retrieve a snapshot of stored events.
    #[must_use]
    pub fn events(&self) -> Vec<PoolEvent> {
        self.events.lock().iter().cloned().collect()
    }

    /// Count stored events with the given [`PoolEvent::name`].
    #[must_use]
    pub fn count(&self, name: &str) -> usize {
        self.events.lock().iter().filter(|e| e.name() == name).count()
    }
}

impl EventSink for InMemoryEventSink {
    fn publish(&self, event: PoolEvent) {
        let mut events = self.events.lock();
        if events.len() >= self.max_events {
            events.pop_front();
        }
        events.push_back(event);
    }
}

/// Fans events out to any number of `tokio::sync::broadcast` subscribers.
#[derive(Clone)]
pub struct BroadcastEventSink {
    tx: broadcast::Sender<PoolEvent>,
}

impl BroadcastEventSink {
    /// Create a sink whose subscribers lag after `capacity` unread events.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Subscribe to subsequent events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.tx.subscribe()
    }
}

impl EventSink for BroadcastEventSink {
    fn publish(&self, event: PoolEvent) {
        // No subscribers is fine.
        let _ = self.tx.send(event);
    }
}
