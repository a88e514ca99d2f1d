//! Core value types shared by the scheduler, lifecycle, and pool.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;

/// Correlation identifier for a request.
pub type RequestId = String;

/// Conversation/session identifier used for serialization.
pub type SessionId = String;

/// Pool-scoped worker identifier, displayed as `worker-N`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(pub u64);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

/// Request priority. Determines dequeue order, never preemption.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// Background work, first to be shed.
    Low,
    /// Default priority.
    #[default]
    Normal,
    /// Urgent work; the only level admitted under backpressure.
    High,
}

impl Priority {
    /// All levels, highest first.
    pub const DESCENDING: [Self; 3] = [Self::High, Self::Normal, Self::Low];

    /// The top-tier priority.
    #[must_use]
    pub const fn highest() -> Self {
        Self::High
    }

    pub(crate) const fn index(self) -> usize {
        match self {
            Self::Low => 0,
            Self::Normal => 1,
            Self::High => 2,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
        };
        f.write_str(s)
    }
}

/// A request held by the scheduler until dispatch.
#[derive(Debug)]
pub struct QueueEntry<P> {
    /// Correlation identifier.
    pub request_id: RequestId,
    /// Dequeue precedence.
    pub priority: Priority,
    /// Session the request belongs to, if any.
    pub session_id: Option<SessionId>,
    /// When the entry was enqueued.
    pub enqueued_at: Instant,
    /// Entry payload.
    pub payload: P,
}

impl<P> QueueEntry<P> {
    /// Build an entry stamped with the current time.
    pub fn new(request_id: impl Into<RequestId>, priority: Priority, payload: P) -> Self {
        Self {
            request_id: request_id.into(),
            priority,
            session_id: None,
            enqueued_at: Instant::now(),
            payload,
        }
    }

    /// Attach a session identifier.
    #[must_use]
    pub fn with_session(mut self, session_id: Option<SessionId>) -> Self {
        self.session_id = session_id;
        self
    }
}

/// Worker lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    /// Spawn in progress.
    Starting,
    /// Ready for a request.
    Idle,
    /// Serving a request.
    Busy,
    /// Flagged by health checks; awaiting termination.
    Stuck,
    /// Being killed.
    Terminating,
    /// Gone. Only seen in final snapshots.
    Terminated,
}

impl WorkerState {
    /// Whether the worker counts towards the live pool size.
    #[must_use]
    pub const fn is_live(self) -> bool {
        matches!(self, Self::Starting | Self::Idle | Self::Busy)
    }
}

/// Point-in-time view of a worker.
#[derive(Debug, Clone)]
pub struct WorkerInfo {
    /// Worker identifier.
    pub worker_id: WorkerId,
    /// OS process id once spawned.
    pub pid: Option<u32>,
    /// Lifecycle state.
    pub state: WorkerState,
    /// When the spawn was requested.
    pub spawned_at: Instant,
    /// Last message received from the worker.
    pub last_heartbeat_at: Instant,
    /// Requests completed by this worker.
    pub requests_processed: u64,
    /// Last memory sample, in MiB.
    pub memory_usage_mb: Option<u64>,
    /// Set after a request on this worker timed out.
    pub suspect: bool,
}

/// A request submitted to the pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerRequest {
    /// Correlation identifier; defaults to a random UUID.
    pub id: RequestId,
    /// Originating tenant (channel/user/chat), for logs only.
    pub tenant_id: Option<String>,
    /// Session to serialize on, if any.
    pub session_id: Option<SessionId>,
    /// Dequeue precedence.
    pub priority: Priority,
    /// Caller timeout, capped at the configured worker timeout.
    pub timeout_ms: Option<u64>,
    /// Opaque payload forwarded to the worker.
    pub payload: Value,
}

impl WorkerRequest {
    /// Create a normal-priority request with a fresh id.
    #[must_use]
    pub fn new(payload: Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            tenant_id: None,
            session_id: None,
            priority: Priority::Normal,
            timeout_ms: None,
            payload,
        }
    }

    /// Override the request id.
    #[must_use]
    pub fn with_id(mut self, id: impl Into<RequestId>) -> Self {
        self.id = id.into();
        self
    }

    /// Set the tenant.
    #[must_use]
    pub fn with_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    /// Set the session.
    #[must_use]
    pub fn with_session(mut self, session_id: impl Into<SessionId>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Set the priority.
    #[must_use]
    pub const fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Set the caller timeout.
    #[must_use]
    pub const fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }
}

/// What the worker produced for a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerOutcome {
    /// The worker returned a result.
    Success(Value),
    /// The worker reported an application error.
    Failure(String),
}

impl WorkerOutcome {
    /// Whether the worker reported success.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }
}

/// Reply correlated to a [`WorkerRequest`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerResponse {
    /// Request this reply answers.
    pub request_id: RequestId,
    /// Worker that served it.
    pub worker_id: WorkerId,
    /// Result or application error.
    pub outcome: WorkerOutcome,
    /// Time between dispatch and reply.
    pub processing_time_ms: u64,
}
