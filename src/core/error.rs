//! Error types for pool operations.

use thiserror::Error;

use crate::core::types::{RequestId, SessionId, WorkerId};

/// Errors returned by [`WorkerPool::submit`](crate::core::WorkerPool::submit)
/// and the components behind it.
///
/// Every domain kind is recoverable: callers should retry with backoff.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConcurrencyError {
    /// Queue is at its hard cap.
    #[error("queue full: {max_queue_size} requests already queued")]
    QueueFull {
        /// Configured hard cap.
        max_queue_size: usize,
    },
    /// Request rejected by load-based admission control.
    #[error("rejected under high load: {reason}")]
    Backpressure {
        /// Why admission was denied.
        reason: String,
    },
    /// No reply arrived within the timeout; the request may have partially run.
    #[error("request {request_id} got no worker reply after {waited_ms}ms")]
    WorkerTimeout {
        /// Request that timed out.
        request_id: RequestId,
        /// How long the caller waited.
        waited_ms: u64,
    },
    /// Worker exceeded its memory ceiling while serving the request.
    #[error("{worker_id} exceeded memory limit ({memory_mb}MiB > {limit_mb}MiB)")]
    WorkerOom {
        /// Worker that was terminated.
        worker_id: WorkerId,
        /// Last sampled resident memory.
        memory_mb: u64,
        /// Configured ceiling.
        limit_mb: u64,
    },
    /// Session lock was not granted within the timeout.
    #[error("session {session_id} still locked after {timeout_ms}ms")]
    LockAcquisition {
        /// Contended session.
        session_id: SessionId,
        /// How long the caller waited.
        timeout_ms: u64,
    },
    /// The process facility could not start a worker and none are live.
    #[error("failed to spawn worker: {0}")]
    Spawn(String),
    /// Pool configuration failed validation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl ConcurrencyError {
    /// Rejection used once the pool has begun shutting down.
    #[must_use]
    pub fn shutting_down() -> Self {
        Self::Backpressure {
            reason: "pool is shutting down".into(),
        }
    }

    /// Whether the caller may retry the request later.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        !matches!(self, Self::Spawn(_) | Self::InvalidConfig(_))
    }

    /// Short stable label for logs and events.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::QueueFull { .. } => "queue_full",
            Self::Backpressure { .. } => "backpressure",
            Self::WorkerTimeout { .. } => "worker_timeout",
            Self::WorkerOom { .. } => "worker_oom",
            Self::LockAcquisition { .. } => "lock_acquisition",
            Self::Spawn(_) => "spawn",
            Self::InvalidConfig(_) => "invalid_config",
        }
    }
}

/// Result alias used throughout the crate.
pub type PoolResult<T> = Result<T, ConcurrencyError>;
