//! Process-spawning facility consumed by the worker lifecycle.
//!
//! The pool never creates OS processes itself; it asks a
//! [`SubprocessFactory`] for a [`SpawnedProcess`] and talks to it through a
//! [`SubprocessHandle`] plus a stream of [`SubprocessEvent`]s.
//!
//! - [`CommandFactory`] launches real subprocesses with `tokio::process`.
//! - [`InMemoryFactory`] runs workers as tokio tasks over channels, for
//!   tests and single-binary development.

pub mod command;
pub mod in_memory;
pub mod memory;
pub mod protocol;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::core::types::WorkerId;

pub use command::CommandFactory;
pub use in_memory::InMemoryFactory;
pub use protocol::{ParentMessage, WorkerMessage};

/// Errors produced by a process facility.
#[derive(Debug, Error)]
pub enum ProcessError {
    /// The OS refused to start the process.
    #[error("spawn failed: {0}")]
    Spawn(#[from] std::io::Error),
    /// The process started but a pipe was not captured.
    #[error("worker pipe unavailable: {0}")]
    MissingPipe(&'static str),
    /// Writing to the worker failed.
    #[error("send to worker failed: {0}")]
    Send(String),
    /// Message could not be encoded.
    #[error("encode failed: {0}")]
    Encode(#[from] serde_json::Error),
    /// The facility refused to spawn (e.g. a test factory configured to fail).
    #[error("{0}")]
    Rejected(String),
}

/// Parameters handed to the facility for each spawn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubprocessConfig {
    /// Identifier the pool will use for this worker.
    pub worker_id: WorkerId,
    /// Default request timeout.
    pub timeout_ms: u64,
    /// Memory ceiling the worker should respect.
    pub memory_limit_mb: u64,
    /// How often the worker should heartbeat.
    pub heartbeat_interval_ms: u64,
}

/// Something a worker process reported.
#[derive(Debug, Clone, PartialEq)]
pub enum SubprocessEvent {
    /// A decoded protocol message.
    Message(WorkerMessage),
    /// The process exited; no further events follow.
    Exited {
        /// Exit code, if the process exited normally.
        code: Option<i32>,
    },
}

/// Live connection to one worker process.
#[async_trait]
pub trait SubprocessHandle: Send + Sync + 'static {
    /// OS process id.
    fn pid(&self) -> u32;

    /// Send a message over the worker channel.
    async fn send(&self, message: &ParentMessage) -> Result<(), ProcessError>;

    /// Signal the process to terminate. Exit is reported as
    /// [`SubprocessEvent::Exited`].
    fn kill(&self);

    /// Sample resident memory in MiB, if the platform supports it.
    async fn memory_usage_mb(&self) -> Option<u64>;
}

/// A freshly spawned worker.
pub struct SpawnedProcess {
    /// Control handle.
    pub handle: Arc<dyn SubprocessHandle>,
    /// Messages and exit notification, in order.
    pub events: mpsc::UnboundedReceiver<SubprocessEvent>,
}

/// Launches worker processes.
#[async_trait]
pub trait SubprocessFactory: Send + Sync + 'static {
    /// Spawn one worker.
    async fn spawn(&self, config: &SubprocessConfig) -> Result<SpawnedProcess, ProcessError>;
}
