//! In-process worker facility.
//!
//! Each "process" is a tokio task running the real worker loop
//! ([`serve`](crate::runtime::serve)) over an in-memory duplex pipe, so the
//! wire protocol is exercised end to end without launching binaries. The
//! factory exposes knobs that tests use to script spawn latency, spawn
//! failure, heartbeat behavior and memory readings.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{duplex, split, AsyncWriteExt, DuplexStream, WriteHalf};
use tokio::sync::{mpsc, watch};
use tokio::task::AbortHandle;
use tracing::debug;

use super::command::read_messages;
use super::{
    ParentMessage, ProcessError, SpawnedProcess, SubprocessConfig, SubprocessEvent,
    SubprocessFactory, SubprocessHandle,
};
use crate::runtime::{serve, RequestHandler, WorkerOptions};

const PIPE_CAPACITY: usize = 64 * 1024;
const FIRST_PID: u32 = 1000;

/// Heartbeat behavior of spawned in-memory workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HeartbeatMode {
    /// Use the interval from the pool configuration.
    #[default]
    FromConfig,
    /// Use a fixed interval.
    Every(Duration),
    /// Never heartbeat.
    Disabled,
}

/// Spawns workers as tokio tasks driving a [`RequestHandler`].
pub struct InMemoryFactory<H> {
    handler: H,
    heartbeats: HeartbeatMode,
    next_pid: AtomicU32,
    spawned: AtomicUsize,
    killed: Arc<AtomicUsize>,
    fail_spawns: AtomicBool,
    hold: watch::Sender<bool>,
    memory: Arc<Mutex<HashMap<u32, u64>>>,
}

impl<H: RequestHandler> InMemoryFactory<H> {
    /// Factory whose workers run `handler`.
    pub fn new(handler: H) -> Self {
        Self {
            handler,
            heartbeats: HeartbeatMode::default(),
            next_pid: AtomicU32::new(FIRST_PID),
            spawned: AtomicUsize::new(0),
            killed: Arc::new(AtomicUsize::new(0)),
            fail_spawns: AtomicBool::new(false),
            hold: watch::Sender::new(false),
            memory: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Set heartbeat behavior for workers spawned from now on.
    #[must_use]
    pub fn with_heartbeats(mut self, mode: HeartbeatMode) -> Self {
        self.heartbeats = mode;
        self
    }

    /// Number of successful spawns so far.
    pub fn spawned(&self) -> usize {
        self.spawned.load(Ordering::SeqCst)
    }

    /// Number of kill requests so far.
    pub fn killed(&self) -> usize {
        self.killed.load(Ordering::SeqCst)
    }

    /// Make subsequent spawns fail (`true`) or succeed (`false`).
    pub fn set_fail_spawns(&self, fail: bool) {
        self.fail_spawns.store(fail, Ordering::SeqCst);
    }

    /// Block spawns until [`release_spawns`](Self::release_spawns).
    pub fn hold_spawns(&self) {
        self.hold.send_replace(true);
    }

    /// Let held and future spawns proceed.
    pub fn release_spawns(&self) {
        self.hold.send_replace(false);
    }

    /// Script the memory reading reported for `pid`.
    pub fn set_memory_mb(&self, pid: u32, memory_mb: u64) {
        self.memory.lock().insert(pid, memory_mb);
    }

    fn worker_options(&self, config: &SubprocessConfig) -> WorkerOptions {
        let heartbeat_interval = match self.heartbeats {
            HeartbeatMode::FromConfig => Some(Duration::from_millis(config.heartbeat_interval_ms)),
            HeartbeatMode::Every(period) => Some(period),
            HeartbeatMode::Disabled => None,
        };
        WorkerOptions {
            heartbeat_interval,
            report_memory: false,
        }
    }
}

#[async_trait]
impl<H: RequestHandler> SubprocessFactory for InMemoryFactory<H> {
    async fn spawn(&self, config: &SubprocessConfig) -> Result<SpawnedProcess, ProcessError> {
        let mut gate = self.hold.subscribe();
        // Sender lives in self, so the gate cannot close while we wait.
        let _ = gate.wait_for(|held| !held).await;

        if self.fail_spawns.load(Ordering::SeqCst) {
            return Err(ProcessError::Rejected(format!(
                "spawn of {} rejected",
                config.worker_id
            )));
        }

        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        let (parent_side, worker_side) = duplex(PIPE_CAPACITY);
        let (worker_read, worker_write) = split(worker_side);
        let (parent_read, parent_write) = split(parent_side);

        let worker = tokio::spawn(serve(
            self.handler.clone(),
            worker_read,
            worker_write,
            self.worker_options(config),
        ));
        let abort = worker.abort_handle();

        let (tx, events) = mpsc::unbounded_channel();
        let reader = tokio::spawn(read_messages(pid, parent_read, tx.clone()));
        tokio::spawn(async move {
            let code = match worker.await {
                Ok(Ok(())) => Some(0),
                Ok(Err(_)) => Some(1),
                Err(_) => None,
            };
            let _ = reader.await;
            debug!(pid, ?code, "in-memory worker exited");
            let _ = tx.send(SubprocessEvent::Exited { code });
        });

        self.spawned.fetch_add(1, Ordering::SeqCst);
        debug!(worker_id = %config.worker_id, pid, "in-memory worker started");

        Ok(SpawnedProcess {
            handle: Arc::new(InMemoryHandle {
                pid,
                input: tokio::sync::Mutex::new(parent_write),
                abort,
                killed: Arc::clone(&self.killed),
                memory: Arc::clone(&self.memory),
            }),
            events,
        })
    }
}

struct InMemoryHandle {
    pid: u32,
    input: tokio::sync::Mutex<WriteHalf<DuplexStream>>,
    abort: AbortHandle,
    killed: Arc<AtomicUsize>,
    memory: Arc<Mutex<HashMap<u32, u64>>>,
}

#[async_trait]
impl SubprocessHandle for InMemoryHandle {
    fn pid(&self) -> u32 {
        self.pid
    }

    async fn send(&self, message: &ParentMessage) -> Result<(), ProcessError> {
        let line = message.to_line()?;
        let mut input = self.input.lock().await;
        input
            .write_all(line.as_bytes())
            .await
            .map_err(|e| ProcessError::Send(e.to_string()))?;
        input
            .flush()
            .await
            .map_err(|e| ProcessError::Send(e.to_string()))
    }

    fn kill(&self) {
        self.killed.fetch_add(1, Ordering::SeqCst);
        self.abort.abort();
    }

    async fn memory_usage_mb(&self) -> Option<u64> {
        self.memory.lock().get(&self.pid).copied()
    }
}
