//! Subprocess factory backed by `tokio::process`.
//!
//! Each worker is an OS child with piped stdin/stdout speaking the
//! newline-delimited protocol in [`protocol`](super::protocol); stderr is
//! inherited so worker logs reach the parent's log stream.

use std::ffi::OsString;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, Mutex, Notify};
use tracing::{debug, warn};

use super::memory::rss_mb;
use super::{
    ParentMessage, ProcessError, SpawnedProcess, SubprocessConfig, SubprocessEvent,
    SubprocessFactory, SubprocessHandle, WorkerMessage,
};

/// Environment variable carrying the worker id into the child.
pub const WORKER_ID_ENV: &str = "AGENT_POOL_WORKER_ID";
/// Environment variable carrying the memory ceiling (MiB) into the child.
pub const MEMORY_LIMIT_ENV: &str = "AGENT_POOL_MEMORY_LIMIT_MB";
/// Environment variable carrying the heartbeat period (ms) into the child.
pub const HEARTBEAT_INTERVAL_ENV: &str = "AGENT_POOL_HEARTBEAT_INTERVAL_MS";

/// Spawns workers by running a program.
#[derive(Debug, Clone)]
pub struct CommandFactory {
    program: PathBuf,
    args: Vec<OsString>,
    envs: Vec<(OsString, OsString)>,
}

impl CommandFactory {
    /// Run `program` for every worker.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
        }
    }

    /// Append a command-line argument.
    #[must_use]
    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Set an environment variable for every worker.
    #[must_use]
    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }
}

#[async_trait]
impl SubprocessFactory for CommandFactory {
    async fn spawn(&self, config: &SubprocessConfig) -> Result<SpawnedProcess, ProcessError> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .envs(self.envs.iter().map(|(k, v)| (k, v)))
            .env(WORKER_ID_ENV, config.worker_id.to_string())
            .env(MEMORY_LIMIT_ENV, config.memory_limit_mb.to_string())
            .env(HEARTBEAT_INTERVAL_ENV, config.heartbeat_interval_ms.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        let mut child = cmd.spawn()?;
        let pid = child.id().ok_or(ProcessError::MissingPipe("pid"))?;
        let stdin = child.stdin.take().ok_or(ProcessError::MissingPipe("stdin"))?;
        let stdout = child.stdout.take().ok_or(ProcessError::MissingPipe("stdout"))?;

        let (tx, events) = mpsc::unbounded_channel();
        let kill = Arc::new(Notify::new());

        let reader = tokio::spawn(read_messages(pid, stdout, tx.clone()));
        tokio::spawn(supervise(pid, child, Arc::clone(&kill), reader, tx));

        debug!(worker_id = %config.worker_id, pid, program = ?self.program, "worker process started");

        Ok(SpawnedProcess {
            handle: Arc::new(CommandHandle {
                pid,
                stdin: Mutex::new(stdin),
                kill,
            }),
            events,
        })
    }
}

struct CommandHandle {
    pid: u32,
    stdin: Mutex<ChildStdin>,
    kill: Arc<Notify>,
}

#[async_trait]
impl SubprocessHandle for CommandHandle {
    fn pid(&self) -> u32 {
        self.pid
    }

    async fn send(&self, message: &ParentMessage) -> Result<(), ProcessError> {
        let line = message.to_line()?;
        let mut stdin = self.stdin.lock().await;
        stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| ProcessError::Send(e.to_string()))?;
        stdin
            .flush()
            .await
            .map_err(|e| ProcessError::Send(e.to_string()))
    }

    fn kill(&self) {
        self.kill.notify_one();
    }

    async fn memory_usage_mb(&self) -> Option<u64> {
        rss_mb(self.pid).await
    }
}

/// Decode worker lines into events until EOF.
pub(super) async fn read_messages<R>(pid: u32, output: R, tx: mpsc::UnboundedSender<SubprocessEvent>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(output).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) if line.trim().is_empty() => {}
            Ok(Some(line)) => match WorkerMessage::from_line(&line) {
                Ok(message) => {
                    if tx.send(SubprocessEvent::Message(message)).is_err() {
                        break;
                    }
                }
                Err(e) => warn!(pid, error = %e, "discarding malformed worker line"),
            },
            Ok(None) => break,
            Err(e) => {
                warn!(pid, error = %e, "worker stdout read failed");
                break;
            }
        }
    }
}

/// Wait for exit (or a kill request), drain stdout, then report the exit.
async fn supervise(
    pid: u32,
    mut child: Child,
    kill: Arc<Notify>,
    reader: tokio::task::JoinHandle<()>,
    tx: mpsc::UnboundedSender<SubprocessEvent>,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        () = kill.notified() => {
            if let Err(e) = child.kill().await {
                warn!(pid, error = %e, "failed to kill worker process");
            }
            child.wait().await
        }
    };
    let _ = reader.await;
    let code = match status {
        Ok(status) => status.code(),
        Err(e) => {
            warn!(pid, error = %e, "failed to reap worker process");
            None
        }
    };
    debug!(pid, ?code, "worker process exited");
    let _ = tx.send(SubprocessEvent::Exited { code });
}
