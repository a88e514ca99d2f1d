//! Worker process main loop.
//!
//! Reads [`ParentMessage`] lines, runs each request through a
//! [`RequestHandler`] one at a time, and writes [`WorkerMessage`] replies.
//! A separate task emits heartbeats so a long request does not look like a
//! dead worker.

use std::io;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::RequestHandler;
use crate::process::command::HEARTBEAT_INTERVAL_ENV;
use crate::process::memory::current_rss_mb;
use crate::process::{ParentMessage, WorkerMessage};

/// Behavior of the worker loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerOptions {
    /// Heartbeat period; `None` disables heartbeats.
    pub heartbeat_interval: Option<Duration>,
    /// Include this process's RSS in heartbeats.
    pub report_memory: bool,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            heartbeat_interval: Some(Duration::from_secs(5)),
            report_memory: true,
        }
    }
}

impl WorkerOptions {
    /// Options for a real worker process, honoring the heartbeat period the
    /// pool passes through the environment.
    #[must_use]
    pub fn from_env() -> Self {
        let interval = std::env::var(HEARTBEAT_INTERVAL_ENV)
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis);
        Self {
            heartbeat_interval: interval.or(Self::default().heartbeat_interval),
            report_memory: true,
        }
    }
}

/// Serve the protocol on this process's stdin/stdout until `Shutdown` or EOF.
///
/// # Errors
///
/// Returns the I/O error that ended the loop.
pub async fn run_worker<H: RequestHandler>(handler: H) -> io::Result<()> {
    serve(handler, tokio::io::stdin(), tokio::io::stdout(), WorkerOptions::from_env()).await
}

/// Serve the protocol over an arbitrary byte stream pair.
///
/// # Errors
///
/// Returns the I/O error that ended the loop.
pub async fn serve<H, R, W>(handler: H, reader: R, writer: W, options: WorkerOptions) -> io::Result<()>
where
    H: RequestHandler,
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (out_tx, out_rx) = mpsc::unbounded_channel::<WorkerMessage>();
    let writer_task = tokio::spawn(write_messages(writer, out_rx));

    let _ = out_tx.send(WorkerMessage::Ready);

    let heartbeat = options.heartbeat_interval.map(|period| {
        let tx = out_tx.clone();
        let report_memory = options.report_memory;
        AbortOnDrop(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let memory_mb = if report_memory { current_rss_mb() } else { None };
                if tx.send(WorkerMessage::Heartbeat { memory_mb }).is_err() {
                    break;
                }
            }
        }))
    });

    let mut lines = BufReader::new(reader).lines();
    let result = loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break Ok(()),
            Err(e) => break Err(e),
        };
        if line.trim().is_empty() {
            continue;
        }
        match ParentMessage::from_line(&line) {
            Ok(ParentMessage::Request { request_id, payload }) => {
                debug!(request_id = %request_id, "handling request");
                let reply = match handler.handle(&request_id, payload).await {
                    Ok(result) => WorkerMessage::Result { request_id, result },
                    Err(message) => WorkerMessage::Error { request_id, message },
                };
                if out_tx.send(reply).is_err() {
                    break Ok(());
                }
            }
            Ok(ParentMessage::Shutdown) => {
                info!("shutdown requested");
                break Ok(());
            }
            Err(e) => warn!(error = %e, "discarding malformed request line"),
        }
    };

    drop(heartbeat);
    drop(out_tx);
    match writer_task.await {
        Ok(write_result) => result.and(write_result),
        Err(e) => result.and(Err(io::Error::other(e))),
    }
}

/// Aborts the task when the serving future goes away, including when the
/// future itself is cancelled.
struct AbortOnDrop(tokio::task::JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

async fn write_messages<W>(mut writer: W, mut rx: mpsc::UnboundedReceiver<WorkerMessage>) -> io::Result<()>
where
    W: AsyncWrite + Unpin + Send,
{
    while let Some(message) = rx.recv().await {
        let line = match message.to_line() {
            Ok(line) => line,
            Err(e) => {
                warn!(error = %e, "dropping unencodable reply");
                continue;
            }
        };
        writer.write_all(line.as_bytes()).await?;
        writer.flush().await?;
    }
    Ok(())
}
