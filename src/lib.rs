//! # Agent Worker Pool
//!
//! Concurrency core for an AI-agent gateway: many inbound channels fan
//! requests into a bounded pool of isolated worker subprocesses.
//!
//! ## Core Problem Solved
//!
//! Agent turns are slow, memory-hungry and occasionally wedge. Running them
//! in-process lets one bad turn take down the gateway; running them
//! unbounded exhausts the host. This crate provides:
//!
//! - **Priority admission**: a bounded three-level queue (`high`, `normal`,
//!   `low`) with FIFO order inside a level
//! - **Backpressure**: once the queue passes a load threshold only `high`
//!   work is admitted
//! - **Session ordering**: requests for the same conversation run one at a
//!   time, in submission order
//! - **Worker supervision**: heartbeat-based stuck detection, per-worker
//!   memory ceilings, recycling after a request budget, and automatic
//!   replacement to keep the pool within `[min_workers, max_workers]`
//! - **Crash isolation**: workers are OS processes speaking a
//!   newline-delimited JSON protocol; a crash fails only its own request
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use agent_worker_pool::config::ConcurrencyConfig;
//! use agent_worker_pool::core::{WorkerPool, WorkerRequest};
//! use agent_worker_pool::process::CommandFactory;
//! use serde_json::json;
//!
//! agent_worker_pool::util::init_tracing();
//!
//! let config = ConcurrencyConfig::new()
//!     .with_min_workers(2)
//!     .with_max_workers(8)
//!     .with_worker_timeout_ms(60_000);
//! let pool = WorkerPool::start(config, Arc::new(CommandFactory::new("agent-worker"))).await?;
//!
//! let reply = pool
//!     .submit(WorkerRequest::new(json!({"prompt": "hi"})).with_session("slack:C042"))
//!     .await?;
//! println!("{:?} in {}ms", reply.outcome, reply.processing_time_ms);
//!
//! pool.shutdown().await;
//! ```
//!
//! Worker binaries implement [`runtime::RequestHandler`] and call
//! [`runtime::run_worker`]; see `src/bin/echo_worker.rs`.

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

/// Scheduling, session ordering, backpressure and worker supervision.
pub mod core;
/// Configuration for worker pools.
pub mod config;
/// Process-spawning facilities and the worker wire protocol.
pub mod process;
/// Worker-side runtime.
pub mod runtime;
/// Shared utilities.
pub mod util;
