//! Worker-side runtime: what runs inside a worker process.

pub mod handler;
pub mod worker_main;

pub use handler::RequestHandler;
pub use worker_main::{run_worker, serve, WorkerOptions};
