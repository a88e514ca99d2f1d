//! Minimal worker process speaking the pool protocol on stdin/stdout.
//!
//! Echoes the request payload back. Recognized payload fields:
//! - `sleep_ms`: delay before replying
//! - `fail`: reply with an error carrying this message
//! - `exit_code`: exit the process immediately with this code

use std::time::Duration;

use agent_worker_pool::runtime::{run_worker, RequestHandler};
use agent_worker_pool::util::init_worker_tracing;
use anyhow::Context;
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

#[derive(Clone)]
struct Echo;

#[async_trait]
impl RequestHandler for Echo {
    async fn handle(&self, request_id: &str, payload: Value) -> Result<Value, String> {
        if let Some(ms) = payload.get("sleep_ms").and_then(Value::as_u64) {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
        if let Some(code) = payload.get("exit_code").and_then(Value::as_i64) {
            std::process::exit(i32::try_from(code).unwrap_or(1));
        }
        if let Some(message) = payload.get("fail").and_then(Value::as_str) {
            return Err(message.to_string());
        }
        debug!(request_id, "echoing payload");
        Ok(json!({ "echo": payload, "pid": std::process::id() }))
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    init_worker_tracing();
    run_worker(Echo).await.context("worker loop failed")
}
