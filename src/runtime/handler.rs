//! Request handling abstraction for the worker side of the protocol.

use async_trait::async_trait;
use serde_json::Value;

/// Executes one request inside a worker process.
///
/// The worker runtime calls this once per `Request` message, one request at
/// a time, and turns the outcome into a `Result` or `Error` reply. An `Err`
/// is an application failure reported back to the caller, not a crash.
///
/// # Example
///
/// ```rust,ignore
/// use agent_worker_pool::runtime::RequestHandler;
/// use async_trait::async_trait;
/// use serde_json::{json, Value};
///
/// #[derive(Clone)]
/// struct AgentTurn;
///
/// #[async_trait]
/// impl RequestHandler for AgentTurn {
///     async fn handle(&self, _request_id: &str, payload: Value) -> Result<Value, String> {
///         let prompt = payload["prompt"].as_str().ok_or("missing prompt")?;
///         Ok(json!({ "reply": format!("echo: {prompt}") }))
///     }
/// }
/// ```
#[async_trait]
pub trait RequestHandler: Send + Sync + Clone + 'static {
    /// Execute a request payload and return its result.
    async fn handle(&self, request_id: &str, payload: Value) -> Result<Value, String>;
}
