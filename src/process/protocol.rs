//! Wire protocol between the pool and a worker subprocess.
//!
//! Messages are JSON-serialized and newline-delimited, tagged by `type`.
//! Requests and replies are correlated by `request_id`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::types::RequestId;

/// Message from the pool to a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ParentMessage {
    /// Execute a request.
    Request {
        /// Correlation id, echoed in the reply.
        request_id: RequestId,
        /// Opaque request payload.
        payload: Value,
    },
    /// Finish up and exit.
    Shutdown,
}

/// Message from a worker to the pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMessage {
    /// Worker started and is ready for work.
    Ready,
    /// Liveness signal, optionally with a self-reported RSS sample.
    Heartbeat {
        /// Resident memory in MiB, if the worker measured it.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        memory_mb: Option<u64>,
    },
    /// Successful reply.
    Result {
        /// Request being answered.
        request_id: RequestId,
        /// Result value.
        result: Value,
    },
    /// Application-level failure for a request.
    Error {
        /// Request being answered.
        request_id: RequestId,
        /// Error message.
        message: String,
    },
}

impl ParentMessage {
    /// Build a request message.
    pub fn request(request_id: impl Into<RequestId>, payload: Value) -> Self {
        Self::Request {
            request_id: request_id.into(),
            payload,
        }
    }

    /// Serialize to a JSON line (with trailing newline).
    ///
    /// # Errors
    ///
    /// Returns the serializer error if the payload cannot be encoded.
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        let mut json = serde_json::to_string(self)?;
        json.push('\n');
        Ok(json)
    }

    /// Deserialize from a JSON line.
    ///
    /// # Errors
    ///
    /// Returns the parse error for malformed input.
    pub fn from_line(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line.trim())
    }
}

impl WorkerMessage {
    /// Serialize to a JSON line (with trailing newline).
    ///
    /// # Errors
    ///
    /// Returns the serializer error if the result cannot be encoded.
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        let mut json = serde_json::to_string(self)?;
        json.push('\n');
        Ok(json)
    }

    /// Deserialize from a JSON line.
    ///
    /// # Errors
    ///
    /// Returns the parse error for malformed input.
    pub fn from_line(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line.trim())
    }

    /// Request this message answers, if it is a reply.
    #[must_use]
    pub fn request_id(&self) -> Option<&str> {
        match self {
            Self::Result { request_id, .. } | Self::Error { request_id, .. } => Some(request_id),
            Self::Ready | Self::Heartbeat { .. } => None,
        }
    }
}
