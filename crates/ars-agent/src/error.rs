use ars_protocol::{ProtocolError, RpcError};
use thiserror::Error;

/// Errors surfaced by the agent runtime.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("connection failed after {attempts} attempts: {last_error}")]
    ConnectionExhausted { attempts: u32, last_error: String },

    #[error("not connected")]
    NotConnected,

    #[error("request '{method}' timed out after {timeout_ms}ms")]
    RequestTimeout { method: String, timeout_ms: u64 },

    #[error("remote error: {0}")]
    Remote(RpcError),

    #[error("request '{0}' was dropped before a response arrived")]
    RequestDropped(String),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("configuration error: {0}")]
    Config(String),
}

/// Failure raised by a task handler. Converted into an error `task_result`
/// at the execution boundary.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct TaskError {
    pub code: i32,
    pub message: String,
}

impl TaskError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            code: ars_protocol::INTERNAL_ERROR,
            message: message.into(),
        }
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self {
            code: ars_protocol::INVALID_PARAMS,
            message: message.into(),
        }
    }
}

impl From<serde_json::Error> for TaskError {
    fn from(e: serde_json::Error) -> Self {
        Self::invalid_params(e.to_string())
    }
}

impl From<anyhow::Error> for TaskError {
    fn from(e: anyhow::Error) -> Self {
        Self::new(format!("{e:#}"))
    }
}
