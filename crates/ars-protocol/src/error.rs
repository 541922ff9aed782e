use thiserror::Error;

/// Errors raised while decoding or encoding wire messages.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("unsupported JSON-RPC version: {0}")]
    UnsupportedVersion(String),
}
