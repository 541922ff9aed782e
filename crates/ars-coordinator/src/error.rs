use ars_fanout::FanoutError;
use ars_protocol::ProtocolError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("unknown agent: {0}")]
    UnknownAgent(String),

    #[error("agent '{0}' is no longer connected")]
    AgentGone(String),

    #[error(transparent)]
    Fanout(#[from] FanoutError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}
