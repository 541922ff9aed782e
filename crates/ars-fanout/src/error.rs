use thiserror::Error;

#[derive(Debug, Error)]
pub enum FanoutError {
    #[error("fan-out for parent task '{0}' is already open")]
    DuplicateParent(String),

    #[error("unknown subtask '{0}'")]
    UnknownSubtask(String),

    #[error("parallelism must be at least 1")]
    InvalidParallelism,

    #[error("custom strategy requires a custom splitter")]
    MissingSplitter,

    #[error("split failed: {0}")]
    Split(String),

    #[error("dispatch of '{subtask_id}' failed: {reason}")]
    Dispatch { subtask_id: String, reason: String },
}
