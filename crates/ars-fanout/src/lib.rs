//! ARS Fan-out - parallel task decomposition
//!
//! Splits one logical task into subtasks for several agents, tracks their
//! outcomes and reduces the partial results into a single answer once every
//! subtask has reported.

pub mod aggregate;
pub mod error;
pub mod manager;
pub mod splitter;
pub mod task;

pub use aggregate::{aggregate_by_action, Aggregator};
pub use error::FanoutError;
pub use manager::{DispatchReport, DispatchSink, FanoutManager, FanoutOptions};
pub use splitter::{chunk, split_default, Splitter, CHUNKED_FIELDS};
pub use task::{subtask_id, FanoutStatus, FanoutStrategy, FanoutTask, ParentTask, Subtask};
