//! ARS Coordinator - the server side of the agent protocol
//!
//! Accepts agent connections, keeps a capability registry, dispatches
//! fan-out subtasks to capable agents and publishes aggregated results.

pub mod config;
pub mod dispatch;
pub mod error;
pub mod registry;
pub mod server;

pub use config::CoordinatorConfig;
pub use dispatch::AgentDispatcher;
pub use error::CoordinatorError;
pub use registry::{AgentHandle, AgentRegistry, RegisteredAgent};
pub use server::{Coordinator, CoordinatorEvent};
