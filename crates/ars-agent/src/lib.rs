//! ARS Agent - worker-side runtime
//!
//! Keeps one duplex connection to the coordinator alive, registers the
//! agent's capabilities, correlates request/response pairs and runs
//! dispatched tasks through the handlers registered by business logic.

pub mod backoff;
pub mod config;
pub mod connection;
pub mod correlator;
pub mod error;
pub mod executor;
pub mod heartbeat;
pub mod outbox;
pub mod router;
pub mod transport;

pub use backoff::Backoff;
pub use config::AgentConfig;
pub use connection::{ConnectionManager, ConnectionState};
pub use correlator::{Correlator, PendingRequest, RpcClient};
pub use error::{AgentError, TaskError};
pub use executor::{handler_fn, typed_handler, ActiveTask, TaskExecutor, TaskHandler};
pub use heartbeat::HeartbeatMonitor;
pub use outbox::Outbox;
pub use router::{MethodHandler, Router};
pub use transport::{bridge_websocket, Dialer, Link, MemoryDialer, WebSocketDialer};
