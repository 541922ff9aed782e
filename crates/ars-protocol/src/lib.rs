//! ARS Protocol - Wire codec and shared message payloads
//!
//! Message formats spoken between ARS agents and the coordinator. Two envelope
//! shapes travel on the same connection: the type-tagged form used for agent
//! registration, heartbeats and task dispatch, and the JSON-RPC 2.0 form used
//! by newer components. Both decode into a single [`Message`] sum type.

pub mod constants;
pub mod error;
pub mod identity;
pub mod messages;
pub mod types;

pub use constants::*;
pub use error::*;
pub use identity::*;
pub use messages::*;
pub use types::*;
