/// JSON-RPC envelope version.
pub const JSONRPC_VERSION: &str = "2.0";

/// Protocol version announced during registration.
pub const PROTOCOL_VERSION: &str = "1.0";

// ── JSON-RPC error codes ──

pub const PARSE_ERROR: i32 = -32700;
pub const INVALID_REQUEST: i32 = -32600;
/// Unknown method or unregistered task type.
pub const METHOD_NOT_FOUND: i32 = -32601;
pub const INVALID_PARAMS: i32 = -32602;
/// Handler failure.
pub const INTERNAL_ERROR: i32 = -32603;

// ── Defaults ──

pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 30;
pub const DEFAULT_TASK_TIMEOUT_SECS: u64 = 3_600;
pub const DEFAULT_TASK_SWEEP_INTERVAL_SECS: u64 = 60;
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 10;
pub const DEFAULT_RECONNECT_BASE_DELAY_MS: u64 = 5_000;

/// Exponent clamp for reconnect backoff: attempt 6 and later share a delay.
pub const MAX_BACKOFF_EXPONENT: u32 = 5;
/// Upper bound (exclusive) of the uniform jitter added to each backoff delay.
pub const RECONNECT_JITTER_MS: u64 = 100;
