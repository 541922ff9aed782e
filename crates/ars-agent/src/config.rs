//! Agent configuration.
//!
//! Loaded from TOML; every section and field has a default so an empty file
//! (or no file at all) yields a runnable executor agent pointed at a local
//! coordinator.

use std::path::{Path, PathBuf};
use std::time::Duration;

use ars_protocol::{
    AgentKind, ServiceInfo, WireForm, DEFAULT_HEARTBEAT_INTERVAL_SECS,
    DEFAULT_MAX_RECONNECT_ATTEMPTS, DEFAULT_RECONNECT_BASE_DELAY_MS, DEFAULT_REQUEST_TIMEOUT_MS,
    DEFAULT_TASK_SWEEP_INTERVAL_SECS, DEFAULT_TASK_TIMEOUT_SECS,
};
use serde::{Deserialize, Serialize};

use crate::error::AgentError;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AgentConfig {
    pub agent: AgentSection,
    pub server: ServerSection,
    pub reconnect: ReconnectSection,
    pub heartbeat: HeartbeatSection,
    pub requests: RequestSection,
    pub tasks: TaskSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AgentSection {
    #[serde(rename = "type")]
    pub kind: AgentKind,
    pub capabilities: Vec<String>,
    pub service: Option<ServiceInfo>,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            kind: AgentKind::Executor,
            capabilities: Vec::new(),
            service: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerSection {
    pub url: String,
    pub wire_form: WireForm,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:9100/agents".to_string(),
            wire_form: WireForm::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReconnectSection {
    pub enabled: bool,
    pub max_attempts: u32,
    pub base_delay_ms: u64,
}

impl Default for ReconnectSection {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            base_delay_ms: DEFAULT_RECONNECT_BASE_DELAY_MS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HeartbeatSection {
    pub interval_secs: u64,
}

impl Default for HeartbeatSection {
    fn default() -> Self {
        Self {
            interval_secs: DEFAULT_HEARTBEAT_INTERVAL_SECS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RequestSection {
    pub timeout_ms: u64,
}

impl Default for RequestSection {
    fn default() -> Self {
        Self {
            timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TaskSection {
    pub timeout_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for TaskSection {
    fn default() -> Self {
        Self {
            timeout_secs: DEFAULT_TASK_TIMEOUT_SECS,
            sweep_interval_secs: DEFAULT_TASK_SWEEP_INTERVAL_SECS,
        }
    }
}

impl AgentConfig {
    /// `$CONFIG_DIR/ars/agent.toml`, when the platform has a config dir.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("ars").join("agent.toml"))
    }

    pub fn from_path(path: &Path) -> Result<Self, AgentError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| AgentError::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> Result<Self, AgentError> {
        let config: AgentConfig =
            toml::from_str(contents).map_err(|e| AgentError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load `path` if given, else the default path if it exists, else the
    /// built-in defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, AgentError> {
        if let Some(path) = path {
            return Self::from_path(path);
        }
        match Self::default_path() {
            Some(path) if path.exists() => Self::from_path(&path),
            _ => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<(), AgentError> {
        let invalid = |field: &str, reason: &str| {
            Err(AgentError::Config(format!("{field}: {reason}")))
        };
        if self.server.url.trim().is_empty() {
            return invalid("server.url", "must not be empty");
        }
        if self.reconnect.enabled && self.reconnect.max_attempts == 0 {
            return invalid("reconnect.max_attempts", "must be > 0 when reconnect is enabled");
        }
        if self.heartbeat.interval_secs == 0 {
            return invalid("heartbeat.interval_secs", "must be > 0");
        }
        if self.requests.timeout_ms == 0 {
            return invalid("requests.timeout_ms", "must be > 0");
        }
        if self.tasks.timeout_secs == 0 {
            return invalid("tasks.timeout_secs", "must be > 0");
        }
        if self.tasks.sweep_interval_secs == 0 {
            return invalid("tasks.sweep_interval_secs", "must be > 0");
        }
        if self.agent.capabilities.iter().any(|c| c.trim().is_empty()) {
            return invalid("agent.capabilities", "entries must not be empty");
        }
        Ok(())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat.interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.requests.timeout_ms)
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.tasks.timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.tasks.sweep_interval_secs)
    }

    pub fn reconnect_base_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect.base_delay_ms)
    }
}
