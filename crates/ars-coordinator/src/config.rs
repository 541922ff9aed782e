use std::path::{Path, PathBuf};
use std::time::Duration;

use ars_fanout::FanoutStrategy;
use serde::{Deserialize, Serialize};

use crate::error::CoordinatorError;

/// Coordinator settings, loaded from TOML. Every field has a default.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CoordinatorConfig {
    /// Address the WebSocket listener binds to.
    pub bind: String,
    /// Subtasks per fan-out when a submission does not say.
    pub default_parallelism: usize,
    pub default_strategy: FanoutStrategy,
    /// Agents silent for longer than this are dropped from the registry.
    pub agent_stale_secs: u64,
    pub stale_sweep_secs: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:9100".to_string(),
            default_parallelism: 3,
            default_strategy: FanoutStrategy::RoundRobin,
            agent_stale_secs: 90,
            stale_sweep_secs: 30,
        }
    }
}

impl CoordinatorConfig {
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("ars").join("coordinator.toml"))
    }

    pub fn from_toml(contents: &str) -> Result<Self, CoordinatorError> {
        let config: Self =
            toml::from_str(contents).map_err(|e| CoordinatorError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: Option<&Path>) -> Result<Self, CoordinatorError> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => match Self::default_path() {
                Some(path) if path.exists() => path,
                _ => return Ok(Self::default()),
            },
        };
        let contents = std::fs::read_to_string(&path)?;
        Self::from_toml(&contents)
    }

    pub fn validate(&self) -> Result<(), CoordinatorError> {
        if self.bind.trim().is_empty() {
            return Err(CoordinatorError::Config("bind: must not be empty".into()));
        }
        if self.default_parallelism == 0 {
            return Err(CoordinatorError::Config(
                "default_parallelism: must be > 0".into(),
            ));
        }
        if self.agent_stale_secs == 0 || self.stale_sweep_secs == 0 {
            return Err(CoordinatorError::Config(
                "agent_stale_secs and stale_sweep_secs must be > 0".into(),
            ));
        }
        Ok(())
    }

    pub fn agent_stale_after(&self) -> Duration {
        Duration::from_secs(self.agent_stale_secs)
    }

    pub fn stale_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.stale_sweep_secs)
    }
}
