use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::constants::PROTOCOL_VERSION;
use crate::types::RegistrationParams;

/// The kinds of worker process deployed on the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    Database,
    Executor,
    Writer,
    Screening,
    ResearchManager,
    AiService,
    ApiGateway,
}

impl AgentKind {
    pub const ALL: [AgentKind; 7] = [
        AgentKind::Database,
        AgentKind::Executor,
        AgentKind::Writer,
        AgentKind::Screening,
        AgentKind::ResearchManager,
        AgentKind::AiService,
        AgentKind::ApiGateway,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Database => "database",
            Self::Executor => "executor",
            Self::Writer => "writer",
            Self::Screening => "screening",
            Self::ResearchManager => "research_manager",
            Self::AiService => "ai_service",
            Self::ApiGateway => "api_gateway",
        }
    }
}

impl fmt::Display for AgentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == normalized)
            .ok_or_else(|| format!("unknown agent type '{s}'"))
    }
}

/// Optional service metadata advertised at registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInfo {
    pub host: String,
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_endpoint: Option<String>,
}

/// Identity of one connected worker. Fixed for the lifetime of the process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentIdentity {
    pub agent_id: String,
    pub agent_type: AgentKind,
    pub capabilities: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<ServiceInfo>,
}

impl AgentIdentity {
    /// Create an identity with a fresh id of the form `{type}_{8 hex chars}`.
    pub fn new(agent_type: AgentKind, capabilities: Vec<String>) -> Self {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        Self {
            agent_id: format!("{}_{}", agent_type.as_str(), &suffix[..8]),
            agent_type,
            capabilities,
            service: None,
        }
    }

    pub fn with_service(mut self, service: ServiceInfo) -> Self {
        self.service = Some(service);
        self
    }

    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.iter().any(|c| c == capability)
    }

    /// Payload of the `agent_register` message.
    pub fn registration_params(&self) -> RegistrationParams {
        RegistrationParams {
            agent_id: self.agent_id.clone(),
            agent_type: self.agent_type,
            capabilities: self.capabilities.clone(),
            service: self.service.clone(),
            protocol_version: PROTOCOL_VERSION.to_string(),
        }
    }
}
