use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::constants::{INTERNAL_ERROR, METHOD_NOT_FOUND};
use crate::identity::{AgentKind, ServiceInfo};

// ── Agent lifecycle payloads ──

/// Sent by an agent right after the transport comes up.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistrationParams {
    pub agent_id: String,
    pub agent_type: AgentKind,
    pub capabilities: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<ServiceInfo>,
    #[serde(default)]
    pub protocol_version: String,
}

/// Server acknowledgement of a registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrationConfirmedParams {
    pub agent_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnregisterParams {
    pub agent_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Liveness notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatParams {
    pub agent_id: String,
    #[serde(default)]
    pub active_tasks: usize,
}

/// Reply to `status_request`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusReport {
    pub agent_id: String,
    pub agent_type: AgentKind,
    pub capabilities: Vec<String>,
    pub task_types: Vec<String>,
    pub active_tasks: usize,
    pub connection: String,
    pub uptime_secs: i64,
}

// ── Task dispatch payloads ──

/// A `task_request` message. Identifier fields are optional on the wire so a
/// malformed dispatch can still be answered with an explanatory error.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskRequestParams {
    #[serde(default)]
    pub task_id: Option<String>,
    #[serde(default)]
    pub task_type: Option<String>,
    #[serde(default)]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_id: Option<String>,
}

impl TaskRequestParams {
    pub fn new(task_id: impl Into<String>, task_type: impl Into<String>, payload: Value) -> Self {
        Self {
            task_id: Some(task_id.into()),
            task_type: Some(task_type.into()),
            payload,
            context_id: None,
        }
    }

    pub fn with_context(mut self, context_id: impl Into<String>) -> Self {
        self.context_id = Some(context_id.into());
        self
    }
}

/// Terminal status reported in a `task_result`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Completed,
    Error,
    Timeout,
}

/// Structured failure carried by an error or timeout result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskFailure {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// A `task_result` message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResultParams {
    pub task_id: Option<String>,
    pub agent_id: String,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskFailure>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_id: Option<String>,
    #[serde(default = "Utc::now")]
    pub completed_at: DateTime<Utc>,
}

impl TaskResultParams {
    pub fn completed(task_id: String, agent_id: String, result: Value) -> Self {
        Self {
            task_id: Some(task_id),
            agent_id,
            status: TaskStatus::Completed,
            result: Some(result),
            error: None,
            context_id: None,
            completed_at: Utc::now(),
        }
    }

    pub fn failed(task_id: Option<String>, agent_id: String, failure: TaskFailure) -> Self {
        Self {
            task_id,
            agent_id,
            status: TaskStatus::Error,
            result: None,
            error: Some(failure),
            context_id: None,
            completed_at: Utc::now(),
        }
    }

    pub fn timed_out(task_id: String, agent_id: String, timeout_secs: u64) -> Self {
        Self {
            task_id: Some(task_id),
            agent_id,
            status: TaskStatus::Timeout,
            result: None,
            error: Some(TaskFailure {
                code: INTERNAL_ERROR,
                message: format!("task exceeded timeout of {timeout_secs}s"),
                data: None,
            }),
            context_id: None,
            completed_at: Utc::now(),
        }
    }

    /// Error result for a task type no handler is registered for.
    pub fn unknown_task_type(
        task_id: String,
        agent_id: String,
        task_type: &str,
        registered: Vec<String>,
    ) -> Self {
        Self::failed(
            Some(task_id),
            agent_id,
            TaskFailure {
                code: METHOD_NOT_FOUND,
                message: format!("Unknown task type: {task_type}"),
                data: Some(serde_json::json!({ "registered_task_types": registered })),
            },
        )
    }

    pub fn with_context(mut self, context_id: Option<String>) -> Self {
        self.context_id = context_id;
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == TaskStatus::Completed
    }
}
