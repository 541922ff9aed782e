use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::aggregate::Aggregator;

/// How a parent payload is turned into subtask payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FanoutStrategy {
    /// Every subtask receives an identical copy of the payload.
    Broadcast,
    /// Every subtask receives its index and list-valued work is chunked.
    RoundRobin,
    /// Payloads come from a caller-supplied splitter.
    Custom,
}

impl FanoutStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Broadcast => "broadcast",
            Self::RoundRobin => "round_robin",
            Self::Custom => "custom",
        }
    }
}

impl fmt::Display for FanoutStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FanoutStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "broadcast" => Ok(Self::Broadcast),
            "round_robin" => Ok(Self::RoundRobin),
            "custom" => Ok(Self::Custom),
            other => Err(format!("unknown fan-out strategy '{other}'")),
        }
    }
}

/// The logical task being fanned out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParentTask {
    pub task_id: String,
    /// Task type handed to agents; also selects the reducer.
    #[serde(alias = "task_type")]
    pub action: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_id: Option<String>,
}

impl ParentTask {
    pub fn new(task_id: impl Into<String>, action: impl Into<String>, payload: Value) -> Self {
        Self {
            task_id: task_id.into(),
            action: action.into(),
            payload,
            context_id: None,
        }
    }

    pub fn with_context(mut self, context_id: impl Into<String>) -> Self {
        self.context_id = Some(context_id.into());
        self
    }
}

/// One unit of dispatchable work derived from a parent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subtask {
    pub subtask_id: String,
    pub parent_task_id: String,
    pub action: String,
    pub index: usize,
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_id: Option<String>,
}

/// `{parent}_sub_{i+1}` for a 0-based index.
pub fn subtask_id(parent_task_id: &str, index: usize) -> String {
    format!("{parent_task_id}_sub_{}", index + 1)
}

/// Tracking record for one fan-out.
#[derive(Clone)]
pub struct FanoutTask {
    pub parent_task_id: String,
    pub action: String,
    pub strategy: FanoutStrategy,
    pub parallelism: usize,
    pub subtask_ids: Vec<String>,
    /// Results of successful subtasks, keyed by subtask id.
    pub partial_results: HashMap<String, Value>,
    pub completed: usize,
    pub failed: usize,
    pub aggregated_result: Option<Value>,
    pub created_at: DateTime<Utc>,
    resolved: HashSet<String>,
    aggregator: Option<Arc<dyn Aggregator>>,
}

impl FanoutTask {
    pub(crate) fn new(
        parent: &ParentTask,
        strategy: FanoutStrategy,
        parallelism: usize,
        subtask_ids: Vec<String>,
        aggregator: Option<Arc<dyn Aggregator>>,
    ) -> Self {
        Self {
            parent_task_id: parent.task_id.clone(),
            action: parent.action.clone(),
            strategy,
            parallelism,
            subtask_ids,
            partial_results: HashMap::new(),
            completed: 0,
            failed: 0,
            aggregated_result: None,
            created_at: Utc::now(),
            resolved: HashSet::new(),
            aggregator,
        }
    }

    pub fn total(&self) -> usize {
        self.subtask_ids.len()
    }

    pub fn pending(&self) -> usize {
        self.total() - self.completed - self.failed
    }

    pub fn is_complete(&self) -> bool {
        self.completed + self.failed == self.total()
    }

    /// `completed / total`, or 0.0 with no subtasks.
    pub fn success_rate(&self) -> f64 {
        if self.subtask_ids.is_empty() {
            0.0
        } else {
            self.completed as f64 / self.subtask_ids.len() as f64
        }
    }

    pub fn is_resolved(&self, subtask_id: &str) -> bool {
        self.resolved.contains(subtask_id)
    }

    /// Successful partial results in subtask order.
    pub fn partials_in_order(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.subtask_ids.iter().filter_map(|id| {
            self.partial_results
                .get(id)
                .map(|result| (id.as_str(), result))
        })
    }

    /// Subtask ids that reported failure, in subtask order.
    pub fn failed_ids(&self) -> impl Iterator<Item = &str> {
        self.subtask_ids
            .iter()
            .filter(|id| self.resolved.contains(*id) && !self.partial_results.contains_key(*id))
            .map(String::as_str)
    }

    /// Record one outcome. Returns `false` when the subtask was already
    /// resolved, in which case nothing changes.
    pub(crate) fn record(&mut self, subtask_id: &str, result: Value, success: bool) -> bool {
        if !self.resolved.insert(subtask_id.to_string()) {
            return false;
        }
        if success {
            self.completed += 1;
            self.partial_results.insert(subtask_id.to_string(), result);
        } else {
            self.failed += 1;
        }
        true
    }

    /// Aggregate once. Later calls return the stored aggregate.
    pub(crate) fn finish(&mut self) -> Value {
        if let Some(existing) = &self.aggregated_result {
            return existing.clone();
        }
        let aggregate = match self.aggregator.clone() {
            Some(aggregator) => aggregator.aggregate(self),
            None => crate::aggregate::aggregate_by_action(self),
        };
        self.aggregated_result = Some(aggregate.clone());
        aggregate
    }
}

impl fmt::Debug for FanoutTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FanoutTask")
            .field("parent_task_id", &self.parent_task_id)
            .field("action", &self.action)
            .field("strategy", &self.strategy)
            .field("subtasks", &self.subtask_ids.len())
            .field("completed", &self.completed)
            .field("failed", &self.failed)
            .field("custom_aggregator", &self.aggregator.is_some())
            .finish()
    }
}

/// Point-in-time view of a fan-out, safe to hand out of the manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FanoutStatus {
    pub parent_task_id: String,
    pub action: String,
    pub strategy: FanoutStrategy,
    pub total_subtasks: usize,
    pub completed: usize,
    pub failed: usize,
    pub pending: usize,
    pub is_complete: bool,
    pub success_rate: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aggregated_result: Option<Value>,
    pub created_at: DateTime<Utc>,
}

impl From<&FanoutTask> for FanoutStatus {
    fn from(task: &FanoutTask) -> Self {
        Self {
            parent_task_id: task.parent_task_id.clone(),
            action: task.action.clone(),
            strategy: task.strategy,
            total_subtasks: task.total(),
            completed: task.completed,
            failed: task.failed,
            pending: task.pending(),
            is_complete: task.is_complete(),
            success_rate: task.success_rate(),
            aggregated_result: task.aggregated_result.clone(),
            created_at: task.created_at,
        }
    }
}
