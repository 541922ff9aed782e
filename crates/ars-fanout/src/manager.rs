//! Server-side fan-out bookkeeping.
//!
//! Both tables (`fanout_tasks` and the subtask -> parent index) live behind
//! one async mutex, so a create, a completion or a cancel is observed
//! atomically by every other caller. Splitting and aggregation are plain
//! synchronous calls made while the lock is held.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::Mutex;

use crate::aggregate::Aggregator;
use crate::error::FanoutError;
use crate::splitter::{split_default, Splitter};
use crate::task::{subtask_id, FanoutStatus, FanoutStrategy, FanoutTask, ParentTask, Subtask};

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

/// How a parent is split and reduced.
#[derive(Clone)]
pub struct FanoutOptions {
    pub parallelism: usize,
    pub strategy: FanoutStrategy,
    pub splitter: Option<Arc<dyn Splitter>>,
    pub aggregator: Option<Arc<dyn Aggregator>>,
}

impl FanoutOptions {
    pub fn new(parallelism: usize, strategy: FanoutStrategy) -> Self {
        Self {
            parallelism,
            strategy,
            splitter: None,
            aggregator: None,
        }
    }

    /// Use `splitter` instead of the built-in strategy.
    pub fn with_splitter(mut self, splitter: Arc<dyn Splitter>) -> Self {
        self.splitter = Some(splitter);
        self
    }

    pub fn with_aggregator(mut self, aggregator: Arc<dyn Aggregator>) -> Self {
        self.aggregator = Some(aggregator);
        self
    }
}

// ---------------------------------------------------------------------------
// Dispatch sink
// ---------------------------------------------------------------------------

/// Delivers subtasks to whichever agents will run them.
pub trait DispatchSink: Send + Sync {
    fn dispatch<'a>(
        &'a self,
        subtask: &'a Subtask,
    ) -> Pin<Box<dyn Future<Output = Result<(), FanoutError>> + Send + 'a>>;
}

/// Outcome of [`FanoutManager::create_and_dispatch`].
#[derive(Debug, Clone)]
pub struct DispatchReport {
    pub parent_task_id: String,
    pub dispatched: Vec<String>,
    pub undeliverable: Vec<String>,
    /// Set when every subtask failed to dispatch and the fan-out resolved
    /// immediately.
    pub aggregated_result: Option<Value>,
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

#[derive(Default)]
struct FanoutTables {
    fanout_tasks: HashMap<String, FanoutTask>,
    subtask_mapping: HashMap<String, String>,
}

impl FanoutTables {
    fn remove_parent(&mut self, parent_task_id: &str) -> Option<FanoutTask> {
        let task = self.fanout_tasks.remove(parent_task_id)?;
        for id in &task.subtask_ids {
            self.subtask_mapping.remove(id);
        }
        Some(task)
    }
}

#[derive(Default)]
pub struct FanoutManager {
    tables: Mutex<FanoutTables>,
}

impl FanoutManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Split `task` and register the fan-out. Returns the subtasks to
    /// dispatch, in index order.
    ///
    /// A parent id that is still open is rejected. A completed parent with
    /// the same id is replaced.
    pub async fn create_fanout_task(
        &self,
        task: ParentTask,
        options: FanoutOptions,
    ) -> Result<Vec<Subtask>, FanoutError> {
        if options.parallelism == 0 {
            return Err(FanoutError::InvalidParallelism);
        }
        if options.strategy == FanoutStrategy::Custom && options.splitter.is_none() {
            return Err(FanoutError::MissingSplitter);
        }

        let mut tables = self.tables.lock().await;
        if let Some(existing) = tables.fanout_tasks.get(&task.task_id) {
            if !existing.is_complete() {
                tracing::warn!(parent_task_id = %task.task_id, "Fan-out already open for parent");
                return Err(FanoutError::DuplicateParent(task.task_id));
            }
            tables.remove_parent(&task.task_id);
        }

        let payloads = match &options.splitter {
            Some(splitter) => splitter.split(&task, options.parallelism)?,
            None => split_default(&task, options.parallelism, options.strategy)?,
        };

        let subtasks: Vec<Subtask> = payloads
            .into_iter()
            .enumerate()
            .map(|(index, payload)| Subtask {
                subtask_id: subtask_id(&task.task_id, index),
                parent_task_id: task.task_id.clone(),
                action: task.action.clone(),
                index,
                payload,
                context_id: task.context_id.clone(),
            })
            .collect();
        let ids: Vec<String> = subtasks.iter().map(|s| s.subtask_id.clone()).collect();

        let mut record = FanoutTask::new(
            &task,
            options.strategy,
            options.parallelism,
            ids.clone(),
            options.aggregator,
        );
        if record.is_complete() {
            // A custom splitter produced nothing; resolve right away.
            record.finish();
        }

        for id in ids {
            tables.subtask_mapping.insert(id, task.task_id.clone());
        }
        tables.fanout_tasks.insert(task.task_id.clone(), record);

        tracing::info!(
            parent_task_id = %task.task_id,
            action = %task.action,
            strategy = %options.strategy,
            subtasks = subtasks.len(),
            "Fan-out created"
        );
        Ok(subtasks)
    }

    /// Record one subtask outcome.
    ///
    /// Returns the aggregate when this outcome completes the fan-out, and
    /// `None` otherwise (including for repeat reports of a resolved
    /// subtask). Unknown subtask ids are an error the caller may ignore.
    pub async fn complete_subtask(
        &self,
        subtask_id: &str,
        result: Value,
        success: bool,
    ) -> Result<Option<Value>, FanoutError> {
        let mut tables = self.tables.lock().await;
        let Some(parent_id) = tables.subtask_mapping.get(subtask_id).cloned() else {
            tracing::warn!(subtask_id = %subtask_id, "Completion for unknown subtask");
            return Err(FanoutError::UnknownSubtask(subtask_id.to_string()));
        };
        let Some(task) = tables.fanout_tasks.get_mut(&parent_id) else {
            tracing::warn!(subtask_id = %subtask_id, parent_task_id = %parent_id, "Subtask index points at a missing parent");
            return Err(FanoutError::UnknownSubtask(subtask_id.to_string()));
        };

        if !task.record(subtask_id, result, success) {
            tracing::debug!(subtask_id = %subtask_id, "Ignoring repeat completion");
            return Ok(None);
        }
        tracing::debug!(
            subtask_id = %subtask_id,
            parent_task_id = %parent_id,
            success,
            completed = task.completed,
            failed = task.failed,
            total = task.total(),
            "Subtask resolved"
        );

        if !task.is_complete() {
            return Ok(None);
        }
        let aggregate = task.finish();
        tracing::info!(
            parent_task_id = %parent_id,
            action = %task.action,
            success_rate = task.success_rate(),
            "Fan-out complete"
        );
        Ok(Some(aggregate))
    }

    /// Drop a fan-out and its index entries. Returns the cancelled subtask
    /// ids; an unknown parent yields an empty list. Agents already running a
    /// subtask are not told.
    pub async fn cancel_fanout_task(&self, parent_task_id: &str) -> Vec<String> {
        let removed = self.tables.lock().await.remove_parent(parent_task_id);
        match removed {
            Some(task) => {
                tracing::info!(
                    parent_task_id = %parent_task_id,
                    subtasks = task.subtask_ids.len(),
                    "Fan-out cancelled"
                );
                task.subtask_ids
            }
            None => Vec::new(),
        }
    }

    pub async fn fanout_status(&self, parent_task_id: &str) -> Option<FanoutStatus> {
        self.tables
            .lock()
            .await
            .fanout_tasks
            .get(parent_task_id)
            .map(FanoutStatus::from)
    }

    pub async fn parent_of(&self, subtask_id: &str) -> Option<String> {
        self.tables.lock().await.subtask_mapping.get(subtask_id).cloned()
    }

    pub async fn open_count(&self) -> usize {
        self.tables
            .lock()
            .await
            .fanout_tasks
            .values()
            .filter(|t| !t.is_complete())
            .count()
    }

    /// Drop a resolved fan-out once its aggregate has been handed on. An
    /// open or unknown parent is left alone and yields `false`.
    pub async fn release_completed(&self, parent_task_id: &str) -> bool {
        let mut tables = self.tables.lock().await;
        let resolved = tables
            .fanout_tasks
            .get(parent_task_id)
            .is_some_and(|t| t.is_complete());
        if resolved {
            tables.remove_parent(parent_task_id);
        }
        resolved
    }

    /// Remove every resolved fan-out. Returns how many were removed.
    pub async fn purge_completed(&self) -> usize {
        let mut tables = self.tables.lock().await;
        let done: Vec<String> = tables
            .fanout_tasks
            .values()
            .filter(|t| t.is_complete())
            .map(|t| t.parent_task_id.clone())
            .collect();
        for id in &done {
            tables.remove_parent(id);
        }
        done.len()
    }

    /// Create a fan-out and hand every subtask to `sink`. A subtask the sink
    /// cannot deliver is recorded as failed so the parent still resolves.
    pub async fn create_and_dispatch(
        &self,
        task: ParentTask,
        options: FanoutOptions,
        sink: &dyn DispatchSink,
    ) -> Result<DispatchReport, FanoutError> {
        let parent_task_id = task.task_id.clone();
        let subtasks = self.create_fanout_task(task, options).await?;

        let mut report = DispatchReport {
            parent_task_id,
            dispatched: Vec::new(),
            undeliverable: Vec::new(),
            aggregated_result: None,
        };
        for subtask in &subtasks {
            match sink.dispatch(subtask).await {
                Ok(()) => report.dispatched.push(subtask.subtask_id.clone()),
                Err(e) => {
                    tracing::warn!(subtask_id = %subtask.subtask_id, error = %e, "Subtask dispatch failed");
                    report.undeliverable.push(subtask.subtask_id.clone());
                    let failure = json!({"error": e.to_string()});
                    if let Ok(Some(aggregate)) =
                        self.complete_subtask(&subtask.subtask_id, failure, false).await
                    {
                        report.aggregated_result = Some(aggregate);
                    }
                }
            }
        }
        Ok(report)
    }
}
