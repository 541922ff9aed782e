//! Agent-side task execution engine.
//!
//! Lifecycle of a dispatched task:
//!
//! ```text
//! DISPATCHED -> RUNNING -> COMPLETED | FAILED | TIMED_OUT
//! ```
//!
//! Dispatches with missing identifiers or an unregistered task type are
//! answered immediately and never enter RUNNING. Running tasks are tracked in
//! an active-task table; every terminal branch removes the entry exactly once
//! and only the branch that removes it reports a result.
//!
//! The timeout sweep reports a task as timed out but does not cancel its
//! handler. A handler that outlives its timeout keeps running and its late
//! output is discarded.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use ars_protocol::{
    ProtocolMethod, TaskFailure, TaskRequestParams, TaskResultParams, INVALID_PARAMS,
};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;

use crate::error::TaskError;
use crate::outbox::Outbox;

// ---------------------------------------------------------------------------
// Task handlers
// ---------------------------------------------------------------------------

/// Business logic plugged into the engine under a task-type name.
pub trait TaskHandler: Send + Sync {
    fn handle(&self, payload: Value)
        -> Pin<Box<dyn Future<Output = Result<Value, TaskError>> + Send + '_>>;
}

struct FnHandler<F>(F);

impl<F, Fut> TaskHandler for FnHandler<F>
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, TaskError>> + Send + 'static,
{
    fn handle(
        &self,
        payload: Value,
    ) -> Pin<Box<dyn Future<Output = Result<Value, TaskError>> + Send + '_>> {
        Box::pin((self.0)(payload))
    }
}

/// Wrap an async closure over raw JSON payloads.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn TaskHandler>
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, TaskError>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// Wrap an async closure over typed payloads. A payload that does not
/// deserialize into `P` fails the task with an invalid-params error.
pub fn typed_handler<P, R, F, Fut>(f: F) -> Arc<dyn TaskHandler>
where
    P: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    F: Fn(P) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, TaskError>> + Send + 'static,
{
    handler_fn(move |payload: Value| {
        let call = serde_json::from_value::<P>(payload).map(|params| f(params));
        async move {
            let output = call.map_err(TaskError::from)?.await?;
            serde_json::to_value(output)
                .map_err(|e| TaskError::new(format!("failed to serialize task output: {e}")))
        }
    })
}

// ---------------------------------------------------------------------------
// Active tasks
// ---------------------------------------------------------------------------

/// Work currently executing on this agent.
#[derive(Debug, Clone)]
pub struct ActiveTask {
    pub task_id: String,
    pub task_type: String,
    pub payload: Value,
    pub context_id: Option<String>,
    pub created_at: DateTime<Utc>,
    started: Instant,
}

impl ActiveTask {
    pub fn age(&self) -> Duration {
        self.started.elapsed()
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct TaskExecutor {
    agent_id: String,
    handlers: RwLock<HashMap<String, Arc<dyn TaskHandler>>>,
    active: Mutex<HashMap<String, ActiveTask>>,
    task_timeout: Duration,
}

impl TaskExecutor {
    pub fn new(agent_id: impl Into<String>, task_timeout: Duration) -> Self {
        Self {
            agent_id: agent_id.into(),
            handlers: RwLock::new(HashMap::new()),
            active: Mutex::new(HashMap::new()),
            task_timeout,
        }
    }

    pub async fn register_handler(&self, task_type: &str, handler: Arc<dyn TaskHandler>) {
        tracing::debug!(task_type = %task_type, "Registered task handler");
        self.handlers
            .write()
            .await
            .insert(task_type.to_string(), handler);
    }

    pub async fn registered_task_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.handlers.read().await.keys().cloned().collect();
        types.sort();
        types
    }

    pub async fn active_count(&self) -> usize {
        self.active.lock().await.len()
    }

    pub async fn active_tasks(&self) -> Vec<ActiveTask> {
        self.active.lock().await.values().cloned().collect()
    }

    pub fn task_timeout(&self) -> Duration {
        self.task_timeout
    }

    /// Run one dispatched task to a terminal state.
    ///
    /// Returns the `task_result` to report, or `None` when the task was
    /// already reported as timed out by the sweep.
    pub async fn execute(&self, request: TaskRequestParams) -> Option<TaskResultParams> {
        let context_id = request.context_id.clone();

        let Some(task_id) = request.task_id.filter(|id| !id.is_empty()) else {
            tracing::warn!("Rejecting task dispatch without task_id");
            return Some(
                TaskResultParams::failed(
                    None,
                    self.agent_id.clone(),
                    failure(INVALID_PARAMS, "task_request is missing 'task_id'"),
                )
                .with_context(context_id),
            );
        };
        let Some(task_type) = request.task_type.filter(|t| !t.is_empty()) else {
            tracing::warn!(task_id = %task_id, "Rejecting task dispatch without task_type");
            return Some(
                TaskResultParams::failed(
                    Some(task_id),
                    self.agent_id.clone(),
                    failure(INVALID_PARAMS, "task_request is missing 'task_type'"),
                )
                .with_context(context_id),
            );
        };

        let handler = self.handlers.read().await.get(&task_type).cloned();
        let Some(handler) = handler else {
            let registered = self.registered_task_types().await;
            tracing::warn!(
                task_id = %task_id,
                task_type = %task_type,
                registered = ?registered,
                "No handler for task type"
            );
            return Some(
                TaskResultParams::unknown_task_type(
                    task_id,
                    self.agent_id.clone(),
                    &task_type,
                    registered,
                )
                .with_context(context_id),
            );
        };

        {
            let mut active = self.active.lock().await;
            if active.contains_key(&task_id) {
                tracing::warn!(task_id = %task_id, "Rejecting duplicate dispatch of an active task");
                return Some(
                    TaskResultParams::failed(
                        Some(task_id.clone()),
                        self.agent_id.clone(),
                        failure(INVALID_PARAMS, format!("task '{task_id}' is already running")),
                    )
                    .with_context(context_id),
                );
            }
            active.insert(
                task_id.clone(),
                ActiveTask {
                    task_id: task_id.clone(),
                    task_type: task_type.clone(),
                    payload: request.payload.clone(),
                    context_id: context_id.clone(),
                    created_at: Utc::now(),
                    started: Instant::now(),
                },
            );
        }

        tracing::info!(task_id = %task_id, task_type = %task_type, "Task started");
        let started = Instant::now();

        // Run on its own task so a panicking handler still reaches cleanup.
        let payload = request.payload;
        let outcome = tokio::spawn(async move { handler.handle(payload).await })
            .await
            .unwrap_or_else(|e| Err(TaskError::new(format!("task handler panicked: {e}"))));

        if self.active.lock().await.remove(&task_id).is_none() {
            tracing::warn!(
                task_id = %task_id,
                task_type = %task_type,
                "Task finished after it was reported as timed out; discarding result"
            );
            return None;
        }

        let elapsed_ms = started.elapsed().as_millis() as u64;
        let result = match outcome {
            Ok(output) => {
                tracing::info!(task_id = %task_id, task_type = %task_type, elapsed_ms, "Task completed");
                TaskResultParams::completed(task_id, self.agent_id.clone(), output)
            }
            Err(e) => {
                tracing::warn!(task_id = %task_id, task_type = %task_type, elapsed_ms, error = %e, "Task failed");
                TaskResultParams::failed(
                    Some(task_id),
                    self.agent_id.clone(),
                    failure(e.code, e.message),
                )
            }
        };
        Some(result.with_context(context_id))
    }

    /// Execute in the background and report the outcome through `outbox`.
    pub fn spawn_execution(self: &Arc<Self>, request: TaskRequestParams, outbox: Outbox) {
        let executor = Arc::clone(self);
        tokio::spawn(async move {
            if let Some(result) = executor.execute(request).await {
                report(&outbox, &result).await;
            }
        });
    }

    /// Remove every active task older than the task timeout and build a
    /// `timeout` result for each.
    pub async fn sweep_expired(&self) -> Vec<TaskResultParams> {
        let mut active = self.active.lock().await;
        let expired: Vec<String> = active
            .values()
            .filter(|task| task.age() > self.task_timeout)
            .map(|task| task.task_id.clone())
            .collect();

        expired
            .into_iter()
            .filter_map(|id| active.remove(&id))
            .map(|task| {
                tracing::warn!(
                    task_id = %task.task_id,
                    task_type = %task.task_type,
                    age_secs = task.age().as_secs(),
                    "Task timed out"
                );
                TaskResultParams::timed_out(
                    task.task_id,
                    self.agent_id.clone(),
                    self.task_timeout.as_secs(),
                )
                .with_context(task.context_id)
            })
            .collect()
    }

    /// Periodic timeout sweep. Runs until aborted.
    pub async fn run_sweep_loop(self: Arc<Self>, outbox: Outbox, every: Duration) {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            for result in self.sweep_expired().await {
                report(&outbox, &result).await;
            }
        }
    }
}

fn failure(code: i32, message: impl Into<String>) -> TaskFailure {
    TaskFailure {
        code,
        message: message.into(),
        data: None,
    }
}

pub(crate) async fn report(outbox: &Outbox, result: &TaskResultParams) {
    let method = ProtocolMethod::TaskResult.as_str();
    if let Err(e) = outbox.notify(method, result).await {
        tracing::error!(
            task_id = result.task_id.as_deref().unwrap_or("<none>"),
            status = ?result.status,
            error = %e,
            "Failed to report task result"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ars_protocol::{Message, TaskStatus, WireForm, INTERNAL_ERROR, METHOD_NOT_FOUND};
    use serde::Deserialize;
    use serde_json::json;
    use tokio::sync::mpsc;

    async fn executor_with_echo() -> Arc<TaskExecutor> {
        let executor = Arc::new(TaskExecutor::new("executor_test", Duration::from_secs(3600)));
        executor
            .register_handler("echo", handler_fn(|payload| async move { Ok(payload) }))
            .await;
        executor
    }

    #[tokio::test]
    async fn test_success_reports_handler_output() {
        let executor = executor_with_echo().await;
        let result = executor
            .execute(TaskRequestParams::new("t1", "echo", json!({"x": 1})).with_context("ctx"))
            .await
            .unwrap();
        assert_eq!(result.status, TaskStatus::Completed);
        assert_eq!(result.result, Some(json!({"x": 1})));
        assert_eq!(result.context_id.as_deref(), Some("ctx"));
        assert_eq!(executor.active_count().await, 0);
    }

    #[tokio::test]
    async fn test_handler_error_reports_message() {
        let executor = executor_with_echo().await;
        executor
            .register_handler(
                "fail",
                handler_fn(|_| async move { Err(TaskError::new("database unreachable")) }),
            )
            .await;
        let result = executor
            .execute(TaskRequestParams::new("t2", "fail", json!({})))
            .await
            .unwrap();
        assert_eq!(result.status, TaskStatus::Error);
        let err = result.error.unwrap();
        assert_eq!(err.message, "database unreachable");
        assert_eq!(err.code, INTERNAL_ERROR);
        assert_eq!(executor.active_count().await, 0);
    }

    #[tokio::test]
    async fn test_unknown_task_type_lists_registered_types() {
        let executor = executor_with_echo().await;
        let result = executor
            .execute(TaskRequestParams::new("t3", "translate", json!({})))
            .await
            .unwrap();
        assert_eq!(result.status, TaskStatus::Error);
        let err = result.error.unwrap();
        assert_eq!(err.code, METHOD_NOT_FOUND);
        assert_eq!(err.data.unwrap()["registered_task_types"], json!(["echo"]));
        assert_eq!(executor.active_count().await, 0);
    }

    #[tokio::test]
    async fn test_missing_identifiers_never_run() {
        let executor = executor_with_echo().await;

        let no_id = executor
            .execute(TaskRequestParams {
                task_type: Some("echo".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(no_id.status, TaskStatus::Error);
        assert!(no_id.task_id.is_none());
        assert!(no_id.error.unwrap().message.contains("task_id"));

        let no_type = executor
            .execute(TaskRequestParams {
                task_id: Some("t4".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(no_type.task_id.as_deref(), Some("t4"));
        assert!(no_type.error.unwrap().message.contains("task_type"));
        assert_eq!(executor.active_count().await, 0);
    }

    #[tokio::test]
    async fn test_panicking_handler_is_cleaned_up() {
        let executor = executor_with_echo().await;
        executor
            .register_handler(
                "panic",
                handler_fn(|_| async move {
                    if true {
                        panic!("handler bug");
                    }
                    Ok(Value::Null)
                }),
            )
            .await;
        let result = executor
            .execute(TaskRequestParams::new("t5", "panic", json!({})))
            .await
            .unwrap();
        assert_eq!(result.status, TaskStatus::Error);
        assert!(result.error.unwrap().message.contains("panicked"));
        assert_eq!(executor.active_count().await, 0);
    }

    #[derive(Deserialize)]
    struct SumParams {
        values: Vec<i64>,
    }

    #[tokio::test]
    async fn test_typed_handler_round_trip_and_bad_payload() {
        let executor = Arc::new(TaskExecutor::new("a", Duration::from_secs(60)));
        executor
            .register_handler(
                "sum",
                typed_handler(|p: SumParams| async move {
                    Ok::<_, TaskError>(json!({"total": p.values.iter().sum::<i64>()}))
                }),
            )
            .await;

        let ok = executor
            .execute(TaskRequestParams::new("s1", "sum", json!({"values": [1, 2, 3]})))
            .await
            .unwrap();
        assert_eq!(ok.result.unwrap()["total"], 6);

        let bad = executor
            .execute(TaskRequestParams::new("s2", "sum", json!({"values": "nope"})))
            .await
            .unwrap();
        assert_eq!(bad.error.unwrap().code, INVALID_PARAMS);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_times_out_stuck_task_and_discards_late_result() {
        let executor = Arc::new(TaskExecutor::new("a", Duration::from_secs(10)));
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let release_rx = Arc::new(Mutex::new(Some(release_rx)));
        executor
            .register_handler(
                "stuck",
                handler_fn(move |_| {
                    let release_rx = Arc::clone(&release_rx);
                    async move {
                        let rx = release_rx.lock().await.take();
                        if let Some(rx) = rx {
                            let _ = rx.await;
                        }
                        Ok(json!("late"))
                    }
                }),
            )
            .await;

        let running = {
            let executor = Arc::clone(&executor);
            tokio::spawn(async move {
                executor
                    .execute(TaskRequestParams::new("slow", "stuck", json!({})))
                    .await
            })
        };

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(executor.active_count().await, 1);
        assert!(executor.sweep_expired().await.is_empty());

        tokio::time::sleep(Duration::from_secs(6)).await;
        let expired = executor.sweep_expired().await;
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].status, TaskStatus::Timeout);
        assert_eq!(expired[0].task_id.as_deref(), Some("slow"));
        assert_eq!(executor.active_count().await, 0);

        release_tx.send(()).unwrap();
        assert!(running.await.unwrap().is_none(), "late result must be discarded");
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_loop_reports_timeouts_on_the_wire() {
        let executor = Arc::new(TaskExecutor::new("a", Duration::from_secs(2)));
        executor
            .register_handler(
                "forever",
                handler_fn(|_| async move {
                    std::future::pending::<()>().await;
                    Ok(Value::Null)
                }),
            )
            .await;

        let outbox = Outbox::new(WireForm::Tagged);
        let (tx, mut rx) = mpsc::channel(8);
        outbox.attach(tx).await;

        executor.spawn_execution(TaskRequestParams::new("f1", "forever", json!({})), outbox.clone());
        let sweeper = tokio::spawn(Arc::clone(&executor).run_sweep_loop(outbox, Duration::from_secs(1)));

        let frame = rx.recv().await.unwrap();
        let msg = Message::decode(&frame).unwrap();
        assert_eq!(msg.method(), Some("task_result"));
        let params = msg.params().unwrap();
        assert_eq!(params["status"], "timeout");
        assert_eq!(params["task_id"], "f1");
        assert_eq!(executor.active_count().await, 0);
        sweeper.abort();
    }
}
