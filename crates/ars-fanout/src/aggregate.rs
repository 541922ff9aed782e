//! Reducers that turn a complete fan-out's partial results into one answer.
//!
//! The reducer is chosen by the parent's action name; unknown actions fall
//! back to the default reducer. Every aggregate carries the same summary
//! fields (`parent_task_id`, `action`, `subtask_count`, `completed_subtasks`,
//! `failed_subtasks`, `success_rate`) next to its action-specific data.

use std::collections::BTreeSet;

use serde_json::{json, Map, Value};

use crate::task::FanoutTask;

/// Pluggable reducer. Called exactly once per fan-out, on completion.
pub trait Aggregator: Send + Sync {
    fn aggregate(&self, task: &FanoutTask) -> Value;
}

impl<F> Aggregator for F
where
    F: Fn(&FanoutTask) -> Value + Send + Sync,
{
    fn aggregate(&self, task: &FanoutTask) -> Value {
        self(task)
    }
}

pub fn aggregate_by_action(task: &FanoutTask) -> Value {
    let specific = match task.action.as_str() {
        "search" => aggregate_search(task),
        "analyze" => aggregate_analyze(task),
        "execute" => aggregate_execute(task),
        _ => aggregate_default(task),
    };
    with_summary(task, specific)
}

fn with_summary(task: &FanoutTask, specific: Map<String, Value>) -> Value {
    let mut out = Map::new();
    out.insert("parent_task_id".into(), json!(task.parent_task_id));
    out.insert("action".into(), json!(task.action));
    out.insert("subtask_count".into(), json!(task.total()));
    out.insert("completed_subtasks".into(), json!(task.completed));
    out.insert("failed_subtasks".into(), json!(task.failed));
    out.insert("success_rate".into(), json!(task.success_rate()));
    out.extend(specific);
    Value::Object(out)
}

fn number(value: &Value, field: &str) -> Option<f64> {
    value.get(field).and_then(Value::as_f64)
}

fn list<'a>(value: &'a Value, field: &str) -> &'a [Value] {
    value
        .get(field)
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[])
}

fn mean(values: impl Iterator<Item = f64>) -> f64 {
    let (sum, count) = values.fold((0.0, 0usize), |(s, c), v| (s + v, c + 1));
    if count == 0 {
        0.0
    } else {
        sum / count as f64
    }
}

fn aggregate_search(task: &FanoutTask) -> Map<String, Value> {
    let mut results: Vec<Value> = task
        .partials_in_order()
        .flat_map(|(_, partial)| list(partial, "results").iter().cloned())
        .collect();
    // Stable: equal relevance keeps subtask order.
    results.sort_by(|a, b| {
        let a = number(a, "relevance").unwrap_or(0.0);
        let b = number(b, "relevance").unwrap_or(0.0);
        b.total_cmp(&a)
    });

    let sources: BTreeSet<String> = task
        .partials_in_order()
        .flat_map(|(_, partial)| list(partial, "sources").iter())
        .filter_map(|s| s.as_str().map(str::to_string))
        .collect();

    let relevance_score = mean(
        task.partials_in_order()
            .filter_map(|(_, partial)| number(partial, "relevance_score")),
    );

    let mut out = Map::new();
    out.insert("total_results".into(), json!(results.len()));
    out.insert("results".into(), Value::Array(results));
    out.insert("sources".into(), json!(sources));
    out.insert("relevance_score".into(), json!(relevance_score));
    out
}

fn aggregate_analyze(task: &FanoutTask) -> Map<String, Value> {
    let concat = |field: &str| -> Vec<Value> {
        task.partials_in_order()
            .flat_map(|(_, partial)| list(partial, field).iter().cloned())
            .collect()
    };
    let confidence = mean(
        task.partials_in_order()
            .filter_map(|(_, partial)| number(partial, "confidence")),
    );

    let mut out = Map::new();
    out.insert("insights".into(), Value::Array(concat("insights")));
    out.insert("conclusions".into(), Value::Array(concat("conclusions")));
    out.insert("confidence".into(), json!(confidence));
    out
}

/// Executions are partitioned by each partial's `success` flag; a partial
/// without one counts as successful. Subtasks that failed outright have no
/// partial and are listed as failed with a `null` result.
fn aggregate_execute(task: &FanoutTask) -> Map<String, Value> {
    let mut successful = Vec::new();
    let mut failed = Vec::new();
    let mut outputs = Vec::new();

    for (subtask_id, partial) in task.partials_in_order() {
        let entry = json!({"subtask_id": subtask_id, "result": partial});
        if partial.get("success").and_then(Value::as_bool).unwrap_or(true) {
            if let Some(output) = partial.get("output") {
                outputs.push(output.clone());
            }
            successful.push(entry);
        } else {
            failed.push(entry);
        }
    }
    failed.extend(
        task.failed_ids()
            .map(|id| json!({"subtask_id": id, "result": Value::Null})),
    );

    let rate = if task.total() == 0 {
        0.0
    } else {
        successful.len() as f64 / task.total() as f64
    };

    let mut out = Map::new();
    out.insert("successful_count".into(), json!(successful.len()));
    out.insert("failed_count".into(), json!(failed.len()));
    out.insert("successful_executions".into(), Value::Array(successful));
    out.insert("failed_executions".into(), Value::Array(failed));
    out.insert("outputs".into(), Value::Array(outputs));
    out.insert("execution_success_rate".into(), json!(rate));
    out
}

/// Raw partial results keyed by subtask id.
fn aggregate_default(task: &FanoutTask) -> Map<String, Value> {
    let partials: Map<String, Value> = task
        .partials_in_order()
        .map(|(id, partial)| (id.to_string(), partial.clone()))
        .collect();
    let mut out = Map::new();
    out.insert("partial_results".into(), Value::Object(partials));
    out
}
