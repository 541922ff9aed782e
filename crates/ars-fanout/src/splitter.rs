//! Parent payload -> subtask payloads.

use serde_json::{Map, Value};

use crate::error::FanoutError;
use crate::task::{FanoutStrategy, ParentTask};

/// Fields partitioned across subtasks by the round-robin strategy, in
/// priority order. Only the first list-valued one is chunked.
pub const CHUNKED_FIELDS: [&str; 2] = ["queries", "data_chunks"];

/// Produces one payload per subtask.
pub trait Splitter: Send + Sync {
    fn split(&self, task: &ParentTask, parallelism: usize) -> Result<Vec<Value>, FanoutError>;
}

impl<F> Splitter for F
where
    F: Fn(&ParentTask, usize) -> Result<Vec<Value>, FanoutError> + Send + Sync,
{
    fn split(&self, task: &ParentTask, parallelism: usize) -> Result<Vec<Value>, FanoutError> {
        self(task, parallelism)
    }
}

/// The built-in broadcast and round-robin strategies.
pub fn split_default(
    task: &ParentTask,
    parallelism: usize,
    strategy: FanoutStrategy,
) -> Result<Vec<Value>, FanoutError> {
    match strategy {
        FanoutStrategy::Broadcast => Ok(vec![task.payload.clone(); parallelism]),
        FanoutStrategy::RoundRobin => Ok(split_round_robin(&task.payload, parallelism)),
        FanoutStrategy::Custom => Err(FanoutError::MissingSplitter),
    }
}

fn split_round_robin(payload: &Value, parallelism: usize) -> Vec<Value> {
    let base = match payload {
        Value::Object(map) => map.clone(),
        Value::Null => Map::new(),
        other => {
            let mut map = Map::new();
            map.insert("payload".to_string(), other.clone());
            map
        }
    };
    let chunked = CHUNKED_FIELDS
        .iter()
        .find_map(|field| match base.get(*field) {
            Some(Value::Array(items)) => Some((*field, chunk(items, parallelism))),
            _ => None,
        });

    (0..parallelism)
        .map(|index| {
            let mut map = base.clone();
            if let Some((field, chunks)) = &chunked {
                map.insert(field.to_string(), Value::Array(chunks[index].clone()));
            }
            map.insert("subtask_index".to_string(), Value::from(index));
            map.insert("total_subtasks".to_string(), Value::from(parallelism));
            Value::Object(map)
        })
        .collect()
}

/// Contiguous partition into exactly `parts` chunks. Each chunk holds
/// `max(1, len / parts)` items and the last one absorbs the remainder, so
/// trailing chunks may be empty when there are fewer items than parts.
pub fn chunk<T: Clone>(items: &[T], parts: usize) -> Vec<Vec<T>> {
    if parts == 0 {
        return Vec::new();
    }
    let len = items.len();
    let size = (len / parts).max(1);
    (0..parts)
        .map(|i| {
            let start = (i * size).min(len);
            let end = if i + 1 == parts {
                len
            } else {
                ((i + 1) * size).min(len)
            };
            items[start..end].to_vec()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_ten_queries_over_three_parts() {
        let queries: Vec<Value> = (0..10).map(|i| json!(format!("q{i}"))).collect();
        let task = ParentTask::new("p", "search", json!({"queries": queries, "limit": 5}));
        let payloads = split_default(&task, 3, FanoutStrategy::RoundRobin).unwrap();

        let sizes: Vec<usize> = payloads
            .iter()
            .map(|p| p["queries"].as_array().unwrap().len())
            .collect();
        assert_eq!(sizes, vec![3, 3, 4]);

        let rebuilt: Vec<Value> = payloads
            .iter()
            .flat_map(|p| p["queries"].as_array().unwrap().clone())
            .collect();
        assert_eq!(rebuilt, queries);

        for (i, p) in payloads.iter().enumerate() {
            assert_eq!(p["subtask_index"], i);
            assert_eq!(p["total_subtasks"], 3);
            assert_eq!(p["limit"], 5);
        }
    }

    #[test]
    fn test_queries_take_priority_over_data_chunks() {
        let task = ParentTask::new(
            "p",
            "analyze",
            json!({"queries": ["a", "b"], "data_chunks": [1, 2, 3, 4]}),
        );
        let payloads = split_default(&task, 2, FanoutStrategy::RoundRobin).unwrap();
        assert_eq!(payloads[0]["queries"], json!(["a"]));
        assert_eq!(payloads[0]["data_chunks"], json!([1, 2, 3, 4]));
    }

    #[test]
    fn test_data_chunks_used_when_queries_not_a_list() {
        let task = ParentTask::new("p", "analyze", json!({"queries": "x", "data_chunks": [1, 2, 3]}));
        let payloads = split_default(&task, 2, FanoutStrategy::RoundRobin).unwrap();
        assert_eq!(payloads[0]["data_chunks"], json!([1]));
        assert_eq!(payloads[1]["data_chunks"], json!([2, 3]));
    }

    #[test]
    fn test_fewer_items_than_parts_leaves_empty_tail() {
        assert_eq!(chunk(&[1, 2], 3), vec![vec![1], vec![2], vec![]]);
        assert_eq!(chunk::<i32>(&[], 2), vec![Vec::<i32>::new(), vec![]]);
    }

    #[test]
    fn test_broadcast_copies_payload() {
        let task = ParentTask::new("p", "execute", json!({"script": "run.sh"}));
        let payloads = split_default(&task, 3, FanoutStrategy::Broadcast).unwrap();
        assert_eq!(payloads.len(), 3);
        assert!(payloads.iter().all(|p| p == &json!({"script": "run.sh"})));
    }

    #[test]
    fn test_scalar_payload_is_wrapped_for_round_robin() {
        let task = ParentTask::new("p", "execute", json!("raw"));
        let payloads = split_default(&task, 2, FanoutStrategy::RoundRobin).unwrap();
        assert_eq!(payloads[1], json!({"payload": "raw", "subtask_index": 1, "total_subtasks": 2}));
    }

    #[test]
    fn test_custom_without_splitter_is_rejected() {
        let task = ParentTask::new("p", "x", json!({}));
        assert!(matches!(
            split_default(&task, 2, FanoutStrategy::Custom),
            Err(FanoutError::MissingSplitter)
        ));
    }

    #[test]
    fn test_closure_splitter() {
        let splitter = |task: &ParentTask, n: usize| -> Result<Vec<Value>, FanoutError> {
            Ok((0..n).map(|i| json!({"shard": i, "of": task.task_id})).collect())
        };
        let task = ParentTask::new("p", "x", json!({}));
        let payloads = splitter.split(&task, 2).unwrap();
        assert_eq!(payloads[1], json!({"shard": 1, "of": "p"}));
    }
}
