use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use ars_fanout::*;
use serde_json::{json, Value};
use tokio::sync::Mutex;

fn search_task(id: &str) -> ParentTask {
    let queries: Vec<String> = (0..10).map(|i| format!("query {i}")).collect();
    ParentTask::new(id, "search", json!({"queries": queries})).with_context("review-1")
}

#[tokio::test]
async fn test_round_robin_subtasks_reconstruct_queries() {
    let manager = FanoutManager::new();
    let subtasks = manager
        .create_fanout_task(search_task("lit"), FanoutOptions::new(3, FanoutStrategy::RoundRobin))
        .await
        .unwrap();

    let ids: Vec<&str> = subtasks.iter().map(|s| s.subtask_id.as_str()).collect();
    assert_eq!(ids, vec!["lit_sub_1", "lit_sub_2", "lit_sub_3"]);
    let sizes: Vec<usize> = subtasks
        .iter()
        .map(|s| s.payload["queries"].as_array().unwrap().len())
        .collect();
    assert_eq!(sizes, vec![3, 3, 4]);
    let rebuilt: Vec<Value> = subtasks
        .iter()
        .flat_map(|s| s.payload["queries"].as_array().unwrap().clone())
        .collect();
    assert_eq!(rebuilt, search_task("lit").payload["queries"].as_array().unwrap().clone());

    for s in &subtasks {
        assert_eq!(s.action, "search");
        assert_eq!(s.context_id.as_deref(), Some("review-1"));
        assert_eq!(manager.parent_of(&s.subtask_id).await.as_deref(), Some("lit"));
    }
}

#[tokio::test]
async fn test_duplicate_open_parent_is_rejected() {
    let manager = FanoutManager::new();
    let options = FanoutOptions::new(2, FanoutStrategy::Broadcast);
    manager
        .create_fanout_task(search_task("dup"), options.clone())
        .await
        .unwrap();
    let err = manager
        .create_fanout_task(search_task("dup"), options)
        .await
        .unwrap_err();
    assert!(matches!(err, FanoutError::DuplicateParent(ref id) if id == "dup"));
}

#[tokio::test]
async fn test_custom_strategy_requires_splitter() {
    let manager = FanoutManager::new();
    let err = manager
        .create_fanout_task(search_task("c"), FanoutOptions::new(2, FanoutStrategy::Custom))
        .await
        .unwrap_err();
    assert!(matches!(err, FanoutError::MissingSplitter));
}

#[tokio::test]
async fn test_custom_splitter_output_and_failure() {
    let manager = FanoutManager::new();
    let by_section = |task: &ParentTask, _parallelism: usize| -> Result<Vec<Value>, FanoutError> {
        let sections = task.payload["sections"]
            .as_array()
            .ok_or_else(|| FanoutError::Split("payload has no 'sections' list".into()))?;
        Ok(sections.iter().map(|s| json!({"section": s})).collect())
    };
    let options = FanoutOptions::new(2, FanoutStrategy::Custom).with_splitter(Arc::new(by_section));

    let manuscript = ParentTask::new("ms", "write", json!({"sections": ["intro", "methods", "results"]}));
    let subtasks = manager
        .create_fanout_task(manuscript, options.clone())
        .await
        .unwrap();
    let sections: Vec<&str> = subtasks
        .iter()
        .map(|s| s.payload["section"].as_str().unwrap())
        .collect();
    assert_eq!(sections, vec!["intro", "methods", "results"]);

    let err = manager
        .create_fanout_task(ParentTask::new("bad", "write", json!({})), options)
        .await
        .unwrap_err();
    assert!(matches!(err, FanoutError::Split(_)));
    assert!(manager.fanout_status("bad").await.is_none());
}

#[tokio::test]
async fn test_aggregation_runs_once_and_recompletion_is_ignored() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let aggregator = move |task: &FanoutTask| {
        counter.fetch_add(1, Ordering::SeqCst);
        json!({"completed": task.completed})
    };

    let manager = FanoutManager::new();
    manager
        .create_fanout_task(
            search_task("once"),
            FanoutOptions::new(2, FanoutStrategy::Broadcast).with_aggregator(Arc::new(aggregator)),
        )
        .await
        .unwrap();

    assert_eq!(manager.complete_subtask("once_sub_1", json!({}), true).await.unwrap(), None);
    let aggregate = manager
        .complete_subtask("once_sub_2", json!({}), true)
        .await
        .unwrap();
    assert_eq!(aggregate, Some(json!({"completed": 2})));

    // Repeat reports change nothing and never re-aggregate.
    assert_eq!(manager.complete_subtask("once_sub_2", json!({}), false).await.unwrap(), None);
    assert_eq!(manager.complete_subtask("once_sub_1", json!({}), true).await.unwrap(), None);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let status = manager.fanout_status("once").await.unwrap();
    assert_eq!(status.completed, 2);
    assert_eq!(status.failed, 0);
    assert_eq!(status.aggregated_result, Some(json!({"completed": 2})));
}

#[tokio::test]
async fn test_failures_never_abort_and_rate_reflects_them() {
    let manager = FanoutManager::new();
    manager
        .create_fanout_task(
            ParentTask::new("mix", "summarize", json!({})),
            FanoutOptions::new(4, FanoutStrategy::Broadcast),
        )
        .await
        .unwrap();

    assert!(manager.complete_subtask("mix_sub_3", json!({"error": "boom"}), false).await.unwrap().is_none());
    assert!(manager.complete_subtask("mix_sub_1", json!({"n": 1}), true).await.unwrap().is_none());
    assert!(manager.complete_subtask("mix_sub_2", json!({"n": 2}), true).await.unwrap().is_none());
    let aggregate = manager
        .complete_subtask("mix_sub_4", json!({"n": 4}), true)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(aggregate["success_rate"], 0.75);
    assert_eq!(aggregate["subtask_count"], 4);
    assert_eq!(
        aggregate["partial_results"],
        json!({"mix_sub_1": {"n": 1}, "mix_sub_2": {"n": 2}, "mix_sub_4": {"n": 4}})
    );
}

#[tokio::test]
async fn test_search_fanout_end_to_end() {
    let manager = FanoutManager::new();
    manager
        .create_fanout_task(search_task("s"), FanoutOptions::new(2, FanoutStrategy::RoundRobin))
        .await
        .unwrap();
    manager
        .complete_subtask("s_sub_1", json!({"results": [{"title": "A", "relevance": 0.3}]}), true)
        .await
        .unwrap();
    let aggregate = manager
        .complete_subtask("s_sub_2", json!({"results": [{"title": "B", "relevance": 0.8}]}), true)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(aggregate["results"][0]["title"], "B");
    assert_eq!(aggregate["results"][1]["title"], "A");
    assert_eq!(aggregate["total_results"], 2);
}

#[tokio::test]
async fn test_unknown_subtask_is_reported() {
    let manager = FanoutManager::new();
    let err = manager
        .complete_subtask("ghost_sub_1", json!({}), true)
        .await
        .unwrap_err();
    assert!(matches!(err, FanoutError::UnknownSubtask(_)));
}

#[tokio::test]
async fn test_cancel_removes_parent_and_index() {
    let manager = FanoutManager::new();
    manager
        .create_fanout_task(search_task("gone"), FanoutOptions::new(3, FanoutStrategy::Broadcast))
        .await
        .unwrap();

    let cancelled = manager.cancel_fanout_task("gone").await;
    assert_eq!(cancelled, vec!["gone_sub_1", "gone_sub_2", "gone_sub_3"]);
    assert!(manager.fanout_status("gone").await.is_none());
    assert!(manager.parent_of("gone_sub_2").await.is_none());
    assert!(manager.complete_subtask("gone_sub_1", json!({}), true).await.is_err());

    assert!(manager.cancel_fanout_task("gone").await.is_empty());
}

#[tokio::test]
async fn test_release_only_drops_resolved_fanouts() {
    let manager = FanoutManager::new();
    manager
        .create_fanout_task(search_task("rel"), FanoutOptions::new(2, FanoutStrategy::Broadcast))
        .await
        .unwrap();

    manager.complete_subtask("rel_sub_1", json!({}), true).await.unwrap();
    assert!(!manager.release_completed("rel").await);
    assert_eq!(manager.parent_of("rel_sub_2").await.as_deref(), Some("rel"));

    manager.complete_subtask("rel_sub_2", json!({}), false).await.unwrap();
    assert!(manager.release_completed("rel").await);
    assert!(manager.fanout_status("rel").await.is_none());
    assert!(manager.parent_of("rel_sub_1").await.is_none());
    assert!(!manager.release_completed("rel").await);
}

#[tokio::test]
async fn test_purge_completed_keeps_open_fanouts() {
    let manager = FanoutManager::new();
    let options = FanoutOptions::new(1, FanoutStrategy::Broadcast);
    manager.create_fanout_task(search_task("a"), options.clone()).await.unwrap();
    manager.create_fanout_task(search_task("b"), options).await.unwrap();
    manager.complete_subtask("a_sub_1", json!({}), true).await.unwrap();

    assert_eq!(manager.open_count().await, 1);
    assert_eq!(manager.purge_completed().await, 1);
    assert!(manager.fanout_status("a").await.is_none());
    assert!(manager.fanout_status("b").await.is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_completions_aggregate_exactly_once() {
    let manager = Arc::new(FanoutManager::new());
    manager
        .create_fanout_task(
            ParentTask::new("par", "analyze", json!({})),
            FanoutOptions::new(32, FanoutStrategy::Broadcast),
        )
        .await
        .unwrap();

    let mut handles = Vec::new();
    for i in 0..32 {
        for _ in 0..2 {
            let manager = Arc::clone(&manager);
            handles.push(tokio::spawn(async move {
                manager
                    .complete_subtask(&subtask_id("par", i), json!({"insights": [i]}), true)
                    .await
                    .unwrap()
            }));
        }
    }

    let mut aggregates = 0;
    for handle in handles {
        if handle.await.unwrap().is_some() {
            aggregates += 1;
        }
    }
    assert_eq!(aggregates, 1);
    let status = manager.fanout_status("par").await.unwrap();
    assert_eq!(status.completed, 32);
    assert_eq!(
        status.aggregated_result.unwrap()["insights"].as_array().unwrap().len(),
        32
    );
}

/// Records deliveries and refuses the ids it is told to.
struct RecordingSink {
    refuse: Vec<String>,
    delivered: Mutex<Vec<String>>,
}

impl DispatchSink for RecordingSink {
    fn dispatch<'a>(
        &'a self,
        subtask: &'a Subtask,
    ) -> Pin<Box<dyn Future<Output = Result<(), FanoutError>> + Send + 'a>> {
        Box::pin(async move {
            if self.refuse.contains(&subtask.subtask_id) {
                return Err(FanoutError::Dispatch {
                    subtask_id: subtask.subtask_id.clone(),
                    reason: "no agent with capability".into(),
                });
            }
            self.delivered.lock().await.push(subtask.subtask_id.clone());
            Ok(())
        })
    }
}

#[tokio::test]
async fn test_create_and_dispatch_marks_undeliverable_subtasks_failed() {
    let manager = FanoutManager::new();
    let sink = RecordingSink {
        refuse: vec!["job_sub_2".into()],
        delivered: Mutex::new(Vec::new()),
    };

    let report = manager
        .create_and_dispatch(
            ParentTask::new("job", "execute", json!({"cmd": "make"})),
            FanoutOptions::new(3, FanoutStrategy::Broadcast),
            &sink,
        )
        .await
        .unwrap();

    assert_eq!(report.dispatched, vec!["job_sub_1", "job_sub_3"]);
    assert_eq!(report.undeliverable, vec!["job_sub_2"]);
    assert!(report.aggregated_result.is_none());
    assert_eq!(*sink.delivered.lock().await, vec!["job_sub_1", "job_sub_3"]);

    let status = manager.fanout_status("job").await.unwrap();
    assert_eq!(status.failed, 1);
    assert_eq!(status.pending, 2);
}

#[tokio::test]
async fn test_create_and_dispatch_with_nothing_deliverable_resolves() {
    let manager = FanoutManager::new();
    let sink = RecordingSink {
        refuse: vec!["solo_sub_1".into()],
        delivered: Mutex::new(Vec::new()),
    };
    let report = manager
        .create_and_dispatch(
            ParentTask::new("solo", "execute", json!({})),
            FanoutOptions::new(1, FanoutStrategy::Broadcast),
            &sink,
        )
        .await
        .unwrap();
    let aggregate = report.aggregated_result.unwrap();
    assert_eq!(aggregate["success_rate"], 0.0);
    assert_eq!(
        aggregate["failed_executions"],
        json!([{"subtask_id": "solo_sub_1", "result": null}])
    );
}
