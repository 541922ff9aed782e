use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use ars_fanout::{DispatchSink, FanoutError, Subtask};
use ars_protocol::{Message, ProtocolMethod, TaskRequestParams};

use crate::registry::AgentRegistry;

/// Sends each subtask as a `task_request` to the next registered agent whose
/// capabilities include the subtask's action.
pub struct AgentDispatcher {
    registry: Arc<AgentRegistry>,
}

impl AgentDispatcher {
    pub fn new(registry: Arc<AgentRegistry>) -> Self {
        Self { registry }
    }
}

impl DispatchSink for AgentDispatcher {
    fn dispatch<'a>(
        &'a self,
        subtask: &'a Subtask,
    ) -> Pin<Box<dyn Future<Output = Result<(), FanoutError>> + Send + 'a>> {
        Box::pin(async move {
            let failed = |reason: String| FanoutError::Dispatch {
                subtask_id: subtask.subtask_id.clone(),
                reason,
            };

            let agent = self
                .registry
                .next_for(&subtask.action)
                .await
                .ok_or_else(|| failed(format!("no agent with capability '{}'", subtask.action)))?;

            let request = TaskRequestParams {
                task_id: Some(subtask.subtask_id.clone()),
                task_type: Some(subtask.action.clone()),
                payload: subtask.payload.clone(),
                context_id: subtask.context_id.clone(),
            };
            let params = serde_json::to_value(&request).map_err(|e| failed(e.to_string()))?;
            let message = Message::notification(ProtocolMethod::TaskRequest.as_str(), params, agent.form);
            agent
                .send(&message)
                .await
                .map_err(|e| failed(e.to_string()))?;

            tracing::debug!(
                subtask_id = %subtask.subtask_id,
                agent_id = %agent.agent_id,
                action = %subtask.action,
                "Subtask dispatched"
            );
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::AgentHandle;
    use ars_protocol::{AgentKind, RegistrationParams, WireForm};
    use serde_json::json;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_dispatch_sends_task_request_to_capable_agent() {
        let registry = Arc::new(AgentRegistry::new());
        let (tx, mut rx) = mpsc::channel(4);
        registry
            .register(
                RegistrationParams {
                    agent_id: "research_manager_1".into(),
                    agent_type: AgentKind::ResearchManager,
                    capabilities: vec!["search".into()],
                    service: None,
                    protocol_version: "1.0".into(),
                },
                1,
                AgentHandle::new("research_manager_1", WireForm::JsonRpc, tx),
            )
            .await;
        let dispatcher = AgentDispatcher::new(Arc::clone(&registry));

        let subtask = Subtask {
            subtask_id: "p_sub_1".into(),
            parent_task_id: "p".into(),
            action: "search".into(),
            index: 0,
            payload: json!({"queries": ["q"]}),
            context_id: Some("ctx".into()),
        };
        dispatcher.dispatch(&subtask).await.unwrap();

        let frame: serde_json::Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(frame["jsonrpc"], "2.0");
        assert_eq!(frame["method"], "task_request");
        assert_eq!(frame["params"]["task_id"], "p_sub_1");
        assert_eq!(frame["params"]["task_type"], "search");
        assert_eq!(frame["params"]["context_id"], "ctx");

        let orphan = Subtask {
            action: "grade".into(),
            ..subtask
        };
        assert!(matches!(
            dispatcher.dispatch(&orphan).await,
            Err(FanoutError::Dispatch { .. })
        ));
    }
}
