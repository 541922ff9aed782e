//! Connected agents and capability lookup.

use std::collections::HashMap;
use std::time::Duration;

use ars_protocol::{AgentKind, Message, RegistrationParams, WireForm};
use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, Mutex, RwLock};

use crate::error::CoordinatorError;

/// Handle for sending to one agent's connection.
#[derive(Debug, Clone)]
pub struct AgentHandle {
    pub agent_id: String,
    pub form: WireForm,
    outbound: mpsc::Sender<String>,
}

impl AgentHandle {
    pub fn new(agent_id: impl Into<String>, form: WireForm, outbound: mpsc::Sender<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            form,
            outbound,
        }
    }

    pub async fn send(&self, message: &Message) -> Result<(), CoordinatorError> {
        let frame = message.encode()?;
        self.outbound
            .send(frame)
            .await
            .map_err(|_| CoordinatorError::AgentGone(self.agent_id.clone()))
    }
}

#[derive(Debug, Clone)]
pub struct RegisteredAgent {
    pub agent_id: String,
    pub agent_type: AgentKind,
    pub capabilities: Vec<String>,
    pub registration: RegistrationParams,
    pub connection_id: u64,
    pub connected_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub active_tasks: usize,
    pub handle: AgentHandle,
}

#[derive(Default)]
pub struct AgentRegistry {
    agents: RwLock<HashMap<String, RegisteredAgent>>,
    /// Round-robin position per capability.
    cursors: Mutex<HashMap<String, usize>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the entry for `registration.agent_id`.
    pub async fn register(
        &self,
        registration: RegistrationParams,
        connection_id: u64,
        handle: AgentHandle,
    ) {
        let now = Utc::now();
        let agent = RegisteredAgent {
            agent_id: registration.agent_id.clone(),
            agent_type: registration.agent_type,
            capabilities: registration.capabilities.clone(),
            registration,
            connection_id,
            connected_at: now,
            last_seen: now,
            active_tasks: 0,
            handle,
        };
        let previous = self
            .agents
            .write()
            .await
            .insert(agent.agent_id.clone(), agent);
        if previous.is_some() {
            tracing::info!(connection_id, "Agent re-registered on a new connection");
        }
    }

    /// Remove an agent if it is still bound to `connection_id`. A newer
    /// registration of the same id on another connection is left alone.
    pub async fn remove_connection(&self, agent_id: &str, connection_id: u64) -> bool {
        let mut agents = self.agents.write().await;
        match agents.get(agent_id) {
            Some(agent) if agent.connection_id == connection_id => {
                agents.remove(agent_id);
                true
            }
            _ => false,
        }
    }

    /// Refresh liveness. Returns `false` for an unknown agent.
    pub async fn touch(&self, agent_id: &str, active_tasks: Option<usize>) -> bool {
        let mut agents = self.agents.write().await;
        let Some(agent) = agents.get_mut(agent_id) else {
            return false;
        };
        agent.last_seen = Utc::now();
        if let Some(active) = active_tasks {
            agent.active_tasks = active;
        }
        true
    }

    pub async fn get(&self, agent_id: &str) -> Option<RegisteredAgent> {
        self.agents.read().await.get(agent_id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.agents.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.agents.read().await.is_empty()
    }

    /// Ids of agents advertising `capability`, sorted.
    pub async fn capable_of(&self, capability: &str) -> Vec<String> {
        let mut ids: Vec<String> = self
            .agents
            .read()
            .await
            .values()
            .filter(|a| a.capabilities.iter().any(|c| c == capability))
            .map(|a| a.agent_id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Next agent for `capability`, rotating through the capable set.
    pub async fn next_for(&self, capability: &str) -> Option<AgentHandle> {
        let candidates = self.capable_of(capability).await;
        if candidates.is_empty() {
            return None;
        }
        let index = {
            let mut cursors = self.cursors.lock().await;
            let cursor = cursors.entry(capability.to_string()).or_insert(0);
            let index = *cursor % candidates.len();
            *cursor = cursor.wrapping_add(1);
            index
        };
        self.agents
            .read()
            .await
            .get(&candidates[index])
            .map(|a| a.handle.clone())
    }

    /// Drop agents not seen within `max_age`. Returns their ids.
    pub async fn prune_stale(&self, max_age: Duration) -> Vec<String> {
        let Ok(max_age) = chrono::Duration::from_std(max_age) else {
            return Vec::new();
        };
        let cutoff = Utc::now() - max_age;
        let mut agents = self.agents.write().await;
        let stale: Vec<String> = agents
            .values()
            .filter(|a| a.last_seen < cutoff)
            .map(|a| a.agent_id.clone())
            .collect();
        for id in &stale {
            agents.remove(id);
        }
        stale
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ars_protocol::PROTOCOL_VERSION;

    fn registration(id: &str, caps: &[&str]) -> RegistrationParams {
        RegistrationParams {
            agent_id: id.to_string(),
            agent_type: AgentKind::Executor,
            capabilities: caps.iter().map(|c| c.to_string()).collect(),
            service: None,
            protocol_version: PROTOCOL_VERSION.to_string(),
        }
    }

    async fn add(registry: &AgentRegistry, id: &str, caps: &[&str], conn: u64) -> mpsc::Receiver<String> {
        let (tx, rx) = mpsc::channel(8);
        registry
            .register(registration(id, caps), conn, AgentHandle::new(id, WireForm::Tagged, tx))
            .await;
        rx
    }

    #[tokio::test]
    async fn test_round_robin_over_capable_agents() {
        let registry = AgentRegistry::new();
        let _a = add(&registry, "a", &["search"], 1).await;
        let _b = add(&registry, "b", &["search", "analyze"], 2).await;
        let _c = add(&registry, "c", &["write"], 3).await;

        let picks: Vec<String> = {
            let mut picks = Vec::new();
            for _ in 0..4 {
                picks.push(registry.next_for("search").await.unwrap().agent_id);
            }
            picks
        };
        assert_eq!(picks, vec!["a", "b", "a", "b"]);
        assert_eq!(registry.next_for("analyze").await.unwrap().agent_id, "b");
        assert!(registry.next_for("grade").await.is_none());
    }

    #[tokio::test]
    async fn test_stale_connection_does_not_remove_new_registration() {
        let registry = AgentRegistry::new();
        let _old = add(&registry, "a", &["search"], 1).await;
        let _new = add(&registry, "a", &["search"], 2).await;

        assert!(!registry.remove_connection("a", 1).await);
        assert_eq!(registry.len().await, 1);
        assert!(registry.remove_connection("a", 2).await);
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_touch_and_prune() {
        let registry = AgentRegistry::new();
        let _a = add(&registry, "a", &[], 1).await;
        assert!(registry.touch("a", Some(2)).await);
        assert_eq!(registry.get("a").await.unwrap().active_tasks, 2);
        assert!(!registry.touch("ghost", None).await);

        assert!(registry.prune_stale(Duration::from_secs(60)).await.is_empty());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(registry.prune_stale(Duration::from_millis(5)).await, vec!["a"]);
    }

    #[tokio::test]
    async fn test_send_to_closed_connection_is_agent_gone() {
        let registry = AgentRegistry::new();
        let rx = add(&registry, "a", &["x"], 1).await;
        drop(rx);
        let handle = registry.next_for("x").await.unwrap();
        let err = handle
            .send(&Message::notification("ping", serde_json::json!({}), WireForm::Tagged))
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::AgentGone(_)));
    }
}
