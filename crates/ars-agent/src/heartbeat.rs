use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ars_protocol::{HeartbeatParams, ProtocolMethod};
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::error::AgentError;
use crate::executor::TaskExecutor;
use crate::outbox::Outbox;

/// Periodic liveness notifications for one agent.
///
/// The server may answer with `heartbeat_ack` but is not required to; only a
/// failed send is treated as a sign the connection is gone.
pub struct HeartbeatMonitor {
    agent_id: String,
    interval: Duration,
    beats_sent: AtomicU64,
    last_ack: RwLock<Option<DateTime<Utc>>>,
}

impl HeartbeatMonitor {
    pub fn new(agent_id: impl Into<String>, interval: Duration) -> Self {
        Self {
            agent_id: agent_id.into(),
            interval,
            beats_sent: AtomicU64::new(0),
            last_ack: RwLock::new(None),
        }
    }

    pub fn beats_sent(&self) -> u64 {
        self.beats_sent.load(Ordering::Relaxed)
    }

    pub async fn record_ack(&self) {
        *self.last_ack.write().await = Some(Utc::now());
    }

    pub async fn last_ack(&self) -> Option<DateTime<Utc>> {
        *self.last_ack.read().await
    }

    /// Emit a heartbeat every interval until a send fails, then return the
    /// send error so the caller can mark the connection unhealthy.
    pub async fn run(self: Arc<Self>, outbox: Outbox, executor: Arc<TaskExecutor>) -> AgentError {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let params = HeartbeatParams {
                agent_id: self.agent_id.clone(),
                active_tasks: executor.active_count().await,
            };
            if let Err(e) = outbox.notify(ProtocolMethod::Heartbeat.as_str(), &params).await {
                tracing::warn!(agent_id = %self.agent_id, error = %e, "Heartbeat send failed");
                return e;
            }
            let sent = self.beats_sent.fetch_add(1, Ordering::Relaxed) + 1;
            tracing::debug!(agent_id = %self.agent_id, sent, active_tasks = params.active_tasks, "Heartbeat sent");
        }
    }
}
