//! The coordinating server.
//!
//! Each accepted WebSocket becomes one connection task that decodes frames
//! in arrival order and answers the agent lifecycle messages:
//!
//! | inbound                | action                                           |
//! |------------------------|--------------------------------------------------|
//! | `agent_register`       | record in registry, reply `registration_confirmed`|
//! | `heartbeat`            | refresh liveness, reply `heartbeat_ack`          |
//! | `task_result`          | feed the fan-out manager or publish as-is        |
//! | `agent_unregister`     | drop from registry                               |
//! | `status_response`      | publish                                          |
//!
//! Completed fan-out aggregates and other notable events go out on a
//! broadcast channel.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ars_agent::{bridge_websocket, Link};
use ars_fanout::{DispatchReport, FanoutManager, FanoutOptions, ParentTask};
use ars_protocol::{
    HeartbeatParams, Message, ProtocolMethod, RegistrationConfirmedParams, RegistrationParams,
    RpcError, StatusReport, TaskResultParams, UnregisterParams, WireForm, INVALID_PARAMS,
};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};

use crate::config::CoordinatorConfig;
use crate::dispatch::AgentDispatcher;
use crate::error::CoordinatorError;
use crate::registry::{AgentHandle, AgentRegistry};

const LINK_BUFFER: usize = 256;
const EVENT_BUFFER: usize = 1024;

#[derive(Debug, Clone)]
pub enum CoordinatorEvent {
    AgentRegistered {
        agent_id: String,
        capabilities: Vec<String>,
    },
    AgentLeft {
        agent_id: String,
    },
    /// A result for a task that is not part of any fan-out.
    TaskResult(TaskResultParams),
    FanoutCompleted {
        parent_task_id: String,
        aggregate: Value,
    },
    AgentStatus(StatusReport),
}

/// Per-connection state.
struct Connection {
    id: u64,
    outbound: mpsc::Sender<String>,
    agent_id: Option<String>,
    /// Last registration seen on this connection, replayed if the agent
    /// was pruned but keeps sending heartbeats.
    registration: Option<(RegistrationParams, WireForm)>,
}

impl Connection {
    async fn notify(&self, method: ProtocolMethod, params: Value, form: WireForm) {
        let message = Message::notification(method.as_str(), params, form);
        match message.encode() {
            Ok(frame) => {
                if self.outbound.send(frame).await.is_err() {
                    tracing::debug!(connection_id = self.id, "Connection closed before reply");
                }
            }
            Err(e) => tracing::warn!(error = %e, "Failed to encode reply"),
        }
    }
}

pub struct Coordinator {
    config: CoordinatorConfig,
    registry: Arc<AgentRegistry>,
    fanout: Arc<FanoutManager>,
    dispatcher: AgentDispatcher,
    events: broadcast::Sender<CoordinatorEvent>,
    next_connection: AtomicU64,
}

impl Coordinator {
    pub fn new(config: CoordinatorConfig) -> Arc<Self> {
        let registry = Arc::new(AgentRegistry::new());
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Arc::new(Self {
            config,
            dispatcher: AgentDispatcher::new(Arc::clone(&registry)),
            registry,
            fanout: Arc::new(FanoutManager::new()),
            events,
            next_connection: AtomicU64::new(1),
        })
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    pub fn fanout(&self) -> &Arc<FanoutManager> {
        &self.fanout
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoordinatorEvent> {
        self.events.subscribe()
    }

    fn publish(&self, event: CoordinatorEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Fan a task out to capable agents using the configured defaults for
    /// anything `options` leaves unset.
    pub async fn submit(
        &self,
        task: ParentTask,
        parallelism: Option<usize>,
        options: Option<FanoutOptions>,
    ) -> Result<DispatchReport, CoordinatorError> {
        let options = options.unwrap_or_else(|| {
            FanoutOptions::new(
                parallelism.unwrap_or(self.config.default_parallelism),
                self.config.default_strategy,
            )
        });
        let report = self
            .fanout
            .create_and_dispatch(task, options, &self.dispatcher)
            .await?;
        if let Some(aggregate) = &report.aggregated_result {
            self.complete_fanout(report.parent_task_id.clone(), aggregate.clone())
                .await;
        }
        Ok(report)
    }

    /// Ask an agent for a `status_response`; the answer arrives as an
    /// [`CoordinatorEvent::AgentStatus`].
    pub async fn request_status(&self, agent_id: &str) -> Result<(), CoordinatorError> {
        let agent = self
            .registry
            .get(agent_id)
            .await
            .ok_or_else(|| CoordinatorError::UnknownAgent(agent_id.to_string()))?;
        let message = Message::notification(
            ProtocolMethod::StatusRequest.as_str(),
            json!({}),
            agent.handle.form,
        );
        agent.handle.send(&message).await
    }

    // -----------------------------------------------------------------------
    // Network
    // -----------------------------------------------------------------------

    /// Accept agents until the listener fails.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<(), CoordinatorError> {
        tracing::info!(addr = ?listener.local_addr().ok(), "Coordinator listening");
        loop {
            let (stream, peer) = listener.accept().await?;
            let coordinator = Arc::clone(&self);
            tokio::spawn(async move {
                match tokio_tungstenite::accept_async(stream).await {
                    Ok(ws) => {
                        tracing::debug!(peer = %peer, "WebSocket handshake complete");
                        coordinator
                            .handle_link(bridge_websocket(ws, LINK_BUFFER))
                            .await;
                    }
                    Err(e) => tracing::warn!(peer = %peer, error = %e, "WebSocket handshake failed"),
                }
            });
        }
    }

    /// Periodically drop agents that stopped sending heartbeats.
    pub async fn run_stale_sweep(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.stale_sweep_interval());
        ticker.tick().await;
        loop {
            ticker.tick().await;
            for agent_id in self.registry.prune_stale(self.config.agent_stale_after()).await {
                tracing::warn!(agent_id = %agent_id, "Dropping silent agent");
                self.publish(CoordinatorEvent::AgentLeft { agent_id });
            }
        }
    }

    /// Serve one agent connection until it closes.
    pub async fn handle_link(&self, link: Link) {
        let Link {
            outbound,
            mut inbound,
        } = link;
        let mut conn = Connection {
            id: self.next_connection.fetch_add(1, Ordering::Relaxed),
            outbound,
            agent_id: None,
            registration: None,
        };
        tracing::debug!(connection_id = conn.id, "Agent connection opened");

        while let Some(frame) = inbound.recv().await {
            let message = match Message::decode(&frame) {
                Ok(m) => m,
                Err(e) => {
                    tracing::warn!(connection_id = conn.id, error = %e, "Dropping undecodable frame");
                    continue;
                }
            };
            if let Some(reply) = self.handle_message(message, &mut conn).await {
                match reply.encode() {
                    Ok(text) => {
                        if conn.outbound.send(text).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => tracing::warn!(error = %e, "Failed to encode reply"),
                }
            }
        }

        if let Some(agent_id) = conn.agent_id.take() {
            if self.registry.remove_connection(&agent_id, conn.id).await {
                tracing::info!(agent_id = %agent_id, "Agent disconnected");
                self.publish(CoordinatorEvent::AgentLeft { agent_id });
            }
        }
    }

    async fn handle_message(&self, message: Message, conn: &mut Connection) -> Option<Message> {
        match message {
            Message::Request {
                method,
                id,
                params,
                form,
            } => Some(match self.handle_method(&method, params, form, conn).await {
                Ok(result) => Message::response(id, result, form),
                Err(error) => Message::error(Some(id), error, form),
            }),
            Message::Notification {
                method,
                params,
                form,
            } => {
                if let Err(error) = self.handle_method(&method, params, form, conn).await {
                    tracing::warn!(method = %method, error = %error, "Notification rejected");
                }
                None
            }
            Message::Response { id, .. } => {
                tracing::debug!(id = %id, "Ignoring response from agent");
                None
            }
            Message::Error { id, error, .. } => {
                tracing::warn!(id = ?id, code = error.code, message = %error.message, "Agent reported an error");
                None
            }
        }
    }

    async fn handle_method(
        &self,
        method: &str,
        params: Value,
        form: WireForm,
        conn: &mut Connection,
    ) -> Result<Value, RpcError> {
        let Some(known) = ProtocolMethod::parse_name(method) else {
            return Err(RpcError::method_not_found(method));
        };
        match known {
            ProtocolMethod::AgentRegister => {
                let registration: RegistrationParams = parse(params)?;
                let agent_id = registration.agent_id.clone();
                let capabilities = registration.capabilities.clone();
                conn.registration = Some((registration.clone(), form));
                self.enroll(registration, form, conn).await;
                tracing::info!(agent_id = %agent_id, capabilities = ?capabilities, "Agent registered");

                let confirmation = RegistrationConfirmedParams {
                    agent_id,
                    message: Some("registered".to_string()),
                };
                conn.notify(ProtocolMethod::RegistrationConfirmed, to_value(&confirmation)?, form)
                    .await;
                Ok(json!({"registered": true}))
            }
            ProtocolMethod::AgentUnregister => {
                let params: UnregisterParams = parse(params)?;
                if self.registry.remove_connection(&params.agent_id, conn.id).await {
                    tracing::info!(agent_id = %params.agent_id, reason = ?params.reason, "Agent unregistered");
                    self.publish(CoordinatorEvent::AgentLeft {
                        agent_id: params.agent_id,
                    });
                }
                conn.agent_id = None;
                conn.registration = None;
                Ok(Value::Null)
            }
            ProtocolMethod::Heartbeat => {
                let beat: HeartbeatParams = parse(params)?;
                if !self.registry.touch(&beat.agent_id, Some(beat.active_tasks)).await {
                    match conn.registration.clone() {
                        Some((registration, reg_form)) if registration.agent_id == beat.agent_id => {
                            tracing::info!(agent_id = %beat.agent_id, "Re-registering agent after heartbeat");
                            self.enroll(registration, reg_form, conn).await;
                            self.registry.touch(&beat.agent_id, Some(beat.active_tasks)).await;
                        }
                        _ => {
                            tracing::debug!(agent_id = %beat.agent_id, "Heartbeat from unregistered agent")
                        }
                    }
                }
                conn.notify(ProtocolMethod::HeartbeatAck, json!({"agent_id": beat.agent_id}), form)
                    .await;
                Ok(Value::Null)
            }
            ProtocolMethod::TaskResult => {
                let result: TaskResultParams = parse(params)?;
                self.record_result(result).await;
                Ok(Value::Null)
            }
            ProtocolMethod::StatusResponse => {
                let report: StatusReport = parse(params)?;
                self.publish(CoordinatorEvent::AgentStatus(report));
                Ok(Value::Null)
            }
            ProtocolMethod::Ping => Ok(json!({"status": "alive"})),
            ProtocolMethod::Pong | ProtocolMethod::HeartbeatAck => Ok(Value::Null),
            ProtocolMethod::Error => {
                tracing::warn!(params = %params, "Agent sent an error notification");
                Ok(Value::Null)
            }
            other => Err(RpcError::method_not_found(other.as_str())),
        }
    }

    /// Put a registration into the registry under this connection and
    /// announce it.
    async fn enroll(&self, registration: RegistrationParams, form: WireForm, conn: &mut Connection) {
        let agent_id = registration.agent_id.clone();
        let capabilities = registration.capabilities.clone();
        self.registry
            .register(
                registration,
                conn.id,
                AgentHandle::new(agent_id.clone(), form, conn.outbound.clone()),
            )
            .await;
        conn.agent_id = Some(agent_id.clone());
        self.publish(CoordinatorEvent::AgentRegistered {
            agent_id,
            capabilities,
        });
    }

    /// Release a resolved fan-out and publish its aggregate.
    async fn complete_fanout(&self, parent_task_id: String, aggregate: Value) {
        self.fanout.release_completed(&parent_task_id).await;
        self.publish(CoordinatorEvent::FanoutCompleted {
            parent_task_id,
            aggregate,
        });
    }

    async fn record_result(&self, result: TaskResultParams) {
        let Some(task_id) = result.task_id.clone() else {
            tracing::warn!(agent_id = %result.agent_id, error = ?result.error, "Task result without task_id");
            self.publish(CoordinatorEvent::TaskResult(result));
            return;
        };
        if !result.agent_id.is_empty() {
            self.registry.touch(&result.agent_id, None).await;
        }

        let Some(parent_task_id) = self.fanout.parent_of(&task_id).await else {
            tracing::info!(task_id = %task_id, status = ?result.status, "Task result");
            self.publish(CoordinatorEvent::TaskResult(result));
            return;
        };

        let success = result.is_success();
        let value = if success {
            result.result.unwrap_or(Value::Null)
        } else {
            json!({"status": result.status, "error": result.error})
        };
        match self.fanout.complete_subtask(&task_id, value, success).await {
            Ok(Some(aggregate)) => self.complete_fanout(parent_task_id, aggregate).await,
            Ok(None) => {}
            Err(e) => tracing::debug!(task_id = %task_id, error = %e, "Result not applied"),
        }
    }

    /// Wait for the aggregate of `parent_task_id`, up to `timeout`.
    pub async fn await_aggregate(
        events: &mut broadcast::Receiver<CoordinatorEvent>,
        parent_task_id: &str,
        timeout: Duration,
    ) -> Option<Value> {
        tokio::time::timeout(timeout, async {
            loop {
                match events.recv().await {
                    Ok(CoordinatorEvent::FanoutCompleted {
                        parent_task_id: done,
                        aggregate,
                    }) if done == parent_task_id => return Some(aggregate),
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Event subscriber lagged");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
        .await
        .ok()
        .flatten()
    }
}

fn parse<T: DeserializeOwned>(params: Value) -> Result<T, RpcError> {
    serde_json::from_value(params).map_err(|e| RpcError::new(INVALID_PARAMS, e.to_string()))
}

fn to_value<T: serde::Serialize>(value: &T) -> Result<Value, RpcError> {
    serde_json::to_value(value).map_err(|e| RpcError::internal(e.to_string()))
}
