//! Connection lifecycle for one agent process.
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> Registered
//!                     |             |
//!                     v             v
//!                   Failed <- Reconnecting -> Connected ...
//!
//! any state --disconnect()--> Closed
//! ```
//!
//! `connect()` dials the server (retrying with backoff), sends the
//! registration and starts the per-session loops: receive, heartbeat and
//! task-timeout sweep. A supervisor task watches the session; when the peer
//! closes the transport or a heartbeat cannot be sent, the session is torn
//! down, outstanding requests are failed and a new session is dialed.
//! Registration confirmation is informational only.

use std::sync::Arc;

use ars_protocol::{
    AgentIdentity, ProtocolMethod, RpcError, StatusReport, TaskFailure, TaskRequestParams,
    TaskResultParams, UnregisterParams, INVALID_PARAMS,
};
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::{JoinHandle, JoinSet};

use crate::backoff::Backoff;
use crate::config::AgentConfig;
use crate::correlator::{Correlator, RpcClient};
use crate::error::AgentError;
use crate::executor::{report, TaskExecutor, TaskHandler};
use crate::heartbeat::HeartbeatMonitor;
use crate::outbox::Outbox;
use crate::router::Router;
use crate::transport::{Dialer, Link};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Registered,
    Reconnecting,
    Failed,
    Closed,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Registered => "registered",
            Self::Reconnecting => "reconnecting",
            Self::Failed => "failed",
            Self::Closed => "closed",
        }
    }

    /// A transport is up and the session loops are running.
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected | Self::Registered)
    }

    /// No further transitions happen without another `connect()`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Failed | Self::Closed)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a session loop returned.
enum SessionExit {
    PeerClosed,
    Unhealthy(AgentError),
    SweepStopped,
}

/// Tasks belonging to one established transport.
struct Session {
    tasks: JoinSet<SessionExit>,
}

impl Session {
    /// Wait for the first loop to return.
    async fn ended(&mut self) -> SessionExit {
        match self.tasks.join_next().await {
            Some(Ok(exit)) => exit,
            Some(Err(e)) => {
                tracing::error!(error = %e, "Session task failed");
                SessionExit::PeerClosed
            }
            None => SessionExit::PeerClosed,
        }
    }

    /// Abort the remaining loops and wait until every one has stopped.
    async fn shutdown(mut self) {
        self.tasks.abort_all();
        while let Some(joined) = self.tasks.join_next().await {
            if let Err(e) = joined {
                if !e.is_cancelled() {
                    tracing::error!(error = %e, "Session task failed during shutdown");
                }
            }
        }
    }
}

pub struct ConnectionManager {
    identity: AgentIdentity,
    config: AgentConfig,
    dialer: Arc<dyn Dialer>,
    outbox: Outbox,
    client: RpcClient,
    router: Arc<Router>,
    executor: Arc<TaskExecutor>,
    heartbeat: Arc<HeartbeatMonitor>,
    state: Arc<watch::Sender<ConnectionState>>,
    shutdown: watch::Sender<bool>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    started_at: DateTime<Utc>,
}

impl ConnectionManager {
    pub async fn new(
        identity: AgentIdentity,
        config: AgentConfig,
        dialer: Arc<dyn Dialer>,
    ) -> Arc<Self> {
        let outbox = Outbox::new(config.server.wire_form);
        let correlator = Arc::new(Correlator::new());
        let client = RpcClient::new(
            outbox.clone(),
            Arc::clone(&correlator),
            config.request_timeout(),
        );
        let router = Arc::new(Router::new(correlator, outbox.clone()));
        let executor = Arc::new(TaskExecutor::new(
            identity.agent_id.clone(),
            config.task_timeout(),
        ));
        let heartbeat = Arc::new(HeartbeatMonitor::new(
            identity.agent_id.clone(),
            config.heartbeat_interval(),
        ));
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (shutdown, _) = watch::channel(false);

        let manager = Arc::new(Self {
            identity,
            config,
            dialer,
            outbox,
            client,
            router,
            executor,
            heartbeat,
            state: Arc::new(state),
            shutdown,
            supervisor: Mutex::new(None),
            started_at: Utc::now(),
        });
        manager.install_routes().await;
        manager
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn identity(&self) -> &AgentIdentity {
        &self.identity
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Request/notification API over the current connection.
    pub fn rpc(&self) -> &RpcClient {
        &self.client
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub fn executor(&self) -> &Arc<TaskExecutor> {
        &self.executor
    }

    pub fn heartbeat(&self) -> &Arc<HeartbeatMonitor> {
        &self.heartbeat
    }

    pub async fn register_task_handler(&self, task_type: &str, handler: Arc<dyn TaskHandler>) {
        self.executor.register_handler(task_type, handler).await;
    }

    /// Wait until the connection reaches `Failed` or `Closed`.
    pub async fn wait_terminal(&self) -> ConnectionState {
        let mut rx = self.state.subscribe();
        rx.wait_for(|s| s.is_terminal())
            .await
            .map(|s| *s)
            .unwrap_or(ConnectionState::Closed)
    }

    fn set_state(&self, next: ConnectionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            tracing::info!(
                agent_id = %self.identity.agent_id,
                from = %previous,
                to = %next,
                "Connection state changed"
            );
        }
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Establish the connection, register and start the session loops.
    ///
    /// Returns once the first session is up. Later disconnects are handled in
    /// the background according to the reconnect settings.
    pub async fn connect(self: &Arc<Self>) -> Result<(), AgentError> {
        let mut supervisor = self.supervisor.lock().await;
        if supervisor.as_ref().is_some_and(|h| !h.is_finished()) {
            tracing::debug!(agent_id = %self.identity.agent_id, "Already connected");
            return Ok(());
        }

        self.shutdown.send_replace(false);
        let mut shutdown = self.shutdown.subscribe();
        self.set_state(ConnectionState::Connecting);

        let link = match self.establish(&mut shutdown).await {
            Ok(Some(link)) => link,
            Ok(None) => {
                self.set_state(ConnectionState::Closed);
                return Err(AgentError::NotConnected);
            }
            Err(e) => {
                tracing::error!(agent_id = %self.identity.agent_id, error = %e, "Could not connect");
                self.set_state(ConnectionState::Failed);
                return Err(e);
            }
        };

        let session = self.start_session(link).await;
        *supervisor = Some(tokio::spawn(Arc::clone(self).supervise(session, shutdown)));
        Ok(())
    }

    /// Stop every loop, announce the departure if connected and release the
    /// transport.
    pub async fn disconnect(&self) {
        if self.state().is_connected() {
            let params = UnregisterParams {
                agent_id: self.identity.agent_id.clone(),
                reason: Some("shutdown".to_string()),
            };
            match self
                .outbox
                .notify(ProtocolMethod::AgentUnregister.as_str(), &params)
                .await
            {
                Ok(()) => tracing::info!(agent_id = %self.identity.agent_id, "Unregister sent"),
                Err(e) => tracing::debug!(error = %e, "Could not send unregister"),
            }
        }

        self.shutdown.send_replace(true);
        let supervisor = self.supervisor.lock().await.take();
        if let Some(handle) = supervisor {
            if let Err(e) = handle.await {
                if e.is_panic() {
                    tracing::error!(error = %e, "Connection supervisor panicked");
                }
            }
        }

        self.outbox.detach().await;
        let dropped = self.client.correlator().fail_all().await;
        if dropped > 0 {
            tracing::debug!(dropped, "Dropped pending requests on disconnect");
        }
        self.set_state(ConnectionState::Closed);
    }

    /// Dial with retries. `Ok(None)` means shutdown was requested while
    /// waiting.
    async fn establish(
        &self,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<Option<Link>, AgentError> {
        let backoff = Backoff::new(self.config.reconnect_base_delay());
        let max_attempts = if self.config.reconnect.enabled {
            self.config.reconnect.max_attempts.max(1)
        } else {
            1
        };
        let target = self.dialer.target();
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            if *shutdown.borrow() {
                return Ok(None);
            }
            match self.dialer.dial().await {
                Ok(link) => {
                    tracing::info!(
                        agent_id = %self.identity.agent_id,
                        target = %target,
                        attempt,
                        "Connected"
                    );
                    self.set_state(ConnectionState::Connected);
                    return Ok(Some(link));
                }
                Err(e) => {
                    tracing::warn!(target = %target, attempt, max_attempts, error = %e, "Connection attempt failed");
                    last_error = e.to_string();
                }
            }
            if attempt == max_attempts {
                break;
            }

            let delay = backoff.delay(attempt);
            tracing::info!(
                target = %target,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "Retrying connection"
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = wait_for_shutdown(shutdown) => return Ok(None),
            }
        }

        Err(AgentError::ConnectionExhausted {
            attempts: max_attempts,
            last_error,
        })
    }

    async fn start_session(&self, link: Link) -> Session {
        let Link { outbound, inbound } = link;
        self.outbox.attach(outbound).await;

        let registration = self.identity.registration_params();
        match self
            .outbox
            .notify(ProtocolMethod::AgentRegister.as_str(), &registration)
            .await
        {
            Ok(()) => tracing::info!(
                agent_id = %self.identity.agent_id,
                agent_type = %self.identity.agent_type,
                capabilities = ?self.identity.capabilities,
                "Registration sent"
            ),
            Err(e) => tracing::warn!(error = %e, "Could not send registration"),
        }

        let mut tasks = JoinSet::new();
        let router = Arc::clone(&self.router);
        tasks.spawn(async move {
            receive_loop(router, inbound).await;
            SessionExit::PeerClosed
        });
        let heartbeat = Arc::clone(&self.heartbeat).run(self.outbox.clone(), Arc::clone(&self.executor));
        tasks.spawn(async move { SessionExit::Unhealthy(heartbeat.await) });
        let sweep = Arc::clone(&self.executor)
            .run_sweep_loop(self.outbox.clone(), self.config.sweep_interval());
        tasks.spawn(async move {
            sweep.await;
            SessionExit::SweepStopped
        });
        Session { tasks }
    }

    async fn supervise(self: Arc<Self>, mut session: Session, mut shutdown: watch::Receiver<bool>) {
        loop {
            let stopping = tokio::select! {
                exit = session.ended() => {
                    match exit {
                        SessionExit::PeerClosed => {
                            tracing::warn!(agent_id = %self.identity.agent_id, "Connection closed by peer");
                        }
                        SessionExit::Unhealthy(e) => {
                            tracing::warn!(agent_id = %self.identity.agent_id, error = %e, "Connection unhealthy");
                        }
                        SessionExit::SweepStopped => {
                            tracing::warn!(agent_id = %self.identity.agent_id, "Task sweep stopped");
                        }
                    }
                    false
                }
                _ = wait_for_shutdown(&mut shutdown) => true,
            };

            // Every session loop is joined before the sender goes away.
            session.shutdown().await;
            if stopping {
                return;
            }
            self.outbox.detach().await;
            let dropped = self.client.correlator().fail_all().await;
            if dropped > 0 {
                tracing::warn!(dropped, "Failed pending requests after connection loss");
            }

            if !self.config.reconnect.enabled {
                tracing::error!(agent_id = %self.identity.agent_id, "Connection lost and reconnect is disabled");
                self.set_state(ConnectionState::Failed);
                return;
            }

            self.set_state(ConnectionState::Reconnecting);
            match self.establish(&mut shutdown).await {
                Ok(Some(link)) => session = self.start_session(link).await,
                Ok(None) => return,
                Err(e) => {
                    tracing::error!(agent_id = %self.identity.agent_id, error = %e, "Giving up on reconnection");
                    self.set_state(ConnectionState::Failed);
                    return;
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Built-in routes
    // -----------------------------------------------------------------------

    async fn install_routes(&self) {
        self.router
            .register_protocol_with_reply(
                ProtocolMethod::Ping,
                Some(ProtocolMethod::Pong),
                |_params: Value| async move { Ok(json!({"status": "alive"})) },
            )
            .await;

        let identity = self.identity.clone();
        let executor = Arc::clone(&self.executor);
        let state = Arc::clone(&self.state);
        let started_at = self.started_at;
        self.router
            .register_protocol_with_reply(
                ProtocolMethod::StatusRequest,
                Some(ProtocolMethod::StatusResponse),
                move |_params: Value| {
                    let identity = identity.clone();
                    let executor = Arc::clone(&executor);
                    let connection = state.borrow().as_str().to_string();
                    async move {
                        let report = StatusReport {
                            agent_id: identity.agent_id,
                            agent_type: identity.agent_type,
                            capabilities: identity.capabilities,
                            task_types: executor.registered_task_types().await,
                            active_tasks: executor.active_count().await,
                            connection,
                            uptime_secs: (Utc::now() - started_at).num_seconds(),
                        };
                        serde_json::to_value(report).map_err(|e| RpcError::internal(e.to_string()))
                    }
                },
            )
            .await;

        let state = Arc::clone(&self.state);
        self.router
            .register_protocol(ProtocolMethod::RegistrationConfirmed, move |params: Value| {
                let promoted = state.send_if_modified(|s| {
                    if *s == ConnectionState::Connected {
                        *s = ConnectionState::Registered;
                        true
                    } else {
                        false
                    }
                });
                async move {
                    let note = params.get("message").and_then(Value::as_str).unwrap_or("");
                    tracing::info!(promoted, note, "Registration confirmed");
                    Ok(Value::Null)
                }
            })
            .await;

        let heartbeat = Arc::clone(&self.heartbeat);
        self.router
            .register_protocol(ProtocolMethod::HeartbeatAck, move |_params: Value| {
                let heartbeat = Arc::clone(&heartbeat);
                async move {
                    heartbeat.record_ack().await;
                    Ok(Value::Null)
                }
            })
            .await;

        let executor = Arc::clone(&self.executor);
        let outbox = self.outbox.clone();
        let agent_id = self.identity.agent_id.clone();
        self.router
            .register_protocol(ProtocolMethod::TaskRequest, move |params: Value| {
                let executor = Arc::clone(&executor);
                let outbox = outbox.clone();
                let agent_id = agent_id.clone();
                async move {
                    match serde_json::from_value::<TaskRequestParams>(params.clone()) {
                        Ok(request) => {
                            tracing::debug!(
                                task_id = request.task_id.as_deref().unwrap_or("<none>"),
                                task_type = request.task_type.as_deref().unwrap_or("<none>"),
                                "Task dispatch received"
                            );
                            executor.spawn_execution(request, outbox);
                            Ok(json!({"accepted": true}))
                        }
                        Err(e) => {
                            let message = format!("malformed task_request: {e}");
                            tracing::warn!(error = %e, "Rejecting malformed task dispatch");
                            let task_id = params
                                .get("task_id")
                                .and_then(Value::as_str)
                                .map(str::to_string);
                            let result = TaskResultParams::failed(
                                task_id,
                                agent_id,
                                TaskFailure {
                                    code: INVALID_PARAMS,
                                    message: message.clone(),
                                    data: None,
                                },
                            );
                            report(&outbox, &result).await;
                            Err(RpcError::new(INVALID_PARAMS, message))
                        }
                    }
                }
            })
            .await;

        self.router
            .register_protocol(ProtocolMethod::Error, |params: Value| async move {
                let code = params.get("code").and_then(Value::as_i64).unwrap_or_default();
                let reason = params.get("message").and_then(Value::as_str).unwrap_or("");
                tracing::warn!(code, reason, "Server reported an error");
                Ok(Value::Null)
            })
            .await;
    }
}

async fn receive_loop(router: Arc<Router>, mut inbound: mpsc::Receiver<String>) {
    while let Some(frame) = inbound.recv().await {
        tracing::debug!(bytes = frame.len(), "Frame received");
        router.handle_frame(&frame).await;
    }
}

async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}
