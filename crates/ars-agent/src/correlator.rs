//! Request/response correlation.
//!
//! Every outgoing request gets a fresh id and a single-use result slot. The
//! router fulfils the slot when a response with the same id arrives; the
//! caller's timeout removes it otherwise, so a late response finds nothing
//! and is dropped.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use ars_protocol::{Message, RpcError};
use serde_json::Value;
use tokio::sync::{oneshot, Mutex};
use tokio::time::Instant;

use crate::error::AgentError;
use crate::outbox::Outbox;

type Slot = oneshot::Sender<Result<Value, RpcError>>;

/// An outstanding request awaiting its response.
pub struct PendingRequest {
    pub method: String,
    pub submitted_at: Instant,
    pub timeout: Duration,
    slot: Slot,
}

/// Per-connection table of outstanding requests.
#[derive(Default)]
pub struct Correlator {
    pending: Mutex<HashMap<String, PendingRequest>>,
}

impl Correlator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a slot under a fresh id that is not currently outstanding.
    pub async fn register(
        &self,
        method: &str,
        timeout: Duration,
    ) -> (String, oneshot::Receiver<Result<Value, RpcError>>) {
        let (tx, rx) = oneshot::channel();
        let mut pending = self.pending.lock().await;
        let mut id = uuid::Uuid::new_v4().to_string();
        while pending.contains_key(&id) {
            id = uuid::Uuid::new_v4().to_string();
        }
        pending.insert(
            id.clone(),
            PendingRequest {
                method: method.to_string(),
                submitted_at: Instant::now(),
                timeout,
                slot: tx,
            },
        );
        (id, rx)
    }

    /// Fulfil or reject the slot for `id`. Returns `false` when no request
    /// with that id is outstanding.
    pub async fn resolve(&self, id: &str, outcome: Result<Value, RpcError>) -> bool {
        let Some(request) = self.pending.lock().await.remove(id) else {
            return false;
        };
        tracing::debug!(
            id = %id,
            method = %request.method,
            elapsed_ms = request.submitted_at.elapsed().as_millis() as u64,
            "Request resolved"
        );
        // The caller may already have given up; that is not an error here.
        let _ = request.slot.send(outcome);
        true
    }

    /// Remove a slot without fulfilling it.
    pub async fn cancel(&self, id: &str) -> bool {
        self.pending.lock().await.remove(id).is_some()
    }

    /// Drop every outstanding slot. Waiting callers observe the request as
    /// dropped.
    pub async fn fail_all(&self) -> usize {
        let mut pending = self.pending.lock().await;
        let count = pending.len();
        pending.clear();
        count
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }

    pub async fn is_pending(&self, id: &str) -> bool {
        self.pending.lock().await.contains_key(id)
    }
}

/// Request/notification API bound to one connection.
#[derive(Clone)]
pub struct RpcClient {
    outbox: Outbox,
    correlator: Arc<Correlator>,
    default_timeout: Duration,
}

impl RpcClient {
    pub fn new(outbox: Outbox, correlator: Arc<Correlator>, default_timeout: Duration) -> Self {
        Self {
            outbox,
            correlator,
            default_timeout,
        }
    }

    pub async fn send_request(&self, method: &str, params: Value) -> Result<Value, AgentError> {
        self.send_request_with_timeout(method, params, self.default_timeout)
            .await
    }

    pub async fn send_request_with_timeout(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, AgentError> {
        let (id, slot) = self.correlator.register(method, timeout).await;
        let message = Message::request(method, id.clone(), params, self.outbox.form());

        if let Err(e) = self.outbox.send(&message).await {
            self.correlator.cancel(&id).await;
            return Err(e);
        }

        match tokio::time::timeout(timeout, slot).await {
            Ok(Ok(Ok(result))) => Ok(result),
            Ok(Ok(Err(error))) => Err(AgentError::Remote(error)),
            Ok(Err(_)) => Err(AgentError::RequestDropped(method.to_string())),
            Err(_) => {
                self.correlator.cancel(&id).await;
                tracing::warn!(
                    id = %id,
                    method = %method,
                    timeout_ms = timeout.as_millis() as u64,
                    "Request timed out"
                );
                Err(AgentError::RequestTimeout {
                    method: method.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Fire-and-forget; never registers a slot.
    pub async fn send_notification(&self, method: &str, params: Value) -> Result<(), AgentError> {
        self.outbox
            .send(&Message::notification(method, params, self.outbox.form()))
            .await
    }

    pub fn correlator(&self) -> &Arc<Correlator> {
        &self.correlator
    }
}
