use std::sync::Arc;

use ars_protocol::{Message, ProtocolError, WireForm};
use serde::Serialize;
use tokio::sync::{mpsc, RwLock};

use crate::error::AgentError;

/// Shared handle to the current connection's outbound channel.
///
/// Every component that writes to the wire (router replies, task results,
/// heartbeats, the request correlator) goes through the same `Outbox`, which
/// is re-attached to a fresh channel after each reconnect.
#[derive(Clone)]
pub struct Outbox {
    sender: Arc<RwLock<Option<mpsc::Sender<String>>>>,
    form: WireForm,
}

impl Outbox {
    pub fn new(form: WireForm) -> Self {
        Self {
            sender: Arc::new(RwLock::new(None)),
            form,
        }
    }

    /// Wire form used for messages originated by this side.
    pub fn form(&self) -> WireForm {
        self.form
    }

    pub async fn attach(&self, sender: mpsc::Sender<String>) {
        *self.sender.write().await = Some(sender);
    }

    /// Drop the outbound channel. With no other clones left this releases
    /// the transport.
    pub async fn detach(&self) {
        self.sender.write().await.take();
    }

    pub async fn is_attached(&self) -> bool {
        self.sender.read().await.is_some()
    }

    pub async fn send(&self, message: &Message) -> Result<(), AgentError> {
        let frame = message.encode()?;
        let sender = self
            .sender
            .read()
            .await
            .clone()
            .ok_or(AgentError::NotConnected)?;
        sender
            .send(frame)
            .await
            .map_err(|_| AgentError::Transport("connection closed".into()))
    }

    /// Send a notification in this outbox's wire form.
    pub async fn notify<P: Serialize>(&self, method: &str, params: &P) -> Result<(), AgentError> {
        let params = serde_json::to_value(params).map_err(ProtocolError::from)?;
        self.send(&Message::notification(method, params, self.form))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_send_without_channel_is_not_connected() {
        let outbox = Outbox::new(WireForm::Tagged);
        let err = outbox.notify("heartbeat", &json!({})).await.unwrap_err();
        assert!(matches!(err, AgentError::NotConnected));
    }

    #[tokio::test]
    async fn test_notify_uses_configured_form() {
        let outbox = Outbox::new(WireForm::JsonRpc);
        let (tx, mut rx) = mpsc::channel(4);
        outbox.attach(tx).await;
        outbox.notify("heartbeat", &json!({"agent_id": "a"})).await.unwrap();

        let frame: serde_json::Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(frame["jsonrpc"], "2.0");
        assert_eq!(frame["method"], "heartbeat");
        assert_eq!(frame["params"]["agent_id"], "a");
    }

    #[tokio::test]
    async fn test_detach_closes_receiver() {
        let outbox = Outbox::new(WireForm::Tagged);
        let (tx, mut rx) = mpsc::channel(4);
        outbox.attach(tx).await;
        outbox.detach().await;
        assert!(!outbox.is_attached().await);
        assert!(rx.recv().await.is_none());
    }
}
