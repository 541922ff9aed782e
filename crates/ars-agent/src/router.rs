//! Inbound message routing.
//!
//! Decoded units are dispatched by kind: requests and notifications go to a
//! method table, responses and errors go to the correlator. Nothing raised
//! here escapes into the receive loop; malformed and unroutable units are
//! logged and dropped.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use ars_protocol::{Message, ProtocolMethod, RpcError};
use serde_json::Value;
use tokio::sync::RwLock;

use crate::correlator::Correlator;
use crate::outbox::Outbox;

pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<Value, RpcError>> + Send>>;
pub type MethodHandler = Arc<dyn Fn(Value) -> HandlerFuture + Send + Sync>;

#[derive(Clone)]
struct Route {
    handler: MethodHandler,
    /// Message type emitted with the handler's output when the method
    /// arrives as a notification (e.g. `status_request` -> `status_response`).
    reply_method: Option<&'static str>,
}

pub struct Router {
    routes: RwLock<HashMap<String, Route>>,
    correlator: Arc<Correlator>,
    outbox: Outbox,
}

impl Router {
    pub fn new(correlator: Arc<Correlator>, outbox: Outbox) -> Self {
        Self {
            routes: RwLock::new(HashMap::new()),
            correlator,
            outbox,
        }
    }

    pub async fn register<F, Fut>(&self, method: &str, handler: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, RpcError>> + Send + 'static,
    {
        self.insert(method, boxed(handler), None).await;
    }

    /// Register under every accepted spelling of a protocol method.
    pub async fn register_protocol<F, Fut>(&self, method: ProtocolMethod, handler: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, RpcError>> + Send + 'static,
    {
        self.register_protocol_with_reply(method, None, handler).await;
    }

    pub async fn register_protocol_with_reply<F, Fut>(
        &self,
        method: ProtocolMethod,
        reply: Option<ProtocolMethod>,
        handler: F,
    ) where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, RpcError>> + Send + 'static,
    {
        let handler = boxed(handler);
        for name in method.names() {
            self.insert(name, Arc::clone(&handler), reply.map(|r| r.as_str()))
                .await;
        }
    }

    async fn insert(&self, method: &str, handler: MethodHandler, reply_method: Option<&'static str>) {
        self.routes.write().await.insert(
            method.to_string(),
            Route {
                handler,
                reply_method,
            },
        );
    }

    pub async fn methods(&self) -> Vec<String> {
        let mut methods: Vec<String> = self.routes.read().await.keys().cloned().collect();
        methods.sort();
        methods
    }

    /// Decode one frame, route it and send any reply.
    pub async fn handle_frame(&self, frame: &str) {
        let message = match Message::decode(frame) {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(error = %e, "Dropping undecodable message");
                return;
            }
        };
        if let Some(reply) = self.dispatch(message).await {
            if let Err(e) = self.outbox.send(&reply).await {
                tracing::warn!(error = %e, "Failed to send reply");
            }
        }
    }

    /// Route a decoded message, returning the reply to send, if any.
    pub async fn dispatch(&self, message: Message) -> Option<Message> {
        match message {
            Message::Request {
                method,
                id,
                params,
                form,
            } => {
                let Some(route) = self.lookup(&method).await else {
                    tracing::warn!(method = %method, id = %id, "Request for unknown method");
                    return Some(Message::error(
                        Some(id),
                        RpcError::method_not_found(&method),
                        form,
                    ));
                };
                Some(match (route.handler)(params).await {
                    Ok(result) => Message::response(id, result, form),
                    Err(error) => {
                        tracing::warn!(method = %method, id = %id, error = %error, "Request handler failed");
                        Message::error(Some(id), error, form)
                    }
                })
            }
            Message::Notification {
                method,
                params,
                form,
            } => {
                let Some(route) = self.lookup(&method).await else {
                    tracing::warn!(method = %method, "Dropping notification for unknown method");
                    return None;
                };
                match (route.handler)(params).await {
                    Ok(result) => route
                        .reply_method
                        .map(|reply| Message::notification(reply, result, form)),
                    Err(error) => {
                        tracing::warn!(method = %method, error = %error, "Notification handler failed");
                        None
                    }
                }
            }
            Message::Response { id, result, .. } => {
                if !self.correlator.resolve(&id, Ok(result)).await {
                    tracing::warn!(id = %id, "Dropping response with no pending request");
                }
                None
            }
            Message::Error { id, error, .. } => {
                match id {
                    Some(id) => {
                        if !self.correlator.resolve(&id, Err(error)).await {
                            tracing::warn!(id = %id, "Dropping error response with no pending request");
                        }
                    }
                    None => {
                        tracing::warn!(code = error.code, message = %error.message, "Peer reported an uncorrelated error");
                    }
                }
                None
            }
        }
    }

    async fn lookup(&self, method: &str) -> Option<Route> {
        self.routes.read().await.get(method).cloned()
    }
}

fn boxed<F, Fut>(handler: F) -> MethodHandler
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, RpcError>> + Send + 'static,
{
    Arc::new(move |params| Box::pin(handler(params)) as HandlerFuture)
}
