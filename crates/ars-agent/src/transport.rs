//! Duplex transports.
//!
//! A connected transport is exposed as a [`Link`]: a pair of text-frame
//! channels. The WebSocket implementation bridges a `tokio-tungstenite`
//! stream onto the channels with one reader and one writer task, so the rest
//! of the runtime never touches the socket directly. The in-memory
//! implementation pairs two links back to back and is used by tests and
//! in-process deployments.

use std::future::Future;
use std::pin::Pin;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;

use crate::error::AgentError;

const DEFAULT_LINK_BUFFER: usize = 256;

/// One established duplex connection carrying text frames.
///
/// The peer closing the connection shows up as `inbound.recv()` returning
/// `None`; dropping the `Link` releases the transport.
#[derive(Debug)]
pub struct Link {
    pub outbound: mpsc::Sender<String>,
    pub inbound: mpsc::Receiver<String>,
}

impl Link {
    /// Two in-memory ends wired to each other.
    pub fn pair(buffer: usize) -> (Link, Link) {
        let (a_tx, a_rx) = mpsc::channel(buffer);
        let (b_tx, b_rx) = mpsc::channel(buffer);
        (
            Link {
                outbound: a_tx,
                inbound: b_rx,
            },
            Link {
                outbound: b_tx,
                inbound: a_rx,
            },
        )
    }
}

/// Establishes new transports on demand (initial connect and reconnects).
pub trait Dialer: Send + Sync {
    fn dial(&self) -> Pin<Box<dyn Future<Output = Result<Link, AgentError>> + Send + '_>>;

    /// Human-readable target, used in logs.
    fn target(&self) -> String;
}

/// Dials a WebSocket endpoint such as `ws://127.0.0.1:9100/agents`.
#[derive(Debug, Clone)]
pub struct WebSocketDialer {
    url: String,
    buffer: usize,
}

impl WebSocketDialer {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            buffer: DEFAULT_LINK_BUFFER,
        }
    }
}

impl Dialer for WebSocketDialer {
    fn dial(&self) -> Pin<Box<dyn Future<Output = Result<Link, AgentError>> + Send + '_>> {
        Box::pin(async move {
            let (ws, _response) = tokio_tungstenite::connect_async(self.url.as_str())
                .await
                .map_err(|e| AgentError::Transport(format!("{}: {e}", self.url)))?;
            Ok(bridge_websocket(ws, self.buffer))
        })
    }

    fn target(&self) -> String {
        self.url.clone()
    }
}

/// Move a WebSocket stream behind a [`Link`].
///
/// Used both for dialed connections and for connections accepted by a
/// server.
pub fn bridge_websocket<S>(ws: WebSocketStream<S>, buffer: usize) -> Link
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sink, mut stream) = ws.split();
    let (out_tx, mut out_rx) = mpsc::channel::<String>(buffer);
    let (in_tx, in_rx) = mpsc::channel::<String>(buffer);

    tokio::spawn(async move {
        while let Some(text) = out_rx.recv().await {
            if let Err(e) = sink.send(WsMessage::text(text)).await {
                tracing::debug!(error = %e, "WebSocket write failed");
                return;
            }
        }
        let _ = sink.close().await;
    });

    tokio::spawn(async move {
        while let Some(frame) = stream.next().await {
            let text = match frame {
                Ok(WsMessage::Text(text)) => text.to_string(),
                Ok(WsMessage::Binary(bytes)) => match String::from_utf8(bytes.to_vec()) {
                    Ok(text) => text,
                    Err(_) => {
                        tracing::warn!("Dropping non UTF-8 binary frame");
                        continue;
                    }
                },
                Ok(WsMessage::Close(_)) => break,
                Ok(_) => continue,
                Err(e) => {
                    tracing::debug!(error = %e, "WebSocket read failed");
                    break;
                }
            };
            if in_tx.send(text).await.is_err() {
                break;
            }
        }
    });

    Link {
        outbound: out_tx,
        inbound: in_rx,
    }
}

/// In-memory dialer: every dial hands the far end of a fresh link pair to
/// the paired acceptor channel. Dials fail once the acceptor is dropped.
#[derive(Debug, Clone)]
pub struct MemoryDialer {
    acceptor: mpsc::UnboundedSender<Link>,
    buffer: usize,
}

impl MemoryDialer {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Link>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                acceptor: tx,
                buffer: DEFAULT_LINK_BUFFER,
            },
            rx,
        )
    }
}

impl Dialer for MemoryDialer {
    fn dial(&self) -> Pin<Box<dyn Future<Output = Result<Link, AgentError>> + Send + '_>> {
        Box::pin(async move {
            let (local, remote) = Link::pair(self.buffer);
            self.acceptor
                .send(remote)
                .map_err(|_| AgentError::Transport("memory acceptor closed".into()))?;
            Ok(local)
        })
    }

    fn target(&self) -> String {
        "memory".to_string()
    }
}
