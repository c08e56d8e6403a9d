//! Transports that carry text frames for a [`Channel`](crate::channel::Channel).
//!
//! A transport only knows how to open one connection. Reconnection, the join
//! handshake and frame parsing all live in the channel, so every transport
//! gets the same retry behaviour.
//!
//! - [`WebSocketTransport`]: live connection via `tokio-tungstenite`
//! - [`NullTransport`]: always opens, discards outbound frames, never delivers
//!   inbound ones (offline sessions)

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use crate::channel::ChannelError;

/// One open connection as seen by the channel.
///
/// Dropping `outgoing` tears the connection down. `incoming` yielding
/// `None` means the connection dropped.
#[derive(Debug)]
pub struct Link {
    pub outgoing: mpsc::UnboundedSender<String>,
    pub incoming: mpsc::UnboundedReceiver<String>,
}

/// The far side of an in-memory [`Link`].
#[derive(Debug)]
pub struct RemoteEnd {
    /// Frames the channel sent
    pub sent: mpsc::UnboundedReceiver<String>,
    /// Push frames to the channel
    pub deliver: mpsc::UnboundedSender<String>,
}

impl Link {
    /// Create a connected in-memory link pair.
    pub fn pair() -> (Link, RemoteEnd) {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        (
            Link {
                outgoing: out_tx,
                incoming: in_rx,
            },
            RemoteEnd {
                sent: out_rx,
                deliver: in_tx,
            },
        )
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a connection to `endpoint`. Resolves once the connection is usable.
    async fn open(&self, endpoint: &str, auth_token: &str) -> Result<Link, ChannelError>;
}

/// Transport with no remote side.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullTransport;

#[async_trait]
impl Transport for NullTransport {
    async fn open(&self, _endpoint: &str, _auth_token: &str) -> Result<Link, ChannelError> {
        let (link, remote) = Link::pair();
        tokio::spawn(async move {
            let RemoteEnd { mut sent, deliver } = remote;
            // Hold `deliver` so the link looks open until the channel drops it.
            while sent.recv().await.is_some() {}
            drop(deliver);
        });
        Ok(link)
    }
}

/// WebSocket transport exchanging JSON text frames.
#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketTransport;

impl WebSocketTransport {
    /// Endpoint with the auth token appended as a `token` query parameter.
    pub fn url_for(endpoint: &str, auth_token: &str) -> String {
        if auth_token.is_empty() {
            return endpoint.to_string();
        }
        let sep = if endpoint.contains('?') { '&' } else { '?' };
        format!("{endpoint}{sep}token={auth_token}")
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn open(&self, endpoint: &str, auth_token: &str) -> Result<Link, ChannelError> {
        let url = Self::url_for(endpoint, auth_token);
        let (ws_stream, _) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|e| ChannelError::Open {
                endpoint: endpoint.to_string(),
                reason: e.to_string(),
            })?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (link, remote) = Link::pair();
        let RemoteEnd {
            sent: mut out_rx,
            deliver: in_tx,
        } = remote;
        let endpoint = endpoint.to_string();

        // Pump task: forwards both directions until either side goes away.
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    out = out_rx.recv() => match out {
                        Some(text) => {
                            if ws_writer.send(WsMessage::Text(text.into())).await.is_err() {
                                break;
                            }
                        }
                        None => {
                            let _ = ws_writer.send(WsMessage::Close(None)).await;
                            break;
                        }
                    },
                    frame = ws_reader.next() => match frame {
                        Some(Ok(WsMessage::Text(text))) => {
                            if in_tx.send(text.as_str().to_owned()).is_err() {
                                break;
                            }
                        }
                        Some(Ok(WsMessage::Binary(bytes))) => match String::from_utf8(bytes.to_vec()) {
                            Ok(text) => {
                                if in_tx.send(text).is_err() {
                                    break;
                                }
                            }
                            Err(_) => log::warn!("Dropping non-UTF-8 binary frame from {endpoint}"),
                        },
                        Some(Ok(WsMessage::Close(_))) | None => break,
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            log::warn!("WebSocket error from {endpoint}: {e}");
                            break;
                        }
                    },
                }
            }
            log::debug!("WebSocket pump for {endpoint} finished");
        });

        Ok(link)
    }
}
