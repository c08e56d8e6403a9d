//! Reference relay endpoint.
//!
//! ```text
//! Session A ──┐                         ┌──► Session A (echo)
//!             ├── Room (room_id) ── BroadcastGroup ──► Session B
//! Session B ──┘        │                └──► Session C
//!                      └── roster ──► initial presence snapshot for newcomers
//! ```
//!
//! The relay holds no document state. Per connection:
//!
//! 1. The first text frame must be a join handshake `{ roomId, userId }`.
//! 2. The newcomer gets the current roster (itself excluded) as a JSON array.
//! 3. Every valid message is folded into the roster and relayed to the whole
//!    room, sender included; sessions drop their own echoes.
//! 4. When the socket closes, the peer is removed and `user.left` is relayed
//!    on its behalf unless it already said goodbye or has since rejoined on
//!    another socket.

use futures_util::{SinkExt, Stream, StreamExt};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, RwLock};
use tokio_tungstenite::tungstenite::{self, Message as WsMessage};

use crate::broadcast::{BroadcastGroup, ConnectionId, RoomManager};
use crate::presence::Presence;
use crate::protocol::{encode_roster, now_ms, JoinHandshake, Message, Payload, ProtocolError};

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub bind_addr: String,
    /// Frames buffered per connection before a slow peer starts losing them
    pub broadcast_capacity: usize,
    /// How long a new socket may take to send its join handshake
    pub handshake_timeout: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            broadcast_capacity: 256,
            handshake_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub rejected_messages: u64,
    pub active_rooms: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("join handshake failed: {0}")]
    Handshake(String),
}

/// Room-scoped WebSocket relay. Cheap to clone; clones share rooms and stats.
#[derive(Clone)]
pub struct RelayServer {
    config: RelayConfig,
    rooms: Arc<RoomManager>,
    stats: Arc<RwLock<RelayStats>>,
    next_connection: Arc<AtomicU64>,
}

impl RelayServer {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            rooms: Arc::new(RoomManager::new(config.broadcast_capacity)),
            stats: Arc::new(RwLock::new(RelayStats::default())),
            next_connection: Arc::new(AtomicU64::new(1)),
            config,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(RelayConfig::default())
    }

    /// Bind the configured address and serve until an accept error.
    pub async fn run(&self) -> Result<(), RelayError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), RelayError> {
        log::info!("Relay listening on {}", listener.local_addr()?);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let server = self.clone();
            tokio::spawn(async move {
                if let Err(e) = server.handle_connection(stream, addr).await {
                    log::warn!("Connection from {addr} ended with error: {e}");
                }
            });
        }
    }

    async fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) -> Result<(), RelayError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let join = tokio::time::timeout(
            self.config.handshake_timeout,
            read_handshake(&mut ws_receiver),
        )
        .await
        .map_err(|_| RelayError::Handshake("timed out".into()))??;

        let connection = self.next_connection.fetch_add(1, Ordering::Relaxed);
        let room = self.rooms.get_or_create(&join.room_id).await;
        let mut entry = Presence::placeholder(join.user_id.clone());
        entry.last_seen = now_ms();
        let mut rx = room.add_peer(connection, entry).await;

        {
            let mut s = self.stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
            s.active_rooms = self.rooms.room_count().await;
        }
        log::info!("{} joined room {} from {addr}", join.user_id, join.room_id);

        let outcome: Result<(), RelayError> = async {
            let roster = encode_roster(&room.roster(&join.user_id).await)?;
            ws_sender.send(WsMessage::Text(roster.into())).await?;
            self.relay_frames(connection, &join, &room, &mut ws_sender, &mut ws_receiver, &mut rx)
                .await
        }
        .await;

        // Leave on the peer's behalf if it disappeared without saying so.
        if room.remove_peer(&join.user_id, connection).await.is_some() {
            if let Err(e) = room.broadcast(&Message::user_left(join.user_id.clone())) {
                log::warn!("Could not announce departure of {}: {e}", join.user_id);
            }
        }
        if self.rooms.remove_if_empty(&join.room_id).await {
            log::info!("Room {} removed (empty)", join.room_id);
        }

        {
            let mut s = self.stats.write().await;
            s.active_connections = s.active_connections.saturating_sub(1);
            s.active_rooms = self.rooms.room_count().await;
        }
        log::info!("{} left room {}", join.user_id, join.room_id);

        outcome
    }

    async fn relay_frames<W, R>(
        &self,
        connection: ConnectionId,
        join: &JoinHandshake,
        room: &BroadcastGroup,
        ws_sender: &mut W,
        ws_receiver: &mut R,
        rx: &mut broadcast::Receiver<Arc<String>>,
    ) -> Result<(), RelayError>
    where
        W: futures_util::Sink<WsMessage, Error = tungstenite::Error> + Unpin,
        R: Stream<Item = Result<WsMessage, tungstenite::Error>> + Unpin,
    {
        loop {
            tokio::select! {
                frame = ws_receiver.next() => match frame {
                    Some(Ok(WsMessage::Text(text))) => {
                        self.stats.write().await.total_messages += 1;
                        match Message::decode(text.as_str()) {
                            Ok(msg) if msg.user_id == join.user_id => {
                                let owner = room.apply(connection, &msg).await;
                                if owner || !matches!(msg.payload, Payload::UserLeft) {
                                    room.broadcast(&msg)?;
                                } else {
                                    log::debug!(
                                        "Ignoring user.left from superseded socket of {}",
                                        join.user_id
                                    );
                                }
                            }
                            Ok(msg) => {
                                log::warn!(
                                    "Dropping {} from {} claiming to be {}",
                                    msg.message_type(),
                                    join.user_id,
                                    msg.user_id
                                );
                                self.stats.write().await.rejected_messages += 1;
                            }
                            Err(e) => {
                                log::warn!("Dropping invalid frame from {}: {e}", join.user_id);
                                self.stats.write().await.rejected_messages += 1;
                            }
                        }
                    }
                    Some(Ok(WsMessage::Ping(data))) => {
                        ws_sender.send(WsMessage::Pong(data)).await?;
                    }
                    Some(Ok(WsMessage::Close(_))) | None => return Ok(()),
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e.into()),
                },

                out = rx.recv() => match out {
                    Ok(frame) => {
                        ws_sender.send(WsMessage::Text(frame.to_string().into())).await?;
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        log::warn!("{} lagged by {n} frames", join.user_id);
                        room.record_dropped(n);
                    }
                    Err(broadcast::error::RecvError::Closed) => return Ok(()),
                },
            }
        }
    }

    pub async fn stats(&self) -> RelayStats {
        self.stats.read().await.clone()
    }

    pub fn rooms(&self) -> &Arc<RoomManager> {
        &self.rooms
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }
}

/// Wait for the first text frame and parse it as a join handshake.
async fn read_handshake<R>(reader: &mut R) -> Result<JoinHandshake, RelayError>
where
    R: Stream<Item = Result<WsMessage, tungstenite::Error>> + Unpin,
{
    while let Some(frame) = reader.next().await {
        match frame? {
            WsMessage::Text(text) => {
                let join = JoinHandshake::decode(text.as_str())?;
                if join.room_id.is_empty() || join.user_id.is_empty() {
                    return Err(RelayError::Handshake("empty room or user id".into()));
                }
                return Ok(join);
            }
            WsMessage::Close(_) => break,
            _ => {}
        }
    }
    Err(RelayError::Handshake("closed before join".into()))
}
