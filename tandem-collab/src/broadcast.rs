//! Per-room fan-out for the relay.
//!
//! Uses tokio broadcast channels for O(1) send to all subscribers. Each
//! connection gets an independent receiver that buffers up to `capacity`
//! frames; a connection that falls further behind skips ahead and the
//! skipped frames are counted as dropped.
//!
//! The group also keeps the room roster, which the relay pushes to every
//! newcomer as its initial presence snapshot. Each roster entry belongs to
//! the connection that last joined under that user id; a superseded socket
//! cannot remove or rewrite it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};

use crate::presence::Presence;
use crate::protocol::{now_ms, Message, Payload, ProtocolError, UserId};

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_peers: usize,
}

/// Relay-assigned id of one accepted socket.
pub type ConnectionId = u64;

#[derive(Debug, Clone)]
struct Member {
    connection: ConnectionId,
    presence: Presence,
}

/// Counters updated on the hot path without taking the roster lock.
#[derive(Default)]
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

/// A broadcast group for a single room.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Arc<String>>,

    /// Who is in the room, keyed by user id
    roster: RwLock<HashMap<UserId, Member>>,

    /// Frames buffered per receiver
    capacity: usize,

    atomic_stats: AtomicBroadcastStats,
}

impl BroadcastGroup {
    /// `capacity` is how many frames a slow receiver may lag before it
    /// starts losing them.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            roster: RwLock::new(HashMap::new()),
            capacity,
            atomic_stats: AtomicBroadcastStats::default(),
        }
    }

    /// Add a peer and return its receiver.
    ///
    /// A user id already in the roster is taken over by `connection`. The
    /// receiver only sees frames broadcast after this call.
    pub async fn add_peer(
        &self,
        connection: ConnectionId,
        presence: Presence,
    ) -> broadcast::Receiver<Arc<String>> {
        let mut roster = self.roster.write().await;
        roster.insert(
            presence.user_id.clone(),
            Member {
                connection,
                presence,
            },
        );
        self.sender.subscribe()
    }

    /// Remove `user_id` if `connection` still owns its entry.
    pub async fn remove_peer(&self, user_id: &str, connection: ConnectionId) -> Option<Presence> {
        let mut roster = self.roster.write().await;
        match roster.get(user_id) {
            Some(member) if member.connection == connection => {
                roster.remove(user_id).map(|member| member.presence)
            }
            _ => None,
        }
    }

    /// Encode and send to every receiver, the sender's own included.
    ///
    /// Returns the number of receivers the frame was queued for.
    pub fn broadcast(&self, msg: &Message) -> Result<usize, ProtocolError> {
        let encoded = msg.encode()?;
        Ok(self.broadcast_raw(Arc::new(encoded)))
    }

    /// Send a pre-encoded frame.
    pub fn broadcast_raw(&self, encoded: Arc<String>) -> usize {
        let count = self.sender.send(encoded).unwrap_or(0);
        self.atomic_stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Fold a message received on `connection` into the roster.
    ///
    /// Returns `false`, leaving the roster untouched, when another
    /// connection owns the sender's entry.
    pub async fn apply(&self, connection: ConnectionId, msg: &Message) -> bool {
        let mut roster = self.roster.write().await;
        match roster.get(&msg.user_id) {
            Some(member) if member.connection != connection => return false,
            Some(_) => {}
            None if matches!(msg.payload, Payload::UserJoined(_)) => {
                roster.insert(
                    msg.user_id.clone(),
                    Member {
                        connection,
                        presence: Presence::placeholder(msg.user_id.clone()),
                    },
                );
            }
            None => return true,
        }

        if matches!(msg.payload, Payload::UserLeft) {
            roster.remove(&msg.user_id);
            return true;
        }
        let Some(member) = roster.get_mut(&msg.user_id) else {
            return true;
        };
        let entry = &mut member.presence;
        match &msg.payload {
            Payload::UserJoined(profile) => {
                entry.username = profile.username.clone();
                entry.color = profile.color.clone();
            }
            Payload::CursorMoved(cursor) => entry.cursor = Some(*cursor),
            Payload::StateUpdated(_) | Payload::UserLeft => {}
        }
        entry.last_seen = now_ms();
        true
    }

    /// Roster without `exclude`, ordered by user id.
    pub async fn roster(&self, exclude: &str) -> Vec<Presence> {
        let mut users: Vec<Presence> = self
            .roster
            .read()
            .await
            .values()
            .filter(|m| m.presence.user_id != exclude)
            .map(|m| m.presence.clone())
            .collect();
        users.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        users
    }

    pub async fn peer_count(&self) -> usize {
        self.roster.read().await.len()
    }

    pub async fn has_peer(&self, user_id: &str) -> bool {
        self.roster.read().await.contains_key(user_id)
    }

    /// Record frames a lagging receiver skipped.
    pub fn record_dropped(&self, count: u64) {
        self.atomic_stats
            .messages_dropped
            .fetch_add(count, Ordering::Relaxed);
    }

    pub async fn stats(&self) -> BroadcastStats {
        let roster = self.roster.read().await;
        BroadcastStats {
            messages_sent: self.atomic_stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.atomic_stats.messages_dropped.load(Ordering::Relaxed),
            active_peers: roster.len(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Maps room ids to broadcast groups so rooms stay isolated.
pub struct RoomManager {
    rooms: RwLock<HashMap<String, Arc<BroadcastGroup>>>,
    default_capacity: usize,
}

impl RoomManager {
    pub fn new(default_capacity: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            default_capacity,
        }
    }

    pub async fn get_or_create(&self, room_id: &str) -> Arc<BroadcastGroup> {
        // Fast path: read lock
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(room_id) {
                return room.clone();
            }
        }

        let mut rooms = self.rooms.write().await;
        rooms
            .entry(room_id.to_string())
            .or_insert_with(|| Arc::new(BroadcastGroup::new(self.default_capacity)))
            .clone()
    }

    /// Drop the room once its last peer has gone.
    pub async fn remove_if_empty(&self, room_id: &str) -> bool {
        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get(room_id) {
            if room.peer_count().await == 0 {
                rooms.remove(room_id);
                return true;
            }
        }
        false
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn active_rooms(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.rooms.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }
}
