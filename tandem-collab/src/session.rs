//! Sync session: one user in one room.
//!
//! ## Data flow
//!
//! ```text
//!  Transport ──► Channel ──► channel EventBus
//!                                 │  "message" / "presence" / "state"
//!                                 ▼
//!                           InboundRouter ── drops echoes of our own messages
//!                             │         │
//!                             ▼         ▼
//!                  PresenceRegistry   SharedState
//!                             │         │
//!                             └────┬────┘
//!                                  ▼
//!                          session EventBus ──► external subscribers
//!          "user.joined" "user.left" "state.updated" "cursor.moved"
//!          "presence.synced" "connection.changed"
//! ```
//!
//! Outbound calls (`update_cursor`, `update_state`) go straight to the
//! channel. All registry and document mutation happens under a mutex, so
//! version bumps and clock increments have a single writer at a time.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::bus::{EventBus, HandlerId};
use crate::channel::{Channel, ChannelError, ChannelEvent, ChannelSender, ChannelState, RetryPolicy};
use crate::lock;
use crate::presence::{color_for, Presence, PresenceRegistry, SweepTask};
use crate::protocol::{now_ms, Cursor, Document, Message, Payload, Profile, StateSnapshot, UserId};
use crate::state::SharedState;
use crate::transport::{Transport, WebSocketTransport};

/// Session configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Local identity; a v4 UUID is generated when absent
    #[serde(default)]
    pub user_id: Option<UserId>,

    #[serde(default = "default_username")]
    pub username: String,

    /// Display color; derived from the user id when absent
    #[serde(default)]
    pub color: Option<String>,

    #[serde(default = "default_reconnect_interval_ms")]
    pub reconnect_interval_ms: u64,

    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,

    #[serde(default = "default_stale_threshold_ms")]
    pub stale_threshold_ms: u64,

    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,

    /// Minimum gap between outgoing cursor messages. `None` sends every
    /// update, which can flood the endpoint on fast pointer movement.
    #[serde(default)]
    pub cursor_throttle_ms: Option<u64>,
}

fn default_username() -> String { "Anonymous".to_string() }
fn default_reconnect_interval_ms() -> u64 { 3_000 }
fn default_max_reconnect_attempts() -> u32 { 5 }
fn default_stale_threshold_ms() -> u64 { 5_000 }
fn default_sweep_interval_ms() -> u64 { 1_000 }

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            user_id: None,
            username: default_username(),
            color: None,
            reconnect_interval_ms: default_reconnect_interval_ms(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            stale_threshold_ms: default_stale_threshold_ms(),
            sweep_interval_ms: default_sweep_interval_ms(),
            cursor_throttle_ms: None,
        }
    }
}

impl SessionConfig {
    /// Parse a JSON config document; missing fields take their defaults.
    pub fn from_json(text: &str) -> Result<Self, SessionError> {
        let config: Self =
            serde_json::from_str(text).map_err(|e| SessionError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), SessionError> {
        if self.sweep_interval_ms == 0 {
            return Err(SessionError::Config("sweep_interval_ms must be positive".into()));
        }
        if matches!(&self.user_id, Some(id) if id.is_empty()) {
            return Err(SessionError::Config("user_id must not be empty".into()));
        }
        self.stale_threshold()?;
        Ok(())
    }

    /// Staleness threshold in the registry's signed epoch-ms arithmetic.
    fn stale_threshold(&self) -> Result<i64, SessionError> {
        i64::try_from(self.stale_threshold_ms).map_err(|_| {
            SessionError::Config(format!(
                "stale_threshold_ms must not exceed {}",
                i64::MAX
            ))
        })
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            interval: Duration::from_millis(self.reconnect_interval_ms),
            max_attempts: self.max_reconnect_attempts,
        }
    }

    pub fn with_user_id(mut self, user_id: impl Into<UserId>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = username.into();
        self
    }

    pub fn with_cursor_throttle(mut self, period: Duration) -> Self {
        self.cursor_throttle_ms = Some(u64::try_from(period.as_millis()).unwrap_or(u64::MAX));
        self
    }
}

/// Events published on the session bus.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    UserJoined(Presence),
    /// Explicit leave or eviction by the stale sweep
    UserLeft { user_id: UserId },
    /// A remote snapshot replaced local state
    StateUpdated(StateSnapshot),
    CursorMoved { user_id: UserId, cursor: Cursor },
    /// Authoritative roster applied
    PresenceSynced(Vec<Presence>),
    ConnectionChanged(ChannelState),
}

impl SessionEvent {
    pub const USER_JOINED: &'static str = "user.joined";
    pub const USER_LEFT: &'static str = "user.left";
    pub const STATE_UPDATED: &'static str = "state.updated";
    pub const CURSOR_MOVED: &'static str = "cursor.moved";
    pub const PRESENCE_SYNCED: &'static str = "presence.synced";
    pub const CONNECTION_CHANGED: &'static str = "connection.changed";

    pub fn name(&self) -> &'static str {
        match self {
            SessionEvent::UserJoined(_) => Self::USER_JOINED,
            SessionEvent::UserLeft { .. } => Self::USER_LEFT,
            SessionEvent::StateUpdated(_) => Self::STATE_UPDATED,
            SessionEvent::CursorMoved { .. } => Self::CURSOR_MOVED,
            SessionEvent::PresenceSynced(_) => Self::PRESENCE_SYNCED,
            SessionEvent::ConnectionChanged(_) => Self::CONNECTION_CHANGED,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error("invalid session config: {0}")]
    Config(String),
}

/// Routes channel events into the registries and the session bus.
#[derive(Clone)]
struct InboundRouter {
    local_user_id: UserId,
    profile: Profile,
    presence: Arc<Mutex<PresenceRegistry>>,
    state: Arc<Mutex<SharedState>>,
    events: Arc<EventBus<SessionEvent>>,
    sender: ChannelSender,
}

impl InboundRouter {
    fn publish(&self, event: SessionEvent) {
        self.events.emit(event.name(), &event);
    }

    fn handle_message(&self, message: &Message) {
        if message.user_id == self.local_user_id {
            log::debug!("Ignoring echo of own {} message", message.message_type());
            return;
        }

        match &message.payload {
            Payload::UserJoined(profile) => {
                let stored = lock(&self.presence)
                    .upsert(Presence::new(message.user_id.clone(), profile.clone()));
                if let Some(presence) = stored {
                    log::info!("{} ({}) joined", presence.username, presence.user_id);
                    self.publish(SessionEvent::UserJoined(presence));
                }
            }
            Payload::UserLeft => {
                lock(&self.presence).remove(&message.user_id);
                log::info!("{} left", message.user_id);
                self.publish(SessionEvent::UserLeft {
                    user_id: message.user_id.clone(),
                });
            }
            Payload::StateUpdated(snapshot) => {
                let merged = {
                    let mut state = lock(&self.state);
                    state
                        .merge_snapshot(snapshot.clone())
                        .then(|| state.snapshot())
                };
                match merged {
                    Some(current) => self.publish(SessionEvent::StateUpdated(current)),
                    None => log::debug!(
                        "Ignoring state v{} from {}: not newer than local",
                        snapshot.version,
                        message.user_id
                    ),
                }
            }
            Payload::CursorMoved(cursor) => {
                let recorded = lock(&self.presence).record_cursor(&message.user_id, *cursor, now_ms());
                if recorded.is_some() {
                    self.publish(SessionEvent::CursorMoved {
                        user_id: message.user_id.clone(),
                        cursor: *cursor,
                    });
                }
            }
        }
    }

    fn handle_roster(&self, users: &[Presence]) {
        let roster = {
            let mut presence = lock(&self.presence);
            presence.apply_snapshot(users.to_vec());
            presence.snapshot()
        };
        self.publish(SessionEvent::PresenceSynced(roster));
    }

    fn handle_state(&self, state: ChannelState) {
        if state == ChannelState::Open {
            // Announce on every (re)open so peers learn our profile.
            let joined = Message::user_joined(self.local_user_id.clone(), self.profile.clone());
            self.sender.send(&joined);
        }
        self.publish(SessionEvent::ConnectionChanged(state));
    }
}

/// One user's view of a shared room.
pub struct SyncSession {
    config: SessionConfig,
    user_id: UserId,
    profile: Profile,
    channel: Channel,
    presence: Arc<Mutex<PresenceRegistry>>,
    state: Arc<Mutex<SharedState>>,
    events: Arc<EventBus<SessionEvent>>,
    /// Handlers installed on the channel bus
    subscriptions: Mutex<Vec<(&'static str, HandlerId)>>,
    sweeper: Mutex<Option<SweepTask>>,
    last_cursor_sent: Mutex<Option<Instant>>,
}

impl SyncSession {
    /// Session over a live WebSocket transport.
    pub fn new(config: SessionConfig) -> Result<Self, SessionError> {
        Self::with_transport(config, Arc::new(WebSocketTransport))
    }

    /// Session over an injected transport.
    pub fn with_transport(
        config: SessionConfig,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, SessionError> {
        config.validate()?;
        let user_id = config
            .user_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let profile = Profile {
            username: config.username.clone(),
            color: config.color.clone().unwrap_or_else(|| color_for(&user_id)),
        };
        let channel = Channel::new(user_id.clone(), transport, config.retry_policy());

        Ok(Self {
            presence: Arc::new(Mutex::new(PresenceRegistry::new(user_id.clone()))),
            state: Arc::new(Mutex::new(SharedState::new())),
            events: Arc::new(EventBus::new()),
            subscriptions: Mutex::new(Vec::new()),
            sweeper: Mutex::new(None),
            last_cursor_sent: Mutex::new(None),
            config,
            user_id,
            profile,
            channel,
        })
    }

    /// Join `room_id` at `endpoint`.
    ///
    /// Inbound wiring is installed before the channel opens so the initial
    /// roster is never missed.
    pub async fn connect(
        &self,
        endpoint: &str,
        room_id: &str,
        auth_token: &str,
    ) -> Result<(), SessionError> {
        self.wire();
        if let Err(e) = self.channel.connect(endpoint, room_id, auth_token).await {
            self.unwire();
            return Err(e.into());
        }
        self.start_sweeper();
        Ok(())
    }

    /// Explicit recovery, e.g. after the channel reached `Failed`.
    pub async fn reconnect(&self) -> Result<(), SessionError> {
        self.wire();
        if let Err(e) = self.channel.reconnect().await {
            self.unwire();
            return Err(e.into());
        }
        self.start_sweeper();
        Ok(())
    }

    /// Broadcast the local cursor. Returns `false` if throttled or dropped.
    pub fn update_cursor(&self, x: f64, y: f64) -> bool {
        if let Some(ms) = self.config.cursor_throttle_ms {
            let mut last = lock(&self.last_cursor_sent);
            let now = Instant::now();
            if matches!(*last, Some(at) if now.duration_since(at) < Duration::from_millis(ms)) {
                return false;
            }
            *last = Some(now);
        }
        self.channel
            .send(&Message::cursor_moved(self.user_id.clone(), Cursor::new(x, y)))
    }

    /// Apply a partial edit locally, then broadcast the full document.
    ///
    /// Each key counts as one edit.
    pub fn update_state(&self, partial: Document) -> StateSnapshot {
        if partial.is_empty() {
            return self.state_snapshot();
        }
        let snapshot = {
            let mut state = lock(&self.state);
            for (key, value) in partial {
                state.update(key, value, &self.user_id);
            }
            state.snapshot()
        };
        self.channel
            .send(&Message::state_updated(self.user_id.clone(), snapshot.clone()));
        snapshot
    }

    /// Convenience for a single-key edit.
    pub fn set(&self, key: impl Into<String>, value: Value) -> StateSnapshot {
        let mut partial = Document::new();
        partial.insert(key.into(), value);
        self.update_state(partial)
    }

    pub fn get_presence(&self) -> Vec<Presence> {
        lock(&self.presence).snapshot()
    }

    pub fn get_state(&self) -> Document {
        lock(&self.state).document()
    }

    pub fn get_version(&self) -> u64 {
        lock(&self.state).version()
    }

    pub fn state_snapshot(&self) -> StateSnapshot {
        lock(&self.state).snapshot()
    }

    /// Leave the room. Any pending reconnect is cancelled before this returns.
    pub fn disconnect(&self) {
        if self.channel.state() == ChannelState::Open {
            self.channel.send(&Message::user_left(self.user_id.clone()));
        }
        self.channel.close();
        if let Some(sweeper) = lock(&self.sweeper).take() {
            sweeper.stop();
        }
        self.unwire();
    }

    pub fn connection_state(&self) -> ChannelState {
        self.channel.state()
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn profile(&self) -> &Profile {
        &self.profile
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Bus for external subscribers.
    pub fn events(&self) -> &Arc<EventBus<SessionEvent>> {
        &self.events
    }

    fn router(&self) -> InboundRouter {
        InboundRouter {
            local_user_id: self.user_id.clone(),
            profile: self.profile.clone(),
            presence: self.presence.clone(),
            state: self.state.clone(),
            events: self.events.clone(),
            sender: self.channel.sender(),
        }
    }

    fn wire(&self) {
        let mut subscriptions = lock(&self.subscriptions);
        if !subscriptions.is_empty() {
            return;
        }
        let bus = self.channel.events();

        let router = self.router();
        let id = bus.on(ChannelEvent::MESSAGE, move |evt| {
            if let ChannelEvent::Message(message) = evt {
                router.handle_message(message);
            }
        });
        subscriptions.push((ChannelEvent::MESSAGE, id));

        let router = self.router();
        let id = bus.on(ChannelEvent::PRESENCE, move |evt| {
            if let ChannelEvent::Presence(users) = evt {
                router.handle_roster(users);
            }
        });
        subscriptions.push((ChannelEvent::PRESENCE, id));

        let router = self.router();
        let id = bus.on(ChannelEvent::STATE, move |evt| {
            if let ChannelEvent::StateChanged(state) = evt {
                router.handle_state(*state);
            }
        });
        subscriptions.push((ChannelEvent::STATE, id));
    }

    fn unwire(&self) {
        let bus = self.channel.events();
        for (event, id) in lock(&self.subscriptions).drain(..) {
            bus.off(event, id);
        }
    }

    fn start_sweeper(&self) {
        let mut sweeper = lock(&self.sweeper);
        if sweeper.is_some() {
            return;
        }
        // Validated at construction.
        let threshold_ms = self.config.stale_threshold().unwrap_or(i64::MAX);
        let events = self.events.clone();
        *sweeper = Some(SweepTask::spawn(
            self.presence.clone(),
            Duration::from_millis(self.config.sweep_interval_ms),
            threshold_ms,
            move |evicted| {
                for user_id in evicted {
                    let event = SessionEvent::UserLeft { user_id };
                    events.emit(event.name(), &event);
                }
            },
        ));
    }

    #[cfg(test)]
    fn channel(&self) -> &Channel {
        &self.channel
    }
}

impl Drop for SyncSession {
    fn drop(&mut self) {
        self.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::NullTransport;
    use serde_json::json;

    fn offline_session(user_id: &str) -> SyncSession {
        let config = SessionConfig::default().with_user_id(user_id).with_username("Local");
        SyncSession::with_transport(config, Arc::new(NullTransport)).unwrap()
    }

    fn inject(session: &SyncSession, message: Message) {
        session
            .channel()
            .events()
            .emit(ChannelEvent::MESSAGE, &ChannelEvent::Message(message));
    }

    fn record(session: &SyncSession, event: &str) -> Arc<Mutex<Vec<SessionEvent>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        session.events().on(event, move |evt| lock(&sink).push(evt.clone()));
        seen
    }

    #[test]
    fn test_config_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.reconnect_interval_ms, 3_000);
        assert_eq!(config.max_reconnect_attempts, 5);
        assert_eq!(config.stale_threshold_ms, 5_000);
        assert_eq!(config.sweep_interval_ms, 1_000);
        assert!(config.cursor_throttle_ms.is_none());
        assert_eq!(config.retry_policy(), RetryPolicy::default());
    }

    #[test]
    fn test_config_from_json_partial() {
        let config = SessionConfig::from_json(
            r#"{ "user_id": "u9", "max_reconnect_attempts": 2, "cursor_throttle_ms": 16 }"#,
        )
        .unwrap();
        assert_eq!(config.user_id.as_deref(), Some("u9"));
        assert_eq!(config.max_reconnect_attempts, 2);
        assert_eq!(config.cursor_throttle_ms, Some(16));
        assert_eq!(config.reconnect_interval_ms, 3_000);
        assert_eq!(config.username, "Anonymous");
    }

    #[test]
    fn test_config_rejects_invalid() {
        assert!(SessionConfig::from_json("{ nope").is_err());
        assert!(SessionConfig::from_json(r#"{ "sweep_interval_ms": 0 }"#).is_err());
        assert!(SessionConfig::from_json(r#"{ "user_id": "" }"#).is_err());
        assert!(SessionConfig::from_json(r#"{ "stale_threshold_ms": 9223372036854775808 }"#).is_err());
        assert!(SessionConfig::from_json(r#"{ "stale_threshold_ms": 9223372036854775807 }"#).is_ok());

        let huge = SessionConfig {
            stale_threshold_ms: u64::MAX,
            ..SessionConfig::default()
        };
        assert!(matches!(
            SyncSession::with_transport(huge, Arc::new(NullTransport)),
            Err(SessionError::Config(_))
        ));
    }

    #[test]
    fn test_cursor_throttle_saturates() {
        let config = SessionConfig::default().with_cursor_throttle(Duration::MAX);
        assert_eq!(config.cursor_throttle_ms, Some(u64::MAX));
        let config = SessionConfig::default().with_cursor_throttle(Duration::from_millis(16));
        assert_eq!(config.cursor_throttle_ms, Some(16));
    }

    #[test]
    fn test_generated_identity() {
        let session =
            SyncSession::with_transport(SessionConfig::default(), Arc::new(NullTransport)).unwrap();
        assert!(Uuid::parse_str(session.user_id()).is_ok());
        assert_eq!(session.profile().color, color_for(session.user_id()));
    }

    #[tokio::test]
    async fn test_connect_offline_and_disconnect() {
        let session = offline_session("u1");
        let changes = record(&session, SessionEvent::CONNECTION_CHANGED);

        session.connect("null://", "room", "").await.unwrap();
        assert_eq!(session.connection_state(), ChannelState::Open);

        session.disconnect();
        assert_eq!(session.connection_state(), ChannelState::Closed);
        assert_eq!(
            *lock(&changes),
            vec![
                SessionEvent::ConnectionChanged(ChannelState::Connecting),
                SessionEvent::ConnectionChanged(ChannelState::Open),
                SessionEvent::ConnectionChanged(ChannelState::Closed),
            ]
        );
    }

    #[tokio::test]
    async fn test_own_messages_filtered() {
        let session = offline_session("u1");
        session.connect("null://", "room", "").await.unwrap();
        let cursors = record(&session, SessionEvent::CURSOR_MOVED);

        inject(&session, Message::cursor_moved("u1", Cursor::new(1.0, 1.0)));
        assert!(lock(&cursors).is_empty());
        assert!(session.get_presence().is_empty());

        inject(&session, Message::cursor_moved("u2", Cursor::new(3.0, 4.0)));
        assert_eq!(
            *lock(&cursors),
            vec![SessionEvent::CursorMoved {
                user_id: "u2".into(),
                cursor: Cursor::new(3.0, 4.0),
            }]
        );
        let presence = session.get_presence();
        assert_eq!(presence.len(), 1);
        assert_eq!(presence[0].cursor, Some(Cursor::new(3.0, 4.0)));
    }

    #[tokio::test]
    async fn test_join_and_leave_update_presence() {
        let session = offline_session("u1");
        session.connect("null://", "room", "").await.unwrap();
        let joined = record(&session, SessionEvent::USER_JOINED);
        let left = record(&session, SessionEvent::USER_LEFT);

        let profile = Profile {
            username: "Bob".into(),
            color: "#00ff00".into(),
        };
        inject(&session, Message::user_joined("bob", profile));
        assert_eq!(lock(&joined).len(), 1);
        assert_eq!(session.get_presence()[0].username, "Bob");

        inject(&session, Message::user_left("bob"));
        assert_eq!(
            *lock(&left),
            vec![SessionEvent::UserLeft { user_id: "bob".into() }]
        );
        assert!(session.get_presence().is_empty());
    }

    #[tokio::test]
    async fn test_remote_state_merge() {
        let session = offline_session("u1");
        session.connect("null://", "room", "").await.unwrap();
        let updates = record(&session, SessionEvent::STATE_UPDATED);

        session.set("title", json!("mine"));
        assert_eq!(session.get_version(), 1);

        // Tie: local wins, nothing emitted.
        let mut tie = StateSnapshot::default();
        tie.state.insert("title".into(), json!("theirs"));
        tie.version = 1;
        inject(&session, Message::state_updated("u2", tie));
        assert_eq!(session.get_state()["title"], json!("mine"));
        assert!(lock(&updates).is_empty());

        let mut newer = StateSnapshot::default();
        newer.state.insert("other".into(), json!(7));
        newer.version = 5;
        newer.vector_clock.insert("u2".into(), 5);
        inject(&session, Message::state_updated("u2", newer.clone()));

        assert_eq!(session.get_version(), 5);
        assert_eq!(session.get_state(), newer.state);
        assert_eq!(*lock(&updates), vec![SessionEvent::StateUpdated(newer)]);
    }

    #[tokio::test]
    async fn test_update_state_counts_each_key() {
        let session = offline_session("u1");
        session.connect("null://", "room", "").await.unwrap();

        let mut partial = Document::new();
        partial.insert("a".into(), json!(1));
        partial.insert("b".into(), json!(2));
        let snapshot = session.update_state(partial);

        assert_eq!(snapshot.version, 2);
        assert_eq!(snapshot.vector_clock["u1"], 2);
        assert_eq!(session.update_state(Document::new()).version, 2);
    }

    #[tokio::test]
    async fn test_roster_excludes_self() {
        let session = offline_session("u1");
        session.connect("null://", "room", "").await.unwrap();
        let synced = record(&session, SessionEvent::PRESENCE_SYNCED);

        let users = vec![Presence::placeholder("u1"), Presence::placeholder("u2")];
        session
            .channel()
            .events()
            .emit(ChannelEvent::PRESENCE, &ChannelEvent::Presence(users));

        let presence = session.get_presence();
        assert_eq!(presence.len(), 1);
        assert_eq!(presence[0].user_id, "u2");
        assert_eq!(lock(&synced).len(), 1);
    }

    #[tokio::test]
    async fn test_cursor_unthrottled_by_default() {
        let session = offline_session("u1");
        session.connect("null://", "room", "").await.unwrap();
        assert!((0..10).all(|i| session.update_cursor(i as f64, 0.0)));
    }

    #[tokio::test]
    async fn test_cursor_throttle() {
        let config = SessionConfig::default()
            .with_user_id("u1")
            .with_cursor_throttle(Duration::from_secs(60));
        let session = SyncSession::with_transport(config, Arc::new(NullTransport)).unwrap();
        session.connect("null://", "room", "").await.unwrap();

        assert!(session.update_cursor(1.0, 1.0));
        assert!(!session.update_cursor(2.0, 2.0));
    }

    #[test]
    fn test_send_while_disconnected_is_dropped() {
        let session = offline_session("u1");
        assert!(!session.update_cursor(1.0, 1.0));
        // Local state still applies.
        assert_eq!(session.set("k", json!(true)).version, 1);
    }

    #[tokio::test]
    async fn test_sweep_evicts_and_announces() {
        let config = SessionConfig {
            user_id: Some("u1".into()),
            stale_threshold_ms: 30,
            sweep_interval_ms: 10,
            ..SessionConfig::default()
        };
        let session = SyncSession::with_transport(config, Arc::new(NullTransport)).unwrap();
        session.connect("null://", "room", "").await.unwrap();
        let left = record(&session, SessionEvent::USER_LEFT);

        inject(&session, Message::cursor_moved("u2", Cursor::new(0.0, 0.0)));
        assert_eq!(session.get_presence().len(), 1);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(session.get_presence().is_empty());
        assert_eq!(
            *lock(&left),
            vec![SessionEvent::UserLeft { user_id: "u2".into() }]
        );
    }

    #[tokio::test]
    async fn test_idle_peer_returns_with_its_profile() {
        let config = SessionConfig {
            user_id: Some("u1".into()),
            stale_threshold_ms: 30,
            sweep_interval_ms: 10,
            ..SessionConfig::default()
        };
        let session = SyncSession::with_transport(config, Arc::new(NullTransport)).unwrap();
        session.connect("null://", "room", "").await.unwrap();
        let left = record(&session, SessionEvent::USER_LEFT);

        let profile = Profile {
            username: "Bob".into(),
            color: "#00ff00".into(),
        };
        inject(&session, Message::user_joined("bob", profile));

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(session.get_presence().is_empty());
        assert_eq!(lock(&left).len(), 1);

        inject(&session, Message::cursor_moved("bob", Cursor::new(8.0, 9.0)));
        let presence = session.get_presence();
        assert_eq!(presence.len(), 1);
        assert_eq!(presence[0].username, "Bob");
        assert_eq!(presence[0].color, "#00ff00");
        assert_eq!(presence[0].cursor, Some(Cursor::new(8.0, 9.0)));
    }

    #[tokio::test]
    async fn test_disconnect_unwires_channel() {
        let session = offline_session("u1");
        session.connect("null://", "room", "").await.unwrap();
        assert_eq!(session.channel().events().handler_count(ChannelEvent::MESSAGE), 1);

        session.disconnect();
        assert_eq!(session.channel().events().handler_count(ChannelEvent::MESSAGE), 0);
    }
}
