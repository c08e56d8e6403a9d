//! Reconnecting message channel.
//!
//! ```text
//! Closed ──connect()──► Connecting ──open──► Open
//!                            │                 │ unexpected drop
//!                            │ initial failure ▼
//!                            ▼           Reconnecting ──sleep(interval)──► Connecting
//!                         Closed               ▲                               │
//!                                              └──── open failed ──────────────┤
//!                                                                              │ attempts exhausted
//!                                                                              ▼
//!                                                                           Failed
//! ```
//!
//! The retry interval is fixed, attempts are bounded by
//! [`RetryPolicy::max_attempts`], and the counter resets only when a
//! connection opens. `Failed` is left only through [`Channel::reconnect`] or
//! [`Channel::connect`]. [`Channel::close`] cancels any pending retry before
//! it returns.
//!
//! Every connection attempt belongs to a generation. `connect` and `close`
//! start a new generation; a supervisor that finds its generation superseded
//! stops without touching state.

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::bus::EventBus;
use crate::lock;
use crate::presence::Presence;
use crate::protocol::{Frame, JoinHandshake, Message, ProtocolError, UserId};
use crate::transport::{Link, Transport};

/// Channel connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Closed,
    Connecting,
    Open,
    Reconnecting,
    /// Retries exhausted; waits for an explicit reconnect
    Failed,
}

/// Fixed-interval, bounded reconnection policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(3_000),
            max_attempts: 5,
        }
    }
}

/// Events published on the channel's bus.
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    /// Parsed message envelope
    Message(Message),
    /// Authoritative roster pushed by the endpoint
    Presence(Vec<Presence>),
    StateChanged(ChannelState),
    /// Non-fatal failure (reconnect attempt, malformed frame)
    Error(String),
}

impl ChannelEvent {
    pub const MESSAGE: &'static str = "message";
    pub const PRESENCE: &'static str = "presence";
    pub const STATE: &'static str = "state";
    pub const ERROR: &'static str = "error";

    pub fn name(&self) -> &'static str {
        match self {
            ChannelEvent::Message(_) => Self::MESSAGE,
            ChannelEvent::Presence(_) => Self::PRESENCE,
            ChannelEvent::StateChanged(_) => Self::STATE,
            ChannelEvent::Error(_) => Self::ERROR,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("failed to open {endpoint}: {reason}")]
    Open { endpoint: String, reason: String },
    #[error("join handshake could not be delivered")]
    Handshake,
    #[error("no endpoint to reconnect to; call connect first")]
    NoEndpoint,
    #[error("connection attempt superseded by close or a newer connect")]
    Cancelled,
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

#[derive(Debug, Clone)]
struct Target {
    endpoint: String,
    room_id: String,
    auth_token: String,
}

struct Inner {
    state: ChannelState,
    /// Reconnect attempts since the last successful open
    attempt: u32,
    generation: u64,
    outgoing: Option<mpsc::UnboundedSender<String>>,
    supervisor: Option<JoinHandle<()>>,
    target: Option<Target>,
}

struct Shared {
    user_id: UserId,
    transport: Arc<dyn Transport>,
    policy: RetryPolicy,
    events: Arc<EventBus<ChannelEvent>>,
    inner: Mutex<Inner>,
}

/// A single logical connection to a sync endpoint.
pub struct Channel {
    shared: Arc<Shared>,
}

impl Channel {
    pub fn new(user_id: impl Into<UserId>, transport: Arc<dyn Transport>, policy: RetryPolicy) -> Self {
        Self {
            shared: Arc::new(Shared {
                user_id: user_id.into(),
                transport,
                policy,
                events: Arc::new(EventBus::new()),
                inner: Mutex::new(Inner {
                    state: ChannelState::Closed,
                    attempt: 0,
                    generation: 0,
                    outgoing: None,
                    supervisor: None,
                    target: None,
                }),
            }),
        }
    }

    /// Open the transport and send the join handshake.
    ///
    /// A failure here is returned to the caller and is not retried.
    pub async fn connect(
        &self,
        endpoint: &str,
        room_id: &str,
        auth_token: &str,
    ) -> Result<(), ChannelError> {
        let target = Target {
            endpoint: endpoint.to_string(),
            room_id: room_id.to_string(),
            auth_token: auth_token.to_string(),
        };
        let generation = {
            let mut inner = lock(&self.shared.inner);
            inner.generation += 1;
            if let Some(handle) = inner.supervisor.take() {
                handle.abort();
            }
            inner.outgoing = None;
            inner.attempt = 0;
            inner.target = Some(target.clone());
            inner.generation
        };

        log::info!("Connecting to {} (room {})", target.endpoint, target.room_id);
        self.shared.set_state(generation, ChannelState::Connecting);

        let link = match self.shared.open_link(&target).await {
            Ok(link) => link,
            Err(e) => {
                log::warn!("Initial connection to {} failed: {e}", target.endpoint);
                self.shared.set_state(generation, ChannelState::Closed);
                return Err(e);
            }
        };

        if !Shared::install(&self.shared, generation, link) {
            return Err(ChannelError::Cancelled);
        }
        Ok(())
    }

    /// Restart from `Connecting` with the last endpoint, room and token.
    pub async fn reconnect(&self) -> Result<(), ChannelError> {
        let target = lock(&self.shared.inner)
            .target
            .clone()
            .ok_or(ChannelError::NoEndpoint)?;
        self.connect(&target.endpoint, &target.room_id, &target.auth_token)
            .await
    }

    /// Fire-and-forget send. Returns `false` if the message was dropped.
    pub fn send(&self, message: &Message) -> bool {
        self.shared.send(message)
    }

    /// Cancel any pending reconnect and tear down the connection. Idempotent.
    pub fn close(&self) {
        let previous = {
            let mut inner = lock(&self.shared.inner);
            inner.generation += 1;
            if let Some(handle) = inner.supervisor.take() {
                handle.abort();
            }
            inner.outgoing = None;
            inner.attempt = 0;
            std::mem::replace(&mut inner.state, ChannelState::Closed)
        };
        if previous != ChannelState::Closed {
            log::info!("Channel closed (was {previous:?})");
            self.shared
                .events
                .emit(ChannelEvent::STATE, &ChannelEvent::StateChanged(ChannelState::Closed));
        }
    }

    pub fn state(&self) -> ChannelState {
        lock(&self.shared.inner).state
    }

    /// Reconnect attempts since the last successful open.
    pub fn attempts(&self) -> u32 {
        lock(&self.shared.inner).attempt
    }

    pub fn events(&self) -> &Arc<EventBus<ChannelEvent>> {
        &self.shared.events
    }

    pub fn user_id(&self) -> &str {
        &self.shared.user_id
    }

    pub fn policy(&self) -> RetryPolicy {
        self.shared.policy
    }

    /// Send-only handle that does not keep the channel alive.
    pub fn sender(&self) -> ChannelSender {
        ChannelSender {
            shared: Arc::downgrade(&self.shared),
        }
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.close();
    }
}

/// Weak send handle, safe to capture in bus handlers.
#[derive(Clone)]
pub struct ChannelSender {
    shared: Weak<Shared>,
}

impl ChannelSender {
    pub fn send(&self, message: &Message) -> bool {
        match self.shared.upgrade() {
            Some(shared) => shared.send(message),
            None => false,
        }
    }
}

impl Shared {
    /// Transition if `generation` is still current. Emits on change.
    fn set_state(&self, generation: u64, state: ChannelState) -> bool {
        {
            let mut inner = lock(&self.inner);
            if inner.generation != generation {
                return false;
            }
            if inner.state == state {
                return true;
            }
            inner.state = state;
        }
        self.events
            .emit(ChannelEvent::STATE, &ChannelEvent::StateChanged(state));
        true
    }

    fn is_current(&self, generation: u64) -> bool {
        lock(&self.inner).generation == generation
    }

    async fn open_link(&self, target: &Target) -> Result<Link, ChannelError> {
        let link = self
            .transport
            .open(&target.endpoint, &target.auth_token)
            .await?;
        let handshake = JoinHandshake::new(target.room_id.clone(), self.user_id.clone()).encode()?;
        link.outgoing
            .send(handshake)
            .map_err(|_| ChannelError::Handshake)?;
        Ok(link)
    }

    /// Adopt a freshly opened link and start supervising it.
    ///
    /// `Open` is committed and published before the supervisor exists, so a
    /// link that drops at once can only move the channel on from `Open`.
    fn install(this: &Arc<Self>, generation: u64, link: Link) -> bool {
        let changed = {
            let mut inner = lock(&this.inner);
            if inner.generation != generation {
                return false;
            }
            inner.outgoing = Some(link.outgoing);
            inner.attempt = 0;
            std::mem::replace(&mut inner.state, ChannelState::Open) != ChannelState::Open
        };
        log::info!("Channel open for {}", this.user_id);
        if changed {
            this.events
                .emit(ChannelEvent::STATE, &ChannelEvent::StateChanged(ChannelState::Open));
        }

        let mut inner = lock(&this.inner);
        if inner.generation != generation {
            return false;
        }
        let supervisor = tokio::spawn(Self::supervise(this.clone(), generation, link.incoming));
        inner.supervisor = Some(supervisor);
        true
    }

    fn send(&self, message: &Message) -> bool {
        let text = match message.encode() {
            Ok(text) => text,
            Err(e) => {
                log::warn!("Dropping {} message: {e}", message.message_type());
                return false;
            }
        };

        let inner = lock(&self.inner);
        match (&inner.outgoing, inner.state) {
            (Some(tx), ChannelState::Open) => tx.send(text).is_ok(),
            (_, state) => {
                log::warn!(
                    "Dropping {} message: channel is {state:?}",
                    message.message_type()
                );
                false
            }
        }
    }

    fn dispatch(&self, text: &str) {
        match Frame::parse(text) {
            Ok(Frame::Message(message)) => {
                log::trace!("Inbound {} from {}", message.message_type(), message.user_id);
                self.events
                    .emit(ChannelEvent::MESSAGE, &ChannelEvent::Message(message));
            }
            Ok(Frame::Presence(users)) => {
                log::debug!("Inbound presence snapshot with {} users", users.len());
                self.events
                    .emit(ChannelEvent::PRESENCE, &ChannelEvent::Presence(users));
            }
            Err(e) => {
                log::warn!("Dropping malformed frame: {e}");
                self.events
                    .emit(ChannelEvent::ERROR, &ChannelEvent::Error(e.to_string()));
            }
        }
    }

    /// Reads frames until the link drops, then drives the retry cycle.
    async fn supervise(
        this: Arc<Self>,
        generation: u64,
        mut incoming: mpsc::UnboundedReceiver<String>,
    ) {
        loop {
            while let Some(text) = incoming.recv().await {
                if !this.is_current(generation) {
                    return;
                }
                this.dispatch(&text);
            }

            {
                let mut inner = lock(&this.inner);
                if inner.generation != generation {
                    return;
                }
                inner.outgoing = None;
            }
            log::warn!("Connection dropped; retrying every {:?}", this.policy.interval);

            match this.retry(generation).await {
                Some(next) => incoming = next,
                None => return,
            }
        }
    }

    /// Bounded fixed-interval reconnection. Returns the new inbound stream,
    /// or `None` once the generation is superseded or attempts run out.
    async fn retry(&self, generation: u64) -> Option<mpsc::UnboundedReceiver<String>> {
        if !self.set_state(generation, ChannelState::Reconnecting) {
            return None;
        }
        let max = self.policy.max_attempts;

        loop {
            let (attempt, target) = {
                let mut inner = lock(&self.inner);
                if inner.generation != generation {
                    return None;
                }
                if inner.attempt >= max {
                    break;
                }
                inner.attempt += 1;
                (inner.attempt, inner.target.clone()?)
            };

            tokio::time::sleep(self.policy.interval).await;
            if !self.set_state(generation, ChannelState::Connecting) {
                return None;
            }
            log::info!("Reconnect attempt {attempt}/{max} to {}", target.endpoint);

            match self.open_link(&target).await {
                Ok(link) => {
                    {
                        let mut inner = lock(&self.inner);
                        if inner.generation != generation {
                            return None;
                        }
                        inner.outgoing = Some(link.outgoing);
                        inner.attempt = 0;
                    }
                    self.set_state(generation, ChannelState::Open);
                    return Some(link.incoming);
                }
                Err(e) => {
                    log::warn!("Reconnect attempt {attempt}/{max} failed: {e}");
                    self.events
                        .emit(ChannelEvent::ERROR, &ChannelEvent::Error(e.to_string()));
                    if !self.set_state(generation, ChannelState::Reconnecting) {
                        return None;
                    }
                }
            }
        }

        log::error!("Giving up after {max} reconnect attempts");
        self.set_state(generation, ChannelState::Failed);
        None
    }
}
