//! # tandem-collab: Real-time presence and state sync
//!
//! Keeps a group of users in one room aware of each other (who is there,
//! where their cursor is) and converged on one shared JSON document.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   JSON text frames   ┌──────────────┐
//! │ SyncSession  │ ◄──────────────────► │ RelayServer  │
//! │ (per user)   │      WebSocket       │ (per room    │
//! └──────┬───────┘                      │  fan-out)    │
//!        │                              └──────┬───────┘
//!        ├── Channel (reconnect, bounded)      │
//!        ├── PresenceRegistry + SweepTask      ▼
//!        ├── SharedState (whole-doc LWW)  BroadcastGroup
//!        └── EventBus<SessionEvent>       (roster + echo)
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: Message envelope, payloads, handshake and frame parsing
//! - [`bus`]: Named-event publish/subscribe with handler isolation
//! - [`presence`]: Remote-user registry and stale-entry sweep
//! - [`state`]: Versioned document with vector clock, newer-version-wins merge
//! - [`transport`]: Pluggable connection openers (WebSocket, null)
//! - [`channel`]: Reconnecting channel with fixed-interval bounded retry
//! - [`session`]: Composition root wiring all of the above
//! - [`broadcast`]: Room fan-out used by the relay
//! - [`relay`]: Reference relay endpoint

use std::sync::{Mutex, MutexGuard, PoisonError};

pub mod protocol;
pub mod bus;
pub mod presence;
pub mod state;
pub mod transport;
pub mod channel;
pub mod session;
pub mod broadcast;
pub mod relay;

// Re-exports for convenience
pub use protocol::{
    Cursor, Document, Frame, JoinHandshake, Message, MessageType, Payload, Profile,
    ProtocolError, StateSnapshot, UserId, VectorClock,
};
pub use bus::{EventBus, HandlerId};
pub use presence::{color_for, Presence, PresenceRegistry, SweepTask};
pub use state::SharedState;
pub use transport::{Link, NullTransport, RemoteEnd, Transport, WebSocketTransport};
pub use channel::{Channel, ChannelError, ChannelEvent, ChannelSender, ChannelState, RetryPolicy};
pub use session::{SessionConfig, SessionError, SessionEvent, SyncSession};
pub use broadcast::{BroadcastGroup, BroadcastStats, ConnectionId, RoomManager};
pub use relay::{RelayConfig, RelayError, RelayServer, RelayStats};

/// Lock a mutex, recovering the data if a previous holder panicked.
///
/// Bus handlers run under `catch_unwind`, so a panic must not wedge the
/// registries for every later caller.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
