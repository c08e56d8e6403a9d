//! Presence registry: who is in the room and where their cursor is.
//!
//! ## Architecture
//!
//! ```text
//! user.joined / cursor.moved ──► PresenceRegistry::upsert()      (lastSeen = now)
//! presence snapshot          ──► PresenceRegistry::apply_snapshot() (full replace)
//! user.left                  ──► PresenceRegistry::remove()
//!                                        │
//!                      SweepTask (every sweep period)
//!                                        │
//!                                        ▼
//!                          sweep_stale(now, threshold)
//! ```
//!
//! Entries are only evicted by the sweep, never on read. The registry never
//! holds the local user.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::lock;
use crate::protocol::{now_ms, Cursor, Profile, UserId};

/// Default staleness threshold in milliseconds.
pub const DEFAULT_STALE_THRESHOLD_MS: i64 = 5_000;

/// One remote user's presence record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Presence {
    pub user_id: UserId,
    #[serde(default)]
    pub username: String,
    /// Display-only color, `#rrggbb`
    #[serde(default)]
    pub color: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<Cursor>,
    /// Epoch milliseconds of the last update
    #[serde(default)]
    pub last_seen: i64,
}

impl Presence {
    pub fn new(user_id: impl Into<UserId>, profile: Profile) -> Self {
        Self {
            user_id: user_id.into(),
            username: profile.username,
            color: profile.color,
            cursor: None,
            last_seen: 0,
        }
    }

    /// Entry for a user we only know from traffic (cursor before join).
    pub fn placeholder(user_id: impl Into<UserId>) -> Self {
        let user_id = user_id.into();
        let short: String = user_id.chars().take(8).collect();
        Self {
            username: format!("Peer-{short}"),
            color: color_for(&user_id),
            user_id,
            cursor: None,
            last_seen: 0,
        }
    }

    /// Whether `now - last_seen` exceeds the threshold.
    ///
    /// `last_seen` may come verbatim from a peer's roster, so the difference
    /// saturates instead of overflowing.
    pub fn is_stale(&self, now: i64, threshold_ms: i64) -> bool {
        now.saturating_sub(self.last_seen) > threshold_ms
    }
}

/// Stable `#rrggbb` color derived from a user id.
///
/// Hue comes from an FNV-1a hash of the id; saturation and lightness are
/// fixed so every cursor stays vivid.
pub fn color_for(user_id: &str) -> String {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in user_id.bytes() {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    let hue = (hash % 360) as f32 / 360.0;
    let (r, g, b) = hsl_to_rgb(hue, 0.7, 0.6);
    format!(
        "#{:02x}{:02x}{:02x}",
        (r * 255.0).round() as u8,
        (g * 255.0).round() as u8,
        (b * 255.0).round() as u8
    )
}

fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s == 0.0 {
        return (l, l, l);
    }

    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;

    (
        hue_to_rgb(p, q, h + 1.0 / 3.0),
        hue_to_rgb(p, q, h),
        hue_to_rgb(p, q, h - 1.0 / 3.0),
    )
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 { t += 1.0; }
    if t > 1.0 { t -= 1.0; }
    if t < 1.0 / 6.0 {
        return p + (q - p) * 6.0 * t;
    }
    if t < 1.0 / 2.0 {
        return q;
    }
    if t < 2.0 / 3.0 {
        return p + (q - p) * (2.0 / 3.0 - t) * 6.0;
    }
    p
}

/// Tracks every known remote user in a room, keyed by user id.
#[derive(Debug)]
pub struct PresenceRegistry {
    /// Our own identity; never stored.
    local_user_id: UserId,
    peers: HashMap<UserId, Presence>,
    /// Last profile seen per user, kept across stale evictions so an idle
    /// peer that moves again is reinstated under its own name.
    profiles: HashMap<UserId, Profile>,
}

impl PresenceRegistry {
    pub fn new(local_user_id: impl Into<UserId>) -> Self {
        Self {
            local_user_id: local_user_id.into(),
            peers: HashMap::new(),
            profiles: HashMap::new(),
        }
    }

    fn remember(&mut self, presence: &Presence) {
        self.profiles.insert(
            presence.user_id.clone(),
            Profile {
                username: presence.username.clone(),
                color: presence.color.clone(),
            },
        );
    }

    /// Replace every entry with an authoritative roster.
    ///
    /// Entries are installed verbatim, including their `last_seen`.
    pub fn apply_snapshot(&mut self, users: Vec<Presence>) {
        self.peers.clear();
        for user in users {
            if user.user_id == self.local_user_id {
                continue;
            }
            self.remember(&user);
            self.peers.insert(user.user_id.clone(), user);
        }
    }

    /// Insert or overwrite, stamping `last_seen` with the current time.
    pub fn upsert(&mut self, presence: Presence) -> Option<Presence> {
        self.upsert_at(presence, now_ms())
    }

    /// Insert or overwrite, stamping `last_seen = now`.
    ///
    /// Returns the stored entry, or `None` for the local user.
    pub fn upsert_at(&mut self, mut presence: Presence, now: i64) -> Option<Presence> {
        if presence.user_id == self.local_user_id {
            return None;
        }
        presence.last_seen = now;
        self.remember(&presence);
        self.peers.insert(presence.user_id.clone(), presence.clone());
        Some(presence)
    }

    /// Record a cursor position, keeping the peer's known profile.
    ///
    /// A peer evicted as stale comes back with its remembered profile.
    /// Peers never seen before get a placeholder; they may have joined
    /// before us.
    pub fn record_cursor(&mut self, user_id: &str, cursor: Cursor, now: i64) -> Option<Presence> {
        let mut entry = match (self.peers.get(user_id), self.profiles.get(user_id)) {
            (Some(current), _) => current.clone(),
            (None, Some(profile)) => Presence::new(user_id, profile.clone()),
            (None, None) => Presence::placeholder(user_id),
        };
        entry.cursor = Some(cursor);
        self.upsert_at(entry, now)
    }

    /// Explicit departure; the remembered profile goes too.
    pub fn remove(&mut self, user_id: &str) -> Option<Presence> {
        self.profiles.remove(user_id);
        self.peers.remove(user_id)
    }

    /// Remove entries with `now - last_seen > threshold_ms`.
    ///
    /// Returns the evicted user ids, sorted. Their profiles stay remembered.
    pub fn sweep_stale(&mut self, now: i64, threshold_ms: i64) -> Vec<UserId> {
        let mut stale: Vec<UserId> = self
            .peers
            .values()
            .filter(|p| p.is_stale(now, threshold_ms))
            .map(|p| p.user_id.clone())
            .collect();
        stale.sort();

        for id in &stale {
            self.peers.remove(id);
        }

        stale
    }

    /// Copy of every entry, ordered by user id.
    pub fn snapshot(&self) -> Vec<Presence> {
        let mut users: Vec<Presence> = self.peers.values().cloned().collect();
        users.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        users
    }

    pub fn get(&self, user_id: &str) -> Option<Presence> {
        self.peers.get(user_id).cloned()
    }

    pub fn contains(&self, user_id: &str) -> bool {
        self.peers.contains_key(user_id)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn local_user_id(&self) -> &str {
        &self.local_user_id
    }
}

/// Periodic stale-presence sweep.
///
/// Aborted on [`SweepTask::stop`] or drop, so a session never leaks its timer.
pub struct SweepTask {
    handle: JoinHandle<()>,
}

impl SweepTask {
    /// Spawn the sweep on the current tokio runtime.
    ///
    /// `on_evict` runs after each sweep that removed at least one entry,
    /// with the registry lock already released.
    pub fn spawn<F>(
        registry: Arc<Mutex<PresenceRegistry>>,
        period: Duration,
        threshold_ms: i64,
        on_evict: F,
    ) -> Self
    where
        F: Fn(Vec<UserId>) + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // First tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let evicted = lock(&registry).sweep_stale(now_ms(), threshold_ms);
                if !evicted.is_empty() {
                    log::debug!("Evicted {} stale presence entries: {:?}", evicted.len(), evicted);
                    on_evict(evicted);
                }
            }
        });
        Self { handle }
    }

    pub fn stop(&self) {
        self.handle.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for SweepTask {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
