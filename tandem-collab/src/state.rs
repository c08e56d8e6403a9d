//! Whole-document last-writer-wins shared state.
//!
//! Local edits bump a scalar `version` and the editor's vector-clock entry.
//! A remote snapshot replaces document, version and clock together, and only
//! when its version is strictly greater; on a tie the local state stays.
//! Concurrent edits to different keys are not combined.

use serde_json::Value;

use crate::protocol::{Document, StateSnapshot, UserId, VectorClock};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SharedState {
    document: Document,
    version: u64,
    vector_clock: VectorClock,
}

impl SharedState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one local edit and return the new version.
    ///
    /// Nothing is broadcast; the caller sends the resulting snapshot.
    pub fn update(&mut self, key: impl Into<String>, value: Value, user_id: &str) -> u64 {
        self.document.insert(key.into(), value);
        self.version += 1;
        *self.vector_clock.entry(UserId::from(user_id)).or_insert(0) += 1;
        self.version
    }

    /// Replace everything with the remote snapshot if `remote_version > version`.
    ///
    /// Returns whether local state was replaced.
    pub fn merge(
        &mut self,
        remote_document: Document,
        remote_version: u64,
        remote_vector_clock: VectorClock,
    ) -> bool {
        if remote_version <= self.version {
            return false;
        }
        self.document = remote_document;
        self.version = remote_version;
        self.vector_clock = remote_vector_clock;
        true
    }

    pub fn merge_snapshot(&mut self, snapshot: StateSnapshot) -> bool {
        self.merge(snapshot.state, snapshot.version, snapshot.vector_clock)
    }

    pub fn document(&self) -> Document {
        self.document.clone()
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.document.get(key).cloned()
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn vector_clock(&self) -> VectorClock {
        self.vector_clock.clone()
    }

    /// Number of local edits attributed to `user_id`.
    pub fn clock_for(&self, user_id: &str) -> u64 {
        self.vector_clock.get(user_id).copied().unwrap_or(0)
    }

    pub fn snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            state: self.document.clone(),
            version: self.version,
            vector_clock: self.vector_clock.clone(),
        }
    }
}
