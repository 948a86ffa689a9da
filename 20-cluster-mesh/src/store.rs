//! Replicated state shared by the whole cluster.
//!
//! The leader writes variables here; every write produces a full snapshot
//! that the dispatch loop hands to the broadcaster. Followers never merge:
//! a received snapshot replaces the local copy wholesale.
//!
//! Snapshots carry the leader's timestamp and the store records it, but a
//! snapshot older than the current one is still applied. Last arrival wins.

use std::sync::{PoisonError, RwLock};

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::debug;

use crate::message::{StateMap, StateSnapshot};

#[derive(Debug, Default)]
struct Inner {
    entries: StateMap,
    last_updated_at: u64,
}

/// Lock-guarded mapping of named variables.
///
/// A `RwLock` lets the playback side read concurrently while the dispatch
/// loop applies snapshots. The lock is never held across an await.
#[derive(Debug)]
pub struct ReplicatedStore {
    inner: RwLock<Inner>,
    changes: mpsc::Sender<StateSnapshot>,
}

impl ReplicatedStore {
    /// Creates an empty store and the receiving end of its change events.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<StateSnapshot>) {
        let (changes, rx) = mpsc::channel(capacity);
        let store = Self {
            inner: RwLock::new(Inner::default()),
            changes,
        };
        (store, rx)
    }

    /// Sets `key` and publishes the entire resulting mapping.
    ///
    /// Meant to be called by the leader only; nothing here enforces that.
    pub async fn write(&self, key: impl Into<String>, value: Value) {
        let snapshot = {
            let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
            inner.entries.insert(key.into(), value);
            let snapshot = StateSnapshot::new(inner.entries.clone());
            inner.last_updated_at = snapshot.taken_at;
            snapshot
        };

        if self.changes.send(snapshot).await.is_err() {
            debug!("state change dropped, dispatch loop is gone");
        }
    }

    pub fn read(&self, key: &str) -> Option<Value> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .get(key)
            .cloned()
    }

    /// Replaces the whole mapping with `snapshot`. Keys missing from the
    /// snapshot disappear.
    pub fn apply_snapshot(&self, snapshot: StateSnapshot) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        inner.entries = snapshot.entries;
        inner.last_updated_at = snapshot.taken_at;
    }

    pub fn snapshot(&self) -> StateSnapshot {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        StateSnapshot {
            taken_at: inner.last_updated_at,
            entries: inner.entries.clone(),
        }
    }

    /// Timestamp of the snapshot currently held, in unix milliseconds.
    pub fn last_updated_at(&self) -> u64 {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .last_updated_at
    }
}
