//! Ephemeral broadcast store — overwrite-in-place state with disconnect hooks.
//!
//! DESIGN
//! ======
//! Transient per-gesture state (cursors, presence, selections, drag previews)
//! lives here: one current value per key, overwritten on every publish, never
//! versioned and never persisted. Subscribers receive an event per change via
//! a `tokio::sync::broadcast` channel.
//!
//! Each record is exclusively written by its owning user id, enforced by this
//! access layer rather than by client-side convention. A publish or remove by
//! any other writer is rejected.
//!
//! Disconnect hooks are armed per session: `register_auto_remove_on_disconnect`
//! waits for the session's transport to report connected before arming,
//! because a hook registered while disconnected is silently lost and leaves a
//! stale record forever. Firing a disconnect removes every armed path for the
//! session and clears its hooks — a reconnecting session must re-arm.

#[cfg(test)]
#[path = "ephemeral_test.rs"]
mod ephemeral_test;

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::connection::ConnectionMonitor;
use crate::entity::{EntityId, UserId};
use crate::error::ErrorCode;

// =============================================================================
// PATHS
// =============================================================================

/// Key for one ephemeral record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EphemeralPath {
    /// `cursors/{userId}`
    Cursor(UserId),
    /// `presence/{userId}` — existence of the record means the user is online.
    Presence(UserId),
    /// `dragging/{entityId}`
    Dragging(EntityId),
    /// `selections/{userId}`
    Selection(UserId),
}

impl fmt::Display for EphemeralPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cursor(id) => write!(f, "cursors/{id}"),
            Self::Presence(id) => write!(f, "presence/{id}"),
            Self::Dragging(id) => write!(f, "dragging/{id}"),
            Self::Selection(id) => write!(f, "selections/{id}"),
        }
    }
}

// =============================================================================
// RECORDS
// =============================================================================

/// A live cursor position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cursor {
    pub user_id: UserId,
    pub x: f64,
    pub y: f64,
    pub user_name: String,
    pub color: String,
    pub updated_at: i64,
}

/// Online marker. Removal signals offline; there is no separate boolean.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Presence {
    pub user_id: UserId,
    pub user_name: String,
    pub color: String,
    pub updated_at: i64,
}

/// In-progress transform of one entity during a drag gesture.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DragPreview {
    pub shape_id: EntityId,
    pub user_id: UserId,
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
    pub rotation: f64,
    pub updated_at: i64,
}

/// One user's current multi-select.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Selection {
    pub user_id: UserId,
    pub shape_ids: Vec<EntityId>,
    pub user_name: String,
    pub color: String,
    pub updated_at: i64,
}

/// Any ephemeral record value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EphemeralRecord {
    Cursor(Cursor),
    Presence(Presence),
    DragPreview(DragPreview),
    Selection(Selection),
}

impl EphemeralRecord {
    /// The user that exclusively owns (writes) this record.
    #[must_use]
    pub fn owner(&self) -> UserId {
        match self {
            Self::Cursor(c) => c.user_id,
            Self::Presence(p) => p.user_id,
            Self::DragPreview(d) => d.user_id,
            Self::Selection(s) => s.user_id,
        }
    }

    /// Whether this record value belongs under the given path.
    #[must_use]
    fn matches(&self, path: &EphemeralPath) -> bool {
        match (self, path) {
            (Self::Cursor(c), EphemeralPath::Cursor(id)) => c.user_id == *id,
            (Self::Presence(p), EphemeralPath::Presence(id)) => p.user_id == *id,
            (Self::DragPreview(d), EphemeralPath::Dragging(id)) => d.shape_id == *id,
            (Self::Selection(s), EphemeralPath::Selection(id)) => s.user_id == *id,
            _ => false,
        }
    }
}

// =============================================================================
// EVENTS & ERRORS
// =============================================================================

/// A change notification delivered to subscribers.
#[derive(Debug, Clone)]
pub enum EphemeralEvent {
    Updated { path: EphemeralPath, record: EphemeralRecord },
    Removed { path: EphemeralPath },
}

#[derive(Debug, thiserror::Error)]
pub enum EphemeralError {
    #[error("writer {writer} does not own {path}")]
    NotOwner { path: EphemeralPath, writer: UserId },
    #[error("record value does not belong under {path}")]
    PathMismatch { path: EphemeralPath },
}

impl ErrorCode for EphemeralError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::NotOwner { .. } => "E_NOT_OWNER",
            Self::PathMismatch { .. } => "E_PATH_MISMATCH",
        }
    }
}

// =============================================================================
// STORE
// =============================================================================

struct Inner {
    records: HashMap<EphemeralPath, EphemeralRecord>,
    /// Armed disconnect hooks: session user -> paths to remove on disconnect.
    hooks: HashMap<UserId, HashSet<EphemeralPath>>,
}

/// Very-low-latency, per-key-overwrite broadcast storage.
#[derive(Clone)]
pub struct EphemeralStore {
    inner: Arc<Mutex<Inner>>,
    tx: broadcast::Sender<EphemeralEvent>,
}

impl EphemeralStore {
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(1024);
        Self {
            inner: Arc::new(Mutex::new(Inner { records: HashMap::new(), hooks: HashMap::new() })),
            tx,
        }
    }

    /// Subscribe to every subsequent change.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<EphemeralEvent> {
        self.tx.subscribe()
    }

    /// Overwrite the record at `path`.
    ///
    /// # Errors
    ///
    /// `NotOwner` if `writer` is not the record's owning user, `PathMismatch`
    /// if the record value doesn't belong under `path`.
    pub fn publish(
        &self,
        writer: UserId,
        path: EphemeralPath,
        record: EphemeralRecord,
    ) -> Result<(), EphemeralError> {
        if !record.matches(&path) {
            return Err(EphemeralError::PathMismatch { path });
        }
        if record.owner() != writer {
            return Err(EphemeralError::NotOwner { path, writer });
        }
        {
            let mut inner = self.lock();
            inner.records.insert(path, record.clone());
        }
        let _ = self.tx.send(EphemeralEvent::Updated { path, record });
        Ok(())
    }

    /// Remove the record at `path`. Removing an absent path is a no-op.
    ///
    /// # Errors
    ///
    /// `NotOwner` if the present record is owned by someone else.
    pub fn remove(&self, writer: UserId, path: EphemeralPath) -> Result<(), EphemeralError> {
        let removed = {
            let mut inner = self.lock();
            match inner.records.get(&path) {
                Some(record) if record.owner() != writer => {
                    return Err(EphemeralError::NotOwner { path, writer });
                }
                Some(_) => {
                    inner.records.remove(&path);
                    true
                }
                None => false,
            }
        };
        if removed {
            let _ = self.tx.send(EphemeralEvent::Removed { path });
        }
        Ok(())
    }

    /// Current record at `path`, if any.
    #[must_use]
    pub fn get(&self, path: &EphemeralPath) -> Option<EphemeralRecord> {
        self.lock().records.get(path).cloned()
    }

    /// Snapshot of all current records.
    #[must_use]
    pub fn records(&self) -> HashMap<EphemeralPath, EphemeralRecord> {
        self.lock().records.clone()
    }

    /// Arm automatic removal of `path` when `session`'s transport drops.
    ///
    /// Waits for the session to report connected first: arming while
    /// disconnected is silently lost by the transport, which is exactly the
    /// stale-record race this method exists to prevent.
    pub async fn register_auto_remove_on_disconnect(
        &self,
        session: &ConnectionMonitor,
        session_user: UserId,
        path: EphemeralPath,
    ) {
        session.wait_until_connected().await;
        self.lock().hooks.entry(session_user).or_default().insert(path);
    }

    /// Paths currently armed for a session. Test/introspection aid.
    #[must_use]
    pub fn armed_hooks(&self, session_user: UserId) -> HashSet<EphemeralPath> {
        self.lock()
            .hooks
            .get(&session_user)
            .cloned()
            .unwrap_or_default()
    }

    /// Fire the armed hooks for a session: remove every armed path and forget
    /// the hooks. Called by the disconnect watcher, or directly in tests.
    pub fn fire_disconnect(&self, session_user: UserId) {
        let (paths, removed) = {
            let mut inner = self.lock();
            let paths = inner.hooks.remove(&session_user).unwrap_or_default();
            let mut removed = Vec::with_capacity(paths.len());
            for path in &paths {
                if inner.records.remove(path).is_some() {
                    removed.push(*path);
                }
            }
            (paths, removed)
        };
        debug!(user = %session_user, armed = paths.len(), removed = removed.len(), "disconnect hooks fired");
        for path in removed {
            let _ = self.tx.send(EphemeralEvent::Removed { path });
        }
    }

    /// Spawn a watcher that fires the session's disconnect hooks every time
    /// its connectivity drops. One watcher per session.
    pub fn spawn_disconnect_watcher(
        &self,
        session_user: UserId,
        monitor: &ConnectionMonitor,
    ) -> JoinHandle<()> {
        let store = self.clone();
        let mut rx = monitor.subscribe();
        tokio::spawn(async move {
            loop {
                if rx.changed().await.is_err() {
                    return;
                }
                if !*rx.borrow_and_update() {
                    store.fire_disconnect(session_user);
                }
            }
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl Default for EphemeralStore {
    fn default() -> Self {
        Self::new()
    }
}
