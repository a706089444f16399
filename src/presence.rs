//! Presence and liveness tracking — the online/offline lifecycle per user.
//!
//! DESIGN
//! ======
//! An explicit state machine, `Connecting -> Online -> Offline`, gated on the
//! connection monitor. Going online waits for the transport, writes the
//! presence record, and only then arms auto-remove-on-disconnect: arming
//! before the write is wasted effort if the write never lands.
//!
//! Signing out removes the presence record (and the user's other owned
//! ephemeral records) BEFORE invalidating credentials, because removal runs
//! in the credential context — removing after invalidation is rejected by
//! the transport.
//!
//! Involuntary disconnects need no client participation: the armed hook
//! removes the record server-side. After a network blip the hook has already
//! fired and is gone, so the presence keeper rewrites the record and re-arms
//! on every reconnect.

#[cfg(test)]
#[path = "presence_test.rs"]
mod presence_test;

use std::sync::{Arc, Mutex};

use rand::Rng;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::connection::ConnectionMonitor;
use crate::entity::{MonotonicClock, UserId};
use crate::ephemeral::{EphemeralPath, EphemeralRecord, EphemeralStore, Presence};

/// Presence colors assigned to new users.
const PALETTE: [&str; 8] = [
    "#D94B4B", "#4B9BD9", "#4BD98A", "#D9B84B", "#9B4BD9", "#D94B9B", "#4BD9D9", "#8A6B4B",
];

/// Pick a presence color for a new user.
#[must_use]
pub fn pick_color() -> &'static str {
    PALETTE[rand::rng().random_range(0..PALETTE.len())]
}

/// Lifecycle phase of one user's presence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Connecting,
    Online,
    Offline,
}

/// Tracks one user's presence lifecycle on the ephemeral store.
pub struct PresenceTracker {
    user_id: UserId,
    user_name: String,
    color: String,
    ephemeral: EphemeralStore,
    monitor: ConnectionMonitor,
    clock: Arc<MonotonicClock>,
    phase: Mutex<Phase>,
}

impl PresenceTracker {
    #[must_use]
    pub fn new(
        user_id: UserId,
        user_name: impl Into<String>,
        color: impl Into<String>,
        ephemeral: EphemeralStore,
        monitor: ConnectionMonitor,
        clock: Arc<MonotonicClock>,
    ) -> Self {
        Self {
            user_id,
            user_name: user_name.into(),
            color: color.into(),
            ephemeral,
            monitor,
            clock,
            phase: Mutex::new(Phase::Offline),
        }
    }

    /// Current lifecycle phase.
    #[must_use]
    pub fn phase(&self) -> Phase {
        *self.lock_phase()
    }

    /// The tracked user.
    #[must_use]
    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    /// Drive the `Connecting -> Online` edge: wait for transport, write the
    /// presence record, then arm auto-remove-on-disconnect.
    pub async fn go_online(&self) {
        *self.lock_phase() = Phase::Connecting;
        self.monitor.wait_until_connected().await;

        let record = EphemeralRecord::Presence(Presence {
            user_id: self.user_id,
            user_name: self.user_name.clone(),
            color: self.color.clone(),
            updated_at: self.clock.next(),
        });
        let path = EphemeralPath::Presence(self.user_id);
        if let Err(e) = self.ephemeral.publish(self.user_id, path, record) {
            // Best-effort: presence is not correctness-critical.
            warn!(error = %e, user = %self.user_id, "presence write failed");
        }
        self.ephemeral
            .register_auto_remove_on_disconnect(&self.monitor, self.user_id, path)
            .await;

        *self.lock_phase() = Phase::Online;
        info!(user = %self.user_id, "presence online");
    }

    /// Rewrite presence and re-arm the hook after a reconnect. The previous
    /// hook already fired during the disconnect, so this is a fresh arm.
    pub async fn resume(&self) {
        self.go_online().await;
    }

    /// Explicit `Online -> Offline`: remove the user's owned ephemeral
    /// records, then run the credential-invalidation action. Removal happens
    /// first because it needs the still-valid credential context.
    pub fn sign_out(&self, invalidate_credentials: impl FnOnce()) {
        for path in [
            EphemeralPath::Cursor(self.user_id),
            EphemeralPath::Selection(self.user_id),
            EphemeralPath::Presence(self.user_id),
        ] {
            if let Err(e) = self.ephemeral.remove(self.user_id, path) {
                warn!(error = %e, %path, "ephemeral cleanup on sign-out failed");
            }
        }
        *self.lock_phase() = Phase::Offline;
        invalidate_credentials();
        info!(user = %self.user_id, "signed out");
    }

    /// Record an observed involuntary disconnect. The armed hook does the
    /// record removal; this only tracks the phase.
    pub fn mark_offline(&self) {
        *self.lock_phase() = Phase::Offline;
    }

    fn lock_phase(&self) -> std::sync::MutexGuard<'_, Phase> {
        self.phase
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// Spawn a task that keeps presence alive across reconnects: after every
/// transport drop it waits for recovery, rewrites the record, and re-arms
/// the disconnect hook. Idempotent per reconnect cycle.
pub fn spawn_presence_keeper(tracker: Arc<PresenceTracker>) -> JoinHandle<()> {
    let mut rx = tracker.monitor.subscribe();
    tokio::spawn(async move {
        loop {
            tracker.go_online().await;
            // Wait for the transport to drop before cycling.
            loop {
                if rx.changed().await.is_err() {
                    return;
                }
                if !*rx.borrow_and_update() {
                    tracker.mark_offline();
                    break;
                }
            }
        }
    })
}
