//! Connection state monitor.
//!
//! DESIGN
//! ======
//! A boolean connectivity observable over a `tokio::sync::watch` channel. The
//! transport (or a test) drives `set_connected`; everything that arms
//! disconnect-triggered cleanup gates on `wait_until_connected` first, because
//! hooks registered while disconnected are silently lost by the transport.

use std::sync::Arc;

use tokio::sync::watch;

/// Observable connectivity state for one client's transport link.
#[derive(Clone)]
pub struct ConnectionMonitor {
    tx: Arc<watch::Sender<bool>>,
}

impl ConnectionMonitor {
    /// Create a monitor with the given initial state.
    #[must_use]
    pub fn new(connected: bool) -> Self {
        let (tx, _rx) = watch::channel(connected);
        Self { tx: Arc::new(tx) }
    }

    /// Current connectivity.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        *self.tx.borrow()
    }

    /// Report a transport state change. Idempotent.
    pub fn set_connected(&self, connected: bool) {
        self.tx.send_if_modified(|state| {
            let changed = *state != connected;
            *state = connected;
            changed
        });
    }

    /// Subscribe to connectivity transitions.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    /// Resolve once the transport reports connected. Returns immediately if
    /// already connected.
    pub async fn wait_until_connected(&self) {
        let mut rx = self.tx.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

impl Default for ConnectionMonitor {
    fn default() -> Self {
        Self::new(false)
    }
}

// =============================================================================
// TESTS
// =============================================================================
