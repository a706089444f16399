use std::sync::atomic::{AtomicBool, Ordering};

use uuid::Uuid;

use super::*;
use crate::ephemeral::EphemeralEvent;

fn tracker(ephemeral: &EphemeralStore, monitor: &ConnectionMonitor) -> PresenceTracker {
    PresenceTracker::new(
        Uuid::new_v4(),
        "Ada",
        "#D94B4B",
        ephemeral.clone(),
        monitor.clone(),
        Arc::new(MonotonicClock::new()),
    )
}

#[tokio::test]
async fn go_online_writes_record_then_arms_hook() {
    let ephemeral = EphemeralStore::new();
    let monitor = ConnectionMonitor::new(true);
    let tracker = tracker(&ephemeral, &monitor);
    let path = EphemeralPath::Presence(tracker_user(&tracker));

    assert_eq!(tracker.phase(), Phase::Offline);
    tracker.go_online().await;

    assert_eq!(tracker.phase(), Phase::Online);
    assert!(ephemeral.get(&path).is_some(), "existence of the record means online");
    assert!(ephemeral.armed_hooks(tracker_user(&tracker)).contains(&path));
}

#[tokio::test]
async fn go_online_waits_for_transport() {
    let ephemeral = EphemeralStore::new();
    let monitor = ConnectionMonitor::new(false);
    let tracker = Arc::new(tracker(&ephemeral, &monitor));

    let task = {
        let tracker = Arc::clone(&tracker);
        tokio::spawn(async move { tracker.go_online().await })
    };
    tokio::task::yield_now().await;
    assert_eq!(tracker.phase(), Phase::Connecting);
    assert!(ephemeral.get(&EphemeralPath::Presence(tracker_user(&tracker))).is_none());

    monitor.set_connected(true);
    task.await.unwrap();
    assert_eq!(tracker.phase(), Phase::Online);
}

#[tokio::test]
async fn sign_out_removes_owned_records_before_invalidation() {
    let ephemeral = EphemeralStore::new();
    let monitor = ConnectionMonitor::new(true);
    let tracker = tracker(&ephemeral, &monitor);
    tracker.go_online().await;

    let user = tracker_user(&tracker);
    let presence_path = EphemeralPath::Presence(user);
    let record_present_at_invalidation = Arc::new(AtomicBool::new(true));

    {
        let ephemeral = ephemeral.clone();
        let flag = Arc::clone(&record_present_at_invalidation);
        tracker.sign_out(move || {
            // By the time credentials die, the record must already be gone.
            flag.store(ephemeral.get(&presence_path).is_some(), Ordering::SeqCst);
        });
    }

    assert!(!record_present_at_invalidation.load(Ordering::SeqCst));
    assert_eq!(tracker.phase(), Phase::Offline);
}

#[tokio::test]
async fn disconnect_then_resume_rewrites_and_rearms() {
    let ephemeral = EphemeralStore::new();
    let monitor = ConnectionMonitor::new(true);
    let tracker = tracker(&ephemeral, &monitor);
    let user = tracker_user(&tracker);
    let path = EphemeralPath::Presence(user);
    let watcher = ephemeral.spawn_disconnect_watcher(user, &monitor);

    tracker.go_online().await;
    let mut rx = ephemeral.subscribe();

    // Network blip: hook fires, record goes away, hooks are cleared.
    monitor.set_connected(false);
    loop {
        if matches!(rx.recv().await.unwrap(), EphemeralEvent::Removed { path: p } if p == path) {
            break;
        }
    }
    tracker.mark_offline();
    assert!(ephemeral.armed_hooks(user).is_empty());

    // Reconnect: presence rewritten, hook re-armed.
    monitor.set_connected(true);
    tracker.resume().await;
    assert!(ephemeral.get(&path).is_some());
    assert!(ephemeral.armed_hooks(user).contains(&path));

    watcher.abort();
}

#[tokio::test]
async fn presence_keeper_cycles_across_reconnects() {
    let ephemeral = EphemeralStore::new();
    let monitor = ConnectionMonitor::new(true);
    let tracker = Arc::new(tracker(&ephemeral, &monitor));
    let user = tracker_user(&tracker);
    let path = EphemeralPath::Presence(user);

    let watcher = ephemeral.spawn_disconnect_watcher(user, &monitor);
    let keeper = spawn_presence_keeper(Arc::clone(&tracker));

    // First online edge.
    wait_for_record(&ephemeral, &path).await;

    // Drop and recover; the keeper must bring presence back on its own.
    let mut rx = ephemeral.subscribe();
    monitor.set_connected(false);
    loop {
        if matches!(rx.recv().await.unwrap(), EphemeralEvent::Removed { path: p } if p == path) {
            break;
        }
    }
    monitor.set_connected(true);
    wait_for_record(&ephemeral, &path).await;
    assert!(ephemeral.armed_hooks(user).contains(&path));

    keeper.abort();
    watcher.abort();
}

#[test]
fn pick_color_returns_palette_entries() {
    for _ in 0..20 {
        assert!(pick_color().starts_with('#'));
    }
}

fn tracker_user(tracker: &PresenceTracker) -> UserId {
    tracker.user_id()
}

async fn wait_for_record(ephemeral: &EphemeralStore, path: &EphemeralPath) {
    tokio::time::timeout(std::time::Duration::from_secs(1), async {
        let mut rx = ephemeral.subscribe();
        if ephemeral.get(path).is_some() {
            return;
        }
        loop {
            if matches!(rx.recv().await, Ok(EphemeralEvent::Updated { path: p, .. }) if p == *path) {
                return;
            }
        }
    })
    .await
    .expect("record should appear within bound");
}
