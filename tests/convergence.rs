//! End-to-end convergence: multiple clients sharing the two stores must agree.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use syncboard::config::Config;
use syncboard::entity::{Entity, EntityId, EntityKind, EntityPatch};
use syncboard::ephemeral::{EphemeralPath, EphemeralRecord};
use syncboard::presence::{PresenceTracker, pick_color};
use syncboard::{ConnectionMonitor, EntityStore, EphemeralStore, SyncClient, spawn_sync_worker};

const SETTLE: Duration = Duration::from_secs(1);

struct Session {
    client: Arc<SyncClient>,
    monitor: ConnectionMonitor,
    worker: tokio::task::JoinHandle<()>,
}

impl Session {
    fn join(store: &EntityStore, ephemeral: &EphemeralStore, name: &str) -> Self {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        let monitor = ConnectionMonitor::new(true);
        let client = Arc::new(SyncClient::new(
            Uuid::new_v4(),
            name,
            pick_color(),
            store.clone(),
            ephemeral.clone(),
            monitor.clone(),
            Config::default(),
        ));
        let worker = spawn_sync_worker(Arc::clone(&client));
        Session { client, monitor, worker }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.worker.abort();
    }
}

fn rect_at(x: f64, y: f64) -> Entity {
    Entity::new(EntityKind::Rect, x, y, 100.0, 80.0, "#4B9BD9")
}

/// Poll until `check` passes or the settle bound expires.
async fn converges<F, Fut>(what: &str, check: F)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    tokio::time::timeout(SETTLE, async {
        loop {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("did not converge within bound: {what}"));
}

#[tokio::test]
async fn create_propagates_between_clients() {
    let store = EntityStore::new();
    let ephemeral = EphemeralStore::new();
    let alice = Session::join(&store, &ephemeral, "Alice");
    let bob = Session::join(&store, &ephemeral, "Bob");

    let created = alice.client.create(rect_at(10.0, 10.0)).await.unwrap();

    let observer = Arc::clone(&bob.client);
    converges("bob sees alice's create", move || {
        let observer = Arc::clone(&observer);
        async move { observer.entity(created.id).await.is_some() }
    })
    .await;
}

#[tokio::test]
async fn delete_propagates_between_clients() {
    let store = EntityStore::new();
    let ephemeral = EphemeralStore::new();
    let alice = Session::join(&store, &ephemeral, "Alice");
    let bob = Session::join(&store, &ephemeral, "Bob");

    let created = alice.client.create(rect_at(10.0, 10.0)).await.unwrap();
    let observer = Arc::clone(&bob.client);
    let id = created.id;
    converges("bob sees the create", move || {
        let observer = Arc::clone(&observer);
        async move { observer.entity(id).await.is_some() }
    })
    .await;

    bob.client.delete(id).await.unwrap();

    let observer = Arc::clone(&alice.client);
    converges("alice sees bob's delete", move || {
        let observer = Arc::clone(&observer);
        async move { observer.entity(id).await.is_none() }
    })
    .await;
}

#[tokio::test]
async fn disjoint_field_edits_both_land() {
    let store = EntityStore::new();
    let ephemeral = EphemeralStore::new();
    let alice = Session::join(&store, &ephemeral, "Alice");
    let bob = Session::join(&store, &ephemeral, "Bob");

    let created = alice.client.create(rect_at(10.0, 10.0)).await.unwrap();
    let id = created.id;
    let observer = Arc::clone(&bob.client);
    converges("bob sees the entity", move || {
        let observer = Arc::clone(&observer);
        async move { observer.entity(id).await.is_some() }
    })
    .await;

    // Concurrent edits of different fields serialize through the store in
    // some order; sparse patches mean neither clobbers the other's field.
    let reposition = EntityPatch { x: Some(500.0), ..EntityPatch::new(Uuid::nil(), 0) };
    bob.client.update(id, reposition).await.unwrap();
    let fill = EntityPatch { fill: Some("#D94B4B".into()), ..EntityPatch::new(Uuid::nil(), 0) };
    alice.client.update(id, fill).await.unwrap();

    // Both fields land on both clients: field-level merge, no clobbering.
    for session in [&alice, &bob] {
        let observer = Arc::clone(&session.client);
        converges("disjoint edits merged", move || {
            let observer = Arc::clone(&observer);
            async move {
                observer
                    .entity(id)
                    .await
                    .is_some_and(|e| e.fill == "#D94B4B" && e.x == 500.0)
            }
        })
        .await;
    }
}

#[tokio::test]
async fn same_field_conflict_has_one_winner() {
    let store = EntityStore::new();
    let ephemeral = EphemeralStore::new();
    let alice = Session::join(&store, &ephemeral, "Alice");
    let bob = Session::join(&store, &ephemeral, "Bob");

    let created = alice.client.create(rect_at(10.0, 10.0)).await.unwrap();
    let id = created.id;
    let observer = Arc::clone(&bob.client);
    converges("bob sees the entity", move || {
        let observer = Arc::clone(&observer);
        async move { observer.entity(id).await.is_some() }
    })
    .await;

    let a_move = EntityPatch { x: Some(500.0), ..EntityPatch::new(Uuid::nil(), 0) };
    let b_move = EntityPatch { x: Some(-500.0), ..EntityPatch::new(Uuid::nil(), 0) };
    // One of the two may lose outright as a stale write; that is fine.
    let (a, b) = tokio::join!(alice.client.update(id, a_move), bob.client.update(id, b_move));
    assert!(a.is_ok() || b.is_ok());

    // Whoever won, everyone converges on exactly one of the two values.
    let authoritative = store.get(id).await.unwrap();
    assert!(
        authoritative.x == 500.0 || authoritative.x == -500.0,
        "winner must be one write in full, got x={}",
        authoritative.x
    );
    for session in [&alice, &bob] {
        let observer = Arc::clone(&session.client);
        let want = authoritative.x;
        converges("same-field conflict settled", move || {
            let observer = Arc::clone(&observer);
            async move { observer.entity(id).await.is_some_and(|e| e.x == want) }
        })
        .await;
    }
}

#[tokio::test]
async fn bulk_paste_is_one_transition_for_observers() {
    let store = EntityStore::new();
    let ephemeral = EphemeralStore::new();
    let alice = Session::join(&store, &ephemeral, "Alice");
    let _bob = Session::join(&store, &ephemeral, "Bob");

    let mut rx = store.subscribe();
    let batch: Vec<Entity> = (0..50).map(|i| rect_at(f64::from(i) * 10.0, 0.0)).collect();
    alice.client.batch_create(batch).await.unwrap();

    let snapshot = rx.recv().await.unwrap();
    assert_eq!(snapshot.len(), 50);
    assert!(rx.try_recv().is_err(), "one paste, one snapshot");
}

#[tokio::test]
async fn no_ghost_objects_for_the_creator() {
    let store = EntityStore::new();
    let ephemeral = EphemeralStore::new();
    let alice = Session::join(&store, &ephemeral, "Alice");
    let bob = Session::join(&store, &ephemeral, "Bob");

    let created = alice.client.create(rect_at(10.0, 10.0)).await.unwrap();
    let id = created.id;
    let observer = Arc::clone(&bob.client);
    converges("bob sees the entity", move || {
        let observer = Arc::clone(&observer);
        async move { observer.entity(id).await.is_some() }
    })
    .await;

    // Bob deletes an entity Alice authored. Alice must not keep a private copy.
    bob.client.delete(id).await.unwrap();
    let creator = Arc::clone(&alice.client);
    converges("creator drops own deleted entity", move || {
        let creator = Arc::clone(&creator);
        async move { creator.entity(id).await.is_none() }
    })
    .await;
}

#[tokio::test]
async fn disconnect_cleans_up_ephemeral_state() {
    let store = EntityStore::new();
    let ephemeral = EphemeralStore::new();
    let alice = Session::join(&store, &ephemeral, "Alice");
    let user = alice.client.user_id();

    let tracker = PresenceTracker::new(
        user,
        "Alice",
        pick_color(),
        ephemeral.clone(),
        alice.monitor.clone(),
        alice.client.clock(),
    );
    let watcher = ephemeral.spawn_disconnect_watcher(user, &alice.monitor);
    tracker.go_online().await;
    ephemeral
        .register_auto_remove_on_disconnect(&alice.monitor, user, EphemeralPath::Cursor(user))
        .await;
    alice.client.publish_cursor(3.0, 4.0);

    assert!(ephemeral.get(&EphemeralPath::Presence(user)).is_some());
    assert!(ephemeral.get(&EphemeralPath::Cursor(user)).is_some());

    // Crash, not sign-out: no client code runs after this.
    alice.monitor.set_connected(false);

    converges("presence and cursor removed", || async {
        ephemeral.get(&EphemeralPath::Presence(user)).is_none()
            && ephemeral.get(&EphemeralPath::Cursor(user)).is_none()
    })
    .await;
    watcher.abort();
}

#[tokio::test]
async fn cursor_broadcasts_reach_other_clients_live() {
    let store = EntityStore::new();
    let ephemeral = EphemeralStore::new();
    let alice = Session::join(&store, &ephemeral, "Alice");
    let _bob = Session::join(&store, &ephemeral, "Bob");

    let mut rx = ephemeral.subscribe();
    alice.client.publish_cursor(42.0, 7.0);

    let event = tokio::time::timeout(SETTLE, rx.recv()).await.unwrap().unwrap();
    match event {
        syncboard::ephemeral::EphemeralEvent::Updated { path, record } => {
            assert_eq!(path, EphemeralPath::Cursor(alice.client.user_id()));
            let EphemeralRecord::Cursor(cursor) = record else {
                panic!("expected a cursor record");
            };
            assert_eq!((cursor.x, cursor.y), (42.0, 7.0));
        }
        other => panic!("expected an update event, got {other:?}"),
    }
}

#[tokio::test]
async fn group_drag_converges_for_observers() {
    let store = EntityStore::new();
    let ephemeral = EphemeralStore::new();
    let alice = Session::join(&store, &ephemeral, "Alice");
    let bob = Session::join(&store, &ephemeral, "Bob");

    let anchor = alice.client.create(rect_at(0.0, 0.0)).await.unwrap();
    let other = alice.client.create(rect_at(30.0, 20.0)).await.unwrap();
    alice.client.set_selection([anchor.id, other.id].into());

    alice.client.begin_drag(anchor.id).await.unwrap();
    alice.client.drag_to(100.0, 100.0).await.unwrap();
    alice.client.end_drag().await.unwrap();

    let observer = Arc::clone(&bob.client);
    converges("bob sees the committed group positions", move || {
        let observer = Arc::clone(&observer);
        async move {
            let entities: HashMap<EntityId, Entity> = observer.entities().await;
            let Some(a) = entities.get(&anchor.id) else { return false };
            let Some(o) = entities.get(&other.id) else { return false };
            (a.x, a.y) == (100.0, 100.0) && (o.x, o.y) == (130.0, 120.0)
        }
    })
    .await;
}
