use uuid::Uuid;

use super::*;
use crate::entity::{Entity, EntityKind, EntityPatch};
use crate::error::ErrorCode;

fn rect() -> Entity {
    let mut e = Entity::new(EntityKind::Rect, 0.0, 0.0, 100.0, 80.0, "#D94B4B");
    e.updated_at = 1;
    e
}

#[tokio::test]
async fn empty_batch_is_a_no_op() {
    let store = EntityStore::new();
    let mut rx = store.subscribe();
    run_batch(&store, &[], 500).await.unwrap();
    assert!(matches!(rx.try_recv(), Err(tokio::sync::broadcast::error::TryRecvError::Empty)));
}

#[tokio::test]
async fn oversize_batch_chunks_sequentially() {
    let store = EntityStore::new();
    let mut rx = store.subscribe();

    let ops: Vec<BatchOp> = (0..25).map(|_| BatchOp::Create(rect())).collect();
    run_batch(&store, &ops, 10).await.unwrap();

    // 25 ops at chunk size 10 -> exactly 3 snapshot transitions.
    assert_eq!(rx.recv().await.unwrap().len(), 10);
    assert_eq!(rx.recv().await.unwrap().len(), 20);
    assert_eq!(rx.recv().await.unwrap().len(), 25);
    assert!(matches!(rx.try_recv(), Err(tokio::sync::broadcast::error::TryRecvError::Empty)));
}

#[tokio::test]
async fn failure_reports_exact_chunk() {
    let store = EntityStore::new();

    let mut ops: Vec<BatchOp> = (0..10).map(|_| BatchOp::Create(rect())).collect();
    // Poison the second chunk (index 1) with an update against a missing id.
    ops.insert(
        7,
        BatchOp::Update(Uuid::new_v4(), EntityPatch::new(Uuid::new_v4(), 1)),
    );

    let err = run_batch(&store, &ops, 5).await.unwrap_err();
    let BatchError::ChunkFailed { chunk, total, source } = err;
    assert_eq!(chunk, 1);
    assert_eq!(total, 3);
    assert!(matches!(source, StoreError::NotFound(_)));

    // Chunk 0 committed; the failed chunk applied nothing.
    assert_eq!(store.snapshot().await.len(), 5);
}

#[tokio::test]
async fn chunk_errors_inherit_retryability() {
    let store = EntityStore::new();
    store.set_available(false);
    let err = run_batch(&store, &[BatchOp::Create(rect())], 500)
        .await
        .unwrap_err();
    assert!(err.retryable());
}

#[test]
fn chunk_range_maps_back_to_ops() {
    assert_eq!(chunk_range(0, 5, 12), 0..5);
    assert_eq!(chunk_range(1, 5, 12), 5..10);
    assert_eq!(chunk_range(2, 5, 12), 10..12);
}
