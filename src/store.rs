//! Persistent entity store — the authoritative source of truth.
//!
//! DESIGN
//! ======
//! Entities live in memory behind an `RwLock` map; every committed change
//! emits the full current entity set to subscribers exactly once, so a batch
//! of K operations is one observable state transition, not K. Existence is
//! defined solely by presence in the latest snapshot.
//!
//! Conflict policy is last-write-wins per write, decided by `updated_at`: a
//! patch older than the stored entity is fully discarded with `StaleWrite`.
//! Two concurrent moves of one entity therefore never vector-sum; the loser
//! is dropped. That is intentional, documented behavior, not a bug to fix.
//!
//! ERROR HANDLING
//! ==============
//! An update against a nonexistent id fails with `NotFound` instead of
//! creating anything — an update racing a delete must never resurrect a
//! partial "zombie" entity with only the patched fields populated. Writes
//! while the transport is down fail `Unavailable`, which is the only
//! retryable error.

#[cfg(test)]
#[path = "store_test.rs"]
mod store_test;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{RwLock, broadcast};

use crate::entity::{Entity, EntityId, EntityPatch, ValidationError};
use crate::error::ErrorCode;

/// Full entity set as delivered to subscribers.
pub type Snapshot = Arc<Vec<Entity>>;

// =============================================================================
// OPERATIONS & ERRORS
// =============================================================================

/// One operation inside an atomic transaction.
#[derive(Debug, Clone)]
pub enum BatchOp {
    Create(Entity),
    Update(EntityId, EntityPatch),
    Delete(EntityId),
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("entity not found: {0}")]
    NotFound(EntityId),
    #[error("entity already exists: {0}")]
    AlreadyExists(EntityId),
    #[error("stale write for {id}: incoming {incoming} < current {current}")]
    StaleWrite { id: EntityId, incoming: i64, current: i64 },
    #[error("store unavailable")]
    Unavailable,
    #[error(transparent)]
    Invalid(#[from] ValidationError),
}

impl ErrorCode for StoreError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "E_ENTITY_NOT_FOUND",
            Self::AlreadyExists(_) => "E_ENTITY_EXISTS",
            Self::StaleWrite { .. } => "E_STALE_WRITE",
            Self::Unavailable => "E_UNAVAILABLE",
            Self::Invalid(e) => e.error_code(),
        }
    }

    fn retryable(&self) -> bool {
        matches!(self, Self::Unavailable)
    }
}

// =============================================================================
// STORE
// =============================================================================

/// Authoritative, queryable storage with full-snapshot subscription.
#[derive(Clone)]
pub struct EntityStore {
    entities: Arc<RwLock<HashMap<EntityId, Entity>>>,
    tx: broadcast::Sender<Snapshot>,
    available: Arc<AtomicBool>,
}

impl EntityStore {
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(256);
        Self {
            entities: Arc::new(RwLock::new(HashMap::new())),
            tx,
            available: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Subscribe to snapshots. Each committed change delivers the full
    /// current entity set exactly once.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Snapshot> {
        self.tx.subscribe()
    }

    /// Fetch the current full entity set.
    pub async fn snapshot(&self) -> Snapshot {
        let entities = self.entities.read().await;
        Arc::new(entities.values().cloned().collect())
    }

    /// Read one entity.
    pub async fn get(&self, id: EntityId) -> Option<Entity> {
        self.entities.read().await.get(&id).cloned()
    }

    /// Model transport availability for durable writes. While unavailable,
    /// every write fails `Unavailable`.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Create a new entity.
    ///
    /// # Errors
    ///
    /// `AlreadyExists` on duplicate id, `Invalid` on non-finite geometry,
    /// `Unavailable` while the transport is down.
    pub async fn create(&self, entity: Entity) -> Result<(), StoreError> {
        self.transact(&[BatchOp::Create(entity)]).await
    }

    /// Merge a sparse patch into an existing entity. Fields not present in
    /// the patch are untouched.
    ///
    /// # Errors
    ///
    /// `NotFound` if the id doesn't exist (a racing delete wins; the update
    /// must not resurrect the entity), `StaleWrite` if the patch timestamp is
    /// older than the stored one, `Invalid` / `Unavailable` as for `create`.
    pub async fn update(&self, id: EntityId, patch: EntityPatch) -> Result<(), StoreError> {
        self.transact(&[BatchOp::Update(id, patch)]).await
    }

    /// Delete an entity.
    ///
    /// # Errors
    ///
    /// `NotFound` if absent, `Unavailable` while the transport is down.
    pub async fn delete(&self, id: EntityId) -> Result<(), StoreError> {
        self.transact(&[BatchOp::Delete(id)]).await
    }

    /// Execute a group of operations as one atomic transaction: either every
    /// operation applies and subscribers observe a single snapshot
    /// transition, or none apply.
    ///
    /// # Errors
    ///
    /// The first failing operation's error; the store is unchanged.
    pub async fn apply_batch(&self, ops: &[BatchOp]) -> Result<(), StoreError> {
        self.transact(ops).await
    }

    async fn transact(&self, ops: &[BatchOp]) -> Result<(), StoreError> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable);
        }
        let mut entities = self.entities.write().await;

        // Stage on a copy so a mid-batch failure leaves the store untouched.
        let mut staged = entities.clone();
        for op in ops {
            apply_op(&mut staged, op)?;
        }
        *entities = staged;

        let snapshot: Snapshot = Arc::new(entities.values().cloned().collect());
        drop(entities);
        let _ = self.tx.send(snapshot);
        Ok(())
    }
}

impl Default for EntityStore {
    fn default() -> Self {
        Self::new()
    }
}

fn apply_op(entities: &mut HashMap<EntityId, Entity>, op: &BatchOp) -> Result<(), StoreError> {
    match op {
        BatchOp::Create(entity) => {
            entity.validate()?;
            if entities.contains_key(&entity.id) {
                return Err(StoreError::AlreadyExists(entity.id));
            }
            entities.insert(entity.id, entity.clone());
        }
        BatchOp::Update(id, patch) => {
            patch.validate()?;
            let entity = entities.get_mut(id).ok_or(StoreError::NotFound(*id))?;
            if patch.updated_at < entity.updated_at {
                return Err(StoreError::StaleWrite {
                    id: *id,
                    incoming: patch.updated_at,
                    current: entity.updated_at,
                });
            }
            entity.apply_patch(patch);
        }
        BatchOp::Delete(id) => {
            if entities.remove(id).is_none() {
                return Err(StoreError::NotFound(*id));
            }
        }
    }
    Ok(())
}
