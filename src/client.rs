//! Per-client session — optimistic writes, reconciliation, gestures.
//!
//! ARCHITECTURE
//! ============
//! One `SyncClient` per connected user. Clients never share memory; they
//! observe each other only through the entity store's snapshots and the
//! ephemeral store's events. Within a client, writes to the local entity
//! view serialize on one `RwLock` (the single-writer rule), while gesture
//! bookkeeping sits in short-lived mutexes that are never held across await.
//!
//! Durable writes are optimistic: the mutation lands in the local view
//! first, then flows to the store with bounded retry while the transport is
//! down. A write that ultimately fails is rolled back to the authoritative
//! value and surfaced — silently dropping it would leave an entity that
//! "comes back" inexplicably later.
//!
//! The write API is origin-blind on purpose: the rendering surface and the
//! command agent call the same methods and are indistinguishable here.

#[cfg(test)]
#[path = "client_test.rs"]
mod client_test;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{RwLock, broadcast};
use tokio::task::JoinHandle;
use tracing::{error, warn};

use crate::batch::{BatchError, chunk_range, run_batch};
use crate::config::Config;
use crate::connection::ConnectionMonitor;
use crate::entity::{Entity, EntityId, EntityPatch, MonotonicClock, UserId, ValidationError};
use crate::ephemeral::{
    Cursor, DragPreview, EphemeralPath, EphemeralRecord, EphemeralStore, Selection,
};
use crate::error::ErrorCode;
use crate::merge::{reconcile, sorted_entities};
use crate::store::{BatchOp, EntityStore, StoreError};
use crate::throttle::Throttle;
use crate::transform::GroupDrag;
use crate::viewport::{Rect, ViewportFilter};

// =============================================================================
// ERRORS
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Batch(#[from] BatchError),
    #[error(transparent)]
    Invalid(#[from] ValidationError),
    #[error("entity is locked: {0}")]
    Locked(EntityId),
    #[error("gesture anchor not found: {0}")]
    NoAnchor(EntityId),
    #[error("no active gesture")]
    NoGesture,
}

impl ErrorCode for ClientError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Store(e) => e.error_code(),
            Self::Batch(e) => e.error_code(),
            Self::Invalid(e) => e.error_code(),
            Self::Locked(_) => "E_LOCKED",
            Self::NoAnchor(_) => "E_NO_ANCHOR",
            Self::NoGesture => "E_NO_GESTURE",
        }
    }

    fn retryable(&self) -> bool {
        match self {
            Self::Store(e) => e.retryable(),
            Self::Batch(e) => e.retryable(),
            _ => false,
        }
    }
}

// =============================================================================
// CLIENT
// =============================================================================

/// One user's live session against the shared stores.
pub struct SyncClient {
    user_id: UserId,
    user_name: String,
    color: String,
    config: Config,
    store: EntityStore,
    ephemeral: EphemeralStore,
    monitor: ConnectionMonitor,
    clock: Arc<MonotonicClock>,
    /// Reconciled local view: authoritative snapshot + pending optimistic writes.
    entities: RwLock<HashMap<EntityId, Entity>>,
    /// Last authoritative snapshot as received, for rolling back failed writes.
    authoritative: RwLock<HashMap<EntityId, Entity>>,
    selection: Mutex<HashSet<EntityId>>,
    drag: Mutex<Option<GroupDrag>>,
    viewport: Mutex<ViewportFilter>,
    cursor_throttle: Throttle<UserId>,
    drag_throttle: Throttle<EntityId>,
}

impl SyncClient {
    #[must_use]
    pub fn new(
        user_id: UserId,
        user_name: impl Into<String>,
        color: impl Into<String>,
        store: EntityStore,
        ephemeral: EphemeralStore,
        monitor: ConnectionMonitor,
        config: Config,
    ) -> Self {
        Self {
            user_id,
            user_name: user_name.into(),
            color: color.into(),
            store,
            ephemeral,
            monitor,
            clock: Arc::new(MonotonicClock::new()),
            entities: RwLock::new(HashMap::new()),
            authoritative: RwLock::new(HashMap::new()),
            selection: Mutex::new(HashSet::new()),
            drag: Mutex::new(None),
            viewport: Mutex::new(ViewportFilter::new(config.grid_cell, config.viewport_margin)),
            cursor_throttle: Throttle::new(config.cursor_throttle),
            drag_throttle: Throttle::new(config.drag_throttle),
            config,
        }
    }

    #[must_use]
    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    #[must_use]
    pub fn monitor(&self) -> &ConnectionMonitor {
        &self.monitor
    }

    #[must_use]
    pub fn clock(&self) -> Arc<MonotonicClock> {
        Arc::clone(&self.clock)
    }

    // =========================================================================
    // SNAPSHOT INTAKE
    // =========================================================================

    /// Load the initial snapshot from the store.
    pub async fn bootstrap(&self) {
        let snapshot = self.store.snapshot().await;
        self.apply_snapshot(&snapshot).await;
    }

    /// Reconcile an incoming authoritative snapshot into the local view and
    /// swap it in atomically. Gestures and selections referencing entities
    /// that vanished are pruned rather than left dangling.
    pub async fn apply_snapshot(&self, snapshot: &[Entity]) {
        let mut entities = self.entities.write().await;
        let mut next = reconcile(&entities, snapshot);
        let incoming: HashMap<EntityId, Entity> =
            snapshot.iter().map(|e| (e.id, e.clone())).collect();

        {
            let mut drag = self.lock_drag();
            if let Some(gesture) = drag.as_mut() {
                if !gesture.prune(&next) {
                    // Anchor deleted remotely: the gesture dies, and its
                    // uncommitted local moves revert with it.
                    for id in gesture.members() {
                        match incoming.get(&id) {
                            Some(entity) => {
                                next.insert(id, entity.clone());
                            }
                            None => {
                                next.remove(&id);
                            }
                        }
                    }
                    *drag = None;
                }
            }
        }
        *self.authoritative.write().await = incoming;
        self.lock_selection().retain(|id| next.contains_key(id));
        self.lock_viewport().sync(&next);

        *entities = next;
    }

    // =========================================================================
    // QUERIES
    // =========================================================================

    pub async fn entity(&self, id: EntityId) -> Option<Entity> {
        self.entities.read().await.get(&id).cloned()
    }

    pub async fn entities(&self) -> HashMap<EntityId, Entity> {
        self.entities.read().await.clone()
    }

    /// Entities in stable draw order.
    pub async fn draw_order(&self) -> Vec<Entity> {
        let entities = self.entities.read().await;
        sorted_entities(&entities).into_iter().cloned().collect()
    }

    /// The working set for the given view rectangle: everything intersecting
    /// view+margin plus locally-selected and locally-dragged entities.
    pub async fn visible_entities(&self, view: &Rect) -> HashSet<EntityId> {
        let entities = self.entities.read().await;
        let selected = self.lock_selection().clone();
        let dragging: HashSet<EntityId> = self
            .lock_drag()
            .as_ref()
            .map(|d| d.members().collect())
            .unwrap_or_default();
        self.lock_viewport()
            .visible_set(&entities, view, &selected, &dragging)
    }

    // =========================================================================
    // DURABLE WRITES (optimistic)
    // =========================================================================

    /// Create an entity: stamp, apply locally, write through.
    ///
    /// # Errors
    ///
    /// Validation and store errors; on failure the optimistic insert is
    /// rolled back.
    pub async fn create(&self, mut entity: Entity) -> Result<Entity, ClientError> {
        entity.updated_by = self.user_id;
        entity.updated_at = self.clock.next();
        entity.validate()?;

        {
            let mut entities = self.entities.write().await;
            entities.insert(entity.id, entity.clone());
            self.lock_viewport().sync(&entities);
        }
        match self.write_with_retry(&BatchOp::Create(entity.clone())).await {
            Ok(()) => Ok(entity),
            Err(e) => {
                self.rollback(entity.id).await;
                Err(e)
            }
        }
    }

    /// Merge a sparse patch into an entity: stamp, apply locally, write
    /// through.
    ///
    /// # Errors
    ///
    /// `Locked` if the entity is locked (unless the patch unlocks it),
    /// `NotFound` if it doesn't exist locally, plus validation and store
    /// errors. On failure the optimistic merge is rolled back.
    pub async fn update(&self, id: EntityId, mut patch: EntityPatch) -> Result<(), ClientError> {
        patch.updated_by = self.user_id;
        patch.updated_at = self.clock.next();
        patch.validate()?;

        {
            let mut entities = self.entities.write().await;
            let entity = entities
                .get_mut(&id)
                .ok_or(ClientError::Store(StoreError::NotFound(id)))?;
            if entity.locked && patch.locked != Some(false) {
                return Err(ClientError::Locked(id));
            }
            entity.apply_patch(&patch);
            self.lock_viewport().sync(&entities);
        }
        match self.write_with_retry(&BatchOp::Update(id, patch)).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.rollback(id).await;
                Err(e)
            }
        }
    }

    /// Delete an entity: remove locally, write through.
    ///
    /// # Errors
    ///
    /// Store errors; on failure the optimistic removal is rolled back.
    pub async fn delete(&self, id: EntityId) -> Result<(), ClientError> {
        {
            let mut entities = self.entities.write().await;
            entities.remove(&id);
            self.lock_selection().remove(&id);
            let mut drag = self.lock_drag();
            if let Some(gesture) = drag.as_mut() {
                if !gesture.prune(&entities) {
                    *drag = None;
                }
            }
            drop(drag);
            self.lock_viewport().sync(&entities);
        }
        match self.write_with_retry(&BatchOp::Delete(id)).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.rollback(id).await;
                Err(e)
            }
        }
    }

    async fn write_with_retry(&self, op: &BatchOp) -> Result<(), ClientError> {
        #[allow(clippy::cast_possible_truncation)]
        let base_ms = self.config.write_retry_base.as_millis() as u64;
        let mut attempt = 0;
        loop {
            let result = match op {
                BatchOp::Create(entity) => self.store.create(entity.clone()).await,
                BatchOp::Update(id, patch) => self.store.update(*id, patch.clone()).await,
                BatchOp::Delete(id) => self.store.delete(*id).await,
            };
            match result {
                Ok(()) => return Ok(()),
                Err(e) if e.retryable() && attempt < self.config.write_retries => {
                    attempt += 1;
                    warn!(
                        error = %e,
                        attempt,
                        total = self.config.write_retries,
                        user = %self.user_id,
                        "durable write failed; retrying"
                    );
                    tokio::time::sleep(std::time::Duration::from_millis(
                        base_ms << (attempt - 1),
                    ))
                    .await;
                }
                Err(e) => {
                    error!(error = %e, code = e.error_code(), user = %self.user_id, "durable write failed; rolling back");
                    return Err(ClientError::Store(e));
                }
            }
        }
    }

    /// Revert one entity to its last authoritative value (or absence).
    async fn rollback(&self, id: EntityId) {
        let mut entities = self.entities.write().await;
        let authoritative = self.authoritative.read().await;
        match authoritative.get(&id) {
            Some(entity) => {
                entities.insert(id, entity.clone());
            }
            None => {
                entities.remove(&id);
            }
        }
        drop(authoritative);
        self.lock_viewport().sync(&entities);
    }

    // =========================================================================
    // BATCH WRITES
    // =========================================================================

    /// Create many entities as chunked atomic transactions: one observable
    /// snapshot transition per chunk instead of one per entity.
    ///
    /// # Errors
    ///
    /// `Batch` naming the failed chunk; optimistic state for the failed and
    /// unattempted chunks is rolled back (earlier chunks committed).
    pub async fn batch_create(&self, mut batch: Vec<Entity>) -> Result<Vec<Entity>, ClientError> {
        for entity in &mut batch {
            entity.updated_by = self.user_id;
            entity.updated_at = self.clock.next();
            entity.validate()?;
        }
        {
            let mut entities = self.entities.write().await;
            for entity in &batch {
                entities.insert(entity.id, entity.clone());
            }
            self.lock_viewport().sync(&entities);
        }
        let ops: Vec<BatchOp> = batch.iter().cloned().map(BatchOp::Create).collect();
        match run_batch(&self.store, &ops, self.config.max_batch_ops).await {
            Ok(()) => Ok(batch),
            Err(e) => {
                self.rollback_from_chunk(&e, &batch.iter().map(|b| b.id).collect::<Vec<_>>())
                    .await;
                Err(e.into())
            }
        }
    }

    /// Update many entities as chunked atomic transactions. Patches are
    /// stamped here; any `updated_at` the caller set is overwritten.
    ///
    /// # Errors
    ///
    /// As for [`Self::batch_create`], plus `Locked` if any target is locked.
    pub async fn batch_update(
        &self,
        mut updates: Vec<(EntityId, EntityPatch)>,
    ) -> Result<(), ClientError> {
        for (_, patch) in &mut updates {
            patch.updated_by = self.user_id;
            patch.updated_at = self.clock.next();
            patch.validate()?;
        }
        {
            let mut entities = self.entities.write().await;
            for (id, patch) in &updates {
                if entities.get(id).is_some_and(|e| e.locked) && patch.locked != Some(false) {
                    return Err(ClientError::Locked(*id));
                }
            }
            for (id, patch) in &updates {
                if let Some(entity) = entities.get_mut(id) {
                    entity.apply_patch(patch);
                }
            }
            self.lock_viewport().sync(&entities);
        }
        let ids: Vec<EntityId> = updates.iter().map(|(id, _)| *id).collect();
        let ops: Vec<BatchOp> = updates
            .into_iter()
            .map(|(id, patch)| BatchOp::Update(id, patch))
            .collect();
        match run_batch(&self.store, &ops, self.config.max_batch_ops).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.rollback_from_chunk(&e, &ids).await;
                Err(e.into())
            }
        }
    }

    /// Delete many entities as chunked atomic transactions.
    ///
    /// # Errors
    ///
    /// As for [`Self::batch_create`].
    pub async fn batch_delete(&self, ids: Vec<EntityId>) -> Result<(), ClientError> {
        {
            let mut entities = self.entities.write().await;
            for id in &ids {
                entities.remove(id);
                self.lock_selection().remove(id);
            }
            let mut drag = self.lock_drag();
            if let Some(gesture) = drag.as_mut() {
                if !gesture.prune(&entities) {
                    *drag = None;
                }
            }
            drop(drag);
            self.lock_viewport().sync(&entities);
        }
        let ops: Vec<BatchOp> = ids.iter().copied().map(BatchOp::Delete).collect();
        match run_batch(&self.store, &ops, self.config.max_batch_ops).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.rollback_from_chunk(&e, &ids).await;
                Err(e.into())
            }
        }
    }

    /// Roll back optimistic state for every id in the failed chunk and the
    /// chunks after it. Earlier chunks committed and stand.
    async fn rollback_from_chunk(&self, err: &BatchError, ids: &[EntityId]) {
        let BatchError::ChunkFailed { chunk, .. } = err;
        let start = chunk_range(*chunk, self.config.max_batch_ops, ids.len()).start;
        for id in ids.iter().skip(start) {
            self.rollback(*id).await;
        }
    }

    // =========================================================================
    // EPHEMERAL BROADCAST (best-effort)
    // =========================================================================

    /// Broadcast the local cursor position. Throttled per user; failures are
    /// logged and never propagate — ephemeral data must not block anything.
    pub fn publish_cursor(&self, x: f64, y: f64) {
        if !self.cursor_throttle.allow(self.user_id) {
            return;
        }
        let record = EphemeralRecord::Cursor(Cursor {
            user_id: self.user_id,
            x,
            y,
            user_name: self.user_name.clone(),
            color: self.color.clone(),
            updated_at: self.clock.next(),
        });
        if let Err(e) = self
            .ephemeral
            .publish(self.user_id, EphemeralPath::Cursor(self.user_id), record)
        {
            warn!(error = %e, user = %self.user_id, "cursor broadcast failed");
        }
    }

    /// Replace the local selection and broadcast it.
    pub fn set_selection(&self, ids: HashSet<EntityId>) {
        *self.lock_selection() = ids.clone();
        let record = EphemeralRecord::Selection(Selection {
            user_id: self.user_id,
            shape_ids: ids.into_iter().collect(),
            user_name: self.user_name.clone(),
            color: self.color.clone(),
            updated_at: self.clock.next(),
        });
        if let Err(e) = self
            .ephemeral
            .publish(self.user_id, EphemeralPath::Selection(self.user_id), record)
        {
            warn!(error = %e, user = %self.user_id, "selection broadcast failed");
        }
    }

    /// Clear the local selection and remove the broadcast record.
    pub fn clear_selection(&self) {
        self.lock_selection().clear();
        if let Err(e) = self
            .ephemeral
            .remove(self.user_id, EphemeralPath::Selection(self.user_id))
        {
            warn!(error = %e, user = %self.user_id, "selection clear failed");
        }
    }

    #[must_use]
    pub fn selection(&self) -> HashSet<EntityId> {
        self.lock_selection().clone()
    }

    // =========================================================================
    // GROUP DRAG GESTURE
    // =========================================================================

    /// Start dragging `anchor` together with the current selection. Locked
    /// selection members refuse edits, so they are left out of the gesture
    /// rather than poisoning its commit.
    ///
    /// # Errors
    ///
    /// `NoAnchor` if the anchor entity doesn't exist, `Locked` if it is
    /// locked.
    pub async fn begin_drag(&self, anchor: EntityId) -> Result<(), ClientError> {
        let entities = self.entities.read().await;
        if entities.get(&anchor).is_some_and(|e| e.locked) {
            return Err(ClientError::Locked(anchor));
        }
        let members: Vec<EntityId> = self
            .lock_selection()
            .iter()
            .copied()
            .filter(|id| !entities.get(id).is_some_and(|e| e.locked))
            .collect();
        let gesture =
            GroupDrag::begin(anchor, members, &entities).ok_or(ClientError::NoAnchor(anchor))?;
        *self.lock_drag() = Some(gesture);
        Ok(())
    }

    /// Move the gesture so the anchor lands at `(x, y)`: every member shifts
    /// by the same delta, locally and as a throttled drag-preview broadcast.
    /// Members deleted remotely since the last move are skipped.
    ///
    /// # Errors
    ///
    /// `NoGesture` if no drag is active.
    pub async fn drag_to(&self, x: f64, y: f64) -> Result<(), ClientError> {
        let positions = self
            .lock_drag()
            .as_ref()
            .ok_or(ClientError::NoGesture)?
            .positions_at(x, y);

        let mut previews = Vec::with_capacity(positions.len());
        {
            let mut entities = self.entities.write().await;
            for (id, ex, ey) in positions {
                let Some(entity) = entities.get_mut(&id) else {
                    continue;
                };
                entity.x = ex;
                entity.y = ey;
                // Stamp so an in-flight snapshot doesn't snap the drag back.
                entity.updated_by = self.user_id;
                entity.updated_at = self.clock.next();
                previews.push(DragPreview {
                    shape_id: id,
                    user_id: self.user_id,
                    x: ex,
                    y: ey,
                    width: entity.width,
                    height: entity.height,
                    rotation: entity.rotation,
                    updated_at: entity.updated_at,
                });
            }
            self.lock_viewport().sync(&entities);
        }

        for preview in previews {
            if !self.drag_throttle.allow(preview.shape_id) {
                continue;
            }
            let path = EphemeralPath::Dragging(preview.shape_id);
            if let Err(e) = self
                .ephemeral
                .publish(self.user_id, path, EphemeralRecord::DragPreview(preview))
            {
                warn!(error = %e, user = %self.user_id, "drag preview broadcast failed");
            }
        }
        Ok(())
    }

    /// Finish the gesture: commit all final positions in one batch update,
    /// then clear each preview record after a grace delay so remote
    /// observers never see a flash of the stale pre-commit position.
    ///
    /// # Errors
    ///
    /// `NoGesture` if no drag is active; otherwise batch errors from the
    /// commit. Previews are cleared either way.
    pub async fn end_drag(&self) -> Result<(), ClientError> {
        let gesture = self.lock_drag().take().ok_or(ClientError::NoGesture)?;
        let members: Vec<EntityId> = gesture.members().collect();

        let updates: Vec<(EntityId, EntityPatch)> = {
            let entities = self.entities.read().await;
            members
                .iter()
                .filter_map(|id| {
                    entities
                        .get(id)
                        .map(|e| (*id, EntityPatch::move_to(self.user_id, 0, e.x, e.y)))
                })
                .collect()
        };
        let result = self.batch_update(updates).await;
        if matches!(result, Err(ClientError::Locked(_))) {
            // The commit was refused before anything was attempted; the
            // gesture's local moves must not outlive it, or their fresh
            // timestamps would shield them from every future snapshot.
            for id in &members {
                self.rollback(*id).await;
            }
        }

        for id in &members {
            self.drag_throttle.reset(id);
        }
        self.spawn_preview_cleanup(members);
        result
    }

    /// Abort the gesture without committing: previews are removed
    /// immediately and every member reverts to its authoritative position.
    pub async fn cancel_drag(&self) {
        let Some(gesture) = self.lock_drag().take() else {
            return;
        };
        for id in gesture.members() {
            self.rollback(id).await;
            self.drag_throttle.reset(&id);
            if let Err(e) = self.ephemeral.remove(self.user_id, EphemeralPath::Dragging(id)) {
                warn!(error = %e, user = %self.user_id, "drag preview removal failed");
            }
        }
    }

    /// Whether a drag gesture is active.
    #[must_use]
    pub fn dragging(&self) -> bool {
        self.lock_drag().is_some()
    }

    fn spawn_preview_cleanup(&self, ids: Vec<EntityId>) {
        let ephemeral = self.ephemeral.clone();
        let user_id = self.user_id;
        let grace = self.config.drag_clear_grace;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            for id in ids {
                if let Err(e) = ephemeral.remove(user_id, EphemeralPath::Dragging(id)) {
                    warn!(error = %e, user = %user_id, "drag preview cleanup failed");
                }
            }
        });
    }

    // =========================================================================
    // LOCK HELPERS
    // =========================================================================

    fn lock_selection(&self) -> MutexGuard<'_, HashSet<EntityId>> {
        self.selection.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_drag(&self) -> MutexGuard<'_, Option<GroupDrag>> {
        self.drag.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_viewport(&self) -> MutexGuard<'_, ViewportFilter> {
        self.viewport.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Spawn the snapshot intake loop for a client. On lag, refetches the full
/// snapshot instead of replaying missed deltas — snapshots are self-contained.
pub fn spawn_sync_worker(client: Arc<SyncClient>) -> JoinHandle<()> {
    let mut rx = client.store.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(snapshot) => client.apply_snapshot(&snapshot).await,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, user = %client.user_id, "snapshot stream lagged; refetching");
                    let snapshot = client.store.snapshot().await;
                    client.apply_snapshot(&snapshot).await;
                }
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    })
}
