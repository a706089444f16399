//! Snapshot reconciliation — the per-client reducer.
//!
//! DESIGN
//! ======
//! `reconcile(local, incoming)` produces the next local view from the latest
//! authoritative snapshot plus whatever optimistic state the client holds.
//! A local entity survives only on timestamp grounds: if its `updated_at` is
//! newer than the incoming copy, the in-flight optimistic write hasn't
//! round-tripped yet and the local value wins.
//!
//! The one rule that is easy to get wrong: an entity absent from the incoming
//! snapshot is dropped unconditionally. There is deliberately no "keep it if
//! I created it" case — the snapshot is the sole source of truth for
//! existence, and preserving self-authored entities past their deletion
//! produces ghost objects visible only to their creator.

#[cfg(test)]
#[path = "merge_test.rs"]
mod merge_test;

use std::collections::HashMap;

use crate::entity::{Entity, EntityId};

/// Reconcile the local view against an authoritative snapshot.
///
/// For each incoming entity, keeps whichever of {local, incoming} carries the
/// larger `updated_at`. Local entities missing from the snapshot are dropped;
/// incoming entities unknown locally are added. The caller swaps its state
/// for the returned map atomically.
#[must_use]
pub fn reconcile(local: &HashMap<EntityId, Entity>, incoming: &[Entity]) -> HashMap<EntityId, Entity> {
    let mut next = HashMap::with_capacity(incoming.len());
    for remote in incoming {
        let winner = match local.get(&remote.id) {
            Some(mine) if mine.updated_at > remote.updated_at => mine.clone(),
            _ => remote.clone(),
        };
        next.insert(remote.id, winner);
    }
    next
}

/// All entities sorted by `(z_index, id)` for stable draw order. Entities
/// with no explicit z-index sort as zero.
#[must_use]
pub fn sorted_entities(entities: &HashMap<EntityId, Entity>) -> Vec<&Entity> {
    let mut out: Vec<&Entity> = entities.values().collect();
    out.sort_by(|a, b| {
        a.z_index
            .unwrap_or(0)
            .cmp(&b.z_index.unwrap_or(0))
            .then_with(|| a.id.cmp(&b.id))
    });
    out
}
