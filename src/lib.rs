//! Multi-client state synchronization engine for a shared canvas.
//!
//! This crate is the sync core of a collaborative whiteboard: an authoritative
//! entity store, an ephemeral broadcast layer for per-gesture state (cursors,
//! presence, selections, drag previews), the client-side reconciliation that
//! resolves concurrent writes by last-write-wins timestamps, atomic batch
//! operations, and presence tracking with disconnect-driven cleanup. Each
//! client is an independent actor; clients share nothing except handles to the
//! two stores, which stand in for the hosted transport.
//!
//! ## Module layout
//!
//! | Module | Role |
//! |--------|------|
//! | [`entity`] | Entity data model, sparse patches, write-boundary validation |
//! | [`store`] | Authoritative entity store with full-snapshot subscription |
//! | [`ephemeral`] | Overwrite-in-place broadcast store with disconnect hooks |
//! | [`merge`] | Snapshot reconciliation (the per-client reducer) |
//! | [`batch`] | Chunked atomic multi-entity transactions |
//! | [`presence`] | Online/offline lifecycle state machine |
//! | [`connection`] | Connectivity observable and `wait_until_connected` |
//! | [`throttle`] | Per-resource-id minimum-interval rate limiting |
//! | [`viewport`] | Grid-indexed visibility culling |
//! | [`transform`] | Multi-entity drag gesture bookkeeping |
//! | [`client`] | Per-client session tying all of the above together |
//! | [`config`] | Environment-tunable knobs |
//! | [`error`] | Grepable error-code trait shared by all error types |

pub mod batch;
pub mod client;
pub mod config;
pub mod connection;
pub mod entity;
pub mod ephemeral;
pub mod error;
pub mod merge;
pub mod presence;
pub mod store;
pub mod throttle;
pub mod transform;
pub mod viewport;

pub use client::{SyncClient, spawn_sync_worker};
pub use connection::ConnectionMonitor;
pub use entity::{Entity, EntityId, EntityKind, EntityPatch, UserId};
pub use ephemeral::EphemeralStore;
pub use store::EntityStore;
