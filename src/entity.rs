// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replicated entities and the per-entity lock.
//!
//! An [`Entity`] is one logical record (one per player, typically) that
//! several processes hold copies of. The repository never touches an entity
//! directly; it goes through an [`EntityCell`], which pairs the value with
//! its `dirty` flag and a revision counter under a single mutex:
//!
//! ```text
//! ┌──────────────────── EntityCell ─────────────────────┐
//! │  Mutex ─► { value: T, dirty: bool, revision: u64 }  │
//! └─────────────────────────────────────────────────────┘
//!   update()  ─► mutate, dirty = true, revision += 1
//!   access()  ─► mutate transient state only (caches)
//!   merge()   ─► apply a remote copy, dirty untouched
//! ```
//!
//! Local mutation, remote merge and flush snapshots therefore linearize per
//! entity. Flush only clears `dirty` when the revision it serialized is still
//! current, so a mutation that lands while a write is in flight is never
//! lost.
//!
//! # Merge Semantics
//!
//! Merge is last-writer-wins over the whole entity as observed by the
//! receiver. Each entity is expected to have a single authoritative writer
//! at a time (the server the player is on); concurrent writers on two
//! processes are not reconciled.

use crate::error::{Result, SyncError};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// A replicated record.
///
/// Transient state (memoized computations, the dirty flag) must be excluded
/// from serialization with `#[serde(skip)]`.
pub trait Entity: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Empty default for an id nobody has written yet.
    fn new(id: &str) -> Self;

    /// Stable key, never empty, never changes after construction.
    fn id(&self) -> &str;

    /// True when the entity carries no further useful state and may be
    /// purged from memory and from the backing store.
    fn is_removable(&self) -> bool {
        false
    }

    /// Overwrite replicated fields with `remote`'s and invalidate every
    /// derived cache.
    fn merge(&mut self, remote: Self);
}

struct Slot<T> {
    value: T,
    dirty: bool,
    revision: u64,
}

/// What a flush cycle found when it looked at a dirty entity.
#[derive(Debug)]
pub(crate) enum FlushSnapshot {
    /// Entity reports itself removable. The payload is its final state,
    /// broadcast once the store record is gone.
    Remove { revision: u64, payload: Vec<u8> },
    /// Serialized form to write back.
    Write { revision: u64, payload: Vec<u8> },
}

/// An entity behind its lock.
pub struct EntityCell<T> {
    id: String,
    slot: Mutex<Slot<T>>,
}

impl<T: Entity> EntityCell<T> {
    /// Wrap a value that is already durable (loaded or received).
    pub fn clean(value: T) -> Self {
        Self {
            id: value.id().to_string(),
            slot: Mutex::new(Slot {
                value,
                dirty: false,
                revision: 0,
            }),
        }
    }

    /// Lazily constructed default for `id`.
    pub fn fresh(id: &str) -> Self {
        Self::clean(T::new(id))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Mutate replicated state. Marks the entity dirty.
    pub fn update<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let mut slot = self.slot.lock();
        let result = f(&mut slot.value);
        slot.dirty = true;
        slot.revision = slot.revision.wrapping_add(1);
        result
    }

    /// Use the entity without changing replicated state.
    ///
    /// Mutable so memoized caches can be filled; the entity is not dirtied.
    pub fn access<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        f(&mut self.slot.lock().value)
    }

    /// Read-only view.
    pub fn read<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&self.slot.lock().value)
    }

    /// Apply a remote copy. Does not mark dirty: the data is already durable
    /// at its origin.
    pub fn merge(&self, remote: T) {
        self.slot.lock().value.merge(remote);
    }

    /// Flag a mutation made outside [`update`](Self::update).
    pub fn mark_dirty(&self) {
        let mut slot = self.slot.lock();
        slot.dirty = true;
        slot.revision = slot.revision.wrapping_add(1);
    }

    pub fn is_dirty(&self) -> bool {
        self.slot.lock().dirty
    }

    pub fn is_removable(&self) -> bool {
        self.slot.lock().value.is_removable()
    }

    pub fn revision(&self) -> u64 {
        self.slot.lock().revision
    }

    /// Serialize the current value under the lock.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let slot = self.slot.lock();
        serde_json::to_vec(&slot.value).map_err(|e| SyncError::serialization(&self.id, e))
    }

    /// `None` when clean. Otherwise the action the flush cycle should take.
    pub(crate) fn flush_snapshot(&self) -> Option<Result<FlushSnapshot>> {
        let slot = self.slot.lock();
        if !slot.dirty {
            return None;
        }
        let revision = slot.revision;
        let removable = slot.value.is_removable();
        Some(
            serde_json::to_vec(&slot.value)
                .map(|payload| {
                    if removable {
                        FlushSnapshot::Remove { revision, payload }
                    } else {
                        FlushSnapshot::Write { revision, payload }
                    }
                })
                .map_err(|e| SyncError::serialization(&self.id, e)),
        )
    }

    /// Clear `dirty` if nothing changed since `revision` was snapshotted.
    pub(crate) fn clear_dirty_if(&self, revision: u64) -> bool {
        let mut slot = self.slot.lock();
        if slot.revision == revision {
            slot.dirty = false;
            true
        } else {
            false
        }
    }

    /// Still removable and unchanged since `revision`.
    pub(crate) fn purgeable_at(&self, revision: u64) -> bool {
        let slot = self.slot.lock();
        slot.revision == revision && slot.value.is_removable()
    }
}

impl<T: Entity + Clone> EntityCell<T> {
    /// Clone the current value out of the lock.
    pub fn snapshot(&self) -> T {
        self.slot.lock().value.clone()
    }
}

impl<T> std::fmt::Debug for EntityCell<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityCell").field("id", &self.id).finish_non_exhaustive()
    }
}

/// Decode a stored or broadcast payload.
pub fn decode<T: Entity>(payload: &[u8], context: &str) -> Result<T> {
    let entity: T = serde_json::from_slice(payload).map_err(|e| SyncError::serialization(context, e))?;
    if entity.id().is_empty() {
        return Err(SyncError::Serialization {
            context: context.to_string(),
            message: "entity id is empty".to_string(),
        });
    }
    Ok(entity)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Rank {
        id: String,
        rank: Option<String>,
        #[serde(skip)]
        lookups: u32,
    }

    impl Entity for Rank {
        fn new(id: &str) -> Self {
            Self {
                id: id.to_string(),
                rank: None,
                lookups: 0,
            }
        }

        fn id(&self) -> &str {
            &self.id
        }

        fn is_removable(&self) -> bool {
            self.rank.is_none()
        }

        fn merge(&mut self, remote: Self) {
            self.rank = remote.rank;
            self.lookups = 0;
        }
    }

    fn ranked(id: &str, rank: &str) -> Rank {
        Rank {
            id: id.to_string(),
            rank: Some(rank.to_string()),
            lookups: 0,
        }
    }

    #[test]
    fn test_fresh_cell_is_clean() {
        let cell = EntityCell::<Rank>::fresh("p1");
        assert_eq!(cell.id(), "p1");
        assert!(!cell.is_dirty());
        assert!(cell.flush_snapshot().is_none());
    }

    #[test]
    fn test_update_marks_dirty_and_bumps_revision() {
        let cell = EntityCell::<Rank>::fresh("p1");
        cell.update(|r| r.rank = Some("vip".into()));
        assert!(cell.is_dirty());
        assert_eq!(cell.revision(), 1);
    }

    #[test]
    fn test_access_does_not_dirty() {
        let cell = EntityCell::clean(ranked("p1", "vip"));
        cell.access(|r| r.lookups += 1);
        assert!(!cell.is_dirty());
        assert_eq!(cell.snapshot().lookups, 1);
    }

    #[test]
    fn test_merge_replaces_fields_without_dirtying() {
        let cell = EntityCell::clean(ranked("p1", "vip"));
        cell.access(|r| r.lookups = 7);

        cell.merge(ranked("p1", "admin"));

        let value = cell.snapshot();
        assert_eq!(value.rank.as_deref(), Some("admin"));
        assert_eq!(value.lookups, 0);
        assert!(!cell.is_dirty());
    }

    #[test]
    fn test_flush_snapshot_write() {
        let cell = EntityCell::<Rank>::fresh("p1");
        cell.update(|r| r.rank = Some("vip".into()));

        match cell.flush_snapshot() {
            Some(Ok(FlushSnapshot::Write { revision, payload })) => {
                assert_eq!(revision, 1);
                let decoded: Rank = decode(&payload, "test").unwrap();
                assert_eq!(decoded.rank.as_deref(), Some("vip"));
            }
            other => panic!("expected write snapshot, got {:?}", other),
        }
    }

    #[test]
    fn test_flush_snapshot_remove() {
        let cell = EntityCell::clean(ranked("p1", "vip"));
        cell.update(|r| r.rank = None);
        assert!(matches!(
            cell.flush_snapshot(),
            Some(Ok(FlushSnapshot::Remove { revision: 1, .. }))
        ));
        assert!(cell.purgeable_at(1));
    }

    #[test]
    fn test_clear_dirty_respects_concurrent_update() {
        let cell = EntityCell::<Rank>::fresh("p1");
        cell.update(|r| r.rank = Some("vip".into()));
        let revision = cell.revision();

        // A mutation lands while the write is in flight.
        cell.update(|r| r.rank = Some("admin".into()));

        assert!(!cell.clear_dirty_if(revision));
        assert!(cell.is_dirty());
        assert!(cell.clear_dirty_if(cell.revision()));
        assert!(!cell.is_dirty());
    }

    #[test]
    fn test_transient_fields_are_not_serialized() {
        let cell = EntityCell::clean(ranked("p1", "vip"));
        cell.access(|r| r.lookups = 3);
        let bytes = cell.to_bytes().unwrap();
        let text = String::from_utf8(bytes).unwrap();
        assert!(!text.contains("lookups"));
    }

    #[test]
    fn test_decode_rejects_garbage_and_empty_id() {
        assert!(decode::<Rank>(b"not json", "test").is_err());
        let err = decode::<Rank>(br#"{"id":"","rank":null}"#, "test").unwrap_err();
        assert!(matches!(err, SyncError::Serialization { .. }));
    }
}
