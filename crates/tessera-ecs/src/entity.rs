//! Entity identifiers and per-entity bookkeeping.
//!
//! An [`EntityId`] is a plain monotonic counter value: ids are handed out once
//! and never recycled, so a stale id can never alias a newer entity.
//!
//! An [`EntityRecord`] is the identity component every entity carries. It
//! records which record types the entity owns, which of those are still
//! valid, where each one lives in its column, and how far the entity has
//! progressed through removal:
//!
//! ```text
//! Active --flag_for_removal--> FlaggedForRemoval --set_staged_for_removal--> Staged --merge--> erased
//! ```
//!
//! While flagged, every fetch that matches the entity retires the matched
//! components instead of yielding them. Once only the identity bit is left
//! in the valid set the entity is staged and its identity slot erased.

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};

use serde::{Deserialize, Serialize};

use crate::component::RecordTypeId;
use crate::mask::{AtomicRecordMask, RecordMask};

// ---------------------------------------------------------------------------
// EntityId
// ---------------------------------------------------------------------------

/// A unique, never-reused entity identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityId(u64);

impl EntityId {
    /// Raw `u64` representation.
    #[inline]
    pub fn to_raw(self) -> u64 {
        self.0
    }

    /// Reconstruct from a raw `u64`.
    #[inline]
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Debug for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntityId({})", self.0)
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "e{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// EntityIdGenerator
// ---------------------------------------------------------------------------

/// Monotonic id source.
///
/// Atomic so that systems can allocate ids for deferred spawns through a
/// shared store reference while a stage runs.
#[derive(Debug, Default)]
pub struct EntityIdGenerator {
    next: AtomicU64,
}

impl EntityIdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the next id.
    #[inline]
    pub fn next_id(&self) -> EntityId {
        EntityId(self.next.fetch_add(1, Ordering::Relaxed))
    }

    /// Number of ids handed out so far.
    pub fn allocated(&self) -> u64 {
        self.next.load(Ordering::Relaxed)
    }
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

/// Removal progress of an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Lifecycle {
    Active = 0,
    /// Removal requested; components are being retired by matching fetches.
    FlaggedForRemoval = 1,
    /// Only the identity record remains; its erasure is queued.
    Staged = 2,
}

impl Lifecycle {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Lifecycle::Active,
            1 => Lifecycle::FlaggedForRemoval,
            _ => Lifecycle::Staged,
        }
    }
}

// ---------------------------------------------------------------------------
// EntityRecord
// ---------------------------------------------------------------------------

/// Bookkeeping for one entity: owned and valid type sets, lifecycle, and the
/// slot each owned type occupies in its column.
///
/// Methods that may race during a stage (`flag_for_removal`,
/// `set_staged_for_removal`, `retire_component`) take `&self` and are atomic.
/// Everything that touches `slot_of` takes `&mut self` and only runs in the
/// single-threaded merge or while building an entity.
pub struct EntityRecord {
    id: EntityId,
    owned: RecordMask,
    valid: AtomicRecordMask,
    lifecycle: AtomicU8,
    /// Indexed by `RecordTypeId`.
    slot_of: Vec<Option<usize>>,
}

impl EntityRecord {
    /// The identity record type is always registered first.
    pub const RECORD_TYPE: RecordTypeId = RecordTypeId(0);

    /// A fresh, active record with room for `record_types` slots.
    pub fn new(id: EntityId, record_types: usize) -> Self {
        Self {
            id,
            owned: RecordMask::EMPTY,
            valid: AtomicRecordMask::default(),
            lifecycle: AtomicU8::new(Lifecycle::Active as u8),
            slot_of: vec![None; record_types],
        }
    }

    #[inline]
    pub fn id(&self) -> EntityId {
        self.id
    }

    /// Every type ever attached and not hard-removed.
    #[inline]
    pub fn owned(&self) -> RecordMask {
        self.owned
    }

    /// Types still live and not yet invalidated.
    #[inline]
    pub fn valid(&self) -> RecordMask {
        self.valid.load()
    }

    // -- merge-time bookkeeping ---------------------------------------------

    /// Mark `record` as owned and valid at `slot`.
    pub fn add_component(&mut self, record: RecordTypeId, slot: usize) {
        self.owned.insert(record);
        self.valid.insert_mut(record);
        self.slot_of[record.index()] = Some(slot);
    }

    /// Forget `record` entirely.
    pub fn remove_component(&mut self, record: RecordTypeId) {
        self.owned.remove(record);
        self.valid.remove_mut(record);
        self.slot_of[record.index()] = None;
    }

    /// Forget the slot of `record` and clear its valid bit. The owned bit is
    /// kept, so the entity still matches fetches that name the type.
    pub fn invalidate_component(&mut self, record: RecordTypeId) {
        self.valid.remove_mut(record);
        self.slot_of[record.index()] = None;
    }

    /// Shift the slot of `record` down by one after a lower element of its
    /// column was erased.
    pub fn decrement_component(&mut self, record: RecordTypeId) {
        if let Some(slot) = self.slot_of[record.index()].as_mut() {
            *slot = slot.saturating_sub(1);
        }
    }

    pub(crate) fn set_slot(&mut self, record: RecordTypeId, slot: usize) {
        self.slot_of[record.index()] = Some(slot);
    }

    /// Recorded `(type, slot)` pairs.
    pub fn slots(&self) -> impl Iterator<Item = (RecordTypeId, usize)> + '_ {
        self.slot_of
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.map(|s| (RecordTypeId(i as u32), s)))
    }

    // -- queries -------------------------------------------------------------

    #[inline]
    pub fn has_component(&self, record: RecordTypeId) -> bool {
        self.owned.contains(record)
    }

    #[inline]
    pub fn has_components(&self, mask: RecordMask) -> bool {
        self.owned.contains_all(mask)
    }

    #[inline]
    pub fn has_valid_component(&self, record: RecordTypeId) -> bool {
        self.valid.load().contains(record)
    }

    #[inline]
    pub fn has_valid_components(&self, mask: RecordMask) -> bool {
        self.valid.load().contains_all(mask)
    }

    /// Slot of `record` in its column, if one is recorded.
    #[inline]
    pub fn get_component(&self, record: RecordTypeId) -> Option<usize> {
        self.slot_of.get(record.index()).copied().flatten()
    }

    // -- lifecycle -----------------------------------------------------------

    #[inline]
    pub fn lifecycle(&self) -> Lifecycle {
        Lifecycle::from_u8(self.lifecycle.load(Ordering::Acquire))
    }

    /// False once the entity is being removed and nothing but the identity
    /// record is still valid.
    ///
    /// An entity that owns a type no system ever fetches keeps that bit valid
    /// and therefore never stops being alive; it stays flagged indefinitely.
    pub fn is_alive(&self) -> bool {
        self.lifecycle() == Lifecycle::Active
            || self.valid.load() != RecordMask::single(Self::RECORD_TYPE)
    }

    /// Request removal. Returns `true` if this call moved the entity out of
    /// `Active`.
    pub fn flag_for_removal(&self) -> bool {
        self.transition(Lifecycle::Active, Lifecycle::FlaggedForRemoval)
    }

    /// True for both `FlaggedForRemoval` and `Staged`.
    #[inline]
    pub fn is_flagged_for_removal(&self) -> bool {
        self.lifecycle() != Lifecycle::Active
    }

    /// Returns `true` if this call moved the entity from flagged to staged.
    pub fn set_staged_for_removal(&self) -> bool {
        self.transition(Lifecycle::FlaggedForRemoval, Lifecycle::Staged)
    }

    #[inline]
    pub fn is_staged_for_removal(&self) -> bool {
        self.lifecycle() == Lifecycle::Staged
    }

    /// Clear the valid bit of `record` ahead of its deferred erasure.
    /// Returns `true` if the bit was still set.
    pub fn retire_component(&self, record: RecordTypeId) -> bool {
        self.valid.clear(record)
    }

    fn transition(&self, from: Lifecycle, to: Lifecycle) -> bool {
        self.lifecycle
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

impl fmt::Debug for EntityRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityRecord")
            .field("id", &self.id)
            .field("lifecycle", &self.lifecycle())
            .field("owned", &self.owned)
            .field("valid", &self.valid)
            .field("slots", &self.slots().collect::<Vec<_>>())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
