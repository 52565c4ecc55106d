//! Deferred structural edits and the merge that applies them.
//!
//! While a stage runs, columns may be read and their element values written,
//! but nothing may push into or erase from a column: either could move an
//! element some other worker is looking at. Structural edits are therefore
//! queued as [`Mutation`]s in the store's [`MutationLog`] and applied by
//! [`Store::merge`] once every system of the stage has returned.
//!
//! Systems reach the log through a [`WorldHandle`], handed to each system call
//! for the duration of that call.
//!
//! # Merge order
//!
//! 1. Erasures are sorted by descending slot per column, and duplicates of the
//!    same `(record, slot)` collapse into one (a hard removal wins).
//! 2. Entity bookkeeping is updated while every recorded slot is still the
//!    pre-merge one.
//! 3. Column elements are erased, highest slot first, so no erase shifts an
//!    index that is still to be processed.
//! 4. One pass over the surviving entities shifts each recorded slot down by
//!    the number of erased slots below it in the same column.
//! 5. Spawns append, then inserts append or overwrite in place. Neither moves
//!    an existing element, and an insert may target an entity spawned in the
//!    same merge.

use std::any::Any;
use std::collections::HashMap;

use parking_lot::{Mutex, MutexGuard};
use serde::Serialize;
use tracing::{debug, trace, warn};

use crate::component::{Record, RecordTypeId};
use crate::entity::{EntityId, EntityRecord, Lifecycle};
use crate::mask::RecordMask;
use crate::query::Query;
use crate::store::{EntityBundle, Store};
use crate::EcsError;

// ---------------------------------------------------------------------------
// Mutation
// ---------------------------------------------------------------------------

/// One deferred structural edit.
pub enum Mutation {
    /// Erase the element at `slot` of column `record`, owned by the entity
    /// whose identity record sits at `entity_slot`.
    ///
    /// A hard erase forgets the type on the entity entirely; a soft one (the
    /// gradual retirement of a flagged entity) keeps the owned bit.
    EraseComponent {
        entity_slot: usize,
        record: RecordTypeId,
        slot: usize,
        hard: bool,
    },
    /// Erase the identity record at `slot`.
    EraseEntity { slot: usize },
    /// Attach `value` to `entity`, or overwrite the value it already has.
    InsertComponent {
        entity: EntityId,
        record: RecordTypeId,
        value: Box<dyn Any + Send>,
    },
    /// Create `entity` from a validated bundle.
    SpawnEntity {
        entity: EntityId,
        bundle: EntityBundle,
    },
}

impl std::fmt::Debug for Mutation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Mutation::EraseComponent {
                entity_slot,
                record,
                slot,
                hard,
            } => f
                .debug_struct("EraseComponent")
                .field("entity_slot", entity_slot)
                .field("record", record)
                .field("slot", slot)
                .field("hard", hard)
                .finish(),
            Mutation::EraseEntity { slot } => {
                f.debug_struct("EraseEntity").field("slot", slot).finish()
            }
            Mutation::InsertComponent { entity, record, .. } => f
                .debug_struct("InsertComponent")
                .field("entity", entity)
                .field("record", record)
                .finish_non_exhaustive(),
            Mutation::SpawnEntity { entity, bundle } => f
                .debug_struct("SpawnEntity")
                .field("entity", entity)
                .field("bundle", bundle)
                .finish(),
        }
    }
}

// ---------------------------------------------------------------------------
// MutationLog
// ---------------------------------------------------------------------------

/// Queue of pending [`Mutation`]s, guarded by a single lock.
///
/// The lock also serializes the "already staged" check when several systems
/// retire the same entity in one stage.
#[derive(Debug, Default)]
pub struct MutationLog {
    pending: Mutex<Vec<Mutation>>,
}

impl MutationLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, mutation: Mutation) {
        self.pending.lock().push(mutation);
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Vec<Mutation>> {
        self.pending.lock()
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }

    /// Look at the queued mutations without applying them.
    pub fn inspect<R>(&self, f: impl FnOnce(&[Mutation]) -> R) -> R {
        f(&self.pending.lock())
    }

    fn take(&mut self) -> Vec<Mutation> {
        std::mem::take(self.pending.get_mut())
    }
}

// ---------------------------------------------------------------------------
// MergeReport
// ---------------------------------------------------------------------------

/// Summary of one [`Store::merge`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MergeReport {
    /// Component elements erased (after deduplication).
    pub erased_components: usize,
    /// Identity records erased.
    pub erased_entities: usize,
    /// Deferred inserts applied, overwrites included.
    pub inserted_components: usize,
    /// Deferred spawns applied.
    pub spawned_entities: usize,
    /// Deferred inserts dropped because their entity was gone or leaving.
    pub skipped: usize,
}

impl MergeReport {
    pub fn is_empty(&self) -> bool {
        *self == MergeReport::default()
    }

    /// Add another report's counts into this one.
    pub fn accumulate(&mut self, other: &MergeReport) {
        self.erased_components += other.erased_components;
        self.erased_entities += other.erased_entities;
        self.inserted_components += other.inserted_components;
        self.spawned_entities += other.spawned_entities;
        self.skipped += other.skipped;
    }
}

// ---------------------------------------------------------------------------
// Merge
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
struct Erasure {
    record: RecordTypeId,
    slot: usize,
    entity_slot: usize,
    hard: bool,
}

impl Store {
    /// Apply and clear every queued mutation.
    pub fn merge(&mut self) -> Result<MergeReport, EcsError> {
        let pending = self.log.take();
        let mut report = MergeReport::default();
        if pending.is_empty() {
            return Ok(report);
        }

        let mut erasures = Vec::new();
        let mut inserts = Vec::new();
        let mut spawns = Vec::new();
        for mutation in pending {
            match mutation {
                Mutation::EraseComponent {
                    entity_slot,
                    record,
                    slot,
                    hard,
                } => erasures.push(Erasure {
                    record,
                    slot,
                    entity_slot,
                    hard,
                }),
                Mutation::EraseEntity { slot } => erasures.push(Erasure {
                    record: EntityRecord::RECORD_TYPE,
                    slot,
                    entity_slot: slot,
                    hard: true,
                }),
                Mutation::InsertComponent {
                    entity,
                    record,
                    value,
                } => inserts.push((entity, record, value)),
                Mutation::SpawnEntity { entity, bundle } => spawns.push((entity, bundle)),
            }
        }

        let erasures = dedupe_erasures(erasures);
        self.apply_erasures(&erasures, &mut report)?;
        for (entity, bundle) in spawns {
            self.spawn_bundle(entity, bundle)?;
            report.spawned_entities += 1;
        }
        self.apply_inserts(inserts, &mut report)?;

        debug!(
            erased_components = report.erased_components,
            erased_entities = report.erased_entities,
            inserted = report.inserted_components,
            spawned = report.spawned_entities,
            skipped = report.skipped,
            "merged mutation log"
        );
        Ok(report)
    }

    fn apply_erasures(
        &mut self,
        erasures: &[Erasure],
        report: &mut MergeReport,
    ) -> Result<(), EcsError> {
        if erasures.is_empty() {
            return Ok(());
        }
        let identity = EntityRecord::RECORD_TYPE.index();

        // Bookkeeping first, against pre-merge entity slots.
        for erasure in erasures {
            if erasure.record == EntityRecord::RECORD_TYPE {
                continue;
            }
            let record = self.columns[identity].get_mut::<EntityRecord>(erasure.entity_slot)?;
            if erasure.hard {
                record.remove_component(erasure.record);
            } else {
                record.invalidate_component(erasure.record);
            }
        }

        // Highest slot first within each column.
        let mut erased: HashMap<RecordTypeId, Vec<usize>> = HashMap::new();
        for erasure in erasures {
            self.columns[erasure.record.index()].erase(erasure.slot)?;
            erased.entry(erasure.record).or_default().push(erasure.slot);
            if erasure.record == EntityRecord::RECORD_TYPE {
                report.erased_entities += 1;
            } else {
                report.erased_components += 1;
            }
        }
        for slots in erased.values_mut() {
            slots.sort_unstable();
        }

        // One repair pass: shift each slot by the erased slots below it.
        for record in self.columns[identity].iter_mut::<EntityRecord>()? {
            let shifts: Vec<(RecordTypeId, usize)> = record
                .slots()
                .filter_map(|(record_type, slot)| {
                    let below = erased
                        .get(&record_type)
                        .map_or(0, |e| e.partition_point(|&s| s < slot));
                    (below > 0).then_some((record_type, slot - below))
                })
                .collect();
            for (record_type, slot) in shifts {
                record.set_slot(record_type, slot);
            }
        }
        if erased.contains_key(&EntityRecord::RECORD_TYPE) {
            self.rebuild_entity_slots();
        }
        Ok(())
    }

    fn apply_inserts(
        &mut self,
        inserts: Vec<(EntityId, RecordTypeId, Box<dyn Any + Send>)>,
        report: &mut MergeReport,
    ) -> Result<(), EcsError> {
        if inserts.is_empty() {
            return Ok(());
        }
        let identity = EntityRecord::RECORD_TYPE.index();
        for (entity, record_type, value) in inserts {
            let Some(entity_slot) = self.find_slot(entity) else {
                warn!(%entity, ?record_type, "insert targets a missing entity; skipped");
                report.skipped += 1;
                continue;
            };
            let record = self.columns[identity].get::<EntityRecord>(entity_slot)?;
            if record.lifecycle() != Lifecycle::Active {
                warn!(%entity, ?record_type, "insert targets an entity being removed; skipped");
                report.skipped += 1;
                continue;
            }
            match record.get_component(record_type) {
                Some(slot) => self.columns[record_type.index()].set_boxed(slot, value)?,
                None => {
                    let slot = self.columns[record_type.index()].push_boxed(value)?;
                    self.columns[identity]
                        .get_mut::<EntityRecord>(entity_slot)?
                        .add_component(record_type, slot);
                }
            }
            report.inserted_components += 1;
        }
        Ok(())
    }
}

/// Sort by column, then descending slot, merging duplicates.
fn dedupe_erasures(mut erasures: Vec<Erasure>) -> Vec<Erasure> {
    erasures.sort_by(|a, b| a.record.cmp(&b.record).then(b.slot.cmp(&a.slot)));
    let mut out: Vec<Erasure> = Vec::with_capacity(erasures.len());
    for erasure in erasures {
        match out.last_mut() {
            Some(last) if last.record == erasure.record && last.slot == erasure.slot => {
                trace!(record = ?erasure.record, slot = erasure.slot, "duplicate erase collapsed");
                last.hard |= erasure.hard;
            }
            _ => out.push(erasure),
        }
    }
    out
}

// ---------------------------------------------------------------------------
// WorldHandle
// ---------------------------------------------------------------------------

/// The mutation capability a system receives for one call.
///
/// Every request is deferred to the next merge except
/// [`request_remove_entity`](Self::request_remove_entity), which flips the
/// entity's lifecycle immediately so later fetches start retiring it.
///
/// A handle also gives read access back to the store, minus the types the
/// running fetch writes: while a system holds `&mut T`, reading `T` through
/// [`get`](Self::get), [`resource`](Self::resource) or [`query`](Self::query)
/// fails with [`EcsError::ConflictingAccess`].
#[derive(Debug, Clone, Copy)]
pub struct WorldHandle<'s> {
    store: &'s Store,
    /// Types the running fetch hands out `&mut` references into.
    writes: RecordMask,
}

impl<'s> WorldHandle<'s> {
    pub(crate) fn new(store: &'s Store, writes: RecordMask) -> Self {
        Self { store, writes }
    }

    /// Types this handle refuses to read.
    pub fn writes(&self) -> RecordMask {
        self.writes
    }

    // -- reads ----------------------------------------------------------------

    pub fn type_id_of<T: 'static>(&self) -> Result<RecordTypeId, EcsError> {
        self.store.type_id_of::<T>()
    }

    pub fn entity_count(&self) -> usize {
        self.store.entity_count()
    }

    pub fn contains(&self, entity: EntityId) -> bool {
        self.store.contains(entity)
    }

    /// Identity records are never handed out mutably, so this is always
    /// allowed.
    pub fn find_record(&self, entity: EntityId) -> Option<&'s EntityRecord> {
        self.store.find_record(entity)
    }

    /// Component `T` of `entity`, if it is recorded.
    pub fn get<T: Record>(&self, entity: EntityId) -> Result<Option<&'s T>, EcsError> {
        self.readable::<T>()?;
        Ok(self.store.get::<T>(entity))
    }

    pub fn resource<T: Record>(&self) -> Result<&'s T, EcsError> {
        self.readable::<T>()?;
        self.store.resource::<T>()
    }

    /// [`Store::query`] restricted to types the running fetch does not write.
    pub fn query<Q: Query>(&self) -> Result<Vec<Q::Item<'s>>, EcsError> {
        if let Some(hit) = Q::accesses(self.store)?
            .iter()
            .find(|a| self.writes.contains(a.record))
        {
            return Err(EcsError::ConflictingAccess { name: hit.name });
        }
        self.store.query::<Q>()
    }

    fn readable<T: 'static>(&self) -> Result<RecordTypeId, EcsError> {
        let record = self.store.type_id_of::<T>()?;
        if self.writes.contains(record) {
            return Err(EcsError::ConflictingAccess {
                name: std::any::type_name::<T>(),
            });
        }
        Ok(record)
    }

    // -- requests -------------------------------------------------------------

    /// Flag `record`'s entity for removal. Returns `false` if it already was.
    pub fn request_remove_entity(&self, record: &EntityRecord) -> bool {
        let flagged = record.flag_for_removal();
        if !flagged {
            trace!(entity = %record.id(), "entity already flagged for removal");
        }
        flagged
    }

    /// Queue a hard removal of component `T` from `record`'s entity.
    pub fn request_remove_component<T: Record>(&self, record: &EntityRecord) -> Result<(), EcsError> {
        let record_type = self.store.type_id_of::<T>()?;
        let invalid = |reason: &'static str| EcsError::InvalidRemoval {
            entity: record.id(),
            record: std::any::type_name::<T>(),
            reason,
        };
        if record_type == EntityRecord::RECORD_TYPE {
            return Err(invalid("the identity record cannot be removed directly"));
        }
        if !record.has_component(record_type) {
            return Err(invalid("entity does not own this component"));
        }
        let slot = record
            .get_component(record_type)
            .ok_or_else(|| invalid("component is already being erased"))?;
        let entity_slot = record
            .get_component(EntityRecord::RECORD_TYPE)
            .ok_or(EcsError::MissingSlot {
                entity: record.id(),
                record: std::any::type_name::<EntityRecord>(),
            })?;
        self.store.log.push(Mutation::EraseComponent {
            entity_slot,
            record: record_type,
            slot,
            hard: true,
        });
        Ok(())
    }

    /// Queue attaching `value` to `entity`, overwriting any value it already
    /// has for `T`.
    pub fn request_insert_component<T: Record>(
        &self,
        entity: EntityId,
        value: T,
    ) -> Result<(), EcsError> {
        let record = self.store.component_type_of::<T>()?;
        self.store.log.push(Mutation::InsertComponent {
            entity,
            record,
            value: Box::new(value),
        });
        Ok(())
    }

    /// Start a deferred spawn. The id is allocated right away; the entity
    /// appears in the store at the next merge.
    pub fn request_new_entity(&self) -> PendingEntity<'s> {
        PendingEntity {
            store: self.store,
            bundle: EntityBundle::new(),
            error: None,
        }
    }
}

// ---------------------------------------------------------------------------
// PendingEntity
// ---------------------------------------------------------------------------

/// Builder for a deferred spawn, see [`WorldHandle::request_new_entity`].
pub struct PendingEntity<'s> {
    store: &'s Store,
    bundle: EntityBundle,
    error: Option<EcsError>,
}

impl<'s> PendingEntity<'s> {
    pub fn with<T: Record>(mut self, value: T) -> Self {
        if self.error.is_none() {
            if let Err(e) = self.bundle.add(self.store, value) {
                self.error = Some(e);
            }
        }
        self
    }

    /// Queue the spawn and return the new entity's id.
    pub fn finish(self) -> Result<EntityId, EcsError> {
        if let Some(e) = self.error {
            return Err(e);
        }
        let entity = self.store.next_entity_id();
        self.store.log.push(Mutation::SpawnEntity {
            entity,
            bundle: self.bundle,
        });
        Ok(entity)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
