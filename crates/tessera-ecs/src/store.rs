//! The [`Store`] owns every column, the entity id source, and the mutation
//! log.
//!
//! A store is assembled by a [`StoreBuilder`]: record types are registered,
//! resources receive their initial value, and [`StoreBuilder::seal`] freezes
//! the column list. After sealing no column is ever added or removed.
//!
//! The identity type, [`EntityRecord`], is registered first and lives in
//! column 0. Every entity is one element of that column, and each record
//! remembers its own slot there as well as its slot in every other column it
//! occupies.

use std::any::Any;
use std::collections::HashMap;

use crate::column::TypedColumn;
use crate::component::{Record, RecordKind, RecordRegistry, RecordTypeId};
use crate::entity::{EntityId, EntityIdGenerator, EntityRecord};
use crate::mask::RecordMask;
use crate::mutation::{Mutation, MutationLog, WorldHandle};
use crate::query::{required_mask, Access, Query};
use crate::EcsError;

// ---------------------------------------------------------------------------
// StoreBuilder
// ---------------------------------------------------------------------------

/// Registration phase of a [`Store`].
///
/// Consumed by [`seal`](Self::seal), so registering after sealing does not
/// compile.
#[derive(Debug)]
pub struct StoreBuilder {
    registry: RecordRegistry,
    columns: Vec<TypedColumn>,
}

impl StoreBuilder {
    /// A builder with the identity type already registered.
    pub fn new() -> Self {
        let (registry, identity) = RecordRegistry::seeded::<EntityRecord>(RecordKind::Component);
        debug_assert_eq!(identity.id, EntityRecord::RECORD_TYPE);
        let columns = vec![TypedColumn::component::<EntityRecord>(&identity)];
        Self { registry, columns }
    }

    /// Register a per-entity component type.
    pub fn register_component<T: Record>(&mut self) -> Result<RecordTypeId, EcsError> {
        let info = self.registry.register_info::<T>(RecordKind::Component)?;
        self.columns.push(TypedColumn::component::<T>(&info));
        Ok(info.id)
    }

    /// Register a global singleton with its initial value.
    pub fn register_resource<T: Record>(&mut self, value: T) -> Result<RecordTypeId, EcsError> {
        let info = self.registry.register_info::<T>(RecordKind::Resource)?;
        self.columns.push(TypedColumn::resource(&info, value));
        Ok(info.id)
    }

    /// Freeze the column list and compute the component mask.
    pub fn seal(self) -> Store {
        let component_mask = self
            .registry
            .infos()
            .iter()
            .filter(|info| info.kind == RecordKind::Component)
            .map(|info| info.id)
            .collect();
        Store {
            registry: self.registry,
            columns: self.columns,
            component_mask,
            ids: EntityIdGenerator::new(),
            entity_slots: HashMap::new(),
            log: MutationLog::new(),
        }
    }
}

impl Default for StoreBuilder {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// EntityBundle
// ---------------------------------------------------------------------------

/// Type-erased component values waiting to become an entity.
///
/// Each value is checked against the store when it is added, so applying a
/// bundle never fails halfway through.
#[derive(Default)]
pub struct EntityBundle {
    pub(crate) values: Vec<(RecordTypeId, Box<dyn Any + Send>)>,
    mask: RecordMask,
}

impl EntityBundle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `value`, rejecting unregistered types, resources, the identity
    /// type, and a second value of a type already present.
    pub fn add<T: Record>(&mut self, store: &Store, value: T) -> Result<(), EcsError> {
        let record = store.component_type_of::<T>()?;
        if self.mask.contains(record) {
            return Err(EcsError::DuplicateComponent {
                name: std::any::type_name::<T>(),
            });
        }
        self.mask.insert(record);
        self.values.push((record, Box::new(value)));
        Ok(())
    }

    /// Types in the bundle.
    pub fn mask(&self) -> RecordMask {
        self.mask
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl std::fmt::Debug for EntityBundle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityBundle").field("mask", &self.mask).finish()
    }
}

// ---------------------------------------------------------------------------
// EntityBuilder
// ---------------------------------------------------------------------------

/// Attaches components to a new entity, then finalizes it.
///
/// The first error from [`with`](Self::with) is kept and returned by
/// [`finish`](Self::finish); nothing is pushed into any column until then.
pub struct EntityBuilder<'s> {
    store: &'s mut Store,
    bundle: EntityBundle,
    error: Option<EcsError>,
}

impl<'s> EntityBuilder<'s> {
    pub fn with<T: Record>(mut self, value: T) -> Self {
        if self.error.is_none() {
            if let Err(e) = self.bundle.add(self.store, value) {
                self.error = Some(e);
            }
        }
        self
    }

    /// Push every attached value and the entity's own record.
    pub fn finish(self) -> Result<EntityId, EcsError> {
        if let Some(e) = self.error {
            return Err(e);
        }
        let id = self.store.ids.next_id();
        self.store.spawn_bundle(id, self.bundle)?;
        Ok(id)
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Typed columns for every registered record type, plus entity bookkeeping.
#[derive(Debug)]
pub struct Store {
    pub(crate) registry: RecordRegistry,
    pub(crate) columns: Vec<TypedColumn>,
    component_mask: RecordMask,
    ids: EntityIdGenerator,
    /// Identity slot of every entity; rebuilt by merges that erase entities.
    entity_slots: HashMap<EntityId, usize>,
    pub(crate) log: MutationLog,
}

impl Store {
    // -- registry ------------------------------------------------------------

    pub fn registry(&self) -> &RecordRegistry {
        &self.registry
    }

    /// Id of a registered record type.
    pub fn type_id_of<T: 'static>(&self) -> Result<RecordTypeId, EcsError> {
        self.registry.require::<T>()
    }

    /// Id of `T`, which must be a component other than the identity type.
    pub(crate) fn component_type_of<T: 'static>(&self) -> Result<RecordTypeId, EcsError> {
        let record = self.type_id_of::<T>()?;
        if record == EntityRecord::RECORD_TYPE || !self.component_mask.contains(record) {
            return Err(EcsError::NotAComponent {
                name: std::any::type_name::<T>(),
            });
        }
        Ok(record)
    }

    /// Bits of every true component type, the identity type included.
    /// Resources are excluded.
    pub fn component_mask(&self) -> RecordMask {
        self.component_mask
    }

    pub fn identity_type(&self) -> RecordTypeId {
        EntityRecord::RECORD_TYPE
    }

    /// Bits an entity must own to be yielded by a fetch of `Q`.
    pub fn mask_for<Q: Query>(&self) -> Result<RecordMask, EcsError> {
        Ok(required_mask(&Q::accesses(self)?, self.component_mask))
    }

    // -- columns -------------------------------------------------------------

    /// Column of a registered id. Ids come from this store's registry.
    pub fn column(&self, id: RecordTypeId) -> &TypedColumn {
        &self.columns[id.index()]
    }

    pub fn column_of<T: 'static>(&self) -> Result<&TypedColumn, EcsError> {
        Ok(&self.columns[self.type_id_of::<T>()?.index()])
    }

    pub fn column_of_mut<T: 'static>(&mut self) -> Result<&mut TypedColumn, EcsError> {
        let id = self.type_id_of::<T>()?;
        Ok(&mut self.columns[id.index()])
    }

    pub fn columns(&self) -> &[TypedColumn] {
        &self.columns
    }

    fn identity_column(&self) -> &TypedColumn {
        &self.columns[EntityRecord::RECORD_TYPE.index()]
    }

    // -- entities ------------------------------------------------------------

    /// Start building a new entity.
    pub fn build_entity(&mut self) -> EntityBuilder<'_> {
        EntityBuilder {
            store: self,
            bundle: EntityBundle::new(),
            error: None,
        }
    }

    /// Entities currently in the identity column, including ones flagged or
    /// staged for removal.
    pub fn entity_count(&self) -> usize {
        self.identity_column().len()
    }

    /// Every entity record in identity-slot order.
    pub fn records(&self) -> impl Iterator<Item = &EntityRecord> {
        self.identity_column()
            .iter::<EntityRecord>()
            .into_iter()
            .flatten()
    }

    pub fn find_record(&self, entity: EntityId) -> Option<&EntityRecord> {
        let slot = self.find_slot(entity)?;
        self.identity_column().get::<EntityRecord>(slot).ok()
    }

    /// Identity slot of `entity`.
    pub(crate) fn find_slot(&self, entity: EntityId) -> Option<usize> {
        self.entity_slots.get(&entity).copied()
    }

    pub(crate) fn rebuild_entity_slots(&mut self) {
        let slots: HashMap<EntityId, usize> = self
            .records()
            .enumerate()
            .map(|(slot, record)| (record.id(), slot))
            .collect();
        self.entity_slots = slots;
    }

    /// Whether `entity` is still present in the identity column.
    pub fn contains(&self, entity: EntityId) -> bool {
        self.find_record(entity).is_some()
    }

    /// Component `T` of `entity`, if it is recorded.
    pub fn get<T: Record>(&self, entity: EntityId) -> Option<&T> {
        let record_type = self.registry.lookup::<T>()?;
        let slot = self.find_record(entity)?.get_component(record_type)?;
        self.columns[record_type.index()].get::<T>(slot).ok()
    }

    pub fn get_mut<T: Record>(&mut self, entity: EntityId) -> Option<&mut T> {
        let record_type = self.registry.lookup::<T>()?;
        let slot = self.find_record(entity)?.get_component(record_type)?;
        self.columns[record_type.index()].get_mut::<T>(slot).ok()
    }

    pub fn resource<T: Record>(&self) -> Result<&T, EcsError> {
        self.column_of::<T>()?.get::<T>(0)
    }

    pub fn resource_mut<T: Record>(&mut self) -> Result<&mut T, EcsError> {
        self.column_of_mut::<T>()?.get_mut::<T>(0)
    }

    pub(crate) fn next_entity_id(&self) -> EntityId {
        self.ids.next_id()
    }

    /// Append a validated bundle as a new entity. Returns its identity slot.
    pub(crate) fn spawn_bundle(
        &mut self,
        id: EntityId,
        bundle: EntityBundle,
    ) -> Result<usize, EcsError> {
        let mut record = EntityRecord::new(id, self.columns.len());
        for (record_type, value) in bundle.values {
            let slot = self.columns[record_type.index()].push_boxed(value)?;
            record.add_component(record_type, slot);
        }
        let identity = &mut self.columns[EntityRecord::RECORD_TYPE.index()];
        record.add_component(EntityRecord::RECORD_TYPE, identity.len());
        let slot = identity.push(record)?;
        self.entity_slots.insert(id, slot);
        Ok(slot)
    }

    // -- mutation ------------------------------------------------------------

    /// The mutation capability for code that holds no `&mut` into any
    /// column.
    pub fn handle(&self) -> WorldHandle<'_> {
        WorldHandle::new(self, RecordMask::EMPTY)
    }

    /// The capability to pass alongside items fetched with `accesses`: it
    /// refuses reads of every type they write.
    pub fn handle_for(&self, accesses: &[Access]) -> WorldHandle<'_> {
        let writes = accesses
            .iter()
            .filter(|a| a.mutable)
            .map(|a| a.record)
            .collect();
        WorldHandle::new(self, writes)
    }

    /// Deferred edits queued since the last merge.
    pub fn pending_mutations(&self) -> &MutationLog {
        &self.log
    }

    // -- fetch ---------------------------------------------------------------

    /// Run `f` once per entity that owns every component `Q` names.
    ///
    /// Entities flagged for removal are not yielded; instead the matched
    /// components are retired and queued for erasure, and the entity itself
    /// is staged once only its identity record is left. Returns how many
    /// entities were yielded.
    pub fn fetch<Q: Query>(
        &mut self,
        f: impl for<'r> FnMut(Q::Item<'r>),
    ) -> Result<usize, EcsError> {
        // Safety: `&mut self` rules out every other reference into the store.
        unsafe { self.fetch_shared::<Q>(f) }
    }

    /// [`fetch`](Self::fetch) through a shared reference.
    ///
    /// # Safety
    ///
    /// No other fetch running at the same time may access a record type
    /// mutably that `Q` also accesses, and `Q` may not write a type that a
    /// concurrent fetch reads. The dispatcher relies on the schedule's
    /// dependency declarations for this.
    ///
    /// `f` may reach the store only through a handle made by
    /// [`handle_for`](Self::handle_for) with `Q`'s accesses.
    pub unsafe fn fetch_shared<Q: Query>(
        &self,
        mut f: impl for<'r> FnMut(Q::Item<'r>),
    ) -> Result<usize, EcsError> {
        let accesses = Q::accesses(self)?;
        let required = required_mask(&accesses, self.component_mask);
        let retirable = required.without(RecordMask::single(EntityRecord::RECORD_TYPE));

        let mut matched = 0;
        for (slot, record) in self.identity_column().iter::<EntityRecord>()?.enumerate() {
            if !record.has_components(required) {
                continue;
            }
            if record.is_flagged_for_removal() {
                self.retire(slot, record, retirable);
                continue;
            }
            f(Q::fetch(self, &accesses, record)?);
            matched += 1;
        }
        Ok(matched)
    }

    /// Queue erasure of `record`'s components in `mask`, then stage the
    /// entity if nothing but its identity record remains valid.
    fn retire(&self, entity_slot: usize, record: &EntityRecord, mask: RecordMask) {
        let mut log = self.log.lock();
        for record_type in mask.iter() {
            if !record.retire_component(record_type) {
                continue;
            }
            if let Some(slot) = record.get_component(record_type) {
                log.push(Mutation::EraseComponent {
                    entity_slot,
                    record: record_type,
                    slot,
                    hard: false,
                });
            }
        }
        if !record.is_alive() && record.set_staged_for_removal() {
            log.push(Mutation::EraseEntity { slot: entity_slot });
        }
    }

    /// Collect the matches of a read-only `Q`.
    ///
    /// Unlike [`fetch`](Self::fetch) this never retires anything: entities
    /// that are not active are skipped.
    pub fn query<Q: Query>(&self) -> Result<Vec<Q::Item<'_>>, EcsError> {
        let accesses = Q::accesses(self)?;
        if let Some(write) = accesses.iter().find(|a| a.mutable) {
            return Err(EcsError::ConflictingAccess { name: write.name });
        }
        let required = required_mask(&accesses, self.component_mask);

        let mut items = Vec::new();
        for record in self.records() {
            if record.has_components(required) && !record.is_flagged_for_removal() {
                // Safety: every access is a read.
                items.push(unsafe { Q::fetch(self, &accesses, record)? });
            }
        }
        Ok(items)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
