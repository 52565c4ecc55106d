//! Tessera ECS -- column storage, entity bookkeeping, and deferred mutation.
//!
//! Every registered record type gets one [`TypedColumn`](column::TypedColumn):
//! a type-erased, runtime-checked vector. Entities are elements of the
//! identity column and remember which slot they occupy in every other
//! column. Systems fetch the entities that own a required set of types and
//! queue structural edits (removals, inserts, spawns) that the store applies
//! in a single-threaded merge.
//!
//! # Quick Start
//!
//! ```
//! use tessera_ecs::prelude::*;
//!
//! #[derive(Debug, Clone, PartialEq)]
//! struct Position { x: f32, y: f32 }
//!
//! #[derive(Debug, Clone, PartialEq)]
//! struct Velocity { dx: f32, dy: f32 }
//!
//! let mut builder = StoreBuilder::new();
//! builder.register_component::<Position>().unwrap();
//! builder.register_component::<Velocity>().unwrap();
//! let mut store = builder.seal();
//!
//! let entity = store
//!     .build_entity()
//!     .with(Position { x: 0.0, y: 0.0 })
//!     .with(Velocity { dx: 2.0, dy: 1.0 })
//!     .finish()
//!     .unwrap();
//!
//! store
//!     .fetch::<(Write<Position>, Read<Velocity>)>(|(p, v)| {
//!         p.x += v.dx;
//!         p.y += v.dy;
//!     })
//!     .unwrap();
//!
//! assert_eq!(store.get::<Position>(entity), Some(&Position { x: 2.0, y: 1.0 }));
//! ```

#![deny(unsafe_code)]

#[allow(unsafe_code)]
pub mod column;
pub mod component;
pub mod entity;
pub mod mask;
pub mod mutation;
#[allow(unsafe_code)]
pub mod query;
#[allow(unsafe_code)]
pub mod store;

pub use component::MAX_RECORD_TYPES;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors produced by store operations.
///
/// Apart from [`InvalidRemoval`](EcsError::InvalidRemoval), these are setup or
/// integrity faults: they are not retried and are expected to abort whatever
/// raised them.
#[derive(Debug, thiserror::Error)]
pub enum EcsError {
    /// A record type was used before being registered.
    #[error("record type '{name}' is not registered")]
    NotRegistered { name: &'static str },

    /// A record type was registered twice.
    #[error("record type '{name}' is already registered")]
    AlreadyRegistered { name: &'static str },

    /// More record types than an entity mask can describe.
    #[error("cannot register more than {limit} record types")]
    TooManyRecordTypes { limit: usize },

    /// A column was accessed with the wrong element type.
    #[error("column of '{expected}' accessed as '{found}'")]
    TypeMismatch {
        expected: &'static str,
        found: &'static str,
    },

    /// A resource or the identity record was attached to an entity.
    #[error("'{name}' is not a per-entity component")]
    NotAComponent { name: &'static str },

    /// The same component type was attached twice to one new entity.
    #[error("component '{name}' attached twice to one entity")]
    DuplicateComponent { name: &'static str },

    /// A query writes a type it also accesses elsewhere, or writes the
    /// identity record.
    #[error("query has conflicting access to '{name}'")]
    ConflictingAccess { name: &'static str },

    /// A component removal that can never be valid.
    #[error("cannot remove '{record}' from entity {entity}: {reason}")]
    InvalidRemoval {
        entity: entity::EntityId,
        record: &'static str,
        reason: &'static str,
    },

    /// A live entity owns a type but has no recorded slot for it.
    #[error("entity {entity} owns '{record}' but has no slot for it")]
    MissingSlot {
        entity: entity::EntityId,
        record: &'static str,
    },

    /// A slot index beyond the end of its column.
    #[error("slot {index} out of range for column '{record}' of length {len}")]
    SlotOutOfRange {
        record: &'static str,
        index: usize,
        len: usize,
    },
}

// ---------------------------------------------------------------------------
// Prelude
// ---------------------------------------------------------------------------

/// Convenience re-exports for common usage.
pub mod prelude {
    pub use crate::column::TypedColumn;
    pub use crate::component::{Record, RecordInfo, RecordKind, RecordRegistry, RecordTypeId};
    pub use crate::entity::{EntityId, EntityRecord, Lifecycle};
    pub use crate::mask::RecordMask;
    pub use crate::mutation::{MergeReport, Mutation, MutationLog, PendingEntity, WorldHandle};
    pub use crate::query::{Access, Query, QueryItem, Read, Write};
    pub use crate::store::{EntityBuilder, EntityBundle, Store, StoreBuilder};
    pub use crate::EcsError;
}

// ---------------------------------------------------------------------------
// Integration Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use crate::prelude::*;

    // -- test record types --------------------------------------------------

    #[derive(Debug, Clone, PartialEq)]
    struct Position {
        x: f32,
        y: f32,
    }

    #[derive(Debug, Clone, PartialEq)]
    struct Velocity {
        dx: f32,
        dy: f32,
    }

    #[derive(Debug, Clone, PartialEq)]
    struct Health(u32);

    #[derive(Debug, Clone, PartialEq)]
    struct Gravity(f32);

    fn setup_store() -> Store {
        let mut builder = StoreBuilder::new();
        builder.register_component::<Position>().unwrap();
        builder.register_component::<Velocity>().unwrap();
        builder.register_component::<Health>().unwrap();
        builder.register_resource(Gravity(-1.0)).unwrap();
        builder.seal()
    }

    // -- end to end ---------------------------------------------------------

    #[test]
    fn movement_touches_only_matching_entities() {
        let mut store = setup_store();
        let moving = store
            .build_entity()
            .with(Position { x: 0.0, y: 0.0 })
            .with(Velocity { dx: 2.0, dy: 1.0 })
            .finish()
            .unwrap();
        let still = store
            .build_entity()
            .with(Position { x: 5.0, y: 5.0 })
            .finish()
            .unwrap();

        store
            .fetch::<(Write<Position>, Read<Velocity>)>(|(p, v)| {
                p.x += v.dx;
                p.y += v.dy;
            })
            .unwrap();
        store.merge().unwrap();

        assert_eq!(
            store.get::<Position>(moving),
            Some(&Position { x: 2.0, y: 1.0 })
        );
        assert_eq!(
            store.get::<Position>(still),
            Some(&Position { x: 5.0, y: 5.0 })
        );
    }

    #[test]
    fn systems_remove_through_the_handle() {
        let mut store = setup_store();
        for hp in [0, 5, 0, 7] {
            store
                .build_entity()
                .with(Health(hp))
                .with(Position { x: hp as f32, y: 0.0 })
                .finish()
                .unwrap();
        }

        // A "reaper" pass flags dead entities through the capability.
        {
            let handle = store.handle();
            let dead: Vec<&EntityRecord> = handle
                .query::<(Read<EntityRecord>, Read<Health>)>()
                .unwrap()
                .into_iter()
                .filter(|(_, h)| h.0 == 0)
                .map(|(rec, _)| rec)
                .collect();
            for rec in dead {
                handle.request_remove_entity(rec);
            }
        }

        // Every owned type must be fetched once for the entity to go away.
        store.fetch::<(Read<Health>, Read<Position>)>(|_| {}).unwrap();
        let report = store.merge().unwrap();
        assert_eq!(report.erased_entities, 2);
        assert_eq!(report.erased_components, 4);

        let left: Vec<u32> = store
            .query::<(Read<Health>,)>()
            .unwrap()
            .into_iter()
            .map(|(h,)| h.0)
            .collect();
        assert_eq!(left, vec![5, 7]);
        assert_eq!(store.column_of::<Position>().unwrap().len(), 2);
    }

    #[test]
    fn resource_column_survives_many_merges() {
        let mut store = setup_store();
        for _ in 0..4 {
            let e = store
                .build_entity()
                .with(Velocity { dx: 0.0, dy: 0.0 })
                .finish()
                .unwrap();
            store
                .handle()
                .request_remove_entity(store.find_record(e).unwrap());
        }
        for _ in 0..3 {
            store
                .fetch::<(Write<Velocity>, Read<Gravity>)>(|(v, g)| v.dy += g.0)
                .unwrap();
            store.merge().unwrap();
            assert_eq!(store.column_of::<Gravity>().unwrap().len(), 1);
        }
        assert_eq!(store.entity_count(), 0);
        assert_eq!(store.resource::<Gravity>().unwrap(), &Gravity(-1.0));
    }

    #[test]
    fn errors_render_readable_messages() {
        let store = setup_store();
        let err = store.type_id_of::<String>().unwrap_err();
        assert!(err.to_string().contains("not registered"));
    }
}
