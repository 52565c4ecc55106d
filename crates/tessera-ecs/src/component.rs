//! Record type registration and metadata.
//!
//! Every type stored in the [`Store`](crate::store::Store) -- per-entity
//! components and global resources alike -- is registered once in a
//! [`RecordRegistry`] before the store is sealed. Registration produces a
//! [`RecordTypeId`] that doubles as the index of the type's column and as the
//! bit position in entity masks.

use std::any::TypeId;
use std::collections::HashMap;
use std::fmt;

use crate::EcsError;

/// Maximum number of record types a store can hold, the identity type
/// included. Entity masks are a single `u64`.
pub const MAX_RECORD_TYPES: usize = 64;

// ---------------------------------------------------------------------------
// Record
// ---------------------------------------------------------------------------

/// Marker for types that can live in a store column.
///
/// Columns are shared across worker threads during a stage, so every record
/// type must be `Send + Sync`.
pub trait Record: Send + Sync + 'static {}

impl<T: Send + Sync + 'static> Record for T {}

// ---------------------------------------------------------------------------
// RecordTypeId
// ---------------------------------------------------------------------------

/// Opaque, stable identifier for a registered record type.
///
/// Ids are dense and assigned in registration order; they are never reused or
/// reassigned once the store is sealed.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordTypeId(pub(crate) u32);

impl RecordTypeId {
    /// Position of the record's column in the store (and its mask bit).
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for RecordTypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RecordTypeId({})", self.0)
    }
}

// ---------------------------------------------------------------------------
// RecordKind / RecordInfo
// ---------------------------------------------------------------------------

/// Whether a record type is stored per entity or as a global singleton.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordKind {
    /// One element per owning entity.
    Component,
    /// Exactly one element, shared by every fetch that names the type.
    Resource,
}

/// Metadata about a registered record type.
#[derive(Debug, Clone)]
pub struct RecordInfo {
    /// Id assigned at registration time.
    pub id: RecordTypeId,
    /// `std::any::type_name::<T>()`, used in diagnostics.
    pub name: &'static str,
    /// Component or resource.
    pub kind: RecordKind,
    /// Rust `TypeId` for runtime type checking.
    pub type_id: TypeId,
}

// ---------------------------------------------------------------------------
// RecordRegistry
// ---------------------------------------------------------------------------

/// Registry mapping Rust types to [`RecordTypeId`]s and their metadata.
#[derive(Debug, Default)]
pub struct RecordRegistry {
    by_type: HashMap<TypeId, RecordTypeId>,
    /// Indexed by `RecordTypeId.0`.
    infos: Vec<RecordInfo>,
}

impl RecordRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry whose only entry is `T`, at id 0.
    pub(crate) fn seeded<T: Record>(kind: RecordKind) -> (Self, RecordInfo) {
        let mut registry = Self::new();
        let info = registry.insert::<T>(kind);
        (registry, info)
    }

    /// Register `T` with the given kind.
    ///
    /// Unlike a lenient registry, a second registration of the same type is an
    /// error: the id a type receives must be unambiguous.
    pub fn register<T: Record>(&mut self, kind: RecordKind) -> Result<RecordTypeId, EcsError> {
        self.register_info::<T>(kind).map(|info| info.id)
    }

    /// [`register`](Self::register), returning the new type's metadata.
    pub fn register_info<T: Record>(&mut self, kind: RecordKind) -> Result<RecordInfo, EcsError> {
        if self.by_type.contains_key(&TypeId::of::<T>()) {
            return Err(EcsError::AlreadyRegistered {
                name: std::any::type_name::<T>(),
            });
        }
        if self.infos.len() >= MAX_RECORD_TYPES {
            return Err(EcsError::TooManyRecordTypes {
                limit: MAX_RECORD_TYPES,
            });
        }
        Ok(self.insert::<T>(kind))
    }

    fn insert<T: Record>(&mut self, kind: RecordKind) -> RecordInfo {
        let info = RecordInfo {
            id: RecordTypeId(self.infos.len() as u32),
            name: std::any::type_name::<T>(),
            kind,
            type_id: TypeId::of::<T>(),
        };
        self.infos.push(info.clone());
        self.by_type.insert(info.type_id, info.id);
        info
    }

    /// Look up a record type by its Rust `TypeId`.
    pub fn lookup<T: 'static>(&self) -> Option<RecordTypeId> {
        self.by_type.get(&TypeId::of::<T>()).copied()
    }

    /// Like [`lookup`](Self::lookup), but unknown types are `NotRegistered`.
    pub fn require<T: 'static>(&self) -> Result<RecordTypeId, EcsError> {
        self.lookup::<T>().ok_or(EcsError::NotRegistered {
            name: std::any::type_name::<T>(),
        })
    }

    /// Get the [`RecordInfo`] for a registered id.
    pub fn get_info(&self, id: RecordTypeId) -> Option<&RecordInfo> {
        self.infos.get(id.index())
    }

    /// All registered infos, in id order.
    pub fn infos(&self) -> &[RecordInfo] {
        &self.infos
    }

    /// Total number of registered record types.
    pub fn len(&self) -> usize {
        self.infos.len()
    }

    /// Whether any record types have been registered.
    pub fn is_empty(&self) -> bool {
        self.infos.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[allow(dead_code)]
    #[derive(Debug, Clone)]
    struct Pos {
        x: f32,
        y: f32,
    }

    #[allow(dead_code)]
    #[derive(Debug, Clone)]
    struct Vel {
        dx: f32,
        dy: f32,
    }

    #[test]
    fn register_and_lookup() {
        let mut reg = RecordRegistry::new();
        let id = reg.register::<Pos>(RecordKind::Component).unwrap();
        assert_eq!(reg.lookup::<Pos>(), Some(id));
        assert_eq!(reg.require::<Pos>().unwrap(), id);
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut reg = RecordRegistry::new();
        reg.register::<Pos>(RecordKind::Component).unwrap();
        let err = reg.register::<Pos>(RecordKind::Resource).unwrap_err();
        assert!(matches!(err, EcsError::AlreadyRegistered { .. }));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn ids_are_dense_and_distinct() {
        let mut reg = RecordRegistry::new();
        let p = reg.register::<Pos>(RecordKind::Component).unwrap();
        let v = reg.register::<Vel>(RecordKind::Component).unwrap();
        assert_ne!(p, v);
        assert_eq!(p.index(), 0);
        assert_eq!(v.index(), 1);
    }

    #[test]
    fn unknown_type_is_not_registered() {
        let reg = RecordRegistry::new();
        assert!(matches!(
            reg.require::<Vel>(),
            Err(EcsError::NotRegistered { .. })
        ));
    }

    #[test]
    fn info_correctness() {
        let mut reg = RecordRegistry::new();
        let id = reg.register::<Pos>(RecordKind::Resource).unwrap();
        let info = reg.get_info(id).unwrap();
        assert_eq!(info.kind, RecordKind::Resource);
        assert!(info.name.ends_with("Pos"));
        assert_eq!(info.type_id, TypeId::of::<Pos>());
    }

    #[test]
    fn capacity_is_enforced() {
        let mut reg = RecordRegistry::new();
        macro_rules! register_many {
            ($($n:literal)*) => {
                $(
                    {
                        struct Marker<const N: usize>;
                        reg.register::<Marker<$n>>(RecordKind::Component).unwrap();
                    }
                )*
            };
        }
        register_many!(
            0 1 2 3 4 5 6 7 8 9 10 11 12 13 14 15 16 17 18 19 20 21 22 23 24 25 26 27 28 29 30 31
            32 33 34 35 36 37 38 39 40 41 42 43 44 45 46 47 48 49 50 51 52 53 54 55 56 57 58 59 60 61 62 63
        );
        assert_eq!(reg.len(), MAX_RECORD_TYPES);
        let err = reg.register::<Pos>(RecordKind::Component).unwrap_err();
        assert!(matches!(err, EcsError::TooManyRecordTypes { limit: 64 }));
    }
}
