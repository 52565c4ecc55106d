//! Type-erased record storage.
//!
//! A [`TypedColumn`] wraps one homogeneous `Vec` of a single record type
//! behind a non-generic handle, so the [`Store`](crate::store::Store) can keep
//! every column in one ordered list. Each typed access downcasts the erased
//! storage back to its concrete type; a failed downcast is a
//! [`EcsError::TypeMismatch`], an integrity fault that correct use of the
//! store never triggers.
//!
//! # Safety
//!
//! Elements sit in [`UnsafeCell`]s so systems can write element values
//! through a shared `&Store` while a stage runs. Handing out such a `&mut T`
//! is `unsafe` ([`TypedColumn::get_shared_mut`]): the caller guarantees no
//! other reference to the same element is alive. Structural operations
//! (push, erase) always take `&mut self`.
// Note: unsafe_code is allowed on this module via #[allow(unsafe_code)] in lib.rs

use std::any::Any;
use std::cell::UnsafeCell;

use tracing::trace;

use crate::component::{Record, RecordInfo, RecordKind, RecordTypeId};
use crate::EcsError;

// ---------------------------------------------------------------------------
// Slot / Storage -- the concrete, generic side
// ---------------------------------------------------------------------------

/// One element cell.
struct Slot<T>(UnsafeCell<T>);

// Shared access to a slot only hands out `&T`, or `&mut T` through the
// unsafe `get_shared_mut` whose caller upholds exclusivity.
unsafe impl<T: Send + Sync> Sync for Slot<T> {}

struct Storage<T> {
    items: Vec<Slot<T>>,
}

/// Operations the merge routine and the entity builder need without knowing
/// the element type.
trait ErasedStorage: Send + Sync {
    fn len(&self) -> usize;
    fn erase(&mut self, index: usize);
    fn accepts(&self, value: &dyn Any) -> bool;
    fn push_boxed(&mut self, value: Box<dyn Any + Send>) -> Result<usize, Box<dyn Any + Send>>;
    fn set_boxed(&mut self, index: usize, value: Box<dyn Any + Send>)
        -> Result<(), Box<dyn Any + Send>>;
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: Record> ErasedStorage for Storage<T> {
    fn len(&self) -> usize {
        self.items.len()
    }

    fn erase(&mut self, index: usize) {
        self.items.remove(index);
    }

    fn accepts(&self, value: &dyn Any) -> bool {
        value.is::<T>()
    }

    fn push_boxed(&mut self, value: Box<dyn Any + Send>) -> Result<usize, Box<dyn Any + Send>> {
        let value = value.downcast::<T>()?;
        self.items.push(Slot(UnsafeCell::new(*value)));
        Ok(self.items.len() - 1)
    }

    fn set_boxed(
        &mut self,
        index: usize,
        value: Box<dyn Any + Send>,
    ) -> Result<(), Box<dyn Any + Send>> {
        let value = value.downcast::<T>()?;
        *self.items[index].0.get_mut() = *value;
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

// ---------------------------------------------------------------------------
// TypedColumn -- the non-generic handle
// ---------------------------------------------------------------------------

/// Homogeneous, type-tagged growable storage for one record type.
///
/// Component columns grow and shrink with the entities that own the type.
/// Resource columns hold exactly one element for their whole lifetime:
/// `push` and `erase` are no-ops and every index resolves to slot 0.
pub struct TypedColumn {
    record: RecordTypeId,
    kind: RecordKind,
    type_name: &'static str,
    storage: Box<dyn ErasedStorage>,
}

impl std::fmt::Debug for TypedColumn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypedColumn")
            .field("record", &self.record)
            .field("kind", &self.kind)
            .field("type_name", &self.type_name)
            .field("len", &self.len())
            .finish()
    }
}

impl TypedColumn {
    /// Create an empty component column for `T`.
    pub fn component<T: Record>(info: &RecordInfo) -> Self {
        Self {
            record: info.id,
            kind: RecordKind::Component,
            type_name: std::any::type_name::<T>(),
            storage: Box::new(Storage::<T> { items: Vec::new() }),
        }
    }

    /// Create a resource column holding `value` as its sole element.
    pub fn resource<T: Record>(info: &RecordInfo, value: T) -> Self {
        Self {
            record: info.id,
            kind: RecordKind::Resource,
            type_name: std::any::type_name::<T>(),
            storage: Box::new(Storage::<T> {
                items: vec![Slot(UnsafeCell::new(value))],
            }),
        }
    }

    #[inline]
    pub fn record_id(&self) -> RecordTypeId {
        self.record
    }

    #[inline]
    pub fn kind(&self) -> RecordKind {
        self.kind
    }

    #[inline]
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// Number of stored elements. Always 1 for resources.
    #[inline]
    pub fn len(&self) -> usize {
        self.storage.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.storage.len() == 0
    }

    // -- typed access --------------------------------------------------------

    fn typed<T: Record>(&self) -> Result<&Storage<T>, EcsError> {
        self.storage
            .as_any()
            .downcast_ref::<Storage<T>>()
            .ok_or(EcsError::TypeMismatch {
                expected: self.type_name,
                found: std::any::type_name::<T>(),
            })
    }

    fn typed_mut<T: Record>(&mut self) -> Result<&mut Storage<T>, EcsError> {
        let expected = self.type_name;
        self.storage
            .as_any_mut()
            .downcast_mut::<Storage<T>>()
            .ok_or(EcsError::TypeMismatch {
                expected,
                found: std::any::type_name::<T>(),
            })
    }

    /// Resolve a requested index: resources always answer with slot 0.
    #[inline]
    fn resolve(&self, index: usize) -> Result<usize, EcsError> {
        let index = match self.kind {
            RecordKind::Resource => 0,
            RecordKind::Component => index,
        };
        if index >= self.len() {
            return Err(EcsError::SlotOutOfRange {
                record: self.type_name,
                index,
                len: self.len(),
            });
        }
        Ok(index)
    }

    /// Append `value` and return its slot index.
    ///
    /// On a resource column this is a no-op that returns slot 0.
    pub fn push<T: Record>(&mut self, value: T) -> Result<usize, EcsError> {
        let kind = self.kind;
        let storage = self.typed_mut::<T>()?;
        if kind == RecordKind::Resource {
            trace!(record = std::any::type_name::<T>(), "push on resource column ignored");
            return Ok(0);
        }
        storage.items.push(Slot(UnsafeCell::new(value)));
        Ok(storage.items.len() - 1)
    }

    pub fn get<T: Record>(&self, index: usize) -> Result<&T, EcsError> {
        let index = self.resolve(index)?;
        let storage = self.typed::<T>()?;
        // Safety: no `&mut T` to this element can be alive without the
        // caller of `get_shared_mut` having promised exclusivity.
        Ok(unsafe { &*storage.items[index].0.get() })
    }

    pub fn get_mut<T: Record>(&mut self, index: usize) -> Result<&mut T, EcsError> {
        let index = self.resolve(index)?;
        let storage = self.typed_mut::<T>()?;
        Ok(storage.items[index].0.get_mut())
    }

    /// Mutable element access through a shared reference.
    ///
    /// # Safety
    ///
    /// No other reference to the element at `index` (or, for a resource, to
    /// its sole element) may be alive while the returned reference is used.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn get_shared_mut<T: Record>(&self, index: usize) -> Result<&mut T, EcsError> {
        let index = self.resolve(index)?;
        let storage = self.typed::<T>()?;
        Ok(&mut *storage.items[index].0.get())
    }

    /// Overwrite the element at `index`.
    pub fn set<T: Record>(&mut self, index: usize, value: T) -> Result<(), EcsError> {
        *self.get_mut::<T>(index)? = value;
        Ok(())
    }

    /// Remove the element at `index`, shifting later elements down by one.
    ///
    /// Callers own index bookkeeping: every slot recorded above `index` is
    /// stale afterwards. On a resource column this is a no-op.
    pub fn erase(&mut self, index: usize) -> Result<(), EcsError> {
        if self.kind == RecordKind::Resource {
            trace!(record = self.type_name, index, "erase on resource column ignored");
            return Ok(());
        }
        if index >= self.len() {
            return Err(EcsError::SlotOutOfRange {
                record: self.type_name,
                index,
                len: self.len(),
            });
        }
        self.storage.erase(index);
        Ok(())
    }

    /// Iterate over every element in slot order.
    pub fn iter<T: Record>(&self) -> Result<impl Iterator<Item = &T>, EcsError> {
        let storage = self.typed::<T>()?;
        // Safety: see `get`.
        Ok(storage.items.iter().map(|slot| unsafe { &*slot.0.get() }))
    }

    pub fn iter_mut<T: Record>(&mut self) -> Result<impl Iterator<Item = &mut T>, EcsError> {
        let storage = self.typed_mut::<T>()?;
        Ok(storage.items.iter_mut().map(|slot| slot.0.get_mut()))
    }

    // -- erased access -------------------------------------------------------

    /// Whether `value` has this column's element type.
    pub fn accepts(&self, value: &dyn Any) -> bool {
        self.storage.accepts(value)
    }

    /// Append a boxed value of this column's element type.
    pub fn push_boxed(&mut self, value: Box<dyn Any + Send>) -> Result<usize, EcsError> {
        if self.kind == RecordKind::Resource {
            trace!(record = self.type_name, "push on resource column ignored");
            return Ok(0);
        }
        self.storage
            .push_boxed(value)
            .map_err(|_| EcsError::TypeMismatch {
                expected: self.type_name,
                found: "<boxed value>",
            })
    }

    /// Overwrite the element at `index` with a boxed value.
    pub fn set_boxed(&mut self, index: usize, value: Box<dyn Any + Send>) -> Result<(), EcsError> {
        let index = self.resolve(index)?;
        self.storage
            .set_boxed(index, value)
            .map_err(|_| EcsError::TypeMismatch {
                expected: self.type_name,
                found: "<boxed value>",
            })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
