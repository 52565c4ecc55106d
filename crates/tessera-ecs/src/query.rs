//! Fetch signatures.
//!
//! A query is a tuple of access markers, [`Read<T>`] or [`Write<T>`], one per
//! record type a system operates on:
//!
//! ```ignore
//! type Query = (Read<EntityRecord>, Write<Position>, Read<Velocity>, Read<Gravity>);
//! ```
//!
//! Component items resolve to the entity's recorded slot in that type's
//! column. Resource items resolve to the column's single element, so every
//! tuple a fetch yields shares the same resource reference, and resources
//! never add to the set of types an entity must own.
//!
//! ## Soundness
//!
//! [`QueryItem::fetch`] is `unsafe` because a `Write<T>` item hands out a
//! `&mut T` through a shared store. Callers either hold `&mut Store`
//! ([`Store::fetch`]) or promise that no co-running fetch touches the same
//! records mutably ([`Store::fetch_shared`]). A single query may not name a
//! type twice when one of the accesses is a write, and may never write the
//! identity record; both are rejected as [`EcsError::ConflictingAccess`].

use std::marker::PhantomData;

use crate::column::TypedColumn;
use crate::component::{Record, RecordKind, RecordTypeId};
use crate::entity::EntityRecord;
use crate::mask::RecordMask;
use crate::store::Store;
use crate::EcsError;

// ---------------------------------------------------------------------------
// Access markers
// ---------------------------------------------------------------------------

/// Shared access to `T`.
pub struct Read<T>(PhantomData<fn() -> T>);

/// Exclusive access to `T`.
pub struct Write<T>(PhantomData<fn() -> T>);

/// One resolved element of a query: which column, how, and whether the type
/// is a per-entity component.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Access {
    pub record: RecordTypeId,
    pub kind: RecordKind,
    pub mutable: bool,
    pub name: &'static str,
}

impl Access {
    /// Whether two accesses may not safely run concurrently.
    pub fn conflicts_with(&self, other: &Access) -> bool {
        self.record == other.record && (self.mutable || other.mutable)
    }
}

// ---------------------------------------------------------------------------
// QueryItem
// ---------------------------------------------------------------------------

/// A single element of a query tuple.
pub trait QueryItem {
    /// What a fetch yields for this element.
    type Item<'s>;
    /// The stored record type.
    type Record: Record;
    const MUTABLE: bool;

    /// Borrow the element at `slot`.
    ///
    /// # Safety
    ///
    /// For mutable items the caller guarantees no other reference to the
    /// element is alive for `'s`.
    unsafe fn fetch(column: &TypedColumn, slot: usize) -> Result<Self::Item<'_>, EcsError>;
}

impl<T: Record> QueryItem for Read<T> {
    type Item<'s> = &'s T;
    type Record = T;
    const MUTABLE: bool = false;

    unsafe fn fetch(column: &TypedColumn, slot: usize) -> Result<&T, EcsError> {
        column.get::<T>(slot)
    }
}

impl<T: Record> QueryItem for Write<T> {
    type Item<'s> = &'s mut T;
    type Record = T;
    const MUTABLE: bool = true;

    unsafe fn fetch(column: &TypedColumn, slot: usize) -> Result<&mut T, EcsError> {
        column.get_shared_mut::<T>(slot)
    }
}

// ---------------------------------------------------------------------------
// Query
// ---------------------------------------------------------------------------

/// A tuple of [`QueryItem`]s, arity 1 through 8.
pub trait Query {
    /// Per-entity output.
    type Item<'s>;

    /// Resolve every element against the store, rejecting conflicting
    /// accesses and unregistered types.
    fn accesses(store: &Store) -> Result<Vec<Access>, EcsError>;

    /// Build one output tuple for `record`.
    ///
    /// # Safety
    ///
    /// `accesses` must come from [`Query::accesses`] on the same store, and
    /// the caller upholds the aliasing contract of every mutable element.
    unsafe fn fetch<'s>(
        store: &'s Store,
        accesses: &[Access],
        record: &EntityRecord,
    ) -> Result<Self::Item<'s>, EcsError>;
}

/// Bits an entity must own to match `accesses`; resources contribute
/// nothing.
pub fn required_mask(accesses: &[Access], component_mask: RecordMask) -> RecordMask {
    accesses
        .iter()
        .map(|a| RecordMask::single(a.record))
        .fold(RecordMask::EMPTY, RecordMask::union)
        .intersection(component_mask)
}

fn access_of<I: QueryItem>(store: &Store) -> Result<Access, EcsError> {
    let record = store.type_id_of::<I::Record>()?;
    let name = std::any::type_name::<I::Record>();
    if I::MUTABLE && record == EntityRecord::RECORD_TYPE {
        return Err(EcsError::ConflictingAccess { name });
    }
    Ok(Access {
        record,
        kind: store.column(record).kind(),
        mutable: I::MUTABLE,
        name,
    })
}

fn validate_accesses(accesses: &[Access]) -> Result<(), EcsError> {
    for (i, a) in accesses.iter().enumerate() {
        if accesses[i + 1..].iter().any(|b| a.conflicts_with(b)) {
            return Err(EcsError::ConflictingAccess { name: a.name });
        }
    }
    Ok(())
}

unsafe fn fetch_item<'s, I: QueryItem>(
    store: &'s Store,
    access: &Access,
    record: &EntityRecord,
) -> Result<I::Item<'s>, EcsError> {
    let slot = match access.kind {
        RecordKind::Resource => 0,
        RecordKind::Component => {
            record
                .get_component(access.record)
                .ok_or(EcsError::MissingSlot {
                    entity: record.id(),
                    record: access.name,
                })?
        }
    };
    I::fetch(store.column(access.record), slot)
}

macro_rules! impl_query_tuple {
    ($($name:ident),+) => {
        impl<$($name: QueryItem),+> Query for ($($name,)+) {
            type Item<'s> = ($($name::Item<'s>,)+);

            fn accesses(store: &Store) -> Result<Vec<Access>, EcsError> {
                let accesses = vec![$(access_of::<$name>(store)?),+];
                validate_accesses(&accesses)?;
                Ok(accesses)
            }

            #[allow(unused_assignments)]
            unsafe fn fetch<'s>(
                store: &'s Store,
                accesses: &[Access],
                record: &EntityRecord,
            ) -> Result<Self::Item<'s>, EcsError> {
                let mut index = 0;
                Ok(($(
                    {
                        let item = fetch_item::<$name>(store, &accesses[index], record)?;
                        index += 1;
                        item
                    },
                )+))
            }
        }
    };
}

impl_query_tuple!(A);
impl_query_tuple!(A, B);
impl_query_tuple!(A, B, C);
impl_query_tuple!(A, B, C, D);
impl_query_tuple!(A, B, C, D, E);
impl_query_tuple!(A, B, C, D, E, F);
impl_query_tuple!(A, B, C, D, E, F, G);
impl_query_tuple!(A, B, C, D, E, F, G, H);

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
