//! Record-type bit-sets.
//!
//! A [`RecordMask`] has one bit per registered record type, indexed by
//! [`RecordTypeId`]. Entities carry two of them: the set of types they own
//! and the set still valid. The valid set is cleared concurrently while
//! flagged entities are retired, so it lives in an [`AtomicRecordMask`].

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::component::RecordTypeId;

// ---------------------------------------------------------------------------
// RecordMask
// ---------------------------------------------------------------------------

/// A set of record types, one bit per [`RecordTypeId`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct RecordMask(u64);

impl RecordMask {
    /// The empty set.
    pub const EMPTY: RecordMask = RecordMask(0);

    /// A set containing exactly `id`.
    #[inline]
    pub fn single(id: RecordTypeId) -> Self {
        Self(1u64 << id.0)
    }

    /// Raw bit representation.
    #[inline]
    pub fn bits(self) -> u64 {
        self.0
    }

    #[inline]
    pub fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    #[inline]
    pub fn insert(&mut self, id: RecordTypeId) {
        self.0 |= 1u64 << id.0;
    }

    #[inline]
    pub fn remove(&mut self, id: RecordTypeId) {
        self.0 &= !(1u64 << id.0);
    }

    #[inline]
    pub fn contains(self, id: RecordTypeId) -> bool {
        self.0 & (1u64 << id.0) != 0
    }

    /// Whether every bit of `other` is also set in `self`.
    #[inline]
    pub fn contains_all(self, other: RecordMask) -> bool {
        self.0 & other.0 == other.0
    }

    #[inline]
    pub fn union(self, other: RecordMask) -> Self {
        Self(self.0 | other.0)
    }

    #[inline]
    pub fn intersection(self, other: RecordMask) -> Self {
        Self(self.0 & other.0)
    }

    /// `self` with every bit of `other` cleared.
    #[inline]
    pub fn without(self, other: RecordMask) -> Self {
        Self(self.0 & !other.0)
    }

    #[inline]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Number of record types in the set.
    #[inline]
    pub fn len(self) -> usize {
        self.0.count_ones() as usize
    }

    /// Iterate over the contained ids in ascending order.
    pub fn iter(self) -> impl Iterator<Item = RecordTypeId> {
        let mut bits = self.0;
        std::iter::from_fn(move || {
            if bits == 0 {
                return None;
            }
            let index = bits.trailing_zeros();
            bits &= bits - 1;
            Some(RecordTypeId(index))
        })
    }
}

impl fmt::Debug for RecordMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter().map(|id| id.0)).finish()
    }
}

impl FromIterator<RecordTypeId> for RecordMask {
    fn from_iter<I: IntoIterator<Item = RecordTypeId>>(iter: I) -> Self {
        let mut mask = RecordMask::EMPTY;
        for id in iter {
            mask.insert(id);
        }
        mask
    }
}

// ---------------------------------------------------------------------------
// AtomicRecordMask
// ---------------------------------------------------------------------------

/// A [`RecordMask`] whose bits can be cleared through a shared reference.
#[derive(Default)]
pub struct AtomicRecordMask(AtomicU64);

impl AtomicRecordMask {
    pub fn new(mask: RecordMask) -> Self {
        Self(AtomicU64::new(mask.0))
    }

    #[inline]
    pub fn load(&self) -> RecordMask {
        RecordMask(self.0.load(Ordering::Acquire))
    }

    /// Clear `id` and report whether it was set before this call.
    ///
    /// Exactly one of several concurrent callers observes `true`.
    #[inline]
    pub fn clear(&self, id: RecordTypeId) -> bool {
        let bit = 1u64 << id.0;
        self.0.fetch_and(!bit, Ordering::AcqRel) & bit != 0
    }

    /// Exclusive-access bit set.
    #[inline]
    pub fn insert_mut(&mut self, id: RecordTypeId) {
        *self.0.get_mut() |= 1u64 << id.0;
    }

    /// Exclusive-access bit clear.
    #[inline]
    pub fn remove_mut(&mut self, id: RecordTypeId) {
        *self.0.get_mut() &= !(1u64 << id.0);
    }
}

impl fmt::Debug for AtomicRecordMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.load().fmt(f)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: u32) -> RecordTypeId {
        RecordTypeId(n)
    }

    #[test]
    fn insert_remove_contains() {
        let mut mask = RecordMask::EMPTY;
        mask.insert(id(3));
        mask.insert(id(63));
        assert!(mask.contains(id(3)));
        assert!(mask.contains(id(63)));
        assert!(!mask.contains(id(0)));
        mask.remove(id(3));
        assert!(!mask.contains(id(3)));
        assert_eq!(mask.len(), 1);
    }

    #[test]
    fn subset_and_set_algebra() {
        let a: RecordMask = [id(0), id(1), id(2)].into_iter().collect();
        let b: RecordMask = [id(1), id(2)].into_iter().collect();
        assert!(a.contains_all(b));
        assert!(!b.contains_all(a));
        assert!(a.contains_all(RecordMask::EMPTY));
        assert_eq!(a.intersection(b), b);
        assert_eq!(b.union(RecordMask::single(id(0))), a);
        assert_eq!(a.without(b), RecordMask::single(id(0)));
    }

    #[test]
    fn iter_is_ascending() {
        let mask: RecordMask = [id(9), id(1), id(40)].into_iter().collect();
        let ids: Vec<u32> = mask.iter().map(|i| i.0).collect();
        assert_eq!(ids, vec![1, 9, 40]);
    }

    #[test]
    fn atomic_clear_reports_first_caller_only() {
        let mask = AtomicRecordMask::new([id(0), id(5)].into_iter().collect());
        assert!(mask.clear(id(5)));
        assert!(!mask.clear(id(5)));
        assert_eq!(mask.load(), RecordMask::single(id(0)));
    }

    #[test]
    fn atomic_clear_across_threads_dedupes() {
        let mask = AtomicRecordMask::new(RecordMask::single(id(7)));
        let winners: usize = std::thread::scope(|s| {
            let handles: Vec<_> = (0..8).map(|_| s.spawn(|| mask.clear(id(7)))).collect();
            handles
                .into_iter()
                .map(|h| h.join().unwrap() as usize)
                .sum()
        });
        assert_eq!(winners, 1);
        assert!(mask.load().is_empty());
    }
}
