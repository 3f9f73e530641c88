//! EntryTable: structural key -> entry storage with stable handles.
//!
//! Entries live in a generational `SlotMap`; a `HashTable` indexes them by
//! key hash. A `Handle` stays valid until its entry is removed and never
//! aliases a later entry that reuses the slot, which is what lets a late
//! reclamation callback identify "its" entry even after the key was reused.

use crate::error::InsertError;
use crate::reentrancy::DebugReentrancy;
use crate::Key;
use core::hash::BuildHasher;
use hashbrown::hash_table::{Entry as TableEntry, HashTable};
use slotmap::{DefaultKey, SlotMap};
use std::collections::hash_map::RandomState;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct Handle(DefaultKey);

impl Handle {
    #[inline]
    fn raw(self) -> DefaultKey {
        self.0
    }
}

#[derive(Debug)]
struct Slot<V> {
    key: Key,
    value: V,
    hash: u64,
}

pub struct EntryTable<V, S = RandomState> {
    hasher: S,
    index: HashTable<DefaultKey>,
    slots: SlotMap<DefaultKey, Slot<V>>,
    reentrancy: DebugReentrancy,
}

impl<V> EntryTable<V> {
    pub fn new() -> Self {
        Self::with_hasher(RandomState::new())
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self::with_capacity_and_hasher(capacity, RandomState::new())
    }
}

impl<V> Default for EntryTable<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V, S> EntryTable<V, S> {
    pub fn with_hasher(hasher: S) -> Self {
        Self::with_capacity_and_hasher(0, hasher)
    }

    pub fn with_capacity_and_hasher(capacity: usize, hasher: S) -> Self {
        Self {
            hasher,
            index: HashTable::with_capacity(capacity),
            slots: SlotMap::with_capacity_and_key(capacity),
            reentrancy: DebugReentrancy::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn get(&self, h: Handle) -> Option<&V> {
        let _g = self.reentrancy.enter();
        self.slots.get(h.raw()).map(|s| &s.value)
    }

    pub fn get_mut(&mut self, h: Handle) -> Option<&mut V> {
        let _g = self.reentrancy.enter();
        self.slots.get_mut(h.raw()).map(|s| &mut s.value)
    }

    pub fn key_of(&self, h: Handle) -> Option<Key> {
        let _g = self.reentrancy.enter();
        self.slots.get(h.raw()).map(|s| s.key)
    }

    /// Unlink and return the entry. The table is consistent again before
    /// the caller drops anything it got back.
    pub fn remove(&mut self, h: Handle) -> Option<(Key, V)> {
        let _g = self.reentrancy.enter();
        let k = h.raw();
        let slot = self.slots.remove(k)?;
        // `find_entry` never reserves, so the index is not rehashed while
        // `slots` is missing the entry being unlinked.
        if let Ok(o) = self.index.find_entry(slot.hash, |&kk| kk == k) {
            o.remove();
        }
        Some((slot.key, slot.value))
    }

    /// Remove every entry, yielding them in unspecified order.
    pub fn drain(&mut self) -> impl Iterator<Item = (Key, V)> + '_ {
        let _g = self.reentrancy.enter();
        self.index.clear();
        self.slots.drain().map(|(_, s)| (s.key, s.value))
    }
}

impl<V, S> EntryTable<V, S>
where
    S: BuildHasher,
{
    #[inline]
    fn make_hash(&self, key: Key) -> u64 {
        self.hasher.hash_one(key)
    }

    pub fn find(&self, key: Key) -> Option<Handle> {
        let _g = self.reentrancy.enter();
        let hash = self.make_hash(key);
        self.index
            .find(hash, |&k| self.slots.get(k).is_some_and(|s| s.key == key))
            .map(|&k| Handle(k))
    }

    /// Presence probe. Never inserts a placeholder for a missing key.
    pub fn contains_key(&self, key: Key) -> bool {
        self.find(key).is_some()
    }

    pub fn insert(&mut self, key: Key, value: V) -> Result<Handle, InsertError> {
        let _g = self.reentrancy.enter();
        let hash = self.make_hash(key);
        match self.index.entry(
            hash,
            |&k| self.slots.get(k).is_some_and(|s| s.key == key),
            |&k| self.slots.get(k).map_or(0, |s| s.hash),
        ) {
            TableEntry::Occupied(_) => Err(InsertError::DuplicateKey),
            TableEntry::Vacant(v) => {
                let k = self.slots.insert(Slot { key, value, hash });
                v.insert(k);
                Ok(Handle(k))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::hash::Hasher;

    /// Duplicate keys are rejected and the original entry is untouched.
    #[test]
    fn duplicate_insert_rejected() {
        let mut t: EntryTable<&str> = EntryTable::new();
        let h = t.insert(5, "first").unwrap();
        assert_eq!(t.insert(5, "second"), Err(InsertError::DuplicateKey));
        assert_eq!(t.get(h), Some(&"first"));
        assert_eq!(t.len(), 1);
    }

    /// `find(k).is_some() == contains_key(k)` and probing absent keys does
    /// not grow the table.
    #[test]
    fn find_contains_parity_without_vivification() {
        let mut t: EntryTable<u32> = EntryTable::new();
        for k in [1, 2, 3] {
            t.insert(k, k as u32 * 10).unwrap();
        }
        for k in [1, 2, 3] {
            assert!(t.find(k).is_some());
            assert!(t.contains_key(k));
        }
        for k in [0, 4, u64::MAX] {
            assert!(t.find(k).is_none());
            assert!(!t.contains_key(k));
        }
        assert_eq!(t.len(), 3);
    }

    #[test]
    fn handle_access_and_mutation() {
        let mut t: EntryTable<i32> = EntryTable::new();
        let h = t.insert(7, 10).unwrap();
        assert_eq!(t.key_of(h), Some(7));
        *t.get_mut(h).unwrap() += 5;
        assert_eq!(t.get(h), Some(&15));

        assert_eq!(t.remove(h), Some((7, 15)));
        assert!(t.get(h).is_none());
        assert!(t.remove(h).is_none(), "second removal is a no-op");
    }

    /// A removed entry's handle never resolves to a later entry, even when
    /// the key and the physical slot are both reused.
    #[test]
    fn stale_handle_does_not_alias_reused_key() {
        let mut t: EntryTable<&str> = EntryTable::new();
        let h1 = t.insert(1, "old").unwrap();
        t.remove(h1).unwrap();
        let h2 = t.insert(1, "new").unwrap();
        assert_ne!(h1, h2);
        assert!(t.get(h1).is_none());
        assert!(t.remove(h1).is_none());
        assert_eq!(t.find(1), Some(h2));
    }

    /// The index shrinks in step with the slots, both when removing from a
    /// freshly filled table and under rolling insert/remove churn.
    #[test]
    fn index_tracks_slots_across_removals() {
        let mut t: EntryTable<u64> = EntryTable::new();
        let handles: Vec<Handle> = (0..3).map(|k| t.insert(k, k).unwrap()).collect();
        t.remove(handles[1]).unwrap();
        assert_eq!(t.index.len(), t.slots.len());
        assert_eq!(t.len(), 2);

        let mut window = std::collections::VecDeque::new();
        for k in 3..20_000u64 {
            window.push_back(t.insert(k, k).unwrap());
            if window.len() > 100 {
                let h = window.pop_front().unwrap();
                t.remove(h).unwrap();
            }
            assert_eq!(t.index.len(), t.slots.len());
        }
        assert_eq!(t.slots.len(), 102);
        assert!(t.contains_key(0));
        assert!(!t.contains_key(1));
        assert!(t.contains_key(19_999));
    }

    #[test]
    fn remove_then_drain() {
        let mut t: EntryTable<u8> = EntryTable::with_capacity(4);
        for k in 0..4 {
            t.insert(k, k as u8).unwrap();
        }
        let h = t.find(2).unwrap();
        assert_eq!(t.remove(h), Some((2, 2)));
        assert!(t.find(2).is_none());

        let mut drained: Vec<_> = t.drain().collect();
        drained.sort();
        assert_eq!(drained, vec![(0, 0), (1, 1), (3, 3)]);
        assert!(t.is_empty());
        assert!(!t.contains_key(0));
        t.insert(0, 9).unwrap();
        assert_eq!(t.len(), 1);
    }

    /// Lookups still resolve correctly when every key hashes the same.
    #[test]
    fn collision_handling_with_const_hasher() {
        #[derive(Clone, Default)]
        struct ConstBuildHasher;
        struct ConstHasher;
        impl Hasher for ConstHasher {
            fn finish(&self) -> u64 {
                0
            }
            fn write(&mut self, _bytes: &[u8]) {}
        }
        impl BuildHasher for ConstBuildHasher {
            type Hasher = ConstHasher;
            fn build_hasher(&self) -> Self::Hasher {
                ConstHasher
            }
        }

        let mut t: EntryTable<u64, ConstBuildHasher> = EntryTable::with_hasher(ConstBuildHasher);
        for k in 0..32 {
            t.insert(k, k * 2).unwrap();
        }
        for k in 0..32 {
            let h = t.find(k).unwrap();
            assert_eq!(t.get(h), Some(&(k * 2)));
        }
        let h = t.find(17).unwrap();
        t.remove(h).unwrap();
        assert!(!t.contains_key(17));
        assert!(t.contains_key(18));
        assert_eq!(t.len(), 31);
    }
}
