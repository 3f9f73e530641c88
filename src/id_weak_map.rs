//! IdWeakMap: integer keys to non-owning references of managed objects.
//!
//! `set` stores a `WeakGc`, writes the key into the object's hidden slot
//! for this registry (the back-tag) and arms a reclamation notification.
//! Entries leave the map through one routine, `Inner::erase`, reached
//! either from `delete` or from the notification once the heap reclaims the
//! object. Erase disarms before it releases, so whichever path runs first
//! leaves nothing for the other to act on.
//!
//! Each notification carries the generational handle of the entry it was
//! armed for, and that handle is what the reclamation path erases. The
//! back-tag names the most recent key the object was set under; when one
//! object sits under several keys it matches only one of their entries.

use crate::entry_table::{EntryTable, Handle};
use crate::error::{InsertError, RegistryError};
use crate::heap::{Gc, Heap, HiddenKey, Reclaimed, WeakGc};
use crate::id_alloc::allocate_id;
use crate::reentrancy::DebugReentrancy;
use crate::tokens::Subscription;
use crate::Key;
use core::cell::RefCell;
use core::fmt;
use core::hash::BuildHasher;
use std::collections::hash_map::RandomState;
use std::rc::{self, Rc};
use tracing::{debug, trace};

struct Entry<T> {
    reference: WeakGc<T>,
    // None only between insertion and arming, and after disarm.
    subscription: Option<Subscription>,
}

struct Inner<T, S> {
    table: RefCell<EntryTable<Entry<T>, S>>,
    heap: Heap,
    back_tag: HiddenKey,
    reentrancy: DebugReentrancy,
}

pub struct IdWeakMap<T, S = RandomState> {
    inner: Rc<Inner<T, S>>,
}

impl<T: 'static> IdWeakMap<T> {
    pub fn new(heap: &Heap) -> Self {
        Self::from_table(heap, EntryTable::new())
    }

    pub fn with_capacity(heap: &Heap, capacity: usize) -> Self {
        Self::from_table(heap, EntryTable::with_capacity(capacity))
    }
}

impl<T, S> IdWeakMap<T, S>
where
    T: 'static,
    S: BuildHasher + 'static,
{
    pub fn with_hasher(heap: &Heap, hasher: S) -> Self {
        Self::from_table(heap, EntryTable::with_hasher(hasher))
    }

    fn from_table(heap: &Heap, table: EntryTable<Entry<T>, S>) -> Self {
        Self {
            inner: Rc::new(Inner {
                table: RefCell::new(table),
                heap: heap.clone(),
                back_tag: HiddenKey::new(),
                reentrancy: DebugReentrancy::new(),
            }),
        }
    }

    /// The heap whose objects this registry refers to.
    pub fn heap(&self) -> &Heap {
        &self.inner.heap
    }

    /// Hidden slot this registry writes back-tags into.
    pub fn back_tag_slot(&self) -> HiddenKey {
        self.inner.back_tag
    }

    pub fn len(&self) -> usize {
        self.inner.table.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.table.borrow().is_empty()
    }

    /// Associate `key` with `object` without keeping it alive.
    ///
    /// Fails with `InvalidArgument` if `object` lives on another heap and
    /// with `DuplicateKey` if `key` is taken; neither failure mutates
    /// anything.
    pub fn set(&self, key: Key, object: &Gc<T>) -> Result<(), RegistryError> {
        let _g = self.inner.reentrancy.enter();
        if !self.inner.heap.owns(object) {
            return Err(RegistryError::invalid("object belongs to a different heap"));
        }
        let entry = Entry {
            reference: Gc::downgrade(object),
            subscription: None,
        };
        let handle = self
            .inner
            .table
            .borrow_mut()
            .insert(key, entry)
            .map_err(|InsertError::DuplicateKey| RegistryError::DuplicateKey(key))?;

        object.set_hidden(self.inner.back_tag, key);
        let registry = Rc::downgrade(&self.inner);
        let subscription = self
            .inner
            .heap
            .arm(object, move |reclaimed| reclaim(&registry, reclaimed, handle));
        self.inner
            .table
            .borrow_mut()
            .get_mut(handle)
            .expect("entry must exist immediately after successful insert")
            .subscription = Some(subscription);
        trace!(key, "id weak map entry set");
        Ok(())
    }

    /// Allocate a fresh key from the process-wide counter and set it.
    pub fn insert(&self, object: &Gc<T>) -> Result<Key, RegistryError> {
        let key = allocate_id()?;
        self.set(key, object)?;
        Ok(key)
    }

    /// The object under `key`, if the entry exists and the object has not
    /// been reclaimed yet.
    pub fn get(&self, key: Key) -> Option<Gc<T>> {
        let _g = self.inner.reentrancy.enter();
        let table = self.inner.table.borrow();
        let handle = table.find(key)?;
        let entry = table.get(handle)?;
        entry.reference.upgrade()
    }

    /// Whether an entry exists for `key`.
    ///
    /// An object released since the last `Heap::collect` still reports
    /// `true` here until its notification runs, while `get` already
    /// returns `None` for it.
    pub fn has(&self, key: Key) -> bool {
        let _g = self.inner.reentrancy.enter();
        self.inner.table.borrow().contains_key(key)
    }

    /// Remove the entry for `key`. Returns false if there was none.
    pub fn delete(&self, key: Key) -> bool {
        let _g = self.inner.reentrancy.enter();
        let handle = self.inner.table.borrow().find(key);
        match handle {
            Some(handle) => {
                let erased = self.inner.erase(handle);
                trace!(key, "id weak map entry deleted");
                erased
            }
            None => false,
        }
    }
}

impl<T, S> Inner<T, S>
where
    S: BuildHasher,
{
    /// The one removal routine. Disarms the notification, then releases the
    /// reference and unlinks the entry. Returns false if the entry was
    /// already gone.
    fn erase(&self, handle: Handle) -> bool {
        let subscription = {
            let mut table = self.table.borrow_mut();
            match table.get_mut(handle) {
                Some(entry) => entry.subscription.take(),
                None => return false,
            }
        };
        if let Some(subscription) = subscription {
            self.heap.disarm(subscription);
        }

        let removed = self.table.borrow_mut().remove(handle);
        let Some((key, entry)) = removed else {
            return false;
        };
        if let Some(object) = entry.reference.upgrade() {
            if object.hidden(self.back_tag) == Some(key) {
                object.clear_hidden(self.back_tag);
            }
        }
        trace!(key, "id weak map entry erased");
        true
    }

    /// The handle captured when the notification was armed decides which
    /// entry goes; the back-tag is only compared against that entry's key.
    fn erase_reclaimed(&self, reclaimed: &Reclaimed, handle: Handle) {
        let _g = self.reentrancy.enter();
        let Some(key) = self.table.borrow().key_of(handle) else {
            debug!("reclamation for an entry that is already gone");
            return;
        };
        match reclaimed.hidden(self.back_tag) {
            Some(tagged) if tagged == key => {}
            // A later `set` of the same object under another key overwrote
            // the tag, or deleting that key cleared it.
            tagged => debug!(key, ?tagged, "back-tag names another entry"),
        }
        if self.erase(handle) {
            debug!(key, "id weak map entry reclaimed");
        }
    }
}

fn reclaim<T, S>(registry: &rc::Weak<Inner<T, S>>, reclaimed: &Reclaimed, handle: Handle)
where
    S: BuildHasher,
{
    match registry.upgrade() {
        Some(inner) => inner.erase_reclaimed(reclaimed, handle),
        None => debug!("id weak map torn down before reclamation ran"),
    }
}

impl<T, S> Drop for Inner<T, S> {
    fn drop(&mut self) {
        let mut disarmed = 0usize;
        for (_, mut entry) in self.table.get_mut().drain() {
            if let Some(subscription) = entry.subscription.take() {
                self.heap.disarm(subscription);
                disarmed += 1;
            }
        }
        debug!(disarmed, "id weak map torn down");
    }
}

impl<T, S> fmt::Debug for IdWeakMap<T, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdWeakMap")
            .field("len", &self.inner.table.borrow().len())
            .field("back_tag", &self.inner.back_tag)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_then_get_returns_same_object() {
        let heap = Heap::new();
        let map = IdWeakMap::new(&heap);
        let obj = heap.alloc("a");
        map.set(1, &obj).unwrap();
        let got = map.get(1).unwrap();
        assert!(Gc::ptr_eq(&got, &obj));
        assert_eq!(obj.hidden(map.back_tag_slot()), Some(1));
        assert_eq!(Gc::strong_count(&obj), 2, "only our `got` adds a strong handle");
    }

    #[test]
    fn duplicate_set_leaves_entry_and_back_tags_untouched() {
        let heap = Heap::new();
        let map = IdWeakMap::new(&heap);
        let b = heap.alloc('b');
        let c = heap.alloc('c');
        map.set(5, &b).unwrap();
        assert_eq!(map.set(5, &c), Err(RegistryError::DuplicateKey(5)));
        assert!(Gc::ptr_eq(&map.get(5).unwrap(), &b));
        assert_eq!(c.hidden(map.back_tag_slot()), None);
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn foreign_heap_object_is_invalid() {
        let heap = Heap::new();
        let other = Heap::new();
        let map = IdWeakMap::new(&heap);
        let obj = other.alloc(0);
        assert!(matches!(
            map.set(3, &obj),
            Err(RegistryError::InvalidArgument(_))
        ));
        assert!(!map.has(3));
        assert_eq!(obj.hidden(map.back_tag_slot()), None);
    }

    #[test]
    fn delete_disarms_and_clears_back_tag() {
        let heap = Heap::new();
        let map = IdWeakMap::new(&heap);
        let obj = heap.alloc(());
        map.set(9, &obj).unwrap();
        assert!(map.delete(9));
        assert!(!map.delete(9), "second delete is a no-op");
        assert_eq!(obj.hidden(map.back_tag_slot()), None);

        drop(obj);
        assert_eq!(heap.pending(), 0, "notification was disarmed");
        assert_eq!(heap.collect(), 0);
    }

    /// After delete and re-set of the same key, releasing the first object
    /// must not touch the new entry.
    #[test]
    fn reused_key_is_not_erased_by_old_object() {
        let heap = Heap::new();
        let map = IdWeakMap::new(&heap);
        let old = heap.alloc(1);
        let new = heap.alloc(2);
        map.set(4, &old).unwrap();
        map.delete(4);
        map.set(4, &new).unwrap();
        drop(old);
        heap.collect();
        assert!(map.has(4));
        assert_eq!(*map.get(4).unwrap(), 2);
    }

    #[test]
    fn reclamation_erases_entry_at_collection_point() {
        let heap = Heap::new();
        let map = IdWeakMap::new(&heap);
        let obj = heap.alloc(String::from("d"));
        map.set(7, &obj).unwrap();
        drop(obj);

        // Released but not yet collected: entry lingers, object is gone.
        assert!(map.has(7));
        assert!(map.get(7).is_none());

        assert_eq!(heap.collect(), 1);
        assert!(!map.has(7));
        assert!(map.is_empty());
        assert!(!map.delete(7));
    }

    #[test]
    fn same_object_under_two_keys_is_fully_reclaimed() {
        let heap = Heap::new();
        let map = IdWeakMap::new(&heap);
        let obj = heap.alloc(());
        map.set(1, &obj).unwrap();
        map.set(2, &obj).unwrap();
        assert_eq!(obj.hidden(map.back_tag_slot()), Some(2));
        drop(obj);
        assert_eq!(heap.collect(), 2);
        assert!(!map.has(1));
        assert!(!map.has(2));
    }

    #[test]
    fn teardown_disarms_outstanding_notifications() {
        let heap = Heap::new();
        let map = IdWeakMap::new(&heap);
        let kept = heap.alloc(());
        let released = heap.alloc(());
        map.set(1, &kept).unwrap();
        map.set(2, &released).unwrap();
        drop(released);
        assert_eq!(heap.pending(), 1);

        drop(map);
        assert_eq!(heap.pending(), 0);
        assert_eq!(heap.collect(), 0);
        drop(kept);
        assert_eq!(heap.collect(), 0);
    }

    #[test]
    fn insert_allocates_fresh_keys() {
        let heap = Heap::new();
        let map = IdWeakMap::new(&heap);
        let a = heap.alloc(());
        let b = heap.alloc(());
        let ka = map.insert(&a).unwrap();
        let kb = map.insert(&b).unwrap();
        assert!(kb > ka);
        assert!(Gc::ptr_eq(&map.get(ka).unwrap(), &a));
        map.delete(ka);
        let kc = map.insert(&a).unwrap();
        assert!(kc > kb, "deleted ids are not reissued");
    }

    /// A heap callback that fires at the same collection point as the
    /// registry's own notification may call back into the registry: the
    /// registry section is closed between callbacks.
    #[test]
    fn registry_is_usable_from_other_collection_callbacks() {
        let heap = Heap::new();
        let map = Rc::new(IdWeakMap::new(&heap));
        let watched = heap.alloc(1u32);
        let neighbour = heap.alloc(2u32);
        map.set(1, &watched).unwrap();
        map.set(2, &neighbour).unwrap();

        let seen = Rc::new(core::cell::Cell::new(None));
        let (map2, seen2) = (Rc::clone(&map), Rc::clone(&seen));
        let sub = heap.arm(&watched, move |_| {
            seen2.set(Some((map2.has(1), map2.get(2).map(|o| *o))));
        });
        drop(watched);
        assert_eq!(heap.collect(), 2);
        assert!(!heap.disarm(sub));

        // The registry's notification was armed first, so it already ran.
        assert_eq!(seen.get(), Some((false, Some(2))));
        assert!(!map.has(1));
        assert!(!map.inner.reentrancy.is_entered());
    }

    /// Deleting the key that owns the back-tag clears it; reclamation of
    /// the object's other entry still erases that entry by its handle.
    #[test]
    fn reclamation_without_back_tag_erases_by_handle() {
        let heap = Heap::new();
        let map = IdWeakMap::new(&heap);
        let obj = heap.alloc(());
        map.set(1, &obj).unwrap();
        map.set(2, &obj).unwrap();
        assert!(map.delete(2));
        assert_eq!(obj.hidden(map.back_tag_slot()), None);

        drop(obj);
        assert_eq!(heap.collect(), 1);
        assert!(map.is_empty());
    }

    #[test]
    fn with_capacity_behaves_like_new() {
        let heap = Heap::new();
        let map: IdWeakMap<u8> = IdWeakMap::with_capacity(&heap, 64);
        let obj = heap.alloc(1u8);
        map.set(0, &obj).unwrap();
        assert!(map.has(0));
        assert!(Gc::ptr_eq(&map.get(0).unwrap(), &obj));
    }
}
