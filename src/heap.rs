//! Managed object heap: the runtime the registry borrows lifetimes from.
//!
//! `Gc<T>` is a strong handle; an object is reclaimed when its last strong
//! handle goes away. `WeakGc<T>` observes an object without keeping it
//! alive. Every object carries a small hidden-metadata area (integer values
//! under `HiddenKey` slots) that survives until reclamation and is handed to
//! reclamation callbacks as a `Reclaimed` snapshot.
//!
//! Reclamation notifications are single-shot. `Heap::arm` registers one on a
//! live object and returns a linear `Subscription`. When the object is
//! reclaimed its armed notifications are queued, and they run only at the
//! next collection point (`Heap::collect`), never inside the drop that
//! released the object. `Heap::disarm` cancels a notification whether it is
//! still armed or already queued.

use crate::tokens::{Subscription, SubscriptionKey};
use core::cell::{Cell, RefCell};
use core::fmt;
use core::ops::Deref;
use slotmap::SlotMap;
use std::collections::VecDeque;
use std::rc::{self, Rc};
use std::sync::atomic::{AtomicU64, Ordering};

/// Name of a hidden metadata slot on managed objects.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct HiddenKey(u64);

static NEXT_HIDDEN_KEY: AtomicU64 = AtomicU64::new(1);

impl HiddenKey {
    /// Mint a slot name distinct from every other one in the process.
    pub fn new() -> Self {
        HiddenKey(NEXT_HIDDEN_KEY.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for HiddenKey {
    fn default() -> Self {
        Self::new()
    }
}

/// Hidden metadata captured from an object at reclamation time.
#[derive(Debug, Default)]
pub struct Reclaimed {
    hidden: Vec<(HiddenKey, u64)>,
}

impl Reclaimed {
    pub fn hidden(&self, key: HiddenKey) -> Option<u64> {
        lookup(&self.hidden, key)
    }
}

fn lookup(slots: &[(HiddenKey, u64)], key: HiddenKey) -> Option<u64> {
    slots.iter().find(|(k, _)| *k == key).map(|&(_, v)| v)
}

type Callback = Box<dyn FnOnce(&Reclaimed)>;

struct HeapInner {
    notifications: RefCell<SlotMap<SubscriptionKey, Callback>>,
    pending: RefCell<VecDeque<(SubscriptionKey, Rc<Reclaimed>)>>,
    live: Cell<usize>,
}

#[derive(Clone)]
pub struct Heap {
    inner: Rc<HeapInner>,
}

impl Heap {
    pub fn new() -> Self {
        Self {
            inner: Rc::new(HeapInner {
                notifications: RefCell::new(SlotMap::with_key()),
                pending: RefCell::new(VecDeque::new()),
                live: Cell::new(0),
            }),
        }
    }

    #[inline]
    fn identity(&self) -> *const () {
        Rc::as_ptr(&self.inner).cast()
    }

    pub fn alloc<T>(&self, value: T) -> Gc<T> {
        self.inner.live.set(self.inner.live.get() + 1);
        Gc {
            ptr: Rc::new(GcBox {
                header: Header {
                    heap: Rc::downgrade(&self.inner),
                    hidden: RefCell::new(Vec::new()),
                    watchers: RefCell::new(Vec::new()),
                },
                value,
            }),
        }
    }

    /// Whether `object` was allocated by this heap.
    pub fn owns<T>(&self, object: &Gc<T>) -> bool {
        object.ptr.header.heap.as_ptr().cast::<()>() == self.identity()
    }

    /// Number of objects allocated here and not yet reclaimed.
    pub fn live_objects(&self) -> usize {
        self.inner.live.get()
    }

    /// Number of queued notifications that will run at the next `collect`.
    pub fn pending(&self) -> usize {
        let notifications = self.inner.notifications.borrow();
        self.inner
            .pending
            .borrow()
            .iter()
            .filter(|(k, _)| notifications.contains_key(*k))
            .count()
    }

    /// Arm a single-shot notification that runs after `target` is reclaimed.
    ///
    /// Panics if `target` belongs to another heap.
    pub fn arm<T, F>(&self, target: &Gc<T>, callback: F) -> Subscription
    where
        F: FnOnce(&Reclaimed) + 'static,
    {
        assert!(self.owns(target), "cannot arm a notification on a foreign object");
        let key = self
            .inner
            .notifications
            .borrow_mut()
            .insert(Box::new(callback));
        let notifications = self.inner.notifications.borrow();
        let mut watchers = target.ptr.header.watchers.borrow_mut();
        // Drop keys of notifications that were disarmed while the object lived.
        watchers.retain(|k| notifications.contains_key(*k));
        watchers.push(key);
        Subscription::new(key, self.identity())
    }

    /// Cancel the notification named by `sub`. Returns true if it had not
    /// fired yet. Disarming an already fired notification is a no-op.
    pub fn disarm(&self, sub: Subscription) -> bool {
        assert!(
            sub.heap == self.identity(),
            "subscription returned to a heap that did not mint it"
        );
        let key = sub.retire();
        // Bind first so the callback is dropped after the borrow is released.
        let removed = self.inner.notifications.borrow_mut().remove(key);
        removed.is_some()
    }

    /// Collection point: run every queued notification, including ones
    /// queued by callbacks while this runs. Returns how many fired.
    pub fn collect(&self) -> usize {
        let mut fired = 0;
        loop {
            let next = self.inner.pending.borrow_mut().pop_front();
            let Some((key, reclaimed)) = next else {
                break;
            };
            let callback = self.inner.notifications.borrow_mut().remove(key);
            match callback {
                Some(callback) => {
                    callback(&*reclaimed);
                    fired += 1;
                }
                None => tracing::trace!(?key, "skipping disarmed notification"),
            }
        }
        tracing::trace!(fired, "heap collection point");
        fired
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Heap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Heap")
            .field("live_objects", &self.live_objects())
            .field("pending", &self.pending())
            .finish()
    }
}

struct Header {
    heap: rc::Weak<HeapInner>,
    hidden: RefCell<Vec<(HiddenKey, u64)>>,
    watchers: RefCell<Vec<SubscriptionKey>>,
}

impl Drop for Header {
    fn drop(&mut self) {
        // Heap already gone: nothing can observe this reclamation.
        let Some(heap) = self.heap.upgrade() else {
            return;
        };
        heap.live.set(heap.live.get() - 1);
        let watchers = core::mem::take(self.watchers.get_mut());
        if watchers.is_empty() {
            return;
        }
        let snapshot = Rc::new(Reclaimed {
            hidden: core::mem::take(self.hidden.get_mut()),
        });
        let notifications = heap.notifications.borrow();
        let mut pending = heap.pending.borrow_mut();
        for key in watchers {
            if notifications.contains_key(key) {
                pending.push_back((key, Rc::clone(&snapshot)));
            }
        }
    }
}

struct GcBox<T> {
    header: Header,
    value: T,
}

/// Strong handle to a managed object.
pub struct Gc<T> {
    ptr: Rc<GcBox<T>>,
}

impl<T> Gc<T> {
    pub fn downgrade(this: &Self) -> WeakGc<T> {
        WeakGc {
            ptr: Rc::downgrade(&this.ptr),
        }
    }

    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        Rc::ptr_eq(&a.ptr, &b.ptr)
    }

    pub fn strong_count(this: &Self) -> usize {
        Rc::strong_count(&this.ptr)
    }

    /// Write `value` into the hidden slot `key`, replacing any previous value.
    pub fn set_hidden(&self, key: HiddenKey, value: u64) {
        let mut hidden = self.ptr.header.hidden.borrow_mut();
        match hidden.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => hidden.push((key, value)),
        }
    }

    pub fn hidden(&self, key: HiddenKey) -> Option<u64> {
        lookup(&self.ptr.header.hidden.borrow(), key)
    }

    pub fn clear_hidden(&self, key: HiddenKey) -> Option<u64> {
        let mut hidden = self.ptr.header.hidden.borrow_mut();
        let pos = hidden.iter().position(|(k, _)| *k == key)?;
        Some(hidden.swap_remove(pos).1)
    }
}

impl<T> Clone for Gc<T> {
    fn clone(&self) -> Self {
        Self {
            ptr: Rc::clone(&self.ptr),
        }
    }
}

impl<T> Deref for Gc<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.ptr.value
    }
}

impl<T: fmt::Debug> fmt::Debug for Gc<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Gc").field(&self.ptr.value).finish()
    }
}

/// Non-owning reference to a managed object.
pub struct WeakGc<T> {
    ptr: rc::Weak<GcBox<T>>,
}

impl<T> WeakGc<T> {
    pub fn upgrade(&self) -> Option<Gc<T>> {
        self.ptr.upgrade().map(|ptr| Gc { ptr })
    }

    pub fn is_alive(&self) -> bool {
        self.ptr.strong_count() > 0
    }

    /// Whether this reference points at `object`.
    pub fn refers_to(&self, object: &Gc<T>) -> bool {
        rc::Weak::as_ptr(&self.ptr) == Rc::as_ptr(&object.ptr)
    }
}

impl<T> Clone for WeakGc<T> {
    fn clone(&self) -> Self {
        Self {
            ptr: rc::Weak::clone(&self.ptr),
        }
    }
}

impl<T> fmt::Debug for WeakGc<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakGc")
            .field("alive", &self.is_alive())
            .finish()
    }
}
