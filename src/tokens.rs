//! Linear subscription tokens.
//!
//! A `Subscription` is proof that a reclamation notification was armed on a
//! particular heap. Dropping one panics; the only valid way to dispose of it
//! is to hand it back to the originating heap via `Heap::disarm`, which
//! cancels the notification if it has not fired yet. This is what forces
//! every removal path through disarm-before-release.

use core::marker::PhantomData;
use slotmap::new_key_type;

new_key_type! {
    /// Generational key of a notification inside its heap.
    pub(crate) struct SubscriptionKey;
}

pub struct Subscription {
    pub(crate) key: SubscriptionKey,
    // Identity of the heap that minted this token; compared, never dereferenced.
    pub(crate) heap: *const (),
    _nosend: PhantomData<*mut ()>,
}

impl Subscription {
    #[inline]
    pub(crate) fn new(key: SubscriptionKey, heap: *const ()) -> Self {
        Self {
            key,
            heap,
            _nosend: PhantomData,
        }
    }

    /// Consume the token without touching the notification it names.
    #[inline]
    pub(crate) fn retire(self) -> SubscriptionKey {
        let key = self.key;
        core::mem::forget(self);
        key
    }
}

impl core::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Subscription").field("key", &self.key).finish()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        // Fail fast on misuse, unless already unwinding from another panic.
        if !std::thread::panicking() {
            panic!("Subscription dropped without Heap::disarm");
        }
    }
}
