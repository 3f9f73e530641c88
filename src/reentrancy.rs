//! Guard against nested registry operations.
//!
//! Registry state changes from two directions: explicit calls and
//! reclamation callbacks run by `Heap::collect`. A callback that fired while
//! `set` or `delete` held the entry table would see it half-updated, so each
//! operation opens a section and debug builds panic if one is already open.
//! Release builds keep no state at all.

#[cfg(debug_assertions)]
use core::cell::Cell;
#[cfg(not(debug_assertions))]
use core::marker::PhantomData;

#[derive(Debug, Default)]
pub(crate) struct DebugReentrancy {
    #[cfg(debug_assertions)]
    active: Cell<bool>,
}

impl DebugReentrancy {
    pub(crate) const fn new() -> Self {
        Self {
            #[cfg(debug_assertions)]
            active: Cell::new(false),
        }
    }

    /// Open a section that lasts until the returned value is dropped.
    #[inline]
    pub(crate) fn enter(&self) -> Section<'_> {
        #[cfg(debug_assertions)]
        {
            assert!(
                !self.active.replace(true),
                "reentrancy detected: nested entry into id weak map"
            );
            return Section { owner: self };
        }

        #[cfg(not(debug_assertions))]
        {
            return Section { _owner: PhantomData };
        }
    }

    #[cfg(test)]
    pub(crate) fn is_entered(&self) -> bool {
        #[cfg(debug_assertions)]
        {
            return self.active.get();
        }

        #[cfg(not(debug_assertions))]
        {
            return false;
        }
    }
}

pub(crate) struct Section<'a> {
    #[cfg(debug_assertions)]
    owner: &'a DebugReentrancy,
    #[cfg(not(debug_assertions))]
    _owner: PhantomData<&'a DebugReentrancy>,
}

impl Drop for Section<'_> {
    fn drop(&mut self) {
        #[cfg(debug_assertions)]
        self.owner.active.set(false);
    }
}
