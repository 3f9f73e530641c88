//! Monotonic identifier allocation.

use crate::error::RegistryError;
use crate::Key;
use std::sync::atomic::{AtomicU64, Ordering};

/// Largest id ever issued: the largest integer a double-precision host
/// number represents exactly.
pub const MAX_ID: Key = (1 << 53) - 1;

/// Strictly increasing id source starting at 1. Ids are never reissued.
///
/// Once `MAX_ID` has been handed out every further call fails with
/// `RegistryError::IdsExhausted` rather than wrapping.
#[derive(Debug)]
pub struct IdAllocator {
    next: AtomicU64,
}

impl IdAllocator {
    pub const fn new() -> Self {
        Self::starting_at(1)
    }

    pub(crate) const fn starting_at(first: Key) -> Self {
        Self {
            next: AtomicU64::new(first),
        }
    }

    pub fn allocate(&self) -> Result<Key, RegistryError> {
        self.next
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
                (n <= MAX_ID).then_some(n + 1)
            })
            .map_err(|_| RegistryError::IdsExhausted)
    }
}

impl Default for IdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

static GLOBAL_IDS: IdAllocator = IdAllocator::new();

/// Allocate from the process-wide counter shared by every registry.
pub fn allocate_id() -> Result<Key, RegistryError> {
    GLOBAL_IDS.allocate()
}
