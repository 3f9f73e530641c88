//! id-weak-map: a registry that addresses managed objects by small integer
//! ids without keeping them alive.
//!
//! Internal Design:
//!
//! Summary
//! - Goal: let external code name heap objects by number, the numeric
//!   equivalent of a weak map. An entry disappears by itself once the
//!   object is reclaimed.
//! - Layers:
//!   - Heap / Gc<T> / WeakGc<T>: the managed runtime. Strong and weak
//!     handles, per-object hidden integer metadata, and single-shot
//!     reclamation notifications that run at `Heap::collect`.
//!   - EntryTable<V, S>: structural key -> entry storage with stable
//!     generational handles; includes a debug-only reentrancy guard.
//!   - IdWeakMap<T, S>: the registry. Stores a `WeakGc` per key, tags the
//!     object with its key, arms a notification, and funnels both removal
//!     paths through one erase routine.
//!   - Binding (`Value`, `Method`, `IdWeakMap::call`): argument-shape
//!     validation for dynamically typed hosts.
//!   - IdAllocator: strictly increasing ids from 1, never reused.
//!
//! Constraints
//! - Single-threaded: the registry, heap and handles are `!Send`/`!Sync`.
//!   Only the id counter is atomic, since statics are process-wide.
//! - One entry per key; duplicate `set` fails and mutates nothing.
//! - `has` never fabricates entries while probing.
//!
//! Removal protocol
//! - `delete(key)` and the reclamation notification both reach
//!   `erase`, which first disarms the notification (a linear
//!   `Subscription` token that can only be disposed of through
//!   `Heap::disarm`), then releases the weak reference and unlinks the
//!   entry. A second erase of the same entry finds nothing and returns.
//! - The notification erases the entry named by the generational handle it
//!   was armed with and checks the object's back-tag against that entry's
//!   key, so a key that was deleted and set again is never erased by the
//!   old object.
//! - Dropping the registry disarms every outstanding notification.
//!
//! Staleness window
//! - Between an object's last strong handle going away and the next
//!   `Heap::collect`, `has(key)` still reports `true` while `get(key)`
//!   already returns `None`.
//!
//! Overflow semantics
//! - Ids stop at `MAX_ID` (2^53 - 1). Past that, allocation fails with
//!   `RegistryError::IdsExhausted` instead of wrapping.
//!
//! Notes and non-goals
//! - No iteration over entries, no serialization, no id recycling.
//! - Keys are plain non-negative integers.

mod binding;
#[cfg(feature = "bench_internal")]
pub mod entry_table;
#[cfg(not(feature = "bench_internal"))]
mod entry_table;
mod error;
mod heap;
mod id_alloc;
mod id_weak_map;
mod reentrancy;
mod tokens;

/// Registry key: a non-negative integer.
pub type Key = u64;

// Public surface
pub use binding::{key_from_value, Method, Value};
pub use error::{InsertError, RegistryError};
pub use heap::{Gc, Heap, HiddenKey, Reclaimed, WeakGc};
pub use id_alloc::{allocate_id, IdAllocator, MAX_ID};
pub use id_weak_map::IdWeakMap;
pub use tokens::Subscription;
