//! Error types for the registry and its entry table.

use crate::Key;
use thiserror::Error;

/// Structural insert failure reported by `EntryTable`.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertError {
    #[error("an entry already exists for this key")]
    DuplicateKey,
}

/// Errors surfaced to callers of `IdWeakMap` and its host binding.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// Wrong argument count or shape. Nothing was mutated.
    #[error("invalid arguments: {0}")]
    InvalidArgument(String),

    /// `set` was called for a key that already has a live entry.
    #[error("element already exists for key {0}")]
    DuplicateKey(Key),

    /// The identifier counter reached `MAX_ID`.
    #[error("identifier space exhausted")]
    IdsExhausted,
}

impl RegistryError {
    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }
}
