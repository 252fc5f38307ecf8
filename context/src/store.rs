//! Storage contract for encoded variable blobs.

use std::collections::HashMap;
use std::error::Error as StdError;

use thiserror::Error;

use procvar_types::SlotKey;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("no stored value for variable {0}")]
    NotFound(SlotKey),
    #[error("storage backend failed for variable {slot}: {source}")]
    Backend {
        slot: SlotKey,
        #[source]
        source: Box<dyn StdError + Send + Sync>,
    },
}

impl StoreError {
    pub fn backend(slot: SlotKey, source: impl Into<Box<dyn StdError + Send + Sync>>) -> Self {
        Self::Backend {
            slot,
            source: source.into(),
        }
    }
}

/// External byte-blob store.
///
/// procvar never interprets transactions on this side; it only reads a blob
/// on first load and writes one on store or on a dirty flush.
pub trait VariableStore {
    fn read_bytes(&self, slot: &SlotKey) -> Result<Vec<u8>, StoreError>;

    fn write_bytes(&mut self, slot: &SlotKey, bytes: &[u8]) -> Result<(), StoreError>;
}

/// In-memory store that counts writes per slot.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    blobs: HashMap<SlotKey, Vec<u8>>,
    writes: HashMap<SlotKey, usize>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a blob without counting it as a write.
    pub fn insert(&mut self, slot: impl Into<SlotKey>, bytes: Vec<u8>) {
        self.blobs.insert(slot.into(), bytes);
    }

    #[must_use]
    pub fn get(&self, slot: &SlotKey) -> Option<&[u8]> {
        self.blobs.get(slot).map(Vec::as_slice)
    }

    #[must_use]
    pub fn writes_to(&self, slot: &SlotKey) -> usize {
        self.writes.get(slot).copied().unwrap_or(0)
    }

    #[must_use]
    pub fn total_writes(&self) -> usize {
        self.writes.values().sum()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }
}

impl VariableStore for MemoryStore {
    fn read_bytes(&self, slot: &SlotKey) -> Result<Vec<u8>, StoreError> {
        self.blobs
            .get(slot)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(slot.clone()))
    }

    fn write_bytes(&mut self, slot: &SlotKey, bytes: &[u8]) -> Result<(), StoreError> {
        self.blobs.insert(slot.clone(), bytes.to_vec());
        *self.writes.entry(slot.clone()).or_default() += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_slot_is_not_found() {
        let store = MemoryStore::new();
        let err = store
            .read_bytes(&SlotKey::new("amount"))
            .expect_err("missing");
        assert!(matches!(err, StoreError::NotFound(slot) if slot.as_str() == "amount"));
    }

    #[test]
    fn seeding_does_not_count_as_write() {
        let mut store = MemoryStore::new();
        let slot = SlotKey::new("amount");
        store.insert(slot.clone(), vec![1]);
        assert_eq!(store.writes_to(&slot), 0);

        store.write_bytes(&slot, &[2]).expect("write");
        assert_eq!(store.writes_to(&slot), 1);
        assert_eq!(store.get(&slot), Some(&[2u8][..]));
        assert_eq!(store.total_writes(), 1);
    }

    #[test]
    fn backend_error_keeps_source() {
        let err = StoreError::backend(SlotKey::new("amount"), "disk full");
        assert_eq!(
            err.to_string(),
            "storage backend failed for variable amount: disk full"
        );
        assert!(StdError::source(&err).is_some());
    }
}
