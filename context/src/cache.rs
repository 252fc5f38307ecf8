use std::collections::HashMap;

use procvar_types::{SlotKey, Value};

use crate::proxy::VarValue;

struct Cached {
    real: Value,
    exposed: VarValue,
}

/// Per-unit-of-work memo of loaded variables.
///
/// Keeps both the real decoded graph and what callers were handed for it, so
/// a second load of the same slot returns the identical proxy.
#[derive(Default)]
pub struct DeserializationCache {
    entries: HashMap<SlotKey, Cached>,
}

impl DeserializationCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get(&self, slot: &SlotKey) -> Option<VarValue> {
        self.entries.get(slot).map(|cached| cached.exposed.clone())
    }

    #[must_use]
    pub fn real(&self, slot: &SlotKey) -> Option<&Value> {
        self.entries.get(slot).map(|cached| &cached.real)
    }

    pub fn put(&mut self, slot: SlotKey, real: Value, exposed: VarValue) {
        self.entries.insert(slot, Cached { real, exposed });
    }

    #[must_use]
    pub fn contains(&self, slot: &SlotKey) -> bool {
        self.entries.contains_key(slot)
    }

    pub fn remove(&mut self, slot: &SlotKey) -> Option<VarValue> {
        self.entries.remove(slot).map(|cached| cached.exposed)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
