//! One logical operation's view of its variables.
//!
//! The unit of work owns the deserialization cache and the dirty-check
//! registry. Both die with it, which is what makes "a fresh unit always
//! re-decodes from storage" hold. Proxies handed out by a unit stay memory-safe
//! after it ends but are detached: writes through them are never flushed.

use std::rc::Rc;

use tracing::debug;

use procvar_codec::{RealValue, short_fingerprint};
use procvar_types::{SlotKey, Value, VariableSlot};

use crate::cache::DeserializationCache;
use crate::controller::{VariableController, VariableError};
use crate::dirty::{DirtyCheckRegistry, FlushAggregateError, FlushReport};
use crate::proxy::{SlotTracker, VarValue};
use crate::store::VariableStore;

pub struct UnitOfWork<'a, S: VariableStore + ?Sized> {
    controller: &'a VariableController,
    store: &'a mut S,
    cache: DeserializationCache,
    dirty: DirtyCheckRegistry,
}

impl<'a, S: VariableStore + ?Sized> UnitOfWork<'a, S> {
    pub(crate) fn new(controller: &'a VariableController, store: &'a mut S) -> Self {
        Self {
            controller,
            store,
            cache: DeserializationCache::new(),
            dirty: DirtyCheckRegistry::new(),
        }
    }

    /// Load a variable, decoding it on first access in this unit.
    ///
    /// Repeated loads of one slot return the same proxy.
    pub fn load(&mut self, slot: &SlotKey) -> Result<VarValue, VariableError> {
        if let Some(cached) = self.cache.get(slot) {
            debug!(slot = %slot, "Variable cache hit");
            return Ok(cached);
        }

        let bytes = self.store.read_bytes(slot)?;
        let value = self
            .controller
            .codec()
            .decode(&bytes)
            .map_err(|source| VariableError::Decode {
                slot: slot.clone(),
                source,
            })?;
        debug!(
            slot = %slot,
            len = bytes.len(),
            fingerprint = %short_fingerprint(&bytes),
            "Loaded variable"
        );
        let baseline = self.rebaseline(slot, &value, bytes);

        let proxies = self.controller.proxies();
        let tracker = proxies.tracker(slot.clone());
        let exposed = proxies.wrap(value.clone(), &tracker);
        self.cache.put(slot.clone(), value.clone(), exposed.clone());
        self.dirty.register(slot.clone(), value, baseline, tracker);
        Ok(exposed)
    }

    /// Baseline for a freshly decoded value.
    ///
    /// A blob written under an older type layout (dropped or added fields,
    /// renamed or substituted types) re-encodes differently. The re-encoded
    /// form becomes the baseline so an unmodified variable is not rewritten;
    /// the new layout reaches storage with the next real change or store.
    fn rebaseline(&self, slot: &SlotKey, value: &Value, stored: Vec<u8>) -> Vec<u8> {
        match self.controller.codec().encode(value) {
            Ok(current) if current != stored => {
                debug!(
                    slot = %slot,
                    stored = %short_fingerprint(&stored),
                    current = %short_fingerprint(&current),
                    "Stored layout differs from current types; rebaselined"
                );
                current
            }
            _ => stored,
        }
    }

    /// [`UnitOfWork::load`] for a slot that records its owning execution.
    pub fn load_slot(&mut self, slot: &VariableSlot) -> Result<VarValue, VariableError> {
        debug!(slot = %slot.key(), owner = ?slot.owner(), "Loading owned variable");
        self.load(slot.key())
    }

    /// [`UnitOfWork::store`] for a slot that records its owning execution.
    pub fn store_slot(
        &mut self,
        slot: &VariableSlot,
        value: impl Into<VarValue>,
    ) -> Result<(), VariableError> {
        debug!(slot = %slot.key(), owner = ?slot.owner(), "Storing owned variable");
        self.store(slot.key(), value)
    }

    /// Store a value for a slot, writing through immediately.
    ///
    /// The write is skipped when the encoded bytes equal what the slot already
    /// holds in storage. On error nothing in the unit changes.
    pub fn store(
        &mut self,
        slot: &SlotKey,
        value: impl Into<VarValue>,
    ) -> Result<(), VariableError> {
        let value = value.into();
        let real = value.real_value();
        let bytes = self
            .controller
            .codec()
            .encode(&real)
            .map_err(|source| VariableError::Encode {
                slot: slot.clone(),
                source,
            })?;

        if self.dirty.baseline(slot) == Some(bytes.as_slice()) {
            debug!(slot = %slot, "Stored bytes unchanged; write skipped");
        } else {
            self.store.write_bytes(slot, &bytes)?;
            debug!(
                slot = %slot,
                len = bytes.len(),
                fingerprint = %short_fingerprint(&bytes),
                "Stored variable"
            );
        }

        let foreign = value
            .as_proxy()
            .map(|proxy| Rc::clone(proxy.tracker()))
            .filter(|tracker| tracker.slot() != slot);

        let reuse = self
            .cache
            .real(slot)
            .is_some_and(|cached| cached.same_identity(&real))
            .then(|| self.dirty.tracker(slot).cloned())
            .flatten();

        let tracker = if let Some(tracker) = reuse {
            tracker.clear_touched();
            tracker
        } else {
            let proxies = self.controller.proxies();
            let tracker = proxies.tracker(slot.clone());
            let exposed = proxies.wrap(real.clone(), &tracker);
            self.cache.put(slot.clone(), real.clone(), exposed);
            tracker
        };

        // The graph now belongs to two slots; neither tracker sees the
        // other's writes.
        if let Some(other) = foreign {
            other.mark_degraded();
            tracker.mark_degraded();
        }

        if !self
            .dirty
            .register(slot.clone(), real.clone(), bytes.clone(), Rc::clone(&tracker))
        {
            self.dirty.rebase(slot, real, bytes, tracker);
        }
        Ok(())
    }

    /// Write every registered variable whose bytes changed.
    pub fn flush(&mut self) -> Result<FlushReport, FlushAggregateError> {
        let controller = self.controller;
        self.dirty.flush(
            controller.codec(),
            &mut *self.store,
            controller.options().flush_policy,
        )
    }

    /// Flush and end the unit.
    pub fn commit(mut self) -> Result<FlushReport, FlushAggregateError> {
        let report = self.flush();
        debug!(variables = self.dirty.len(), "Unit of work committed");
        report
    }

    /// End the unit without writing anything further.
    pub fn rollback(self) {
        debug!(variables = self.dirty.len(), "Unit of work rolled back");
    }

    #[must_use]
    pub fn is_loaded(&self, slot: &SlotKey) -> bool {
        self.cache.contains(slot)
    }

    #[must_use]
    pub fn is_registered(&self, slot: &SlotKey) -> bool {
        self.dirty.contains(slot)
    }

    #[must_use]
    pub fn baseline(&self, slot: &SlotKey) -> Option<&[u8]> {
        self.dirty.baseline(slot)
    }

    #[must_use]
    pub fn tracker(&self, slot: &SlotKey) -> Option<&Rc<SlotTracker>> {
        self.dirty.tracker(slot)
    }

    /// The real value behind a loaded slot, without degrading it.
    #[must_use]
    pub fn real_value(&self, slot: &SlotKey) -> Option<&Value> {
        self.cache.real(slot)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.dirty.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.dirty.is_empty()
    }

    #[must_use]
    pub fn storage(&self) -> &S {
        &*self.store
    }
}
