//! Flush-time dirty checking.
//!
//! Every loaded or stored variable is registered with the bytes it was last
//! known to have in storage. A flush re-encodes the live value and writes only
//! when the bytes differ. The byte comparison is the authoritative signal;
//! tracker state is only used to prune work under [`FlushPolicy::TouchedOnly`].

use std::collections::BTreeMap;
use std::rc::Rc;

use thiserror::Error;
use tracing::{debug, info, warn};

use procvar_codec::{ByteCodec, EncodingError, short_fingerprint};
use procvar_types::{FlushPolicy, SlotKey, Value};

use crate::proxy::SlotTracker;
use crate::store::{StoreError, VariableStore};

struct Entry {
    value: Value,
    baseline: Vec<u8>,
    tracker: Rc<SlotTracker>,
}

/// Outcome of a flush pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Slots whose bytes changed and were written, in key order.
    pub written: Vec<SlotKey>,
    /// Slots re-encoded to identical bytes.
    pub unchanged: usize,
    /// Slots not re-encoded because the policy pruned them.
    pub skipped: usize,
}

impl FlushReport {
    #[must_use]
    pub fn writes(&self) -> usize {
        self.written.len()
    }
}

#[derive(Debug, Error)]
pub enum FlushFailureCause {
    #[error(transparent)]
    Encode(#[from] EncodingError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Error)]
#[error("couldn't flush variable {slot}: {cause}")]
pub struct FlushFailure {
    pub slot: SlotKey,
    #[source]
    pub cause: FlushFailureCause,
}

/// Every per-slot failure of one flush, plus what did succeed.
#[derive(Debug, Error)]
#[error("flush failed for {count} variable(s)", count = .failures.len())]
pub struct FlushAggregateError {
    pub failures: Vec<FlushFailure>,
    pub report: FlushReport,
}

impl FlushAggregateError {
    pub fn failed_slots(&self) -> impl Iterator<Item = &SlotKey> {
        self.failures.iter().map(|failure| &failure.slot)
    }
}

#[derive(Default)]
pub struct DirtyCheckRegistry {
    entries: BTreeMap<SlotKey, Entry>,
}

impl DirtyCheckRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a slot on first load or store. Returns `false` and leaves the
    /// existing entry alone if the slot is already registered.
    pub fn register(
        &mut self,
        slot: SlotKey,
        value: Value,
        baseline: Vec<u8>,
        tracker: Rc<SlotTracker>,
    ) -> bool {
        if self.entries.contains_key(&slot) {
            return false;
        }
        self.entries.insert(
            slot,
            Entry {
                value,
                baseline,
                tracker,
            },
        );
        true
    }

    /// Replace a registered slot's value and baseline after it was stored.
    pub fn rebase(
        &mut self,
        slot: &SlotKey,
        value: Value,
        baseline: Vec<u8>,
        tracker: Rc<SlotTracker>,
    ) -> bool {
        let Some(entry) = self.entries.get_mut(slot) else {
            return false;
        };
        entry.value = value;
        entry.baseline = baseline;
        entry.tracker = tracker;
        true
    }

    #[must_use]
    pub fn baseline(&self, slot: &SlotKey) -> Option<&[u8]> {
        self.entries.get(slot).map(|entry| entry.baseline.as_slice())
    }

    #[must_use]
    pub fn tracker(&self, slot: &SlotKey) -> Option<&Rc<SlotTracker>> {
        self.entries.get(slot).map(|entry| &entry.tracker)
    }

    #[must_use]
    pub fn contains(&self, slot: &SlotKey) -> bool {
        self.entries.contains_key(slot)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn slots(&self) -> impl Iterator<Item = &SlotKey> {
        self.entries.keys()
    }

    /// Re-encode registered values and write the ones whose bytes changed.
    ///
    /// All slots are attempted. A failed slot keeps its old baseline, so the
    /// next flush tries it again.
    pub fn flush<S: VariableStore + ?Sized>(
        &mut self,
        codec: &ByteCodec,
        store: &mut S,
        policy: FlushPolicy,
    ) -> Result<FlushReport, FlushAggregateError> {
        let mut report = FlushReport::default();
        let mut failures = Vec::new();

        for (slot, entry) in &mut self.entries {
            if policy == FlushPolicy::TouchedOnly && !entry.tracker.needs_compare() {
                report.skipped += 1;
                continue;
            }

            let bytes = match codec.encode(&entry.value) {
                Ok(bytes) => bytes,
                Err(err) => {
                    warn!(slot = %slot, error = %err, "Couldn't encode variable during flush");
                    failures.push(FlushFailure {
                        slot: slot.clone(),
                        cause: err.into(),
                    });
                    continue;
                }
            };

            if bytes == entry.baseline {
                debug!(slot = %slot, "Variable unchanged");
                entry.tracker.clear_touched();
                report.unchanged += 1;
                continue;
            }

            if let Err(err) = store.write_bytes(slot, &bytes) {
                warn!(slot = %slot, error = %err, "Couldn't write dirty variable");
                failures.push(FlushFailure {
                    slot: slot.clone(),
                    cause: err.into(),
                });
                continue;
            }

            debug!(
                slot = %slot,
                from = %short_fingerprint(&entry.baseline),
                to = %short_fingerprint(&bytes),
                len = bytes.len(),
                "Wrote dirty variable"
            );
            entry.baseline = bytes;
            entry.tracker.clear_touched();
            report.written.push(slot.clone());
        }

        info!(
            written = report.writes(),
            unchanged = report.unchanged,
            skipped = report.skipped,
            failed = failures.len(),
            policy = policy.as_str(),
            "Flushed variables"
        );

        if failures.is_empty() {
            Ok(report)
        } else {
            Err(FlushAggregateError { failures, report })
        }
    }
}
