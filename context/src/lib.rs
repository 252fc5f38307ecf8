//! Unit-of-work persistence for process variables.
//!
//! Callers load variables and get back live values they can mutate in place.
//! Composite values come wrapped in change-tracking proxies; at flush every
//! registered variable is re-encoded and written only if its bytes changed.
//!
//! # Architecture
//!
//! ```text
//! VariableController (process-wide: codec + proxy factory + options)
//! └── begin(&mut store) -> UnitOfWork (one logical operation)
//!     ├── cache: DeserializationCache   slot -> (real value, exposed value)
//!     ├── dirty: DirtyCheckRegistry     slot -> (real value, baseline bytes, tracker)
//!     └── store: &mut dyn VariableStore read on first load, written on store/flush
//!
//! Proxy (per list/object) ──shares──> SlotTracker (per slot: touched, degraded)
//! ```

// Pedantic lint configuration - these are intentional design choices
#![allow(clippy::missing_errors_doc)] // Result-returning functions are self-explanatory
#![allow(clippy::missing_panics_doc)] // Panics are documented in assertions

mod cache;
mod controller;
mod dirty;
mod names;
mod proxy;
mod store;
mod unit_of_work;

pub use cache::DeserializationCache;
pub use controller::{ControllerOptions, VariableController, VariableError};
pub use dirty::{
    DirtyCheckRegistry, FlushAggregateError, FlushFailure, FlushFailureCause, FlushReport,
};
pub use names::{NameError, NamedObjects};
pub use proxy::{AccessError, Proxy, ProxyFactory, SlotTracker, VarValue};
pub use store::{MemoryStore, StoreError, VariableStore};
pub use unit_of_work::UnitOfWork;
