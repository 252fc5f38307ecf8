//! Core domain types for procvar.
//!
//! This crate contains pure domain types with no IO and minimal dependencies:
//! the in-memory value graph, slot identity, and policy enums shared by the
//! codec, the unit of work, and configuration.

// Pedantic lint configuration - these are intentional design choices
#![allow(clippy::missing_errors_doc)] // Result-returning functions are self-explanatory
#![allow(clippy::missing_panics_doc)] // Panics are documented in assertions

mod ids;
mod json;
mod policy;
mod value;

pub use ids::{ExecutionId, InvalidTypeName, SlotKey, TypeName, VariableSlot};
pub use json::{BYTES_KEY, JsonValueError, TYPE_KEY, from_json, to_json};
pub use policy::FlushPolicy;
pub use value::{IndexOutOfBounds, ListRef, NativeHandle, ObjectRef, Value};
