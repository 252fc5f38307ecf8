use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Opaque storage key of one persisted variable.
///
/// The key is whatever the storage collaborator uses to address a blob. It is
/// compared and hashed as a plain string; nothing in procvar interprets it.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SlotKey(String);

impl SlotKey {
    #[must_use]
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SlotKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SlotKey {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for SlotKey {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionId(u64);

impl ExecutionId {
    #[must_use]
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    #[must_use]
    pub fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Addressable identity of one persisted variable.
///
/// The owner is held by id only; a slot never keeps its execution alive.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VariableSlot {
    key: SlotKey,
    owner: Option<ExecutionId>,
}

impl VariableSlot {
    #[must_use]
    pub fn new(key: impl Into<SlotKey>) -> Self {
        Self {
            key: key.into(),
            owner: None,
        }
    }

    #[must_use]
    pub fn owned_by(key: impl Into<SlotKey>, owner: ExecutionId) -> Self {
        Self {
            key: key.into(),
            owner: Some(owner),
        }
    }

    #[must_use]
    pub fn key(&self) -> &SlotKey {
        &self.key
    }

    #[must_use]
    pub fn owner(&self) -> Option<ExecutionId> {
        self.owner
    }
}

impl fmt::Display for VariableSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.owner {
            Some(owner) => write!(f, "{}@{owner}", self.key),
            None => write!(f, "{}", self.key),
        }
    }
}

/// Name of a registered object type.
///
/// # Invariants
///
/// - Never empty or whitespace-only
/// - Never contains control characters
///
/// Validation happens at construction and on deserialization.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TypeName(String);

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum InvalidTypeName {
    #[error("type name must not be empty")]
    Empty,
    #[error("type name {0:?} contains control characters")]
    ControlCharacter(String),
}

impl TypeName {
    pub fn new(value: impl Into<String>) -> Result<Self, InvalidTypeName> {
        let value = value.into();
        if value.trim().is_empty() {
            return Err(InvalidTypeName::Empty);
        }
        if value.chars().any(char::is_control) {
            return Err(InvalidTypeName::ControlCharacter(value));
        }
        Ok(Self(value))
    }

    /// Type names for compile-time constants. Panics on an invalid literal.
    #[must_use]
    pub fn from_static(value: &'static str) -> Self {
        match Self::new(value) {
            Ok(name) => name,
            Err(err) => panic!("invalid static type name: {err}"),
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TypeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for TypeName {
    type Error = InvalidTypeName;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl TryFrom<&str> for TypeName {
    type Error = InvalidTypeName;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<TypeName> for String {
    fn from(value: TypeName) -> Self {
        value.0
    }
}

impl AsRef<str> for TypeName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
