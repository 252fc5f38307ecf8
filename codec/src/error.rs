use thiserror::Error;

use procvar_types::{InvalidTypeName, TypeName};

use crate::registry::ResolveError;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EncodingError {
    #[error("native value {label:?} has no portable representation")]
    NonPortable { label: String },
    #[error("type {type_name} is not registered")]
    UnregisteredType { type_name: TypeName },
    #[error("{what} of length {len} exceeds the wire format limit")]
    TooLarge { what: &'static str, len: usize },
    #[error("value nesting exceeds the limit of {limit}")]
    TooDeep { limit: usize },
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodingError {
    #[error("not a procvar blob (bad magic)")]
    BadMagic,
    #[error("unsupported format version {version}")]
    UnsupportedFormat { version: u8 },
    #[error("unexpected end of input at offset {offset}")]
    Truncated { offset: usize },
    #[error("invalid tag 0x{tag:02x} at offset {offset}")]
    InvalidTag { tag: u8, offset: usize },
    #[error("invalid UTF-8 string at offset {offset}")]
    InvalidUtf8 { offset: usize },
    #[error("invalid type name at offset {offset}: {source}")]
    InvalidTypeName {
        offset: usize,
        source: InvalidTypeName,
    },
    #[error("field {field:?} appears twice in {type_name}")]
    DuplicateField { type_name: TypeName, field: String },
    #[error("back-reference to undefined handle {handle}")]
    DanglingReference { handle: u32 },
    #[error("{count} trailing bytes after the root value")]
    TrailingBytes { count: usize },
    #[error("value nesting exceeds the limit of {limit}")]
    TooDeep { limit: usize },
    #[error(transparent)]
    Unresolved(#[from] ResolveError),
}
