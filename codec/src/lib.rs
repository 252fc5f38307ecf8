//! Byte codec for procvar values.
//!
//! ```text
//! ByteCodec
//! ├── encode: RealValue -> bytes   (unwraps proxies via RealValue)
//! └── decode: bytes -> Value       (types resolved through TypeRegistry)
//! ```

mod codec;
mod digest;
mod error;
mod registry;

pub use codec::{ByteCodec, CodecLimits, DEFAULT_MAX_DEPTH, FORMAT_VERSION, MAGIC, RealValue};
pub use digest::{fingerprint, short_fingerprint};
pub use error::{DecodingError, EncodingError};
pub use registry::{
    Extensibility, Mutability, NAMED_REF_TYPE, RegistryError, ResolveError, Resolved,
    ResolvedVia, TypeDescriptor, TypeRegistry,
};
