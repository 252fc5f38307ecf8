//! Binary codec for value graphs.
//!
//! Layout (little endian):
//!
//! ```text
//! "PVAR" | format u8 | root value
//!
//! value := tag u8, payload
//!   0x00 null   0x01 false   0x02 true
//!   0x03 int    i64
//!   0x04 float  f64 bits
//!   0x05 text   u32 len, UTF-8
//!   0x06 bytes  u32 len, raw
//!   0x07 list   u32 count, values                               (defines handle)
//!   0x08 object str type, u32 version, u16 n + n ancestor strs,
//!               u32 n + n (str field, value)                      (defines handle)
//!   0x09 ref    u32 handle
//! str := u32 len, UTF-8
//! ```
//!
//! Lists and objects get handles in the order they are first written. Reaching
//! the same composite again writes a back-reference, so shared sub-objects and
//! cycles come back with the same shape they went out with.

use std::collections::HashMap;
use std::sync::Arc;

use procvar_types::{ListRef, ObjectRef, TypeName, Value};

use crate::error::{DecodingError, EncodingError};
use crate::registry::{ResolvedVia, TypeRegistry};

pub const MAGIC: &[u8; 4] = b"PVAR";
pub const FORMAT_VERSION: u8 = 1;
pub const DEFAULT_MAX_DEPTH: usize = 256;

const TAG_NULL: u8 = 0x00;
const TAG_FALSE: u8 = 0x01;
const TAG_TRUE: u8 = 0x02;
const TAG_INT: u8 = 0x03;
const TAG_FLOAT: u8 = 0x04;
const TAG_TEXT: u8 = 0x05;
const TAG_BYTES: u8 = 0x06;
const TAG_LIST: u8 = 0x07;
const TAG_OBJECT: u8 = 0x08;
const TAG_REF: u8 = 0x09;

/// Anything that stands for a real value graph.
///
/// Wrappers (change-tracking proxies and the like) yield the value they wrap,
/// so the codec only ever sees the underlying graph.
pub trait RealValue {
    fn real_value(&self) -> Value;
}

impl RealValue for Value {
    fn real_value(&self) -> Value {
        self.clone()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodecLimits {
    /// Maximum nesting of lists and objects, on both encode and decode.
    pub max_depth: usize,
}

impl Default for CodecLimits {
    fn default() -> Self {
        Self {
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ByteCodec {
    registry: Arc<TypeRegistry>,
    limits: CodecLimits,
}

impl ByteCodec {
    #[must_use]
    pub fn new(registry: Arc<TypeRegistry>) -> Self {
        Self {
            registry,
            limits: CodecLimits::default(),
        }
    }

    pub fn with_limits(mut self, limits: CodecLimits) -> Self {
        self.limits = limits;
        self
    }

    #[must_use]
    pub fn registry(&self) -> &TypeRegistry {
        &self.registry
    }

    #[must_use]
    pub fn limits(&self) -> CodecLimits {
        self.limits
    }

    /// Encode the real value behind `value`.
    pub fn encode<V: RealValue + ?Sized>(&self, value: &V) -> Result<Vec<u8>, EncodingError> {
        let root = value.real_value();
        let mut encoder = Encoder {
            registry: &self.registry,
            out: Vec::with_capacity(64),
            handles: HashMap::new(),
            depth: 0,
            max_depth: self.limits.max_depth,
        };
        encoder.out.extend_from_slice(MAGIC);
        encoder.out.push(FORMAT_VERSION);
        encoder.write_value(&root)?;
        Ok(encoder.out)
    }

    /// Decode a blob. Either the whole graph is materialized or nothing is.
    pub fn decode(&self, bytes: &[u8]) -> Result<Value, DecodingError> {
        if bytes.len() < MAGIC.len() || &bytes[..MAGIC.len()] != MAGIC {
            return Err(DecodingError::BadMagic);
        }
        let mut decoder = Decoder {
            registry: &self.registry,
            input: bytes,
            pos: MAGIC.len(),
            handles: Vec::new(),
            depth: 0,
            max_depth: self.limits.max_depth,
        };
        let version = decoder.read_u8()?;
        if version != FORMAT_VERSION {
            return Err(DecodingError::UnsupportedFormat { version });
        }
        let root = decoder.read_value()?;
        let trailing = bytes.len() - decoder.pos;
        if trailing > 0 {
            return Err(DecodingError::TrailingBytes { count: trailing });
        }
        Ok(root)
    }
}

struct Encoder<'a> {
    registry: &'a TypeRegistry,
    out: Vec<u8>,
    handles: HashMap<usize, u32>,
    depth: usize,
    max_depth: usize,
}

impl Encoder<'_> {
    fn write_value(&mut self, value: &Value) -> Result<(), EncodingError> {
        match value {
            Value::Null => self.out.push(TAG_NULL),
            Value::Bool(false) => self.out.push(TAG_FALSE),
            Value::Bool(true) => self.out.push(TAG_TRUE),
            Value::Int(i) => {
                self.out.push(TAG_INT);
                self.out.extend_from_slice(&i.to_le_bytes());
            }
            Value::Float(x) => {
                self.out.push(TAG_FLOAT);
                self.out.extend_from_slice(&x.to_bits().to_le_bytes());
            }
            Value::Text(s) => {
                self.out.push(TAG_TEXT);
                self.write_str(s, "text")?;
            }
            Value::Bytes(bytes) => {
                self.out.push(TAG_BYTES);
                self.write_len(bytes.len(), "byte string")?;
                self.out.extend_from_slice(bytes);
            }
            Value::Native(handle) => {
                return Err(EncodingError::NonPortable {
                    label: handle.label().to_string(),
                });
            }
            Value::List(list) => {
                if self.write_back_ref(list.addr()) {
                    return Ok(());
                }
                self.enter()?;
                self.out.push(TAG_LIST);
                let items = list.to_vec();
                self.write_len(items.len(), "list")?;
                for item in &items {
                    self.write_value(item)?;
                }
                self.depth -= 1;
            }
            Value::Object(obj) => {
                if self.write_back_ref(obj.addr()) {
                    return Ok(());
                }
                self.enter()?;
                self.write_object(obj)?;
                self.depth -= 1;
            }
        }
        Ok(())
    }

    fn write_object(&mut self, obj: &ObjectRef) -> Result<(), EncodingError> {
        let type_name = obj.type_name();
        let Some(descriptor) = self.registry.get(&type_name) else {
            return Err(EncodingError::UnregisteredType { type_name });
        };
        let version = descriptor.type_version();
        let ancestors = self.registry.ancestors(&type_name);

        self.out.push(TAG_OBJECT);
        self.write_str(type_name.as_str(), "type name")?;
        self.out.extend_from_slice(&version.to_le_bytes());
        let ancestor_count = u16::try_from(ancestors.len()).map_err(|_| EncodingError::TooLarge {
            what: "ancestor chain",
            len: ancestors.len(),
        })?;
        self.out.extend_from_slice(&ancestor_count.to_le_bytes());
        for ancestor in &ancestors {
            self.write_str(ancestor.as_str(), "type name")?;
        }

        let fields = obj.fields();
        self.write_len(fields.len(), "field map")?;
        for (name, field) in &fields {
            self.write_str(name, "field name")?;
            self.write_value(field)?;
        }
        Ok(())
    }

    /// Emit a back-reference if `addr` was already written; otherwise assign
    /// it the next handle.
    fn write_back_ref(&mut self, addr: usize) -> bool {
        if let Some(handle) = self.handles.get(&addr) {
            self.out.push(TAG_REF);
            self.out.extend_from_slice(&handle.to_le_bytes());
            return true;
        }
        let next = self.handles.len() as u32;
        self.handles.insert(addr, next);
        false
    }

    fn enter(&mut self) -> Result<(), EncodingError> {
        self.depth += 1;
        if self.depth > self.max_depth {
            return Err(EncodingError::TooDeep {
                limit: self.max_depth,
            });
        }
        Ok(())
    }

    fn write_len(&mut self, len: usize, what: &'static str) -> Result<(), EncodingError> {
        let len32 = u32::try_from(len).map_err(|_| EncodingError::TooLarge { what, len })?;
        self.out.extend_from_slice(&len32.to_le_bytes());
        Ok(())
    }

    fn write_str(&mut self, s: &str, what: &'static str) -> Result<(), EncodingError> {
        self.write_len(s.len(), what)?;
        self.out.extend_from_slice(s.as_bytes());
        Ok(())
    }
}

struct Decoder<'a> {
    registry: &'a TypeRegistry,
    input: &'a [u8],
    pos: usize,
    handles: Vec<Value>,
    depth: usize,
    max_depth: usize,
}

impl Decoder<'_> {
    fn read_value(&mut self) -> Result<Value, DecodingError> {
        let offset = self.pos;
        let tag = self.read_u8()?;
        match tag {
            TAG_NULL => Ok(Value::Null),
            TAG_FALSE => Ok(Value::Bool(false)),
            TAG_TRUE => Ok(Value::Bool(true)),
            TAG_INT => Ok(Value::Int(i64::from_le_bytes(self.read_array()?))),
            TAG_FLOAT => Ok(Value::Float(f64::from_bits(u64::from_le_bytes(
                self.read_array()?,
            )))),
            TAG_TEXT => Ok(Value::Text(self.read_str()?)),
            TAG_BYTES => {
                let len = self.read_u32()? as usize;
                Ok(Value::Bytes(self.take(len)?.to_vec()))
            }
            TAG_LIST => {
                self.enter()?;
                let count = self.read_u32()? as usize;
                // Each item takes at least one byte; never trust the count for allocation.
                let list = ListRef::new(Vec::with_capacity(count.min(self.remaining())));
                self.handles.push(Value::List(list.clone()));
                for _ in 0..count {
                    let item = self.read_value()?;
                    list.push(item);
                }
                self.depth -= 1;
                Ok(Value::List(list))
            }
            TAG_OBJECT => {
                self.enter()?;
                let obj = self.read_object()?;
                self.depth -= 1;
                Ok(Value::Object(obj))
            }
            TAG_REF => {
                let handle = self.read_u32()?;
                self.handles
                    .get(handle as usize)
                    .cloned()
                    .ok_or(DecodingError::DanglingReference { handle })
            }
            _ => Err(DecodingError::InvalidTag { tag, offset }),
        }
    }

    fn read_object(&mut self) -> Result<ObjectRef, DecodingError> {
        let stored = self.read_type_name()?;
        let stored_version = self.read_u32()?;
        let ancestor_count = u16::from_le_bytes(self.read_array()?);
        let mut ancestors = Vec::with_capacity(usize::from(ancestor_count).min(self.remaining()));
        for _ in 0..ancestor_count {
            ancestors.push(self.read_type_name()?);
        }

        let registry = self.registry;
        let resolved = registry.resolve(&stored, stored_version, &ancestors)?;
        let descriptor = resolved.descriptor;
        if resolved.via != ResolvedVia::Exact {
            tracing::debug!(
                stored = %stored,
                resolved = %descriptor.name(),
                via = ?resolved.via,
                "Decoding stored type as registered substitute"
            );
        }

        let obj = ObjectRef::new(descriptor.name().clone());
        self.handles.push(Value::Object(obj.clone()));

        let schema = descriptor.schema();
        let field_count = self.read_u32()?;
        for _ in 0..field_count {
            let name = self.read_str()?;
            let value = self.read_value()?;
            if obj.has_field(&name) {
                return Err(DecodingError::DuplicateField {
                    type_name: stored,
                    field: name,
                });
            }
            match schema {
                Some(fields) if !fields.iter().any(|f| *f == name) => {
                    tracing::debug!(
                        type_name = %descriptor.name(),
                        field = %name,
                        "Dropping field not in registered schema"
                    );
                }
                _ => {
                    obj.set(name, value);
                }
            }
        }
        if let Some(fields) = schema {
            for field in fields {
                if !obj.has_field(field) {
                    obj.set(field.clone(), Value::Null);
                }
            }
        }
        Ok(obj)
    }

    fn read_type_name(&mut self) -> Result<TypeName, DecodingError> {
        let offset = self.pos;
        let raw = self.read_str()?;
        TypeName::new(raw).map_err(|source| DecodingError::InvalidTypeName { offset, source })
    }

    fn enter(&mut self) -> Result<(), DecodingError> {
        self.depth += 1;
        if self.depth > self.max_depth {
            return Err(DecodingError::TooDeep {
                limit: self.max_depth,
            });
        }
        Ok(())
    }

    fn remaining(&self) -> usize {
        self.input.len() - self.pos
    }

    fn take(&mut self, len: usize) -> Result<&[u8], DecodingError> {
        if len > self.remaining() {
            return Err(DecodingError::Truncated {
                offset: self.input.len(),
            });
        }
        let slice = &self.input[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N], DecodingError> {
        let mut buf = [0u8; N];
        buf.copy_from_slice(self.take(N)?);
        Ok(buf)
    }

    fn read_u8(&mut self) -> Result<u8, DecodingError> {
        Ok(self.read_array::<1>()?[0])
    }

    fn read_u32(&mut self) -> Result<u32, DecodingError> {
        Ok(u32::from_le_bytes(self.read_array()?))
    }

    fn read_str(&mut self) -> Result<String, DecodingError> {
        let len = self.read_u32()? as usize;
        let offset = self.pos;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| DecodingError::InvalidUtf8 { offset })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{NAMED_REF_TYPE, ResolveError, TypeDescriptor};
    use procvar_types::NativeHandle;

    fn name(s: &str) -> TypeName {
        TypeName::new(s).expect("valid type name")
    }

    fn codec() -> ByteCodec {
        let mut registry = TypeRegistry::new();
        for type_name in ["Order", "Item", "Node"] {
            registry
                .register(TypeDescriptor::new(name(type_name)))
                .expect("register");
        }
        ByteCodec::new(Arc::new(registry))
    }

    fn order(sku: &str) -> Value {
        Value::object(
            name("Order"),
            [
                ("total", Value::Int(10)),
                (
                    "items",
                    Value::list([Value::object(name("Item"), [("sku", Value::from(sku))])]),
                ),
                ("note", Value::Null),
                ("paid", Value::Bool(true)),
                ("ratio", Value::Float(0.25)),
                ("blob", Value::Bytes(vec![1, 2, 3])),
            ],
        )
    }

    #[test]
    fn round_trip_object_graph() {
        let codec = codec();
        let value = order("A");
        let bytes = codec.encode(&value).expect("encode");
        assert_eq!(&bytes[..4], MAGIC);
        assert_eq!(codec.decode(&bytes).expect("decode"), value);
    }

    #[test]
    fn round_trip_leaf_values() {
        let codec = codec();
        for value in [
            Value::Null,
            Value::Int(-7),
            Value::from("plain"),
            Value::Float(f64::NAN),
        ] {
            let bytes = codec.encode(&value).expect("encode");
            assert_eq!(codec.decode(&bytes).expect("decode"), value);
        }
    }

    #[test]
    fn encoding_is_deterministic() {
        let codec = codec();
        assert_eq!(
            codec.encode(&order("A")).expect("encode"),
            codec.encode(&order("A")).expect("encode")
        );
        assert_ne!(
            codec.encode(&order("A")).expect("encode"),
            codec.encode(&order("B")).expect("encode")
        );
    }

    #[test]
    fn shared_references_and_cycles_survive() {
        let codec = codec();
        let item = Value::object(name("Item"), [("sku", Value::from("A"))]);
        let node = ObjectRef::new(name("Node"));
        node.set("self", Value::Object(node.clone()));
        node.set("left", item.clone());
        node.set("right", item);

        let decoded = codec
            .decode(&codec.encode(&Value::Object(node)).expect("encode"))
            .expect("decode");
        let decoded = decoded.as_object().expect("object");
        let left = decoded.get("left").expect("left");
        let right = decoded.get("right").expect("right");
        assert!(left.same_identity(&right));
        let own = decoded.get("self").expect("self");
        assert!(own.as_object().expect("object").ptr_eq(decoded));
    }

    #[test]
    fn native_values_are_not_portable() {
        let value = Value::object(
            name("Order"),
            [("conn", Value::Native(NativeHandle::new("db-connection", ())))],
        );
        assert_eq!(
            codec().encode(&value),
            Err(EncodingError::NonPortable {
                label: "db-connection".to_string()
            })
        );
    }

    #[test]
    fn unregistered_type_fails_to_encode() {
        let value = Value::object(name("Invoice"), [("total", Value::Int(1))]);
        assert_eq!(
            codec().encode(&value),
            Err(EncodingError::UnregisteredType {
                type_name: name("Invoice")
            })
        );
    }

    #[test]
    fn unknown_type_fails_to_decode() {
        let mut writer_registry = TypeRegistry::new();
        writer_registry
            .register(TypeDescriptor::new(name("Invoice")))
            .expect("register");
        let writer = ByteCodec::new(Arc::new(writer_registry));
        let bytes = writer
            .encode(&Value::list([Value::object(name("Invoice"), [("n", Value::Int(1))])]))
            .expect("encode");

        assert_eq!(
            codec().decode(&bytes),
            Err(DecodingError::Unresolved(ResolveError::UnknownType {
                type_name: name("Invoice")
            }))
        );
    }

    #[test]
    fn schema_drops_unknown_and_defaults_missing_fields() {
        let writer = codec();
        let bytes = writer
            .encode(&Value::object(
                name("Order"),
                [("total", Value::Int(3)), ("legacy", Value::from("x"))],
            ))
            .expect("encode");

        let mut registry = TypeRegistry::new();
        registry
            .register(TypeDescriptor::new(name("Order")).fields(["total", "currency"]))
            .expect("register");
        let decoded = ByteCodec::new(Arc::new(registry))
            .decode(&bytes)
            .expect("decode");
        let obj = decoded.as_object().expect("object");
        assert_eq!(obj.field_names(), vec!["currency", "total"]);
        assert_eq!(obj.get("currency"), Some(Value::Null));
        assert_eq!(obj.get("total"), Some(Value::Int(3)));
    }

    #[test]
    fn subtype_decodes_as_registered_ancestor() {
        let mut writer_registry = TypeRegistry::new();
        writer_registry
            .register(TypeDescriptor::new(name("Order")))
            .expect("register");
        writer_registry
            .register(TypeDescriptor::new(name("RushOrder")).parent(name("Order")))
            .expect("register");
        let bytes = ByteCodec::new(Arc::new(writer_registry))
            .encode(&Value::object(name("RushOrder"), [("total", Value::Int(5))]))
            .expect("encode");

        let decoded = codec().decode(&bytes).expect("decode");
        let obj = decoded.as_object().expect("object");
        assert_eq!(obj.type_name(), name("Order"));
        assert_eq!(obj.get("total"), Some(Value::Int(5)));
    }

    #[test]
    fn malformed_input_is_rejected() {
        let codec = codec();
        assert_eq!(codec.decode(b"nope"), Err(DecodingError::BadMagic));
        assert_eq!(
            codec.decode(b"PVAR\x07\x00"),
            Err(DecodingError::UnsupportedFormat { version: 7 })
        );
        assert!(matches!(
            codec.decode(b"PVAR\x01\x05\xff\x00\x00\x00ab"),
            Err(DecodingError::Truncated { .. })
        ));
        assert_eq!(
            codec.decode(b"PVAR\x01\x0f"),
            Err(DecodingError::InvalidTag { tag: 0x0f, offset: 5 })
        );
        assert_eq!(
            codec.decode(b"PVAR\x01\x00\x00"),
            Err(DecodingError::TrailingBytes { count: 1 })
        );
        assert_eq!(
            codec.decode(b"PVAR\x01\x09\x00\x00\x00\x00"),
            Err(DecodingError::DanglingReference { handle: 0 })
        );
    }

    #[test]
    fn truncated_blob_never_yields_partial_graph() {
        let codec = codec();
        let bytes = codec.encode(&order("A")).expect("encode");
        for cut in 0..bytes.len() {
            assert!(codec.decode(&bytes[..cut]).is_err(), "cut at {cut}");
        }
    }

    #[test]
    fn depth_limit_applies_both_ways() {
        let mut nested = Value::list([]);
        for _ in 0..5 {
            nested = Value::list([nested]);
        }
        let shallow = codec().with_limits(CodecLimits { max_depth: 3 });
        assert_eq!(
            shallow.encode(&nested),
            Err(EncodingError::TooDeep { limit: 3 })
        );
        let bytes = codec().encode(&nested).expect("encode");
        assert_eq!(shallow.decode(&bytes), Err(DecodingError::TooDeep { limit: 3 }));
    }

    #[test]
    fn named_ref_builtin_round_trips() {
        let codec = codec();
        let value = Value::object(name(NAMED_REF_TYPE), [("key", Value::from("mailer"))]);
        let bytes = codec.encode(&value).expect("encode");
        assert_eq!(codec.decode(&bytes).expect("decode"), value);
    }
}
