//! Change-tracking proxies over a variable's object graph.
//!
//! A [`Proxy`] wraps one list or object of a loaded variable and shares the
//! variable's [`SlotTracker`]. Reads that return composites hand back another
//! proxy on the same tracker, so a write any number of levels down
//! (`order.get("items")?.at(0)?.set("sku", "B")`) still marks the variable.
//!
//! Read/write classification is structural for the typed methods (`get`,
//! `set`, `at`, `push`, ...). [`Proxy::invoke`] classifies by accessor naming
//! (`getX`/`isX` read, `setX` write, camelCase or snake_case). That is a
//! heuristic: a misclassified call only affects the touched hint, never what a
//! flush writes, because flush compares encoded bytes.
//!
//! Values that cannot be intercepted (sealed types, native handles, or any
//! composite when proxying is off) are handed out unwrapped and the slot is
//! marked degraded: it is always re-encoded at flush.
//!
//! Objects of immutable types come back as [`VarValue::Frozen`]. They need no
//! tracking because nothing may write them; writes through them fail with
//! [`AccessError::Immutable`].

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::rc::{Rc, Weak};
use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

use procvar_codec::{RealValue, TypeRegistry};
use procvar_types::{IndexOutOfBounds, ListRef, ObjectRef, SlotKey, TypeName, Value};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AccessError {
    #[error("{type_name} has no field {field:?}")]
    NoSuchField { type_name: TypeName, field: String },
    #[error("expected {expected}, found {actual}")]
    WrongShape {
        expected: &'static str,
        actual: &'static str,
    },
    #[error(transparent)]
    OutOfBounds(#[from] IndexOutOfBounds),
    #[error("{type_name} is immutable")]
    Immutable { type_name: TypeName },
    #[error("{method} is not an accessor or mutator")]
    UnknownMethod { method: String },
    #[error("{method} takes {expected} argument(s), got {actual}")]
    Arity {
        method: String,
        expected: usize,
        actual: usize,
    },
}

/// Per-slot change state shared by every proxy of one variable's graph.
pub struct SlotTracker {
    slot: SlotKey,
    factory: ProxyFactory,
    touched: Cell<bool>,
    degraded: Cell<bool>,
    proxies: RefCell<HashMap<usize, Weak<ProxyNode>>>,
}

impl SlotTracker {
    #[must_use]
    pub fn slot(&self) -> &SlotKey {
        &self.slot
    }

    /// A write-like call went through one of this slot's proxies.
    #[must_use]
    pub fn is_touched(&self) -> bool {
        self.touched.get()
    }

    /// Part of the graph is reachable without interception.
    #[must_use]
    pub fn is_degraded(&self) -> bool {
        self.degraded.get()
    }

    /// Whether a touched-only flush has to re-encode this slot.
    #[must_use]
    pub fn needs_compare(&self) -> bool {
        self.is_touched() || self.is_degraded()
    }

    pub(crate) fn mark_touched(&self) {
        self.touched.set(true);
    }

    pub(crate) fn mark_degraded(&self) {
        self.degraded.set(true);
    }

    pub(crate) fn clear_touched(&self) {
        self.touched.set(false);
    }
}

impl SlotTracker {
    /// Memoized proxies whose handles are still alive.
    #[cfg(test)]
    pub(crate) fn memoized(&self) -> usize {
        self.proxies.borrow().len()
    }
}

impl fmt::Debug for SlotTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlotTracker")
            .field("slot", &self.slot)
            .field("touched", &self.touched.get())
            .field("degraded", &self.degraded.get())
            .finish_non_exhaustive()
    }
}

enum Interception {
    Leaf,
    Frozen,
    Unsupported(&'static str),
    Supported(usize),
}

/// Creates slot trackers and wraps values for them.
#[derive(Debug, Clone)]
pub struct ProxyFactory {
    registry: Arc<TypeRegistry>,
    enabled: bool,
}

impl ProxyFactory {
    #[must_use]
    pub fn new(registry: Arc<TypeRegistry>) -> Self {
        Self {
            registry,
            enabled: true,
        }
    }

    /// With proxying off every composite is handed out unwrapped.
    #[must_use]
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    #[must_use]
    pub fn tracker(&self, slot: SlotKey) -> Rc<SlotTracker> {
        Rc::new(SlotTracker {
            slot,
            factory: self.clone(),
            touched: Cell::new(false),
            degraded: Cell::new(false),
            proxies: RefCell::new(HashMap::new()),
        })
    }

    /// Wrap `value` for `tracker`'s slot.
    ///
    /// Wrapping the same list or object twice for one tracker yields the same
    /// proxy as long as the first one is still alive.
    pub fn wrap(&self, value: Value, tracker: &Rc<SlotTracker>) -> VarValue {
        match self.interception(&value) {
            Interception::Leaf => VarValue::Plain(value),
            Interception::Frozen => VarValue::Frozen(value),
            Interception::Unsupported(reason) => {
                debug!(
                    slot = %tracker.slot,
                    kind = value.kind_name(),
                    reason,
                    "Value not intercepted; slot will always be re-encoded"
                );
                tracker.mark_degraded();
                VarValue::Plain(value)
            }
            Interception::Supported(addr) => {
                let existing = tracker
                    .proxies
                    .borrow()
                    .get(&addr)
                    .and_then(Weak::upgrade);
                if let Some(node) = existing {
                    return VarValue::Tracked(Proxy(node));
                }
                let node = Rc::new(ProxyNode {
                    target: value,
                    tracker: Rc::clone(tracker),
                });
                let mut proxies = tracker.proxies.borrow_mut();
                proxies.retain(|_, weak| weak.strong_count() > 0);
                proxies.insert(addr, Rc::downgrade(&node));
                VarValue::Tracked(Proxy(node))
            }
        }
    }

    fn interception(&self, value: &Value) -> Interception {
        match value {
            Value::Object(obj) => {
                let descriptor = self.registry.get(&obj.type_name());
                if descriptor.is_some_and(|d| d.is_immutable()) {
                    Interception::Frozen
                } else if !self.enabled {
                    Interception::Unsupported("proxying disabled")
                } else if descriptor.is_some_and(|d| d.is_sealed()) {
                    Interception::Unsupported("sealed type")
                } else {
                    Interception::Supported(obj.addr())
                }
            }
            Value::List(list) if self.enabled => Interception::Supported(list.addr()),
            Value::List(_) => Interception::Unsupported("proxying disabled"),
            Value::Native(_) => Interception::Unsupported("native handle"),
            _ => Interception::Leaf,
        }
    }
}

struct ProxyNode {
    target: Value,
    tracker: Rc<SlotTracker>,
}

/// Stand-in for one list or object of a loaded variable.
///
/// Cloning a proxy clones the handle; [`Proxy::ptr_eq`] compares identity.
#[derive(Clone)]
pub struct Proxy(Rc<ProxyNode>);

impl Proxy {
    #[must_use]
    pub fn slot(&self) -> &SlotKey {
        &self.0.tracker.slot
    }

    #[must_use]
    pub fn tracker(&self) -> &Rc<SlotTracker> {
        &self.0.tracker
    }

    #[must_use]
    pub fn is_touched(&self) -> bool {
        self.0.tracker.is_touched()
    }

    #[must_use]
    pub fn ptr_eq(&self, other: &Proxy) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    #[must_use]
    pub fn kind_name(&self) -> &'static str {
        self.0.target.kind_name()
    }

    #[must_use]
    pub fn type_name(&self) -> Option<TypeName> {
        self.0.target.as_object().map(ObjectRef::type_name)
    }

    /// The real value behind the proxy.
    ///
    /// Writes made directly on the returned value bypass interception, so the
    /// slot is treated as degraded from here on.
    #[must_use]
    pub fn unwrap(&self) -> Value {
        self.0.tracker.mark_degraded();
        self.0.target.clone()
    }

    // ---- object access ----

    pub fn get(&self, field: &str) -> Result<VarValue, AccessError> {
        let obj = self.object()?;
        let value = obj.get(field).ok_or_else(|| AccessError::NoSuchField {
            type_name: obj.type_name(),
            field: field.to_string(),
        })?;
        Ok(self.wrap_read(value))
    }

    pub fn has_field(&self, field: &str) -> Result<bool, AccessError> {
        Ok(self.object()?.has_field(field))
    }

    pub fn field_names(&self) -> Result<Vec<String>, AccessError> {
        Ok(self.object()?.field_names())
    }

    pub fn set(&self, field: &str, value: impl Into<VarValue>) -> Result<(), AccessError> {
        let obj = self.object()?;
        let value = self.absorb(value.into());
        obj.set(field, value);
        self.0.tracker.mark_touched();
        Ok(())
    }

    // ---- list access ----

    pub fn len(&self) -> Result<usize, AccessError> {
        Ok(self.list()?.len())
    }

    pub fn is_empty(&self) -> Result<bool, AccessError> {
        Ok(self.list()?.is_empty())
    }

    pub fn at(&self, index: usize) -> Result<VarValue, AccessError> {
        let list = self.list()?;
        let value = list.get(index).ok_or(IndexOutOfBounds {
            index,
            len: list.len(),
        })?;
        Ok(self.wrap_read(value))
    }

    pub fn items(&self) -> Result<Vec<VarValue>, AccessError> {
        Ok(self
            .list()?
            .to_vec()
            .into_iter()
            .map(|item| self.wrap_read(item))
            .collect())
    }

    pub fn set_at(&self, index: usize, value: impl Into<VarValue>) -> Result<(), AccessError> {
        let list = self.list()?;
        let value = self.absorb(value.into());
        list.set(index, value)?;
        self.0.tracker.mark_touched();
        Ok(())
    }

    pub fn push(&self, value: impl Into<VarValue>) -> Result<(), AccessError> {
        let list = self.list()?;
        let value = self.absorb(value.into());
        list.push(value);
        self.0.tracker.mark_touched();
        Ok(())
    }

    pub fn insert(&self, index: usize, value: impl Into<VarValue>) -> Result<(), AccessError> {
        let list = self.list()?;
        let value = self.absorb(value.into());
        list.insert(index, value)?;
        self.0.tracker.mark_touched();
        Ok(())
    }

    /// Remove and return an item. The removed value is detached from the
    /// variable and returned unwrapped.
    pub fn remove_at(&self, index: usize) -> Result<Value, AccessError> {
        let removed = self.list()?.remove(index)?;
        self.0.tracker.mark_touched();
        Ok(removed)
    }

    // ---- accessor-convention dispatch ----

    /// Call an accessor or mutator by name on an object proxy.
    ///
    /// `getTotal()`, `get_total()`, `isPaid()` read the matching field;
    /// `setTotal(v)` / `set_total(v)` write it. The field must exist.
    pub fn invoke(&self, method: &str, args: &[VarValue]) -> Result<Option<VarValue>, AccessError> {
        let obj = self.object()?;
        let accessor = Accessor::parse(method).ok_or_else(|| AccessError::UnknownMethod {
            method: method.to_string(),
        })?;
        let field = accessor
            .candidates()
            .into_iter()
            .find(|candidate| obj.has_field(candidate))
            .ok_or_else(|| AccessError::NoSuchField {
                type_name: obj.type_name(),
                field: accessor.property().to_string(),
            })?;

        let expected = usize::from(accessor.is_write());
        if args.len() != expected {
            return Err(AccessError::Arity {
                method: method.to_string(),
                expected,
                actual: args.len(),
            });
        }
        match accessor {
            Accessor::Read(_) => self.get(&field).map(Some),
            Accessor::Write(_) => {
                self.set(&field, args[0].clone())?;
                Ok(None)
            }
        }
    }

    fn object(&self) -> Result<&ObjectRef, AccessError> {
        self.0.target.as_object().ok_or(AccessError::WrongShape {
            expected: "object",
            actual: self.0.target.kind_name(),
        })
    }

    fn list(&self) -> Result<&ListRef, AccessError> {
        self.0.target.as_list().ok_or(AccessError::WrongShape {
            expected: "list",
            actual: self.0.target.kind_name(),
        })
    }

    fn wrap_read(&self, value: Value) -> VarValue {
        let tracker = &self.0.tracker;
        tracker.factory.wrap(value, tracker)
    }

    /// Unwrap a value about to be written into this graph.
    ///
    /// A proxy from another variable means two slots now share a sub-graph
    /// that only one of them will see writes for; both fall back to always
    /// re-encoding.
    fn absorb(&self, value: VarValue) -> Value {
        match value {
            VarValue::Tracked(other) => {
                if !Rc::ptr_eq(&other.0.tracker, &self.0.tracker) {
                    other.0.tracker.mark_degraded();
                    self.0.tracker.mark_degraded();
                }
                other.0.target.clone()
            }
            VarValue::Plain(value) | VarValue::Frozen(value) => value,
        }
    }
}

impl RealValue for Proxy {
    fn real_value(&self) -> Value {
        self.0.target.clone()
    }
}

impl fmt::Debug for Proxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Proxied[{}]({:?})", self.0.tracker.slot, self.0.target)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Accessor {
    Read(String),
    Write(String),
}

impl Accessor {
    fn parse(method: &str) -> Option<Self> {
        for (prefix, write) in [("get_", false), ("is_", false), ("set_", true)] {
            if let Some(rest) = method.strip_prefix(prefix)
                && !rest.is_empty()
            {
                return Some(Self::new(rest, write));
            }
        }
        for (prefix, write) in [("get", false), ("is", false), ("set", true)] {
            if let Some(rest) = method.strip_prefix(prefix)
                && rest.starts_with(|c: char| c.is_ascii_uppercase())
            {
                return Some(Self::new(rest, write));
            }
        }
        None
    }

    fn new(property: &str, write: bool) -> Self {
        if write {
            Self::Write(property.to_string())
        } else {
            Self::Read(property.to_string())
        }
    }

    fn property(&self) -> &str {
        match self {
            Self::Read(p) | Self::Write(p) => p,
        }
    }

    fn is_write(&self) -> bool {
        matches!(self, Self::Write(_))
    }

    /// Field names the property may be stored under, most likely first.
    fn candidates(&self) -> Vec<String> {
        let raw = self.property();
        let mut out: Vec<String> = Vec::with_capacity(3);
        let mut chars = raw.chars();
        if let Some(first) = chars.next() {
            out.push(first.to_lowercase().chain(chars).collect());
        }
        out.push(raw.to_string());
        out.push(to_snake_case(raw));
        out.dedup();
        out
    }
}

fn to_snake_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    for (i, c) in name.chars().enumerate() {
        if c.is_ascii_uppercase() {
            if i > 0 {
                out.push('_');
            }
            out.push(c.to_ascii_lowercase());
        } else {
            out.push(c);
        }
    }
    out
}

/// A variable value as handed to callers: a tracking proxy, a plain value
/// (leaves, and composites that could not be intercepted), or an object of an
/// immutable type.
#[derive(Clone)]
pub enum VarValue {
    Tracked(Proxy),
    Plain(Value),
    /// Reads work as on a plain value; writes fail with
    /// [`AccessError::Immutable`].
    Frozen(Value),
}

impl VarValue {
    #[must_use]
    pub fn is_tracked(&self) -> bool {
        matches!(self, VarValue::Tracked(_))
    }

    #[must_use]
    pub fn is_frozen(&self) -> bool {
        matches!(self, VarValue::Frozen(_))
    }

    #[must_use]
    pub fn as_proxy(&self) -> Option<&Proxy> {
        match self {
            VarValue::Tracked(proxy) => Some(proxy),
            VarValue::Plain(_) | VarValue::Frozen(_) => None,
        }
    }

    /// The value itself for plain and frozen values.
    #[must_use]
    pub fn as_plain(&self) -> Option<&Value> {
        match self {
            VarValue::Plain(value) | VarValue::Frozen(value) => Some(value),
            VarValue::Tracked(_) => None,
        }
    }

    /// The real value. Unwrapping a proxy degrades its slot (see
    /// [`Proxy::unwrap`]); unwrapping a plain value is a clone.
    #[must_use]
    pub fn unwrap(&self) -> Value {
        match self {
            VarValue::Tracked(proxy) => proxy.unwrap(),
            VarValue::Plain(value) | VarValue::Frozen(value) => value.clone(),
        }
    }

    /// Same proxy, or same shared list/object/handle for plain values.
    #[must_use]
    pub fn ptr_eq(&self, other: &VarValue) -> bool {
        match (self, other) {
            (VarValue::Tracked(a), VarValue::Tracked(b)) => a.ptr_eq(b),
            (VarValue::Plain(a), VarValue::Plain(b))
            | (VarValue::Frozen(a), VarValue::Frozen(b)) => a.same_identity(b),
            _ => false,
        }
    }

    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        self.as_plain().and_then(Value::as_text)
    }

    #[must_use]
    pub fn as_int(&self) -> Option<i64> {
        self.as_plain().and_then(Value::as_int)
    }

    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        self.as_plain().and_then(Value::as_bool)
    }

    #[must_use]
    pub fn as_float(&self) -> Option<f64> {
        self.as_plain().and_then(Value::as_float)
    }

    /// Read a field through the proxy, or directly from an unintercepted object.
    ///
    /// Fields of a frozen object are frozen too.
    pub fn get(&self, field: &str) -> Result<VarValue, AccessError> {
        let (obj, frozen) = match self {
            VarValue::Tracked(proxy) => return proxy.get(field),
            VarValue::Plain(Value::Object(obj)) => (obj, false),
            VarValue::Frozen(Value::Object(obj)) => (obj, true),
            VarValue::Plain(other) | VarValue::Frozen(other) => {
                return Err(AccessError::WrongShape {
                    expected: "object",
                    actual: other.kind_name(),
                });
            }
        };
        let value = obj.get(field).ok_or_else(|| AccessError::NoSuchField {
            type_name: obj.type_name(),
            field: field.to_string(),
        })?;
        Ok(if frozen {
            VarValue::Frozen(value)
        } else {
            VarValue::Plain(value)
        })
    }

    /// Read a list item through the proxy, or directly from an unintercepted list.
    pub fn at(&self, index: usize) -> Result<VarValue, AccessError> {
        let (list, frozen) = match self {
            VarValue::Tracked(proxy) => return proxy.at(index),
            VarValue::Plain(Value::List(list)) => (list, false),
            VarValue::Frozen(Value::List(list)) => (list, true),
            VarValue::Plain(other) | VarValue::Frozen(other) => {
                return Err(AccessError::WrongShape {
                    expected: "list",
                    actual: other.kind_name(),
                });
            }
        };
        let value = list.get(index).ok_or(IndexOutOfBounds {
            index,
            len: list.len(),
        })?;
        Ok(if frozen {
            VarValue::Frozen(value)
        } else {
            VarValue::Plain(value)
        })
    }

    /// Write a field through the proxy, or directly on an unintercepted object.
    ///
    /// Frozen values reject every write.
    pub fn set(&self, field: &str, value: impl Into<VarValue>) -> Result<(), AccessError> {
        match self {
            VarValue::Tracked(proxy) => proxy.set(field, value),
            VarValue::Plain(Value::Object(obj)) => {
                obj.set(field, value.into().real_value());
                Ok(())
            }
            VarValue::Frozen(frozen) => Err(frozen_write(frozen)),
            VarValue::Plain(other) => Err(AccessError::WrongShape {
                expected: "object",
                actual: other.kind_name(),
            }),
        }
    }
}

fn frozen_write(frozen: &Value) -> AccessError {
    match frozen.as_object() {
        Some(obj) => AccessError::Immutable {
            type_name: obj.type_name(),
        },
        None => AccessError::WrongShape {
            expected: "object",
            actual: frozen.kind_name(),
        },
    }
}

impl RealValue for VarValue {
    fn real_value(&self) -> Value {
        match self {
            VarValue::Tracked(proxy) => proxy.real_value(),
            VarValue::Plain(value) | VarValue::Frozen(value) => value.clone(),
        }
    }
}

/// Structural comparison of the real values.
impl PartialEq for VarValue {
    fn eq(&self, other: &Self) -> bool {
        self.real_value() == other.real_value()
    }
}

impl PartialEq<Value> for VarValue {
    fn eq(&self, other: &Value) -> bool {
        self.real_value() == *other
    }
}

impl fmt::Debug for VarValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VarValue::Tracked(proxy) => fmt::Debug::fmt(proxy, f),
            VarValue::Plain(value) => fmt::Debug::fmt(value, f),
            VarValue::Frozen(value) => write!(f, "Frozen({value:?})"),
        }
    }
}

impl From<Value> for VarValue {
    fn from(value: Value) -> Self {
        VarValue::Plain(value)
    }
}

impl From<Proxy> for VarValue {
    fn from(value: Proxy) -> Self {
        VarValue::Tracked(value)
    }
}

impl From<&str> for VarValue {
    fn from(value: &str) -> Self {
        VarValue::Plain(Value::from(value))
    }
}

impl From<String> for VarValue {
    fn from(value: String) -> Self {
        VarValue::Plain(Value::from(value))
    }
}

impl From<i64> for VarValue {
    fn from(value: i64) -> Self {
        VarValue::Plain(Value::Int(value))
    }
}

impl From<bool> for VarValue {
    fn from(value: bool) -> Self {
        VarValue::Plain(Value::Bool(value))
    }
}

impl From<f64> for VarValue {
    fn from(value: f64) -> Self {
        VarValue::Plain(Value::Float(value))
    }
}
