//! In-memory object graph for process variables.
//!
//! Leaf variants are plain owned data. Lists and objects are shared handles
//! (`Rc<RefCell<..>>`): cloning a [`Value::Object`] clones the handle, not the
//! object, so every holder observes in-place mutation. This is what makes
//! dirty-checking necessary in the first place.
//!
//! Handles are `Rc`-based on purpose: a graph belongs to one unit of work and
//! the type system keeps it on one thread (`Value` is neither `Send` nor `Sync`).

use std::any::Any;
use std::cell::RefCell;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::rc::Rc;

use thiserror::Error;

use crate::TypeName;

#[derive(Clone)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    List(ListRef),
    Object(ObjectRef),
    /// In-process resource that has no portable representation.
    Native(NativeHandle),
}

impl Value {
    #[must_use]
    pub fn object<K: Into<String>>(
        type_name: TypeName,
        fields: impl IntoIterator<Item = (K, Value)>,
    ) -> Self {
        Value::Object(ObjectRef::with_fields(
            type_name,
            fields.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        ))
    }

    #[must_use]
    pub fn list(items: impl IntoIterator<Item = Value>) -> Self {
        Value::List(ListRef::new(items.into_iter().collect()))
    }

    /// Leaf values are immutable in place and never need interception.
    #[must_use]
    pub fn is_leaf(&self) -> bool {
        matches!(
            self,
            Value::Null
                | Value::Bool(_)
                | Value::Int(_)
                | Value::Float(_)
                | Value::Text(_)
                | Value::Bytes(_)
        )
    }

    #[must_use]
    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Text(_) => "text",
            Value::Bytes(_) => "bytes",
            Value::List(_) => "list",
            Value::Object(_) => "object",
            Value::Native(_) => "native",
        }
    }

    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(x) => Some(*x),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_object(&self) -> Option<&ObjectRef> {
        match self {
            Value::Object(obj) => Some(obj),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_list(&self) -> Option<&ListRef> {
        match self {
            Value::List(list) => Some(list),
            _ => None,
        }
    }

    /// Address of the shared allocation for lists and objects.
    #[must_use]
    pub fn identity(&self) -> Option<usize> {
        match self {
            Value::List(list) => Some(list.addr()),
            Value::Object(obj) => Some(obj.addr()),
            Value::Native(handle) => Some(handle.addr()),
            _ => None,
        }
    }

    /// True when both values are the same shared list, object, or handle.
    #[must_use]
    pub fn same_identity(&self, other: &Value) -> bool {
        match (self.identity(), other.identity()) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }
}

/// Structural equality. Terminates on cyclic graphs: a pair of composites
/// already under comparison is assumed equal.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        graph_eq(self, other, &mut HashSet::new())
    }
}

fn graph_eq(a: &Value, b: &Value, seen: &mut HashSet<(usize, usize)>) -> bool {
    match (a, b) {
        (Value::Null, Value::Null) => true,
        (Value::Bool(x), Value::Bool(y)) => x == y,
        (Value::Int(x), Value::Int(y)) => x == y,
        (Value::Float(x), Value::Float(y)) => x == y || (x.is_nan() && y.is_nan()),
        (Value::Text(x), Value::Text(y)) => x == y,
        (Value::Bytes(x), Value::Bytes(y)) => x == y,
        (Value::List(x), Value::List(y)) => {
            if x.ptr_eq(y) || !seen.insert((x.addr(), y.addr())) {
                return true;
            }
            let (xs, ys) = (x.to_vec(), y.to_vec());
            xs.len() == ys.len() && xs.iter().zip(&ys).all(|(l, r)| graph_eq(l, r, seen))
        }
        (Value::Object(x), Value::Object(y)) => {
            if x.ptr_eq(y) || !seen.insert((x.addr(), y.addr())) {
                return true;
            }
            if x.type_name() != y.type_name() {
                return false;
            }
            let (xs, ys) = (x.fields(), y.fields());
            xs.len() == ys.len()
                && xs
                    .iter()
                    .zip(&ys)
                    .all(|((lk, lv), (rk, rv))| lk == rk && graph_eq(lv, rv, seen))
        }
        (Value::Native(x), Value::Native(y)) => x.ptr_eq(y),
        _ => false,
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        debug_value(self, f, &mut Vec::new())
    }
}

fn debug_value(value: &Value, f: &mut fmt::Formatter<'_>, path: &mut Vec<usize>) -> fmt::Result {
    match value {
        Value::Null => f.write_str("null"),
        Value::Bool(b) => write!(f, "{b}"),
        Value::Int(i) => write!(f, "{i}"),
        Value::Float(x) => write!(f, "{x:?}"),
        Value::Text(s) => write!(f, "{s:?}"),
        Value::Bytes(bytes) => write!(f, "bytes[{}]", bytes.len()),
        Value::Native(handle) => write!(f, "<native {}>", handle.label()),
        Value::List(list) => {
            if path.contains(&list.addr()) {
                return f.write_str("[..]");
            }
            path.push(list.addr());
            f.write_str("[")?;
            for (i, item) in list.to_vec().iter().enumerate() {
                if i > 0 {
                    f.write_str(", ")?;
                }
                debug_value(item, f, path)?;
            }
            path.pop();
            f.write_str("]")
        }
        Value::Object(obj) => {
            let type_name = obj.type_name();
            if path.contains(&obj.addr()) {
                return write!(f, "{type_name} {{..}}");
            }
            path.push(obj.addr());
            write!(f, "{type_name} {{")?;
            for (i, (name, field)) in obj.fields().iter().enumerate() {
                f.write_str(if i > 0 { ", " } else { " " })?;
                write!(f, "{name}: ")?;
                debug_value(field, f, path)?;
            }
            path.pop();
            f.write_str(" }")
        }
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Int(i64::from(value))
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Text(value)
    }
}

impl From<Vec<u8>> for Value {
    fn from(value: Vec<u8>) -> Self {
        Value::Bytes(value)
    }
}

impl From<ObjectRef> for Value {
    fn from(value: ObjectRef) -> Self {
        Value::Object(value)
    }
}

impl From<ListRef> for Value {
    fn from(value: ListRef) -> Self {
        Value::List(value)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("index {index} out of bounds for list of length {len}")]
pub struct IndexOutOfBounds {
    pub index: usize,
    pub len: usize,
}

struct Object {
    type_name: TypeName,
    fields: BTreeMap<String, Value>,
}

/// Shared handle to a typed object with named fields.
///
/// Fields are kept in name order, so two objects with equal contents always
/// encode to identical bytes.
#[derive(Clone)]
pub struct ObjectRef(Rc<RefCell<Object>>);

impl ObjectRef {
    #[must_use]
    pub fn new(type_name: TypeName) -> Self {
        Self::with_fields(type_name, BTreeMap::new())
    }

    #[must_use]
    pub fn with_fields(type_name: TypeName, fields: BTreeMap<String, Value>) -> Self {
        Self(Rc::new(RefCell::new(Object { type_name, fields })))
    }

    #[must_use]
    pub fn type_name(&self) -> TypeName {
        self.0.borrow().type_name.clone()
    }

    #[must_use]
    pub fn get(&self, field: &str) -> Option<Value> {
        self.0.borrow().fields.get(field).cloned()
    }

    #[must_use]
    pub fn has_field(&self, field: &str) -> bool {
        self.0.borrow().fields.contains_key(field)
    }

    /// Set a field, returning the previous value.
    pub fn set(&self, field: impl Into<String>, value: Value) -> Option<Value> {
        self.0.borrow_mut().fields.insert(field.into(), value)
    }

    pub fn remove(&self, field: &str) -> Option<Value> {
        self.0.borrow_mut().fields.remove(field)
    }

    #[must_use]
    pub fn field_names(&self) -> Vec<String> {
        self.0.borrow().fields.keys().cloned().collect()
    }

    /// Snapshot of the fields in name order.
    #[must_use]
    pub fn fields(&self) -> Vec<(String, Value)> {
        self.0
            .borrow()
            .fields
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.borrow().fields.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.borrow().fields.is_empty()
    }

    #[must_use]
    pub fn ptr_eq(&self, other: &ObjectRef) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    #[must_use]
    pub fn addr(&self) -> usize {
        Rc::as_ptr(&self.0).cast::<()>() as usize
    }
}

impl fmt::Debug for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&Value::Object(self.clone()), f)
    }
}

/// Shared handle to an ordered list of values.
#[derive(Clone)]
pub struct ListRef(Rc<RefCell<Vec<Value>>>);

impl ListRef {
    #[must_use]
    pub fn new(items: Vec<Value>) -> Self {
        Self(Rc::new(RefCell::new(items)))
    }

    #[must_use]
    pub fn get(&self, index: usize) -> Option<Value> {
        self.0.borrow().get(index).cloned()
    }

    /// Replace the item at `index`, returning the previous one.
    pub fn set(&self, index: usize, value: Value) -> Result<Value, IndexOutOfBounds> {
        let mut items = self.0.borrow_mut();
        let len = items.len();
        match items.get_mut(index) {
            Some(slot) => Ok(std::mem::replace(slot, value)),
            None => Err(IndexOutOfBounds { index, len }),
        }
    }

    pub fn push(&self, value: Value) {
        self.0.borrow_mut().push(value);
    }

    pub fn insert(&self, index: usize, value: Value) -> Result<(), IndexOutOfBounds> {
        let mut items = self.0.borrow_mut();
        if index > items.len() {
            return Err(IndexOutOfBounds {
                index,
                len: items.len(),
            });
        }
        items.insert(index, value);
        Ok(())
    }

    pub fn remove(&self, index: usize) -> Result<Value, IndexOutOfBounds> {
        let mut items = self.0.borrow_mut();
        if index >= items.len() {
            return Err(IndexOutOfBounds {
                index,
                len: items.len(),
            });
        }
        Ok(items.remove(index))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.borrow().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.borrow().is_empty()
    }

    /// Snapshot of the items; the handles inside still alias the live graph.
    #[must_use]
    pub fn to_vec(&self) -> Vec<Value> {
        self.0.borrow().clone()
    }

    #[must_use]
    pub fn ptr_eq(&self, other: &ListRef) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    #[must_use]
    pub fn addr(&self) -> usize {
        Rc::as_ptr(&self.0).cast::<()>() as usize
    }
}

impl fmt::Debug for ListRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&Value::List(self.clone()), f)
    }
}

/// Opaque in-process resource (a connection, a callback, a cache handle).
///
/// Carried through the graph like any other value but rejected by the codec.
#[derive(Clone)]
pub struct NativeHandle {
    label: Rc<str>,
    inner: Rc<dyn Any>,
}

impl NativeHandle {
    pub fn new<T: Any>(label: impl Into<String>, value: T) -> Self {
        Self {
            label: Rc::from(label.into()),
            inner: Rc::new(value),
        }
    }

    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    #[must_use]
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.inner.downcast_ref::<T>()
    }

    #[must_use]
    pub fn ptr_eq(&self, other: &NativeHandle) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    #[must_use]
    pub fn addr(&self) -> usize {
        Rc::as_ptr(&self.inner).cast::<()>() as usize
    }
}

impl fmt::Debug for NativeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeHandle")
            .field("label", &self.label)
            .finish_non_exhaustive()
    }
}
