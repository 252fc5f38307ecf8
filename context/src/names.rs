//! Process-wide directory of objects that cannot be serialized.
//!
//! A variable that has to point at a connection pool or similar singleton
//! stores a `procvar.NamedRef` object naming it instead. [`NamedObjects::resolve`]
//! turns that reference back into the bound object.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use thiserror::Error;
use tracing::debug;

use procvar_codec::NAMED_REF_TYPE;
use procvar_types::{TypeName, Value};

const KEY_FIELD: &str = "key";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NameError {
    #[error("name {0:?} is already bound")]
    AlreadyBound(String),
    #[error("name {0:?} is not bound")]
    NotBound(String),
    #[error("object bound to {0:?} has a different type")]
    WrongType(String),
    #[error("value is not a named reference")]
    NotAReference,
}

type Bound = Arc<dyn Any + Send + Sync>;

/// Shared keyed store; clones share the same bindings.
#[derive(Clone, Default)]
pub struct NamedObjects {
    bindings: Arc<RwLock<HashMap<String, Bound>>>,
}

impl NamedObjects {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `object` under `key`. Fails if the key is taken.
    pub fn bind<T: Any + Send + Sync>(
        &self,
        key: impl Into<String>,
        object: T,
    ) -> Result<(), NameError> {
        let key = key.into();
        let mut bindings = self.bindings.write().unwrap_or_else(PoisonError::into_inner);
        if bindings.contains_key(&key) {
            return Err(NameError::AlreadyBound(key));
        }
        debug!(key = %key, "Bound named object");
        bindings.insert(key, Arc::new(object));
        Ok(())
    }

    /// Bind `object` under `key`, replacing any previous binding.
    pub fn rebind<T: Any + Send + Sync>(&self, key: impl Into<String>, object: T) {
        let key = key.into();
        let mut bindings = self.bindings.write().unwrap_or_else(PoisonError::into_inner);
        if bindings.insert(key.clone(), Arc::new(object)).is_some() {
            debug!(key = %key, "Rebound named object");
        }
    }

    pub fn unbind(&self, key: &str) -> Result<(), NameError> {
        let mut bindings = self.bindings.write().unwrap_or_else(PoisonError::into_inner);
        bindings
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| NameError::NotBound(key.to_string()))
    }

    /// The object bound under `key`, if it exists and is a `T`.
    #[must_use]
    pub fn lookup<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        self.get(key).and_then(|bound| bound.downcast::<T>().ok())
    }

    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.bindings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(key)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.bindings.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// A serializable value that names `key`. Whether `key` is bound is only
    /// checked on [`NamedObjects::resolve`].
    #[must_use]
    pub fn reference(key: &str) -> Value {
        Value::object(
            TypeName::from_static(NAMED_REF_TYPE),
            [(KEY_FIELD, Value::from(key))],
        )
    }

    /// The key a `procvar.NamedRef` value points at.
    #[must_use]
    pub fn referenced_key(value: &Value) -> Option<String> {
        let obj = value.as_object()?;
        if obj.type_name().as_str() != NAMED_REF_TYPE {
            return None;
        }
        obj.get(KEY_FIELD)?.as_text().map(str::to_string)
    }

    /// Follow a named reference to its bound object.
    pub fn resolve<T: Any + Send + Sync>(&self, value: &Value) -> Result<Arc<T>, NameError> {
        let key = Self::referenced_key(value).ok_or(NameError::NotAReference)?;
        let bound = self.get(&key).ok_or_else(|| NameError::NotBound(key.clone()))?;
        bound.downcast::<T>().map_err(|_| NameError::WrongType(key))
    }

    fn get(&self, key: &str) -> Option<Bound> {
        self.bindings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }
}

impl fmt::Debug for NamedObjects {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bindings = self.bindings.read().unwrap_or_else(PoisonError::into_inner);
        let mut keys: Vec<&String> = bindings.keys().collect();
        keys.sort();
        f.debug_struct("NamedObjects").field("keys", &keys).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Pool {
        size: usize,
    }

    #[test]
    fn bind_fails_when_taken_and_rebind_replaces() {
        let names = NamedObjects::new();
        names.bind("pool", Pool { size: 4 }).expect("bind");
        assert_eq!(
            names.bind("pool", Pool { size: 8 }),
            Err(NameError::AlreadyBound("pool".to_string()))
        );
        names.rebind("pool", Pool { size: 8 });
        assert_eq!(names.lookup::<Pool>("pool").map(|p| p.size), Some(8));
        assert_eq!(names.len(), 1);
    }

    #[test]
    fn unbind_fails_when_absent() {
        let names = NamedObjects::new();
        assert_eq!(names.unbind("pool"), Err(NameError::NotBound("pool".to_string())));
        names.bind("pool", Pool { size: 1 }).expect("bind");
        names.unbind("pool").expect("unbind");
        assert!(!names.contains("pool"));
    }

    #[test]
    fn lookup_with_wrong_type_is_none() {
        let names = NamedObjects::new();
        names.bind("pool", Pool { size: 1 }).expect("bind");
        assert!(names.lookup::<String>("pool").is_none());
    }

    #[test]
    fn clones_share_bindings() {
        let names = NamedObjects::new();
        let other = names.clone();
        names.bind("pool", Pool { size: 2 }).expect("bind");
        assert!(other.contains("pool"));
    }

    #[test]
    fn reference_resolves_to_bound_object() {
        let names = NamedObjects::new();
        names.bind("pool", Pool { size: 3 }).expect("bind");

        let reference = NamedObjects::reference("pool");
        assert_eq!(NamedObjects::referenced_key(&reference).as_deref(), Some("pool"));
        let pool = names.resolve::<Pool>(&reference).expect("resolve");
        assert_eq!(*pool, Pool { size: 3 });

        assert_eq!(
            names.resolve::<String>(&reference),
            Err(NameError::WrongType("pool".to_string()))
        );
        assert_eq!(
            names.resolve::<Pool>(&NamedObjects::reference("missing")),
            Err(NameError::NotBound("missing".to_string()))
        );
        assert_eq!(
            names.resolve::<Pool>(&Value::Int(1)),
            Err(NameError::NotAReference)
        );
    }
}
