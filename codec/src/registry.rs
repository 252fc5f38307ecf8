//! Versioned type registry consulted by the decoder.
//!
//! Stored blobs name their types. Instead of loading whatever the name points
//! to at runtime, every type the process can materialize is registered up
//! front, so a decode either resolves deterministically or fails with
//! [`ResolveError`].
//!
//! Resolution order for a stored `(name, version, ancestors)` header:
//! 1. a registered type with exactly that name (stored version must not be
//!    newer than the registered one)
//! 2. a registered type that `supersedes` the stored name (renamed type, or a
//!    descendant that replaced it)
//! 3. the first registered type in the stored ancestor chain

use std::collections::{BTreeMap, HashMap};

use thiserror::Error;

use procvar_types::TypeName;

/// Builtin type for by-name references to non-serializable objects.
pub const NAMED_REF_TYPE: &str = "procvar.NamedRef";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Mutability {
    #[default]
    Mutable,
    /// Instances are never mutated in place; treated like leaf values.
    Immutable,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Extensibility {
    #[default]
    Open,
    /// Instances cannot be intercepted; handed out unwrapped.
    Sealed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeDescriptor {
    name: TypeName,
    version: u32,
    parent: Option<TypeName>,
    supersedes: Vec<TypeName>,
    fields: Option<Vec<String>>,
    mutability: Mutability,
    extensibility: Extensibility,
}

impl TypeDescriptor {
    #[must_use]
    pub fn new(name: TypeName) -> Self {
        Self {
            name,
            version: 1,
            parent: None,
            supersedes: Vec::new(),
            fields: None,
            mutability: Mutability::Mutable,
            extensibility: Extensibility::Open,
        }
    }

    pub fn version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    pub fn parent(mut self, parent: TypeName) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn supersedes(mut self, old_name: TypeName) -> Self {
        self.supersedes.push(old_name);
        self
    }

    /// Declare the field schema. Decoded objects keep exactly these fields.
    pub fn fields<S: Into<String>>(mut self, fields: impl IntoIterator<Item = S>) -> Self {
        self.fields = Some(fields.into_iter().map(Into::into).collect());
        self
    }

    pub fn mutability(mut self, mutability: Mutability) -> Self {
        self.mutability = mutability;
        self
    }

    pub fn extensibility(mut self, extensibility: Extensibility) -> Self {
        self.extensibility = extensibility;
        self
    }

    #[must_use]
    pub fn name(&self) -> &TypeName {
        &self.name
    }

    #[must_use]
    pub fn type_version(&self) -> u32 {
        self.version
    }

    #[must_use]
    pub fn parent_name(&self) -> Option<&TypeName> {
        self.parent.as_ref()
    }

    #[must_use]
    pub fn superseded_names(&self) -> &[TypeName] {
        &self.supersedes
    }

    #[must_use]
    pub fn schema(&self) -> Option<&[String]> {
        self.fields.as_deref()
    }

    #[must_use]
    pub fn is_immutable(&self) -> bool {
        self.mutability == Mutability::Immutable
    }

    #[must_use]
    pub fn is_sealed(&self) -> bool {
        self.extensibility == Extensibility::Sealed
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("type {0} is already registered")]
    Duplicate(TypeName),
    #[error("type {type_name} names unregistered parent {parent}")]
    UnknownParent { type_name: TypeName, parent: TypeName },
    #[error("type {type_name} cannot supersede {superseded}: already claimed by {claimed_by}")]
    ConflictingSupersedes {
        type_name: TypeName,
        superseded: TypeName,
        claimed_by: TypeName,
    },
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ResolveError {
    #[error("unknown type {type_name}")]
    UnknownType { type_name: TypeName },
    #[error("type {type_name} was stored at version {stored}, newer than supported version {supported}")]
    IncompatibleVersion {
        type_name: TypeName,
        stored: u32,
        supported: u32,
    },
}

/// How a stored type header was matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolvedVia {
    Exact,
    Superseded,
    Ancestor,
}

#[derive(Debug, Clone, Copy)]
pub struct Resolved<'a> {
    pub descriptor: &'a TypeDescriptor,
    pub via: ResolvedVia,
}

#[derive(Debug, Clone)]
pub struct TypeRegistry {
    types: BTreeMap<TypeName, TypeDescriptor>,
    superseded: HashMap<TypeName, TypeName>,
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TypeRegistry {
    /// Registry holding only the builtin types.
    #[must_use]
    pub fn new() -> Self {
        let named_ref = TypeDescriptor::new(TypeName::from_static(NAMED_REF_TYPE))
            .fields(["key"])
            .mutability(Mutability::Immutable)
            .extensibility(Extensibility::Sealed);
        let mut types = BTreeMap::new();
        types.insert(named_ref.name.clone(), named_ref);
        Self {
            types,
            superseded: HashMap::new(),
        }
    }

    /// Register a type. Parents must be registered first.
    pub fn register(&mut self, descriptor: TypeDescriptor) -> Result<(), RegistryError> {
        if self.types.contains_key(&descriptor.name)
            || self.superseded.contains_key(&descriptor.name)
        {
            return Err(RegistryError::Duplicate(descriptor.name));
        }
        if let Some(parent) = &descriptor.parent
            && !self.types.contains_key(parent)
        {
            return Err(RegistryError::UnknownParent {
                type_name: descriptor.name.clone(),
                parent: parent.clone(),
            });
        }
        for old in &descriptor.supersedes {
            let claimed_by = self
                .superseded
                .get(old)
                .or_else(|| self.types.get(old).map(TypeDescriptor::name));
            if let Some(claimed_by) = claimed_by {
                return Err(RegistryError::ConflictingSupersedes {
                    type_name: descriptor.name.clone(),
                    superseded: old.clone(),
                    claimed_by: claimed_by.clone(),
                });
            }
        }
        for old in &descriptor.supersedes {
            self.superseded.insert(old.clone(), descriptor.name.clone());
        }
        self.types.insert(descriptor.name.clone(), descriptor);
        Ok(())
    }

    #[must_use]
    pub fn get(&self, name: &TypeName) -> Option<&TypeDescriptor> {
        self.types.get(name)
    }

    #[must_use]
    pub fn contains(&self, name: &TypeName) -> bool {
        self.types.contains_key(name)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.types.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TypeDescriptor> {
        self.types.values()
    }

    /// Parent chain of a registered type, nearest first.
    #[must_use]
    pub fn ancestors(&self, name: &TypeName) -> Vec<TypeName> {
        let mut chain = Vec::new();
        let mut current = self.types.get(name).and_then(|d| d.parent.as_ref());
        // Parents are registered before children, so the chain cannot loop.
        while let Some(parent) = current {
            chain.push(parent.clone());
            current = self.types.get(parent).and_then(|d| d.parent.as_ref());
        }
        chain
    }

    pub fn resolve(
        &self,
        stored: &TypeName,
        stored_version: u32,
        stored_ancestors: &[TypeName],
    ) -> Result<Resolved<'_>, ResolveError> {
        if let Some(descriptor) = self.types.get(stored) {
            if stored_version > descriptor.version {
                return Err(ResolveError::IncompatibleVersion {
                    type_name: stored.clone(),
                    stored: stored_version,
                    supported: descriptor.version,
                });
            }
            return Ok(Resolved {
                descriptor,
                via: ResolvedVia::Exact,
            });
        }
        if let Some(descriptor) = self
            .superseded
            .get(stored)
            .and_then(|current| self.types.get(current))
        {
            return Ok(Resolved {
                descriptor,
                via: ResolvedVia::Superseded,
            });
        }
        stored_ancestors
            .iter()
            .find_map(|ancestor| self.types.get(ancestor))
            .map(|descriptor| Resolved {
                descriptor,
                via: ResolvedVia::Ancestor,
            })
            .ok_or_else(|| ResolveError::UnknownType {
                type_name: stored.clone(),
            })
    }
}
