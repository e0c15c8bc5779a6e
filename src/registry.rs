//! Method identity registry
//!
//! Resolves a `(qualifier, name)` observation from the instrumentation source
//! to a stable [`MethodId`]. A redefinition signal allocates a new generation
//! for the same qualified name, rendered with a numeric suffix (`Foo#bar-1`),
//! so timings recorded before the redefinition stay on their own record.
//!
//! The registry is shared by all threads. Lookups of known identities take a
//! read lock and do not allocate.

use crossbeam::sync::ShardedLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::PoisonError;

/// Defining scope of a method
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "name", rename_all = "snake_case")]
pub enum Qualifier {
    /// Instance method of a class: `C#m`
    Class(String),
    /// Method defined in a module: `M#m`
    Module(String),
    /// Singleton (class-level) method of a class: `<Class::C>#m`
    ClassSingleton(String),
    /// Singleton method of a module: `<Module::M>#m`
    ModuleSingleton(String),
    /// Singleton method of a plain object of class C: `<Object::C>#m`
    ObjectSingleton(String),
    /// No defining scope: `#m`
    None,
}

impl fmt::Display for Qualifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Qualifier::Class(name) | Qualifier::Module(name) => f.write_str(name),
            Qualifier::ClassSingleton(name) => write!(f, "<Class::{}>", name),
            Qualifier::ModuleSingleton(name) => write!(f, "<Module::{}>", name),
            Qualifier::ObjectSingleton(name) => write!(f, "<Object::{}>", name),
            Qualifier::None => Ok(()),
        }
    }
}

/// Index of a method identity in its registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MethodId(pub u32);

impl MethodId {
    /// Synthetic root of every thread's call stack
    pub const TOPLEVEL: MethodId = MethodId(0);
    /// Frames whose scope and name could not be resolved
    pub const NO_METHOD: MethodId = MethodId(1);

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Where a method was first observed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceLocation {
    pub file: String,
    pub line: u32,
}

impl SourceLocation {
    pub fn new(file: impl Into<String>, line: u32) -> Self {
        Self {
            file: file.into(),
            line,
        }
    }
}

/// One distinct, nameable unit of code
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MethodIdentity {
    pub qualifier: Qualifier,
    pub name: String,
    pub generation: u32,
}

impl MethodIdentity {
    /// Rendered name, `Qualifier#name` plus `-N` for redefined generations
    pub fn full_name(&self) -> String {
        if self.generation == 0 {
            format!("{}#{}", self.qualifier, self.name)
        } else {
            format!("{}#{}-{}", self.qualifier, self.name, self.generation)
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct RegistryEntry {
    pub(crate) identity: MethodIdentity,
    pub(crate) location: Option<SourceLocation>,
}

impl RegistryEntry {
    pub(crate) fn reserved(name: &str) -> Self {
        Self {
            identity: MethodIdentity {
                qualifier: Qualifier::None,
                name: name.to_string(),
                generation: 0,
            },
            location: None,
        }
    }
}

#[derive(Debug)]
struct Inner {
    current: HashMap<Qualifier, HashMap<String, MethodId>>,
    entries: Vec<RegistryEntry>,
}

/// Registry of method identities shared by a profiler's threads
#[derive(Debug)]
pub struct MethodRegistry {
    inner: ShardedLock<Inner>,
}

impl Default for MethodRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MethodRegistry {
    pub fn new() -> Self {
        // Reserved entries stay out of `current`: a host method that happens
        // to be called "toplevel" must not merge into the synthetic root.
        Self {
            inner: ShardedLock::new(Inner {
                current: HashMap::new(),
                entries: vec![
                    RegistryEntry::reserved("toplevel"),
                    RegistryEntry::reserved("[No method]"),
                ],
            }),
        }
    }

    /// Resolve an observation to the current generation of its identity
    ///
    /// An empty name maps to [`MethodId::NO_METHOD`].
    pub fn resolve(&self, qualifier: &Qualifier, name: &str) -> MethodId {
        if name.is_empty() {
            return MethodId::NO_METHOD;
        }

        {
            let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(id) = inner.current.get(qualifier).and_then(|m| m.get(name)) {
                return *id;
            }
        }

        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(id) = inner.current.get(qualifier).and_then(|m| m.get(name)) {
            return *id;
        }
        Self::insert(&mut inner, qualifier, name, 0)
    }

    /// Register a new generation after the host redefined `qualifier#name`
    ///
    /// Records already aggregated under the previous generation keep their
    /// identity. A name never seen before simply gets generation 0.
    pub fn redefine(&self, qualifier: &Qualifier, name: &str) -> MethodId {
        if name.is_empty() {
            return MethodId::NO_METHOD;
        }

        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let generation = inner
            .current
            .get(qualifier)
            .and_then(|m| m.get(name))
            .map(|id| inner.entries[id.index()].identity.generation + 1)
            .unwrap_or(0);
        let id = Self::insert(&mut inner, qualifier, name, generation);
        tracing::trace!(
            method = %inner.entries[id.index()].identity.full_name(),
            "registered method redefinition"
        );
        id
    }

    fn insert(inner: &mut Inner, qualifier: &Qualifier, name: &str, generation: u32) -> MethodId {
        let id = MethodId(inner.entries.len() as u32);
        inner.entries.push(RegistryEntry {
            identity: MethodIdentity {
                qualifier: qualifier.clone(),
                name: name.to_string(),
                generation,
            },
            location: None,
        });
        inner
            .current
            .entry(qualifier.clone())
            .or_default()
            .insert(name.to_string(), id);
        id
    }

    /// Remember the first source location seen for `id`
    pub fn note_location(&self, id: MethodId, location: SourceLocation) {
        {
            let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
            match inner.entries.get(id.index()) {
                Some(entry) if entry.location.is_none() => {}
                _ => return,
            }
        }
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(entry) = inner.entries.get_mut(id.index()) {
            entry.location.get_or_insert(location);
        }
    }

    pub fn identity(&self, id: MethodId) -> Option<MethodIdentity> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner.entries.get(id.index()).map(|e| e.identity.clone())
    }

    pub fn full_name(&self, id: MethodId) -> Option<String> {
        self.identity(id).map(|identity| identity.full_name())
    }

    pub fn location(&self, id: MethodId) -> Option<SourceLocation> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner.entries.get(id.index()).and_then(|e| e.location.clone())
    }

    /// Number of identities, including the two reserved ones
    pub fn len(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .len()
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub(crate) fn snapshot(&self) -> Vec<RegistryEntry> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn class(name: &str) -> Qualifier {
        Qualifier::Class(name.to_string())
    }

    #[test]
    fn test_qualifier_rendering() {
        let render = |q: Qualifier| {
            MethodIdentity {
                qualifier: q,
                name: "hello".to_string(),
                generation: 0,
            }
            .full_name()
        };
        assert_eq!(render(class("C1")), "C1#hello");
        assert_eq!(render(Qualifier::Module("M1".into())), "M1#hello");
        assert_eq!(render(Qualifier::ClassSingleton("C1".into())), "<Class::C1>#hello");
        assert_eq!(render(Qualifier::ModuleSingleton("Bar".into())), "<Module::Bar>#hello");
        assert_eq!(render(Qualifier::ObjectSingleton("C3".into())), "<Object::C3>#hello");
        assert_eq!(render(Qualifier::None), "#hello");
    }

    #[test]
    fn test_reserved_identities() {
        let registry = MethodRegistry::new();
        assert_eq!(registry.full_name(MethodId::TOPLEVEL).unwrap(), "#toplevel");
        assert_eq!(registry.full_name(MethodId::NO_METHOD).unwrap(), "#[No method]");
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_resolve_is_stable() {
        let registry = MethodRegistry::new();
        let a = registry.resolve(&class("Foo"), "bar");
        let b = registry.resolve(&class("Foo"), "bar");
        let c = registry.resolve(&Qualifier::ClassSingleton("Foo".into()), "bar");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(registry.len(), 4);
    }

    #[test]
    fn test_toplevel_name_does_not_alias_root() {
        let registry = MethodRegistry::new();
        let id = registry.resolve(&Qualifier::None, "toplevel");
        assert_ne!(id, MethodId::TOPLEVEL);
    }

    #[test]
    fn test_empty_name_is_no_method() {
        let registry = MethodRegistry::new();
        assert_eq!(registry.resolve(&Qualifier::None, ""), MethodId::NO_METHOD);
        assert_eq!(registry.resolve(&class("Foo"), ""), MethodId::NO_METHOD);
    }

    #[test]
    fn test_redefinition_generations() {
        let registry = MethodRegistry::new();
        let q = class("DuplicateNames::Foo::Bar");
        let g0 = registry.resolve(&q, "foo");
        let g1 = registry.redefine(&q, "foo");
        assert_eq!(registry.resolve(&q, "foo"), g1);
        let g2 = registry.redefine(&q, "foo");

        assert_eq!(registry.full_name(g0).unwrap(), "DuplicateNames::Foo::Bar#foo");
        assert_eq!(registry.full_name(g1).unwrap(), "DuplicateNames::Foo::Bar#foo-1");
        assert_eq!(registry.full_name(g2).unwrap(), "DuplicateNames::Foo::Bar#foo-2");
        // Earlier generations keep their identity
        assert_eq!(registry.identity(g0).unwrap().generation, 0);
    }

    #[test]
    fn test_redefine_unseen_starts_at_zero() {
        let registry = MethodRegistry::new();
        let id = registry.redefine(&class("Fresh"), "m");
        assert_eq!(registry.identity(id).unwrap().generation, 0);
    }

    #[test]
    fn test_first_location_wins() {
        let registry = MethodRegistry::new();
        let id = registry.resolve(&class("Foo"), "method1");
        registry.note_location(id, SourceLocation::new("foo.rb", 9));
        registry.note_location(id, SourceLocation::new("foo.rb", 42));
        assert_eq!(registry.location(id).unwrap().line, 9);
        assert_eq!(registry.location(MethodId(99)), None);
    }

    #[test]
    fn test_qualifier_serde_shape() {
        let json = serde_json::to_string(&class("Foo")).unwrap();
        assert_eq!(json, r#"{"kind":"class","name":"Foo"}"#);
        let none: Qualifier = serde_json::from_str(r#"{"kind":"none"}"#).unwrap();
        assert_eq!(none, Qualifier::None);
    }
}
