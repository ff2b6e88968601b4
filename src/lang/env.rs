//! Global environment seen by the compiler and the unpacker.
//!
//! The compiler only needs name resolution plus interning of definition sites,
//! so it talks to the environment through [`GlobalEnv`]. [`Environment`] is the
//! stock implementation: namespaces of Vars plus a flat table of host types.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use super::symbol::Symbol;

/// A global, namespace-qualified binding.
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct Var {
    pub ns: Arc<str>,
    pub name: Arc<str>,
}

impl std::fmt::Display for Var {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#'{}/{}", self.ns, self.name)
    }
}

pub type VarRef = Arc<Var>;

/// A host type that `catch` clauses can name.
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct TypeDesc {
    pub name: Arc<str>,
}

pub type TypeRef = Arc<TypeDesc>;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EnvError {
    #[error("no namespace named '{0}'")]
    NoSuchNamespace(String),
    #[error("cannot define '{sym}' from namespace '{current}'")]
    ForeignDefinition { sym: String, current: String },
}

/// Read-mostly view of the global environment.
///
/// Implementations must tolerate concurrent readers; only `intern_var` writes.
pub trait GlobalEnv {
    fn current_ns(&self) -> Arc<str>;

    /// Resolve a symbol to an existing Var, honoring refers for unqualified names.
    fn resolve_var(&self, sym: &Symbol) -> Option<VarRef>;

    fn resolve_type(&self, sym: &Symbol) -> Option<TypeRef>;

    /// Find or create the Var a `def` of `sym` targets.
    fn intern_var(&self, sym: &Symbol) -> Result<VarRef, EnvError>;

    /// Exact lookup by fully-qualified name, no refers.
    fn find_var(&self, ns: &str, name: &str) -> Option<VarRef>;

    fn find_type(&self, name: &str) -> Option<TypeRef>;

    fn has_namespace(&self, ns: &str) -> bool;
}

#[derive(Debug)]
struct Namespace {
    vars: HashMap<Arc<str>, VarRef>,
    refers: Vec<Arc<str>>,
}

impl Namespace {
    fn new() -> Self {
        Namespace {
            vars: HashMap::new(),
            refers: Vec::new(),
        }
    }
}

#[derive(Debug)]
struct EnvInner {
    current: Arc<str>,
    namespaces: HashMap<Arc<str>, Namespace>,
    types: HashMap<Arc<str>, TypeRef>,
}

#[derive(Debug)]
pub struct Environment {
    inner: RwLock<EnvInner>,
}

impl Environment {
    /// Create an environment with a single namespace, which becomes current.
    pub fn new(current_ns: &str) -> Self {
        let current: Arc<str> = Arc::from(current_ns);
        let mut namespaces = HashMap::new();
        namespaces.insert(current.clone(), Namespace::new());
        Environment {
            inner: RwLock::new(EnvInner {
                current,
                namespaces,
                types: HashMap::new(),
            }),
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, EnvInner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, EnvInner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create a namespace if it does not exist yet.
    pub fn create_namespace(&self, name: &str) {
        self.write()
            .namespaces
            .entry(Arc::from(name))
            .or_insert_with(Namespace::new);
    }

    pub fn set_current_ns(&self, name: &str) -> Result<(), EnvError> {
        let mut inner = self.write();
        let key = inner
            .namespaces
            .get_key_value(name)
            .map(|(k, _)| k.clone())
            .ok_or_else(|| EnvError::NoSuchNamespace(name.to_string()))?;
        inner.current = key;
        Ok(())
    }

    /// Make unqualified names of `from` visible inside `ns`.
    pub fn refer(&self, ns: &str, from: &str) -> Result<(), EnvError> {
        let mut inner = self.write();
        if !inner.namespaces.contains_key(from) {
            return Err(EnvError::NoSuchNamespace(from.to_string()));
        }
        let target = inner
            .namespaces
            .get_mut(ns)
            .ok_or_else(|| EnvError::NoSuchNamespace(ns.to_string()))?;
        if !target.refers.iter().any(|r| &**r == from) {
            target.refers.push(Arc::from(from));
        }
        Ok(())
    }

    /// Define (or fetch) `ns/name`, creating the namespace on demand.
    pub fn define(&self, ns: &str, name: &str) -> VarRef {
        let mut inner = self.write();
        let ns_key: Arc<str> = inner
            .namespaces
            .get_key_value(ns)
            .map(|(k, _)| k.clone())
            .unwrap_or_else(|| Arc::from(ns));
        let namespace = inner
            .namespaces
            .entry(ns_key.clone())
            .or_insert_with(Namespace::new);
        namespace
            .vars
            .entry(Arc::from(name))
            .or_insert_with(|| {
                Arc::new(Var {
                    ns: ns_key,
                    name: Arc::from(name),
                })
            })
            .clone()
    }

    pub fn define_type(&self, name: &str) -> TypeRef {
        self.write()
            .types
            .entry(Arc::from(name))
            .or_insert_with(|| {
                Arc::new(TypeDesc {
                    name: Arc::from(name),
                })
            })
            .clone()
    }
}

impl GlobalEnv for Environment {
    fn current_ns(&self) -> Arc<str> {
        self.read().current.clone()
    }

    fn resolve_var(&self, sym: &Symbol) -> Option<VarRef> {
        let inner = self.read();
        if let Some(ns) = &sym.ns {
            return inner.namespaces.get(ns)?.vars.get(&sym.name).cloned();
        }

        let current = inner.namespaces.get(&inner.current)?;
        if let Some(var) = current.vars.get(&sym.name) {
            return Some(var.clone());
        }
        current.refers.iter().find_map(|referred| {
            inner
                .namespaces
                .get(referred)
                .and_then(|ns| ns.vars.get(&sym.name))
                .cloned()
        })
    }

    fn resolve_type(&self, sym: &Symbol) -> Option<TypeRef> {
        self.find_type(&sym.to_string())
    }

    fn intern_var(&self, sym: &Symbol) -> Result<VarRef, EnvError> {
        let current = self.current_ns();
        if let Some(ns) = &sym.ns {
            if **ns != *current {
                return Err(EnvError::ForeignDefinition {
                    sym: sym.to_string(),
                    current: current.to_string(),
                });
            }
        }
        Ok(self.define(&current, &sym.name))
    }

    fn find_var(&self, ns: &str, name: &str) -> Option<VarRef> {
        self.read().namespaces.get(ns)?.vars.get(name).cloned()
    }

    fn find_type(&self, name: &str) -> Option<TypeRef> {
        self.read().types.get(name).cloned()
    }

    fn has_namespace(&self, ns: &str) -> bool {
        self.read().namespaces.contains_key(ns)
    }
}
