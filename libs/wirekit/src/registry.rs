// wirekit/src/registry.rs
use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use thiserror::Error;

use crate::descriptor::{ComponentDescriptor, Dependency, TypeKey};

/// Registered descriptors in registration order, keyed by unique name.
///
/// Cloning is cheap: descriptors are shared behind `Arc`.
#[derive(Clone, Default)]
pub struct DescriptorStore {
    descriptors: Vec<Arc<ComponentDescriptor>>,
    index: HashMap<String, usize>,
}

impl std::fmt::Debug for DescriptorStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.descriptors.iter().map(|d| d.name()).collect();
        f.debug_struct("DescriptorStore")
            .field("components", &names)
            .finish()
    }
}

impl DescriptorStore {
    pub fn register(&mut self, descriptor: ComponentDescriptor) -> Result<(), RegistryError> {
        let name = descriptor.name().to_string();
        if self.index.contains_key(&name) {
            return Err(RegistryError::DuplicateName { name });
        }

        // Typed edges are checked eagerly in both directions; anything still
        // unresolved is re-checked when the graph is built.
        for dep in descriptor.dependencies() {
            if let Some(target) = self.lookup(&dep.name) {
                check_dependency_type(&name, dep, target)?;
            }
        }
        for existing in &self.descriptors {
            for dep in existing.dependencies().iter().filter(|d| d.name == name) {
                check_dependency_type(existing.name(), dep, &descriptor)?;
            }
        }

        self.index.insert(name, self.descriptors.len());
        self.descriptors.push(Arc::new(descriptor));
        Ok(())
    }

    pub fn lookup(&self, name: &str) -> Option<&Arc<ComponentDescriptor>> {
        self.index.get(name).map(|&i| &self.descriptors[i])
    }

    /// All descriptors in registration order.
    pub fn all(&self) -> &[Arc<ComponentDescriptor>] {
        &self.descriptors
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    /// Descriptors satisfying `key`, as concrete type or capability, in registration order.
    pub fn providers_of(&self, key: TypeKey) -> Vec<&Arc<ComponentDescriptor>> {
        self.descriptors
            .iter()
            .filter(|d| d.satisfies(key))
            .collect()
    }
}

pub(crate) fn check_dependency_type(
    component: &str,
    dep: &Dependency,
    target: &ComponentDescriptor,
) -> Result<(), RegistryError> {
    match dep.expected {
        Some(expected) if !target.satisfies(expected) => Err(RegistryError::TypeMismatch {
            component: component.to_string(),
            dependency: dep.name.clone(),
            expected: expected.name,
            actual: target.type_key().name,
        }),
        _ => Ok(()),
    }
}

/// Shared registration surface.
///
/// Writers are serialised; readers take an immutable [`DescriptorStore`] snapshot,
/// so resolution and orchestration never observe a half-applied registration.
#[derive(Default)]
pub struct ComponentRegistry {
    current: ArcSwap<DescriptorStore>,
    write: Mutex<()>,
}

impl std::fmt::Debug for ComponentRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("ComponentRegistry")
            .field(&*self.current.load())
            .finish()
    }
}

impl ComponentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, descriptor: ComponentDescriptor) -> Result<(), RegistryError> {
        let _guard = self.write.lock();
        let mut next = DescriptorStore::clone(&self.current.load());
        let name = descriptor.name().to_string();
        next.register(descriptor)?;
        self.current.store(Arc::new(next));
        tracing::debug!(component = %name, "Component registered");
        Ok(())
    }

    pub fn snapshot(&self) -> Arc<DescriptorStore> {
        self.current.load_full()
    }

    pub fn lookup(&self, name: &str) -> Option<Arc<ComponentDescriptor>> {
        self.current.load().lookup(name).cloned()
    }
}

/// Registration and graph-validation errors. Always fatal to `start`.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("component '{name}' is already registered")]
    DuplicateName { name: String },
    #[error("component '{component}' depends on unknown '{missing}'")]
    MissingDependency { component: String, missing: String },
    #[error("cyclic dependency detected: {}", path.join(" -> "))]
    CyclicDependency { path: Vec<String> },
    #[error("component '{component}' expects '{dependency}' to be `{expected}`, but it is `{actual}`")]
    TypeMismatch {
        component: String,
        dependency: String,
        expected: &'static str,
        actual: &'static str,
    },
    #[error("component '{component}' has no factory or instance")]
    MissingFactory { component: String },
    #[error("invalid descriptor for '{component}':\n{errors:#?}")]
    InvalidDescriptor {
        component: String,
        errors: Vec<String>,
    },
}
