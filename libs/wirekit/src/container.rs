//! Instance container - resolves descriptors into live instances with lifetime-scoped caching

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use thiserror::Error;
use uuid::Uuid;

use crate::descriptor::{ComponentDescriptor, Erased, Lifetime, TypeKey};
use crate::registry::ComponentRegistry;

/// A constructed value plus its lifetime tag and creation timestamp.
#[derive(Clone)]
pub struct ResolvedInstance {
    value: Erased,
    lifetime: Lifetime,
    created_at: DateTime<Utc>,
}

impl std::fmt::Debug for ResolvedInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedInstance")
            .field("lifetime", &self.lifetime)
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

impl ResolvedInstance {
    fn new(value: Erased, lifetime: Lifetime) -> Self {
        Self {
            value,
            lifetime,
            created_at: Utc::now(),
        }
    }

    pub fn value(&self) -> &Erased {
        &self.value
    }

    pub fn lifetime(&self) -> Lifetime {
        self.lifetime
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn downcast<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        self.value.clone().downcast::<T>().ok()
    }
}

struct Waiter {
    /// Components the waiting resolution is currently constructing.
    holding: Vec<String>,
    target: String,
}

/// Resolutions blocked on another caller's construction lock.
///
/// Loops that span several callers (a -> b on one thread, b -> a on another)
/// never show up in a single resolution path; they are found here as a cycle
/// of "holds X, waits for Y" edges before the caller blocks.
#[derive(Default)]
struct WaitGraph {
    waiters: Mutex<HashMap<u64, Waiter>>,
    next_id: AtomicU64,
}

impl WaitGraph {
    fn lock_for<'l>(
        &self,
        lock: &'l Mutex<()>,
        name: &str,
        path: &[String],
    ) -> Result<parking_lot::MutexGuard<'l, ()>, ResolveError> {
        if let Some(guard) = lock.try_lock() {
            return Ok(guard);
        }

        let id = {
            let mut waiters = self.waiters.lock();
            if let Some(cycle) = find_cycle(&waiters, name, path) {
                tracing::warn!(path = %cycle.join(" -> "), "Resolution loop across callers");
                return Err(ResolveError::ResolutionCycle { path: cycle });
            }
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            waiters.insert(
                id,
                Waiter {
                    holding: path.to_vec(),
                    target: name.to_string(),
                },
            );
            id
        };

        let guard = lock.lock();
        self.waiters.lock().remove(&id);
        Ok(guard)
    }
}

/// Follow wait edges from `target`; a chain leading back into `path` would never wake up.
fn find_cycle(waiters: &HashMap<u64, Waiter>, target: &str, path: &[String]) -> Option<Vec<String>> {
    let mut visited = HashSet::new();
    let mut stack = vec![vec![target.to_string()]];

    while let Some(chain) = stack.pop() {
        let Some(last) = chain.last() else { continue };
        if !visited.insert(last.clone()) {
            continue;
        }
        for waiter in waiters.values().filter(|w| w.holding.contains(last)) {
            let mut next = chain.clone();
            next.push(waiter.target.clone());
            if let Some(pos) = path.iter().position(|p| *p == waiter.target) {
                let mut cycle = path[pos..].to_vec();
                cycle.extend(next);
                return Some(cycle);
            }
            stack.push(next);
        }
    }
    None
}

/// Cache with double-checked, per-name construction locks.
///
/// Cached reads never touch the construction locks.
#[derive(Default)]
struct InstanceCache {
    ready: DashMap<String, ResolvedInstance>,
    building: DashMap<String, Arc<Mutex<()>>>,
}

impl InstanceCache {
    fn get(&self, name: &str) -> Option<ResolvedInstance> {
        self.ready.get(name).map(|e| e.value().clone())
    }

    fn get_or_construct<F>(
        &self,
        name: &str,
        waits: &WaitGraph,
        path: &[String],
        construct: F,
    ) -> Result<ResolvedInstance, ResolveError>
    where
        F: FnOnce() -> Result<ResolvedInstance, ResolveError>,
    {
        if let Some(hit) = self.get(name) {
            return Ok(hit);
        }

        let lock = self.building.entry(name.to_string()).or_default().clone();
        let _guard = waits.lock_for(&lock, name, path)?;
        if let Some(hit) = self.get(name) {
            return Ok(hit);
        }

        let instance = construct()?;
        self.ready.insert(name.to_string(), instance.clone());
        Ok(instance)
    }

    fn len(&self) -> usize {
        self.ready.len()
    }

    fn clear(&self) {
        self.ready.clear();
        self.building.clear();
    }
}

struct ScopeState {
    id: Uuid,
    cache: InstanceCache,
}

impl ScopeState {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4(),
            cache: InstanceCache::default(),
        })
    }
}

struct ContainerInner {
    registry: Arc<ComponentRegistry>,
    singletons: InstanceCache,
    root: Arc<ScopeState>,
    waits: WaitGraph,
}

/// Resolves descriptor names (or type/capability keys) into live instances.
///
/// The container owns a root scope; resolutions not made through an explicit
/// [`Scope`] cache `Scoped` instances there.
#[derive(Clone)]
pub struct Container {
    inner: Arc<ContainerInner>,
}

impl std::fmt::Debug for Container {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Container")
            .field("singletons", &self.inner.singletons.len())
            .field("root_scope", &self.inner.root.id)
            .finish()
    }
}

impl Container {
    pub fn new(registry: Arc<ComponentRegistry>) -> Self {
        Self {
            inner: Arc::new(ContainerInner {
                registry,
                singletons: InstanceCache::default(),
                root: ScopeState::new(),
                waits: WaitGraph::default(),
            }),
        }
    }

    pub fn registry(&self) -> &Arc<ComponentRegistry> {
        &self.inner.registry
    }

    fn root_ctx(&self) -> ResolveCtx<'_> {
        ResolveCtx {
            container: self,
            scope: &self.inner.root,
            path: Vec::new(),
        }
    }

    pub fn resolve<T: Send + Sync + 'static>(&self, name: &str) -> Result<Arc<T>, ResolveError> {
        self.root_ctx().resolve(name)
    }

    pub fn resolve_type<T: Send + Sync + 'static>(&self) -> Result<Arc<T>, ResolveError> {
        self.root_ctx().resolve_type()
    }

    pub fn resolve_as<U: ?Sized + Send + Sync + 'static>(
        &self,
        name: &str,
    ) -> Result<Arc<U>, ResolveError> {
        self.root_ctx().resolve_as(name)
    }

    pub fn resolve_capability<U: ?Sized + Send + Sync + 'static>(
        &self,
    ) -> Result<Arc<U>, ResolveError> {
        self.root_ctx().resolve_capability()
    }

    /// Untyped resolution in the root scope; used by the orchestrator.
    pub fn resolve_erased(&self, name: &str) -> Result<ResolvedInstance, ResolveError> {
        self.root_ctx().resolve_erased(name)
    }

    /// Already-constructed singleton or root-scoped instance, without constructing.
    pub fn cached(&self, name: &str) -> Option<ResolvedInstance> {
        self.inner
            .singletons
            .get(name)
            .or_else(|| self.inner.root.cache.get(name))
    }

    /// Open a new scope with an empty `Scoped` cache.
    pub fn create_scope(&self) -> Scope {
        let state = ScopeState::new();
        tracing::debug!(scope = %state.id, "Scope created");
        Scope {
            container: self.clone(),
            state,
        }
    }

    fn lookup(&self, name: &str) -> Result<Arc<ComponentDescriptor>, ResolveError> {
        self.inner
            .registry
            .lookup(name)
            .ok_or_else(|| ResolveError::UnregisteredDependency {
                name: name.to_string(),
            })
    }

    fn instance_of(
        &self,
        scope: &Arc<ScopeState>,
        descriptor: &ComponentDescriptor,
        path: &[String],
    ) -> Result<ResolvedInstance, ResolveError> {
        let name = descriptor.name();
        if path.iter().any(|p| p == name) {
            let mut cycle = path.to_vec();
            cycle.push(name.to_string());
            return Err(ResolveError::ResolutionCycle { path: cycle });
        }

        let mut next = path.to_vec();
        next.push(name.to_string());

        let waits = &self.inner.waits;
        match descriptor.lifetime() {
            // singletons never capture a child scope's instances
            Lifetime::Singleton => self.inner.singletons.get_or_construct(name, waits, path, || {
                self.construct(&self.inner.root, descriptor, next)
            }),
            Lifetime::Scoped => scope.cache.get_or_construct(name, waits, path, || {
                self.construct(scope, descriptor, next)
            }),
            Lifetime::Transient => self.construct(scope, descriptor, next),
        }
    }

    fn construct(
        &self,
        scope: &Arc<ScopeState>,
        descriptor: &ComponentDescriptor,
        path: Vec<String>,
    ) -> Result<ResolvedInstance, ResolveError> {
        let ctx = ResolveCtx {
            container: self,
            scope,
            path,
        };
        let value = (descriptor.factory())(&ctx).map_err(|source| {
            // keep loop detection visible through intermediate factories
            match source.downcast::<ResolveError>() {
                Ok(cycle @ ResolveError::ResolutionCycle { .. }) => cycle,
                Ok(other) => ResolveError::Factory {
                    component: descriptor.name().to_string(),
                    source: other.into(),
                },
                Err(source) => ResolveError::Factory {
                    component: descriptor.name().to_string(),
                    source,
                },
            }
        })?;

        tracing::debug!(
            component = descriptor.name(),
            lifetime = ?descriptor.lifetime(),
            scope = %scope.id,
            "Instance constructed"
        );
        Ok(ResolvedInstance::new(value, descriptor.lifetime()))
    }
}

/// An explicit scope boundary for `Scoped` components.
#[derive(Clone)]
pub struct Scope {
    container: Container,
    state: Arc<ScopeState>,
}

impl std::fmt::Debug for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scope")
            .field("id", &self.state.id)
            .field("cached", &self.state.cache.len())
            .finish()
    }
}

impl Scope {
    pub fn id(&self) -> Uuid {
        self.state.id
    }

    fn ctx(&self) -> ResolveCtx<'_> {
        ResolveCtx {
            container: &self.container,
            scope: &self.state,
            path: Vec::new(),
        }
    }

    pub fn resolve<T: Send + Sync + 'static>(&self, name: &str) -> Result<Arc<T>, ResolveError> {
        self.ctx().resolve(name)
    }

    pub fn resolve_type<T: Send + Sync + 'static>(&self) -> Result<Arc<T>, ResolveError> {
        self.ctx().resolve_type()
    }

    pub fn resolve_as<U: ?Sized + Send + Sync + 'static>(
        &self,
        name: &str,
    ) -> Result<Arc<U>, ResolveError> {
        self.ctx().resolve_as(name)
    }

    pub fn resolve_capability<U: ?Sized + Send + Sync + 'static>(
        &self,
    ) -> Result<Arc<U>, ResolveError> {
        self.ctx().resolve_capability()
    }

    /// Drop every instance cached in this scope (shared by all clones of the handle).
    pub fn dispose(self) {
        let cached = self.state.cache.len();
        self.state.cache.clear();
        tracing::debug!(scope = %self.state.id, cached, "Scope disposed");
    }
}

/// Resolution context handed to factories.
///
/// Carries the current scope and the chain of components under construction,
/// so factories pull their own dependencies through the same container.
pub struct ResolveCtx<'a> {
    container: &'a Container,
    scope: &'a Arc<ScopeState>,
    path: Vec<String>,
}

impl ResolveCtx<'_> {
    /// Id of the scope this resolution runs in.
    pub fn scope_id(&self) -> Uuid {
        self.scope.id
    }

    /// Components currently under construction, outermost first.
    pub fn path(&self) -> &[String] {
        &self.path
    }

    pub fn resolve<T: Send + Sync + 'static>(&self, name: &str) -> Result<Arc<T>, ResolveError> {
        let descriptor = self.container.lookup(name)?;
        let expected = TypeKey::of::<T>();
        if descriptor.type_key() != expected {
            return Err(ResolveError::TypeMismatch {
                name: name.to_string(),
                expected: expected.name,
                actual: descriptor.type_key().name,
            });
        }
        let instance = self.container.instance_of(self.scope, &descriptor, &self.path)?;
        instance
            .value
            .downcast::<T>()
            .map_err(|_| ResolveError::TypeMismatch {
                name: name.to_string(),
                expected: expected.name,
                actual: descriptor.type_key().name,
            })
    }

    /// Resolve the single component whose concrete type is `T`, whatever its name.
    pub fn resolve_type<T: Send + Sync + 'static>(&self) -> Result<Arc<T>, ResolveError> {
        let key = TypeKey::of::<T>();
        let store = self.container.inner.registry.snapshot();
        let mut matches: Vec<String> = store
            .providers_of(key)
            .into_iter()
            .filter(|d| d.type_key() == key)
            .map(|d| d.name().to_string())
            .collect();

        match matches.len() {
            0 => Err(ResolveError::UnregisteredDependency {
                name: key.name.to_string(),
            }),
            1 => {
                let name = matches.remove(0);
                self.resolve(&name)
            }
            _ => Err(ResolveError::AmbiguousType {
                type_name: key.name,
                candidates: matches,
            }),
        }
    }

    /// Resolve a named component through one of its declared capabilities.
    pub fn resolve_as<U: ?Sized + Send + Sync + 'static>(
        &self,
        name: &str,
    ) -> Result<Arc<U>, ResolveError> {
        let descriptor = self.container.lookup(name)?;
        let key = TypeKey::of::<U>();
        let mismatch = || ResolveError::TypeMismatch {
            name: name.to_string(),
            expected: key.name,
            actual: descriptor.type_key().name,
        };
        let capability = descriptor.capability(key.id).ok_or_else(mismatch)?;
        let instance = self.container.instance_of(self.scope, &descriptor, &self.path)?;
        let boxed = (capability.cast)(instance.value).ok_or_else(mismatch)?;
        boxed
            .downcast::<Arc<U>>()
            .map(|b| *b)
            .map_err(|_| mismatch())
    }

    /// Resolve the single component exposing capability `U`.
    pub fn resolve_capability<U: ?Sized + Send + Sync + 'static>(
        &self,
    ) -> Result<Arc<U>, ResolveError> {
        let key = TypeKey::of::<U>();
        let store = self.container.inner.registry.snapshot();
        let providers: Vec<String> = store
            .providers_of(key)
            .into_iter()
            .filter(|d| d.capability(key.id).is_some())
            .map(|d| d.name().to_string())
            .collect();

        match providers.as_slice() {
            [] => Err(ResolveError::UnregisteredDependency {
                name: key.name.to_string(),
            }),
            [single] => self.resolve_as(single),
            _ => Err(ResolveError::AmbiguousCapability {
                capability: key.name,
                candidates: providers,
            }),
        }
    }

    pub fn resolve_erased(&self, name: &str) -> Result<ResolvedInstance, ResolveError> {
        let descriptor = self.container.lookup(name)?;
        self.container.instance_of(self.scope, &descriptor, &self.path)
    }
}

/// Resolution errors, fatal to the specific resolution call.
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("component '{name}' is not registered")]
    UnregisteredDependency { name: String },
    #[error("component '{name}' is `{actual}`, which does not satisfy `{expected}`")]
    TypeMismatch {
        name: String,
        expected: &'static str,
        actual: &'static str,
    },
    #[error("capability `{capability}` is provided by several components: {candidates:?}")]
    AmbiguousCapability {
        capability: &'static str,
        candidates: Vec<String>,
    },
    #[error("type `{type_name}` is registered under several names: {candidates:?}")]
    AmbiguousType {
        type_name: &'static str,
        candidates: Vec<String>,
    },
    #[error("self-referential resolution: {}", path.join(" -> "))]
    ResolutionCycle { path: Vec<String> },
    #[error("factory for '{component}' failed")]
    Factory {
        component: String,
        #[source]
        source: anyhow::Error,
    },
}
