//! Component descriptors: the immutable registration record for one component.

use std::any::{type_name, Any, TypeId};
use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::container::ResolveCtx;
use crate::contracts::{Component, HealthReport};
use crate::registry::RegistryError;

/// Type-erased instance as stored by the container.
pub type Erased = Arc<dyn Any + Send + Sync>;

pub(crate) type FactoryFn = Arc<dyn Fn(&ResolveCtx<'_>) -> anyhow::Result<Erased> + Send + Sync>;
pub(crate) type LifecycleFn =
    Arc<dyn Fn(Erased, CancellationToken) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;
pub(crate) type HealthFn =
    Arc<dyn Fn(Erased) -> BoxFuture<'static, anyhow::Result<HealthReport>> + Send + Sync>;
type CastFn = Arc<dyn Fn(Erased) -> Option<Box<dyn Any + Send + Sync>> + Send + Sync>;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Caching policy for resolved instances.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lifetime {
    /// Constructed once per container.
    #[default]
    Singleton,
    /// Constructed once per [`Scope`](crate::Scope).
    Scoped,
    /// Constructed on every resolution.
    Transient,
}

/// Identifies the concrete type (or capability) an instance satisfies.
#[derive(Clone, Copy, Debug)]
pub struct TypeKey {
    pub id: TypeId,
    pub name: &'static str,
}

impl TypeKey {
    pub fn of<T: ?Sized + 'static>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: type_name::<T>(),
        }
    }
}

impl PartialEq for TypeKey {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for TypeKey {}

impl std::fmt::Display for TypeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name)
    }
}

/// Per-handler timeout and retry policy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Bound on a single handler attempt.
    pub timeout: Duration,
    /// Additional attempts after the first one.
    pub retries: u32,
    /// Pause between attempts.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            retries: 0,
            backoff: Duration::ZERO,
        }
    }
}

/// Optional policy fields; layered over [`RetryPolicy`] defaults.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PolicyOverrides {
    pub timeout: Option<Duration>,
    pub retries: Option<u32>,
    pub retry_backoff: Option<Duration>,
    pub priority: Option<i32>,
}

impl PolicyOverrides {
    fn overlay(&self, mut policy: RetryPolicy) -> RetryPolicy {
        if let Some(t) = self.timeout {
            policy.timeout = t;
        }
        if let Some(r) = self.retries {
            policy.retries = r;
        }
        if let Some(b) = self.retry_backoff {
            policy.backoff = b;
        }
        policy
    }
}

/// A declared dependency edge, optionally with the type the dependent expects to find.
#[derive(Clone, Debug)]
pub struct Dependency {
    pub name: String,
    pub expected: Option<TypeKey>,
}

#[derive(Clone, Default)]
pub(crate) struct Handlers {
    pub start: Option<LifecycleFn>,
    pub stop: Option<LifecycleFn>,
    pub health: Option<HealthFn>,
}

impl Handlers {
    fn or(self, fallback: Handlers) -> Handlers {
        Handlers {
            start: self.start.or(fallback.start),
            stop: self.stop.or(fallback.stop),
            health: self.health.or(fallback.health),
        }
    }
}

#[derive(Clone)]
pub(crate) struct Capability {
    pub key: TypeKey,
    pub cast: CastFn,
}

/// Registered metadata describing how to construct and manage one component.
#[derive(Clone)]
pub struct ComponentDescriptor {
    name: String,
    type_key: TypeKey,
    dependencies: Vec<Dependency>,
    priority: i32,
    lifetime: Lifetime,
    factory: FactoryFn,
    handlers: Handlers,
    declared: PolicyOverrides,
    policy: RetryPolicy,
    capabilities: HashMap<TypeId, Capability>,
}

impl std::fmt::Debug for ComponentDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComponentDescriptor")
            .field("name", &self.name)
            .field("type", &self.type_key.name)
            .field("dependencies", &self.dependency_names().collect::<Vec<_>>())
            .field("priority", &self.priority)
            .field("lifetime", &self.lifetime)
            .field("policy", &self.policy)
            .field("has_start", &self.handlers.start.is_some())
            .field("has_stop", &self.handlers.stop.is_some())
            .field("has_health", &self.handlers.health.is_some())
            .finish()
    }
}

impl ComponentDescriptor {
    /// Start a descriptor for instances of `T`. The registry name defaults to the type key.
    pub fn builder<T: Send + Sync + 'static>() -> DescriptorBuilder<T> {
        DescriptorBuilder::new()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn type_key(&self) -> TypeKey {
        self.type_key
    }

    pub fn dependencies(&self) -> &[Dependency] {
        &self.dependencies
    }

    pub fn dependency_names(&self) -> impl Iterator<Item = &str> {
        self.dependencies.iter().map(|d| d.name.as_str())
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn lifetime(&self) -> Lifetime {
        self.lifetime
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Whether this component satisfies `key`, either as its concrete type or as a capability.
    pub fn satisfies(&self, key: TypeKey) -> bool {
        self.type_key == key || self.capabilities.contains_key(&key.id)
    }

    pub fn capabilities(&self) -> impl Iterator<Item = TypeKey> + '_ {
        self.capabilities.values().map(|c| c.key)
    }

    pub(crate) fn factory(&self) -> &FactoryFn {
        &self.factory
    }

    pub(crate) fn handlers(&self) -> &Handlers {
        &self.handlers
    }

    pub(crate) fn capability(&self, id: TypeId) -> Option<&Capability> {
        self.capabilities.get(&id)
    }

    /// Recompute the effective policy: `defaults` < builder-declared < `overrides`.
    pub(crate) fn apply_policy(&mut self, defaults: RetryPolicy, overrides: Option<&PolicyOverrides>) {
        let mut policy = self.declared.overlay(defaults);
        if let Some(o) = overrides {
            policy = o.overlay(policy);
            if let Some(p) = o.priority {
                self.priority = p;
            }
        }
        self.policy = policy;
    }
}

/// Typed builder for [`ComponentDescriptor`].
pub struct DescriptorBuilder<T> {
    name: Option<String>,
    dependencies: Vec<Dependency>,
    priority: i32,
    lifetime: Lifetime,
    factory: Option<FactoryFn>,
    prebuilt: bool,
    handlers: Handlers,
    trait_handlers: Option<Handlers>,
    declared: PolicyOverrides,
    capabilities: HashMap<TypeId, Capability>,
    errors: Vec<String>,
    _marker: PhantomData<fn() -> T>,
}

fn downcast<T: Send + Sync + 'static>(erased: Erased) -> anyhow::Result<Arc<T>> {
    erased
        .downcast::<T>()
        .map_err(|_| anyhow::anyhow!("instance is not a `{}`", type_name::<T>()))
}

impl<T: Send + Sync + 'static> DescriptorBuilder<T> {
    fn new() -> Self {
        Self {
            name: None,
            dependencies: Vec::new(),
            priority: 0,
            lifetime: Lifetime::Singleton,
            factory: None,
            prebuilt: false,
            handlers: Handlers::default(),
            trait_handlers: None,
            declared: PolicyOverrides::default(),
            capabilities: HashMap::new(),
            errors: Vec::new(),
            _marker: PhantomData,
        }
    }

    /// Explicit registry name; needed when several components share a type.
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn depends_on(mut self, name: impl Into<String>) -> Self {
        self.dependencies.push(Dependency {
            name: name.into(),
            expected: None,
        });
        self
    }

    /// Depend on the component registered under `D`'s type key; the type is checked at registration.
    pub fn depends_on_type<D: ?Sized + 'static>(self) -> Self {
        let key = TypeKey::of::<D>();
        self.depends_on_typed(key.name, key)
    }

    /// Depend on a named component that must satisfy `D`.
    pub fn depends_on_named<D: ?Sized + 'static>(self, name: impl Into<String>) -> Self {
        self.depends_on_typed(name, TypeKey::of::<D>())
    }

    fn depends_on_typed(mut self, name: impl Into<String>, key: TypeKey) -> Self {
        self.dependencies.push(Dependency {
            name: name.into(),
            expected: Some(key),
        });
        self
    }

    /// Lower starts earlier among components not ordered by dependencies.
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn lifetime(mut self, lifetime: Lifetime) -> Self {
        self.lifetime = lifetime;
        self
    }

    pub fn singleton(self) -> Self {
        self.lifetime(Lifetime::Singleton)
    }

    pub fn scoped(self) -> Self {
        self.lifetime(Lifetime::Scoped)
    }

    pub fn transient(self) -> Self {
        self.lifetime(Lifetime::Transient)
    }

    /// Construct instances through `f`; it may resolve other components via the context.
    pub fn factory<F>(mut self, f: F) -> Self
    where
        F: Fn(&ResolveCtx<'_>) -> anyhow::Result<T> + Send + Sync + 'static,
    {
        self.factory = Some(Arc::new(
            move |ctx: &ResolveCtx<'_>| -> anyhow::Result<Erased> { Ok(Arc::new(f(ctx)?)) },
        ));
        self.prebuilt = false;
        self
    }

    /// Register an already constructed value. Only valid for singletons.
    pub fn instance(mut self, value: T) -> Self {
        let shared: Erased = Arc::new(value);
        self.factory = Some(Arc::new(
            move |_: &ResolveCtx<'_>| -> anyhow::Result<Erased> { Ok(shared.clone()) },
        ));
        self.prebuilt = true;
        self
    }

    /// Use the [`Component`] implementation of `T` for start/stop/health.
    /// Explicit `on_*` handlers still take precedence.
    pub fn with_lifecycle(mut self) -> Self
    where
        T: Component,
    {
        self.trait_handlers = Some(Handlers {
            start: Some(Arc::new(|erased: Erased, cancel: CancellationToken| {
                async move { downcast::<T>(erased)?.start(cancel).await }.boxed()
            })),
            stop: Some(Arc::new(|erased: Erased, cancel: CancellationToken| {
                async move { downcast::<T>(erased)?.stop(cancel).await }.boxed()
            })),
            health: Some(Arc::new(|erased: Erased| {
                async move { downcast::<T>(erased)?.health().await }.boxed()
            })),
        });
        self
    }

    pub fn on_start<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Arc<T>, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.handlers.start = Some(lifecycle_fn(f));
        self
    }

    pub fn on_stop<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Arc<T>, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.handlers.stop = Some(lifecycle_fn(f));
        self
    }

    pub fn on_health<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Arc<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<HealthReport>> + Send + 'static,
    {
        let f = Arc::new(f);
        self.handlers.health = Some(Arc::new(move |erased: Erased| {
            let f = f.clone();
            async move { f(downcast::<T>(erased)?).await }.boxed()
        }));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.declared.timeout = Some(timeout);
        self
    }

    pub fn retries(mut self, retries: u32) -> Self {
        self.declared.retries = Some(retries);
        self
    }

    pub fn retry_backoff(mut self, backoff: Duration) -> Self {
        self.declared.retry_backoff = Some(backoff);
        self
    }

    /// Expose the instance under capability `U` (usually a trait object).
    ///
    /// ```rust,ignore
    /// ComponentDescriptor::builder::<PgStore>()
    ///     .factory(|_| Ok(PgStore::default()))
    ///     .provides::<dyn Store>(|s| s)
    /// ```
    pub fn provides<U>(mut self, cast: fn(Arc<T>) -> Arc<U>) -> Self
    where
        U: ?Sized + Send + Sync + 'static,
    {
        let key = TypeKey::of::<U>();
        let capability = Capability {
            key,
            cast: Arc::new(move |erased: Erased| {
                erased
                    .downcast::<T>()
                    .ok()
                    .map(|inst| Box::new(cast(inst)) as Box<dyn Any + Send + Sync>)
            }),
        };
        if self.capabilities.insert(key.id, capability).is_some() {
            self.errors
                .push(format!("capability `{key}` is declared more than once"));
        }
        self
    }

    /// Validate and freeze the descriptor.
    pub fn build(self) -> Result<ComponentDescriptor, RegistryError> {
        let type_key = TypeKey::of::<T>();
        let name = self.name.unwrap_or_else(|| type_key.name.to_string());
        let mut errors = self.errors;

        if name.trim().is_empty() {
            errors.push("component name must not be empty".to_string());
        }
        if self.prebuilt && self.lifetime != Lifetime::Singleton {
            errors.push(format!(
                "pre-built instances must be singletons, got {:?}",
                self.lifetime
            ));
        }
        let Some(factory) = self.factory else {
            return Err(RegistryError::MissingFactory { component: name });
        };
        if !errors.is_empty() {
            return Err(RegistryError::InvalidDescriptor {
                component: name,
                errors,
            });
        }

        let handlers = match self.trait_handlers {
            Some(from_trait) => self.handlers.or(from_trait),
            None => self.handlers,
        };

        Ok(ComponentDescriptor {
            name,
            type_key,
            dependencies: self.dependencies,
            priority: self.priority,
            lifetime: self.lifetime,
            factory,
            handlers,
            declared: self.declared,
            policy: self.declared.overlay(RetryPolicy::default()),
            capabilities: self.capabilities,
        })
    }
}

fn lifecycle_fn<T, F, Fut>(f: F) -> LifecycleFn
where
    T: Send + Sync + 'static,
    F: Fn(Arc<T>, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    let f = Arc::new(f);
    Arc::new(move |erased: Erased, cancel: CancellationToken| {
        let f = f.clone();
        async move { f(downcast::<T>(erased)?, cancel).await }.boxed()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Db;
    trait Store: Send + Sync {}
    impl Store for Db {}

    #[test]
    fn name_defaults_to_type_key() {
        let d = ComponentDescriptor::builder::<Db>()
            .factory(|_| Ok(Db))
            .build()
            .unwrap();
        assert_eq!(d.name(), type_name::<Db>());
        assert_eq!(d.type_key(), TypeKey::of::<Db>());
        assert_eq!(d.lifetime(), Lifetime::Singleton);
        assert_eq!(d.policy(), RetryPolicy::default());
    }

    #[test]
    fn missing_factory_is_rejected() {
        let err = ComponentDescriptor::builder::<Db>()
            .named("db")
            .build()
            .unwrap_err();
        assert!(matches!(err, RegistryError::MissingFactory { component } if component == "db"));
    }

    #[test]
    fn prebuilt_instance_must_be_singleton() {
        let err = ComponentDescriptor::builder::<Db>()
            .named("db")
            .instance(Db)
            .transient()
            .build()
            .unwrap_err();
        match err {
            RegistryError::InvalidDescriptor { component, errors } => {
                assert_eq!(component, "db");
                assert!(errors[0].contains("singletons"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn duplicate_capability_is_rejected() {
        let err = ComponentDescriptor::builder::<Db>()
            .factory(|_| Ok(Db))
            .provides::<dyn Store>(|d| d)
            .provides::<dyn Store>(|d| d)
            .build()
            .unwrap_err();
        assert!(matches!(err, RegistryError::InvalidDescriptor { .. }));
    }

    #[test]
    fn policy_layers_defaults_declared_and_overrides() {
        let mut d = ComponentDescriptor::builder::<Db>()
            .factory(|_| Ok(Db))
            .timeout(Duration::from_secs(5))
            .retries(1)
            .build()
            .unwrap();

        let defaults = RetryPolicy {
            timeout: Duration::from_secs(60),
            retries: 3,
            backoff: Duration::from_millis(10),
        };
        d.apply_policy(defaults, None);
        assert_eq!(d.policy().timeout, Duration::from_secs(5));
        assert_eq!(d.policy().retries, 1);
        assert_eq!(d.policy().backoff, Duration::from_millis(10));

        let overrides = PolicyOverrides {
            retries: Some(4),
            priority: Some(-3),
            ..Default::default()
        };
        d.apply_policy(defaults, Some(&overrides));
        assert_eq!(d.policy().retries, 4);
        assert_eq!(d.policy().timeout, Duration::from_secs(5));
        assert_eq!(d.priority(), -3);
    }

    #[test]
    fn capability_is_reported() {
        let d = ComponentDescriptor::builder::<Db>()
            .factory(|_| Ok(Db))
            .provides::<dyn Store>(|d| d)
            .build()
            .unwrap();
        assert!(d.satisfies(TypeKey::of::<dyn Store>()));
        assert!(d.satisfies(TypeKey::of::<Db>()));
        assert!(!d.satisfies(TypeKey::of::<String>()));
    }
}
