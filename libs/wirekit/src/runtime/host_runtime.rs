//! Component host - orchestrates start, stop and health across the dependency graph.
//!
//! The host owns the registry, the instance container and the per-component state
//! table, and drives components through Startup → Running → Shutdown → Stopped.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::Instrument;

use crate::container::{Container, ResolveError, ResolvedInstance, Scope};
use crate::contracts::HealthReport;
use crate::descriptor::{ComponentDescriptor, Erased, LifecycleFn, PolicyOverrides, RetryPolicy};
use crate::errors::{chain, HandlerAction, LifecycleError, StopFailure};
use crate::graph::ExecutionPlan;
use crate::health::{self, HealthSnapshot};
use crate::registry::{ComponentRegistry, RegistryError};
use crate::runtime::deadline::Deadline;
use crate::runtime::state::{ComponentState, LifecyclePhase, PhaseCell, StateTable};

/// How start/stop walk the plan.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartMode {
    /// One component at a time, in plan order.
    #[default]
    Sequential,
    /// Each dependency-depth wave concurrently; a wave completes before the next begins.
    Waves,
}

/// Host-wide policy applied to every registered descriptor.
#[derive(Clone, Debug, Default)]
pub struct HostOptions {
    pub start_mode: StartMode,
    /// Baseline policy; builder-declared values win over it.
    pub defaults: RetryPolicy,
    /// Per-name overrides; win over builder-declared values.
    pub overrides: HashMap<String, PolicyOverrides>,
}

/// Registry, container and orchestrator behind one explicit context object.
pub struct ComponentHost {
    registry: Arc<ComponentRegistry>,
    container: Container,
    states: StateTable,
    phase: PhaseCell,
    started: DashMap<String, ResolvedInstance>,
    options: HostOptions,
    lifecycle: tokio::sync::Mutex<()>,
}

impl Default for ComponentHost {
    fn default() -> Self {
        Self::new(HostOptions::default())
    }
}

impl std::fmt::Debug for ComponentHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComponentHost")
            .field("phase", &self.phase.get())
            .field("components", &self.registry.snapshot().len())
            .field("options", &self.options)
            .finish()
    }
}

impl ComponentHost {
    pub fn new(options: HostOptions) -> Self {
        let registry = Arc::new(ComponentRegistry::new());
        Self {
            container: Container::new(registry.clone()),
            registry,
            states: StateTable::default(),
            phase: PhaseCell::default(),
            started: DashMap::new(),
            options,
            lifecycle: tokio::sync::Mutex::new(()),
        }
    }

    /// Register a component, applying host defaults and per-name overrides to its policy.
    pub fn register(&self, mut descriptor: ComponentDescriptor) -> Result<(), RegistryError> {
        let overrides = self.options.overrides.get(descriptor.name());
        descriptor.apply_policy(self.options.defaults, overrides);
        let state_seed = descriptor.clone();
        self.registry.register(descriptor)?;
        self.states.ensure(&state_seed);
        Ok(())
    }

    pub fn registry(&self) -> &Arc<ComponentRegistry> {
        &self.registry
    }

    pub fn container(&self) -> &Container {
        &self.container
    }

    pub fn options(&self) -> &HostOptions {
        &self.options
    }

    pub fn phase(&self) -> LifecyclePhase {
        self.phase.get()
    }

    /// Validated plan for the current descriptor set.
    pub fn plan(&self) -> Result<ExecutionPlan, RegistryError> {
        ExecutionPlan::resolve(&self.registry.snapshot())
    }

    pub fn resolve<T: Send + Sync + 'static>(&self, name: &str) -> Result<Arc<T>, ResolveError> {
        self.container.resolve(name)
    }

    pub fn resolve_type<T: Send + Sync + 'static>(&self) -> Result<Arc<T>, ResolveError> {
        self.container.resolve_type()
    }

    pub fn resolve_capability<U: ?Sized + Send + Sync + 'static>(
        &self,
    ) -> Result<Arc<U>, ResolveError> {
        self.container.resolve_capability()
    }

    pub fn create_scope(&self) -> Scope {
        self.container.create_scope()
    }

    pub fn component_state(&self, name: &str) -> Option<ComponentState> {
        self.states.get(name)
    }

    /// All component states, sorted by name.
    pub fn component_states(&self) -> Vec<(String, ComponentState)> {
        self.states.snapshot()
    }

    /// START: validate the plan, then start every component in order.
    ///
    /// Fails fast; already-started components are left running (call [`stop`](Self::stop)
    /// for all-or-nothing behaviour). Calling again while still in `Startup` skips
    /// components that are already running.
    pub async fn start(&self, deadline: &Deadline) -> Result<(), LifecycleError> {
        let _guard = self.lifecycle.lock().await;
        match self.phase.get() {
            LifecyclePhase::Running => return Ok(()),
            from @ (LifecyclePhase::Shutdown | LifecyclePhase::Stopped) => {
                return Err(LifecycleError::InvalidTransition {
                    from,
                    to: LifecyclePhase::Running,
                })
            }
            LifecyclePhase::Startup => {}
        }

        tracing::info!(mode = ?self.options.start_mode, "Starting components");
        let plan = self.plan()?;

        match self.options.start_mode {
            StartMode::Sequential => {
                for name in plan.start_order() {
                    check(deadline, LifecyclePhase::Startup)?;
                    self.start_one(name, deadline).await?;
                }
            }
            StartMode::Waves => {
                for (idx, wave) in plan.waves().iter().enumerate() {
                    check(deadline, LifecyclePhase::Startup)?;
                    tracing::debug!(wave = idx, components = ?wave, "Starting wave");
                    let results = join_all(wave.iter().map(|n| self.start_one(n, deadline))).await;
                    if let Some(err) = results.into_iter().find_map(Result::err) {
                        return Err(err);
                    }
                }
            }
        }

        self.phase
            .advance(LifecyclePhase::Running)
            .map_err(|(from, to)| LifecycleError::InvalidTransition { from, to })?;
        tracing::info!(components = plan.len(), "All components started");
        Ok(())
    }

    async fn start_one(&self, name: &str, deadline: &Deadline) -> Result<(), LifecycleError> {
        if self.states.phase_of(name) == Some(LifecyclePhase::Running) {
            tracing::debug!(component = name, "Already running; skipping");
            return Ok(());
        }
        let descriptor = self.descriptor(name)?;
        self.states.ensure(&descriptor);

        let instance = self.container.resolve_erased(name).map_err(|source| {
            let err = LifecycleError::Resolve {
                component: name.to_string(),
                source,
            };
            self.states.record_error(name, chain(&err));
            err
        })?;

        if let Some(handler) = &descriptor.handlers().start {
            tracing::debug!(component = name, "Starting component");
            let policy = descriptor.policy();
            if let Err(err) = self
                .invoke(name, HandlerAction::Start, policy, deadline, handler, instance.value())
                .await
            {
                tracing::warn!(component = name, error = %err, "Failed to start component");
                self.states.record_error(name, chain(&err));
                return Err(err);
            }
        }

        self.states.mark_running(name);
        self.started.insert(name.to_string(), instance);
        Ok(())
    }

    /// STOP: stop every running component in reverse order, best effort.
    ///
    /// Failures are collected into [`LifecycleError::StopFailed`]; every component still
    /// gets its stop attempt.
    pub async fn stop(&self, deadline: &Deadline) -> Result<(), LifecycleError> {
        let _guard = self.lifecycle.lock().await;
        if self.phase.get() == LifecyclePhase::Stopped {
            return Ok(());
        }
        self.phase
            .advance(LifecyclePhase::Shutdown)
            .map_err(|(from, to)| LifecycleError::InvalidTransition { from, to })?;

        let waves: Vec<Vec<String>> = match self.plan() {
            Ok(plan) => match self.options.start_mode {
                StartMode::Sequential => plan.stop_order().map(|n| vec![n.clone()]).collect(),
                StartMode::Waves => plan.stop_waves(),
            },
            Err(err) => {
                tracing::warn!(error = %err, "Plan unavailable at stop; using reverse registration order");
                self.registry
                    .snapshot()
                    .all()
                    .iter()
                    .rev()
                    .map(|d| vec![d.name().to_string()])
                    .collect()
            }
        };

        let mut failures: Vec<StopFailure> = Vec::new();
        for wave in &waves {
            if let Err(err) = check(deadline, LifecyclePhase::Shutdown) {
                if failures.is_empty() {
                    return Err(err);
                }
                let failed: Vec<&str> = failures.iter().map(|f| f.component.as_str()).collect();
                tracing::warn!(?failed, "Stop cancelled after failures");
                return Err(LifecycleError::StopCancelled { failures });
            }
            let results = join_all(wave.iter().map(|n| self.stop_one(n, deadline))).await;
            for (name, result) in wave.iter().zip(results) {
                if let Err(err) = result {
                    failures.push(StopFailure {
                        component: name.clone(),
                        error: Box::new(err),
                    });
                }
            }
        }

        self.phase
            .advance(LifecyclePhase::Stopped)
            .map_err(|(from, to)| LifecycleError::InvalidTransition { from, to })?;

        if failures.is_empty() {
            tracing::info!("All components stopped");
            Ok(())
        } else {
            Err(LifecycleError::StopFailed { failures })
        }
    }

    async fn stop_one(&self, name: &str, deadline: &Deadline) -> Result<(), LifecycleError> {
        let instance = self.started.remove(name).map(|(_, i)| i);
        if self.states.phase_of(name) != Some(LifecyclePhase::Running) {
            self.states.mark_stopped(name, None);
            return Ok(());
        }
        self.states
            .update(name, |s| s.phase = LifecyclePhase::Shutdown);

        let descriptor = self.descriptor(name)?;
        let handler = descriptor.handlers().stop.as_ref();
        let value = instance.or_else(|| self.container.cached(name));

        if let (Some(handler), Some(instance)) = (handler, value) {
            tracing::debug!(component = name, "Stopping component");
            if let Err(err) = self
                .invoke(
                    name,
                    HandlerAction::Stop,
                    descriptor.policy(),
                    deadline,
                    handler,
                    instance.value(),
                )
                .await
            {
                tracing::warn!(component = name, error = %err, "Failed to stop component");
                self.states.mark_stopped(name, Some(chain(&err)));
                return Err(err);
            }
        }

        self.states.mark_stopped(name, None);
        Ok(())
    }

    /// Run one handler under the component's timeout/retry policy.
    async fn invoke(
        &self,
        name: &str,
        action: HandlerAction,
        policy: RetryPolicy,
        deadline: &Deadline,
        handler: &LifecycleFn,
        value: &Erased,
    ) -> Result<(), LifecycleError> {
        let phase = match action {
            HandlerAction::Stop => LifecyclePhase::Shutdown,
            _ => LifecyclePhase::Startup,
        };
        let attempts = policy.retries.saturating_add(1);
        let mut attempt = 0;

        loop {
            check(deadline, phase)?;
            attempt += 1;

            let cancel = deadline.token().child_token();
            let span = tracing::info_span!("component", name = %name, %action, attempt);
            let call = handler(value.clone(), cancel.clone()).instrument(span);

            let err = match tokio::time::timeout(policy.timeout, call).await {
                Ok(Ok(())) => {
                    if attempt > 1 {
                        tracing::info!(component = name, %action, attempt, "Handler succeeded after retry");
                    }
                    return Ok(());
                }
                Ok(Err(source)) => LifecycleError::HandlerFailure {
                    component: name.to_string(),
                    action,
                    attempts: attempt,
                    source,
                },
                Err(_) => {
                    cancel.cancel();
                    LifecycleError::Timeout {
                        component: name.to_string(),
                        action,
                        timeout: policy.timeout,
                    }
                }
            };

            if attempt >= attempts {
                return Err(err);
            }
            tracing::warn!(
                component = name,
                %action,
                attempt,
                remaining = attempts - attempt,
                error = %err,
                "Handler failed; retrying"
            );
            if !policy.backoff.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(policy.backoff) => {}
                    _ = deadline.expired() => return Err(LifecycleError::Cancelled { phase }),
                }
            }
        }
    }

    /// Probe every running component and fold dependency health. Never cached.
    pub async fn health(&self, deadline: &Deadline) -> HealthSnapshot {
        let store = self.registry.snapshot();
        let plan = match ExecutionPlan::resolve(&store) {
            Ok(plan) => plan,
            Err(err) => {
                return HealthSnapshot::all_unknown(
                    store.all().iter().map(|d| d.name()),
                    &err.to_string(),
                )
            }
        };

        let probes = plan.start_order().iter().map(|name| async move {
            (name.clone(), self.probe(name, deadline).await)
        });
        let raw: HashMap<String, HealthReport> = join_all(probes).await.into_iter().collect();

        let snapshot = health::aggregate(&plan, raw);
        for (name, report) in &snapshot.components {
            self.states.record_health(name, report.clone());
        }
        tracing::debug!(status = %snapshot.status, "Health aggregated");
        snapshot
    }

    async fn probe(&self, name: &str, deadline: &Deadline) -> HealthReport {
        if self.states.phase_of(name) != Some(LifecyclePhase::Running) {
            return HealthReport::unknown("component is not running");
        }
        let Some(descriptor) = self.registry.lookup(name) else {
            return HealthReport::unknown("component is not registered");
        };
        let Some(handler) = descriptor.handlers().health.clone() else {
            return HealthReport::healthy();
        };
        let instance = self
            .started
            .get(name)
            .map(|e| e.value().clone())
            .or_else(|| self.container.cached(name));
        let Some(instance) = instance else {
            return HealthReport::unknown("no live instance");
        };
        if deadline.is_expired() {
            return HealthReport::unknown("health probe cancelled");
        }

        let timeout = descriptor.policy().timeout;
        let span = tracing::debug_span!("component", name = %name, action = %HandlerAction::Health);
        let call = handler(instance.value().clone()).instrument(span);
        tokio::select! {
            res = tokio::time::timeout(timeout, call) => match res {
                Ok(Ok(report)) => report,
                Ok(Err(err)) => HealthReport::unhealthy(format!("{err:#}")),
                Err(_) => HealthReport::unhealthy(format!("health probe timed out after {timeout:?}")),
            },
            _ = deadline.expired() => HealthReport::unknown("health probe cancelled"),
        }
    }

    fn descriptor(&self, name: &str) -> Result<Arc<ComponentDescriptor>, LifecycleError> {
        self.registry
            .lookup(name)
            .ok_or_else(|| LifecycleError::Resolve {
                component: name.to_string(),
                source: ResolveError::UnregisteredDependency {
                    name: name.to_string(),
                },
            })
    }
}

fn check(deadline: &Deadline, phase: LifecyclePhase) -> Result<(), LifecycleError> {
    if deadline.is_expired() {
        tracing::warn!(%phase, "Deadline reached");
        return Err(LifecycleError::Cancelled { phase });
    }
    Ok(())
}
