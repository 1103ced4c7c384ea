//! Lifecycle phase and per-component state tracking

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;

use crate::contracts::HealthReport;
use crate::descriptor::ComponentDescriptor;

/// Process-wide (and per-component) lifecycle phase. Strictly monotonic.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecyclePhase {
    Startup,
    Running,
    Shutdown,
    Stopped,
}

impl std::fmt::Display for LifecyclePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            LifecyclePhase::Startup => "startup",
            LifecyclePhase::Running => "running",
            LifecyclePhase::Shutdown => "shutdown",
            LifecyclePhase::Stopped => "stopped",
        })
    }
}

/// Per-component record, readable at any time through the host.
#[derive(Clone, Debug, Serialize)]
pub struct ComponentState {
    pub phase: LifecyclePhase,
    pub health: Option<HealthReport>,
    pub started_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub dependencies: Vec<String>,
    pub priority: i32,
    pub error: Option<String>,
}

impl ComponentState {
    fn new(descriptor: &ComponentDescriptor) -> Self {
        Self {
            phase: LifecyclePhase::Startup,
            health: None,
            started_at: None,
            stopped_at: None,
            dependencies: descriptor.dependency_names().map(str::to_string).collect(),
            priority: descriptor.priority(),
            error: None,
        }
    }
}

/// Component states keyed by name; each entry is individually locked.
#[derive(Default)]
pub(crate) struct StateTable {
    inner: DashMap<String, Arc<RwLock<ComponentState>>>,
}

impl StateTable {
    pub fn ensure(&self, descriptor: &ComponentDescriptor) {
        self.inner
            .entry(descriptor.name().to_string())
            .or_insert_with(|| Arc::new(RwLock::new(ComponentState::new(descriptor))));
    }

    pub fn get(&self, name: &str) -> Option<ComponentState> {
        self.inner.get(name).map(|e| e.value().read().clone())
    }

    pub fn phase_of(&self, name: &str) -> Option<LifecyclePhase> {
        self.inner.get(name).map(|e| e.value().read().phase)
    }

    pub fn update(&self, name: &str, f: impl FnOnce(&mut ComponentState)) {
        // clone the handle first so no shard lock is held while mutating
        let entry = self.inner.get(name).map(|e| Arc::clone(e.value()));
        if let Some(state) = entry {
            f(&mut state.write());
        }
    }

    pub fn snapshot(&self) -> Vec<(String, ComponentState)> {
        let mut all: Vec<_> = self
            .inner
            .iter()
            .map(|e| (e.key().clone(), e.value().read().clone()))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }

    pub fn mark_running(&self, name: &str) {
        self.update(name, |s| {
            s.phase = LifecyclePhase::Running;
            s.started_at = Some(Utc::now());
            s.stopped_at = None;
            s.error = None;
        });
    }

    pub fn mark_stopped(&self, name: &str, error: Option<String>) {
        self.update(name, |s| {
            s.phase = LifecyclePhase::Stopped;
            s.stopped_at = Some(Utc::now());
            if error.is_some() {
                s.error = error;
            }
        });
    }

    pub fn record_error(&self, name: &str, error: String) {
        self.update(name, |s| s.error = Some(error));
    }

    pub fn record_health(&self, name: &str, report: HealthReport) {
        self.update(name, |s| s.health = Some(report));
    }
}

/// Monotonic holder for the host-wide phase.
pub(crate) struct PhaseCell {
    inner: Mutex<LifecyclePhase>,
}

impl Default for PhaseCell {
    fn default() -> Self {
        Self {
            inner: Mutex::new(LifecyclePhase::Startup),
        }
    }
}

impl PhaseCell {
    pub fn get(&self) -> LifecyclePhase {
        *self.inner.lock()
    }

    /// Move forward to `to`. Moving to the current phase is a no-op; moving back is refused.
    pub fn advance(&self, to: LifecyclePhase) -> Result<(), (LifecyclePhase, LifecyclePhase)> {
        let mut phase = self.inner.lock();
        if to < *phase {
            return Err((*phase, to));
        }
        if to != *phase {
            tracing::info!("Phase: {to}");
            *phase = to;
        }
        Ok(())
    }
}
