use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

/// Health of a single component as reported by its probe (or folded from its dependencies).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
    Unknown,
}

impl HealthStatus {
    /// Ordering used when summarising a whole graph: higher is worse.
    pub fn severity(self) -> u8 {
        match self {
            HealthStatus::Healthy => 0,
            HealthStatus::Unknown => 1,
            HealthStatus::Degraded => 2,
            HealthStatus::Unhealthy => 3,
        }
    }

    /// True for statuses that pull dependents down.
    pub fn is_impaired(self) -> bool {
        matches!(self, HealthStatus::Degraded | HealthStatus::Unhealthy)
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
            HealthStatus::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Result of a health probe.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub details: BTreeMap<String, serde_json::Value>,
}

impl HealthReport {
    pub fn new(status: HealthStatus) -> Self {
        Self {
            status,
            message: None,
            details: BTreeMap::new(),
        }
    }

    pub fn healthy() -> Self {
        Self::new(HealthStatus::Healthy)
    }

    pub fn degraded(message: impl Into<String>) -> Self {
        Self::new(HealthStatus::Degraded).with_message(message)
    }

    pub fn unhealthy(message: impl Into<String>) -> Self {
        Self::new(HealthStatus::Unhealthy).with_message(message)
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(HealthStatus::Unknown).with_message(message)
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }
}

/// A managed component: start/stop transitions plus an on-demand health probe.
///
/// Every method has a no-op default so plain services only override what they need.
/// Register an implementor with [`DescriptorBuilder::with_lifecycle`](crate::DescriptorBuilder::with_lifecycle).
#[async_trait]
pub trait Component: Send + Sync + 'static {
    /// Bring the component up. Runs after every dependency has started.
    async fn start(&self, _cancel: CancellationToken) -> anyhow::Result<()> {
        Ok(())
    }

    /// Release resources. Runs before any dependency is stopped.
    async fn stop(&self, _cancel: CancellationToken) -> anyhow::Result<()> {
        Ok(())
    }

    /// Read-only probe; must not change the component's lifecycle phase.
    async fn health(&self) -> anyhow::Result<HealthReport> {
        Ok(HealthReport::healthy())
    }
}
