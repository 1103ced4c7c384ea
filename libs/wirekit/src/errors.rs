//! Lifecycle error taxonomy. Registration and resolution errors live next to
//! the code that raises them and are re-exported here.

use std::time::Duration;

use thiserror::Error;

pub use crate::container::ResolveError;
pub use crate::registry::RegistryError;
use crate::runtime::LifecyclePhase;

/// Which handler an error came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandlerAction {
    Start,
    Stop,
    Health,
}

impl std::fmt::Display for HandlerAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            HandlerAction::Start => "start",
            HandlerAction::Stop => "stop",
            HandlerAction::Health => "health",
        })
    }
}

#[derive(Debug, Error)]
pub enum LifecycleError {
    /// The plan could not be built; no handler ran.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("failed to resolve component '{component}'")]
    Resolve {
        component: String,
        #[source]
        source: ResolveError,
    },

    #[error("{action} handler of '{component}' failed after {attempts} attempt(s)")]
    HandlerFailure {
        component: String,
        action: HandlerAction,
        attempts: u32,
        #[source]
        source: anyhow::Error,
    },

    #[error("{action} handler of '{component}' timed out after {timeout:?}")]
    Timeout {
        component: String,
        action: HandlerAction,
        timeout: Duration,
    },

    #[error("{phase} cancelled by deadline")]
    Cancelled { phase: LifecyclePhase },

    #[error("invalid lifecycle transition {from} -> {to}")]
    InvalidTransition {
        from: LifecyclePhase,
        to: LifecyclePhase,
    },

    #[error("{} component(s) failed to stop: {}", failures.len(), names(failures))]
    StopFailed { failures: Vec<StopFailure> },

    /// The deadline fired mid-shutdown after some stop handlers had already failed.
    #[error(
        "shutdown cancelled by deadline; {} component(s) failed to stop before that: {}",
        failures.len(),
        names(failures)
    )]
    StopCancelled { failures: Vec<StopFailure> },
}

impl LifecycleError {
    /// Per-component stop failures carried by this error.
    pub fn stop_failures(&self) -> &[StopFailure] {
        match self {
            LifecycleError::StopFailed { failures } | LifecycleError::StopCancelled { failures } => {
                failures
            }
            _ => &[],
        }
    }

    /// Component the error is attributed to, if any.
    pub fn component(&self) -> Option<&str> {
        match self {
            LifecycleError::Resolve { component, .. }
            | LifecycleError::HandlerFailure { component, .. }
            | LifecycleError::Timeout { component, .. } => Some(component),
            _ => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            LifecycleError::Cancelled { .. } | LifecycleError::StopCancelled { .. }
        )
    }
}

/// One entry of an aggregate stop failure.
#[derive(Debug)]
pub struct StopFailure {
    pub component: String,
    pub error: Box<LifecycleError>,
}

fn names(failures: &[StopFailure]) -> String {
    failures
        .iter()
        .map(|f| f.component.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Render an error with its full source chain on one line.
pub(crate) fn chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut out = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        out.push_str(": ");
        out.push_str(&cause.to_string());
        source = cause.source();
    }
    out
}
