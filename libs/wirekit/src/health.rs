//! Health aggregation across the dependency graph.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::contracts::{HealthReport, HealthStatus};
use crate::graph::ExecutionPlan;

/// Point-in-time health of every registered component plus the overall status.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub status: HealthStatus,
    pub components: BTreeMap<String, HealthReport>,
}

impl HealthSnapshot {
    pub fn get(&self, name: &str) -> Option<&HealthReport> {
        self.components.get(name)
    }

    pub fn status_of(&self, name: &str) -> Option<HealthStatus> {
        self.get(name).map(|r| r.status)
    }

    /// Every component reported `Unknown` with the same message.
    pub(crate) fn all_unknown<'a>(names: impl IntoIterator<Item = &'a str>, message: &str) -> Self {
        let components: BTreeMap<String, HealthReport> = names
            .into_iter()
            .map(|n| (n.to_string(), HealthReport::unknown(message)))
            .collect();
        let status = if components.is_empty() {
            HealthStatus::Healthy
        } else {
            HealthStatus::Unknown
        };
        Self { status, components }
    }
}

/// Fold raw probe results along the plan.
///
/// Walking in start order means every dependency's effective status is final
/// before its dependents are looked at, which makes the cap transitive.
pub fn aggregate(plan: &ExecutionPlan, mut raw: HashMap<String, HealthReport>) -> HealthSnapshot {
    let mut effective: BTreeMap<String, HealthReport> = BTreeMap::new();

    for name in plan.start_order() {
        let mut report = raw
            .remove(name.as_str())
            .unwrap_or_else(|| HealthReport::unknown("component was not probed"));

        if report.status == HealthStatus::Healthy {
            let impaired: Vec<(&str, HealthStatus)> = plan
                .dependencies_of(name)
                .iter()
                .filter_map(|dep| effective.get(dep).map(|r| (dep.as_str(), r.status)))
                .filter(|(_, status)| status.is_impaired())
                .collect();

            if let Some((first, status)) = impaired.first() {
                report.status = HealthStatus::Degraded;
                if report.message.is_none() {
                    report.message = Some(format!("dependency '{first}' is {status}"));
                }
                report.details.insert(
                    "impaired_dependencies".to_string(),
                    serde_json::Value::from(
                        impaired.iter().map(|(n, _)| n.to_string()).collect::<Vec<_>>(),
                    ),
                );
            }
        }

        effective.insert(name.clone(), report);
    }

    let status = overall(effective.values().map(|r| r.status));
    HealthSnapshot {
        status,
        components: effective,
    }
}

/// Worst status by severity; an empty graph is healthy.
pub fn overall(statuses: impl IntoIterator<Item = HealthStatus>) -> HealthStatus {
    statuses
        .into_iter()
        .max_by_key(|s| s.severity())
        .unwrap_or(HealthStatus::Healthy)
}
