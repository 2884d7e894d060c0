//! Ledger read models

use crate::ledger::MetricKey;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use stagecraft_kernel::{Stage, TenantId};
use std::collections::BTreeMap;

/// Number of entries in [`LedgerSnapshot::top5`]
pub const TOP_N: usize = 5;

/// One counter as seen by readers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetryMetric {
    /// Tenant
    pub tenant_id: TenantId,
    /// Stage
    pub stage: Stage,
    /// Route label
    pub route: String,
    /// Times recorded
    pub count: u64,
    /// Most recent record time
    pub last_seen: DateTime<Utc>,
}

impl TelemetryMetric {
    pub(crate) fn from_entry(key: &MetricKey, count: u64, last_seen: DateTime<Utc>) -> Self {
        Self {
            tenant_id: key.tenant.clone(),
            stage: key.stage.clone(),
            route: key.route.clone(),
            count,
            last_seen,
        }
    }
}

/// Aggregated view of one tenant's counters
///
/// All fields derive from the same set of metrics, so `total` always equals
/// the sum of `by_stage` (and of `by_route`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerSnapshot {
    /// Tenant
    pub tenant: TenantId,
    /// Window start for windowed snapshots
    pub since: Option<DateTime<Utc>>,
    /// Sum of all counters
    pub total: u64,
    /// Per-stage sums
    pub by_stage: BTreeMap<Stage, u64>,
    /// Per-route sums
    pub by_route: BTreeMap<String, u64>,
    /// Highest `(stage, route)` counters, count desc then stage/route asc
    pub top5: Vec<TelemetryMetric>,
}

impl LedgerSnapshot {
    pub(crate) fn from_metrics(
        tenant: TenantId,
        since: Option<DateTime<Utc>>,
        mut metrics: Vec<TelemetryMetric>,
    ) -> Self {
        let mut total = 0u64;
        let mut by_stage: BTreeMap<Stage, u64> = BTreeMap::new();
        let mut by_route: BTreeMap<String, u64> = BTreeMap::new();
        for metric in &metrics {
            total += metric.count;
            *by_stage.entry(metric.stage.clone()).or_default() += metric.count;
            *by_route.entry(metric.route.clone()).or_default() += metric.count;
        }

        metrics.sort_by(|a, b| {
            b.count
                .cmp(&a.count)
                .then_with(|| a.stage.cmp(&b.stage))
                .then_with(|| a.route.cmp(&b.route))
        });
        metrics.truncate(TOP_N);

        Self {
            tenant,
            since,
            total,
            by_stage,
            by_route,
            top5: metrics,
        }
    }

    /// Count for a stage, zero if absent
    #[must_use]
    pub fn stage_count(&self, stage: &Stage) -> u64 {
        self.by_stage.get(stage).copied().unwrap_or_default()
    }

    /// Count for a route, zero if absent
    #[must_use]
    pub fn route_count(&self, route: &str) -> u64 {
        self.by_route.get(route).copied().unwrap_or_default()
    }
}
