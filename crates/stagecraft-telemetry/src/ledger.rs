//! Telemetry ledger
//!
//! Provides [`TelemetryLedger`], a counter store keyed by
//! `(tenant, stage, route)`. Counters only grow. The whole ledger is cleared
//! once, by [`TelemetryLedger::dispose`], after which it refuses new records.
//!
//! `record` never awaits: the read-modify-write of a counter happens under
//! the map shard lock, so interleaved runs cannot lose updates. Records share
//! a read gate that `dispose` takes exclusively, so no counter is written
//! after the ledger is cleared.

use crate::snapshot::{LedgerSnapshot, TelemetryMetric};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use stagecraft_kernel::lease::{Lease, LeaseCounter, Leasable};
use stagecraft_kernel::{Stage, TenantId};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Lease held by a run on a shared ledger
pub type LedgerLease = Lease<TelemetryLedger>;

/// Ledger failure
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LedgerError {
    /// Ledger has been disposed
    #[error("telemetry ledger is disposed")]
    Disposed,
}

/// Counter key
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MetricKey {
    /// Tenant
    pub tenant: TenantId,
    /// Stage
    pub stage: Stage,
    /// Route label
    pub route: String,
}

#[derive(Debug, Clone, Copy)]
struct Counter {
    count: u64,
    last_seen: DateTime<Utc>,
}

/// Append-only counter store shared by every run
#[derive(Debug, Default)]
pub struct TelemetryLedger {
    counters: DashMap<MetricKey, Counter>,
    gate: RwLock<()>,
    disposed: AtomicBool,
    leases: LeaseCounter,
}

impl TelemetryLedger {
    /// Create empty ledger
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment `(tenant, stage, route)` stamped with the current time
    ///
    /// # Errors
    /// Returns [`LedgerError::Disposed`] once the ledger is disposed.
    pub fn record(&self, tenant: &TenantId, stage: &Stage, route: &str) -> Result<u64, LedgerError> {
        self.record_at(tenant, stage, route, Utc::now())
    }

    /// Increment `(tenant, stage, route)` stamped with `at`
    ///
    /// Returns the new count. `last_seen` never moves backwards.
    ///
    /// # Errors
    /// Returns [`LedgerError::Disposed`] once the ledger is disposed.
    pub fn record_at(
        &self,
        tenant: &TenantId,
        stage: &Stage,
        route: &str,
        at: DateTime<Utc>,
    ) -> Result<u64, LedgerError> {
        let _open = self.gate.read();
        if self.is_disposed() {
            return Err(LedgerError::Disposed);
        }

        let key = MetricKey {
            tenant: tenant.clone(),
            stage: stage.clone(),
            route: route.to_string(),
        };
        let mut counter = self.counters.entry(key).or_insert(Counter {
            count: 0,
            last_seen: at,
        });
        counter.count += 1;
        if at > counter.last_seen {
            counter.last_seen = at;
        }
        Ok(counter.count)
    }

    /// Point-in-time snapshot of a tenant's counters
    #[must_use]
    pub fn snapshot(&self, tenant: &TenantId) -> LedgerSnapshot {
        LedgerSnapshot::from_metrics(tenant.clone(), None, self.metrics(tenant))
    }

    /// Snapshot restricted to counters touched at or after `since`
    #[must_use]
    pub fn snapshot_since(&self, tenant: &TenantId, since: DateTime<Utc>) -> LedgerSnapshot {
        let metrics = self
            .metrics(tenant)
            .into_iter()
            .filter(|m| m.last_seen >= since)
            .collect();
        LedgerSnapshot::from_metrics(tenant.clone(), Some(since), metrics)
    }

    /// All counters of a tenant, sorted by key
    #[must_use]
    pub fn metrics(&self, tenant: &TenantId) -> Vec<TelemetryMetric> {
        let mut metrics: Vec<TelemetryMetric> = self
            .counters
            .iter()
            .filter(|entry| &entry.key().tenant == tenant)
            .map(|entry| TelemetryMetric::from_entry(entry.key(), entry.count, entry.last_seen))
            .collect();
        metrics.sort_by(|a, b| (&a.stage, &a.route).cmp(&(&b.stage, &b.route)));
        metrics
    }

    /// Single counter lookup
    #[must_use]
    pub fn metric(&self, tenant: &TenantId, stage: &Stage, route: &str) -> Option<TelemetryMetric> {
        let key = MetricKey {
            tenant: tenant.clone(),
            stage: stage.clone(),
            route: route.to_string(),
        };
        self.counters
            .get(&key)
            .map(|c| TelemetryMetric::from_entry(&key, c.count, c.last_seen))
    }

    /// Tenants with at least one counter
    #[must_use]
    pub fn tenants(&self) -> BTreeSet<TenantId> {
        self.counters.iter().map(|e| e.key().tenant.clone()).collect()
    }

    /// Number of distinct counters
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.counters.len()
    }

    /// Check if no counter exists
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }

    /// Clear every counter and stop accepting records
    ///
    /// Idempotent. Returns `true` only for the call that disposed.
    pub fn dispose(&self) -> bool {
        let _closed = self.gate.write();
        if self.disposed.swap(true, Ordering::AcqRel) {
            tracing::debug!("telemetry ledger already disposed");
            return false;
        }
        let cleared = self.counters.len();
        self.counters.clear();
        tracing::info!(cleared, "telemetry ledger disposed");
        true
    }

    /// Whether [`TelemetryLedger::dispose`] has run
    #[inline]
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Lease this ledger for a run
    #[must_use]
    pub fn lease(self: &Arc<Self>) -> LedgerLease {
        Lease::acquire(Arc::clone(self))
    }

    /// Runs currently holding a lease
    #[inline]
    #[must_use]
    pub fn active_leases(&self) -> usize {
        self.leases.active()
    }
}

impl Leasable for TelemetryLedger {
    fn lease_counter(&self) -> &LeaseCounter {
        &self.leases
    }

    fn resource_name(&self) -> &'static str {
        "telemetry-ledger"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn tenant(id: &str) -> TenantId {
        TenantId::new(id).unwrap()
    }

    fn stage(name: &str) -> Stage {
        Stage::new(name).unwrap()
    }

    #[test]
    fn record_increments_counter() {
        let ledger = TelemetryLedger::new();
        let t = tenant("T");
        for expected in 1..=3 {
            assert_eq!(ledger.record(&t, &stage("ingest"), "r1").unwrap(), expected);
        }
        let snapshot = ledger.snapshot(&t);
        assert_eq!(snapshot.by_stage[&stage("ingest")], 3);
        assert_eq!(snapshot.total, 3);
    }

    #[test]
    fn tenants_are_isolated() {
        let ledger = TelemetryLedger::new();
        ledger.record(&tenant("a"), &stage("ingest"), "r").unwrap();
        ledger.record(&tenant("b"), &stage("ingest"), "r").unwrap();
        ledger.record(&tenant("b"), &stage("ingest"), "r").unwrap();

        assert_eq!(ledger.snapshot(&tenant("a")).total, 1);
        assert_eq!(ledger.snapshot(&tenant("b")).total, 2);
        assert_eq!(ledger.snapshot(&tenant("c")).total, 0);
        assert_eq!(ledger.tenants().len(), 2);
    }

    #[test]
    fn last_seen_never_moves_backwards() {
        let ledger = TelemetryLedger::new();
        let t = tenant("T");
        let now = Utc::now();
        ledger.record_at(&t, &stage("ingest"), "r", now).unwrap();
        ledger
            .record_at(&t, &stage("ingest"), "r", now - Duration::seconds(30))
            .unwrap();

        let metric = ledger.metric(&t, &stage("ingest"), "r").unwrap();
        assert_eq!(metric.count, 2);
        assert_eq!(metric.last_seen, now);
    }

    #[test]
    fn windowed_snapshot_filters_stale_counters() {
        let ledger = TelemetryLedger::new();
        let t = tenant("T");
        let now = Utc::now();
        ledger
            .record_at(&t, &stage("ingest"), "old", now - Duration::minutes(10))
            .unwrap();
        ledger.record_at(&t, &stage("analyze"), "new", now).unwrap();
        ledger.record_at(&t, &stage("analyze"), "new", now).unwrap();

        let window = ledger.snapshot_since(&t, now - Duration::minutes(1));
        assert_eq!(window.total, 2);
        assert!(!window.by_stage.contains_key(&stage("ingest")));
        assert_eq!(window.since, Some(now - Duration::minutes(1)));

        assert_eq!(ledger.snapshot(&t).total, 3);
    }

    #[test]
    fn dispose_is_idempotent_and_terminal() {
        let ledger = TelemetryLedger::new();
        let t = tenant("T");
        ledger.record(&t, &stage("ingest"), "r").unwrap();

        assert!(ledger.dispose());
        assert!(!ledger.dispose());
        assert!(ledger.is_empty());
        assert!(ledger.is_disposed());
        assert_eq!(
            ledger.record(&t, &stage("ingest"), "r"),
            Err(LedgerError::Disposed)
        );
        assert_eq!(ledger.snapshot(&t).total, 0);
    }

    #[test]
    fn leases_are_counted() {
        let ledger = Arc::new(TelemetryLedger::new());
        let a = ledger.lease();
        let b = ledger.lease();
        assert_eq!(ledger.active_leases(), 2);
        drop(a);
        drop(b);
        assert_eq!(ledger.active_leases(), 0);
    }
}
