//! Testing utilities for the stagecraft workspace
//!
//! Closure plugin fixtures, a manual clock, an in-memory store and a
//! recording publisher.

#![allow(missing_docs)]

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use parking_lot::Mutex;
use serde_json::{json, Value};
use stagecraft_core::{
    CancellationToken, Clock, EventEnvelope, LifecycleEvent, PublishError, Publisher, RunQuery,
    RunRecord, Store, StoreError,
};
use stagecraft_kernel::{
    Disposable, DisposalError, FnPlugin, PluginId, PluginManifest, Registry, RunId, Stage,
    TenantId,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

pub fn pid(id: &str) -> PluginId {
    PluginId::new(id).unwrap()
}

pub fn stage(name: &str) -> Stage {
    Stage::new(name).unwrap()
}

pub fn tid(id: &str) -> TenantId {
    TenantId::new(id).unwrap()
}

pub fn init_test_tracing() {
    stagecraft_core::init_tracing(Some("debug"));
}

fn manifest(id: &str, stage_name: &str, deps: &[&str]) -> PluginManifest {
    deps.iter()
        .fold(PluginManifest::new(pid(id), stage(stage_name)), |m, dep| {
            m.depends_on(pid(dep))
        })
}

/// Plugin applying `op` to `value` and appending its id to `trail`
pub fn step_plugin(id: &str, stage_name: &str, deps: &[&str], op: fn(i64) -> i64) -> FnPlugin {
    let name = id.to_string();
    FnPlugin::sync(manifest(id, stage_name, deps), move |mut input: Value| {
        let value = input["value"].as_i64().unwrap_or_default();
        input["value"] = json!(op(value));
        if !input["trail"].is_array() {
            input["trail"] = json!([]);
        }
        if let Some(trail) = input["trail"].as_array_mut() {
            trail.push(json!(name));
        }
        Ok(input)
    })
}

/// Plugin returning its input untouched
pub fn passthrough_plugin(id: &str, stage_name: &str, deps: &[&str]) -> FnPlugin {
    FnPlugin::sync(manifest(id, stage_name, deps), Ok)
}

/// Plugin that always fails with `message`
pub fn failing_plugin(id: &str, stage_name: &str, deps: &[&str], message: &'static str) -> FnPlugin {
    FnPlugin::sync(manifest(id, stage_name, deps), move |_| Err(anyhow::anyhow!(message)))
}

/// Plugin that cancels `token` and then completes normally
pub fn cancelling_plugin(
    id: &str,
    stage_name: &str,
    deps: &[&str],
    token: CancellationToken,
) -> FnPlugin {
    FnPlugin::sync(manifest(id, stage_name, deps), move |input| {
        token.cancel();
        Ok(input)
    })
}

/// Plugin yielding to the scheduler `yields` times before passing through
pub fn yielding_plugin(id: &str, stage_name: &str, yields: usize) -> FnPlugin {
    FnPlugin::new(manifest(id, stage_name, &[]), move |_ctx, input| async move {
        for _ in 0..yields {
            yield_now().await;
        }
        Ok(input)
    })
}

/// Runtime-agnostic yield
async fn yield_now() {
    let mut yielded = false;
    std::future::poll_fn(|cx| {
        if yielded {
            std::task::Poll::Ready(())
        } else {
            yielded = true;
            cx.waker().wake_by_ref();
            std::task::Poll::Pending
        }
    })
    .await;
}

/// `ingest -> analyze -> resolve` with `+1`, `*10`, `-3`
///
/// `{"value": 1}` ends as `{"value": 17, "trail": ["A", "B", "C"]}`.
pub fn three_stage_registry() -> Registry {
    let mut registry = Registry::new();
    registry.register(step_plugin("A", "ingest", &[], |v| v + 1)).unwrap();
    registry
        .register(step_plugin("B", "analyze", &["A"], |v| v * 10))
        .unwrap();
    registry
        .register(step_plugin("C", "resolve", &["B"], |v| v - 3))
        .unwrap();
    registry
}

/// `"started:ingest"` style rendering of stage events
pub fn stage_trace(events: &[LifecycleEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|e| e.stage.as_ref().map(|s| format!("{}:{}", e.kind, s)))
        .collect()
}

/// Clock that only moves when told to
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        *self.now.lock() += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

/// In-memory [`Store`]
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Mutex<Vec<RunRecord>>,
    offline: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail with [`StoreError::Unavailable`]
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.offline.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("memory store offline".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn save(&self, record: RunRecord) -> Result<(), StoreError> {
        self.check()?;
        let mut records = self.records.lock();
        records.retain(|r| r.context.run_id != record.context.run_id);
        records.push(record);
        Ok(())
    }

    async fn get(&self, run_id: RunId) -> Result<Option<RunRecord>, StoreError> {
        self.check()?;
        Ok(self
            .records
            .lock()
            .iter()
            .find(|r| r.context.run_id == run_id)
            .cloned())
    }

    async fn list(&self, query: RunQuery) -> Result<Vec<RunRecord>, StoreError> {
        self.check()?;
        let records = self.records.lock();
        let matching = records.iter().filter(|r| query.matches(r)).cloned();
        Ok(match query.limit {
            Some(limit) => matching.take(limit).collect(),
            None => matching.collect(),
        })
    }
}

/// [`Publisher`] keeping everything it receives
#[derive(Debug, Default)]
pub struct RecordingPublisher {
    received: Mutex<Vec<EventEnvelope>>,
    reject: AtomicBool,
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject every event after recording it
    pub fn rejecting() -> Self {
        let publisher = Self::default();
        publisher.reject.store(true, Ordering::SeqCst);
        publisher
    }

    pub fn received(&self) -> Vec<EventEnvelope> {
        self.received.lock().clone()
    }
}

impl Publisher for RecordingPublisher {
    fn publish(&self, envelope: &EventEnvelope) -> Result<(), PublishError> {
        self.received.lock().push(envelope.clone());
        if self.reject.load(Ordering::SeqCst) {
            return Err(PublishError::Rejected("recording publisher rejects".into()));
        }
        Ok(())
    }
}

/// Disposable counting its releases into a shared counter
#[derive(Debug)]
pub struct CountingResource {
    label: String,
    releases: Arc<AtomicUsize>,
}

impl CountingResource {
    pub fn new(label: &str, releases: Arc<AtomicUsize>) -> Self {
        Self {
            label: label.to_string(),
            releases,
        }
    }
}

impl Disposable for CountingResource {
    fn label(&self) -> &str {
        &self.label
    }

    fn dispose(&mut self) -> Result<(), DisposalError> {
        self.releases.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
