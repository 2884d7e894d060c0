//! Lifecycle events
//!
//! [`EventLog`] is the per-run, append-only list of lifecycle events. It
//! assigns sequence numbers and clamps timestamps so `at` never decreases
//! within a run, even if the clock steps backwards.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use stagecraft_kernel::{PluginId, RunId, Stage, TenantId};
use std::fmt;

/// Lifecycle event kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Run or plugin started
    Started,
    /// Plugin produced output
    Completed,
    /// Plugin failed
    Failed,
    /// Stage had no eligible plugin
    Skipped,
}

impl EventKind {
    /// Lowercase name
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry in a run's event list
///
/// The run-started marker has `stage == None`; every other event names a
/// stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecycleEvent {
    /// Position within the run, from zero
    pub seq: u64,
    /// Event kind
    pub kind: EventKind,
    /// Stage, `None` for the run marker
    pub stage: Option<Stage>,
    /// Plugin, if one was involved
    pub plugin_id: Option<PluginId>,
    /// Emission time
    pub at: DateTime<Utc>,
    /// Free-form detail
    pub detail: Option<String>,
}

impl LifecycleEvent {
    /// Whether this is the run-started marker
    #[inline]
    #[must_use]
    pub fn is_run_marker(&self) -> bool {
        self.stage.is_none()
    }
}

/// Event tagged with its run, as handed to a publisher
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Run that emitted the event
    pub run_id: RunId,
    /// Tenant of the run
    pub tenant: TenantId,
    /// The event
    pub event: LifecycleEvent,
}

#[derive(Debug, Default)]
struct LogInner {
    events: Vec<LifecycleEvent>,
    last_at: Option<DateTime<Utc>>,
}

/// Append-only event list of one run
#[derive(Debug, Default)]
pub struct EventLog {
    inner: Mutex<LogInner>,
}

impl EventLog {
    /// Create empty log
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an event and return a copy of what was stored
    pub fn append(
        &self,
        kind: EventKind,
        stage: Option<Stage>,
        plugin_id: Option<PluginId>,
        at: DateTime<Utc>,
        detail: Option<String>,
    ) -> LifecycleEvent {
        let mut guard = self.inner.lock();
        let at = match guard.last_at {
            Some(last) if at < last => last,
            _ => at,
        };
        guard.last_at = Some(at);
        let event = LifecycleEvent {
            seq: guard.events.len() as u64,
            kind,
            stage,
            plugin_id,
            at,
            detail,
        };
        guard.events.push(event.clone());
        event
    }

    /// Copy of the events so far
    #[must_use]
    pub fn events(&self) -> Vec<LifecycleEvent> {
        self.inner.lock().events.clone()
    }

    /// Number of events
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().events.len()
    }

    /// Check if no event was appended
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().events.is_empty()
    }

    /// Take the events, consuming the log
    #[must_use]
    pub fn into_events(self) -> Vec<LifecycleEvent> {
        self.inner.into_inner().events
    }
}
