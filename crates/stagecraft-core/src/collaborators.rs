//! Collaborators consumed by signature only
//!
//! The orchestrator reads time from a [`Clock`], forwards lifecycle events to
//! a [`Publisher`], and hands finished runs to a [`Store`]. None of them is
//! required to run a pipeline.

use crate::event::{EventEnvelope, LifecycleEvent};
use crate::run::RunContext;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use stagecraft_kernel::{RunId, TenantId};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Source of wall-clock time
#[cfg_attr(test, mockall::automock)]
pub trait Clock: Send + Sync {
    /// Current time
    fn now(&self) -> DateTime<Utc>;
}

/// [`Clock`] backed by the system time
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Publication failure
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PublishError {
    /// Channel is gone
    #[error("publisher closed")]
    Closed,

    /// Downstream refused the event
    #[error("event rejected: {0}")]
    Rejected(String),
}

/// Sink for lifecycle events
///
/// Called synchronously from the run. Failures are logged by the caller and
/// never fail the run.
#[cfg_attr(test, mockall::automock)]
pub trait Publisher: Send + Sync {
    /// Publish one event
    ///
    /// # Errors
    /// Returns [`PublishError`] if the event could not be handed off.
    fn publish(&self, envelope: &EventEnvelope) -> Result<(), PublishError>;
}

/// Default broadcast capacity
const DEFAULT_CAPACITY: usize = 1024;

/// [`Publisher`] over a tokio broadcast channel
///
/// Events published with no subscriber are dropped.
#[derive(Clone)]
pub struct BroadcastPublisher {
    sender: broadcast::Sender<EventEnvelope>,
    published: Arc<AtomicUsize>,
}

impl BroadcastPublisher {
    /// Create with default capacity
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Create with `capacity` buffered events per subscriber
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            published: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Subscribe to events published from now on
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.sender.subscribe()
    }

    /// Current subscriber count
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Events published so far
    #[must_use]
    pub fn published(&self) -> usize {
        self.published.load(Ordering::Relaxed)
    }
}

impl Default for BroadcastPublisher {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for BroadcastPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BroadcastPublisher")
            .field("subscriber_count", &self.subscriber_count())
            .field("published", &self.published())
            .finish()
    }
}

impl Publisher for BroadcastPublisher {
    fn publish(&self, envelope: &EventEnvelope) -> Result<(), PublishError> {
        self.published.fetch_add(1, Ordering::Relaxed);
        // no subscriber is not an error
        let _ = self.sender.send(envelope.clone());
        Ok(())
    }
}

/// How a stored run ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum RunOutcome {
    /// Run produced output
    Completed,
    /// Run ended with an error
    Errored {
        /// Rendered error
        reason: String,
    },
}

impl RunOutcome {
    /// Whether the run completed
    #[inline]
    #[must_use]
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed)
    }
}

/// Persisted summary of a finished run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRecord {
    /// Run identity
    pub context: RunContext,
    /// How it ended
    pub outcome: RunOutcome,
    /// Full event list
    pub events: Vec<LifecycleEvent>,
    /// Stages visited
    pub stage_count: usize,
    /// Wall time in milliseconds
    pub elapsed_ms: u64,
}

/// Filter for [`Store::list`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunQuery {
    /// Only this tenant
    pub tenant: Option<TenantId>,
    /// Only completed (`true`) or errored (`false`) runs
    pub completed: Option<bool>,
    /// At most this many records
    pub limit: Option<usize>,
}

impl RunQuery {
    /// Match everything
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrict to a tenant
    #[inline]
    #[must_use]
    pub fn tenant(mut self, tenant: TenantId) -> Self {
        self.tenant = Some(tenant);
        self
    }

    /// Restrict by outcome
    #[inline]
    #[must_use]
    pub fn completed(mut self, completed: bool) -> Self {
        self.completed = Some(completed);
        self
    }

    /// Cap the result size
    #[inline]
    #[must_use]
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Whether `record` passes the tenant and outcome filters
    #[must_use]
    pub fn matches(&self, record: &RunRecord) -> bool {
        self.tenant
            .as_ref()
            .map_or(true, |t| &record.context.tenant_id == t)
            && self
                .completed
                .map_or(true, |c| record.outcome.is_completed() == c)
    }
}

/// Store failure
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Backend unavailable
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// Record could not be encoded
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Anything else the backend reports
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

/// Persistence for finished runs
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Store: Send + Sync {
    /// Persist a record, replacing any with the same run id
    async fn save(&self, record: RunRecord) -> Result<(), StoreError>;

    /// Fetch one record
    async fn get(&self, run_id: RunId) -> Result<Option<RunRecord>, StoreError>;

    /// Records matching `query`
    async fn list(&self, query: RunQuery) -> Result<Vec<RunRecord>, StoreError>;
}
