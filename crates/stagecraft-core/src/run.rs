//! Run context and run state machine

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use stagecraft_kernel::{PluginId, RunId, TenantId};
use std::collections::BTreeSet;
use std::fmt;

/// How a run walks the plan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "mode", content = "plugins")]
pub enum RunMode {
    /// Thread one payload through the first plugin of each stage
    Single,
    /// Fan independent signals out to the plugins of their stage
    Multi,
    /// Single restricted to a plugin subset
    Canary(BTreeSet<PluginId>),
}

impl RunMode {
    /// Canary over `ids`
    pub fn canary(ids: impl IntoIterator<Item = PluginId>) -> Self {
        Self::Canary(ids.into_iter().collect())
    }

    /// Short label, also used as the route prefix in telemetry
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Single => "single",
            Self::Multi => "multi",
            Self::Canary(_) => "canary",
        }
    }

    /// Whether `id` may run under this mode
    #[must_use]
    pub fn admits(&self, id: &PluginId) -> bool {
        match self {
            Self::Single | Self::Multi => true,
            Self::Canary(ids) => ids.contains(id),
        }
    }
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Per-invocation identity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunContext {
    /// Generated run id
    pub run_id: RunId,
    /// Tenant the run belongs to
    pub tenant_id: TenantId,
    /// Clock reading at run start
    pub started_at: DateTime<Utc>,
    /// Execution mode
    pub mode: RunMode,
}

impl RunContext {
    /// Create context with a fresh run id
    #[must_use]
    pub fn new(tenant_id: TenantId, mode: RunMode, started_at: DateTime<Utc>) -> Self {
        Self {
            run_id: RunId::new(),
            tenant_id,
            started_at,
            mode,
        }
    }
}

/// Orchestrator run state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    /// No run started
    #[default]
    Idle,
    /// Run in progress
    Running,
    /// Run finished with output
    Completed,
    /// Run finished with an error
    Errored,
}

impl RunState {
    /// Terminal states are only left by starting a new run
    #[inline]
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Errored)
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Errored => "errored",
        };
        f.write_str(s)
    }
}

/// Illegal state change
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("illegal run state transition {from} -> {to}")]
pub struct StateError {
    /// State before
    pub from: RunState,
    /// Requested state
    pub to: RunState,
}

/// States reachable from `from`
#[must_use]
pub fn allowed_transitions(from: RunState) -> &'static [RunState] {
    use RunState::{Completed, Errored, Idle, Running};
    match from {
        Idle => &[Running],
        Running => &[Completed, Errored],
        Completed | Errored => &[],
    }
}

/// Check a state change
///
/// # Errors
/// Returns [`StateError`] if `to` is not reachable from `from`.
pub fn validate_transition(from: RunState, to: RunState) -> Result<(), StateError> {
    if allowed_transitions(from).contains(&to) {
        Ok(())
    } else {
        Err(StateError { from, to })
    }
}

/// State of a single run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunStateMachine {
    state: RunState,
}

impl RunStateMachine {
    /// Start in [`RunState::Idle`]
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state
    #[inline]
    #[must_use]
    pub fn state(&self) -> RunState {
        self.state
    }

    /// Move to `to`
    ///
    /// # Errors
    /// Returns [`StateError`] and stays put on an illegal transition.
    pub fn advance(&mut self, to: RunState) -> Result<RunState, StateError> {
        validate_transition(self.state, to)?;
        tracing::trace!(from = %self.state, to = %to, "run state transition");
        self.state = to;
        Ok(to)
    }
}
