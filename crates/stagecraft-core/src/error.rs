//! Run-time errors

use crate::config::ConfigError;
use crate::event::LifecycleEvent;
use crate::run::StateError;
use stagecraft_kernel::{PluginId, RunId, Stage, TopologyError};

/// Orchestrator could not be built
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    /// Configuration out of range
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Plugins cannot be ordered
    #[error(transparent)]
    Topology(#[from] TopologyError),
}

/// Why a run ended in `errored`
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    /// A plugin returned an error
    #[error("plugin {plugin_id} failed in stage {stage}: {cause}")]
    PluginExecution {
        /// Stage being executed
        stage: Stage,
        /// Failing plugin
        plugin_id: PluginId,
        /// Fault reported by the plugin
        #[source]
        cause: anyhow::Error,
    },

    /// Cancellation observed before a stage started
    #[error("run cancelled{}", .before.as_ref().map(|s| format!(" before stage {s}")).unwrap_or_default())]
    Cancelled {
        /// Stage that was about to start
        before: Option<Stage>,
    },

    /// Input shape does not fit the mode
    #[error("invalid input for {mode} mode: {reason}")]
    InvalidInput {
        /// Mode label
        mode: &'static str,
        /// Mismatch description
        reason: String,
    },

    /// Internal state machine violation
    #[error(transparent)]
    State(#[from] StateError),
}

impl RunError {
    /// Whether the run was cancelled
    #[inline]
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}

/// Failed run with everything observed before the failure
#[derive(Debug, thiserror::Error)]
#[error("run {run_id} errored: {error}")]
pub struct OrchestratorError {
    /// Run that failed
    pub run_id: RunId,
    /// Cause
    #[source]
    pub error: RunError,
    /// Events emitted before the run ended
    pub events: Vec<LifecycleEvent>,
    /// Stages visited before the run ended
    pub stage_count: usize,
    /// Wall time in milliseconds
    pub elapsed_ms: u64,
}

impl OrchestratorError {
    /// Whether the run was cancelled
    #[inline]
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.error.is_cancelled()
    }

    /// `(stage, plugin)` of a plugin failure
    #[must_use]
    pub fn failed_plugin(&self) -> Option<(&Stage, &PluginId)> {
        match &self.error {
            RunError::PluginExecution {
                stage, plugin_id, ..
            } => Some((stage, plugin_id)),
            _ => None,
        }
    }
}
