//! Build-time error types
//!
//! Everything here is raised while assembling a registry or a plan, before
//! any run starts. None of these are retried: the caller fixes the input and
//! rebuilds.

use crate::id::{PluginId, Stage};
use std::collections::BTreeSet;

/// Identifier validation failure
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdError {
    /// Identifier is empty
    #[error("{kind} must not be empty")]
    Empty {
        /// Identifier kind
        kind: &'static str,
    },

    /// Identifier exceeds the maximum length
    #[error("{kind} is {len} bytes long, limit is {}", crate::id::MAX_ID_LEN)]
    TooLong {
        /// Identifier kind
        kind: &'static str,
        /// Actual length
        len: usize,
    },

    /// Identifier contains a character outside the allowed set
    #[error("{kind} contains invalid character {ch:?}")]
    InvalidChar {
        /// Identifier kind
        kind: &'static str,
        /// Offending character
        ch: char,
    },

    /// Identifier could not be parsed
    #[error("malformed {kind}")]
    Malformed {
        /// Identifier kind
        kind: &'static str,
    },
}

/// Registration failure
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    /// A plugin with this id is already registered
    #[error("plugin {0} is already registered")]
    DuplicateId(PluginId),
}

/// Batch registration aborted part way through
///
/// The registry keeps the `registered` plugins that went in before the
/// failure. It is not rolled back; discard it and build a new one.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("bootstrap aborted at plugin #{failed_at} after {registered} registrations: {source}")]
pub struct BootstrapError {
    /// Number of plugins registered by this batch before the failure
    pub registered: usize,
    /// Index within the batch of the plugin that failed
    pub failed_at: usize,
    /// Underlying registration error
    #[source]
    pub source: RegistryError,
}

/// Topology construction failure
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TopologyError {
    /// Ordering could not cover every stage
    #[error("cycle detected among stages {}", join(residual))]
    CycleDetected {
        /// Stages left with non-zero in-degree
        residual: BTreeSet<Stage>,
    },

    /// An edge names a stage no plugin is registered under
    #[error("edge {from} -> {to} references unknown stage {missing}")]
    UnknownEdgeEndpoint {
        /// Edge source
        from: Stage,
        /// Edge target
        to: Stage,
        /// The endpoint that has no registered plugin
        missing: Stage,
    },

    /// A plugin depends on a plugin id that is not registered
    #[error("plugin {plugin} depends on unregistered plugin {missing}")]
    UnknownDependency {
        /// Declaring plugin
        plugin: PluginId,
        /// Missing dependency
        missing: PluginId,
    },

    /// Invalid builder setting
    #[error("max_fan_out must be at least 1")]
    InvalidFanOut,
}

impl TopologyError {
    /// Residual stages for a cycle error, if this is one
    #[must_use]
    pub fn residual(&self) -> Option<&BTreeSet<Stage>> {
        match self {
            Self::CycleDetected { residual } => Some(residual),
            _ => None,
        }
    }
}

fn join(stages: &BTreeSet<Stage>) -> String {
    let names: Vec<&str> = stages.iter().map(Stage::as_str).collect();
    format!("{{{}}}", names.join(", "))
}
