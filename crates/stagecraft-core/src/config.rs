//! Engine configuration

use serde::{Deserialize, Serialize};
use stagecraft_kernel::{TopologyOptions, DEFAULT_MAX_FAN_OUT};

/// Default bound of the phase output queue
pub const DEFAULT_PHASE_QUEUE_CAPACITY: usize = 32;

/// Configuration error
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// TOML could not be parsed
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    /// A value is out of range
    #[error("invalid value for {field}: {reason}")]
    Invalid {
        /// Offending field
        field: &'static str,
        /// Why it was rejected
        reason: &'static str,
    },
}

/// Orchestrator configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Out-degree above which a stage is reported as a fork
    pub max_fan_out: usize,
    /// Accept cyclic graphs, running only the orderable part
    pub allow_cycles: bool,
    /// Bound of the phase output queue
    pub phase_queue_capacity: usize,
    /// Forward lifecycle events to the publisher
    pub publish_events: bool,
    /// Save finished runs to the store
    pub persist_runs: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_fan_out: DEFAULT_MAX_FAN_OUT,
            allow_cycles: false,
            phase_queue_capacity: DEFAULT_PHASE_QUEUE_CAPACITY,
            publish_events: true,
            persist_runs: true,
        }
    }
}

impl EngineConfig {
    /// Create default config
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// With fork threshold
    #[inline]
    #[must_use]
    pub fn with_max_fan_out(mut self, max: usize) -> Self {
        self.max_fan_out = max;
        self
    }

    /// With cycle tolerance
    #[inline]
    #[must_use]
    pub fn with_allow_cycles(mut self, allow: bool) -> Self {
        self.allow_cycles = allow;
        self
    }

    /// With phase queue bound
    #[inline]
    #[must_use]
    pub fn with_phase_queue_capacity(mut self, capacity: usize) -> Self {
        self.phase_queue_capacity = capacity;
        self
    }

    /// With event publication toggle
    #[inline]
    #[must_use]
    pub fn with_publish_events(mut self, publish: bool) -> Self {
        self.publish_events = publish;
        self
    }

    /// With run persistence toggle
    #[inline]
    #[must_use]
    pub fn with_persist_runs(mut self, persist: bool) -> Self {
        self.persist_runs = persist;
        self
    }

    /// Parse and validate a TOML document
    ///
    /// Missing keys take their defaults.
    ///
    /// # Errors
    /// Returns [`ConfigError`] on malformed TOML or out-of-range values.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges
    ///
    /// # Errors
    /// Returns [`ConfigError::Invalid`] naming the first bad field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_fan_out == 0 {
            return Err(ConfigError::Invalid {
                field: "max_fan_out",
                reason: "must be at least 1",
            });
        }
        if self.phase_queue_capacity == 0 {
            return Err(ConfigError::Invalid {
                field: "phase_queue_capacity",
                reason: "must be at least 1",
            });
        }
        Ok(())
    }

    /// Topology options derived from this config
    #[must_use]
    pub fn topology_options(&self) -> TopologyOptions {
        TopologyOptions {
            allow_cycles: self.allow_cycles,
            max_fan_out: self.max_fan_out,
        }
    }
}
