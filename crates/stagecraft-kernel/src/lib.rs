//! Stagecraft Kernel
//!
//! Build-time half of the engine:
//! 1. **Registry**: plugin set with unique ids, indexed by stage
//! 2. **Topology**: deterministic stage order with cycle diagnostics
//!
//! Everything here runs before a run starts and fails synchronously. The
//! run-time half lives in `stagecraft-core`.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use stagecraft_kernel::prelude::*;
//!
//! let mut registry = Registry::new();
//! registry.register(FnPlugin::sync(
//!     PluginManifest::new(PluginId::new("reader")?, Stage::new("ingest")?),
//!     |input| Ok(input),
//! ))?;
//!
//! let plan = TopologyBuilder::new(&registry).build()?;
//! assert_eq!(plan.ordered_stages.len(), 1);
//! ```

pub mod error;
pub mod id;
pub mod lease;
pub mod plugin;
pub mod registry;
pub mod topology;

// Re-exports
pub use error::{BootstrapError, IdError, RegistryError, TopologyError};
pub use id::{Capability, PluginId, RunId, Stage, TenantId};
pub use lease::{Disposable, DisposalError, Lease, LeaseCounter, Leasable};
pub use plugin::{FnPlugin, Payload, Plugin, PluginManifest, StageContext};
pub use registry::{Registry, RegistryLease};
pub use topology::{
    build_topology, Edge, ExecutionPlan, PlanDiagnostics, TopologyBuilder, TopologyOptions,
    DEFAULT_MAX_FAN_OUT,
};

/// Common imports
pub mod prelude {
    pub use crate::{
        Capability, Edge, ExecutionPlan, FnPlugin, Payload, Plugin, PluginId, PluginManifest,
        Registry, RunId, Stage, StageContext, TenantId, TopologyBuilder, TopologyOptions,
    };
}

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
