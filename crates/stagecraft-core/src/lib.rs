//! Stagecraft Core
//!
//! Run-time half of the engine:
//! 1. **Orchestrator**: executes an execution plan in single, multi or canary mode
//! 2. **Execution scope**: releases leased resources on every exit path
//! 3. **Lifecycle events**: per-run ordered event list, mirrored into the
//!    telemetry ledger and an optional publisher
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use stagecraft_core::prelude::*;
//! use std::sync::Arc;
//!
//! let orchestrator = Orchestrator::new(Arc::new(registry), Arc::new(TelemetryLedger::new()))?;
//! let output = orchestrator
//!     .run(RunRequest::single(TenantId::new("acme")?, serde_json::json!({"value": 1})))
//!     .await?;
//! println!("{:?}", output.payload());
//! ```

pub mod collaborators;
pub mod config;
pub mod error;
pub mod event;
pub mod logging;
pub mod orchestrator;
pub mod run;
pub mod scope;

// Re-exports
pub use collaborators::{
    BroadcastPublisher, Clock, PublishError, Publisher, RunOutcome, RunQuery, RunRecord, Store,
    StoreError, SystemClock,
};
pub use config::{ConfigError, EngineConfig, DEFAULT_PHASE_QUEUE_CAPACITY};
pub use error::{BuildError, OrchestratorError, RunError};
pub use event::{EventEnvelope, EventKind, EventLog, LifecycleEvent};
pub use logging::{init_json_tracing, init_tracing};
pub use orchestrator::{
    Orchestrator, OrchestratorBuilder, OrchestratorOutput, PhaseOutput, RunDiagnostics,
    RunInput, RunOutput, RunRequest, Signal, SignalOutput,
};
pub use run::{
    allowed_transitions, validate_transition, RunContext, RunMode, RunState, RunStateMachine,
    StateError,
};
pub use scope::{with_scope, DisposalReport, ExecutionScope};

// Downstream crates get the whole engine from one dependency
pub use stagecraft_kernel as kernel;
pub use stagecraft_telemetry as telemetry;
pub use tokio_util::sync::CancellationToken;

/// Common imports
pub mod prelude {
    pub use crate::{
        CancellationToken, EngineConfig, EventKind, LifecycleEvent, Orchestrator,
        OrchestratorError, OrchestratorOutput, RunError, RunInput, RunMode, RunRequest, RunState,
        Signal,
    };
    pub use stagecraft_kernel::prelude::*;
    pub use stagecraft_telemetry::{LedgerSnapshot, TelemetryLedger};
}

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
