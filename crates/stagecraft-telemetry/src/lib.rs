//! Stagecraft Telemetry
//!
//! Counter ledger fed by orchestrator lifecycle events.
//!
//! - [`TelemetryLedger`]: `(tenant, stage, route)` counters shared by all runs
//! - [`LedgerSnapshot`]: per-tenant totals, per-stage and per-route sums, top 5
//!
//! # Example
//!
//! ```rust,ignore
//! use stagecraft_telemetry::TelemetryLedger;
//!
//! let ledger = TelemetryLedger::new();
//! ledger.record(&tenant, &stage, "single/completed")?;
//! assert_eq!(ledger.snapshot(&tenant).total, 1);
//! ```

mod ledger;
mod snapshot;

pub use ledger::{LedgerError, LedgerLease, MetricKey, TelemetryLedger};
pub use snapshot::{LedgerSnapshot, TelemetryMetric, TOP_N};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
