//! Pipeline entry points for harvest runs.
//!
//! - `ExclusivityGate`: at most one run at a time
//! - `Orchestrator`: gate, login, sweep, release

pub mod gate;
pub mod orchestrator;

pub use gate::{ExclusivityGate, GateGuard, GateStatus, Lease};
pub use orchestrator::{LogProgress, Orchestrator, ProgressSink, RunOutcome, RunReport};
