//! SLUICE Runtime
//!
//! Executes pipelines inside sandboxes. A sandbox walks the step graph,
//! runs cables, reuses prior executions from the ExecRecord store, submits
//! steps to a job scheduler, and regenerates discarded datasets on demand.
//! The fleet manager turns queued run requests into sandboxes.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cable;
pub mod component;
pub mod config;
pub mod error;
pub mod fleet;
pub mod location;
mod recovery;
pub mod run;
pub mod sandbox;
pub mod steps;
pub mod wait;

#[cfg(test)]
mod testing;

pub use cable::CableRunner;
pub use component::{ComponentKind, ComponentState, ExecLog, RunComponent};
pub use config::SandboxConfig;
pub use error::{CableError, ComponentError, FleetError, SandboxError};
pub use fleet::{
    FleetConfig, FleetManager, FleetStats, InMemoryRunQueue, RequestStatus, RunRequest,
    RunRequestQueue,
};
pub use location::SandboxLocationMap;
pub use run::Run;
pub use sandbox::{Sandbox, register_inputs};
pub use steps::{ScheduleError, StepScheduler};
pub use wait::{Backoff, wait_for_job};
