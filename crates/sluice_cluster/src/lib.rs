//! SLUICE Cluster
//!
//! Backends that actually run a step's computation: job schedulers that
//! accept submissions with priorities and dependency edges, and container
//! executors that wrap a driver in a launch script.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod container;
pub mod local;
pub mod priority;
pub mod scheduler;
pub mod slurm;

pub use container::{ContainerExecutor, IsolatedConfig, IsolatedLauncher, LaunchError, LaunchSpec, NativeLauncher};
pub use local::{LocalScheduler, LocalSchedulerConfig};
pub use priority::Priority;
pub use scheduler::{DriverExit, JobHandle, JobId, JobInfo, JobRequest, JobScheduler, JobState, Resources, SchedulerError};
pub use slurm::{SlurmConfig, SlurmScheduler};
