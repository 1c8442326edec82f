//! Cluster scheduler abstraction.
//!
//! A submission names a working directory, an executable, resources, a
//! priority, and two predecessor sets. An after-ok predecessor must complete
//! successfully before the job may start, and its failure cancels the job.
//! An after-any predecessor only has to finish.

use crate::priority::Priority;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Scheduler-side job identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(pub String);

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Resources a job asks for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resources {
    /// CPUs
    pub cpus: u32,
    /// Memory in MiB, 0 for the scheduler default
    pub memory_mb: u64,
}

impl Default for Resources {
    fn default() -> Self {
        Self {
            cpus: 1,
            memory_mb: 0,
        }
    }
}

/// A job submission
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRequest {
    /// Display name
    pub job_name: String,
    /// Working directory
    pub workdir: PathBuf,
    /// Executable, absolute or relative to `workdir`
    pub command: PathBuf,
    /// Arguments
    pub args: Vec<String>,
    /// Requested resources
    pub resources: Resources,
    /// Priority
    pub priority: Priority,
    /// Jobs that must complete successfully first
    pub after_ok: Vec<JobHandle>,
    /// Jobs that must finish first, in any state
    pub after_any: Vec<JobHandle>,
    /// File receiving standard output
    pub stdout: Option<PathBuf>,
    /// File receiving standard error
    pub stderr: Option<PathBuf>,
    /// Principal the job runs for
    pub principal: String,
}

impl JobRequest {
    /// Create a request with default resources and no predecessors
    #[must_use]
    pub fn new(job_name: impl Into<String>, workdir: impl Into<PathBuf>, command: impl Into<PathBuf>) -> Self {
        Self {
            job_name: job_name.into(),
            workdir: workdir.into(),
            command: command.into(),
            args: Vec::new(),
            resources: Resources::default(),
            priority: Priority::default(),
            after_ok: Vec::new(),
            after_any: Vec::new(),
            stdout: None,
            stderr: None,
            principal: "sluice".to_string(),
        }
    }

    /// Add arguments
    #[must_use]
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set resources
    #[must_use]
    pub fn with_resources(mut self, resources: Resources) -> Self {
        self.resources = resources;
        self
    }

    /// Set priority
    #[must_use]
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Start only after these jobs complete successfully
    #[must_use]
    pub fn after_ok(mut self, handles: impl IntoIterator<Item = JobHandle>) -> Self {
        self.after_ok.extend(handles);
        self
    }

    /// Start only after these jobs finish
    #[must_use]
    pub fn after_any(mut self, handles: impl IntoIterator<Item = JobHandle>) -> Self {
        self.after_any.extend(handles);
        self
    }

    /// Redirect standard output and error
    #[must_use]
    pub fn with_logs(mut self, stdout: impl Into<PathBuf>, stderr: impl Into<PathBuf>) -> Self {
        self.stdout = Some(stdout.into());
        self.stderr = Some(stderr.into());
        self
    }

    /// Set the principal
    #[must_use]
    pub fn with_principal(mut self, principal: impl Into<String>) -> Self {
        self.principal = principal.into();
        self
    }

    /// Executable path resolved against the working directory
    #[must_use]
    pub fn resolved_command(&self) -> PathBuf {
        if self.command.is_absolute() {
            self.command.clone()
        } else {
            self.workdir.join(&self.command)
        }
    }

    /// Checks every backend performs before accepting a submission
    ///
    /// # Errors
    ///
    /// Returns `InvalidWorkdir` or `MissingExecutable`
    pub fn check_paths(&self) -> Result<(), SchedulerError> {
        if !self.workdir.is_dir() {
            return Err(SchedulerError::InvalidWorkdir {
                path: self.workdir.clone(),
            });
        }
        let command = self.resolved_command();
        if !command.is_file() {
            return Err(SchedulerError::MissingExecutable { path: command });
        }
        Ok(())
    }
}

/// Handle to a submitted job
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobHandle {
    /// Scheduler-side id
    pub id: JobId,
    /// Display name
    pub job_name: String,
    /// Priority at submission
    pub priority: Priority,
    /// After-ok predecessors
    pub after_ok: Vec<JobId>,
    /// After-any predecessors
    pub after_any: Vec<JobId>,
}

impl JobHandle {
    /// Build the handle for an accepted request
    #[must_use]
    pub fn for_request(id: JobId, request: &JobRequest) -> Self {
        Self {
            id,
            job_name: request.job_name.clone(),
            priority: request.priority,
            after_ok: request.after_ok.iter().map(|h| h.id.clone()).collect(),
            after_any: request.after_any.iter().map(|h| h.id.clone()).collect(),
        }
    }
}

/// Scheduler-side job state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobState {
    /// Waiting to start
    Pending,
    /// Running
    Running,
    /// Exited with status 0
    Completed,
    /// Exited non-zero or was killed by the system
    Failed,
    /// Cancelled by a user or by a failed after-ok predecessor
    Cancelled,
    /// The scheduler does not know right now; treat as still pending
    Unknown,
}

impl JobState {
    /// Whether the job will not change state again
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether the job finished successfully
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Completed)
    }
}

/// Exit status reported by a driver helper
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DriverExit {
    /// Exit code 0
    Success,
    /// The helper itself failed (101)
    HelperFailed,
    /// The helper was cancelled (102)
    HelperCancelled,
    /// The helper was stopped (103)
    HelperStopped,
    /// Any other non-zero code from the driver
    Failed(i32),
}

impl DriverExit {
    /// Helper failure exit code
    pub const HELPER_FAILED: i32 = 101;
    /// Helper cancellation exit code
    pub const HELPER_CANCELLED: i32 = 102;
    /// Helper stop exit code
    pub const HELPER_STOPPED: i32 = 103;

    /// Classify an exit code
    #[must_use]
    pub const fn from_code(code: i32) -> Self {
        match code {
            0 => Self::Success,
            Self::HELPER_FAILED => Self::HelperFailed,
            Self::HELPER_CANCELLED => Self::HelperCancelled,
            Self::HELPER_STOPPED => Self::HelperStopped,
            other => Self::Failed(other),
        }
    }

    /// Whether the driver succeeded; every non-zero code is a failure
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

impl std::fmt::Display for DriverExit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Success => write!(f, "exited 0"),
            Self::HelperFailed => write!(f, "helper failed (101)"),
            Self::HelperCancelled => write!(f, "helper cancelled (102)"),
            Self::HelperStopped => write!(f, "helper stopped (103)"),
            Self::Failed(code) => write!(f, "exited {code}"),
        }
    }
}

/// Accounting information for one job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobInfo {
    /// Scheduler-side id
    pub id: JobId,
    /// Display name
    pub job_name: String,
    /// Current state
    pub state: JobState,
    /// Current priority
    pub priority: Priority,
    /// Exit code, once exited
    pub return_code: Option<i32>,
    /// Terminating signal, if killed
    pub signal: Option<i32>,
    /// When the job was submitted
    pub submit_time: Option<DateTime<Utc>>,
    /// When it started
    pub start_time: Option<DateTime<Utc>>,
    /// When it ended
    pub end_time: Option<DateTime<Utc>>,
}

/// Scheduler errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchedulerError {
    /// Working directory does not exist
    #[error("Invalid working directory: {}", path.display())]
    InvalidWorkdir { path: PathBuf },

    /// Executable does not exist
    #[error("Executable not found: {}", path.display())]
    MissingExecutable { path: PathBuf },

    /// Request exceeds the resource quota
    #[error("Requested {requested} CPUs exceeds quota of {limit}")]
    OverQuota { requested: u32, limit: u32 },

    /// Principal may not submit
    #[error("Principal {principal} may not submit jobs")]
    Unauthorized { principal: String },

    /// Unknown job id
    #[error("Unknown job: {id}")]
    UnknownJob { id: JobId },

    /// Priority text is not a level or integer
    #[error("Invalid priority: {value}")]
    InvalidPriority { value: String },

    /// A scheduler command failed
    #[error("{command} failed: {reason}")]
    Command { command: String, reason: String },

    /// The scheduler is not reachable
    #[error("Scheduler unavailable: {reason}")]
    Unavailable { reason: String },

    /// The scheduler is shutting down
    #[error("Scheduler shutting down")]
    ShuttingDown,
}

impl SchedulerError {
    /// Whether the same call may succeed later; caller errors never do
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Command { .. } | Self::Unavailable { .. })
    }
}

/// A cluster scheduler backend
#[async_trait]
pub trait JobScheduler: Send + Sync {
    /// Backend name for logs
    fn name(&self) -> &'static str;

    /// Check the backend is usable; the result is cached per instance
    ///
    /// # Errors
    ///
    /// Returns `Unavailable` if the backend cannot run jobs
    async fn probe(&self) -> Result<(), SchedulerError>;

    /// Submit a job
    ///
    /// # Errors
    ///
    /// Fails synchronously on bad paths, over-quota resources, unknown
    /// predecessors, or an unauthorized principal
    async fn submit(&self, request: JobRequest) -> Result<JobHandle, SchedulerError>;

    /// Current state of a job
    ///
    /// # Errors
    ///
    /// Returns `UnknownJob` if the id was never submitted here
    async fn get_state(&self, handle: &JobHandle) -> Result<JobState, SchedulerError>;

    /// Accounting information for jobs, keyed by id
    ///
    /// # Errors
    ///
    /// Returns error if the backend cannot be queried
    async fn accounting(&self, handles: &[JobHandle]) -> Result<HashMap<JobId, JobInfo>, SchedulerError>;

    /// Cancel a job; a no-op for finished jobs
    ///
    /// # Errors
    ///
    /// Returns error if the backend rejects the request
    async fn cancel(&self, handle: &JobHandle) -> Result<(), SchedulerError>;

    /// Change the priority of not-yet-started jobs, clamping into range
    ///
    /// # Errors
    ///
    /// Returns error if the backend rejects the request
    async fn set_priority(&self, handles: &[JobHandle], priority: i64) -> Result<(), SchedulerError>;
}

/// Open a log file for a job, creating parent directories
pub(crate) fn open_log(path: &Path) -> std::io::Result<std::fs::File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::File::create(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_driver_exit_codes() {
        assert!(DriverExit::from_code(0).is_success());
        assert_eq!(DriverExit::from_code(101), DriverExit::HelperFailed);
        assert_eq!(DriverExit::from_code(102), DriverExit::HelperCancelled);
        assert_eq!(DriverExit::from_code(103), DriverExit::HelperStopped);
        assert_eq!(DriverExit::from_code(2), DriverExit::Failed(2));
        assert!(!DriverExit::from_code(102).is_success());
        assert_eq!(DriverExit::from_code(3).to_string(), "exited 3");
    }

    #[test]
    fn test_terminal_states() {
        assert!(JobState::Completed.is_terminal());
        assert!(JobState::Failed.is_terminal());
        assert!(JobState::Cancelled.is_terminal());
        assert!(!JobState::Pending.is_terminal());
        assert!(!JobState::Unknown.is_terminal());
        assert!(JobState::Completed.is_success());
        assert!(!JobState::Cancelled.is_success());
    }

    #[test]
    fn test_check_paths() {
        let tmp = tempfile::tempdir().unwrap();
        let req = JobRequest::new("j", tmp.path().join("missing"), "run.sh");
        assert!(matches!(
            req.check_paths(),
            Err(SchedulerError::InvalidWorkdir { .. })
        ));

        let req = JobRequest::new("j", tmp.path(), "run.sh");
        assert!(matches!(
            req.check_paths(),
            Err(SchedulerError::MissingExecutable { .. })
        ));

        std::fs::write(tmp.path().join("run.sh"), "#!/bin/sh\n").unwrap();
        assert!(req.check_paths().is_ok());
        assert_eq!(req.resolved_command(), tmp.path().join("run.sh"));
    }

    #[test]
    fn test_retryable() {
        assert!(!SchedulerError::OverQuota { requested: 9, limit: 4 }.is_retryable());
        assert!(SchedulerError::Unavailable {
            reason: "down".to_string()
        }
        .is_retryable());
    }

    #[test]
    fn test_handle_records_edges() {
        let a = JobHandle {
            id: JobId("1".to_string()),
            job_name: "a".to_string(),
            priority: Priority::LOW,
            after_ok: Vec::new(),
            after_any: Vec::new(),
        };
        let req = JobRequest::new("b", "/tmp", "/bin/true").after_ok([a.clone()]);
        let handle = JobHandle::for_request(JobId("2".to_string()), &req);
        assert_eq!(handle.after_ok, vec![a.id]);
        assert!(handle.after_any.is_empty());
    }
}
