//! Runtime error types.

use crate::component::ComponentState;
use sluice_cluster::{LaunchError, SchedulerError};
use sluice_core::{ComponentId, Md5Digest, RequestId};
use sluice_plan::ValidationError;
use sluice_storage::StoreError;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// Errors moving data along a cable
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CableError {
    /// Source bytes are gone
    #[error("Source not found: {}", path.display())]
    SourceMissing { path: PathBuf },

    /// Source ended early
    #[error("Source truncated: {}", path.display())]
    Truncated { path: PathBuf },

    /// Bytes do not match the identity they should have
    #[error("Identity mismatch at {}: expected {expected}, found {found}", path.display())]
    IdentityMismatch {
        path: PathBuf,
        expected: Md5Digest,
        found: Md5Digest,
    },

    /// A wired column does not exist in the source
    #[error("Source {} has no column {column}", path.display())]
    MissingColumn { path: PathBuf, column: u32 },

    /// Source is not valid CSV
    #[error("Malformed source {}: {reason}", path.display())]
    Malformed { path: PathBuf, reason: String },

    /// Any other filesystem failure
    #[error("I/O error at {} ({kind:?}): {reason}", path.display())]
    Io {
        path: PathBuf,
        kind: ErrorKind,
        reason: String,
    },
}

impl CableError {
    /// Classify an I/O error
    #[must_use]
    pub fn from_io(path: &Path, err: &std::io::Error) -> Self {
        let path = path.to_path_buf();
        match err.kind() {
            ErrorKind::NotFound => Self::SourceMissing { path },
            ErrorKind::UnexpectedEof => Self::Truncated { path },
            kind => Self::Io {
                path,
                kind,
                reason: err.to_string(),
            },
        }
    }

    /// Classify a CSV error
    #[must_use]
    pub fn from_csv(path: &Path, err: csv::Error) -> Self {
        match err.into_kind() {
            csv::ErrorKind::Io(e) => Self::from_io(path, &e),
            other => Self::Malformed {
                path: path.to_path_buf(),
                reason: format!("{other:?}"),
            },
        }
    }

    /// Whether regenerating the source may fix this
    ///
    /// Missing, truncated and mismatched sources are; a full disk or a
    /// permission problem is not.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::SourceMissing { .. } | Self::Truncated { .. } | Self::IdentityMismatch { .. }
        )
    }
}

/// Illegal RunComponent operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ComponentError {
    /// State change not allowed
    #[error("Component {component}: cannot move from {from:?} to {to:?}")]
    InvalidTransition {
        component: ComponentId,
        from: ComponentState,
        to: ComponentState,
    },

    /// Reuse was already decided
    #[error("Component {component}: reuse already decided")]
    ReuseDecided { component: ComponentId },

    /// Operation needs a decided reuse flag
    #[error("Component {component}: reuse not decided")]
    ReuseUndecided { component: ComponentId },
}

/// Errors running a pipeline in a sandbox
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SandboxError {
    /// Pipeline or inputs rejected before execution
    #[error("Validation failed: {}", join(.0))]
    Validation(Vec<ValidationError>),

    /// Scheduler or launcher refused a job
    #[error("Submission failed for {component}: {reason}")]
    Submission { component: String, reason: String },

    /// A job ran but its results are unusable
    #[error("Execution failed for {component}: {reason}")]
    Execution { component: String, reason: String },

    /// Stored state contradicts itself
    #[error("Corruption: {reason}")]
    Corruption { reason: String },

    /// Missing data could not be regenerated
    #[error("Recovery of {md5} failed: {reason}")]
    Recovery { md5: Md5Digest, reason: String },

    /// Data movement failed
    #[error(transparent)]
    Cable(#[from] CableError),

    /// State machine misuse
    #[error(transparent)]
    Component(#[from] ComponentError),

    /// Record store failure
    #[error("Store error: {0}")]
    Store(StoreError),

    /// Filesystem failure
    #[error("I/O error at {}: {reason}", path.display())]
    Io { path: PathBuf, reason: String },

    /// A job did not finish in time
    #[error("Job {job} timed out")]
    Timeout { job: String },

    /// The run was cancelled
    #[error("Cancelled")]
    Cancelled,

    /// A sandbox runs one pipeline only
    #[error("Sandbox already used")]
    AlreadyUsed,
}

fn join(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl SandboxError {
    /// Build an I/O error
    #[must_use]
    pub fn io(path: impl AsRef<Path>, err: &std::io::Error) -> Self {
        Self::Io {
            path: path.as_ref().to_path_buf(),
            reason: err.to_string(),
        }
    }

    /// Build a submission error for a component
    #[must_use]
    pub fn submission(component: impl ToString, reason: impl ToString) -> Self {
        Self::Submission {
            component: component.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Build an execution error for a component
    #[must_use]
    pub fn execution(component: impl ToString, reason: impl ToString) -> Self {
        Self::Execution {
            component: component.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Whether the error must stop the whole run
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Corruption { .. } | Self::AlreadyUsed)
    }
}

impl From<StoreError> for SandboxError {
    fn from(err: StoreError) -> Self {
        if err.is_corruption() {
            Self::Corruption {
                reason: err.to_string(),
            }
        } else {
            Self::Store(err)
        }
    }
}

impl From<SchedulerError> for SandboxError {
    fn from(err: SchedulerError) -> Self {
        Self::submission("scheduler", err)
    }
}

impl From<LaunchError> for SandboxError {
    fn from(err: LaunchError) -> Self {
        Self::submission("launcher", err)
    }
}

/// Fleet errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FleetError {
    /// No such request
    #[error("Unknown run request: {id}")]
    UnknownRequest { id: RequestId },

    /// Request already finished
    #[error("Run request {id} already finished")]
    AlreadyFinished { id: RequestId },

    /// Queue backend failure
    #[error("Run queue error: {reason}")]
    Queue { reason: String },

    /// Manager is shutting down
    #[error("Fleet shutting down")]
    ShuttingDown,
}
