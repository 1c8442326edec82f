//! RunComponent: one step or cable instance inside a Run.
//!
//! ```text
//! Unstarted -> Pending -> Running -> Saving -> Complete
//!                 |          |         |
//!                 |          +---------+----> Failed
//!                 +--> Complete (reused)
//!                 +--> Failed | Cancelled
//!                            Running -> Cancelled
//! ```
//!
//! The reuse flag starts undecided. While it is undecided the component has
//! no ExecRecord and no outputs.

use crate::error::ComponentError;
use serde::{Deserialize, Serialize};
use sluice_cluster::JobHandle;
use sluice_core::{ComponentId, ContentIdentity, ExecRecordId, Stopwatch};
use sluice_storage::{ContentCheckLog, ExecRecord, IntegrityCheckLog};
use std::path::PathBuf;

/// Which node of the pipeline a component instantiates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ComponentKind {
    /// A pipeline step
    Step {
        /// 1-based step number
        step_num: u32,
    },
    /// A cable feeding a step input
    InputCable {
        /// Consuming step
        step_num: u32,
        /// 0-based input position
        input_idx: usize,
    },
    /// A cable feeding a pipeline output
    OutputCable {
        /// 0-based output position
        output_idx: usize,
    },
}

impl ComponentKind {
    /// Whether this is a step
    #[must_use]
    pub const fn is_step(&self) -> bool {
        matches!(self, Self::Step { .. })
    }
}

impl std::fmt::Display for ComponentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Step { step_num } => write!(f, "step{step_num}"),
            Self::InputCable {
                step_num,
                input_idx,
            } => write!(f, "step{step_num}.input[{input_idx}]"),
            Self::OutputCable { output_idx } => write!(f, "output[{output_idx}]"),
        }
    }
}

/// Lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ComponentState {
    /// Created, inputs not yet resolved
    Unstarted,
    /// Inputs resolved, waiting to run or be reused
    Pending,
    /// Job submitted or data moving
    Running,
    /// Verifying outputs
    Saving,
    /// Finished successfully
    Complete,
    /// Finished unsuccessfully
    Failed,
    /// Stopped before finishing
    Cancelled,
}

impl ComponentState {
    /// Whether the state is final
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed | Self::Cancelled)
    }

    fn allows(self, to: Self) -> bool {
        use ComponentState::{Cancelled, Complete, Failed, Pending, Running, Saving, Unstarted};
        matches!(
            (self, to),
            (Unstarted, Pending)
                | (Pending, Running | Complete | Failed | Cancelled)
                | (Running, Saving | Failed | Cancelled)
                | (Saving, Complete | Failed)
        )
    }
}

/// One execution attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecLog {
    /// Wall-clock span
    pub stopwatch: Stopwatch,
    /// Scheduler job, for steps
    pub job: Option<JobHandle>,
    /// Driver exit code
    pub return_code: Option<i32>,
    /// Captured standard output
    pub stdout: Option<PathBuf>,
    /// Captured standard error
    pub stderr: Option<PathBuf>,
}

impl ExecLog {
    /// Start a log now
    #[must_use]
    pub fn started() -> Self {
        Self {
            stopwatch: Stopwatch::started(),
            job: None,
            return_code: None,
            stdout: None,
            stderr: None,
        }
    }

    /// Attach the scheduler job
    #[must_use]
    pub fn with_job(mut self, job: JobHandle) -> Self {
        self.job = Some(job);
        self
    }

    /// Attach log file paths
    #[must_use]
    pub fn with_logs(mut self, stdout: PathBuf, stderr: PathBuf) -> Self {
        self.stdout = Some(stdout);
        self.stderr = Some(stderr);
        self
    }

    /// Close the log with an exit code
    pub fn finish(&mut self, return_code: Option<i32>) {
        self.return_code = return_code;
        self.stopwatch.stop();
    }

    /// Whether the attempt exited cleanly
    #[must_use]
    pub fn is_successful(&self) -> bool {
        self.stopwatch.has_ended() && self.return_code == Some(0)
    }
}

/// One node-instance of an executing Run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunComponent {
    /// Component id
    pub id: ComponentId,
    /// Node it instantiates
    pub kind: ComponentKind,
    state: ComponentState,
    reused: Option<bool>,
    /// Wall-clock span
    pub stopwatch: Stopwatch,
    inputs: Vec<ContentIdentity>,
    outputs: Vec<ContentIdentity>,
    execrecord: Option<ExecRecordId>,
    exec_log: Option<ExecLog>,
    /// Content checks of the outputs
    pub content_checks: Vec<ContentCheckLog>,
    /// Integrity checks of outputs and code
    pub integrity_checks: Vec<IntegrityCheckLog>,
    /// Times this component was re-executed to regenerate data
    pub recovery_attempts: u32,
    /// Why the component failed or was cancelled
    pub reason: Option<String>,
    /// Outputs were redacted
    pub redacted: bool,
}

impl RunComponent {
    /// Create an unstarted component
    #[must_use]
    pub fn new(kind: ComponentKind) -> Self {
        Self {
            id: ComponentId::new(),
            kind,
            state: ComponentState::Unstarted,
            reused: None,
            stopwatch: Stopwatch::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            execrecord: None,
            exec_log: None,
            content_checks: Vec::new(),
            integrity_checks: Vec::new(),
            recovery_attempts: 0,
            reason: None,
            redacted: false,
        }
    }

    /// Current state
    #[must_use]
    pub const fn get_state(&self) -> ComponentState {
        self.state
    }

    /// Reuse flag; `None` while undecided
    #[must_use]
    pub const fn reused(&self) -> Option<bool> {
        self.reused
    }

    /// Input identities
    #[must_use]
    pub fn inputs(&self) -> &[ContentIdentity] {
        &self.inputs
    }

    /// Output identities
    #[must_use]
    pub fn outputs(&self) -> &[ContentIdentity] {
        &self.outputs
    }

    /// Resolved ExecRecord
    #[must_use]
    pub const fn execrecord(&self) -> Option<ExecRecordId> {
        self.execrecord
    }

    /// Latest execution attempt
    #[must_use]
    pub const fn exec_log(&self) -> Option<&ExecLog> {
        self.exec_log.as_ref()
    }

    /// Whether the component reached Complete
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.state == ComponentState::Complete
    }

    /// Whether the component completed with clean execution and checks
    #[must_use]
    pub fn successful_execution(&self) -> bool {
        if !self.is_complete() {
            return false;
        }
        let ran_ok = match self.reused {
            Some(true) => true,
            Some(false) => self.exec_log.as_ref().is_none_or(ExecLog::is_successful),
            None => false,
        };
        ran_ok
            && self.content_checks.iter().all(ContentCheckLog::is_ok)
            && self.integrity_checks.iter().all(IntegrityCheckLog::is_ok)
    }

    fn transition(&mut self, to: ComponentState) -> Result<(), ComponentError> {
        if !self.state.allows(to) {
            return Err(ComponentError::InvalidTransition {
                component: self.id,
                from: self.state,
                to,
            });
        }
        tracing::trace!(component = %self.kind, from = ?self.state, ?to, "transition");
        self.state = to;
        if to == ComponentState::Pending {
            self.stopwatch.start();
        }
        if to.is_terminal() {
            self.stopwatch.stop();
        }
        Ok(())
    }

    /// Inputs are resolved
    ///
    /// # Errors
    ///
    /// Returns error unless Unstarted
    pub fn mark_pending(&mut self, inputs: Vec<ContentIdentity>) -> Result<(), ComponentError> {
        self.transition(ComponentState::Pending)?;
        self.inputs = inputs;
        Ok(())
    }

    /// Satisfy the component from an existing record
    ///
    /// # Errors
    ///
    /// Returns error unless Pending with reuse undecided
    pub fn reuse(&mut self, record: &ExecRecord) -> Result<(), ComponentError> {
        if self.reused.is_some() {
            return Err(ComponentError::ReuseDecided { component: self.id });
        }
        self.transition(ComponentState::Complete)?;
        self.reused = Some(true);
        self.execrecord = Some(record.id);
        self.outputs = record.output_identities();
        Ok(())
    }

    /// Commit to running, attaching the execution attempt
    ///
    /// # Errors
    ///
    /// Returns error unless Pending with reuse undecided
    pub fn start(&mut self, log: ExecLog) -> Result<(), ComponentError> {
        if self.reused.is_some() {
            return Err(ComponentError::ReuseDecided { component: self.id });
        }
        self.transition(ComponentState::Running)?;
        self.reused = Some(false);
        self.exec_log = Some(log);
        Ok(())
    }

    /// Mutable access to the current execution attempt
    pub fn exec_log_mut(&mut self) -> Option<&mut ExecLog> {
        self.exec_log.as_mut()
    }

    /// Execution ended, verifying outputs
    ///
    /// # Errors
    ///
    /// Returns error unless Running
    pub fn begin_saving(&mut self) -> Result<(), ComponentError> {
        self.transition(ComponentState::Saving)
    }

    /// Outputs verified and recorded
    ///
    /// # Errors
    ///
    /// Returns error unless Saving
    pub fn complete(&mut self, record: &ExecRecord) -> Result<(), ComponentError> {
        if self.reused != Some(false) {
            return Err(ComponentError::ReuseUndecided { component: self.id });
        }
        self.transition(ComponentState::Complete)?;
        self.execrecord = Some(record.id);
        self.outputs = record.output_identities();
        Ok(())
    }

    /// Record a failure
    ///
    /// # Errors
    ///
    /// Returns error unless Pending, Running or Saving
    pub fn fail(&mut self, reason: impl Into<String>) -> Result<(), ComponentError> {
        self.transition(ComponentState::Failed)?;
        self.reason = Some(reason.into());
        Ok(())
    }

    /// Cancel by user request or a failed after-ok predecessor
    ///
    /// # Errors
    ///
    /// Returns error unless Pending or Running
    pub fn cancel(&mut self, reason: impl Into<String>) -> Result<(), ComponentError> {
        self.transition(ComponentState::Cancelled)?;
        self.reason = Some(reason.into());
        Ok(())
    }

    /// Replace the execution attempt after regenerating outputs
    ///
    /// # Errors
    ///
    /// Returns error unless Complete
    pub fn record_recovery(&mut self, log: ExecLog) -> Result<u32, ComponentError> {
        if self.state != ComponentState::Complete {
            return Err(ComponentError::InvalidTransition {
                component: self.id,
                from: self.state,
                to: ComponentState::Complete,
            });
        }
        self.exec_log = Some(log);
        self.recovery_attempts += 1;
        Ok(self.recovery_attempts)
    }

    /// Forget outputs after redaction
    pub fn redact(&mut self) {
        self.redacted = true;
        self.outputs.clear();
    }
}
