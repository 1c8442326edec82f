//! Polling a scheduler until a job settles.

use crate::error::SandboxError;
use sluice_cluster::{JobHandle, JobScheduler, JobState};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Doubling poll interval with a ceiling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    current: Duration,
    max: Duration,
}

impl Backoff {
    /// Create a backoff starting at `initial`
    #[must_use]
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            current: initial,
            max: max.max(initial),
        }
    }

    /// Interval to wait now; the next one doubles
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }
}

/// Poll until the job reaches a terminal state
///
/// Cancelling the token cancels the job at the scheduler. Transient
/// scheduler errors are logged and polling continues.
///
/// # Errors
///
/// Returns `Cancelled`, `Timeout`, or a submission error for a permanent
/// scheduler failure
pub async fn wait_for_job(
    scheduler: &dyn JobScheduler,
    handle: &JobHandle,
    mut backoff: Backoff,
    timeout: Option<Duration>,
    cancel: &CancellationToken,
) -> Result<JobState, SandboxError> {
    let deadline = timeout.map(|t| Instant::now() + t);
    loop {
        match scheduler.get_state(handle).await {
            Ok(state) if state.is_terminal() => {
                debug!(job = %handle.id, ?state, "job settled");
                return Ok(state);
            }
            Ok(_) => {}
            Err(e) if e.is_retryable() => {
                warn!(job = %handle.id, error = %e, "scheduler poll failed, retrying");
            }
            Err(e) => return Err(SandboxError::submission(&handle.job_name, e)),
        }

        if deadline.is_some_and(|d| Instant::now() >= d) {
            warn!(job = %handle.id, "job timed out");
            if let Err(e) = scheduler.cancel(handle).await {
                warn!(job = %handle.id, error = %e, "could not cancel timed-out job");
            }
            return Err(SandboxError::Timeout {
                job: handle.job_name.clone(),
            });
        }

        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                if let Err(e) = scheduler.cancel(handle).await {
                    warn!(job = %handle.id, error = %e, "could not cancel job");
                }
                return Err(SandboxError::Cancelled);
            }
            () = tokio::time::sleep(backoff.next_delay()) => {}
        }
    }
}
