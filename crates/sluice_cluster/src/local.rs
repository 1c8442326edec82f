//! In-process scheduler that runs jobs as local child processes.
//!
//! Jobs start in priority order (highest first, then submission order) once
//! their predecessors allow it, up to `max_concurrent` at a time. State is
//! advanced by a background ticker and on every query, so callers that poll
//! see progress even without a runtime-driven ticker.

use crate::priority::Priority;
use crate::scheduler::{
    open_log, JobHandle, JobId, JobInfo, JobRequest, JobScheduler, JobState, SchedulerError,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Local scheduler configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalSchedulerConfig {
    /// Maximum jobs running at once
    pub max_concurrent: usize,
    /// Largest CPU request accepted
    pub max_cpus: u32,
    /// Principals allowed to submit; `None` allows everyone
    pub allowed_principals: Option<Vec<String>>,
    /// Background tick interval in milliseconds
    pub tick_interval_ms: u64,
}

impl LocalSchedulerConfig {
    /// Create a config with defaults
    #[must_use]
    pub fn new() -> Self {
        Self {
            max_concurrent: 4,
            max_cpus: 64,
            allowed_principals: None,
            tick_interval_ms: 50,
        }
    }

    /// Set max concurrent jobs
    #[must_use]
    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = max.max(1);
        self
    }

    /// Set the CPU quota
    #[must_use]
    pub fn with_max_cpus(mut self, cpus: u32) -> Self {
        self.max_cpus = cpus;
        self
    }

    /// Allow a principal to submit
    #[must_use]
    pub fn with_principal(mut self, principal: impl Into<String>) -> Self {
        self.allowed_principals
            .get_or_insert_with(Vec::new)
            .push(principal.into());
        self
    }

    /// Set the tick interval
    #[must_use]
    pub fn with_tick_interval(mut self, interval_ms: u64) -> Self {
        self.tick_interval_ms = interval_ms.max(1);
        self
    }
}

impl Default for LocalSchedulerConfig {
    fn default() -> Self {
        Self::new()
    }
}

struct LocalJob {
    handle: JobHandle,
    request: JobRequest,
    state: JobState,
    priority: Priority,
    seq: u64,
    child: Option<Child>,
    return_code: Option<i32>,
    signal: Option<i32>,
    submit_time: DateTime<Utc>,
    start_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
}

impl LocalJob {
    fn info(&self) -> JobInfo {
        JobInfo {
            id: self.handle.id.clone(),
            job_name: self.handle.job_name.clone(),
            state: self.state,
            priority: self.priority,
            return_code: self.return_code,
            signal: self.signal,
            submit_time: Some(self.submit_time),
            start_time: self.start_time,
            end_time: self.end_time,
        }
    }

    fn finish(&mut self, state: JobState) {
        self.state = state;
        self.end_time = Some(Utc::now());
        self.child = None;
    }
}

#[derive(Default)]
struct Queue {
    jobs: IndexMap<JobId, LocalJob>,
    next_seq: u64,
}

impl Queue {
    fn state_of(&self, id: &JobId) -> Option<JobState> {
        self.jobs.get(id).map(|j| j.state)
    }

    fn running(&self) -> usize {
        self.jobs
            .values()
            .filter(|j| j.state == JobState::Running)
            .count()
    }

    /// Advance every job as far as it can go
    fn tick(&mut self, max_concurrent: usize) {
        self.reap();
        self.cascade_cancellations();
        self.start_ready(max_concurrent);
    }

    fn reap(&mut self) {
        for job in self.jobs.values_mut() {
            let Some(child) = job.child.as_mut() else {
                continue;
            };
            match child.try_wait() {
                Ok(Some(status)) => {
                    job.return_code = status.code();
                    job.signal = exit_signal(&status);
                    let state = if status.success() {
                        JobState::Completed
                    } else if job.signal.is_some() {
                        JobState::Cancelled
                    } else {
                        JobState::Failed
                    };
                    debug!(job = %job.handle.id, code = ?job.return_code, ?state, "Job exited");
                    job.finish(state);
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(job = %job.handle.id, error = %e, "Lost track of job");
                    job.finish(JobState::Failed);
                }
            }
        }
    }

    /// Cancel pending jobs whose after-ok predecessors can no longer succeed
    fn cascade_cancellations(&mut self) {
        loop {
            let doomed: Vec<JobId> = self
                .jobs
                .values()
                .filter(|j| j.state == JobState::Pending)
                .filter(|j| {
                    j.handle.after_ok.iter().any(|p| {
                        matches!(
                            self.state_of(p),
                            Some(JobState::Failed | JobState::Cancelled)
                        )
                    })
                })
                .map(|j| j.handle.id.clone())
                .collect();
            if doomed.is_empty() {
                break;
            }
            for id in doomed {
                if let Some(job) = self.jobs.get_mut(&id) {
                    debug!(job = %id, "Predecessor failed, cancelling");
                    job.finish(JobState::Cancelled);
                }
            }
        }
    }

    fn is_ready(&self, job: &LocalJob) -> bool {
        job.handle
            .after_ok
            .iter()
            .all(|p| self.state_of(p) == Some(JobState::Completed))
            && job
                .handle
                .after_any
                .iter()
                .all(|p| self.state_of(p).is_some_and(|s| s.is_terminal()))
    }

    fn start_ready(&mut self, max_concurrent: usize) {
        let slots = max_concurrent.saturating_sub(self.running());
        if slots == 0 {
            return;
        }
        let mut ready: Vec<(Priority, u64, JobId)> = self
            .jobs
            .values()
            .filter(|j| j.state == JobState::Pending && self.is_ready(j))
            .map(|j| (j.priority, j.seq, j.handle.id.clone()))
            .collect();
        ready.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));

        for (_, _, id) in ready.into_iter().take(slots) {
            if let Some(job) = self.jobs.get_mut(&id) {
                match spawn(&job.request) {
                    Ok(child) => {
                        debug!(job = %id, name = %job.handle.job_name, "Job started");
                        job.child = Some(child);
                        job.state = JobState::Running;
                        job.start_time = Some(Utc::now());
                    }
                    Err(e) => {
                        warn!(job = %id, error = %e, "Job failed to start");
                        job.start_time = Some(Utc::now());
                        job.finish(JobState::Failed);
                    }
                }
            }
        }
    }
}

fn spawn(request: &JobRequest) -> std::io::Result<Child> {
    let stdout = match &request.stdout {
        Some(path) => Stdio::from(open_log(path)?),
        None => Stdio::null(),
    };
    let stderr = match &request.stderr {
        Some(path) => Stdio::from(open_log(path)?),
        None => Stdio::null(),
    };
    Command::new(request.resolved_command())
        .args(&request.args)
        .current_dir(&request.workdir)
        .stdin(Stdio::null())
        .stdout(stdout)
        .stderr(stderr)
        .kill_on_drop(true)
        .spawn()
}

#[cfg(unix)]
fn exit_signal(status: &std::process::ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &std::process::ExitStatus) -> Option<i32> {
    None
}

/// Scheduler running jobs as child processes of this process
pub struct LocalScheduler {
    config: LocalSchedulerConfig,
    queue: Arc<Mutex<Queue>>,
    shutdown: CancellationToken,
}

impl LocalScheduler {
    /// Create a scheduler; spawns a background ticker when called inside a
    /// tokio runtime
    #[must_use]
    pub fn new(config: LocalSchedulerConfig) -> Self {
        let queue = Arc::new(Mutex::new(Queue::default()));
        let shutdown = CancellationToken::new();
        if let Ok(rt) = tokio::runtime::Handle::try_current() {
            let queue = Arc::clone(&queue);
            let token = shutdown.clone();
            let max = config.max_concurrent;
            let every = Duration::from_millis(config.tick_interval_ms.max(1));
            rt.spawn(async move {
                let mut interval = tokio::time::interval(every);
                loop {
                    tokio::select! {
                        () = token.cancelled() => break,
                        _ = interval.tick() => {
                            queue.lock().unwrap_or_else(PoisonError::into_inner).tick(max);
                        }
                    }
                }
            });
        }
        info!(max_concurrent = config.max_concurrent, "Local scheduler started");
        Self {
            config,
            queue,
            shutdown,
        }
    }

    /// Get configuration
    #[must_use]
    pub fn config(&self) -> &LocalSchedulerConfig {
        &self.config
    }

    /// Stop accepting jobs and kill running ones
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        let mut queue = self.lock();
        for job in queue.jobs.values_mut() {
            if let Some(child) = job.child.as_mut() {
                let _ = child.start_kill();
                job.finish(JobState::Cancelled);
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Queue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ticked(&self) -> std::sync::MutexGuard<'_, Queue> {
        let mut queue = self.lock();
        queue.tick(self.config.max_concurrent);
        queue
    }
}

impl Default for LocalScheduler {
    fn default() -> Self {
        Self::new(LocalSchedulerConfig::default())
    }
}

impl Drop for LocalScheduler {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[async_trait]
impl JobScheduler for LocalScheduler {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn probe(&self) -> Result<(), SchedulerError> {
        if self.shutdown.is_cancelled() {
            return Err(SchedulerError::ShuttingDown);
        }
        Ok(())
    }

    async fn submit(&self, request: JobRequest) -> Result<JobHandle, SchedulerError> {
        if self.shutdown.is_cancelled() {
            return Err(SchedulerError::ShuttingDown);
        }
        request.check_paths()?;
        if request.resources.cpus > self.config.max_cpus {
            return Err(SchedulerError::OverQuota {
                requested: request.resources.cpus,
                limit: self.config.max_cpus,
            });
        }
        if let Some(allowed) = &self.config.allowed_principals {
            if !allowed.contains(&request.principal) {
                return Err(SchedulerError::Unauthorized {
                    principal: request.principal.clone(),
                });
            }
        }

        let mut queue = self.lock();
        for pred in request.after_ok.iter().chain(&request.after_any) {
            if !queue.jobs.contains_key(&pred.id) {
                return Err(SchedulerError::UnknownJob {
                    id: pred.id.clone(),
                });
            }
        }

        let seq = queue.next_seq;
        queue.next_seq += 1;
        let id = JobId(format!("local-{seq}"));
        let handle = JobHandle::for_request(id.clone(), &request);
        debug!(job = %id, name = %request.job_name, priority = %request.priority, "Job submitted");
        queue.jobs.insert(
            id,
            LocalJob {
                handle: handle.clone(),
                priority: request.priority,
                request,
                state: JobState::Pending,
                seq,
                child: None,
                return_code: None,
                signal: None,
                submit_time: Utc::now(),
                start_time: None,
                end_time: None,
            },
        );
        queue.tick(self.config.max_concurrent);
        Ok(handle)
    }

    async fn get_state(&self, handle: &JobHandle) -> Result<JobState, SchedulerError> {
        self.ticked()
            .state_of(&handle.id)
            .ok_or_else(|| SchedulerError::UnknownJob {
                id: handle.id.clone(),
            })
    }

    async fn accounting(
        &self,
        handles: &[JobHandle],
    ) -> Result<HashMap<JobId, JobInfo>, SchedulerError> {
        let queue = self.ticked();
        Ok(handles
            .iter()
            .filter_map(|h| queue.jobs.get(&h.id).map(|j| (h.id.clone(), j.info())))
            .collect())
    }

    async fn cancel(&self, handle: &JobHandle) -> Result<(), SchedulerError> {
        let mut queue = self.lock();
        let job = queue
            .jobs
            .get_mut(&handle.id)
            .ok_or_else(|| SchedulerError::UnknownJob {
                id: handle.id.clone(),
            })?;
        match job.state {
            JobState::Pending | JobState::Unknown => job.finish(JobState::Cancelled),
            JobState::Running => {
                if let Some(child) = job.child.as_mut() {
                    let _ = child.start_kill();
                }
                job.finish(JobState::Cancelled);
            }
            _ => return Ok(()),
        }
        debug!(job = %handle.id, "Job cancelled");
        queue.tick(self.config.max_concurrent);
        Ok(())
    }

    async fn set_priority(
        &self,
        handles: &[JobHandle],
        priority: i64,
    ) -> Result<(), SchedulerError> {
        let priority = Priority::clamped(priority);
        let mut queue = self.lock();
        for handle in handles {
            let job = queue
                .jobs
                .get_mut(&handle.id)
                .ok_or_else(|| SchedulerError::UnknownJob {
                    id: handle.id.clone(),
                })?;
            if job.state == JobState::Pending {
                job.priority = priority;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn script(dir: &Path, name: &str, body: &str) -> std::path::PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    async fn wait_terminal(sched: &LocalScheduler, handle: &JobHandle) -> JobState {
        for _ in 0..500 {
            let state = sched.get_state(handle).await.unwrap();
            if state.is_terminal() {
                return state;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {} never finished", handle.id);
    }

    #[tokio::test]
    async fn test_success_and_logs() {
        let tmp = tempfile::tempdir().unwrap();
        script(tmp.path(), "ok.sh", "echo hello");
        let sched = LocalScheduler::default();
        let req = JobRequest::new("ok", tmp.path(), "ok.sh")
            .with_logs(tmp.path().join("out.txt"), tmp.path().join("err.txt"));
        let handle = sched.submit(req).await.unwrap();

        assert_eq!(wait_terminal(&sched, &handle).await, JobState::Completed);
        let out = std::fs::read_to_string(tmp.path().join("out.txt")).unwrap();
        assert_eq!(out.trim(), "hello");

        let info = sched.accounting(&[handle.clone()]).await.unwrap();
        let info = &info[&handle.id];
        assert_eq!(info.return_code, Some(0));
        assert!(info.start_time.is_some());
        assert!(info.end_time.is_some());
    }

    #[tokio::test]
    async fn test_failed_predecessor_cancels_after_ok() {
        let tmp = tempfile::tempdir().unwrap();
        script(tmp.path(), "fail.sh", "exit 2");
        script(tmp.path(), "ok.sh", "true");
        let sched = LocalScheduler::default();

        let a = sched
            .submit(JobRequest::new("a", tmp.path(), "fail.sh"))
            .await
            .unwrap();
        let b = sched
            .submit(JobRequest::new("b", tmp.path(), "ok.sh").after_ok([a.clone()]))
            .await
            .unwrap();
        let c = sched
            .submit(JobRequest::new("c", tmp.path(), "ok.sh").after_ok([b.clone()]))
            .await
            .unwrap();

        assert_eq!(wait_terminal(&sched, &a).await, JobState::Failed);
        assert_eq!(wait_terminal(&sched, &b).await, JobState::Cancelled);
        assert_eq!(wait_terminal(&sched, &c).await, JobState::Cancelled);

        let info = sched.accounting(&[a.clone(), b.clone()]).await.unwrap();
        assert_eq!(info[&a.id].return_code, Some(2));
        assert_eq!(info[&b.id].start_time, None);
    }

    #[tokio::test]
    async fn test_after_any_runs_after_failure() {
        let tmp = tempfile::tempdir().unwrap();
        script(tmp.path(), "fail.sh", "exit 1");
        script(tmp.path(), "ok.sh", "true");
        let sched = LocalScheduler::default();

        let a = sched
            .submit(JobRequest::new("a", tmp.path(), "fail.sh"))
            .await
            .unwrap();
        let b = sched
            .submit(JobRequest::new("b", tmp.path(), "ok.sh").after_any([a.clone()]))
            .await
            .unwrap();
        assert_eq!(wait_terminal(&sched, &b).await, JobState::Completed);
    }

    #[tokio::test]
    async fn test_priority_is_clamped_for_pending_jobs() {
        let tmp = tempfile::tempdir().unwrap();
        script(tmp.path(), "slow.sh", "sleep 5");
        script(tmp.path(), "ok.sh", "true");
        let sched = LocalScheduler::new(LocalSchedulerConfig::new().with_max_concurrent(1));

        let blocker = sched
            .submit(JobRequest::new("slow", tmp.path(), "slow.sh"))
            .await
            .unwrap();
        let waiting = sched
            .submit(JobRequest::new("ok", tmp.path(), "ok.sh").with_priority(Priority::LOW))
            .await
            .unwrap();
        assert_eq!(sched.get_state(&waiting).await.unwrap(), JobState::Pending);

        sched.set_priority(&[waiting.clone()], 99).await.unwrap();
        let info = sched.accounting(&[waiting.clone()]).await.unwrap();
        assert_eq!(info[&waiting.id].priority.value(), Priority::MAX_PRIO);

        sched.cancel(&blocker).await.unwrap();
        assert_eq!(sched.get_state(&blocker).await.unwrap(), JobState::Cancelled);
        assert_eq!(wait_terminal(&sched, &waiting).await, JobState::Completed);
    }

    #[tokio::test]
    async fn test_higher_priority_starts_first() {
        let tmp = tempfile::tempdir().unwrap();
        script(tmp.path(), "slow.sh", "sleep 5");
        script(tmp.path(), "ok.sh", "true");
        let sched = LocalScheduler::new(LocalSchedulerConfig::new().with_max_concurrent(1));

        let blocker = sched
            .submit(JobRequest::new("slow", tmp.path(), "slow.sh"))
            .await
            .unwrap();
        let low = sched
            .submit(JobRequest::new("low", tmp.path(), "slow.sh").with_priority(Priority::LOW))
            .await
            .unwrap();
        let high = sched
            .submit(JobRequest::new("high", tmp.path(), "ok.sh").with_priority(Priority::HIGH))
            .await
            .unwrap();

        sched.cancel(&blocker).await.unwrap();
        assert_eq!(wait_terminal(&sched, &high).await, JobState::Completed);
        let info = sched.accounting(&[low.clone(), high.clone()]).await.unwrap();
        let high_start = info[&high.id].start_time.unwrap();
        if let Some(low_start) = info[&low.id].start_time {
            assert!(low_start >= high_start);
        }
        sched.cancel(&low).await.unwrap();
    }

    #[tokio::test]
    async fn test_submit_validation() {
        let tmp = tempfile::tempdir().unwrap();
        script(tmp.path(), "ok.sh", "true");
        let sched = LocalScheduler::new(
            LocalSchedulerConfig::new()
                .with_max_cpus(2)
                .with_principal("alice"),
        );

        let err = sched
            .submit(JobRequest::new("x", tmp.path(), "missing.sh").with_principal("alice"))
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::MissingExecutable { .. }));

        let mut req = JobRequest::new("x", tmp.path(), "ok.sh").with_principal("alice");
        req.resources.cpus = 8;
        let err = sched.submit(req).await.unwrap_err();
        assert!(matches!(err, SchedulerError::OverQuota { requested: 8, limit: 2 }));

        let err = sched
            .submit(JobRequest::new("x", tmp.path(), "ok.sh").with_principal("mallory"))
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::Unauthorized { .. }));

        let ghost = JobHandle {
            id: JobId("ghost".to_string()),
            job_name: "ghost".to_string(),
            priority: Priority::default(),
            after_ok: Vec::new(),
            after_any: Vec::new(),
        };
        let err = sched
            .submit(
                JobRequest::new("x", tmp.path(), "ok.sh")
                    .with_principal("alice")
                    .after_ok([ghost]),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::UnknownJob { .. }));
    }

    #[tokio::test]
    async fn test_shutdown_rejects_submissions() {
        let tmp = tempfile::tempdir().unwrap();
        script(tmp.path(), "ok.sh", "true");
        let sched = LocalScheduler::default();
        sched.shutdown();
        assert_eq!(sched.probe().await, Err(SchedulerError::ShuttingDown));
        let err = sched
            .submit(JobRequest::new("x", tmp.path(), "ok.sh"))
            .await
            .unwrap_err();
        assert_eq!(err, SchedulerError::ShuttingDown);
    }
}
