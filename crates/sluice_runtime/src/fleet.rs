//! Fleet: turns queued run requests into sandboxes.
//!
//! Each poll reaps finished runs, forwards cancel requests to running
//! sandboxes, then claims pending requests up to the configured capacity.
//! Every claimed request runs in its own task with its own sandbox.

use crate::config::SandboxConfig;
use crate::error::{FleetError, SandboxError};
use crate::run::Run;
use crate::sandbox::Sandbox;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use sluice_cluster::{ContainerExecutor, JobScheduler};
use sluice_core::{ContentIdentity, RequestId};
use sluice_plan::PipelineGraph;
use sluice_storage::{ExecRecordStore, Principal};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::{Id as TaskId, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// A request to run a pipeline
#[derive(Debug, Clone)]
pub struct RunRequest {
    /// Request id
    pub id: RequestId,
    /// Pipeline to run
    pub pipeline: Arc<PipelineGraph>,
    /// Input identities, already in the dataset store
    pub inputs: Vec<ContentIdentity>,
    /// Who asked
    pub principal: Principal,
    /// Scheduler priority for the run's jobs
    pub priority: i64,
    /// The requester asked to stop
    pub cancel_requested: bool,
    /// When the request arrived
    pub submitted_at: DateTime<Utc>,
}

impl RunRequest {
    /// Create a request
    #[must_use]
    pub fn new(pipeline: Arc<PipelineGraph>, inputs: Vec<ContentIdentity>, principal: Principal) -> Self {
        Self {
            id: RequestId::new(),
            pipeline,
            inputs,
            principal,
            priority: 1,
            cancel_requested: false,
            submitted_at: Utc::now(),
        }
    }

    /// Set the priority
    #[must_use]
    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }
}

/// Where a request is in its life
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RequestStatus {
    /// Waiting to be claimed
    Pending,
    /// A sandbox is running it
    Running,
    /// Finished successfully
    Succeeded,
    /// Finished unsuccessfully
    Failed,
    /// Stopped on request
    Cancelled,
}

impl RequestStatus {
    /// Whether the request is finished
    #[must_use]
    pub const fn is_finished(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }

    fn of(outcome: &Result<Run, SandboxError>) -> Self {
        match outcome {
            Ok(run) if run.cancelled => Self::Cancelled,
            Ok(run) if run.is_successful() => Self::Succeeded,
            Err(SandboxError::Cancelled) => Self::Cancelled,
            _ => Self::Failed,
        }
    }
}

/// Source of run requests
#[async_trait]
pub trait RunRequestQueue: Send + Sync {
    /// Claim up to `limit` pending requests, marking them running
    ///
    /// # Errors
    ///
    /// Returns error if the queue is unreachable
    async fn claim_pending(&self, limit: usize) -> Result<Vec<RunRequest>, FleetError>;

    /// Whether the requester asked to stop
    ///
    /// # Errors
    ///
    /// Returns error for an unknown request
    async fn cancel_requested(&self, id: &RequestId) -> Result<bool, FleetError>;

    /// Record how a request ended
    ///
    /// # Errors
    ///
    /// Returns error for an unknown or already finished request
    async fn finish(&self, id: &RequestId, status: RequestStatus, run: Option<Run>) -> Result<(), FleetError>;
}

#[derive(Debug)]
struct QueueEntry {
    request: RunRequest,
    status: RequestStatus,
    run: Option<Run>,
}

/// Run queue held in memory
#[derive(Debug, Default)]
pub struct InMemoryRunQueue {
    entries: Mutex<IndexMap<RequestId, QueueEntry>>,
}

impl InMemoryRunQueue {
    /// Create an empty queue
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, IndexMap<RequestId, QueueEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue a request
    pub fn push(&self, request: RunRequest) -> RequestId {
        let id = request.id;
        self.lock().insert(
            id,
            QueueEntry {
                request,
                status: RequestStatus::Pending,
                run: None,
            },
        );
        id
    }

    /// Ask for a request to stop
    ///
    /// # Errors
    ///
    /// Returns error for an unknown or finished request
    pub fn request_cancel(&self, id: &RequestId) -> Result<(), FleetError> {
        let mut entries = self.lock();
        let entry = entries
            .get_mut(id)
            .ok_or(FleetError::UnknownRequest { id: *id })?;
        if entry.status.is_finished() {
            return Err(FleetError::AlreadyFinished { id: *id });
        }
        entry.request.cancel_requested = true;
        Ok(())
    }

    /// Current status
    #[must_use]
    pub fn status(&self, id: &RequestId) -> Option<RequestStatus> {
        self.lock().get(id).map(|e| e.status)
    }

    /// Finished run, if any
    #[must_use]
    pub fn run(&self, id: &RequestId) -> Option<Run> {
        self.lock().get(id).and_then(|e| e.run.clone())
    }

    /// Number of requests not yet finished
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.lock().values().filter(|e| !e.status.is_finished()).count()
    }
}

#[async_trait]
impl RunRequestQueue for InMemoryRunQueue {
    async fn claim_pending(&self, limit: usize) -> Result<Vec<RunRequest>, FleetError> {
        let mut entries = self.lock();
        for entry in entries.values_mut() {
            if entry.status == RequestStatus::Pending && entry.request.cancel_requested {
                entry.status = RequestStatus::Cancelled;
            }
        }
        let mut pending: Vec<&mut QueueEntry> = entries
            .values_mut()
            .filter(|e| e.status == RequestStatus::Pending)
            .collect();
        pending.sort_by(|a, b| {
            b.request
                .priority
                .cmp(&a.request.priority)
                .then(a.request.submitted_at.cmp(&b.request.submitted_at))
        });
        Ok(pending
            .into_iter()
            .take(limit)
            .map(|e| {
                e.status = RequestStatus::Running;
                e.request.clone()
            })
            .collect())
    }

    async fn cancel_requested(&self, id: &RequestId) -> Result<bool, FleetError> {
        self.lock()
            .get(id)
            .map(|e| e.request.cancel_requested)
            .ok_or(FleetError::UnknownRequest { id: *id })
    }

    async fn finish(&self, id: &RequestId, status: RequestStatus, run: Option<Run>) -> Result<(), FleetError> {
        let mut entries = self.lock();
        let entry = entries
            .get_mut(id)
            .ok_or(FleetError::UnknownRequest { id: *id })?;
        if entry.status.is_finished() {
            return Err(FleetError::AlreadyFinished { id: *id });
        }
        entry.status = status;
        entry.run = run;
        Ok(())
    }
}

/// Fleet configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FleetConfig {
    /// Most runs executing at once
    #[serde(default = "default_max_runs")]
    pub max_runs: usize,
    /// Time between queue polls
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Settings for every sandbox
    pub sandbox: SandboxConfig,
}

fn default_max_runs() -> usize {
    4
}

fn default_poll_interval_ms() -> u64 {
    500
}

impl FleetConfig {
    /// Create a config with default limits
    #[must_use]
    pub fn new(sandbox: SandboxConfig) -> Self {
        Self {
            max_runs: default_max_runs(),
            poll_interval_ms: default_poll_interval_ms(),
            sandbox,
        }
    }

    /// Set the concurrent run limit
    #[must_use]
    pub fn with_max_runs(mut self, max_runs: usize) -> Self {
        self.max_runs = max_runs.max(1);
        self
    }

    /// Set the poll interval
    #[must_use]
    pub fn with_poll_interval(mut self, ms: u64) -> Self {
        self.poll_interval_ms = ms;
        self
    }
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self::new(SandboxConfig::default())
    }
}

/// Counters over the fleet's lifetime
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FleetStats {
    /// Requests claimed
    pub claimed: u64,
    /// Runs that succeeded
    pub succeeded: u64,
    /// Runs that failed
    pub failed: u64,
    /// Runs that were cancelled
    pub cancelled: u64,
    /// Runs executing now
    pub active: usize,
}

type RunOutcome = (RequestId, Result<Run, SandboxError>);

/// Claims run requests and drives their sandboxes
pub struct FleetManager {
    config: FleetConfig,
    queue: Arc<dyn RunRequestQueue>,
    store: Arc<ExecRecordStore>,
    scheduler: Arc<dyn JobScheduler>,
    launcher: Arc<dyn ContainerExecutor>,
    active: JoinSet<RunOutcome>,
    tasks: HashMap<TaskId, RequestId>,
    tokens: HashMap<RequestId, CancellationToken>,
    stats: FleetStats,
}

impl FleetManager {
    /// Create a manager
    #[must_use]
    pub fn new(
        config: FleetConfig,
        queue: Arc<dyn RunRequestQueue>,
        store: Arc<ExecRecordStore>,
        scheduler: Arc<dyn JobScheduler>,
        launcher: Arc<dyn ContainerExecutor>,
    ) -> Self {
        Self {
            config,
            queue,
            store,
            scheduler,
            launcher,
            active: JoinSet::new(),
            tasks: HashMap::new(),
            tokens: HashMap::new(),
            stats: FleetStats::default(),
        }
    }

    /// Current counters
    #[must_use]
    pub fn stats(&self) -> FleetStats {
        FleetStats {
            active: self.active.len(),
            ..self.stats
        }
    }

    /// One pass: reap, forward cancels, claim
    ///
    /// # Errors
    ///
    /// Returns error if the queue cannot be reached
    pub async fn poll_once(&mut self) -> Result<FleetStats, FleetError> {
        while let Some(joined) = self.active.try_join_next_with_id() {
            self.reap(joined).await?;
        }

        for (id, token) in &self.tokens {
            if !token.is_cancelled() && self.queue.cancel_requested(id).await? {
                info!(request = %id, "cancelling run on request");
                token.cancel();
            }
        }

        let capacity = self.config.max_runs.saturating_sub(self.active.len());
        if capacity > 0 {
            for request in self.queue.claim_pending(capacity).await? {
                self.launch(request);
            }
        }
        Ok(self.stats())
    }

    fn launch(&mut self, request: RunRequest) {
        let token = CancellationToken::new();
        let sandbox = Sandbox::new(
            self.config.sandbox.clone().with_priority(request.priority),
            request.pipeline,
            self.store.clone(),
            self.scheduler.clone(),
            self.launcher.clone(),
            request.principal,
        )
        .with_cancel(token.clone());
        let id = request.id;
        let inputs = request.inputs;
        info!(request = %id, dir = %sandbox.run_dir().display(), "starting run");

        let handle = self.active.spawn(async move {
            let outcome = sandbox.execute_pipeline(&inputs).await;
            (id, outcome)
        });
        self.tasks.insert(handle.id(), id);
        self.tokens.insert(id, token);
        self.stats.claimed += 1;
    }

    async fn reap(
        &mut self,
        joined: Result<(TaskId, RunOutcome), tokio::task::JoinError>,
    ) -> Result<(), FleetError> {
        let (task, id, status, run) = match joined {
            Ok((task, (id, outcome))) => {
                let status = RequestStatus::of(&outcome);
                match &outcome {
                    Ok(run) => debug!(request = %id, run = %run.id, ?status, "run finished"),
                    Err(e) => warn!(request = %id, error = %e, "run aborted"),
                }
                (task, id, status, outcome.ok())
            }
            Err(e) => {
                let Some(id) = self.tasks.get(&e.id()).copied() else {
                    error!(error = %e, "lost track of a run task");
                    return Ok(());
                };
                error!(request = %id, error = %e, "run task panicked");
                (e.id(), id, RequestStatus::Failed, None)
            }
        };
        self.tasks.remove(&task);
        self.tokens.remove(&id);
        match status {
            RequestStatus::Succeeded => self.stats.succeeded += 1,
            RequestStatus::Cancelled => self.stats.cancelled += 1,
            _ => self.stats.failed += 1,
        }
        self.queue.finish(&id, status, run).await
    }

    /// Wait for every active run to finish
    ///
    /// # Errors
    ///
    /// Returns error if the queue cannot be reached
    pub async fn drain(&mut self) -> Result<FleetStats, FleetError> {
        while let Some(joined) = self.active.join_next_with_id().await {
            self.reap(joined).await?;
        }
        Ok(self.stats())
    }

    /// Poll until `shutdown` fires, then cancel active runs and drain
    ///
    /// # Errors
    ///
    /// Returns error if the queue cannot be reached
    pub async fn run(&mut self, shutdown: CancellationToken) -> Result<FleetStats, FleetError> {
        let interval = Duration::from_millis(self.config.poll_interval_ms);
        info!(max_runs = self.config.max_runs, "fleet manager started");
        loop {
            if let Err(e) = self.poll_once().await {
                warn!(error = %e, "fleet poll failed");
            }
            tokio::select! {
                biased;
                () = shutdown.cancelled() => break,
                () = tokio::time::sleep(interval) => {}
            }
        }
        info!(active = self.active.len(), "fleet shutting down");
        for token in self.tokens.values() {
            token.cancel();
        }
        self.drain().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Fixture;
    use sluice_cluster::NativeLauncher;

    fn manager(fx: &Fixture, queue: Arc<InMemoryRunQueue>, max_runs: usize) -> FleetManager {
        let config = FleetConfig::new(
            SandboxConfig::new(fx.tmp.path().join("runs")).with_polling(10, 50),
        )
        .with_max_runs(max_runs)
        .with_poll_interval(20);
        FleetManager::new(
            config,
            queue,
            fx.store.clone(),
            fx.scheduler.clone(),
            Arc::new(NativeLauncher::new()),
        )
    }

    #[tokio::test]
    async fn test_claims_by_priority_then_age() {
        let fx = Fixture::new();
        let pipeline = fx.standard(1);
        let queue = InMemoryRunQueue::new();
        let low = queue.push(RunRequest::new(pipeline.clone(), Vec::new(), Principal::new("a")).with_priority(0));
        let high = queue.push(RunRequest::new(pipeline.clone(), Vec::new(), Principal::new("a")).with_priority(2));
        let cancelled = queue.push(RunRequest::new(pipeline, Vec::new(), Principal::new("a")).with_priority(2));
        queue.request_cancel(&cancelled).unwrap();

        let claimed = queue.claim_pending(1).await.unwrap();
        assert_eq!(claimed.iter().map(|r| r.id).collect::<Vec<_>>(), vec![high]);
        assert_eq!(queue.status(&cancelled), Some(RequestStatus::Cancelled));
        assert_eq!(queue.status(&low), Some(RequestStatus::Pending));
        assert_eq!(
            queue.request_cancel(&cancelled),
            Err(FleetError::AlreadyFinished { id: cancelled })
        );
    }

    #[tokio::test]
    async fn test_runs_requests_to_completion() {
        let fx = Fixture::new();
        let pipeline = fx.standard(1);
        let inputs = fx.inputs(&pipeline);
        let queue = Arc::new(InMemoryRunQueue::new());
        let first = queue.push(RunRequest::new(pipeline.clone(), inputs.clone(), Principal::new("alice")));
        let second = queue.push(RunRequest::new(pipeline, Vec::new(), Principal::new("alice")));

        let mut fleet = manager(&fx, queue.clone(), 1);
        let stats = fleet.poll_once().await.unwrap();
        assert_eq!(stats.active, 1);
        assert_eq!(queue.status(&second), Some(RequestStatus::Pending));

        fleet.drain().await.unwrap();
        fleet.poll_once().await.unwrap();
        let stats = fleet.drain().await.unwrap();

        assert_eq!(queue.status(&first), Some(RequestStatus::Succeeded));
        assert!(queue.run(&first).unwrap().is_successful());
        assert_eq!(queue.status(&second), Some(RequestStatus::Failed));
        assert!(queue.run(&second).is_none());
        assert_eq!(stats.claimed, 2);
        assert_eq!(stats.succeeded, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(queue.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_cancel_request_reaches_running_sandbox() {
        let fx = Fixture::new();
        let pipeline = fx.pipeline(fx.method("slow", "sleep 30"), fx.method("noop", "exit 0"));
        let inputs = fx.inputs(&pipeline);
        let queue = Arc::new(InMemoryRunQueue::new());
        let id = queue.push(RunRequest::new(pipeline, inputs, Principal::new("alice")));

        let mut fleet = manager(&fx, queue.clone(), 2);
        fleet.poll_once().await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        queue.request_cancel(&id).unwrap();
        fleet.poll_once().await.unwrap();
        let stats = fleet.drain().await.unwrap();

        assert_eq!(queue.status(&id), Some(RequestStatus::Cancelled));
        assert!(queue.run(&id).unwrap().cancelled);
        assert_eq!(stats.cancelled, 1);
    }

    #[tokio::test]
    async fn test_run_loop_stops_on_shutdown() {
        let fx = Fixture::new();
        let queue = Arc::new(InMemoryRunQueue::new());
        let mut fleet = manager(&fx, queue, 1);
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        let stats = fleet.run(shutdown).await.unwrap();
        assert_eq!(stats, FleetStats::default());
    }
}
