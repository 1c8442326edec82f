//! Sandbox: executes one pipeline run.
//!
//! ```text
//! <root>/run_<id>/
//!   step<N>/input_data/step<N>_<input>.<ext>
//!   step<N>/output_data/step<N>_<output>.<ext>
//!   step<N>/logs/step<N>_stdout.txt
//!   output_data/<output>.<ext>
//!   run.json
//! ```
//!
//! Steps whose upstream steps are complete run concurrently. Every step and
//! cable first looks for a reusable ExecRecord. A reused step does not need
//! its inputs on disk; they are materialized only when something executes,
//! regenerating missing bytes through [`Sandbox::locate`].

use crate::cable::CableRunner;
use crate::component::{ComponentKind, ComponentState, ExecLog, RunComponent};
use crate::config::SandboxConfig;
use crate::error::{ComponentError, SandboxError};
use crate::location::SandboxLocationMap;
use crate::run::Run;
use crate::steps::StepScheduler;
use crate::wait::{Backoff, wait_for_job};
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use sluice_cluster::{
    ContainerExecutor, DriverExit, JobHandle, JobRequest, JobScheduler, JobState, LaunchSpec, Priority,
    Resources,
};
use sluice_core::{ContentIdentity, Md5Digest};
use sluice_plan::{Cable, CableSource, Computation, PipelineGraph, PipelineStep, Validator, XputSpec};
use sluice_storage::{
    ContentChecker, DatasetStore, ExecRecordOutput, ExecRecordStore, IntegrityCheckLog, Principal,
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Shared outcome of regenerating one digest
pub(crate) type RecoveryAttempt = Arc<OnceCell<Result<PathBuf, SandboxError>>>;

pub(crate) struct SandboxState {
    pub(crate) run: Run,
    pub(crate) locations: SandboxLocationMap,
    pub(crate) jobs: HashMap<u32, JobHandle>,
}

/// Executes a single run of a pipeline
pub struct Sandbox {
    pub(crate) config: SandboxConfig,
    pub(crate) pipeline: Arc<PipelineGraph>,
    pub(crate) store: Arc<ExecRecordStore>,
    scheduler: Arc<dyn JobScheduler>,
    launcher: Arc<dyn ContainerExecutor>,
    principal: Principal,
    cancel: CancellationToken,
    halt: CancellationToken,
    pub(crate) cables: CableRunner,
    used: AtomicBool,
    dir: PathBuf,
    state: Mutex<SandboxState>,
    pub(crate) recovered: Mutex<HashMap<Md5Digest, RecoveryAttempt>>,
    submissions: AtomicU64,
}

impl Sandbox {
    /// Create a sandbox for one run of `pipeline`
    #[must_use]
    pub fn new(
        config: SandboxConfig,
        pipeline: Arc<PipelineGraph>,
        store: Arc<ExecRecordStore>,
        scheduler: Arc<dyn JobScheduler>,
        launcher: Arc<dyn ContainerExecutor>,
        principal: Principal,
    ) -> Self {
        let run = Run::new(
            pipeline.name.clone(),
            principal.clone(),
            Vec::new(),
            pipeline.steps.len(),
            pipeline.outcables.len(),
        );
        let dir = config.root.join(format!("run_{}", run.id.as_uuid()));
        let cancel = CancellationToken::new();
        Self {
            config,
            pipeline,
            store,
            scheduler,
            launcher,
            principal,
            halt: cancel.child_token(),
            cancel,
            cables: CableRunner::new(),
            used: AtomicBool::new(false),
            dir,
            state: Mutex::new(SandboxState {
                run,
                locations: SandboxLocationMap::new(),
                jobs: HashMap::new(),
            }),
            recovered: Mutex::new(HashMap::new()),
            submissions: AtomicU64::new(0),
        }
    }

    /// Stop when `token` is cancelled
    #[must_use]
    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.halt = token.child_token();
        self.cancel = token;
        self
    }

    /// Token that cancels the run
    #[must_use]
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Directory holding this run's files
    #[must_use]
    pub fn run_dir(&self) -> &Path {
        &self.dir
    }

    /// Jobs submitted so far
    #[must_use]
    pub fn submissions(&self) -> u64 {
        self.submissions.load(Ordering::SeqCst)
    }

    /// Snapshot of the run
    #[must_use]
    pub fn run(&self) -> Run {
        self.with_state(|s| s.run.clone())
    }

    pub(crate) fn with_state<R>(&self, f: impl FnOnce(&mut SandboxState) -> R) -> R {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut state)
    }

    pub(crate) fn with_component<R>(
        &self,
        kind: ComponentKind,
        f: impl FnOnce(&mut RunComponent) -> Result<R, ComponentError>,
    ) -> Result<R, SandboxError> {
        self.with_state(|s| f(s.run.add_component(kind)))
            .map_err(SandboxError::from)
    }

    pub(crate) fn register_location(&self, md5: Md5Digest, path: &Path) {
        self.with_state(|s| s.locations.register(md5, path));
    }

    /// Run the pipeline over inputs already held by the dataset store
    ///
    /// Step failures and cancellation are recorded in the returned run.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyUsed` on a second call, `Validation` if the pipeline
    /// or inputs are rejected, and `Corruption` if stored state contradicts
    /// itself
    pub async fn execute_pipeline(&self, inputs: &[ContentIdentity]) -> Result<Run, SandboxError> {
        if self.used.swap(true, Ordering::SeqCst) {
            return Err(SandboxError::AlreadyUsed);
        }
        let validator = Validator::new();
        validator
            .validate(&self.pipeline)
            .map_err(SandboxError::Validation)?;
        validator
            .check_inputs(&self.pipeline, inputs)
            .map_err(SandboxError::Validation)?;
        let mut steps = StepScheduler::from_graph(&self.pipeline).map_err(|e| {
            SandboxError::Corruption {
                reason: e.to_string(),
            }
        })?;
        std::fs::create_dir_all(&self.dir).map_err(|e| SandboxError::io(&self.dir, &e))?;

        let run_id = self.with_state(|s| {
            s.run.inputs = inputs.to_vec();
            for input in inputs {
                if let Some(path) = self.store.datasets().path_of(&input.md5) {
                    s.locations.register(input.md5, path);
                }
            }
            s.run.id
        });
        info!(run = %run_id, pipeline = %self.pipeline.name, dir = %self.dir.display(), "starting run");

        let mut fatal: Option<SandboxError> = None;
        let mut in_flight = FuturesUnordered::new();
        loop {
            if !self.halt.is_cancelled() {
                for step in steps.take_ready() {
                    in_flight.push(self.step_task(step));
                }
            }
            let Some((step, outcome)) = in_flight.next().await else {
                break;
            };
            let marked = match outcome {
                Ok(()) => steps.mark_complete(step).map(|_| ()),
                Err(e) => {
                    if e.is_fatal() && fatal.is_none() {
                        warn!(step, error = %e, "fatal error, halting run");
                        fatal = Some(e);
                        self.halt.cancel();
                    } else {
                        info!(step, error = %e, "step did not complete");
                    }
                    steps.mark_failed(step).map(|doomed| {
                        for s in doomed {
                            self.doom(s, &format!("upstream step {step} did not complete"));
                        }
                    })
                }
            };
            if let Err(e) = marked {
                warn!(step, error = %e, "step bookkeeping out of sync");
            }
        }
        for s in steps.skip_remaining() {
            self.doom(s, "run halted");
        }

        if fatal.is_none() && !self.halt.is_cancelled() && steps.failed().is_empty() && steps.skipped().is_empty() {
            for idx in 0..self.pipeline.outcables.len() {
                if let Err(e) = self.run_outcable(idx).await {
                    if e.is_fatal() {
                        fatal = Some(e);
                        break;
                    }
                    info!(output = idx, error = %e, "output cable did not complete");
                }
            }
        }

        let run = self.with_state(|s| {
            s.run.cancelled = self.cancel.is_cancelled();
            s.run.finish();
            s.run.clone()
        });
        self.write_summary(&run);
        if let Some(e) = fatal {
            return Err(e);
        }
        info!(
            run = %run.id,
            successful = run.is_successful(),
            cancelled = run.cancelled,
            submissions = self.submissions(),
            "run finished"
        );
        Ok(run)
    }

    fn write_summary(&self, run: &Run) {
        let path = self.dir.join("run.json");
        let written = serde_json::to_vec_pretty(run)
            .map_err(|e| e.to_string())
            .and_then(|body| std::fs::write(&path, body).map_err(|e| e.to_string()));
        if let Err(e) = written {
            warn!(path = %path.display(), error = %e, "could not write run summary");
        }
    }

    async fn step_task(&self, step_num: u32) -> (u32, Result<(), SandboxError>) {
        let result = self.run_step(step_num).await;
        if let Err(e) = &result {
            self.settle_failure(ComponentKind::Step { step_num }, e);
        }
        (step_num, result)
    }

    /// Put a component that cannot finish into Failed or Cancelled
    fn settle_failure(&self, kind: ComponentKind, err: &SandboxError) {
        self.with_state(|s| {
            let component = s.run.add_component(kind);
            if component.get_state().is_terminal() {
                return;
            }
            if component.get_state() == ComponentState::Unstarted {
                if let Err(e) = component.mark_pending(Vec::new()) {
                    debug!(component = %kind, error = %e, "could not mark component pending");
                }
            }
            let reason = err.to_string();
            let cancelling = matches!(err, SandboxError::Cancelled)
                && component.get_state() != ComponentState::Saving;
            let settled = if cancelling {
                component.cancel(reason)
            } else {
                component.fail(reason)
            };
            if let Err(e) = settled {
                warn!(component = %kind, error = %e, "could not settle component");
            }
        });
    }

    /// Cancel a step that can never run
    fn doom(&self, step_num: u32, reason: &str) {
        self.with_state(|s| {
            let component = s.run.add_component(ComponentKind::Step { step_num });
            if component.get_state() == ComponentState::Unstarted {
                if let Err(e) = component.mark_pending(Vec::new()) {
                    debug!(step = step_num, error = %e, "could not mark step pending");
                }
            }
            if !component.get_state().is_terminal() {
                if let Err(e) = component.cancel(reason) {
                    warn!(step = step_num, error = %e, "could not cancel step");
                }
            }
        });
        debug!(step = step_num, reason, "step cancelled");
    }

    pub(crate) fn step_spec(&self, step_num: u32) -> Result<&PipelineStep, SandboxError> {
        self.pipeline
            .step(step_num)
            .ok_or_else(|| SandboxError::Corruption {
                reason: format!("pipeline {} has no step {step_num}", self.pipeline.name),
            })
    }

    pub(crate) fn step_dir(&self, step_num: u32) -> PathBuf {
        self.dir.join(format!("step{step_num}"))
    }

    pub(crate) fn input_path(&self, step_num: u32, spec: &XputSpec) -> PathBuf {
        self.step_dir(step_num)
            .join("input_data")
            .join(format!("step{step_num}_{}.{}", spec.name, spec.extension()))
    }

    pub(crate) fn output_path(&self, step_num: u32, spec: &XputSpec) -> PathBuf {
        self.step_dir(step_num)
            .join("output_data")
            .join(format!("step{step_num}_{}.{}", spec.name, spec.extension()))
    }

    pub(crate) fn outcable_path(&self, output_idx: usize) -> Option<PathBuf> {
        let cable = self.pipeline.outcables.get(output_idx)?;
        let ext = if cable.compound.is_some() { "csv" } else { "raw" };
        Some(self.dir.join("output_data").join(format!("{}.{ext}", cable.name)))
    }

    fn source_identity(&self, source: &CableSource) -> Result<ContentIdentity, SandboxError> {
        self.with_state(|s| match *source {
            CableSource::PipelineInput { idx } => s.run.inputs.get(idx).cloned(),
            CableSource::StepOutput { step, output } => s
                .run
                .by_kind(&ComponentKind::Step { step_num: step })
                .filter(|c| c.is_complete())
                .and_then(|c| c.outputs().get(output).cloned()),
        })
        .ok_or_else(|| SandboxError::execution(source, "source data is not available"))
    }

    async fn run_step(&self, step_num: u32) -> Result<(), SandboxError> {
        let step = self.step_spec(step_num)?;
        let mut inputs = Vec::with_capacity(step.inputs.len());
        for (input_idx, (spec, cable)) in step.inputs.iter().zip(&step.cables_in).enumerate() {
            let kind = ComponentKind::InputCable {
                step_num,
                input_idx,
            };
            let dest = self.input_path(step_num, spec);
            let identity = self
                .run_cable(kind, cable, spec.compound.as_deref(), &dest, false)
                .await?;
            inputs.push(identity);
        }

        let kind = ComponentKind::Step { step_num };
        self.with_component(kind, |c| c.mark_pending(inputs.clone()))?;
        let computation = step.method.computation();
        if let Some((record, grade)) = self.store.find_reusable(
            &computation,
            &inputs,
            &self.principal,
            &self.pipeline.datatypes,
        )? {
            self.with_component(kind, |c| c.reuse(&record))?;
            info!(step = step_num, record = %record.id, ?grade, "reusing step");
            return Ok(());
        }
        self.execute_step(step, &inputs).await
    }

    async fn execute_step(
        &self,
        step: &PipelineStep,
        inputs: &[ContentIdentity],
    ) -> Result<(), SandboxError> {
        let step_num = step.step_num;
        let kind = ComponentKind::Step { step_num };
        if self.halt.is_cancelled() {
            return Err(SandboxError::Cancelled);
        }
        self.place_inputs(step, inputs).await?;
        let (log, handle) = self.submit_step(step, false).await?;
        self.with_state(|s| s.jobs.insert(step_num, handle.clone()));
        self.with_component(kind, |c| c.start(log))?;

        let (state, code) = self.await_job(&handle).await?;
        self.with_component(kind, |c| {
            if let Some(log) = c.exec_log_mut() {
                log.finish(code);
            }
            Ok(())
        })?;
        let exit = code.map(DriverExit::from_code);
        if state != JobState::Completed || !exit.is_some_and(|e| e.is_success()) {
            let reason = match exit {
                Some(exit) => format!("job {} ended {state:?}, driver {exit}", handle.id),
                None => format!("job {} ended {state:?} without an exit code", handle.id),
            };
            return Err(SandboxError::execution(kind, reason));
        }
        self.with_component(kind, RunComponent::begin_saving)?;

        let checker = ContentChecker::new(&self.pipeline.datatypes);
        let mut outputs = Vec::with_capacity(step.outputs.len());
        let mut checks = Vec::with_capacity(step.outputs.len());
        for spec in &step.outputs {
            let path = self.output_path(step_num, spec);
            let compound = spec.compound.as_deref().and_then(|c| self.pipeline.compound(c));
            let check = checker.check(&path, compound, &spec.rows);
            if let Some(identity) = check.identity.clone() {
                if spec.retain && check.is_ok() {
                    self.store.datasets().register(&path, &spec.name)?;
                }
                self.register_location(identity.md5, &path);
                outputs.push(if check.is_ok() {
                    ExecRecordOutput::checked(identity)
                } else {
                    ExecRecordOutput::failed(identity)
                });
            }
            checks.push(check);
        }
        let all_ok = checks.iter().all(|c| c.is_ok());
        self.with_component(kind, |c| {
            c.content_checks.extend(checks);
            Ok(())
        })?;
        if outputs.len() != step.outputs.len() {
            return Err(SandboxError::execution(kind, "an output was not written"));
        }

        let record = self.store.create(
            step.method.computation(),
            inputs.to_vec(),
            outputs,
            self.principal.clone(),
        )?;
        if !all_ok {
            return Err(SandboxError::execution(kind, "output content check failed"));
        }
        self.with_component(kind, |c| c.complete(&record))?;
        info!(step = step_num, record = %record.id, "step complete");
        Ok(())
    }

    /// Make sure each input file holds the right bytes
    pub(crate) async fn place_inputs(
        &self,
        step: &PipelineStep,
        inputs: &[ContentIdentity],
    ) -> Result<(), SandboxError> {
        for (spec, identity) in step.inputs.iter().zip(inputs) {
            let dest = self.input_path(step.step_num, spec);
            if dest.is_file() && IntegrityCheckLog::check(&dest, Some(identity.md5)).is_ok() {
                self.register_location(identity.md5, &dest);
                continue;
            }
            let source = self.locate(identity).await?;
            self.cables.place(&source, &dest)?;
            self.register_location(identity.md5, &dest);
        }
        Ok(())
    }

    fn install(&self, kind: ComponentKind, source: &Path, dest: &Path, md5: Option<Md5Digest>) -> Result<(), SandboxError> {
        let check = IntegrityCheckLog::check(source, md5);
        if !check.is_ok() {
            self.with_component(kind, |c| {
                c.integrity_checks.push(check);
                Ok(())
            })?;
            return Err(SandboxError::execution(
                kind,
                format!("integrity check failed for {}", source.display()),
            ));
        }
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent).map_err(|e| SandboxError::io(parent, &e))?;
        }
        std::fs::copy(source, dest).map_err(|e| SandboxError::io(source, &e))?;
        Ok(())
    }

    /// Stage code, write the launch wrapper and submit the job
    pub(crate) async fn submit_step(
        &self,
        step: &PipelineStep,
        recovering: bool,
    ) -> Result<(ExecLog, JobHandle), SandboxError> {
        let step_num = step.step_num;
        let kind = ComponentKind::Step { step_num };
        let method = &step.method;
        let step_dir = self.step_dir(step_num);
        for sub in ["input_data", "output_data", "logs"] {
            let dir = step_dir.join(sub);
            std::fs::create_dir_all(&dir).map_err(|e| SandboxError::io(&dir, &e))?;
        }

        if let (Some(driver), Some(source)) = (&method.driver, &method.driver_source) {
            self.install(kind, source, &step_dir.join(driver), method.driver_md5)?;
        }
        for dep in &method.dependencies {
            self.install(kind, &dep.source, &step_dir.join(&dep.dest), dep.md5)?;
        }
        for spec in &step.outputs {
            let stale = self.output_path(step_num, spec);
            match std::fs::remove_file(&stale) {
                Err(e) if e.kind() != std::io::ErrorKind::NotFound => {
                    warn!(path = %stale.display(), error = %e, "could not clear stale output");
                }
                _ => {}
            }
        }

        let mut launch = LaunchSpec::new(&step_dir);
        if let Some(driver) = &method.driver {
            launch = launch.with_driver(driver.clone());
        }
        for dep in &method.dependencies {
            launch = launch.with_dependency(dep.dest.clone());
        }
        if let Some(container) = &method.container {
            launch = launch.with_container(container);
        }
        launch.image_id = method.image_id.clone();
        for spec in &step.inputs {
            launch = launch.with_input(self.input_path(step_num, spec));
        }
        for spec in &step.outputs {
            launch = launch.with_output(self.output_path(step_num, spec));
        }
        let wrapper = self
            .launcher
            .build_launch(&launch)
            .map_err(|e| SandboxError::submission(kind, e))?;

        let upstream: Vec<JobHandle> = {
            let deps = self.pipeline.step_dependencies(step_num);
            self.with_state(|s| deps.iter().filter_map(|d| s.jobs.get(d).cloned()).collect())
        };
        let tag = if recovering { "_recovery" } else { "" };
        let logs = step_dir.join("logs");
        let stdout = logs.join(format!("step{step_num}{tag}_stdout.txt"));
        let stderr = logs.join(format!("step{step_num}{tag}_stderr.txt"));
        let request = JobRequest::new(format!("step{step_num}_{}", method.name), &step_dir, wrapper)
            .with_resources(Resources {
                cpus: self.config.cpus_override.unwrap_or(method.threads).max(1),
                memory_mb: method.memory_mb,
            })
            .with_priority(Priority::clamped(self.config.priority))
            .after_ok(upstream)
            .with_logs(&stdout, &stderr)
            .with_principal(self.principal.as_str());

        let handle = self
            .scheduler
            .submit(request)
            .await
            .map_err(|e| SandboxError::submission(kind, e))?;
        self.submissions.fetch_add(1, Ordering::SeqCst);
        info!(
            step = step_num,
            job = %handle.id,
            scheduler = self.scheduler.name(),
            launcher = self.launcher.name(),
            recovering,
            "submitted step"
        );
        let log = ExecLog::started()
            .with_job(handle.clone())
            .with_logs(stdout, stderr);
        Ok((log, handle))
    }

    /// Wait for a job and fetch its exit code
    pub(crate) async fn await_job(
        &self,
        handle: &JobHandle,
    ) -> Result<(JobState, Option<i32>), SandboxError> {
        let backoff = Backoff::new(
            Duration::from_millis(self.config.poll_initial_ms),
            Duration::from_millis(self.config.poll_max_ms),
        );
        let state = wait_for_job(
            self.scheduler.as_ref(),
            handle,
            backoff,
            self.config.job_timeout(),
            &self.halt,
        )
        .await?;
        let code = match self.scheduler.accounting(std::slice::from_ref(handle)).await {
            Ok(info) => info.get(&handle.id).and_then(|i| i.return_code),
            Err(e) => {
                warn!(job = %handle.id, error = %e, "no accounting for job");
                None
            }
        };
        Ok((state, code))
    }

    /// Run a cable into `dest`
    ///
    /// Unless `materialize` is set, a reusable record satisfies the cable
    /// without moving any bytes.
    async fn run_cable(
        &self,
        kind: ComponentKind,
        cable: &Cable,
        dest_compound: Option<&str>,
        dest: &Path,
        materialize: bool,
    ) -> Result<ContentIdentity, SandboxError> {
        let result = self
            .run_cable_inner(kind, cable, dest_compound, dest, materialize)
            .await;
        if let Err(e) = &result {
            self.settle_failure(kind, e);
        }
        result
    }

    async fn run_cable_inner(
        &self,
        kind: ComponentKind,
        cable: &Cable,
        dest_compound: Option<&str>,
        dest: &Path,
        materialize: bool,
    ) -> Result<ContentIdentity, SandboxError> {
        let source = self.source_identity(&cable.source)?;
        self.with_component(kind, |c| c.mark_pending(vec![source.clone()]))?;
        let computation = Computation::Cable(cable.signature());
        let reusable = self.store.find_reusable(
            &computation,
            std::slice::from_ref(&source),
            &self.principal,
            &self.pipeline.datatypes,
        )?;

        if let Some((record, _)) = reusable {
            let recorded = record.output_identities().into_iter().next().ok_or_else(|| {
                SandboxError::Corruption {
                    reason: format!("cable record {} has no output", record.id),
                }
            })?;
            if !materialize {
                self.with_component(kind, |c| c.reuse(&record))?;
                debug!(component = %kind, record = %record.id, "reusing cable");
                return Ok(recorded);
            }
            let moved = self.move_data(cable, &source, dest, dest_compound).await?;
            if moved.md5 == recorded.md5 {
                self.with_component(kind, |c| c.reuse(&record))?;
                return Ok(moved);
            }
            warn!(component = %kind, record = %record.id, "cable output disagrees with its record");
            self.store.quarantine(&record.id)?;
            let mut log = ExecLog::started();
            log.finish(Some(0));
            self.with_component(kind, |c| c.start(log))?;
            return self.save_cable(kind, computation, source, moved);
        }

        self.with_component(kind, |c| c.start(ExecLog::started()))?;
        let moved = self.move_data(cable, &source, dest, dest_compound).await?;
        self.with_component(kind, |c| {
            if let Some(log) = c.exec_log_mut() {
                log.finish(Some(0));
            }
            Ok(())
        })?;
        self.save_cable(kind, computation, source, moved)
    }

    fn save_cable(
        &self,
        kind: ComponentKind,
        computation: Computation,
        source: ContentIdentity,
        moved: ContentIdentity,
    ) -> Result<ContentIdentity, SandboxError> {
        self.with_component(kind, RunComponent::begin_saving)?;
        let record = self.store.create(
            computation,
            vec![source],
            vec![ExecRecordOutput::checked(moved.clone())],
            self.principal.clone(),
        )?;
        self.with_component(kind, |c| c.complete(&record))?;
        Ok(moved)
    }

    /// Locate the source and run the cable, retrying once from fresh bytes
    pub(crate) async fn move_data(
        &self,
        cable: &Cable,
        source: &ContentIdentity,
        dest: &Path,
        dest_compound: Option<&str>,
    ) -> Result<ContentIdentity, SandboxError> {
        let path = self.locate(source).await?;
        let moved = match self.cables.run(cable, &path, dest, source, dest_compound) {
            Ok(moved) => moved,
            Err(e) if e.is_recoverable() => {
                warn!(source = %path.display(), error = %e, "cable source unusable, locating again");
                self.with_state(|s| s.locations.forget(&source.md5));
                let path = self.locate(source).await?;
                self.cables.run(cable, &path, dest, source, dest_compound)?
            }
            Err(e) => return Err(e.into()),
        };
        self.register_location(moved.md5, dest);
        Ok(moved)
    }

    async fn run_outcable(&self, output_idx: usize) -> Result<ContentIdentity, SandboxError> {
        let kind = ComponentKind::OutputCable { output_idx };
        let (cable, compound) = match self.pipeline.outcables.get(output_idx) {
            Some(oc) => (oc.as_cable(), oc.compound.clone()),
            None => {
                return Err(SandboxError::Corruption {
                    reason: format!("no output cable {output_idx}"),
                });
            }
        };
        let dest = self
            .outcable_path(output_idx)
            .ok_or_else(|| SandboxError::Corruption {
                reason: format!("no output cable {output_idx}"),
            })?;
        let identity = self
            .run_cable(kind, &cable, compound.as_deref(), &dest, true)
            .await?;
        let name = &self.pipeline.outcables[output_idx].name;
        self.store.datasets().register(&dest, name)?;
        info!(output = %name, md5 = %identity.md5, "pipeline output written");
        Ok(identity)
    }
}

/// Check input files against the pipeline and copy them into the store
///
/// Returns typed identities suitable for [`Sandbox::execute_pipeline`].
///
/// # Errors
///
/// Returns `Validation` for the wrong number of files and an execution
/// error for a file that fails its content check
pub fn register_inputs(
    pipeline: &PipelineGraph,
    datasets: &dyn DatasetStore,
    paths: &[PathBuf],
) -> Result<Vec<ContentIdentity>, SandboxError> {
    if paths.len() != pipeline.inputs.len() {
        return Err(SandboxError::Validation(vec![
            sluice_plan::ValidationError::InputArity {
                expected: pipeline.inputs.len(),
                found: paths.len(),
            },
        ]));
    }
    let checker = ContentChecker::new(&pipeline.datatypes);
    paths
        .iter()
        .zip(&pipeline.inputs)
        .map(|(path, spec)| {
            let compound = spec.compound.as_deref().and_then(|c| pipeline.compound(c));
            let check = checker.check(path, compound, &spec.rows);
            if !check.is_ok() {
                return Err(SandboxError::execution(
                    format!("input {}", spec.name),
                    format!("{:?}", check.defects),
                ));
            }
            let identity = check.identity.ok_or_else(|| {
                SandboxError::execution(format!("input {}", spec.name), "unreadable")
            })?;
            datasets.register(path, &spec.name)?;
            Ok(identity)
        })
        .collect()
}
