//! Slurm backend driven through `sbatch`, `sacct`, `scancel` and `scontrol`.
//!
//! Priorities map onto three partitions. Argument building and output
//! parsing are pure functions so they can be checked without a cluster.

use crate::priority::Priority;
use crate::scheduler::{JobHandle, JobId, JobInfo, JobRequest, JobScheduler, JobState, SchedulerError};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Output;
use tokio::process::Command;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

const SACCT_FORMAT: &str = "JobID,JobName,Start,End,State,Partition,Submit,ExitCode";
const SACCT_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// Slurm command paths and partition names
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlurmConfig {
    /// `sbatch` executable
    pub sbatch: PathBuf,
    /// `sacct` executable
    pub sacct: PathBuf,
    /// `scancel` executable
    pub scancel: PathBuf,
    /// `scontrol` executable
    pub scontrol: PathBuf,
    /// Partitions for low, medium and high priority
    pub partitions: [String; 3],
}

impl SlurmConfig {
    /// Create a config using commands from `PATH`
    #[must_use]
    pub fn new() -> Self {
        Self {
            sbatch: PathBuf::from("sbatch"),
            sacct: PathBuf::from("sacct"),
            scancel: PathBuf::from("scancel"),
            scontrol: PathBuf::from("scontrol"),
            partitions: [
                "sluice-low".to_string(),
                "sluice-medium".to_string(),
                "sluice-high".to_string(),
            ],
        }
    }

    /// Look for every command in one directory
    #[must_use]
    pub fn with_bin_dir(mut self, dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        self.sbatch = dir.join("sbatch");
        self.sacct = dir.join("sacct");
        self.scancel = dir.join("scancel");
        self.scontrol = dir.join("scontrol");
        self
    }

    /// Set partition names, lowest priority first
    #[must_use]
    pub fn with_partitions(mut self, low: &str, medium: &str, high: &str) -> Self {
        self.partitions = [low.to_string(), medium.to_string(), high.to_string()];
        self
    }

    /// Partition for a priority
    #[must_use]
    pub fn partition(&self, priority: Priority) -> &str {
        let idx = usize::try_from(priority.value()).unwrap_or(0);
        &self.partitions[idx.min(2)]
    }

    /// Priority a partition stands for, if it is one of ours
    #[must_use]
    pub fn priority_of(&self, partition: &str) -> Option<Priority> {
        self.partitions
            .iter()
            .position(|p| p == partition)
            .and_then(|i| i64::try_from(i).ok())
            .map(Priority::clamped)
    }

    /// Arguments for `sbatch`
    #[must_use]
    pub fn sbatch_args(&self, request: &JobRequest) -> Vec<String> {
        let mut args = vec![
            "--parsable".to_string(),
            "-D".to_string(),
            request.workdir.display().to_string(),
            "-J".to_string(),
            request.job_name.clone(),
            "-p".to_string(),
            self.partition(request.priority).to_string(),
            "-c".to_string(),
            request.resources.cpus.to_string(),
        ];
        if request.resources.memory_mb > 0 {
            args.push(format!("--mem={}M", request.resources.memory_mb));
        }
        if let Some(stdout) = &request.stdout {
            args.push(format!("--output={}", stdout.display()));
        }
        if let Some(stderr) = &request.stderr {
            args.push(format!("--error={}", stderr.display()));
        }

        // sbatch honours only one --dependency flag; clauses are ANDed with ','
        let mut clauses = Vec::new();
        for (kind, preds) in [("afterok", &request.after_ok), ("afterany", &request.after_any)] {
            if !preds.is_empty() {
                let ids: Vec<&str> = preds.iter().map(|h| h.id.0.as_str()).collect();
                clauses.push(format!("{kind}:{}", ids.join(":")));
            }
        }
        if !clauses.is_empty() {
            args.push(format!("--dependency={}", clauses.join(",")));
            args.push("--kill-on-invalid-dep=yes".to_string());
        }

        args.push(request.resolved_command().display().to_string());
        args.extend(request.args.iter().cloned());
        args
    }

    /// Arguments for `sacct`
    #[must_use]
    pub fn sacct_args(handles: &[JobHandle]) -> Vec<String> {
        let ids: Vec<&str> = handles.iter().map(|h| h.id.0.as_str()).collect();
        vec![
            "--parsable2".to_string(),
            "--noheader".to_string(),
            "--format".to_string(),
            SACCT_FORMAT.to_string(),
            "-j".to_string(),
            ids.join(","),
        ]
    }
}

impl Default for SlurmConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Map a Slurm job state to ours
#[must_use]
pub fn parse_state(raw: &str) -> JobState {
    // "CANCELLED by 1000"
    let word = raw.split_whitespace().next().unwrap_or("");
    match word {
        "PENDING" | "WAITING" | "REQUEUED" => JobState::Pending,
        "RUNNING" | "COMPLETING" | "PREEMPTED" | "RESIZING" | "SUSPENDED" => JobState::Running,
        "CANCELLED" | "BOOT_FAIL" | "DEADLINE" | "NODE_FAIL" | "TIMEOUT" => JobState::Cancelled,
        "FAILED" | "OUT_OF_MEMORY" => JobState::Failed,
        "COMPLETED" => JobState::Completed,
        _ => JobState::Unknown,
    }
}

/// Extract the job id from `sbatch` output
///
/// Accepts `--parsable` output (`id` or `id;cluster`) and the classic
/// `Submitted batch job <id>` line.
#[must_use]
pub fn parse_sbatch_output(out: &str) -> Option<JobId> {
    let line = out.lines().map(str::trim).find(|l| !l.is_empty())?;
    let id = match line.strip_prefix("Submitted batch job") {
        Some(rest) => rest.trim(),
        None => line.split(';').next().unwrap_or(""),
    };
    (!id.is_empty() && id.chars().all(|c| c.is_ascii_digit())).then(|| JobId(id.to_string()))
}

fn parse_time(raw: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(raw, SACCT_TIME_FORMAT)
        .ok()
        .map(|t| t.and_utc())
}

fn parse_exit_code(raw: &str) -> (Option<i32>, Option<i32>) {
    let mut parts = raw.split(':');
    let code = parts.next().and_then(|c| c.parse().ok());
    let signal = parts
        .next()
        .and_then(|s| s.parse().ok())
        .filter(|s: &i32| *s != 0);
    (code, signal)
}

/// Parse `sacct --parsable2 --noheader` rows
///
/// Job steps (`123.batch`) and jobs outside our partitions are skipped.
#[must_use]
pub fn parse_sacct(out: &str, config: &SlurmConfig) -> HashMap<JobId, JobInfo> {
    let mut infos = HashMap::new();
    for line in out.lines().filter(|l| !l.trim().is_empty()) {
        let fields: Vec<&str> = line.split('|').map(str::trim).collect();
        let [job_id, name, start, end, state, partition, submit, exit_code] = fields.as_slice() else {
            warn!(line, "Unexpected sacct row");
            continue;
        };
        if job_id.contains('.') {
            continue;
        }
        let Some(priority) = config.priority_of(partition) else {
            continue;
        };
        let (return_code, signal) = parse_exit_code(exit_code);
        let id = JobId(job_id.to_string());
        infos.insert(
            id.clone(),
            JobInfo {
                id,
                job_name: name.to_string(),
                state: parse_state(state),
                priority,
                return_code,
                signal,
                submit_time: parse_time(submit),
                start_time: parse_time(start),
                end_time: parse_time(end),
            },
        );
    }
    infos
}

fn unknown_info(handle: &JobHandle) -> JobInfo {
    JobInfo {
        id: handle.id.clone(),
        job_name: handle.job_name.clone(),
        state: JobState::Unknown,
        priority: handle.priority,
        return_code: None,
        signal: None,
        submit_time: None,
        start_time: None,
        end_time: None,
    }
}

/// Scheduler submitting to a Slurm cluster
pub struct SlurmScheduler {
    config: SlurmConfig,
    probed: OnceCell<Result<(), SchedulerError>>,
}

impl SlurmScheduler {
    /// Create a scheduler
    #[must_use]
    pub fn new(config: SlurmConfig) -> Self {
        Self {
            config,
            probed: OnceCell::new(),
        }
    }

    /// Get configuration
    #[must_use]
    pub fn config(&self) -> &SlurmConfig {
        &self.config
    }

    async fn call(program: &Path, args: &[String]) -> Result<Output, SchedulerError> {
        debug!(program = %program.display(), ?args, "Calling slurm");
        Command::new(program)
            .args(args)
            .output()
            .await
            .map_err(|e| SchedulerError::Unavailable {
                reason: format!("{}: {e}", program.display()),
            })
    }

    async fn call_ok(program: &Path, args: &[String]) -> Result<String, SchedulerError> {
        let out = Self::call(program, args).await?;
        if !out.status.success() {
            return Err(SchedulerError::Command {
                command: program.display().to_string(),
                reason: String::from_utf8_lossy(&out.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&out.stdout).into_owned())
    }
}

impl Default for SlurmScheduler {
    fn default() -> Self {
        Self::new(SlurmConfig::default())
    }
}

#[async_trait]
impl JobScheduler for SlurmScheduler {
    fn name(&self) -> &'static str {
        "slurm"
    }

    async fn probe(&self) -> Result<(), SchedulerError> {
        self.probed
            .get_or_init(|| async {
                let version = vec!["--version".to_string()];
                for tool in [
                    &self.config.sbatch,
                    &self.config.sacct,
                    &self.config.scancel,
                    &self.config.scontrol,
                ] {
                    if let Err(e) = Self::call_ok(tool, &version).await {
                        warn!(tool = %tool.display(), error = %e, "Slurm probe failed");
                        return Err(SchedulerError::Unavailable {
                            reason: e.to_string(),
                        });
                    }
                }
                info!(partitions = ?self.config.partitions, "Slurm is available");
                Ok(())
            })
            .await
            .clone()
    }

    async fn submit(&self, request: JobRequest) -> Result<JobHandle, SchedulerError> {
        request.check_paths()?;
        let args = self.config.sbatch_args(&request);
        let out = Self::call_ok(&self.config.sbatch, &args).await?;
        let id = parse_sbatch_output(&out).ok_or_else(|| SchedulerError::Command {
            command: "sbatch".to_string(),
            reason: format!("cannot parse output {:?}", out.trim()),
        })?;
        debug!(job = %id, name = %request.job_name, "Submitted to slurm");
        Ok(JobHandle::for_request(id, &request))
    }

    async fn get_state(&self, handle: &JobHandle) -> Result<JobState, SchedulerError> {
        let infos = self.accounting(std::slice::from_ref(handle)).await?;
        Ok(infos
            .get(&handle.id)
            .map_or(JobState::Unknown, |info| info.state))
    }

    async fn accounting(
        &self,
        handles: &[JobHandle],
    ) -> Result<HashMap<JobId, JobInfo>, SchedulerError> {
        if handles.is_empty() {
            return Ok(HashMap::new());
        }
        let out = Self::call_ok(&self.config.sacct, &SlurmConfig::sacct_args(handles)).await?;
        let mut infos = parse_sacct(&out, &self.config);
        for handle in handles {
            infos
                .entry(handle.id.clone())
                .or_insert_with(|| unknown_info(handle));
        }
        Ok(infos)
    }

    async fn cancel(&self, handle: &JobHandle) -> Result<(), SchedulerError> {
        Self::call_ok(&self.config.scancel, &[handle.id.0.clone()]).await?;
        debug!(job = %handle.id, "Cancelled slurm job");
        Ok(())
    }

    async fn set_priority(
        &self,
        handles: &[JobHandle],
        priority: i64,
    ) -> Result<(), SchedulerError> {
        if handles.is_empty() {
            return Ok(());
        }
        let partition = self.config.partition(Priority::clamped(priority));
        let ids: Vec<&str> = handles.iter().map(|h| h.id.0.as_str()).collect();
        let args = vec![
            "update".to_string(),
            "job".to_string(),
            ids.join(","),
            format!("Partition={partition}"),
        ];
        let out = Self::call(&self.config.scontrol, &args).await?;
        // exit status 1 means the job already started or finished
        match out.status.code() {
            Some(0 | 1) => Ok(()),
            _ => Err(SchedulerError::Command {
                command: "scontrol".to_string(),
                reason: String::from_utf8_lossy(&out.stderr).trim().to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(id: &str) -> JobHandle {
        JobHandle {
            id: JobId(id.to_string()),
            job_name: format!("job{id}"),
            priority: Priority::MEDIUM,
            after_ok: Vec::new(),
            after_any: Vec::new(),
        }
    }

    #[test]
    fn test_parse_state() {
        assert_eq!(parse_state("PENDING"), JobState::Pending);
        assert_eq!(parse_state("RUNNING"), JobState::Running);
        assert_eq!(parse_state("CANCELLED by 1000"), JobState::Cancelled);
        assert_eq!(parse_state("NODE_FAIL"), JobState::Cancelled);
        assert_eq!(parse_state("TIMEOUT"), JobState::Cancelled);
        assert_eq!(parse_state("FAILED"), JobState::Failed);
        assert_eq!(parse_state("COMPLETED"), JobState::Completed);
        assert_eq!(parse_state("SPECIAL_EXIT"), JobState::Unknown);
    }

    #[test]
    fn test_parse_sbatch_output() {
        assert_eq!(parse_sbatch_output("1234\n"), Some(JobId("1234".to_string())));
        assert_eq!(
            parse_sbatch_output("1234;cluster\n"),
            Some(JobId("1234".to_string()))
        );
        assert_eq!(
            parse_sbatch_output("Submitted batch job 77\n"),
            Some(JobId("77".to_string()))
        );
        assert_eq!(parse_sbatch_output("sbatch: error\n"), None);
        assert_eq!(parse_sbatch_output(""), None);
    }

    #[test]
    fn test_sbatch_args_dependencies() {
        let config = SlurmConfig::new();
        let req = JobRequest::new("step1", "/work", "run.sh")
            .with_args(["a.csv", "b.csv"])
            .with_priority(Priority::HIGH)
            .after_ok([handle("1"), handle("2")])
            .after_any([handle("3")]);
        let args = config.sbatch_args(&req);

        assert!(args.contains(&"sluice-high".to_string()));
        assert!(args.contains(&"--dependency=afterok:1:2,afterany:3".to_string()));
        assert!(args.contains(&"--kill-on-invalid-dep=yes".to_string()));
        let n = args.len();
        assert_eq!(args[n - 3], "/work/run.sh");
        assert_eq!(&args[n - 2..], ["a.csv", "b.csv"]);
    }

    #[test]
    fn test_sbatch_args_without_dependencies() {
        let req = JobRequest::new("s", "/work", "/bin/true");
        let args = SlurmConfig::new().sbatch_args(&req);
        assert!(!args.iter().any(|a| a.starts_with("--dependency")));
        assert!(args.contains(&"sluice-medium".to_string()));
    }

    #[test]
    fn test_parse_sacct() {
        let config = SlurmConfig::new();
        let out = "\
12|step1|2026-01-02T03:04:05|2026-01-02T03:05:00|COMPLETED|sluice-low|2026-01-02T03:00:00|0:0
12.batch|batch|2026-01-02T03:04:05|2026-01-02T03:05:00|COMPLETED||2026-01-02T03:00:00|0:0
13|step2|Unknown|Unknown|PENDING|sluice-high|2026-01-02T03:00:01|0:0
14|other|Unknown|Unknown|FAILED|debug|Unknown|1:0
15|killed|2026-01-02T03:04:05|2026-01-02T03:04:06|CANCELLED by 0|sluice-medium|2026-01-02T03:00:00|0:9
";
        let infos = parse_sacct(out, &config);
        assert_eq!(infos.len(), 3);

        let done = &infos[&JobId("12".to_string())];
        assert_eq!(done.state, JobState::Completed);
        assert_eq!(done.priority, Priority::LOW);
        assert_eq!(done.return_code, Some(0));
        assert!(done.start_time.is_some());

        let pending = &infos[&JobId("13".to_string())];
        assert_eq!(pending.state, JobState::Pending);
        assert_eq!(pending.start_time, None);

        let killed = &infos[&JobId("15".to_string())];
        assert_eq!(killed.state, JobState::Cancelled);
        assert_eq!(killed.signal, Some(9));
    }

    #[cfg(unix)]
    fn fake_tool(dir: &Path, name: &str, body: &str) {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_submit_and_account_with_fake_tools() {
        let bin = tempfile::tempdir().unwrap();
        let work = tempfile::tempdir().unwrap();
        fake_tool(bin.path(), "sbatch", "echo 501");
        fake_tool(
            bin.path(),
            "sacct",
            "echo '501|job|Unknown|Unknown|RUNNING|sluice-medium|Unknown|0:0'",
        );
        fake_tool(bin.path(), "scancel", "exit 0");
        fake_tool(bin.path(), "scontrol", "exit 1");
        fake_tool(work.path(), "run.sh", "true");

        let sched = SlurmScheduler::new(SlurmConfig::new().with_bin_dir(bin.path()));
        sched.probe().await.unwrap();

        let handle = sched
            .submit(JobRequest::new("job", work.path(), "run.sh"))
            .await
            .unwrap();
        assert_eq!(handle.id, JobId("501".to_string()));
        assert_eq!(sched.get_state(&handle).await.unwrap(), JobState::Running);

        let infos = sched.accounting(&[handle.clone(), self::handle("999")]).await.unwrap();
        assert_eq!(infos[&JobId("999".to_string())].state, JobState::Unknown);

        sched.set_priority(&[handle.clone()], 5).await.unwrap();
        sched.cancel(&handle).await.unwrap();
    }

    #[tokio::test]
    async fn test_probe_fails_without_tools() {
        let bin = tempfile::tempdir().unwrap();
        let sched = SlurmScheduler::new(SlurmConfig::new().with_bin_dir(bin.path()));
        assert!(matches!(
            sched.probe().await,
            Err(SchedulerError::Unavailable { .. })
        ));
    }
}
