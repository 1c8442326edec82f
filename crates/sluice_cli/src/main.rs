//! SLUICE CLI
//!
//! Runs pipelines in sandboxes, drives a fleet over a batch of requests,
//! checks backend tooling, and plans or applies dataset removal.

#![warn(missing_docs)]
#![warn(clippy::all)]

use clap::{Parser, Subcommand, ValueEnum};
use color_eyre::Result;
use color_eyre::eyre::{WrapErr, eyre};
use serde::Deserialize;
use sluice_cluster::{
    ContainerExecutor, IsolatedConfig, IsolatedLauncher, JobScheduler, LocalScheduler,
    LocalSchedulerConfig, NativeLauncher, Priority, SlurmConfig, SlurmScheduler,
};
use sluice_core::Md5Digest;
use sluice_plan::PipelineGraph;
use sluice_runtime::{
    FleetConfig, FleetManager, InMemoryRunQueue, RunRequest, Sandbox, register_inputs,
};
use sluice_storage::{ExecRecordStore, FsDatasetStore, Principal};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "sluice")]
#[command(about = "SLUICE - Pipeline execution with reuse and recovery", long_about = None)]
struct Cli {
    /// Fleet configuration file (JSON)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
    /// Directory holding datasets and execution records
    #[arg(long, global = true, default_value = "sluice-store")]
    store: PathBuf,
    /// Sandbox root, overriding the config file
    #[arg(long, global = true)]
    sandbox_root: Option<PathBuf>,
    /// Job scheduler backend
    #[arg(long, global = true, value_enum, default_value_t = Backend::Local)]
    backend: Backend,
    /// Directory holding the slurm commands
    #[arg(long, global = true)]
    slurm_bin: Option<PathBuf>,
    /// Run drivers inside this singularity container
    #[arg(long, global = true)]
    container: Option<PathBuf>,
    /// Emit logs as JSON
    #[arg(long, global = true)]
    log_json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Backend {
    /// Child processes on this host
    Local,
    /// Slurm via sbatch and sacct
    Slurm,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a pipeline once
    Run {
        /// Pipeline file (JSON)
        #[arg(short, long)]
        pipeline: PathBuf,
        /// Input files, in pipeline input order
        #[arg(short, long, num_args = 1..)]
        input: Vec<PathBuf>,
        /// Principal the run executes for
        #[arg(long, default_value = "default")]
        principal: String,
        /// low, medium, high or an integer
        #[arg(long, default_value = "medium")]
        priority: String,
        /// Give up on any single job after this many seconds
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// Run a batch of requests through the fleet manager
    Fleet {
        /// Request file (JSON list)
        #[arg(short, long)]
        requests: PathBuf,
        /// Most runs executing at once
        #[arg(long)]
        max_runs: Option<usize>,
    },
    /// Check that the scheduler and launcher tooling works
    Probe,
    /// Show what removing a dataset would cascade into
    RemovalPlan {
        /// Dataset MD5 (hex)
        #[arg(long)]
        md5: String,
    },
    /// Mark execution records touching a dataset as redacted
    Redact {
        /// Dataset MD5 (hex)
        #[arg(long)]
        md5: String,
    },
}

/// One entry of a fleet request file
#[derive(Debug, Deserialize)]
struct RequestEntry {
    pipeline: PathBuf,
    inputs: Vec<PathBuf>,
    #[serde(default = "default_principal")]
    principal: String,
    #[serde(default)]
    priority: Option<String>,
}

fn default_principal() -> String {
    "default".to_string()
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("sluice=info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_config(cli: &Cli) -> Result<FleetConfig> {
    let mut config = match &cli.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .wrap_err_with(|| format!("reading config {}", path.display()))?;
            serde_json::from_str(&text).wrap_err_with(|| format!("parsing config {}", path.display()))?
        }
        None => FleetConfig::default(),
    };
    if let Some(root) = &cli.sandbox_root {
        config.sandbox.root.clone_from(root);
    }
    Ok(config)
}

fn load_pipeline(path: &Path) -> Result<Arc<PipelineGraph>> {
    let text = std::fs::read_to_string(path).wrap_err_with(|| format!("reading pipeline {}", path.display()))?;
    let graph: PipelineGraph =
        serde_json::from_str(&text).wrap_err_with(|| format!("parsing pipeline {}", path.display()))?;
    Ok(Arc::new(graph))
}

fn parse_priority(text: &str) -> Result<i64> {
    Priority::parse(text)
        .map(|p| p.value())
        .map_err(|bad| eyre!("invalid priority: {bad}"))
}

fn parse_md5(text: &str) -> Result<Md5Digest> {
    Md5Digest::from_hex(text).map_err(|e| eyre!("invalid md5 {text}: {e}"))
}

fn open_store(root: &Path) -> Result<Arc<ExecRecordStore>> {
    let datasets = Arc::new(FsDatasetStore::open(root.join("datasets"))?);
    let store = ExecRecordStore::open(root.join("records.redb"), datasets)
        .wrap_err_with(|| format!("opening store under {}", root.display()))?;
    Ok(Arc::new(store))
}

fn scheduler(cli: &Cli) -> Arc<dyn JobScheduler> {
    match cli.backend {
        Backend::Local => Arc::new(LocalScheduler::new(LocalSchedulerConfig::default())),
        Backend::Slurm => {
            let config = match &cli.slurm_bin {
                Some(dir) => SlurmConfig::new().with_bin_dir(dir),
                None => SlurmConfig::new(),
            };
            Arc::new(SlurmScheduler::new(config))
        }
    }
}

fn launcher(cli: &Cli) -> Arc<dyn ContainerExecutor> {
    match &cli.container {
        Some(container) => Arc::new(IsolatedLauncher::new(
            IsolatedConfig::new().with_default_container(container),
        )),
        None => Arc::new(NativeLauncher::new()),
    }
}

/// Cancel `token` on ctrl-c
fn cancel_on_interrupt(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, cancelling");
            token.cancel();
        }
    });
}

async fn run_once(
    cli: &Cli,
    pipeline: &Path,
    inputs: &[PathBuf],
    principal: &str,
    priority: &str,
    timeout: Option<u64>,
) -> Result<()> {
    let mut config = load_config(cli)?.sandbox.with_priority(parse_priority(priority)?);
    if let Some(secs) = timeout {
        config = config.with_job_timeout(secs);
    }
    let pipeline = load_pipeline(pipeline)?;
    let store = open_store(&cli.store)?;
    let identities = register_inputs(&pipeline, store.datasets().as_ref(), inputs)?;

    let sandbox = Sandbox::new(
        config,
        pipeline,
        store,
        scheduler(cli),
        launcher(cli),
        Principal::new(principal),
    );
    cancel_on_interrupt(sandbox.cancel_token());
    let run = sandbox.execute_pipeline(&identities).await?;

    println!("{}", serde_json::to_string_pretty(&run)?);
    if run.is_successful() {
        info!(run = %run.id, reused = ?run.reused_steps(), "run succeeded");
        Ok(())
    } else if run.cancelled {
        Err(eyre!("run {} was cancelled", run.id))
    } else {
        let failing = run.failing_component().map(|c| c.kind.to_string());
        Err(eyre!("run {} failed at {}", run.id, failing.unwrap_or_else(|| "unknown".to_string())))
    }
}

async fn run_fleet(cli: &Cli, requests: &Path, max_runs: Option<usize>) -> Result<()> {
    let mut config = load_config(cli)?;
    if let Some(max) = max_runs {
        config = config.with_max_runs(max);
    }
    let text = std::fs::read_to_string(requests)
        .wrap_err_with(|| format!("reading requests {}", requests.display()))?;
    let entries: Vec<RequestEntry> = serde_json::from_str(&text)?;

    let store = open_store(&cli.store)?;
    let queue = Arc::new(InMemoryRunQueue::new());
    let mut ids = Vec::with_capacity(entries.len());
    for entry in entries {
        let pipeline = load_pipeline(&entry.pipeline)?;
        let inputs = register_inputs(&pipeline, store.datasets().as_ref(), &entry.inputs)?;
        let priority = match &entry.priority {
            Some(p) => parse_priority(p)?,
            None => config.sandbox.priority,
        };
        let request = RunRequest::new(pipeline, inputs, Principal::new(entry.principal)).with_priority(priority);
        ids.push(queue.push(request));
    }
    info!(requests = ids.len(), "queued run requests");

    let shutdown = CancellationToken::new();
    cancel_on_interrupt(shutdown.clone());
    {
        let queue = Arc::clone(&queue);
        let shutdown = shutdown.clone();
        let interval = Duration::from_millis(config.poll_interval_ms.max(1));
        tokio::spawn(async move {
            while queue.outstanding() > 0 && !shutdown.is_cancelled() {
                tokio::time::sleep(interval).await;
            }
            shutdown.cancel();
        });
    }

    let mut fleet = FleetManager::new(config, queue.clone(), store, scheduler(cli), launcher(cli));
    let stats = fleet.run(shutdown).await?;

    for id in &ids {
        println!("{id}\t{:?}", queue.status(id));
    }
    println!("{}", serde_json::to_string_pretty(&stats)?);
    if stats.failed > 0 {
        return Err(eyre!("{} of {} runs failed", stats.failed, stats.claimed));
    }
    Ok(())
}

async fn probe(cli: &Cli) -> Result<()> {
    let scheduler = scheduler(cli);
    let launcher = launcher(cli);
    let scheduled = scheduler.probe().await;
    let launched = launcher.probe().await;
    match &scheduled {
        Ok(()) => println!("scheduler ({:?}): ok", cli.backend),
        Err(e) => println!("scheduler ({:?}): {e}", cli.backend),
    }
    match &launched {
        Ok(()) => println!("launcher: ok"),
        Err(e) => println!("launcher: {e}"),
    }
    scheduled?;
    launched?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match &cli.command {
        Commands::Run {
            pipeline,
            input,
            principal,
            priority,
            timeout,
        } => run_once(&cli, pipeline, input, principal, priority, *timeout).await,
        Commands::Fleet { requests, max_runs } => run_fleet(&cli, requests, *max_runs).await,
        Commands::Probe => probe(&cli).await,
        Commands::RemovalPlan { md5 } => {
            let md5 = parse_md5(md5)?;
            let store = open_store(&cli.store)?;
            let plan = store.build_removal_plan(&md5);
            println!("{}", serde_json::to_string_pretty(&plan)?);
            Ok(())
        }
        Commands::Redact { md5 } => {
            let md5 = parse_md5(md5)?;
            let store = open_store(&cli.store)?;
            let redacted = store.redact(&md5)?;
            info!(%md5, records = redacted.len(), "redacted");
            for id in redacted {
                println!("{id}");
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_run_command() {
        let cli = Cli::try_parse_from([
            "sluice",
            "--backend",
            "slurm",
            "run",
            "--pipeline",
            "p.json",
            "--input",
            "a.csv",
            "b.csv",
            "--priority",
            "high",
        ])
        .unwrap();
        assert_eq!(cli.backend, Backend::Slurm);
        let Commands::Run { input, priority, .. } = cli.command else {
            panic!("expected run");
        };
        assert_eq!(input.len(), 2);
        assert_eq!(parse_priority(&priority).unwrap(), 2);
    }

    #[test]
    fn test_priority_rejects_words() {
        assert!(parse_priority("urgent").is_err());
        assert_eq!(parse_priority("7").unwrap(), 2);
    }

    #[test]
    fn test_config_file_and_overlay() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("fleet.json");
        std::fs::write(&path, r#"{"max_runs": 9, "sandbox": {"root": "/srv/runs"}}"#).unwrap();
        let cli = Cli::try_parse_from([
            "sluice",
            "--config",
            path.to_str().unwrap(),
            "--sandbox-root",
            "/scratch",
            "probe",
        ])
        .unwrap();
        let config = load_config(&cli).unwrap();
        assert_eq!(config.max_runs, 9);
        assert_eq!(config.poll_interval_ms, 500);
        assert_eq!(config.sandbox.root, PathBuf::from("/scratch"));
        assert_eq!(config.sandbox.priority, 1);
    }

    #[test]
    fn test_request_entry_defaults() {
        let entries: Vec<RequestEntry> =
            serde_json::from_str(r#"[{"pipeline": "p.json", "inputs": ["a.csv"]}]"#).unwrap();
        assert_eq!(entries[0].principal, "default");
        assert!(entries[0].priority.is_none());
    }
}
