//! Sandbox configuration.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Settings for one sandbox
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Directory under which run directories are created
    pub root: PathBuf,
    /// First poll interval while waiting on a job
    #[serde(default = "default_poll_initial_ms")]
    pub poll_initial_ms: u64,
    /// Longest poll interval
    #[serde(default = "default_poll_max_ms")]
    pub poll_max_ms: u64,
    /// Give up on a job after this long; `None` waits forever
    #[serde(default)]
    pub job_timeout_secs: Option<u64>,
    /// Scheduler priority for submitted jobs
    #[serde(default = "default_priority")]
    pub priority: i64,
    /// Force this many CPUs for every step
    #[serde(default)]
    pub cpus_override: Option<u32>,
}

fn default_poll_initial_ms() -> u64 {
    50
}

fn default_poll_max_ms() -> u64 {
    2000
}

fn default_priority() -> i64 {
    1
}

impl SandboxConfig {
    /// Create a config rooted at `root`
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            poll_initial_ms: default_poll_initial_ms(),
            poll_max_ms: default_poll_max_ms(),
            job_timeout_secs: None,
            priority: default_priority(),
            cpus_override: None,
        }
    }

    /// Set poll interval bounds
    #[must_use]
    pub fn with_polling(mut self, initial_ms: u64, max_ms: u64) -> Self {
        self.poll_initial_ms = initial_ms.max(1);
        self.poll_max_ms = max_ms.max(self.poll_initial_ms);
        self
    }

    /// Set the job timeout
    #[must_use]
    pub fn with_job_timeout(mut self, secs: u64) -> Self {
        self.job_timeout_secs = Some(secs);
        self
    }

    /// Set job priority
    #[must_use]
    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    /// Force a CPU count
    #[must_use]
    pub fn with_cpus(mut self, cpus: u32) -> Self {
        self.cpus_override = Some(cpus);
        self
    }

    /// Job timeout as a duration
    #[must_use]
    pub fn job_timeout(&self) -> Option<Duration> {
        self.job_timeout_secs.map(Duration::from_secs)
    }
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self::new(std::env::temp_dir().join("sluice"))
    }
}
