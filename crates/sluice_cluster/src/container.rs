//! Launch scripts wrapping a step's driver.
//!
//! A step directory holds `input_data/`, `output_data/` and the driver with
//! its dependencies. Both backends write an executable bash wrapper into the
//! step directory that takes no arguments, so the scheduler only ever runs
//! the wrapper. Inputs come before outputs on the driver command line.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tokio::sync::OnceCell;
use tracing::{debug, info};

/// Input mount inside a container
pub const MOUNT_INPUT: &str = "/mnt/input";
/// Output mount inside a container
pub const MOUNT_OUTPUT: &str = "/mnt/output";
/// Step directory mount inside a container
pub const MOUNT_BIN: &str = "/mnt/bin";

/// Everything needed to build a wrapper for one step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchSpec {
    /// Step directory on the host
    pub step_dir: PathBuf,
    /// Input files, under `step_dir/input_data`
    pub inputs: Vec<PathBuf>,
    /// Output files, under `step_dir/output_data`
    pub outputs: Vec<PathBuf>,
    /// Driver file name inside `step_dir`; `None` runs the image entry point
    pub driver: Option<String>,
    /// Dependency paths relative to `step_dir`
    pub dependencies: Vec<String>,
    /// Image identifier, informational
    pub image_id: Option<String>,
    /// Container artifact on the host
    pub container: Option<PathBuf>,
}

impl LaunchSpec {
    /// Create a spec for a step directory
    #[must_use]
    pub fn new(step_dir: impl Into<PathBuf>) -> Self {
        Self {
            step_dir: step_dir.into(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            driver: None,
            dependencies: Vec::new(),
            image_id: None,
            container: None,
        }
    }

    /// Set the driver
    #[must_use]
    pub fn with_driver(mut self, driver: impl Into<String>) -> Self {
        self.driver = Some(driver.into());
        self
    }

    /// Add an input file
    #[must_use]
    pub fn with_input(mut self, path: impl Into<PathBuf>) -> Self {
        self.inputs.push(path.into());
        self
    }

    /// Add an output file
    #[must_use]
    pub fn with_output(mut self, path: impl Into<PathBuf>) -> Self {
        self.outputs.push(path.into());
        self
    }

    /// Add a dependency path
    #[must_use]
    pub fn with_dependency(mut self, path: impl Into<String>) -> Self {
        self.dependencies.push(path.into());
        self
    }

    /// Set the container artifact
    #[must_use]
    pub fn with_container(mut self, path: impl Into<PathBuf>) -> Self {
        self.container = Some(path.into());
        self
    }

    /// Host input directory
    #[must_use]
    pub fn input_dir(&self) -> PathBuf {
        self.step_dir.join("input_data")
    }

    /// Host output directory
    #[must_use]
    pub fn output_dir(&self) -> PathBuf {
        self.step_dir.join("output_data")
    }

    fn wrapper_path(&self) -> PathBuf {
        let stem = self.driver.as_deref().unwrap_or("launch");
        self.step_dir.join(format!("{stem}_wrapper.sh"))
    }

    /// Inputs and outputs rewritten under the container mounts
    ///
    /// # Errors
    ///
    /// Returns `PathOutsideMount` for a file outside its host directory
    pub fn mapped_args(&self) -> Result<Vec<String>, LaunchError> {
        let (input_dir, output_dir) = (self.input_dir(), self.output_dir());
        let ins = self.inputs.iter().map(|p| remap(p, &input_dir, MOUNT_INPUT));
        let outs = self.outputs.iter().map(|p| remap(p, &output_dir, MOUNT_OUTPUT));
        ins.chain(outs).collect()
    }

    /// Inputs and outputs as host paths, checked against their directories
    ///
    /// # Errors
    ///
    /// Returns `PathOutsideMount` for a file outside its host directory
    pub fn host_args(&self) -> Result<Vec<String>, LaunchError> {
        let (input_dir, output_dir) = (self.input_dir(), self.output_dir());
        let ins = self.inputs.iter().map(|p| within(p, &input_dir));
        let outs = self.outputs.iter().map(|p| within(p, &output_dir));
        ins.chain(outs).collect()
    }
}

fn within(path: &Path, dir: &Path) -> Result<String, LaunchError> {
    if path.strip_prefix(dir).is_err() {
        return Err(LaunchError::PathOutsideMount {
            path: path.to_path_buf(),
            dir: dir.to_path_buf(),
        });
    }
    Ok(path.display().to_string())
}

fn remap(path: &Path, dir: &Path, mount: &str) -> Result<String, LaunchError> {
    let rel = path
        .strip_prefix(dir)
        .map_err(|_| LaunchError::PathOutsideMount {
            path: path.to_path_buf(),
            dir: dir.to_path_buf(),
        })?;
    Ok(Path::new(mount).join(rel).display().to_string())
}

/// Quote a word for bash
#[must_use]
pub fn shell_quote(word: &str) -> String {
    let safe = !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "_@%+=:,./-".contains(c));
    if safe {
        word.to_string()
    } else {
        format!("'{}'", word.replace('\'', r#"'"'"'"#))
    }
}

fn write_wrapper(path: &Path, dir: &Path, command: &str) -> Result<PathBuf, LaunchError> {
    let body = format!(
        "#!/usr/bin/env bash\ncd {}\n{command}\n",
        shell_quote(&dir.display().to_string())
    );
    std::fs::write(path, body).map_err(|e| LaunchError::io(path, &e))?;
    make_executable(path)?;
    debug!(wrapper = %path.display(), "Wrote launch wrapper");
    Ok(path.to_path_buf())
}

#[cfg(unix)]
fn make_executable(path: &Path) -> Result<(), LaunchError> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = std::fs::metadata(path)
        .map_err(|e| LaunchError::io(path, &e))?
        .permissions();
    perms.set_mode(perms.mode() | 0o111);
    std::fs::set_permissions(path, perms).map_err(|e| LaunchError::io(path, &e))
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) -> Result<(), LaunchError> {
    Ok(())
}

/// Launch errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LaunchError {
    /// Backend needs a driver
    #[error("The {backend} launcher requires a driver")]
    MissingDriver { backend: &'static str },

    /// No container artifact configured
    #[error("No container artifact configured")]
    NoContainer,

    /// Container artifact missing on disk
    #[error("Container not found: {}", path.display())]
    MissingContainer { path: PathBuf },

    /// A file lies outside the directory mounted for it
    #[error("{} is outside {}", path.display(), dir.display())]
    PathOutsideMount { path: PathBuf, dir: PathBuf },

    /// Launch tooling unavailable
    #[error("Launcher unavailable: {reason}")]
    Unavailable { reason: String },

    /// Filesystem error
    #[error("I/O error at {}: {reason}", path.display())]
    Io { path: PathBuf, reason: String },
}

impl LaunchError {
    fn io(path: &Path, err: &std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            reason: err.to_string(),
        }
    }
}

/// A backend that turns a step into an executable wrapper
#[async_trait]
pub trait ContainerExecutor: Send + Sync {
    /// Backend name for logs
    fn name(&self) -> &'static str;

    /// Check launch tooling; the result is cached per instance
    ///
    /// # Errors
    ///
    /// Returns `Unavailable` when the tooling is missing
    async fn probe(&self) -> Result<(), LaunchError>;

    /// Write the wrapper and return its path
    ///
    /// # Errors
    ///
    /// Returns error if the spec cannot be launched by this backend
    fn build_launch(&self, spec: &LaunchSpec) -> Result<PathBuf, LaunchError>;
}

/// Runs the driver directly on the host
#[derive(Debug, Default)]
pub struct NativeLauncher {
    probed: OnceCell<Result<(), LaunchError>>,
}

impl NativeLauncher {
    /// Create a native launcher
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ContainerExecutor for NativeLauncher {
    fn name(&self) -> &'static str {
        "native"
    }

    async fn probe(&self) -> Result<(), LaunchError> {
        self.probed
            .get_or_init(|| async { tool_version(Path::new("bash")).await.map(|_| ()) })
            .await
            .clone()
    }

    fn build_launch(&self, spec: &LaunchSpec) -> Result<PathBuf, LaunchError> {
        let driver = spec
            .driver
            .as_deref()
            .ok_or(LaunchError::MissingDriver { backend: "native" })?;
        let mut words = vec![shell_quote(&spec.step_dir.join(driver).display().to_string())];
        words.extend(spec.host_args()?.iter().map(|a| shell_quote(a)));
        write_wrapper(&spec.wrapper_path(), &spec.step_dir, &words.join(" "))
    }
}

/// Isolated launcher configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IsolatedConfig {
    /// `singularity` executable
    pub singularity: PathBuf,
    /// Container used when a method names none
    pub default_container: Option<PathBuf>,
}

impl IsolatedConfig {
    /// Create a config using `singularity` from `PATH`
    #[must_use]
    pub fn new() -> Self {
        Self {
            singularity: PathBuf::from("singularity"),
            default_container: None,
        }
    }

    /// Set the singularity path
    #[must_use]
    pub fn with_singularity(mut self, path: impl Into<PathBuf>) -> Self {
        self.singularity = path.into();
        self
    }

    /// Set the fallback container
    #[must_use]
    pub fn with_default_container(mut self, path: impl Into<PathBuf>) -> Self {
        self.default_container = Some(path.into());
        self
    }
}

impl Default for IsolatedConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Runs the driver inside a singularity container with bind mounts
#[derive(Debug)]
pub struct IsolatedLauncher {
    config: IsolatedConfig,
    probed: OnceCell<Result<(), LaunchError>>,
}

impl IsolatedLauncher {
    /// Create an isolated launcher
    #[must_use]
    pub fn new(config: IsolatedConfig) -> Self {
        Self {
            config,
            probed: OnceCell::new(),
        }
    }

    /// The `singularity` invocation, without the wrapper around it
    ///
    /// # Errors
    ///
    /// Returns error if no container exists or a path is outside its mount
    pub fn launch_command(&self, spec: &LaunchSpec) -> Result<Vec<String>, LaunchError> {
        let container = spec
            .container
            .as_ref()
            .or(self.config.default_container.as_ref())
            .ok_or(LaunchError::NoContainer)?;
        if !container.is_file() {
            return Err(LaunchError::MissingContainer {
                path: container.clone(),
            });
        }
        let binds = format!(
            "{}:{MOUNT_INPUT}:rw,{}:{MOUNT_OUTPUT}:rw,{}:{MOUNT_BIN}:rw",
            spec.input_dir().display(),
            spec.output_dir().display(),
            spec.step_dir.display(),
        );
        let mut cmd = vec![
            self.config.singularity.display().to_string(),
            if spec.driver.is_some() { "exec" } else { "run" }.to_string(),
            "--contain".to_string(),
            "-B".to_string(),
            binds,
            "--pwd".to_string(),
            MOUNT_BIN.to_string(),
            container.display().to_string(),
        ];
        if let Some(driver) = &spec.driver {
            cmd.push(format!("./{driver}"));
        }
        cmd.extend(spec.mapped_args()?);
        Ok(cmd)
    }
}

impl Default for IsolatedLauncher {
    fn default() -> Self {
        Self::new(IsolatedConfig::default())
    }
}

#[async_trait]
impl ContainerExecutor for IsolatedLauncher {
    fn name(&self) -> &'static str {
        "isolated"
    }

    async fn probe(&self) -> Result<(), LaunchError> {
        self.probed
            .get_or_init(|| async {
                let version = tool_version(&self.config.singularity).await?;
                info!(version = %version.trim(), "Singularity is available");
                Ok(())
            })
            .await
            .clone()
    }

    fn build_launch(&self, spec: &LaunchSpec) -> Result<PathBuf, LaunchError> {
        let words: Vec<String> = self
            .launch_command(spec)?
            .iter()
            .map(|w| shell_quote(w))
            .collect();
        write_wrapper(&spec.wrapper_path(), &spec.step_dir, &words.join(" "))
    }
}

async fn tool_version(tool: &Path) -> Result<String, LaunchError> {
    let out = Command::new(tool)
        .arg("--version")
        .output()
        .await
        .map_err(|e| LaunchError::Unavailable {
            reason: format!("{}: {e}", tool.display()),
        })?;
    if !out.status.success() {
        return Err(LaunchError::Unavailable {
            reason: format!("{} --version exited with {}", tool.display(), out.status),
        });
    }
    Ok(String::from_utf8_lossy(&out.stdout).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(dir: &Path) -> LaunchSpec {
        LaunchSpec::new(dir)
            .with_driver("prog.sh")
            .with_input(dir.join("input_data/step1_a.csv"))
            .with_output(dir.join("output_data/step1_b.csv"))
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("plain/path.csv"), "plain/path.csv");
        assert_eq!(shell_quote("has space"), "'has space'");
        assert_eq!(shell_quote("it's"), r#"'it'"'"'s'"#);
        assert_eq!(shell_quote(""), "''");
    }

    #[test]
    fn test_native_wrapper() {
        let tmp = tempfile::tempdir().unwrap();
        let launcher = NativeLauncher::new();
        let wrapper = launcher.build_launch(&spec(tmp.path())).unwrap();
        let text = std::fs::read_to_string(&wrapper).unwrap();

        assert!(text.starts_with("#!/usr/bin/env bash\n"));
        let last = text.lines().last().unwrap();
        let words: Vec<&str> = last.split(' ').collect();
        assert!(words[0].ends_with("prog.sh"));
        assert!(words[1].ends_with("input_data/step1_a.csv"));
        assert!(words[2].ends_with("output_data/step1_b.csv"));

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&wrapper).unwrap().permissions().mode();
            assert_eq!(mode & 0o111, 0o111);
        }
    }

    #[test]
    fn test_native_requires_driver() {
        let tmp = tempfile::tempdir().unwrap();
        let err = NativeLauncher::new()
            .build_launch(&LaunchSpec::new(tmp.path()))
            .unwrap_err();
        assert_eq!(err, LaunchError::MissingDriver { backend: "native" });
    }

    #[test]
    fn test_rejects_paths_outside_mounts() {
        let tmp = tempfile::tempdir().unwrap();
        let bad = LaunchSpec::new(tmp.path())
            .with_driver("prog.sh")
            .with_input("/etc/passwd");
        let err = NativeLauncher::new().build_launch(&bad).unwrap_err();
        assert!(matches!(err, LaunchError::PathOutsideMount { .. }));
    }

    #[test]
    fn test_isolated_exec_command() {
        let tmp = tempfile::tempdir().unwrap();
        let image = tmp.path().join("image.simg");
        std::fs::write(&image, b"img").unwrap();
        let launcher = IsolatedLauncher::new(IsolatedConfig::new());
        let cmd = launcher
            .launch_command(&spec(tmp.path()).with_container(&image))
            .unwrap();

        assert_eq!(cmd[1], "exec");
        assert_eq!(cmd[2], "--contain");
        assert!(cmd[4].contains(":/mnt/input:rw,"));
        assert!(cmd[4].ends_with(":/mnt/bin:rw"));
        assert_eq!(cmd[5], "--pwd");
        assert_eq!(cmd[6], "/mnt/bin");
        assert_eq!(cmd[8], "./prog.sh");
        assert_eq!(cmd[9], "/mnt/input/step1_a.csv");
        assert_eq!(cmd[10], "/mnt/output/step1_b.csv");

        let wrapper = launcher
            .build_launch(&spec(tmp.path()).with_container(&image))
            .unwrap();
        assert!(wrapper.ends_with("prog.sh_wrapper.sh"));
    }

    #[test]
    fn test_isolated_run_without_driver() {
        let tmp = tempfile::tempdir().unwrap();
        let image = tmp.path().join("image.simg");
        std::fs::write(&image, b"img").unwrap();
        let launcher =
            IsolatedLauncher::new(IsolatedConfig::new().with_default_container(&image));
        let cmd = launcher
            .launch_command(&LaunchSpec::new(tmp.path()).with_input(tmp.path().join("input_data/x.raw")))
            .unwrap();
        assert_eq!(cmd[1], "run");
        assert_eq!(cmd.last().unwrap(), "/mnt/input/x.raw");
    }

    #[test]
    fn test_isolated_requires_container() {
        let tmp = tempfile::tempdir().unwrap();
        let launcher = IsolatedLauncher::default();
        assert_eq!(
            launcher.launch_command(&spec(tmp.path())).unwrap_err(),
            LaunchError::NoContainer
        );
        let missing = tmp.path().join("nope.simg");
        assert!(matches!(
            launcher.launch_command(&spec(tmp.path()).with_container(&missing)),
            Err(LaunchError::MissingContainer { .. })
        ));
    }

    #[tokio::test]
    async fn test_probe_is_cached() {
        let launcher = IsolatedLauncher::new(
            IsolatedConfig::new().with_singularity("/nonexistent/singularity"),
        );
        let first = launcher.probe().await;
        assert!(matches!(first, Err(LaunchError::Unavailable { .. })));
        assert_eq!(launcher.probe().await, first);
    }
}
