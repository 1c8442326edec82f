//! Methods (the code a step runs) and computation identities.

use crate::cable::CableSignature;
use serde::{Deserialize, Serialize};
use sluice_core::Md5Digest;
use std::path::PathBuf;

/// A file the driver needs next to it at run time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencySpec {
    /// Host path of the file
    pub source: PathBuf,
    /// Path relative to the step directory
    pub dest: String,
    /// Recorded MD5 of the file, checked before launch
    #[serde(default)]
    pub md5: Option<Md5Digest>,
}

/// A versioned piece of code a step runs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodSpec {
    /// Method family name
    pub name: String,
    /// Revision within the family
    #[serde(default)]
    pub revision: u32,
    /// Driver file name inside the step directory; `None` runs the image entry point
    #[serde(default)]
    pub driver: Option<String>,
    /// Host path the driver is copied from
    #[serde(default)]
    pub driver_source: Option<PathBuf>,
    /// Recorded MD5 of the driver
    #[serde(default)]
    pub driver_md5: Option<Md5Digest>,
    /// Extra files copied next to the driver
    #[serde(default)]
    pub dependencies: Vec<DependencySpec>,
    /// Container image name, informational
    #[serde(default)]
    pub image_id: Option<String>,
    /// Container artifact; `None` runs natively
    #[serde(default)]
    pub container: Option<PathBuf>,
    /// CPUs requested
    #[serde(default = "default_threads")]
    pub threads: u32,
    /// Memory requested in MiB (0 = scheduler default)
    #[serde(default)]
    pub memory_mb: u64,
    /// Whether identical inputs always produce identical outputs
    #[serde(default = "default_deterministic")]
    pub deterministic: bool,
}

fn default_threads() -> u32 {
    1
}

fn default_deterministic() -> bool {
    true
}

impl MethodSpec {
    /// Create a method run by a native driver
    #[must_use]
    pub fn new(name: impl Into<String>, driver: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            revision: 1,
            driver: Some(driver.into()),
            driver_source: None,
            driver_md5: None,
            dependencies: Vec::new(),
            image_id: None,
            container: None,
            threads: default_threads(),
            memory_mb: 0,
            deterministic: true,
        }
    }

    /// Set the revision
    #[must_use]
    pub fn with_revision(mut self, revision: u32) -> Self {
        self.revision = revision;
        self
    }

    /// Set where the driver is copied from
    #[must_use]
    pub fn with_driver_source(mut self, source: impl Into<PathBuf>) -> Self {
        self.driver_source = Some(source.into());
        self
    }

    /// Record the expected driver MD5
    #[must_use]
    pub fn with_driver_md5(mut self, md5: Md5Digest) -> Self {
        self.driver_md5 = Some(md5);
        self
    }

    /// Add a dependency file
    #[must_use]
    pub fn with_dependency(mut self, dep: DependencySpec) -> Self {
        self.dependencies.push(dep);
        self
    }

    /// Run inside a container artifact
    #[must_use]
    pub fn with_container(mut self, container: impl Into<PathBuf>) -> Self {
        self.container = Some(container.into());
        self
    }

    /// Set requested CPUs
    #[must_use]
    pub fn with_threads(mut self, threads: u32) -> Self {
        self.threads = threads;
        self
    }

    /// Mark as non-deterministic
    #[must_use]
    pub fn nondeterministic(mut self) -> Self {
        self.deterministic = false;
        self
    }

    /// Computation identity used as the ExecRecord key
    #[must_use]
    pub fn computation(&self) -> Computation {
        Computation::Method {
            name: self.name.clone(),
            revision: self.revision,
        }
    }
}

/// What an ExecRecord memoizes
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Computation {
    /// A method revision; matched exactly
    Method {
        /// Method name
        name: String,
        /// Revision
        revision: u32,
    },
    /// A cable; matched by compatibility
    Cable(CableSignature),
}

impl Computation {
    /// Whether this is a cable computation
    #[must_use]
    pub const fn is_cable(&self) -> bool {
        matches!(self, Self::Cable(_))
    }
}

impl std::fmt::Display for Computation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Method { name, revision } => write!(f, "method:{}@{}", name, revision),
            Self::Cable(sig) if sig.is_trivial() => write!(f, "cable:trivial"),
            Self::Cable(sig) => write!(f, "cable:{}-wire", sig.wires.len()),
        }
    }
}
