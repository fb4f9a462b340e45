//! Launch descriptors: immutable instructions for starting a child process.
//!
//! A [`LaunchDescriptor`] is validated once at construction and never mutated
//! afterwards. A supervisor relaunches from the same descriptor every time, so
//! a changed descriptor means a new supervisor.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Where the child process runs relative to the IDE's own sandbox.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionTarget {
    /// Run alongside the IDE, inside whatever sandbox it lives in.
    #[default]
    Sandboxed,
    /// Run on the host system, escaping the IDE sandbox if there is one.
    Host,
}

impl ExecutionTarget {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Sandboxed => "sandboxed",
            Self::Host => "host",
        }
    }
}

impl fmt::Display for ExecutionTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What happens to the child's standard error stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StderrPolicy {
    /// Discard everything the child writes to stderr.
    #[default]
    Silence,
    /// Share the parent's stderr.
    Inherit,
    /// Pipe stderr so the caller can read it from the process handle.
    Capture,
}

/// How to locate the executable.
///
/// Resolution order: the environment variable named by `override_env`, then
/// `override_path`, then each directory in `search_path`, then `PATH`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgramSpec {
    name: String,
    override_env: Option<String>,
    override_path: Option<PathBuf>,
    search_path: Vec<PathBuf>,
}

impl ProgramSpec {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            override_env: None,
            override_path: None,
            search_path: Vec::new(),
        }
    }

    /// Environment variable whose value, when set and non-empty, names the executable.
    #[must_use]
    pub fn with_override_env(mut self, var: impl Into<String>) -> Self {
        self.override_env = Some(var.into());
        self
    }

    /// Explicit executable path from configuration.
    #[must_use]
    pub fn with_override_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.override_path = Some(path.into());
        self
    }

    /// Well-known install directory to check before falling back to `PATH`.
    #[must_use]
    pub fn with_search_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.search_path.push(dir.into());
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn override_env(&self) -> Option<&str> {
        self.override_env.as_deref()
    }

    #[must_use]
    pub fn override_path(&self) -> Option<&Path> {
        self.override_path.as_deref()
    }

    #[must_use]
    pub fn search_path(&self) -> &[PathBuf] {
        &self.search_path
    }
}

impl From<&str> for ProgramSpec {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for ProgramSpec {
    fn from(name: String) -> Self {
        Self::new(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DescriptorError {
    #[error("program name must not be empty")]
    EmptyProgram,
    #[error("program name contains a NUL byte")]
    NulInProgram,
    #[error("argument {index} contains a NUL byte")]
    NulInArgument { index: usize },
    #[error("working directory must be absolute: {}", path.display())]
    RelativeWorkingDir { path: PathBuf },
    #[error("invalid environment variable name: {key:?}")]
    InvalidEnvKey { key: String },
    #[error("environment variable {key} has a value containing a NUL byte")]
    NulInEnvValue { key: String },
}

/// Immutable instructions for starting one child process.
///
/// Environment semantics are "inherit, then override": the child sees the
/// current process environment with [`env`](Self::env) applied on top.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchDescriptor {
    program: ProgramSpec,
    args: Vec<String>,
    working_dir: PathBuf,
    env: BTreeMap<String, String>,
    stderr: StderrPolicy,
    target: ExecutionTarget,
}

impl LaunchDescriptor {
    /// Start building a descriptor. `working_dir` is normally the project root.
    pub fn builder(
        program: impl Into<ProgramSpec>,
        working_dir: impl Into<PathBuf>,
    ) -> LaunchDescriptorBuilder {
        LaunchDescriptorBuilder {
            program: program.into(),
            args: Vec::new(),
            working_dir: working_dir.into(),
            env: BTreeMap::new(),
            stderr: StderrPolicy::default(),
            target: ExecutionTarget::default(),
        }
    }

    #[must_use]
    pub fn program(&self) -> &ProgramSpec {
        &self.program
    }

    #[must_use]
    pub fn args(&self) -> &[String] {
        &self.args
    }

    #[must_use]
    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    /// Overrides applied on top of the inherited environment.
    #[must_use]
    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    #[must_use]
    pub fn stderr(&self) -> StderrPolicy {
        self.stderr
    }

    #[must_use]
    pub fn target(&self) -> ExecutionTarget {
        self.target
    }

    /// `program arg1 arg2` for log lines.
    #[must_use]
    pub fn display_command(&self) -> String {
        let mut out = self.program.name.clone();
        for arg in &self.args {
            out.push(' ');
            out.push_str(arg);
        }
        out
    }
}

/// Builder for [`LaunchDescriptor`]; validation happens in [`build`](Self::build).
#[derive(Debug, Clone)]
pub struct LaunchDescriptorBuilder {
    program: ProgramSpec,
    args: Vec<String>,
    working_dir: PathBuf,
    env: BTreeMap<String, String>,
    stderr: StderrPolicy,
    target: ExecutionTarget,
}

impl LaunchDescriptorBuilder {
    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn stderr(mut self, policy: StderrPolicy) -> Self {
        self.stderr = policy;
        self
    }

    #[must_use]
    pub fn target(mut self, target: ExecutionTarget) -> Self {
        self.target = target;
        self
    }

    pub fn build(self) -> Result<LaunchDescriptor, DescriptorError> {
        let name = self.program.name();
        if name.trim().is_empty() {
            return Err(DescriptorError::EmptyProgram);
        }
        if name.contains('\0') {
            return Err(DescriptorError::NulInProgram);
        }
        if let Some(index) = self.args.iter().position(|a| a.contains('\0')) {
            return Err(DescriptorError::NulInArgument { index });
        }
        if !self.working_dir.is_absolute() {
            return Err(DescriptorError::RelativeWorkingDir {
                path: self.working_dir,
            });
        }
        for (key, value) in &self.env {
            if key.is_empty() || key.contains('=') || key.contains('\0') {
                return Err(DescriptorError::InvalidEnvKey { key: key.clone() });
            }
            if value.contains('\0') {
                return Err(DescriptorError::NulInEnvValue { key: key.clone() });
            }
        }

        Ok(LaunchDescriptor {
            program: self.program,
            args: self.args,
            working_dir: self.working_dir,
            env: self.env,
            stderr: self.stderr,
            target: self.target,
        })
    }
}
