//! Turning a [`LaunchDescriptor`] into a running process.
//!
//! [`Launch`] is the seam the supervisor spawns through. [`OsLauncher`] is the
//! real implementation; tests substitute their own.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::process::Stdio;

use tether_types::{ExecutionTarget, LaunchDescriptor, ProgramSpec, StderrPolicy};
use tokio::process::Command;

use crate::error::SpawnError;
use crate::process::ProcessHandle;

/// Variables forwarded to host processes when escaping a sandbox, unless the
/// descriptor overrides them.
const HOST_FORWARDED_ENV: &[&str] = &["PATH", "HOME", "USER", "LANG"];

/// Marker file present inside every Flatpak sandbox.
const FLATPAK_INFO: &str = "/.flatpak-info";

pub type SpawnFut<'a> = Pin<Box<dyn Future<Output = Result<ProcessHandle, SpawnError>> + Send + 'a>>;

/// Spawns processes from descriptors.
pub trait Launch: Send + Sync + 'static {
    fn spawn<'a>(&'a self, descriptor: &'a LaunchDescriptor) -> SpawnFut<'a>;
}

/// The sandbox the current process runs in, if any.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Sandbox {
    #[default]
    None,
    Flatpak,
}

impl Sandbox {
    #[must_use]
    pub fn detect() -> Self {
        if Path::new(FLATPAK_INFO).exists() {
            Self::Flatpak
        } else {
            Self::None
        }
    }
}

/// Spawns real OS processes with piped stdin/stdout.
#[derive(Debug, Clone, Copy, Default)]
pub struct OsLauncher {
    sandbox: Sandbox,
}

impl OsLauncher {
    /// Launcher for the sandbox this process is running in.
    #[must_use]
    pub fn new() -> Self {
        Self::with_sandbox(Sandbox::detect())
    }

    #[must_use]
    pub fn with_sandbox(sandbox: Sandbox) -> Self {
        Self { sandbox }
    }

    #[must_use]
    pub fn sandbox(&self) -> Sandbox {
        self.sandbox
    }

    fn escapes_to_host(&self, descriptor: &LaunchDescriptor) -> bool {
        descriptor.target() == ExecutionTarget::Host && self.sandbox == Sandbox::Flatpak
    }

    /// Build the command for `descriptor` without spawning it.
    pub fn command(&self, descriptor: &LaunchDescriptor) -> Result<Command, SpawnError> {
        let working_dir = descriptor.working_dir();
        if !working_dir.is_dir() {
            return Err(SpawnError::WorkingDirMissing {
                path: working_dir.to_path_buf(),
            });
        }

        let mut cmd = if self.escapes_to_host(descriptor) {
            // PATH lookup happens on the host; only explicit overrides apply here.
            let program = explicit_override(descriptor.program(), env_var)
                .unwrap_or_else(|| PathBuf::from(descriptor.program().name()));
            host_command(descriptor, &program, env_var)
        } else {
            let program = resolve_program(descriptor.program(), env_var)?;
            let mut cmd = Command::new(program);
            cmd.args(descriptor.args())
                .current_dir(working_dir)
                .envs(descriptor.env());
            cmd
        };

        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(match descriptor.stderr() {
                StderrPolicy::Silence => Stdio::null(),
                StderrPolicy::Inherit => Stdio::inherit(),
                StderrPolicy::Capture => Stdio::piped(),
            })
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        Ok(cmd)
    }

    fn spawn_now(&self, descriptor: &LaunchDescriptor) -> Result<ProcessHandle, SpawnError> {
        let name = descriptor.program().name();
        let mut cmd = self.command(descriptor)?;
        let child = cmd.spawn().map_err(|e| SpawnError::from_io(name, e))?;
        let handle = ProcessHandle::from_child(child, name)?;
        tracing::debug!(
            pid = %handle.pid(),
            target = %descriptor.target(),
            "launched {}",
            descriptor.display_command()
        );
        Ok(handle)
    }
}

impl Launch for OsLauncher {
    fn spawn<'a>(&'a self, descriptor: &'a LaunchDescriptor) -> SpawnFut<'a> {
        Box::pin(async move { self.spawn_now(descriptor) })
    }
}

fn env_var(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

/// Locate the executable for `spec`.
///
/// An absolute program name is used as-is. Otherwise the override
/// environment variable, the override path, each search directory, and
/// finally `PATH` (via `lookup("PATH")`) are tried in order. Overrides that
/// point at nothing are skipped with a warning.
pub fn resolve_program<F>(spec: &ProgramSpec, lookup: F) -> Result<PathBuf, SpawnError>
where
    F: Fn(&str) -> Option<String>,
{
    let name = spec.name();
    if Path::new(name).is_absolute() {
        return Ok(PathBuf::from(name));
    }

    if let Some(path) = explicit_override(spec, &lookup) {
        if is_executable(&path) {
            return Ok(path);
        }
        tracing::warn!(
            program = name,
            "configured override {} is not an executable file, searching instead",
            path.display()
        );
    }

    for dir in spec.search_path() {
        let candidate = dir.join(name);
        if is_executable(&candidate) {
            return Ok(candidate);
        }
    }

    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/"));
    which::which_in(name, lookup("PATH"), cwd).map_err(|_| SpawnError::NotFound {
        program: name.to_string(),
    })
}

/// The first configured override: environment variable, then explicit path.
fn explicit_override<F>(spec: &ProgramSpec, lookup: F) -> Option<PathBuf>
where
    F: Fn(&str) -> Option<String>,
{
    spec.override_env()
        .and_then(|var| lookup(var))
        .filter(|value| !value.is_empty())
        .map(PathBuf::from)
        .or_else(|| spec.override_path().map(Path::to_path_buf))
}

fn host_command<F>(descriptor: &LaunchDescriptor, program: &Path, lookup: F) -> Command
where
    F: Fn(&str) -> Option<String>,
{
    let mut cmd = Command::new("flatpak-spawn");
    cmd.arg("--host")
        .arg("--watch-bus")
        .arg(format!(
            "--directory={}",
            descriptor.working_dir().display()
        ));

    for &key in HOST_FORWARDED_ENV {
        if descriptor.env().contains_key(key) {
            continue;
        }
        if let Some(value) = lookup(key) {
            cmd.arg(format!("--env={key}={value}"));
        }
    }
    for (key, value) in descriptor.env() {
        cmd.arg(format!("--env={key}={value}"));
    }

    cmd.arg(program).args(descriptor.args());
    cmd
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;

    path.metadata()
        .is_ok_and(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}
