//! Handle to one live child process and its pipes.

use std::io;
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;

use tether_types::{ProcessExit, ProcessId};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout};

use crate::error::SpawnError;

/// The standard streams of a spawned process, taken once by the channel factory.
#[derive(Debug)]
pub struct ProcessStdio {
    pub stdin: ChildStdin,
    pub stdout: ChildStdout,
    /// Present only under [`StderrPolicy::Capture`](tether_types::StderrPolicy::Capture).
    pub stderr: Option<ChildStderr>,
}

/// A live OS process.
///
/// The child is spawned with `kill_on_drop(true)` in its own process group;
/// dropping the handle without [`terminate`](Self::terminate) kills the group.
#[derive(Debug)]
pub struct ProcessHandle {
    pid: ProcessId,
    program: String,
    child: Child,
    stdio: Option<ProcessStdio>,
}

impl ProcessHandle {
    /// Wrap a freshly spawned child, taking ownership of its pipes.
    pub(crate) fn from_child(mut child: Child, program: &str) -> Result<Self, SpawnError> {
        let pid = child.id().map(ProcessId::new).ok_or_else(|| SpawnError::Io {
            program: program.to_string(),
            source: Arc::new(io::Error::other("process exited before its pid was read")),
        })?;
        let stdin = child
            .stdin
            .take()
            .ok_or(SpawnError::MissingPipe { stream: "stdin" })?;
        let stdout = child
            .stdout
            .take()
            .ok_or(SpawnError::MissingPipe { stream: "stdout" })?;
        let stderr = child.stderr.take();

        Ok(Self {
            pid,
            program: program.to_string(),
            child,
            stdio: Some(ProcessStdio {
                stdin,
                stdout,
                stderr,
            }),
        })
    }

    #[must_use]
    pub fn pid(&self) -> ProcessId {
        self.pid
    }

    #[must_use]
    pub fn program(&self) -> &str {
        &self.program
    }

    /// Take the process's pipes. Returns `None` on every call after the first.
    pub fn take_stdio(&mut self) -> Option<ProcessStdio> {
        self.stdio.take()
    }

    /// Wait for the process to exit. Cancel-safe.
    pub async fn wait(&mut self) -> ProcessExit {
        match self.child.wait().await {
            Ok(status) => exit_from_status(status),
            Err(e) => {
                tracing::warn!(pid = %self.pid, program = %self.program, "wait failed: {e}");
                ProcessExit::unknown()
            }
        }
    }

    /// Exit status if the process has already exited.
    pub fn try_exit(&mut self) -> Option<ProcessExit> {
        match self.child.try_wait() {
            Ok(status) => status.map(exit_from_status),
            Err(_) => None,
        }
    }

    /// Terminate the process: SIGTERM to its group, then SIGKILL after `grace`.
    ///
    /// Consumes the handle; all resources are released when this returns.
    pub async fn terminate(mut self, grace: Duration) -> ProcessExit {
        if let Some(exit) = self.try_exit() {
            return exit;
        }

        self.signal_group(Signal::Terminate);

        if let Ok(Ok(status)) = tokio::time::timeout(grace, self.child.wait()).await {
            let exit = exit_from_status(status);
            tracing::debug!(pid = %self.pid, program = %self.program, %exit, "process terminated");
            return exit;
        }

        tracing::debug!(
            pid = %self.pid,
            program = %self.program,
            "process didn't exit within {}ms, killing",
            grace.as_millis()
        );
        self.signal_group(Signal::Kill);
        let _ = self.child.start_kill();
        self.wait().await
    }

    /// SIGKILL anything left in the process group once the leader has exited.
    ///
    /// Unlike [`terminate`](Self::terminate) this never signals the leader's
    /// pid directly, which may already belong to someone else.
    #[cfg(unix)]
    pub fn kill_group(&mut self) {
        let pgid = self.pid.value() as libc::pid_t;
        // ESRCH means the group is already empty.
        unsafe {
            libc::killpg(pgid, libc::SIGKILL);
        }
    }

    #[cfg(not(unix))]
    pub fn kill_group(&mut self) {}

    #[cfg(unix)]
    fn signal_group(&self, signal: Signal) {
        let signo = match signal {
            Signal::Terminate => libc::SIGTERM,
            Signal::Kill => libc::SIGKILL,
        };
        // Spawned with process_group(0), so pgid == pid.
        let pgid = self.pid.value() as libc::pid_t;
        unsafe {
            if libc::killpg(pgid, signo) == -1 {
                libc::kill(pgid, signo);
            }
        }
    }

    #[cfg(not(unix))]
    fn signal_group(&mut self, _signal: Signal) {
        let _ = self.child.start_kill();
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        if matches!(self.child.try_wait(), Ok(None)) {
            self.signal_group(Signal::Kill);
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Signal {
    Terminate,
    Kill,
}

#[cfg(unix)]
fn exit_from_status(status: ExitStatus) -> ProcessExit {
    use std::os::unix::process::ExitStatusExt;

    match (status.code(), status.signal()) {
        (Some(code), _) => ProcessExit::from_code(code),
        (None, Some(signal)) => ProcessExit::from_signal(signal),
        (None, None) => ProcessExit::unknown(),
    }
}

#[cfg(not(unix))]
fn exit_from_status(status: ExitStatus) -> ProcessExit {
    status
        .code()
        .map_or_else(ProcessExit::unknown, ProcessExit::from_code)
}
