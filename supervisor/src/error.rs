//! Error taxonomy of the supervision core.
//!
//! Spawn failures and exits are resolved inside the supervisor (restart or
//! stop). Only [`ChannelError`] and [`Unavailable`] reach feature providers,
//! and both keep their cases distinguishable so callers can decide whether
//! to retry.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use tether_types::ChannelId;
use thiserror::Error;

/// Why a launch attempt produced no process.
#[derive(Debug, Clone, Error)]
pub enum SpawnError {
    #[error("program not found: {program}")]
    NotFound { program: String },

    #[error("permission denied executing {program}")]
    PermissionDenied {
        program: String,
        #[source]
        source: Arc<io::Error>,
    },

    #[error("working directory does not exist: {}", path.display())]
    WorkingDirMissing { path: PathBuf },

    #[error("failed to spawn {program}: {source}")]
    Io {
        program: String,
        #[source]
        source: Arc<io::Error>,
    },

    #[error("spawned process has no {stream} pipe")]
    MissingPipe { stream: &'static str },
}

impl SpawnError {
    /// Whether trying again without operator intervention can succeed.
    ///
    /// A missing binary, a permission problem, or a missing working directory
    /// will fail identically on every attempt.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Io { .. } | Self::MissingPipe { .. })
    }

    pub(crate) fn from_io(program: &str, source: io::Error) -> Self {
        match source.kind() {
            io::ErrorKind::NotFound => Self::NotFound {
                program: program.to_string(),
            },
            io::ErrorKind::PermissionDenied => Self::PermissionDenied {
                program: program.to_string(),
                source: Arc::new(source),
            },
            _ => Self::Io {
                program: program.to_string(),
                source: Arc::new(source),
            },
        }
    }
}

/// Failure of a send or request on a channel.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    /// The channel was superseded or torn down. Retry against the current one.
    #[error("channel {0} has been invalidated")]
    Invalidated(ChannelId),

    /// The message cannot be represented on this channel.
    #[error("message rejected by channel: {reason}")]
    InvalidMessage { reason: &'static str },
}

impl ChannelError {
    #[must_use]
    pub fn is_invalidated(&self) -> bool {
        matches!(self, Self::Invalidated(_))
    }
}

/// Why no channel can be handed out right now.
#[derive(Debug, Clone, Error)]
pub enum Unavailable {
    /// Nothing has asked the service to start yet.
    #[error("service has not been started")]
    NotStarted,

    /// A launch is pending or in flight; a channel may appear soon.
    #[error("service is starting")]
    Starting,

    /// The program could not be launched and retrying will not help.
    #[error("service failed to launch: {0}")]
    SpawnFailed(SpawnError),

    /// The process kept dying and the restart budget is spent.
    #[error("service gave up after {attempts} failed launches")]
    RestartsExhausted { attempts: u32 },

    /// The service was stopped on request.
    #[error("service was stopped")]
    Stopped,
}

impl Unavailable {
    /// Whether waiting (without operator action) could make a channel appear.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Starting)
    }
}
